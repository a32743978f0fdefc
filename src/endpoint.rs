use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// IP address family of an [`Endpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// `(IP address, port)` pair. Ordering/equality is by the full tuple (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Returns a copy of this endpoint with a different port, used by the handshake acceptor to
    /// rewrite the ephemeral socket port into the peer's advertised service port (spec §4.2).
    pub fn with_port(&self, port: u16) -> Self {
        Self(SocketAddr::new(self.0.ip(), port))
    }

    pub fn family(&self) -> AddressFamily {
        match self.0 {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.family(), AddressFamily::V4)
    }

    /// True for IPv4 addresses in private/special-use ranges (RFC 1918, loopback, link-local,
    /// CGNAT). IPv6 addresses are never considered private by this classification, matching the
    /// spec's IPv4-centric reachability heuristics (spec §4.1, §4.3).
    pub fn is_private_ipv4(&self) -> bool {
        match self.0.ip() {
            IpAddr::V4(ip) => is_private_ipv4(ip),
            IpAddr::V6(_) => false,
        }
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.ip(), self.0.port()).cmp(&(other.0.ip(), other.0.port()))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared `[family-tag][ip bytes][port]` wire shape used by both the echo-check response (spec
/// §4.7) and the tunnel multiplexer's control messages. `tag`: 1 = IPv4, 2 = IPv6, anything else
/// means "no address".
pub fn encode_tagged(endpoint: Option<Endpoint>, out: &mut Vec<u8>) {
    match endpoint.map(|e| e.socket_addr()) {
        Some(SocketAddr::V4(addr)) => {
            out.push(1);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_le_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            out.push(2);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_le_bytes());
        }
        None => out.push(0),
    }
}

/// Inverse of [`encode_tagged`]. Returns `(endpoint, bytes_consumed)`.
pub fn decode_tagged(buf: &[u8]) -> Option<(Option<Endpoint>, usize)> {
    let tag = *buf.first()?;
    match tag {
        1 => {
            let ip_port = buf.get(1..7)?;
            let ip = Ipv4Addr::new(ip_port[0], ip_port[1], ip_port[2], ip_port[3]);
            let port = u16::from_le_bytes([ip_port[4], ip_port[5]]);
            Some((
                Some(Endpoint::new(SocketAddr::new(IpAddr::V4(ip), port))),
                7,
            ))
        }
        2 => {
            let bytes = buf.get(1..19)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_le_bytes([bytes[16], bytes[17]]);
            Some((
                Some(Endpoint::new(SocketAddr::new(IpAddr::V6(ip), port))),
                19,
            ))
        }
        _ => Some((None, 1)),
    }
}

pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || is_carrier_grade_nat(ip)
}

/// `100.64.0.0/10` — shared address space used for carrier-grade NAT (RFC 6598). Not covered by
/// `Ipv4Addr::is_private`.
fn is_carrier_grade_nat(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000
}

/// Classifies a bare `IpAddr` as public (global) or private/special-use.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => !is_private_ipv4(ip) && !ip.is_unspecified(),
        IpAddr::V6(ip) => !ip.is_loopback() && !ip.is_unspecified() && !ip.is_unique_local(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn classifies_private_ranges() {
        assert!(is_private_ipv4(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(is_private_ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_private_ipv4(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(is_private_ipv4(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(is_private_ipv4(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(!is_private_ipv4(Ipv4Addr::new(100, 128, 0, 1)));
        assert!(!is_private_ipv4(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn endpoint_ordering_is_by_full_tuple() {
        let a = Endpoint::new("10.0.0.1:1000".parse().unwrap());
        let b = Endpoint::new("10.0.0.1:2000".parse().unwrap());
        let c = Endpoint::new("10.0.0.2:1000".parse().unwrap());
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn ipv6_is_never_private_ipv4() {
        let ep = Endpoint::new(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 1234));
        assert!(!ep.is_private_ipv4());
        assert_eq!(ep.family(), AddressFamily::V6);
    }

    #[test]
    fn tagged_endpoint_round_trips_v4_and_v6() {
        for ep in [
            Endpoint::new("1.2.3.4:5678".parse().unwrap()),
            Endpoint::new("[2001:db8::1]:4321".parse().unwrap()),
        ] {
            let mut buf = Vec::new();
            encode_tagged(Some(ep), &mut buf);
            let (decoded, consumed) = decode_tagged(&buf).unwrap();
            assert_eq!(consumed, buf.len());
            assert_eq!(decoded, Some(ep));
        }
    }

    #[test]
    fn tagged_none_round_trips() {
        let mut buf = Vec::new();
        encode_tagged(None, &mut buf);
        let (decoded, consumed) = decode_tagged(&buf).unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(decoded, None);
    }
}
