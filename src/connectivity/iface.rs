//! Default network interface discovery (spec §4.6 step 1).

use crate::endpoint::is_private_ipv4;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use std::net::{IpAddr, Ipv4Addr};

/// Classification of the host's primary IPv4 address.
pub enum LocalInterface {
    /// No usable non-loopback interface found.
    None,
    /// A public (globally routable) IPv4 address.
    Public(Ipv4Addr),
    /// A private/special-use IPv4 address — NAT is in play, UPnP may help.
    Private(Ipv4Addr),
}

/// Picks the first non-loopback IPv4 address across all interfaces and classifies it. Real
/// "default route" interface selection would need platform-specific routing-table access, which
/// is out of scope here (spec §1 treats host network info as an external collaborator); this is
/// the same approximation the UPnP local-address lookup already relied on.
pub fn default_ipv4() -> LocalInterface {
    let Some(ip) = NetworkInterface::show()
        .ok()
        .into_iter()
        .flatten()
        .flat_map(|iface| iface.addr)
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
            _ => None,
        })
    else {
        return LocalInterface::None;
    };

    if is_private_ipv4(ip) {
        LocalInterface::Private(ip)
    } else {
        LocalInterface::Public(ip)
    }
}
