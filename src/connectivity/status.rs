//! Connectivity state machine types (spec §4.6–§4.8).

use crate::endpoint::Endpoint;
use std::net::Ipv4Addr;

/// Internet reachability as classified by the probe (spec §4.6 step 1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternetConnectivityStatus {
    Unknown,
    NoInternetConnection,
    DirectInternetConnection,
    /// Reserved, never produced by this implementation (spec §9 open question).
    HttpProxyInternetConnection,
    /// Reserved, never produced by this implementation (spec §9 open question).
    Socks5ProxyInternetConnection,
    NatInternetConnectionViaUPnPRouter,
    NatInternetConnection,
}

/// UPnP IGD gateway/port-mapping state (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UPnPDeviceStatus {
    Unknown,
    DeviceNotFound,
    /// The gateway's external IP is itself a private address; port forwarding would be useless.
    ExternalIpPrivate,
    PortForwarded,
    PortForwardingFailed,
    /// A port mapping exists but the echo-check could not confirm it's reachable.
    PortForwardedNotAccessible,
}

impl UPnPDeviceStatus {
    /// Cadence-shortening error states (spec §4.6 "shortened to 10s when UPnP is in an error
    /// state").
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            UPnPDeviceStatus::DeviceNotFound | UPnPDeviceStatus::PortForwardingFailed
        )
    }
}

/// Aggregate connectivity snapshot published by the probe task (spec §3 `ConnectivityState`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectivityState {
    pub internet_status: InternetConnectivityStatus,
    pub upnp_status: UPnPDeviceStatus,
    pub local_live_ip: Option<Ipv4Addr>,
    pub upnp_external_ip: Option<Ipv4Addr>,
    pub upnp_external_port: Option<u16>,
    pub web_check_external_endpoint: Option<Endpoint>,
    pub web_check_success: bool,
    pub web_check_error: bool,
    /// Sticky flag: set by the acceptor on any inbound connection from a non-private IPv4 address,
    /// cleared by a failed echo check (spec §4.3, §4.7).
    pub received_live_inbound: bool,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            internet_status: InternetConnectivityStatus::Unknown,
            upnp_status: UPnPDeviceStatus::Unknown,
            local_live_ip: None,
            upnp_external_ip: None,
            upnp_external_port: None,
            web_check_external_endpoint: None,
            web_check_success: false,
            web_check_error: false,
            received_live_inbound: false,
        }
    }
}

impl ConnectivityState {
    /// Probe cadence depends on whether UPnP is in an error state (spec §4.6).
    pub fn is_healthy(&self) -> bool {
        !self.upnp_status.is_error()
    }

    /// `get_external_endpoint()` (spec §4.8): echo-check result first, then a confirmed direct
    /// public IP, then a UPnP mapping that's at least been probed once (a never-tested mapping is
    /// unverified). Port `0` from an unmapped UPnP state is never surfaced (spec §9 "UPnPExternalEP
    /// returns a non-null endpoint with port 0 when unmapped... callers must treat port 0 as not
    /// available").
    pub fn external_endpoint(&self, local_port: u16) -> Option<Endpoint> {
        if self.web_check_success {
            if let Some(ep) = self.web_check_external_endpoint {
                return Some(ep);
            }
        }

        if self.internet_status == InternetConnectivityStatus::DirectInternetConnection {
            if let Some(ip) = self.local_live_ip {
                return Some(Endpoint::new(std::net::SocketAddr::new(ip.into(), local_port)));
            }
        }

        if self.upnp_status == UPnPDeviceStatus::PortForwarded
            && (self.web_check_success || self.web_check_error)
        {
            if let (Some(ip), Some(port)) = (self.upnp_external_ip, self.upnp_external_port) {
                if port != 0 {
                    return Some(Endpoint::new(std::net::SocketAddr::new(ip.into(), port)));
                }
            }
        }

        None
    }

    /// `get_external_port()` (spec §4.8): the external endpoint's port if known, else `local_port`.
    /// Always in `[1, 65535]` as long as `local_port` is (spec §8 property 5).
    pub fn external_port(&self, local_port: u16) -> u16 {
        self.external_endpoint(local_port)
            .map(|ep| ep.port())
            .filter(|&p| p != 0)
            .unwrap_or(local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint::new(s.parse().unwrap())
    }

    #[test]
    fn external_endpoint_prefers_echo_check_result() {
        let mut state = ConnectivityState::default();
        state.web_check_success = true;
        state.web_check_external_endpoint = Some(ep("8.8.8.8:1234"));
        state.internet_status = InternetConnectivityStatus::DirectInternetConnection;
        state.local_live_ip = Some(Ipv4Addr::new(9, 9, 9, 9));
        assert_eq!(state.external_endpoint(1000), Some(ep("8.8.8.8:1234")));
    }

    #[test]
    fn unverified_upnp_mapping_is_not_surfaced() {
        let mut state = ConnectivityState::default();
        state.upnp_status = UPnPDeviceStatus::PortForwarded;
        state.upnp_external_ip = Some(Ipv4Addr::new(1, 2, 3, 4));
        state.upnp_external_port = Some(5000);
        assert_eq!(state.external_endpoint(1000), None);

        state.web_check_error = true;
        assert_eq!(state.external_endpoint(1000), Some(ep("1.2.3.4:5000")));
    }

    #[test]
    fn upnp_port_zero_is_never_surfaced() {
        let mut state = ConnectivityState::default();
        state.upnp_status = UPnPDeviceStatus::PortForwarded;
        state.upnp_external_ip = Some(Ipv4Addr::new(1, 2, 3, 4));
        state.upnp_external_port = Some(0);
        state.web_check_success = true;
        assert_eq!(state.external_endpoint(1000), None);
    }

    #[test]
    fn external_port_falls_back_to_local_port() {
        let state = ConnectivityState::default();
        assert_eq!(state.external_port(4321), 4321);
    }
}
