//! UPnP IGD gateway discovery and port mapping with collision avoidance (spec §4.6 steps 2-5).

use crate::constants::{UPNP_PORT_SEARCH_MAX_ITERATIONS, UPNP_PORT_SEARCH_WRAP_FLOOR};
use crate::endpoint::is_private_ipv4;
use igd_next::aio::tokio::search_gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpnpError {
    #[error("no UPnP-capable gateway found on the network")]
    DeviceNotFound,

    #[error("gateway's external IP is itself a private address")]
    ExternalIpPrivate,

    #[error("gateway refused every port mapping attempt")]
    PortForwardingFailed,
}

/// Result of a successful discovery-and-map cycle.
pub struct MappedPort {
    pub external_ip: Ipv4Addr,
    pub external_port: u16,
}

/// Leases for as long as this process runs; the probe loop re-runs this on every tick, which
/// renews the lease implicitly by re-adding the same mapping.
const LEASE_DURATION_SECS: u32 = 0;

/// Discovers a gateway on `local_ip`'s network and maps `local_port` to some externally reachable
/// port, trying `local_port` first and then walking forward — wrapping from `u16::MAX` back down
/// to [`UPNP_PORT_SEARCH_WRAP_FLOOR`] — until one is accepted or the iteration budget runs out
/// (spec §4.6 step 4 "port collision avoidance").
///
/// This collapses the source protocol's separate "probe `GetSpecificPortMappingEntry`, then
/// `AddPortMapping`" steps into a single `add_port` attempt per candidate port: the `igd-next`
/// async gateway handle doesn't expose a standalone entry-query call, and trying to add is
/// observably equivalent for our purposes (a port already mapped to someone else simply fails).
pub async fn discover_and_map(
    local_ip: Ipv4Addr,
    local_port: u16,
    discover_timeout: Duration,
    mapping_description: &str,
) -> Result<MappedPort, UpnpError> {
    let gateway = tokio::time::timeout(discover_timeout, search_gateway(SearchOptions::default()))
        .await
        .map_err(|_| UpnpError::DeviceNotFound)?
        .map_err(|_| UpnpError::DeviceNotFound)?;

    let external_ip = match gateway
        .get_external_ip()
        .await
        .map_err(|_| UpnpError::PortForwardingFailed)?
    {
        IpAddr::V4(ip) if !is_private_ipv4(ip) => ip,
        _ => return Err(UpnpError::ExternalIpPrivate),
    };

    let mut external_port = local_port;
    for _ in 0..UPNP_PORT_SEARCH_MAX_ITERATIONS {
        let local_addr = SocketAddr::V4(SocketAddrV4::new(local_ip, local_port));
        let mapped = gateway
            .add_port(
                PortMappingProtocol::TCP,
                external_port,
                local_addr,
                LEASE_DURATION_SECS,
                mapping_description,
            )
            .await;

        if mapped.is_ok() {
            return Ok(MappedPort {
                external_ip,
                external_port,
            });
        }

        external_port = next_search_port(external_port);
    }

    Err(UpnpError::PortForwardingFailed)
}

fn next_search_port(port: u16) -> u16 {
    port.checked_add(1).unwrap_or(UPNP_PORT_SEARCH_WRAP_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_search_port_wraps_at_u16_max() {
        assert_eq!(next_search_port(65534), 65535);
        assert_eq!(next_search_port(65535), UPNP_PORT_SEARCH_WRAP_FLOOR);
    }

    #[test]
    fn next_search_port_increments_normally() {
        assert_eq!(next_search_port(5000), 5001);
    }
}
