//! Manager configuration (spec §1 ambient stack). Constructed explicitly and passed in rather
//! than read from an ambient singleton, matching the registry's own encapsulation (spec §9 design
//! note).

use crate::constants::*;
use std::time::Duration;

/// Tunable knobs for a [`crate::manager::ConnectionManager`] instance. `Default` reproduces the
/// literal constants from the spec; callers (tests, or a future CLI/config-file layer) override
/// individual fields as needed.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Local TCP port the acceptor listens on.
    pub listen_port: u16,
    /// Send timeout applied to every transport socket.
    pub socket_send_timeout: Duration,
    /// Receive timeout applied to every transport socket.
    pub socket_recv_timeout: Duration,
    /// Grace period before re-querying the registry after a handshake rejection race.
    pub rejection_race_grace: Duration,
    /// Overall timeout for the virtual-connect coordinator.
    pub virtual_connect_timeout: Duration,
    /// Delay before the first connectivity probe tick.
    pub probe_initial_delay: Duration,
    /// Connectivity probe cadence while everything is healthy.
    pub probe_normal_interval: Duration,
    /// Connectivity probe cadence while UPnP/internet checks are failing.
    pub probe_error_interval: Duration,
    /// Timeout for UPnP gateway discovery.
    pub upnp_discover_timeout: Duration,
    /// Description stamped on UPnP port mappings this process creates.
    pub upnp_mapping_description: String,
    /// HTTP endpoint used to validate external reachability.
    pub echo_service_url: String,
    /// Timeout for the echo-check HTTP request.
    pub echo_check_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            socket_send_timeout: SOCKET_SEND_TIMEOUT,
            socket_recv_timeout: SOCKET_RECV_TIMEOUT,
            rejection_race_grace: REJECTION_RACE_GRACE,
            virtual_connect_timeout: VIRTUAL_CONNECT_TIMEOUT,
            probe_initial_delay: PROBE_INITIAL_DELAY,
            probe_normal_interval: PROBE_NORMAL_INTERVAL,
            probe_error_interval: PROBE_ERROR_INTERVAL,
            upnp_discover_timeout: UPNP_DISCOVER_TIMEOUT,
            upnp_mapping_description: UPNP_MAPPING_DESCRIPTION.to_string(),
            echo_service_url: DEFAULT_ECHO_SERVICE_URL.to_string(),
            echo_check_timeout: ECHO_CHECK_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.socket_send_timeout, SOCKET_SEND_TIMEOUT);
        assert_eq!(cfg.virtual_connect_timeout, VIRTUAL_CONNECT_TIMEOUT);
        assert_eq!(cfg.listen_port, 0);
    }
}
