//! Tunable numbers pulled out of the prose in the spec so they have one home.

use std::time::Duration;

/// Handshake wire version. Connections advertising any other version are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length in bytes of a [`crate::peer_id::PeerId`].
pub const PEER_ID_LEN: usize = 20;

/// Total length of the handshake frame: version (1) + port (2) + peer id (20).
pub const HANDSHAKE_FRAME_LEN: usize = 1 + 2 + PEER_ID_LEN;

/// Send timeout applied to every accepted/connected transport socket.
pub const SOCKET_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Receive timeout applied to every accepted/connected transport socket. Longer than the send
/// timeout to tolerate long-idle tunnel channels; application-level NOOPs keep liveness at
/// roughly 15s.
pub const SOCKET_RECV_TIMEOUT: Duration = Duration::from_secs(90);

/// Grace period the initiator sleeps after a handshake rejection before re-querying the registry
/// for the winning connection, to give the other side time to finish admission.
pub const REJECTION_RACE_GRACE: Duration = Duration::from_millis(500);

/// How long the virtual-connect coordinator waits for any peer to answer "yes" before giving up.
pub const VIRTUAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Initial delay before the first connectivity probe runs.
pub const PROBE_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Normal connectivity probe cadence.
pub const PROBE_NORMAL_INTERVAL: Duration = Duration::from_secs(60);

/// Shortened cadence while UPnP is in an error state (device not found / port forwarding failed).
pub const PROBE_ERROR_INTERVAL: Duration = Duration::from_secs(10);

/// Timeout for UPnP gateway discovery.
pub const UPNP_DISCOVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on how many external ports the UPnP port search probes before giving up, large
/// enough to cover the whole wrap-around range once.
pub const UPNP_PORT_SEARCH_MAX_ITERATIONS: u32 = 65_535;

/// Lowest external port the port search wraps back to after overflowing `u16::MAX`.
pub const UPNP_PORT_SEARCH_WRAP_FLOOR: u16 = 1024;

/// Description string stamped on UPnP port mappings we create.
pub const UPNP_MAPPING_DESCRIPTION: &str = "Bit Chat";

/// Default echo service used to validate external reachability.
pub const DEFAULT_ECHO_SERVICE_URL: &str = "https://echo.bitchat.example/check";

/// Default timeout for the echo-check HTTP request.
pub const ECHO_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
