//! Peer-to-peer connection manager: dedup registry, handshake/admission protocol, a real+virtual
//! dual-path connection layer, and a background connectivity probe (UPnP + echo-check).
//!
//! [`manager::ConnectionManager`] is the entry point; everything else is building blocks it wires
//! together.

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod connectivity;
pub mod connector;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod in_flight;
pub mod manager;
pub mod mux;
pub mod peer_id;
pub mod registry;
pub mod stats;
pub mod virtual_connect;

pub use config::ManagerConfig;
pub use connection::{ConnKind, Connection, ConnectionInfo};
pub use connectivity::{ConnectivityState, InternetConnectivityStatus, UPnPDeviceStatus};
pub use endpoint::Endpoint;
pub use error::{ConnectError, HandshakeError, VirtualConnectError};
pub use manager::{ConnectionManager, ManagerProperties};
pub use peer_id::PeerId;
pub use stats::StatsSnapshot;
