use std::io;
use thiserror::Error;

/// Failure categories surfaced by [`crate::manager::ConnectionManager::make_connection`] and
/// [`crate::manager::ConnectionManager::make_virtual_connection`].
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("a connection attempt to this endpoint is already in progress")]
    AlreadyInProgress,

    #[error("refusing to connect to our own external endpoint")]
    SelfConnection,

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    VirtualConnect(#[from] VirtualConnectError),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Failures from the two-party handshake (spec §4.2).
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer speaks protocol version {0}, we only support {1}")]
    ProtocolVersionMismatch(u8, u8),

    #[error("registry rejected the connection and no winning connection was found")]
    Rejected,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures from the virtual-connect coordinator (spec §4.5).
#[derive(Debug, Error)]
pub enum VirtualConnectError {
    #[error("a virtual connection attempt to this endpoint is already in progress")]
    AlreadyInProgress,

    #[error("refusing to connect to our own external endpoint")]
    SelfConnection,

    #[error("no peer available to relay a tunnel")]
    NoPeerAvailable,

    #[error("timed out waiting for a peer to accept the tunnel relay")]
    TimedOut,

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
