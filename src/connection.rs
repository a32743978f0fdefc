//! The collaborator interface a transport connection must expose to the manager. The framing and
//! channel-multiplexing machinery that lives "inside" a connection is largely out of scope for
//! this crate (spec §1) — [`crate::mux`] provides one concrete, reasonably complete
//! implementation so the rest of the manager is independently testable over real loopback
//! sockets, but callers are free to supply their own `Connection` impl.

use crate::endpoint::Endpoint;
use crate::peer_id::PeerId;
use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Whether a connection's transport stream is a direct socket or a tunnel riding inside another
/// peer's connection (spec §3, glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Real,
    Virtual,
}

impl ConnKind {
    pub fn is_virtual(self) -> bool {
        matches!(self, ConnKind::Virtual)
    }
}

/// A type-erased duplex byte stream — what `request_proxy_tunnel_channel` hands back. Splits the
/// stream into boxed read/write halves up front rather than boxing a single
/// `dyn AsyncRead + AsyncWrite` object, since a trait object doesn't automatically implement its
/// own supertraits for other generic code (like `tokio::io::copy_bidirectional`) to rely on.
pub struct TunnelStream {
    read: Pin<Box<dyn AsyncRead + Send + Sync>>,
    write: Pin<Box<dyn AsyncWrite + Send + Sync>>,
}

impl TunnelStream {
    /// `tokio::io::split`'s `ReadHalf`/`WriteHalf` are `Sync` regardless of whether `S` is (access
    /// is mediated through a shared lock), which is what lets a [`TunnelStream`] satisfy
    /// `Connection`'s `Send + Sync` bound even though the halves it wraps are type-erased.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self {
            read: Box::pin(read),
            write: Box::pin(write),
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.get_mut().read.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.get_mut().write.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().write.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().write.as_mut().poll_shutdown(cx)
    }
}

/// One admitted connection to a remote peer. Owned exclusively by the registry while live (spec
/// §3 `ConnectionRecord`).
#[async_trait]
pub trait Connection: Send + Sync {
    fn remote_endpoint(&self) -> Endpoint;
    fn remote_peer_id(&self) -> PeerId;
    fn kind(&self) -> ConnKind;
    fn started_at(&self) -> Instant;

    fn is_virtual(&self) -> bool {
        self.kind().is_virtual()
    }

    /// Begins background channel service for this connection. Must not block.
    fn start(&self);

    /// Releases the underlying transport stream. Idempotent.
    async fn dispose(&self);

    /// Asks the remote peer whether it currently holds a connection to `endpoint` (spec §4.5).
    async fn request_peer_status(&self, endpoint: Endpoint) -> bool;

    /// Asks the remote peer to relay a tunnel to `endpoint`, returning our end of the tunnel
    /// stream on success (spec §4.4, §4.5).
    async fn request_proxy_tunnel_channel(
        &self,
        endpoint: Endpoint,
    ) -> std::io::Result<TunnelStream>;

    /// Opens a fresh multiplexed channel directly to this connection's peer. Internal primitive
    /// used to implement `request_proxy_tunnel_channel` and relay splicing; not itself part of
    /// the spec's named collaborator surface (the multiplexer that backs it is out of scope,
    /// spec §1).
    async fn open_channel(&self) -> std::io::Result<TunnelStream>;
}

/// Lightweight, `Clone`-able summary of a connection, used for registry snapshots and logging.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub remote_endpoint: Endpoint,
    pub remote_peer_id: PeerId,
    pub kind: ConnKind,
    pub started_at: Instant,
}

impl ConnectionInfo {
    pub fn of(conn: &dyn Connection) -> Self {
        Self {
            remote_endpoint: conn.remote_endpoint(),
            remote_peer_id: conn.remote_peer_id(),
            kind: conn.kind(),
            started_at: conn.started_at(),
        }
    }
}
