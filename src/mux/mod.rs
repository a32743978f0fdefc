//! A minimal tunnel/relay multiplexer providing a concrete, reasonably complete
//! [`Connection`] implementation so the registry, handshake and virtual-connect coordinator are
//! testable end-to-end over real sockets (spec §1 scopes out the *general* chat-channel
//! multiplexer; this is just enough wire protocol to carry peer-status queries and proxied
//! tunnels, spec §4.4–§4.5).
//!
//! Wire protocol: see [`frame`]. Four request/answer message kinds ride a shared control channel
//! (id 0): peer-status query/answer and tunnel-open query/answer. A fifth, `CHANNEL_OPEN`, is a
//! fire-and-forget announcement that a new data channel id now carries raw relayed bytes.

mod frame;

use crate::connection::{ConnKind, Connection, TunnelStream};
use crate::endpoint::Endpoint;
use crate::peer_id::PeerId;
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use frame::{
    read_request_id, push_request_id, MuxFrame, MSG_CHANNEL_OPEN, MSG_DATA,
    MSG_PEER_STATUS_ANSWER, MSG_PEER_STATUS_QUERY, MSG_TUNNEL_OPEN_ANSWER, MSG_TUNNEL_OPEN_QUERY,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, Weak};
use std::time::Instant;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

/// Receives control messages the read loop can't answer by itself: a `CHANNEL_OPEN` means a new
/// inbound virtual connection or proxied tunnel has arrived and needs to be handed to the rest of
/// the manager (spec §4.4 "two-way handshake runs over a tunnel stream exactly as over a raw
/// socket").
#[async_trait]
pub trait IncomingChannelHandler: Send + Sync {
    async fn handle(&self, remote_peer_id: PeerId, tunnel: TunnelStream);
}

struct Inner<S> {
    write_half: AsyncMutex<WriteHalf<S>>,
    next_request_id: AtomicU32,
    next_channel_id: AtomicU32,
    pending_status: SyncMutex<HashMap<u32, oneshot::Sender<bool>>>,
    pending_tunnel_open: SyncMutex<HashMap<u32, oneshot::Sender<bool>>>,
    channels: SyncMutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    registry: Weak<ConnectionRegistry>,
    channel_handler: Arc<dyn IncomingChannelHandler>,
}

impl<S> Inner<S>
where
    S: AsyncWrite + Unpin,
{
    async fn send(&self, frame: MuxFrame) -> std::io::Result<()> {
        let mut w = self.write_half.lock().await;
        frame.write(&mut *w).await
    }
}

impl<S> MuxConnection<S>
where
    S: AsyncWrite + Unpin,
{
    /// Writes the handshake's one-byte admission outcome directly on the still-raw stream. Must
    /// be called before `start` — once started, the stream only speaks framed mux traffic and this
    /// bare byte would desync the peer's frame parser.
    pub async fn write_handshake_outcome(&self, admitted: bool) -> std::io::Result<()> {
        let mut stream = self.raw.lock().unwrap().take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "connection already started")
        })?;
        let result = crate::handshake::write_outcome(&mut stream, admitted).await;
        *self.raw.lock().unwrap() = Some(stream);
        result
    }
}

impl<S> MuxConnection<S>
where
    S: AsyncRead + Unpin,
{
    /// Reads the handshake's one-byte admission outcome directly off the still-raw stream. Same
    /// "must run before `start`" rule as [`Self::write_handshake_outcome`].
    pub async fn read_handshake_outcome(&self) -> Result<(), crate::error::HandshakeError> {
        let mut stream = self.raw.lock().unwrap().take().ok_or_else(|| {
            crate::error::HandshakeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection already started",
            ))
        })?;
        let result = crate::handshake::read_outcome(&mut stream).await;
        *self.raw.lock().unwrap() = Some(stream);
        result
    }
}

/// A [`Connection`] backed by the relay/control protocol in [`frame`], generic over any duplex
/// byte stream: a raw `TcpStream` for real connections, a [`TunnelStream`] for virtual ones.
pub struct MuxConnection<S> {
    remote_endpoint: Endpoint,
    remote_peer_id: PeerId,
    kind: ConnKind,
    started_at: Instant,
    raw: SyncMutex<Option<S>>,
    inner: SyncMutex<Option<Arc<Inner<S>>>>,
    /// Held until `start` moves it into the freshly built `Inner`; `new` can't build `Inner`
    /// itself because that needs the stream split, which only happens once `start` is called.
    pending_registry: SyncMutex<Option<(Weak<ConnectionRegistry>, Arc<dyn IncomingChannelHandler>)>>,
    self_weak: Weak<MuxConnection<S>>,
}

/// Bound of the per-channel buffered-but-unconsumed data frames; a slow reader backpressures the
/// mux's single read loop once this fills up.
const CHANNEL_BUFFER: usize = 64;

impl<S> MuxConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        stream: S,
        remote_endpoint: Endpoint,
        remote_peer_id: PeerId,
        kind: ConnKind,
        registry: Weak<ConnectionRegistry>,
        channel_handler: Arc<dyn IncomingChannelHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            remote_endpoint,
            remote_peer_id,
            kind,
            started_at: Instant::now(),
            raw: SyncMutex::new(Some(stream)),
            inner: SyncMutex::new(None),
            pending_registry: SyncMutex::new(Some((registry, channel_handler))),
            self_weak: self_weak.clone(),
        })
    }

    fn read_half_loop(
        self_weak: Weak<MuxConnection<S>>,
        mut read_half: ReadHalf<S>,
        inner: Arc<Inner<S>>,
    ) -> impl std::future::Future<Output = ()> + Send
    where
        S: 'static,
    {
        async move {
            loop {
                let frame = match MuxFrame::read(&mut read_half).await {
                    Ok(f) => f,
                    Err(_) => break,
                };

                match frame.msg_type {
                    MSG_DATA => {
                        let sender = inner.channels.lock().unwrap().get(&frame.channel_id).cloned();
                        if let Some(sender) = sender {
                            let _ = sender.send(Bytes::from(frame.payload)).await;
                        }
                    }
                    MSG_CHANNEL_OPEN => {
                        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
                        inner.channels.lock().unwrap().insert(frame.channel_id, tx);
                        let tunnel = spawn_channel_pipe(frame.channel_id, inner.clone(), rx);
                        let remote_peer_id = match self_weak.upgrade() {
                            Some(conn) => conn.remote_peer_id,
                            None => break,
                        };
                        let handler = inner.channel_handler.clone();
                        tokio::spawn(async move { handler.handle(remote_peer_id, tunnel).await });
                    }
                    MSG_PEER_STATUS_QUERY => {
                        if let Some((request_id, rest)) = read_request_id(&frame.payload) {
                            let answer = crate::endpoint::decode_tagged(rest)
                                .and_then(|(ep, _)| ep)
                                .and_then(|ep| inner.registry.upgrade().map(|r| r.contains(ep)))
                                .unwrap_or(false);

                            let mut payload = Vec::new();
                            push_request_id(&mut payload, request_id);
                            payload.push(answer as u8);
                            let _ = inner
                                .send(MuxFrame {
                                    msg_type: MSG_PEER_STATUS_ANSWER,
                                    channel_id: 0,
                                    payload,
                                })
                                .await;
                        }
                    }
                    MSG_PEER_STATUS_ANSWER => {
                        if let Some((request_id, rest)) = read_request_id(&frame.payload) {
                            let answer = rest.first().copied().unwrap_or(0) != 0;
                            if let Some(tx) =
                                inner.pending_status.lock().unwrap().remove(&request_id)
                            {
                                let _ = tx.send(answer);
                            }
                        }
                    }
                    MSG_TUNNEL_OPEN_QUERY => {
                        if let Some((request_id, rest)) = read_request_id(&frame.payload) {
                            let target = crate::endpoint::decode_tagged(rest).and_then(|(ep, _)| ep);
                            let channel_id = frame.channel_id;
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                handle_tunnel_open_query(inner, request_id, channel_id, target)
                                    .await;
                            });
                        }
                    }
                    MSG_TUNNEL_OPEN_ANSWER => {
                        if let Some((request_id, rest)) = read_request_id(&frame.payload) {
                            let accepted = rest.first().copied().unwrap_or(0) != 0;
                            if let Some(tx) =
                                inner.pending_tunnel_open.lock().unwrap().remove(&request_id)
                            {
                                let _ = tx.send(accepted);
                            }
                        }
                    }
                    _ => {}
                }
            }

            if let Some(conn) = self_weak.upgrade() {
                if let Some(registry) = inner.registry.upgrade() {
                    let dyn_conn: Arc<dyn Connection> = conn;
                    registry.remove(&dyn_conn);
                }
            }
        }
    }
}

/// Services a `TUNNEL_OPEN_QUERY` by finding a live connection to `target` in the registry and
/// relaying bytes between the asker's channel and a fresh channel on the target connection (spec
/// §4.4 "a peer already connected to the target relays a tunnel").
async fn handle_tunnel_open_query<S>(
    inner: Arc<Inner<S>>,
    request_id: u32,
    channel_id: u32,
    target: Option<Endpoint>,
) where
    S: AsyncWrite + Unpin + Send + 'static,
{
    let target_conn = target.and_then(|ep| inner.registry.upgrade().and_then(|r| r.get(ep)));

    let Some(target_conn) = target_conn else {
        let mut payload = Vec::new();
        push_request_id(&mut payload, request_id);
        payload.push(0);
        let _ = inner
            .send(MuxFrame {
                msg_type: MSG_TUNNEL_OPEN_ANSWER,
                channel_id,
                payload,
            })
            .await;
        return;
    };

    let Ok(mut downstream) = target_conn.open_channel().await else {
        let mut payload = Vec::new();
        push_request_id(&mut payload, request_id);
        payload.push(0);
        let _ = inner
            .send(MuxFrame {
                msg_type: MSG_TUNNEL_OPEN_ANSWER,
                channel_id,
                payload,
            })
            .await;
        return;
    };

    let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
    inner.channels.lock().unwrap().insert(channel_id, tx);
    let mut upstream = spawn_channel_pipe(channel_id, inner.clone(), rx);

    let mut payload = Vec::new();
    push_request_id(&mut payload, request_id);
    payload.push(1);
    let _ = inner
        .send(MuxFrame {
            msg_type: MSG_TUNNEL_OPEN_ANSWER,
            channel_id,
            payload,
        })
        .await;

    let _ = tokio::io::copy_bidirectional(&mut upstream, &mut downstream).await;
    inner.channels.lock().unwrap().remove(&channel_id);
}

/// Bridges a logical data channel's incoming-frame queue and outgoing-frame sink to a plain duplex
/// stream, so the rest of the crate can treat a mux channel exactly like any other
/// `AsyncRead + AsyncWrite`.
fn spawn_channel_pipe<S>(
    channel_id: u32,
    inner: Arc<Inner<S>>,
    mut incoming: mpsc::Receiver<Bytes>,
) -> TunnelStream
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    let (local, remote) = tokio::io::duplex(16 * 1024);
    let (mut remote_read, mut remote_write) = split(remote);

    let feed_from_wire = async move {
        while let Some(chunk) = incoming.recv().await {
            if remote_write.write_all(&chunk).await.is_err() {
                break;
            }
        }
    };

    let drain_to_wire = {
        let inner = inner.clone();
        async move {
            use tokio::io::AsyncReadExt;
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let n = match remote_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let frame = MuxFrame {
                    msg_type: MSG_DATA,
                    channel_id,
                    payload: buf[..n].to_vec(),
                };
                if inner.send(frame).await.is_err() {
                    break;
                }
            }
        }
    };

    tokio::spawn(async move {
        tokio::join!(feed_from_wire, drain_to_wire);
        inner.channels.lock().unwrap().remove(&channel_id);
    });

    TunnelStream::new(local)
}

#[async_trait]
impl<S> Connection for MuxConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn remote_endpoint(&self) -> Endpoint {
        self.remote_endpoint
    }

    fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    fn kind(&self) -> ConnKind {
        self.kind
    }

    fn started_at(&self) -> Instant {
        self.started_at
    }

    fn start(&self) {
        let stream = match self.raw.lock().unwrap().take() {
            Some(s) => s,
            None => return,
        };
        let (registry, channel_handler) = self
            .pending_registry
            .lock()
            .unwrap()
            .take()
            .expect("start called without a registry/channel handler");

        let (read_half, write_half) = split(stream);
        let inner = Arc::new(Inner {
            write_half: AsyncMutex::new(write_half),
            next_request_id: AtomicU32::new(0),
            next_channel_id: AtomicU32::new(0),
            pending_status: SyncMutex::new(HashMap::new()),
            pending_tunnel_open: SyncMutex::new(HashMap::new()),
            channels: SyncMutex::new(HashMap::new()),
            registry,
            channel_handler,
        });
        *self.inner.lock().unwrap() = Some(inner.clone());

        tokio::spawn(Self::read_half_loop(self.self_weak.clone(), read_half, inner));
    }

    async fn dispose(&self) {
        self.raw.lock().unwrap().take();
        if let Some(inner) = self.inner.lock().unwrap().take() {
            let _ = inner.write_half.lock().await.shutdown().await;
        }
    }

    async fn request_peer_status(&self, endpoint: Endpoint) -> bool {
        let Some(inner) = self.inner.lock().unwrap().clone() else {
            return false;
        };
        let request_id = inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner.pending_status.lock().unwrap().insert(request_id, tx);

        let mut payload = Vec::new();
        push_request_id(&mut payload, request_id);
        crate::endpoint::encode_tagged(Some(endpoint), &mut payload);

        if inner
            .send(MuxFrame {
                msg_type: MSG_PEER_STATUS_QUERY,
                channel_id: 0,
                payload,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    async fn request_proxy_tunnel_channel(
        &self,
        endpoint: Endpoint,
    ) -> std::io::Result<TunnelStream> {
        let Some(inner) = self.inner.lock().unwrap().clone() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection not started",
            ));
        };

        let request_id = inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let channel_id = inner.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner
            .pending_tunnel_open
            .lock()
            .unwrap()
            .insert(request_id, tx);

        let (data_tx, data_rx) = mpsc::channel(CHANNEL_BUFFER);
        inner.channels.lock().unwrap().insert(channel_id, data_tx);

        let mut payload = Vec::new();
        push_request_id(&mut payload, request_id);
        crate::endpoint::encode_tagged(Some(endpoint), &mut payload);

        inner
            .send(MuxFrame {
                msg_type: MSG_TUNNEL_OPEN_QUERY,
                channel_id,
                payload,
            })
            .await?;

        let accepted = rx.await.unwrap_or(false);
        if !accepted {
            inner.channels.lock().unwrap().remove(&channel_id);
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "peer declined to relay a tunnel to the requested endpoint",
            ));
        }

        Ok(spawn_channel_pipe(channel_id, inner, data_rx))
    }

    async fn open_channel(&self) -> std::io::Result<TunnelStream> {
        let Some(inner) = self.inner.lock().unwrap().clone() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection not started",
            ));
        };

        let channel_id = inner.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel(CHANNEL_BUFFER);
        inner.channels.lock().unwrap().insert(channel_id, data_tx);

        inner
            .send(MuxFrame {
                msg_type: MSG_CHANNEL_OPEN,
                channel_id,
                payload: Vec::new(),
            })
            .await?;

        Ok(spawn_channel_pipe(channel_id, inner, data_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct NoopHandler;

    #[async_trait]
    impl IncomingChannelHandler for NoopHandler {
        async fn handle(&self, _remote_peer_id: PeerId, _tunnel: TunnelStream) {}
    }

    fn ep(s: &str) -> Endpoint {
        Endpoint::new(s.parse::<SocketAddr>().unwrap())
    }

    fn pair(
        registry: &Arc<ConnectionRegistry>,
    ) -> (Arc<MuxConnection<DuplexStream>>, Arc<MuxConnection<DuplexStream>>) {
        let (a_stream, b_stream) = duplex(64 * 1024);
        let a = MuxConnection::new(
            a_stream,
            ep("10.0.0.1:1"),
            PeerId::random(),
            ConnKind::Real,
            Arc::downgrade(registry),
            Arc::new(NoopHandler),
        );
        let b = MuxConnection::new(
            b_stream,
            ep("10.0.0.2:2"),
            PeerId::random(),
            ConnKind::Real,
            Arc::downgrade(registry),
            Arc::new(NoopHandler),
        );
        a.start();
        b.start();
        (a, b)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn peer_status_query_reflects_remote_registry() {
        let registry = ConnectionRegistry::new(PeerId::random());
        let (a, b): (Arc<dyn Connection>, Arc<dyn Connection>) = {
            let (a, b) = pair(&registry);
            (a, b)
        };

        // `b`'s registry doesn't contain this endpoint, so the answer should be false.
        assert!(!a.request_peer_status(ep("1.2.3.4:100")).await);
        let _ = b;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_channel_delivers_bytes_end_to_end() {
        let registry = ConnectionRegistry::new(PeerId::random());
        let (a, _b) = pair(&registry);
        let a: Arc<dyn Connection> = a;

        let mut channel = a.open_channel().await.unwrap();
        channel.write_all(b"hello").await.unwrap();
        channel.flush().await.unwrap();

        // Round-trips through the duplex pipe spawned on the receiving side; give the background
        // tasks a moment to shuttle the bytes.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(channel);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_proxy_tunnel_channel_fails_when_target_unknown() {
        let registry = ConnectionRegistry::new(PeerId::random());
        let (a, _b) = pair(&registry);
        let a: Arc<dyn Connection> = a;

        let result = a.request_proxy_tunnel_channel(ep("9.9.9.9:9")).await;
        assert!(result.is_err());
    }
}
