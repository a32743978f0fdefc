//! Virtual connections: tunneling a connection to a peer we can't dial directly through a peer
//! we're already connected to (spec §4.4–§4.5).
//!
//! A tunnel stream has no socket address to read back, so it can't carry the initiator's endpoint
//! the way a real `TcpStream::peer_addr` would. We extend the handshake for virtual connections
//! only: right after the normal frame exchange, the initiator writes one more
//! [`crate::endpoint::encode_tagged`] blob naming the endpoint it wants to be known by. The
//! acceptor side ([`VirtualConnectHandler`]) reads it back before admitting the connection. Real
//! connections never see this extra blob.

use crate::config::ManagerConfig;
use crate::connection::{ConnKind, Connection, TunnelStream};
use crate::connectivity::ConnectivityState;
use crate::endpoint::{decode_tagged, encode_tagged, Endpoint};
use crate::error::VirtualConnectError;
use crate::handshake;
use crate::in_flight::InFlightSet;
use crate::mux::{IncomingChannelHandler, MuxConnection};
use crate::peer_id::PeerId;
use crate::registry::ConnectionRegistry;
use crate::stats::Stats;
use async_trait::async_trait;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;

async fn write_claimed_endpoint<S: tokio::io::AsyncWrite + Unpin>(
    stream: &mut S,
    endpoint: Option<Endpoint>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    encode_tagged(endpoint, &mut buf);
    stream.write_all(&buf).await
}

async fn read_claimed_endpoint<S: tokio::io::AsyncRead + Unpin>(
    stream: &mut S,
) -> std::io::Result<Option<Endpoint>> {
    let tag = stream.read_u8().await?;
    let rest_len = match tag {
        1 => 6,
        2 => 18,
        _ => 0,
    };
    let mut rest = vec![0u8; rest_len];
    if rest_len > 0 {
        stream.read_exact(&mut rest).await?;
    }
    let mut buf = Vec::with_capacity(1 + rest_len);
    buf.push(tag);
    buf.extend_from_slice(&rest);
    Ok(decode_tagged(&buf).and_then(|(ep, _)| ep))
}

/// Outcome of searching the registry for a peer willing to relay to `target` (spec §4.5 steps
/// 1-5). Kept distinct from a bare `Option` so an empty registry (fail immediately) can be told
/// apart from "every live peer answered false, or none answered before the deadline" (fail after
/// waiting out the timeout).
enum RelaySearch {
    Found(Arc<dyn Connection>),
    Empty,
    TimedOut,
}

/// Polls every currently live connection in parallel asking whether it already holds a connection
/// to `target`, returning the first one that says yes (spec §4.5 step 1).
async fn find_relay(
    target: Endpoint,
    registry: &ConnectionRegistry,
    overall_timeout: Duration,
) -> RelaySearch {
    let candidates = registry.snapshot();
    if candidates.is_empty() {
        return RelaySearch::Empty;
    }

    let mut polls = FuturesUnordered::new();
    for conn in candidates {
        polls.push(async move {
            let ok = conn.request_peer_status(target).await;
            (ok, conn)
        });
    }

    let poll_all = async {
        while let Some((ok, conn)) = polls.next().await {
            if ok {
                return Some(conn);
            }
        }
        None
    };

    match timeout(overall_timeout, poll_all).await {
        Ok(Some(conn)) => RelaySearch::Found(conn),
        Ok(None) | Err(_) => RelaySearch::TimedOut,
    }
}

/// Establishes a virtual connection to `target` by relaying a tunnel through whichever existing
/// connection reports it can reach it (spec §4.4 "identical preamble", §4.5).
#[allow(clippy::too_many_arguments)]
pub async fn connect(
    target: Endpoint,
    local_external_endpoint: Option<Endpoint>,
    local_peer_id: PeerId,
    local_service_port: u16,
    registry: Arc<ConnectionRegistry>,
    virtual_in_flight: Arc<InFlightSet>,
    channel_handler: Arc<dyn IncomingChannelHandler>,
    connectivity_rx: watch::Receiver<ConnectivityState>,
    config: Arc<ManagerConfig>,
    stats: Arc<Stats>,
) -> Result<Arc<dyn Connection>, VirtualConnectError> {
    // Preamble, identical in shape to `connector::connect`'s steps 1-3 but against the virtual
    // in-flight set.
    let permit = virtual_in_flight
        .reserve(target)
        .ok_or(VirtualConnectError::AlreadyInProgress)?;

    if local_external_endpoint == Some(target) {
        return Err(VirtualConnectError::SelfConnection);
    }

    if let Some(existing) = registry.get(target) {
        return Ok(existing);
    }

    let relay = match find_relay(target, &registry, config.virtual_connect_timeout).await {
        RelaySearch::Found(conn) => conn,
        RelaySearch::Empty => return Err(VirtualConnectError::NoPeerAvailable),
        RelaySearch::TimedOut => return Err(VirtualConnectError::TimedOut),
    };

    let mut tunnel = timeout(
        config.virtual_connect_timeout,
        relay.request_proxy_tunnel_channel(target),
    )
    .await
    .map_err(|_| VirtualConnectError::TimedOut)??;

    let advertised_port = connectivity_rx.borrow().external_port(local_service_port);
    let remote_frame = handshake::with_timeout(
        config.socket_recv_timeout,
        handshake::exchange_frames(&mut tunnel, advertised_port, local_peer_id),
    )
    .await?;

    write_claimed_endpoint(&mut tunnel, local_external_endpoint).await?;

    let conn = MuxConnection::new(
        tunnel,
        target,
        remote_frame.peer_id,
        ConnKind::Virtual,
        Arc::downgrade(&registry),
        channel_handler,
    );
    let dyn_conn: Arc<dyn Connection> = conn.clone();

    let locally_admitted = registry.add(dyn_conn.clone()).await.is_some();
    handshake::with_timeout(config.socket_send_timeout, conn.write_handshake_outcome(locally_admitted))
        .await?;
    let remote_admitted = handshake::with_timeout(config.socket_recv_timeout, conn.read_handshake_outcome())
        .await
        .is_ok();

    drop(permit);

    if locally_admitted && remote_admitted {
        conn.start();
        stats.record_virtual_connect_succeeded();
        tracing::info!(endpoint = %target, peer_id = %remote_frame.peer_id, "virtual connection admitted");
        Ok(dyn_conn)
    } else {
        if locally_admitted {
            registry.remove(&dyn_conn);
        }
        conn.dispose().await;
        stats.record_virtual_connect_failed();
        Err(VirtualConnectError::Handshake(
            crate::error::HandshakeError::Rejected,
        ))
    }
}

/// Runs on the acceptor side of a tunnel: handles an incoming `CHANNEL_OPEN` as a nested
/// handshake-and-admit, exactly like a fresh [`crate::acceptor`] accept but over a
/// [`TunnelStream`] instead of a raw socket (spec §4.4 "handshake runs over a tunnel stream
/// exactly as over a raw socket").
pub struct VirtualConnectHandler {
    registry: Arc<ConnectionRegistry>,
    local_peer_id: PeerId,
    local_service_port: u16,
    connectivity_rx: watch::Receiver<ConnectivityState>,
    config: Arc<ManagerConfig>,
    stats: Arc<Stats>,
    self_weak: Weak<VirtualConnectHandler>,
}

impl VirtualConnectHandler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        local_peer_id: PeerId,
        local_service_port: u16,
        connectivity_rx: watch::Receiver<ConnectivityState>,
        config: Arc<ManagerConfig>,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            registry,
            local_peer_id,
            local_service_port,
            connectivity_rx,
            config,
            stats,
            self_weak: self_weak.clone(),
        })
    }
}

#[async_trait]
impl IncomingChannelHandler for VirtualConnectHandler {
    async fn handle(&self, _remote_peer_id: PeerId, mut tunnel: TunnelStream) {
        let Some(self_handle) = self.self_weak.upgrade() else {
            return;
        };
        let channel_handler: Arc<dyn IncomingChannelHandler> = self_handle;

        let advertised_port = self
            .connectivity_rx
            .borrow()
            .external_port(self.local_service_port);
        let remote_frame = match handshake::with_timeout(
            self.config.socket_recv_timeout,
            handshake::exchange_frames(&mut tunnel, advertised_port, self.local_peer_id),
        )
        .await
        {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%err, "virtual connect handshake failed");
                return;
            }
        };

        let claimed_endpoint = match read_claimed_endpoint(&mut tunnel).await {
            Ok(ep) => ep,
            Err(err) => {
                tracing::debug!(%err, "failed to read claimed endpoint on virtual connect");
                return;
            }
        };

        let Some(remote_endpoint) = claimed_endpoint else {
            tracing::debug!("virtual connect initiator did not claim an endpoint, rejecting");
            return;
        };

        let conn = MuxConnection::new(
            tunnel,
            remote_endpoint,
            remote_frame.peer_id,
            ConnKind::Virtual,
            Arc::downgrade(&self.registry),
            channel_handler,
        );
        let dyn_conn: Arc<dyn Connection> = conn.clone();

        match self.registry.add(dyn_conn).await {
            Some(_) => {
                if let Err(err) = handshake::with_timeout(
                    self.config.socket_send_timeout,
                    conn.write_handshake_outcome(true),
                )
                .await
                {
                    tracing::debug!(%err, "failed to write virtual connect outcome");
                    let dyn_conn: Arc<dyn Connection> = conn;
                    self.registry.remove(&dyn_conn);
                    return;
                }
                conn.start();
                self.stats.record_admitted();
                tracing::info!(endpoint = %remote_endpoint, peer_id = %remote_frame.peer_id, "virtual connection admitted (acceptor side)");
            }
            None => {
                let _ = conn.write_handshake_outcome(false).await;
                self.stats.record_rejected();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn claimed_endpoint_round_trips_through_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let ep = Endpoint::new("1.2.3.4:5678".parse().unwrap());
        write_claimed_endpoint(&mut a, Some(ep)).await.unwrap();
        let read_back = read_claimed_endpoint(&mut b).await.unwrap();
        assert_eq!(read_back, Some(ep));
    }

    #[tokio::test]
    async fn no_claimed_endpoint_round_trips_to_none() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_claimed_endpoint(&mut a, None).await.unwrap();
        let read_back = read_claimed_endpoint(&mut b).await.unwrap();
        assert_eq!(read_back, None);
    }

    /// A relay peer whose only job is to hand back one pre-wired tunnel half, used in place of a
    /// real [`crate::mux::MuxConnection`] so this test can drive the real `connect`/
    /// `VirtualConnectHandler::handle` code paths without a socket (pattern shared with
    /// `registry`'s `FakeConnection`).
    struct FakeRelay {
        endpoint: Endpoint,
        peer_id: PeerId,
        tunnel: Mutex<Option<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl Connection for FakeRelay {
        fn remote_endpoint(&self) -> Endpoint {
            self.endpoint
        }

        fn remote_peer_id(&self) -> PeerId {
            self.peer_id
        }

        fn kind(&self) -> ConnKind {
            ConnKind::Real
        }

        fn started_at(&self) -> Instant {
            Instant::now()
        }

        fn start(&self) {}

        async fn dispose(&self) {}

        async fn request_peer_status(&self, _endpoint: Endpoint) -> bool {
            true
        }

        async fn request_proxy_tunnel_channel(
            &self,
            _endpoint: Endpoint,
        ) -> std::io::Result<TunnelStream> {
            let stream = self
                .tunnel
                .lock()
                .await
                .take()
                .expect("tunnel requested more than once");
            Ok(TunnelStream::new(stream))
        }

        async fn open_channel(&self) -> std::io::Result<TunnelStream> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "fake relay has no inbound side"))
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl IncomingChannelHandler for NoopHandler {
        async fn handle(&self, _remote_peer_id: PeerId, _tunnel: TunnelStream) {}
    }

    /// Drives `connect` against a fake relay and `VirtualConnectHandler::handle` on the other end
    /// of the tunnel, over a real in-memory duplex pair — exercises the claimed-endpoint extension
    /// and the handshake/admission dance without needing any real sockets or connectivity probing.
    #[tokio::test]
    async fn connect_relays_through_a_fake_peer_and_admits() {
        let target = Endpoint::new("9.9.9.9:9999".parse().unwrap());
        let claimed = Endpoint::new("5.5.5.5:5555".parse().unwrap());

        let (initiator_half, acceptor_half) = tokio::io::duplex(4096);

        let relay: Arc<dyn Connection> = Arc::new(FakeRelay {
            endpoint: Endpoint::new("1.1.1.1:1111".parse().unwrap()),
            peer_id: PeerId::random(),
            tunnel: Mutex::new(Some(initiator_half)),
        });

        let registry_a = ConnectionRegistry::new(PeerId::random());
        registry_a.add(relay).await.expect("relay should be admitted");

        let local_peer_id = PeerId::random();
        let local_peer_id_t = PeerId::random();
        let (_conn_tx, conn_rx) = watch::channel(ConnectivityState::default());
        let channel_handler_a: Arc<dyn IncomingChannelHandler> = Arc::new(NoopHandler);

        let registry_t = ConnectionRegistry::new(PeerId::random());
        let handler_t = VirtualConnectHandler::new(
            registry_t.clone(),
            local_peer_id_t,
            4242,
            conn_rx.clone(),
            Arc::new(ManagerConfig::default()),
            Arc::new(Stats::default()),
        );

        let acceptor_task = tokio::spawn({
            let handler_t = handler_t.clone();
            async move {
                handler_t
                    .handle(local_peer_id, TunnelStream::new(acceptor_half))
                    .await;
            }
        });

        let conn = connect(
            target,
            Some(claimed),
            local_peer_id,
            1234,
            registry_a,
            Arc::new(InFlightSet::default()),
            channel_handler_a,
            conn_rx,
            Arc::new(ManagerConfig::default()),
            Arc::new(Stats::default()),
        )
        .await
        .expect("virtual connect through the fake relay should succeed");

        assert!(conn.is_virtual());
        assert_eq!(conn.remote_peer_id(), local_peer_id_t);

        acceptor_task.await.unwrap();
        assert!(registry_t.contains(claimed));
    }
}
