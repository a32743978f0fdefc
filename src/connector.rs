//! Outbound connect path (spec §4.2, initiator side; §4.3 rejection-race reconciliation).
//!
//! Both sides of a handshake decide admission independently against their own registry, so it's
//! possible for us to admit while the peer rejects (or vice versa) when both dial each other at
//! the same time. We resolve that by waiting [`crate::config::ManagerConfig::rejection_race_grace`]
//! and re-checking our own registry for whichever connection actually survived, rather than
//! trusting either side's outcome byte in isolation.

use crate::config::ManagerConfig;
use crate::connection::{ConnKind, Connection};
use crate::connectivity::ConnectivityState;
use crate::endpoint::Endpoint;
use crate::error::ConnectError;
use crate::handshake;
use crate::in_flight::InFlightSet;
use crate::mux::{IncomingChannelHandler, MuxConnection};
use crate::peer_id::PeerId;
use crate::registry::ConnectionRegistry;
use crate::stats::Stats;
use crate::virtual_connect;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::sleep;

/// Dials `endpoint`, preferring a direct TCP connection but falling back to a virtual (relayed)
/// one when the direct attempt fails (spec §4.4 steps 1-5). Returns the admitted [`Connection`]
/// on success.
#[allow(clippy::too_many_arguments)]
pub async fn connect(
    endpoint: Endpoint,
    local_peer_id: PeerId,
    local_service_port: u16,
    registry: Arc<ConnectionRegistry>,
    in_flight: Arc<InFlightSet>,
    virtual_in_flight: Arc<InFlightSet>,
    channel_handler: Arc<dyn IncomingChannelHandler>,
    connectivity_rx: watch::Receiver<ConnectivityState>,
    config: Arc<ManagerConfig>,
    stats: Arc<Stats>,
) -> Result<Arc<dyn Connection>, ConnectError> {
    // Step 1: direct in-flight dedup.
    let permit = in_flight
        .reserve(endpoint)
        .ok_or(ConnectError::AlreadyInProgress)?;

    // Step 2: refuse to dial ourselves.
    let local_state = *connectivity_rx.borrow();
    if local_state.external_endpoint(local_service_port) == Some(endpoint) {
        return Err(ConnectError::SelfConnection);
    }

    // Step 3: an already-admitted connection to this endpoint wins over dialing a new one.
    if let Some(existing) = registry.get(endpoint) {
        return Ok(existing);
    }

    // Step 4: attempt a direct TCP connect.
    let mut stream = match TcpStream::connect(endpoint.socket_addr()).await {
        Ok(stream) => stream,
        Err(err) => {
            // Step 5: on TCP failure, delegate to the virtual-connect coordinator.
            tracing::debug!(endpoint = %endpoint, %err, "direct connect failed, falling back to virtual connect");
            drop(permit);
            return Ok(virtual_connect::connect(
                endpoint,
                local_state.external_endpoint(local_service_port),
                local_peer_id,
                local_service_port,
                registry,
                virtual_in_flight,
                channel_handler,
                connectivity_rx,
                config,
                stats,
            )
            .await?);
        }
    };
    stream.set_nodelay(true).ok();

    stats.record_outbound_connected();

    let advertised_port = local_state.external_port(local_service_port);
    let remote_frame = handshake::with_timeout(
        config.socket_recv_timeout,
        handshake::exchange_frames(&mut stream, advertised_port, local_peer_id),
    )
    .await?;

    if remote_frame.peer_id == local_peer_id {
        return Err(ConnectError::SelfConnection);
    }

    let conn = MuxConnection::new(
        stream,
        endpoint,
        remote_frame.peer_id,
        ConnKind::Real,
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

    // Step 6: always release the in-flight reservation before returning.
    drop(permit);

    match (locally_admitted, remote_admitted) {
        (true, true) => {
            conn.start();
            stats.record_admitted();
            tracing::info!(endpoint = %endpoint, peer_id = %remote_frame.peer_id, "outbound connection admitted");
            Ok(dyn_conn)
        }
        (true, false) => {
            tracing::debug!(endpoint = %endpoint, "remote rejected a connection we locally admitted, unwinding");
            registry.remove(&dyn_conn);
            conn.dispose().await;
            stats.record_rejected();
            wait_for_winner(endpoint, remote_frame.peer_id, &registry, config.rejection_race_grace).await
        }
        (false, _) => {
            conn.dispose().await;
            stats.record_rejected();
            wait_for_winner(endpoint, remote_frame.peer_id, &registry, config.rejection_race_grace).await
        }
    }
}

/// After our own admission attempt lost a race, gives the other direction (an inbound accept
/// carrying the same peer, possibly at a different endpoint) a moment to land in the registry
/// before giving up entirely.
async fn wait_for_winner(
    endpoint: Endpoint,
    peer_id: PeerId,
    registry: &ConnectionRegistry,
    grace: std::time::Duration,
) -> Result<Arc<dyn Connection>, ConnectError> {
    sleep(grace).await;
    registry
        .get(endpoint)
        .or_else(|| registry.get_by_peer_id(peer_id))
        .ok_or(ConnectError::Handshake(crate::error::HandshakeError::Rejected))
}
