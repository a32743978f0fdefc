//! Inbound TCP accept loop (spec §4.2, acceptor side). Every accepted socket runs the handshake
//! and admission dance independently; a slow or hostile peer on one socket never blocks another.

use crate::config::ManagerConfig;
use crate::connection::{ConnKind, Connection};
use crate::connectivity::ConnectivityState;
use crate::endpoint::Endpoint;
use crate::handshake;
use crate::mux::{IncomingChannelHandler, MuxConnection};
use crate::peer_id::PeerId;
use crate::registry::ConnectionRegistry;
use crate::stats::Stats;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::Instrument;

/// Runs until the listener errors out or the process shuts down; logs and keeps accepting rather
/// than tearing down the whole manager over one bad `accept()`.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    listener: TcpListener,
    local_peer_id: PeerId,
    local_service_port: u16,
    registry: Arc<ConnectionRegistry>,
    channel_handler: Arc<dyn IncomingChannelHandler>,
    connectivity_tx: watch::Sender<ConnectivityState>,
    connectivity_rx: watch::Receiver<ConnectivityState>,
    config: Arc<ManagerConfig>,
    stats: Arc<Stats>,
) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                continue;
            }
        };

        let registry = registry.clone();
        let channel_handler = channel_handler.clone();
        let connectivity_tx = connectivity_tx.clone();
        let connectivity_rx = connectivity_rx.clone();
        let config = config.clone();
        let stats = stats.clone();
        tokio::spawn(
            accept_one(
                stream,
                peer_addr.into(),
                local_peer_id,
                local_service_port,
                registry,
                channel_handler,
                connectivity_tx,
                connectivity_rx,
                config,
                stats,
            )
            .instrument(tracing::info_span!("acceptor", peer = %peer_addr)),
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_one(
    mut stream: TcpStream,
    socket_endpoint: Endpoint,
    local_peer_id: PeerId,
    local_service_port: u16,
    registry: Arc<ConnectionRegistry>,
    channel_handler: Arc<dyn IncomingChannelHandler>,
    connectivity_tx: watch::Sender<ConnectivityState>,
    connectivity_rx: watch::Receiver<ConnectivityState>,
    config: Arc<ManagerConfig>,
    stats: Arc<Stats>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(%err, "failed to set TCP_NODELAY on accepted socket");
    }

    let advertised_port = connectivity_rx.borrow().external_port(local_service_port);

    let remote_frame = match handshake::with_timeout(
        config.socket_recv_timeout,
        handshake::exchange_frames(&mut stream, advertised_port, local_peer_id),
    )
    .await
    {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(%err, "handshake failed on inbound connection");
            return;
        }
    };

    stats.record_inbound_accepted();
    let remote_endpoint = socket_endpoint.with_port(remote_frame.service_port);

    if !remote_endpoint.is_private_ipv4() {
        connectivity_tx.send_modify(|state| state.received_live_inbound = true);
    }

    let conn = MuxConnection::new(
        stream,
        remote_endpoint,
        remote_frame.peer_id,
        ConnKind::Real,
        Arc::downgrade(&registry),
        channel_handler,
    );
    let dyn_conn: Arc<dyn Connection> = conn.clone();

    match registry.add(dyn_conn).await {
        Some(_) => {
            if let Err(err) =
                handshake::with_timeout(config.socket_send_timeout, conn.write_handshake_outcome(true))
                    .await
            {
                tracing::debug!(%err, "failed to write admission outcome, dropping connection");
                let dyn_conn: Arc<dyn Connection> = conn;
                registry.remove(&dyn_conn);
                return;
            }
            conn.start();
            stats.record_admitted();
            tracing::info!(endpoint = %remote_endpoint, peer_id = %remote_frame.peer_id, "inbound connection admitted");
        }
        None => {
            let _ = conn.write_handshake_outcome(false).await;
            stats.record_rejected();
            tracing::debug!(endpoint = %remote_endpoint, "inbound connection rejected");
        }
    }
}
