//! Public facade tying the registry, handshake, virtual-connect coordinator and connectivity
//! probe together into one long-lived object (spec §1, §3 `ConnectionManager`).

use crate::config::ManagerConfig;
use crate::connection::Connection;
use crate::connectivity::{self, ConnectivityState, InternetConnectivityStatus, UPnPDeviceStatus};
use crate::connector;
use crate::endpoint::Endpoint;
use crate::error::{ConnectError, VirtualConnectError};
use crate::in_flight::InFlightSet;
use crate::mux::IncomingChannelHandler;
use crate::peer_id::PeerId;
use crate::registry::ConnectionRegistry;
use crate::stats::{Stats, StatsSnapshot};
use crate::virtual_connect::{self, VirtualConnectHandler};
use crate::{acceptor, connection};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Condensed read-only view returned by [`ConnectionManager::properties`] (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerProperties {
    pub local_peer_id: PeerId,
    pub local_port: u16,
    pub internet_status: InternetConnectivityStatus,
    pub upnp_status: UPnPDeviceStatus,
    pub upnp_external_endpoint: Option<Endpoint>,
}

/// Entry point for the whole crate. One instance owns a bound listener, the dedup registry, the
/// in-flight connect set and the background connectivity probe; dropping/`shutdown`ing it tears
/// all of that down.
pub struct ConnectionManager {
    local_peer_id: PeerId,
    local_service_port: u16,
    config: Arc<ManagerConfig>,
    registry: Arc<ConnectionRegistry>,
    in_flight: Arc<InFlightSet>,
    virtual_in_flight: Arc<InFlightSet>,
    stats: Arc<Stats>,
    channel_handler: Arc<VirtualConnectHandler>,
    connectivity_rx: watch::Receiver<ConnectivityState>,
    acceptor_handle: JoinHandle<()>,
    connectivity_handle: JoinHandle<()>,
}

impl ConnectionManager {
    /// Binds the listener and spawns the background accept loop and connectivity probe. The
    /// manager generates a fresh random peer id for the lifetime of the process (spec §3).
    pub async fn bind(config: ManagerConfig) -> std::io::Result<Arc<Self>> {
        let local_peer_id = PeerId::random();
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        let local_service_port = listener.local_addr()?.port();

        let config = Arc::new(config);
        let registry = ConnectionRegistry::new(local_peer_id);
        let in_flight = Arc::new(InFlightSet::new());
        let virtual_in_flight = Arc::new(InFlightSet::new());
        let stats = Arc::new(Stats::default());

        let (connectivity_tx, connectivity_rx, connectivity_handle) =
            connectivity::spawn(config.clone(), local_service_port);

        let channel_handler = VirtualConnectHandler::new(
            registry.clone(),
            local_peer_id,
            local_service_port,
            connectivity_rx.clone(),
            config.clone(),
            stats.clone(),
        );

        let acceptor_handle = tokio::spawn(acceptor::run(
            listener,
            local_peer_id,
            local_service_port,
            registry.clone(),
            channel_handler.clone() as Arc<dyn IncomingChannelHandler>,
            connectivity_tx.clone(),
            connectivity_rx.clone(),
            config.clone(),
            stats.clone(),
        ));

        Ok(Arc::new(Self {
            local_peer_id,
            local_service_port,
            config,
            registry,
            in_flight,
            virtual_in_flight,
            stats,
            channel_handler,
            connectivity_rx,
            acceptor_handle,
            connectivity_handle,
        }))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn local_service_port(&self) -> u16 {
        self.local_service_port
    }

    /// Dials `endpoint` directly. See [`crate::connector::connect`] for the admission-race
    /// reconciliation this wraps.
    pub async fn make_connection(&self, endpoint: Endpoint) -> Result<Arc<dyn Connection>, ConnectError> {
        connector::connect(
            endpoint,
            self.local_peer_id,
            self.local_service_port,
            self.registry.clone(),
            self.in_flight.clone(),
            self.virtual_in_flight.clone(),
            self.channel_handler.clone() as Arc<dyn IncomingChannelHandler>,
            self.connectivity_rx.clone(),
            self.config.clone(),
            self.stats.clone(),
        )
        .await
    }

    /// Connects to `target` by relaying a tunnel through an already-connected peer (spec §4.4,
    /// §4.5). Fails immediately if no peer reports reachability within the configured timeout.
    pub async fn make_virtual_connection(
        &self,
        target: Endpoint,
    ) -> Result<Arc<dyn Connection>, VirtualConnectError> {
        virtual_connect::connect(
            target,
            self.get_external_endpoint(),
            self.local_peer_id,
            self.local_service_port,
            self.registry.clone(),
            self.virtual_in_flight.clone(),
            self.channel_handler.clone() as Arc<dyn IncomingChannelHandler>,
            self.connectivity_rx.clone(),
            self.config.clone(),
            self.stats.clone(),
        )
        .await
    }

    pub fn get_existing_connection(&self, endpoint: Endpoint) -> Option<Arc<dyn Connection>> {
        self.registry.get(endpoint)
    }

    /// Whether a connection to `endpoint` is currently admitted (spec §6), keyed the same way the
    /// registry's peer-status answers are (`registry.contains`, also used to answer a remote
    /// peer's `request_peer_status` query over the wire).
    pub fn is_peer_connection_available(&self, endpoint: Endpoint) -> bool {
        self.registry.contains(endpoint)
    }

    /// The address this host is currently reachable at, derived from the latest connectivity
    /// snapshot per the priority order in [`ConnectivityState::external_endpoint`] (spec §4.8).
    /// `None` until the probe has something to report.
    pub fn get_external_endpoint(&self) -> Option<Endpoint> {
        self.connectivity_rx
            .borrow()
            .external_endpoint(self.local_service_port)
    }

    /// The port this host should advertise to peers, falling back to the local listen port when
    /// nothing better is known (spec §4.8). Always in `1..=65535`.
    pub fn get_external_port(&self) -> u16 {
        self.connectivity_rx
            .borrow()
            .external_port(self.local_service_port)
    }

    /// A read-only snapshot of the current connectivity state (spec §6).
    pub fn connectivity_state(&self) -> ConnectivityState {
        *self.connectivity_rx.borrow()
    }

    /// The `properties` read-only surface from spec §6: identity plus a condensed connectivity
    /// view, without exposing the full probe internals.
    pub fn properties(&self) -> ManagerProperties {
        let state = *self.connectivity_rx.borrow();
        let upnp_external_endpoint = match (state.upnp_external_ip, state.upnp_external_port) {
            (Some(ip), Some(port)) => Some(Endpoint::new(std::net::SocketAddr::new(ip.into(), port))),
            _ => None,
        };
        ManagerProperties {
            local_peer_id: self.local_peer_id,
            local_port: self.local_service_port,
            internet_status: state.internet_status,
            upnp_status: state.upnp_status,
            upnp_external_endpoint,
        }
    }

    /// Subscribes to connectivity-state changes; the receiver always holds the latest value.
    pub fn subscribe_connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.connectivity_rx.clone()
    }

    /// Subscribes to registry change events, fired after every successful admission or eviction.
    pub fn subscribe_registry_changes(&self) -> watch::Receiver<()> {
        self.registry.subscribe()
    }

    pub fn connection_infos(&self) -> Vec<connection::ConnectionInfo> {
        self.registry.infos()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Disposes every live connection and stops the background acceptor and connectivity probe.
    /// Idempotent only in the sense that calling it twice is harmless; the manager is unusable
    /// afterward.
    pub async fn shutdown(&self) {
        self.acceptor_handle.abort();
        self.connectivity_handle.abort();
        self.registry.clear().await;
    }
}
