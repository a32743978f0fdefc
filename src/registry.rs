//! Deduplicating connection registry (spec §4.1). The core reason this can't be a plain
//! map-insert: admission has to reconcile races between inbound/outbound connects, prefer real
//! connections over virtual ones, and break peer-id ties with an endpoint-swap policy (spec §9
//! design note: "model admission as a pure function over `(existing?, incoming)`").

use crate::connection::{Connection, ConnectionInfo};
use crate::endpoint::Endpoint;
use crate::peer_id::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Default)]
struct State {
    by_endpoint: HashMap<Endpoint, Arc<dyn Connection>>,
    by_peer_id: HashMap<PeerId, Arc<dyn Connection>>,
}

impl State {
    fn insert(&mut self, conn: Arc<dyn Connection>) {
        self.by_endpoint.insert(conn.remote_endpoint(), conn.clone());
        self.by_peer_id.insert(conn.remote_peer_id(), conn);
    }

    fn erase(&mut self, conn: &Arc<dyn Connection>) {
        self.by_endpoint.remove(&conn.remote_endpoint());
        self.by_peer_id.remove(&conn.remote_peer_id());
    }
}

/// What to do with an existing record when a new one collides with it, decided purely from the
/// two connections' real/virtual tags (spec §4.1 steps 2–3, §9 design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindDecision {
    Evict,
    Reject,
}

fn kind_decision(existing_is_virtual: bool, incoming_is_virtual: bool) -> KindDecision {
    if existing_is_virtual && !incoming_is_virtual {
        // A real connection always beats a virtual one.
        KindDecision::Evict
    } else if incoming_is_virtual {
        // Virtual never evicts anything it didn't already beat above.
        KindDecision::Reject
    } else {
        // Both real (or existing real, incoming real): newest real connection wins.
        KindDecision::Evict
    }
}

/// Endpoint-swap policy applied on a peer-id collision across different endpoints (spec §4.1
/// step 3, §9 open question — preserved literally, including the IPv4/IPv6 asymmetry).
fn allow_new_connection(existing: Endpoint, new: Endpoint) -> bool {
    if existing.family() != new.family() && existing.is_ipv4() {
        return false;
    }

    if existing.is_ipv4() && existing.is_private_ipv4() {
        return false;
    }

    true
}

/// Process-wide connection registry, encapsulated in a single owning object rather than an
/// ambient singleton (spec §9 design note).
pub struct ConnectionRegistry {
    local_peer_id: PeerId,
    state: Mutex<State>,
    change_tx: watch::Sender<()>,
}

impl ConnectionRegistry {
    pub fn new(local_peer_id: PeerId) -> Arc<Self> {
        let (change_tx, _) = watch::channel(());
        Arc::new(Self {
            local_peer_id,
            state: Mutex::new(State::default()),
            change_tx,
        })
    }

    /// Subscribe to a change signal fired after every successful admission or eviction.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.change_tx.subscribe()
    }

    /// Runs the admission policy (spec §4.1) for an already-constructed connection handle. Does
    /// *not* call `start` on admission — the handshake still needs to write/read the outcome byte
    /// on the raw stream first, and starting the connection begins framed traffic processing that
    /// would otherwise race with it. The caller calls `start` once that's done. On rejection the
    /// registry likewise leaves disposal to the caller, for the same reason (it needs the
    /// still-live stream to write the rejection byte before closing it).
    pub async fn add(&self, conn: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        if conn.remote_peer_id() == self.local_peer_id {
            tracing::debug!(endpoint = %conn.remote_endpoint(), "rejecting self connection");
            return None;
        }

        enum Outcome {
            Admit,
            AdmitEvicting(Arc<dyn Connection>),
            Reject,
        }

        let outcome = {
            let mut state = self.state.lock();

            if let Some(existing) = state.by_endpoint.get(&conn.remote_endpoint()).cloned() {
                match kind_decision(existing.is_virtual(), conn.is_virtual()) {
                    KindDecision::Evict => Outcome::AdmitEvicting(existing),
                    KindDecision::Reject => Outcome::Reject,
                }
            } else if let Some(existing) = state.by_peer_id.get(&conn.remote_peer_id()).cloned() {
                match kind_decision(existing.is_virtual(), conn.is_virtual()) {
                    KindDecision::Reject => Outcome::Reject,
                    KindDecision::Evict => {
                        if allow_new_connection(existing.remote_endpoint(), conn.remote_endpoint())
                        {
                            Outcome::AdmitEvicting(existing)
                        } else {
                            Outcome::Reject
                        }
                    }
                }
            } else {
                Outcome::Admit
            };

            match &outcome {
                Outcome::Admit => state.insert(conn.clone()),
                Outcome::AdmitEvicting(existing) => {
                    state.erase(existing);
                    state.insert(conn.clone());
                }
                Outcome::Reject => {}
            }

            outcome
        };

        match outcome {
            Outcome::Reject => {
                tracing::debug!(
                    endpoint = %conn.remote_endpoint(),
                    peer_id = %conn.remote_peer_id(),
                    is_virtual = conn.is_virtual(),
                    "rejecting connection: dedup policy"
                );
                None
            }
            Outcome::Admit | Outcome::AdmitEvicting(_) => {
                if let Outcome::AdmitEvicting(existing) = outcome {
                    tracing::debug!(
                        evicted = %existing.remote_endpoint(),
                        admitted = %conn.remote_endpoint(),
                        "evicting connection in favor of a preferred one"
                    );
                    existing.dispose().await;
                }

                self.change_tx.send(()).ok();
                tracing::info!(endpoint = %conn.remote_endpoint(), peer_id = %conn.remote_peer_id(), "connection admitted");
                Some(conn)
            }
        }
    }

    pub fn get(&self, endpoint: Endpoint) -> Option<Arc<dyn Connection>> {
        self.state.lock().by_endpoint.get(&endpoint).cloned()
    }

    pub fn get_by_peer_id(&self, peer_id: PeerId) -> Option<Arc<dyn Connection>> {
        self.state.lock().by_peer_id.get(&peer_id).cloned()
    }

    pub fn contains(&self, endpoint: Endpoint) -> bool {
        self.state.lock().by_endpoint.contains_key(&endpoint)
    }

    /// Idempotent relative to already-absent keys: only removes the entries if they still point
    /// at exactly this connection (spec §4.1 "Eviction").
    pub fn remove(&self, conn: &Arc<dyn Connection>) {
        let removed = {
            let mut state = self.state.lock();
            let mut removed = false;

            if let Some(existing) = state.by_endpoint.get(&conn.remote_endpoint()) {
                if Arc::ptr_eq(existing, conn) {
                    state.by_endpoint.remove(&conn.remote_endpoint());
                    removed = true;
                }
            }

            if let Some(existing) = state.by_peer_id.get(&conn.remote_peer_id()) {
                if Arc::ptr_eq(existing, conn) {
                    state.by_peer_id.remove(&conn.remote_peer_id());
                    removed = true;
                }
            }

            removed
        };

        if removed {
            self.change_tx.send(()).ok();
        }
    }

    /// Snapshot of all live connections, used by the virtual-connect coordinator (spec §4.5
    /// step 1).
    pub fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.state.lock().by_endpoint.values().cloned().collect()
    }

    pub fn infos(&self) -> Vec<ConnectionInfo> {
        self.state
            .lock()
            .by_endpoint
            .values()
            .map(|c| ConnectionInfo::of(c.as_ref()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposes every live connection and empties both indexes (manager shutdown, spec §3).
    pub async fn clear(&self) {
        let conns: Vec<_> = { self.state.lock().by_endpoint.values().cloned().collect() };

        for conn in &conns {
            conn.dispose().await;
        }

        let mut state = self.state.lock();
        state.by_endpoint.clear();
        state.by_peer_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnKind;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    struct FakeConnection {
        endpoint: Endpoint,
        peer_id: PeerId,
        kind: ConnKind,
        disposed: AtomicBool,
        started_at: Instant,
    }

    impl FakeConnection {
        fn new(endpoint: &str, peer_id: PeerId, kind: ConnKind) -> Arc<dyn Connection> {
            Arc::new(Self {
                endpoint: Endpoint::new(endpoint.parse::<SocketAddr>().unwrap()),
                peer_id,
                kind,
                disposed: AtomicBool::new(false),
                started_at: Instant::now(),
            })
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        fn remote_endpoint(&self) -> Endpoint {
            self.endpoint
        }

        fn remote_peer_id(&self) -> PeerId {
            self.peer_id
        }

        fn kind(&self) -> ConnKind {
            self.kind
        }

        fn started_at(&self) -> Instant {
            self.started_at
        }

        fn start(&self) {}

        async fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }

        async fn request_peer_status(&self, _endpoint: Endpoint) -> bool {
            false
        }

        async fn request_proxy_tunnel_channel(
            &self,
            _endpoint: Endpoint,
        ) -> std::io::Result<crate::connection::TunnelStream> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "fake"))
        }

        async fn open_channel(&self) -> std::io::Result<crate::connection::TunnelStream> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "fake"))
        }
    }

    fn pid() -> PeerId {
        PeerId::random()
    }

    #[tokio::test]
    async fn rejects_self_connection() {
        let local = pid();
        let registry = ConnectionRegistry::new(local);
        let conn = FakeConnection::new("1.2.3.4:100", local, ConnKind::Real);
        assert!(registry.add(conn).await.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn second_admit_same_endpoint_evicts_first() {
        let registry = ConnectionRegistry::new(pid());
        let a = FakeConnection::new("1.2.3.4:100", pid(), ConnKind::Real);
        let b = FakeConnection::new("1.2.3.4:100", pid(), ConnKind::Real);

        let a = registry.add(a).await.unwrap();
        let b = registry.add(b).await.unwrap();

        assert!(Arc::ptr_eq(&registry.get(a.remote_endpoint()).unwrap(), &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn virtual_never_evicts_real_same_endpoint() {
        let registry = ConnectionRegistry::new(pid());
        let real = FakeConnection::new("1.2.3.4:100", pid(), ConnKind::Real);
        let real = registry.add(real).await.unwrap();

        let virt = FakeConnection::new("1.2.3.4:100", pid(), ConnKind::Virtual);
        assert!(registry.add(virt).await.is_none());

        assert!(Arc::ptr_eq(&registry.get(real.remote_endpoint()).unwrap(), &real));
    }

    #[tokio::test]
    async fn real_evicts_virtual_same_endpoint() {
        let registry = ConnectionRegistry::new(pid());
        let virt = FakeConnection::new("1.2.3.4:100", pid(), ConnKind::Virtual);
        registry.add(virt).await.unwrap();

        let real = FakeConnection::new("1.2.3.4:100", pid(), ConnKind::Real);
        let real = registry.add(real).await.unwrap();

        assert!(!registry.get(real.remote_endpoint()).unwrap().is_virtual());
    }

    #[tokio::test]
    async fn peer_id_collision_rejects_when_existing_is_public_ipv4() {
        let registry = ConnectionRegistry::new(pid());
        let peer = pid();
        let a = FakeConnection::new("8.8.8.8:100", peer, ConnKind::Real);
        registry.add(a).await.unwrap();

        let b = FakeConnection::new("9.9.9.9:200", peer, ConnKind::Real);
        assert!(registry.add(b).await.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn peer_id_collision_allows_swap_when_existing_is_private_ipv4() {
        let registry = ConnectionRegistry::new(pid());
        let peer = pid();
        let a = FakeConnection::new("192.168.1.5:100", peer, ConnKind::Real);
        registry.add(a).await.unwrap();

        let b = FakeConnection::new("9.9.9.9:200", peer, ConnKind::Real);
        let b = registry.add(b).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(b.remote_endpoint()).unwrap().remote_peer_id(), peer);
    }

    #[tokio::test]
    async fn peer_id_collision_family_mismatch_rejects_when_existing_is_ipv4() {
        let registry = ConnectionRegistry::new(pid());
        let peer = pid();
        let a = FakeConnection::new("8.8.8.8:100", peer, ConnKind::Real);
        registry.add(a).await.unwrap();

        let b = FakeConnection::new("[2001:db8::1]:200", peer, ConnKind::Real);
        assert!(registry.add(b).await.is_none());
    }

    #[tokio::test]
    async fn peer_id_collision_family_mismatch_allows_when_existing_is_ipv6() {
        let registry = ConnectionRegistry::new(pid());
        let peer = pid();
        let a = FakeConnection::new("[2001:db8::1]:100", peer, ConnKind::Real);
        registry.add(a).await.unwrap();

        let b = FakeConnection::new("8.8.8.8:200", peer, ConnKind::Real);
        let b = registry.add(b).await.unwrap();
        assert_eq!(registry.get(b.remote_endpoint()).unwrap().remote_peer_id(), peer);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new(pid());
        let a = FakeConnection::new("1.2.3.4:100", pid(), ConnKind::Real);
        let a = registry.add(a).await.unwrap();

        registry.remove(&a);
        assert!(registry.is_empty());
        // Removing again must not panic and must stay idempotent.
        registry.remove(&a);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn clear_disposes_everything() {
        let registry = ConnectionRegistry::new(pid());
        let a = FakeConnection::new("1.2.3.4:100", pid(), ConnKind::Real);
        registry.add(a).await.unwrap();
        registry.clear().await;
        assert!(registry.is_empty());
    }
}
