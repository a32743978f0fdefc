//! End-to-end tests running real [`ConnectionManager`] instances over loopback TCP.

use connmgr::{ConnectionManager, Endpoint, ManagerConfig};
use std::net::SocketAddr;
use std::time::Duration;

async fn spawn_manager() -> std::sync::Arc<ConnectionManager> {
    ConnectionManager::bind(ManagerConfig {
        listen_port: 0,
        ..ManagerConfig::default()
    })
    .await
    .expect("bind on an ephemeral loopback port cannot fail")
}

fn loopback(port: u16) -> Endpoint {
    Endpoint::new(SocketAddr::from(([127, 0, 0, 1], port)))
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_connection_admits_both_sides() {
    let a = spawn_manager().await;
    let b = spawn_manager().await;

    let conn = a
        .make_connection(loopback(b.local_service_port()))
        .await
        .expect("direct loopback connect should succeed");

    assert_eq!(conn.remote_peer_id(), b.local_peer_id());
    assert!(!conn.is_virtual());

    // Give the acceptor a moment to finish admitting on b's side.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(b.is_peer_connection_available(loopback(a.local_service_port())));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn simultaneous_cross_connect_converges_on_one_connection() {
    // S1: both sides dial each other at the same time; exactly one connection should survive on
    // each side, and both should agree on who the peer is.
    let a = spawn_manager().await;
    let b = spawn_manager().await;

    let a_endpoint = loopback(a.local_service_port());
    let b_endpoint = loopback(b.local_service_port());

    let (a_result, b_result) =
        tokio::join!(a.make_connection(b_endpoint), b.make_connection(a_endpoint));

    let a_conn = a_result.expect("a's dial should resolve to a surviving connection");
    let b_conn = b_result.expect("b's dial should resolve to a surviving connection");

    assert_eq!(a_conn.remote_peer_id(), b.local_peer_id());
    assert_eq!(b_conn.remote_peer_id(), a.local_peer_id());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.is_peer_connection_available(b_endpoint));
    assert!(b.is_peer_connection_available(a_endpoint));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn virtual_connect_without_a_claimable_endpoint_fails_cleanly() {
    // S2 shape (A relays to T through B), but run fresh off `bind` with no connectivity probe
    // result yet, so `a` has no externally-reachable endpoint to claim. The acceptor (running on
    // t, inside b's tunnel) must reject this promptly rather than hang waiting for a
    // claimed-endpoint blob the initiator never had anything real to send.
    let t = spawn_manager().await;
    let b = spawn_manager().await;
    let a = spawn_manager().await;

    let t_endpoint = loopback(t.local_service_port());
    b.make_connection(t_endpoint)
        .await
        .expect("b should be able to dial t directly");

    let b_endpoint = loopback(b.local_service_port());
    a.make_connection(b_endpoint)
        .await
        .expect("a should be able to dial b directly");

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(a.get_external_endpoint().is_none());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        a.make_virtual_connection(t_endpoint),
    )
    .await
    .expect("rejection must be prompt, not a hang");

    assert!(result.is_err());

    a.shutdown().await;
    b.shutdown().await;
    t.shutdown().await;
}
