//! End-to-end handshake behavior over the in-memory transport.

#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{eventually, spawn_node, spawn_node_with_keys, TEST_C1, TEST_C2};
use skadium::{
    leading_zero_bits, Keypair, MemNetwork, Protocol, Transport, SIGNAL_HANDSHAKE_COMPLETE,
};
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread")]
async fn handshake_registers_both_sides() {
    let network = MemNetwork::new();
    let a = spawn_node(&network, "a");
    let b = spawn_node(&network, "b");

    let session = a.net.dial("b").await.expect("dial failed");
    timeout(
        Duration::from_secs(5),
        session.wait_for_signal(SIGNAL_HANDSHAKE_COMPLETE),
    )
    .await
    .expect("handshake never completed");

    let a_id = a.protocol.self_id().clone();
    let b_id = b.protocol.self_id().clone();

    eventually("both tables and registries contain the other node", || {
        a.protocol.table().contains(&b_id)
            && b.protocol.table().contains(&a_id)
            && a.protocol.has_peer(b_id.checksum())
            && b.protocol.has_peer(a_id.checksum())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn weak_puzzle_identity_is_rejected() {
    let network = MemNetwork::new();
    let a = spawn_node(&network, "a");

    // Keys whose checksum fails `a`'s static puzzle threshold. Sampling at
    // difficulty zero gives one in well under a millisecond.
    let weak_keys = loop {
        let keys = Keypair::generate(0, TEST_C2).expect("puzzle search failed");
        if leading_zero_bits(keys.checksum()) < TEST_C1 {
            break keys;
        }
    };
    let b = spawn_node_with_keys(&network, "b", weak_keys, TEST_C1, TEST_C2);
    let b_id = b.protocol.self_id().clone();

    let session = a.net.dial("b").await.expect("dial failed");

    eventually("session torn down after puzzle rejection", || {
        session.is_closed()
    })
    .await;

    assert!(!a.protocol.table().contains(&b_id));
    assert!(!a.protocol.has_peer(b_id.checksum()));
    let a_id = a.protocol.self_id().clone();
    eventually("rejected peer holds no registration either", || {
        !b.protocol.has_peer(a_id.checksum())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn inbound_handshake_probes_the_advertised_address() {
    let network = MemNetwork::new();
    let a = spawn_node(&network, "a");
    let b = spawn_node(&network, "b");

    // `a` dials `b`, so `b` sees an ephemeral source address and must
    // reach-dial `a`'s advertised address before registering it.
    let session = a.net.dial("b").await.expect("dial failed");
    timeout(
        Duration::from_secs(5),
        session.wait_for_signal(SIGNAL_HANDSHAKE_COMPLETE),
    )
    .await
    .expect("handshake never completed");

    let a_id = a.protocol.self_id().clone();
    eventually("acceptor performed a reachability dial and registered", || {
        b.mem.dial_count() >= 1 && b.protocol.has_peer(a_id.checksum())
    })
    .await;

    // The reachability session was transient: registries settle at one
    // live entry per peer.
    eventually("registries settle at one entry each", || {
        a.protocol.peer_count() == 1 && b.protocol.peer_count() == 1
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn too_similar_prefix_is_rejected() {
    let network = MemNetwork::new();

    // A threshold above the compared window is unsatisfiable, so any peer
    // trips the gate.
    let keys = Keypair::generate(TEST_C1, TEST_C2).expect("puzzle search failed");
    let (mem, sessions) = network.attach("a");
    let a = Protocol::new(keys, "a")
        .with_c1(TEST_C1)
        .with_c2(TEST_C2)
        .with_prefix_diff_len(128)
        .with_prefix_diff_min(129)
        .with_handshake_timeout(Duration::from_secs(2));
    let net: std::sync::Arc<dyn Transport> = mem.clone();
    let _ = a.serve(net.clone(), sessions);

    let b = spawn_node(&network, "b");
    let b_id = b.protocol.self_id().clone();

    let session = net.dial("b").await.expect("dial failed");
    eventually("gate failure tears the session down", || session.is_closed()).await;

    assert!(!a.table().contains(&b_id));
    assert!(!a.has_peer(b_id.checksum()));
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_traffic_keeps_peer_registered_once() {
    let network = MemNetwork::new();
    let a = spawn_node(&network, "a");
    let b = spawn_node(&network, "b");

    let session = a.net.dial("b").await.expect("dial failed");
    timeout(
        Duration::from_secs(5),
        session.wait_for_signal(SIGNAL_HANDSHAKE_COMPLETE),
    )
    .await
    .expect("handshake never completed");

    // Several pings over the registered session: the peer stays registered
    // exactly once and remains in the table (MRU refresh, not duplication).
    for _ in 0..5 {
        a.protocol.ping(&session).await.expect("ping failed");
    }

    let b_id = b.protocol.self_id().clone();
    eventually("single registration survives traffic", || {
        a.protocol.has_peer(b_id.checksum()) && a.protocol.table().contains(&b_id)
    })
    .await;
    assert_eq!(a.protocol.peer_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_disconnect_clears_the_registry() {
    let network = MemNetwork::new();
    let a = spawn_node(&network, "a");
    let b = spawn_node(&network, "b");

    let session = a.net.dial("b").await.expect("dial failed");
    timeout(
        Duration::from_secs(5),
        session.wait_for_signal(SIGNAL_HANDSHAKE_COMPLETE),
    )
    .await
    .expect("handshake never completed");

    let b_id = b.protocol.self_id().clone();
    eventually("peer registered", || a.protocol.has_peer(b_id.checksum())).await;

    session.disconnect(None);

    eventually("registry entry dropped after disconnect", || {
        !a.protocol.has_peer(b_id.checksum())
    })
    .await;
    // A plain disconnect is not a timeout: the table entry survives until
    // liveness-based eviction says otherwise.
    assert!(a.protocol.table().contains(&b_id));
}
