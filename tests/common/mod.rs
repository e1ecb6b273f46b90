use std::sync::Arc;
use std::time::Duration;

use skadium::{Keypair, MemNetwork, MemTransport, Protocol, Transport};

/// Low puzzle difficulties keep a test identity under a millisecond while
/// exercising the full search and verification paths.
pub const TEST_C1: usize = 8;
pub const TEST_C2: usize = 8;

pub struct TestNode {
    pub protocol: Protocol,
    pub net: Arc<dyn Transport>,
    pub mem: Arc<MemTransport>,
}

/// Attach a full protocol node to the in-memory network and start serving
/// handshakes on its session stream.
pub fn spawn_node(network: &Arc<MemNetwork>, addr: &str) -> TestNode {
    spawn_node_with(network, addr, TEST_C1, TEST_C2)
}

pub fn spawn_node_with(
    network: &Arc<MemNetwork>,
    addr: &str,
    c1: usize,
    c2: usize,
) -> TestNode {
    let keys = Keypair::generate(c1, c2).expect("puzzle search failed");
    spawn_node_with_keys(network, addr, keys, c1, c2)
}

/// Spawn a node around pre-generated keys; the node verifies peers at the
/// given difficulties regardless of what its own keys satisfy.
pub fn spawn_node_with_keys(
    network: &Arc<MemNetwork>,
    addr: &str,
    keys: Keypair,
    c1: usize,
    c2: usize,
) -> TestNode {
    let (mem, sessions) = network.attach(addr);
    let protocol = Protocol::new(keys, addr)
        .with_c1(c1)
        .with_c2(c2)
        .with_handshake_timeout(Duration::from_secs(2));
    let net: Arc<dyn Transport> = mem.clone();
    let _ = protocol.serve(net.clone(), sessions);
    TestNode { protocol, net, mem }
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s: {what}");
}
