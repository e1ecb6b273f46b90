//! # Skadium
//!
//! Skadium is the membership and peer-discovery core of an S/Kademlia
//! overlay: a hardened Kademlia variant where node identities are bound to
//! proof-of-work puzzles, routing admission probes liveness before evicting,
//! and iterative lookups run over disjoint paths to resist eclipse attacks.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs, `NodeId`, BLAKE2b-256 checksums, static/dynamic puzzles |
//! | `table` | 256 k-buckets keyed by shared-prefix length, per-bucket locking |
//! | `wire` | Bit-exact codec for IDs and ID lists (opcodes `0x03`/`0x04`) |
//! | `transport` | Session abstraction: mux channels, cancellation, hooks, signals |
//! | `mem` | In-memory loopback transport for tests and simulation |
//! | `tcp` | TCP transport with length-prefixed frames |
//! | `protocol` | Handshake state machine, LRU-probe admission, disjoint FindNode |
//! | `error` | Typed protocol errors |
//!
//! ## Getting started
//!
//! Bind a transport, serve the protocol on its session stream, and join the
//! overlay through any existing node:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use skadium::{Keypair, Protocol, TcpTransport, Transport};
//!
//! # async fn launch() -> anyhow::Result<()> {
//! let keys = Keypair::generate(skadium::DEFAULT_C1, skadium::DEFAULT_C2)?;
//! let (net, sessions) = TcpTransport::bind("0.0.0.0:9000").await?;
//! let protocol = Protocol::new(keys, net.local_addr());
//!
//! let net: Arc<dyn Transport> = net;
//! let _serve = protocol.serve(net.clone(), sessions);
//!
//! net.dial("198.51.100.1:9000").await?;
//! let found = protocol.bootstrap(&net).await;
//! println!("discovered {} peers", found.len());
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces into a runnable node.

pub mod error;
pub mod identity;
pub mod mem;
pub mod protocol;
pub mod table;
pub mod tcp;
pub mod transport;
pub mod wire;

pub use error::ProtocolError;
pub use identity::{
    checksum, leading_zero_bits, prefix_diff, verify_puzzle, xor_distance, Checksum, Keypair,
    NodeId, Nonce, PuzzleError, DEFAULT_C1, DEFAULT_C2, ID_SIZE,
};
pub use mem::{MemNetwork, MemTransport};
pub use protocol::{
    Protocol, DEFAULT_ALPHA, DEFAULT_DISJOINT_PATHS, DEFAULT_FIND_NODE_TIMEOUT,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PREFIX_DIFF_LEN, DEFAULT_PREFIX_DIFF_MIN,
    SIGNAL_HANDSHAKE_COMPLETE,
};
pub use table::{bucket_index, BucketFull, RoutingTable, DEFAULT_BUCKET_SIZE};
pub use tcp::TcpTransport;
pub use transport::{
    ConnReceiver, ConnSender, Frame, Mux, Session, SessionEvents, Signal, Transport, Wire,
};
pub use wire::{marshal_id, marshal_ids, unmarshal_id, unmarshal_ids, OP_LOOKUP, OP_PING};
