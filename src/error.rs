//! Protocol error kinds.
//!
//! Every fallible core operation returns [`ProtocolError`]. The variants map
//! onto the protocol's recovery policies: decode, puzzle, and prefix failures
//! abort a handshake; timeouts trigger eviction; [`ProtocolError::BucketRejected`]
//! is a non-fatal admission refusal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The session was cancelled or the remote went away.
    #[error("session disconnected")]
    Disconnect,

    /// An RPC deadline elapsed before a response arrived.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A peer presented an identity that fails the static or dynamic puzzle.
    #[error("invalid identity puzzle: {0} puzzle not satisfied")]
    InvalidPuzzle(&'static str),

    /// A peer's checksum shares too long a prefix with ours.
    #[error("peer checksum too similar: {got} differing bits, {min} required")]
    PrefixTooSimilar { got: usize, min: usize },

    /// Malformed wire data.
    #[error("decode: {0}")]
    Decode(String),

    /// The target bucket is full of live peers; the new peer is not admitted.
    #[error("cannot evict any peer to make room for new peer")]
    BucketRejected,

    /// Transport-level failure.
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error should count as a peer timeout for eviction
    /// purposes: RPC deadlines and network-level timeouts both qualify.
    pub fn is_timeout(&self) -> bool {
        match self {
            ProtocolError::Timeout(_) => true,
            ProtocolError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
