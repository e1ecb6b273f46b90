//! # Identity and Crypto Puzzles
//!
//! This module defines the identity types used throughout the overlay:
//!
//! - [`Keypair`]: Ed25519 signing keypair whose public key satisfies the
//!   static puzzle, plus the nonce solving the dynamic puzzle
//! - [`NodeId`]: a peer's identity record (public key, nonce, checksum,
//!   advertised address)
//!
//! ## Puzzle scheme (S/Kademlia)
//!
//! Two proofs of work bind an identity to computation:
//!
//! - **Static puzzle** (`c1`): `BLAKE2b-256(public_key)` must have `c1`
//!   leading zero bits. Keypairs are rejection-sampled until this holds.
//! - **Dynamic puzzle** (`c2`): a 32-byte `nonce` must be found such that
//!   `BLAKE2b-256(checksum XOR nonce)` has `c2` leading zero bits.
//!
//! Generation is expensive; verification is two hashes. Peers presenting an
//! identity that fails [`verify_puzzle`] are disconnected during handshake.
//!
//! ## Prefix-diff gate
//!
//! Beyond the puzzles, an accepted remote checksum must differ from ours in
//! at least `prefix_diff_min` of the first `prefix_diff_len` bits
//! ([`prefix_diff`]). This stops an adversary from grinding identities that
//! all land in one of our buckets.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::ProtocolError;

/// 256-bit BLAKE2b, the overlay's checksum hash.
type Blake2b256 = Blake2b<U32>;

/// Size in bytes of checksums, nonces, and Ed25519 public keys.
pub const ID_SIZE: usize = 32;

/// A node's routing key: `BLAKE2b-256(public_key)`.
pub type Checksum = [u8; ID_SIZE];

/// Solution to the dynamic puzzle, same width as the checksum.
pub type Nonce = [u8; ID_SIZE];

/// Default static puzzle difficulty in leading zero bits.
pub const DEFAULT_C1: usize = 16;

/// Default dynamic puzzle difficulty in leading zero bits.
pub const DEFAULT_C2: usize = 16;

/// Upper bound on keypair rejection-sampling attempts.
///
/// At `c1 = 16` a valid key appears once per ~65k samples; exhausting this
/// bound means the CSPRNG is broken or the difficulty is unreasonable.
const MAX_KEY_ATTEMPTS: u64 = 1 << 28;

/// Upper bound on nonce search attempts for the dynamic puzzle.
const MAX_NONCE_ATTEMPTS: u64 = 1 << 28;

/// Puzzle generation exhausted its bounded search.
///
/// This never occurs in practice with a functioning CSPRNG and sane
/// difficulties; it exists so startup fails loudly instead of spinning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PuzzleError {
    pub attempts: u64,
    pub c1: usize,
    pub c2: usize,
}

impl std::fmt::Display for PuzzleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "puzzle search failed after {} attempts (c1={}, c2={})",
            self.attempts, self.c1, self.c2
        )
    }
}

impl std::error::Error for PuzzleError {}

/// Compute the overlay checksum of a public key.
pub fn checksum(public_key: &[u8; ID_SIZE]) -> Checksum {
    let mut hasher = Blake2b256::new();
    hasher.update(public_key);
    hasher.finalize().into()
}

/// Count leading zero bits of a byte string.
pub fn leading_zero_bits(bytes: &[u8]) -> usize {
    let mut zeros = 0;
    for byte in bytes {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros() as usize;
            break;
        }
    }
    zeros
}

/// Count the bit positions within the first `n` bits at which `a` and `b`
/// differ. Comparison stops at the shorter input if `n` overruns it.
pub fn prefix_diff(a: &[u8], b: &[u8], n: usize) -> usize {
    let mut diff = 0;
    let mut remaining = n;
    for (x, y) in a.iter().zip(b.iter()) {
        if remaining == 0 {
            break;
        }
        let mut xor = x ^ y;
        if remaining < 8 {
            // Mask off bits past the comparison window, MSB-first.
            xor &= 0xffu8 << (8 - remaining);
            remaining = 0;
        } else {
            remaining -= 8;
        }
        diff += xor.count_ones() as usize;
    }
    diff
}

/// Byte-wise XOR of two checksums; big-endian compare of the result is the
/// Kademlia distance metric.
pub fn xor_distance(a: &Checksum, b: &Checksum) -> Checksum {
    let mut out = [0u8; ID_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Verify both puzzles for a presented identity.
///
/// Checks that the checksum has `c1` leading zero bits (static) and that
/// `BLAKE2b-256(checksum XOR nonce)` has `c2` leading zero bits (dynamic).
/// Failure is a hard protocol error that aborts the handshake.
pub fn verify_puzzle(
    sum: &Checksum,
    nonce: &Nonce,
    c1: usize,
    c2: usize,
) -> Result<(), ProtocolError> {
    if leading_zero_bits(sum) < c1 {
        return Err(ProtocolError::InvalidPuzzle("static"));
    }
    if leading_zero_bits(&checksum(&xor_distance(sum, nonce))) < c2 {
        return Err(ProtocolError::InvalidPuzzle("dynamic"));
    }
    Ok(())
}

/// An Ed25519 keypair bound to solved static and dynamic puzzles.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    checksum: Checksum,
    nonce: Nonce,
}

impl Keypair {
    /// Generate a keypair satisfying the static puzzle at difficulty `c1`,
    /// then search a nonce satisfying the dynamic puzzle at `c2`.
    ///
    /// Expected cost is `2^c1` keygen-and-hash samples plus `2^c2` hashes;
    /// at the defaults this is a few seconds of CPU at startup.
    pub fn generate(c1: usize, c2: usize) -> Result<Self, PuzzleError> {
        let mut attempts = 0u64;
        let (signing_key, sum) = loop {
            attempts += 1;
            if attempts > MAX_KEY_ATTEMPTS {
                return Err(PuzzleError { attempts, c1, c2 });
            }
            let key = SigningKey::generate(&mut OsRng);
            let sum = checksum(&key.verifying_key().to_bytes());
            if leading_zero_bits(&sum) >= c1 {
                break (key, sum);
            }
        };

        let nonce = Self::solve_nonce(&sum, c1, c2)?;

        Ok(Self {
            signing_key,
            checksum: sum,
            nonce,
        })
    }

    /// Search a nonce such that `H(checksum XOR nonce)` has `c2` leading
    /// zero bits.
    fn solve_nonce(sum: &Checksum, c1: usize, c2: usize) -> Result<Nonce, PuzzleError> {
        let mut nonce = [0u8; ID_SIZE];
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            if attempts > MAX_NONCE_ATTEMPTS {
                return Err(PuzzleError { attempts, c1, c2 });
            }
            OsRng.fill_bytes(&mut nonce);
            if leading_zero_bits(&checksum(&xor_distance(sum, &nonce))) >= c2 {
                return Ok(nonce);
            }
        }
    }

    pub fn public_key_bytes(&self) -> [u8; ID_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Derive this node's own identity record from the keypair and the
    /// externally advertised address.
    pub fn id(&self, external_address: impl Into<String>) -> NodeId {
        NodeId::new(
            self.public_key_bytes(),
            self.nonce,
            external_address.into(),
        )
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("checksum", &hex::encode(self.checksum))
            .finish_non_exhaustive()
    }
}

/// A peer's identity record as carried on the wire and in the routing table.
///
/// The checksum is always recomputed locally from the public key; it is the
/// sole key for equality, hashing, and routing-table placement.
#[derive(Clone)]
pub struct NodeId {
    public_key: [u8; ID_SIZE],
    nonce: Nonce,
    checksum: Checksum,
    address: String,
}

impl NodeId {
    pub fn new(public_key: [u8; ID_SIZE], nonce: Nonce, address: String) -> Self {
        let checksum = checksum(&public_key);
        Self {
            public_key,
            nonce,
            checksum,
            address,
        }
    }

    pub fn public_key(&self) -> &[u8; ID_SIZE] {
        &self.public_key
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// XOR distance from this node to `target`, comparable big-endian.
    pub fn distance_to(&self, target: &Checksum) -> Checksum {
        xor_distance(&self.checksum, target)
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.checksum == other.checksum
    }
}

impl Eq for NodeId {}

impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.checksum.hash(state);
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NodeId({}@{})",
            &hex::encode(self.checksum)[..16],
            self.address
        )
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({})",
            &hex::encode(self.checksum)[..16],
            self.address
        )
    }
}
