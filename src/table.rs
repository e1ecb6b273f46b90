//! XOR routing table: 256 k-buckets indexed by shared-prefix length.
//!
//! Each bucket holds at most `bucket_size` peers ordered most-recently-seen
//! first, under its own mutex so admission and eviction on different buckets
//! never contend. The table itself enforces only structural invariants
//! (placement, uniqueness, capacity); liveness-based eviction policy lives in
//! the peer protocol.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

use crate::identity::{Checksum, NodeId, ID_SIZE};

/// Default bucket capacity (`K`).
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Number of buckets: one per possible shared-prefix length.
const BUCKET_COUNT: usize = ID_SIZE * 8;

/// Admission refusal: the target bucket is at capacity.
///
/// The caller decides whether to probe the least-recently-seen occupant or
/// give up; the bucket is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bucket is full")]
pub struct BucketFull;

/// Index of the bucket that `b` occupies in `a`'s table: the 0-based
/// position of the most significant differing bit, i.e. the length of the
/// common prefix.
///
/// # Panics
///
/// Panics when the checksums are equal. The self-checksum is never inserted,
/// so no caller reaches this case; a silent fallback index would corrupt the
/// table instead of exposing the bug.
pub fn bucket_index(a: &Checksum, b: &Checksum) -> usize {
    for (byte_idx, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let xor = x ^ y;
        if xor != 0 {
            return byte_idx * 8 + xor.leading_zeros() as usize;
        }
    }
    panic!("bucket_index called with identical checksums");
}

#[derive(Debug, Default)]
struct Bucket {
    /// Front = most recently seen, back = least recently seen.
    entries: VecDeque<NodeId>,
}

/// The node's view of the overlay, keyed by XOR distance from `self_id`.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    bucket_size: usize,
    buckets: Vec<Mutex<Bucket>>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, bucket_size: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(Mutex::new(Bucket::default()));
        }
        Self {
            self_id,
            bucket_size,
            buckets,
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Record that `id` was just seen.
    ///
    /// Moves an existing entry to the front of its bucket, or inserts at the
    /// front when there is room. Returns [`BucketFull`] without modifying
    /// the bucket when it is at capacity; attempting to insert our own
    /// checksum is a no-op.
    pub fn update(&self, id: NodeId) -> Result<(), BucketFull> {
        if id.checksum() == self.self_id.checksum() {
            return Ok(());
        }
        let idx = bucket_index(self.self_id.checksum(), id.checksum());
        let mut bucket = self.buckets[idx].lock().expect("bucket lock poisoned");

        if let Some(pos) = bucket
            .entries
            .iter()
            .position(|entry| entry.checksum() == id.checksum())
        {
            bucket.entries.remove(pos);
            bucket.entries.push_front(id);
            return Ok(());
        }

        if bucket.entries.len() >= self.bucket_size {
            return Err(BucketFull);
        }
        bucket.entries.push_front(id);
        Ok(())
    }

    /// Remove `id` from its bucket. Returns whether an entry was removed.
    pub fn delete(&self, id: &NodeId) -> bool {
        if id.checksum() == self.self_id.checksum() {
            return false;
        }
        let idx = bucket_index(self.self_id.checksum(), id.checksum());
        let mut bucket = self.buckets[idx].lock().expect("bucket lock poisoned");
        if let Some(pos) = bucket
            .entries
            .iter()
            .position(|entry| entry.checksum() == id.checksum())
        {
            bucket.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// The least-recently-seen occupant of `id`'s bucket, if any.
    pub fn last_seen_in_bucket_of(&self, id: &NodeId) -> Option<NodeId> {
        let idx = bucket_index(self.self_id.checksum(), id.checksum());
        let bucket = self.buckets[idx].lock().expect("bucket lock poisoned");
        bucket.entries.back().cloned()
    }

    /// Whether `id` is currently present in the table.
    pub fn contains(&self, id: &NodeId) -> bool {
        if id.checksum() == self.self_id.checksum() {
            return false;
        }
        let idx = bucket_index(self.self_id.checksum(), id.checksum());
        let bucket = self.buckets[idx].lock().expect("bucket lock poisoned");
        bucket
            .entries
            .iter()
            .any(|entry| entry.checksum() == id.checksum())
    }

    /// Up to `k` known IDs sorted by ascending XOR distance to `target`.
    /// `self_id` is never part of the result.
    pub fn find_closest(&self, target: &NodeId, k: usize) -> Vec<NodeId> {
        if k == 0 {
            return Vec::new();
        }
        let mut found = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock().expect("bucket lock poisoned");
            found.extend(bucket.entries.iter().cloned());
        }
        found.sort_unstable_by(|a, b| {
            a.distance_to(target.checksum())
                .cmp(&b.distance_to(target.checksum()))
        });
        found.truncate(k);
        found
    }

    /// Total number of entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().expect("bucket lock poisoned").entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
