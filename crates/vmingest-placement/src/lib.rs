//! Node selection for vmingest.
//!
//! This module implements:
//! - xxhash64 with seed=0 for hashing node identifiers
//! - Rendezvous (highest random weight) hashing over a fixed node list
//!
//! CRITICAL: the node hash and the score mix must stay identical to the ones
//! used by already deployed routers, otherwise series get re-sharded.

use std::hash::Hasher;
use twox_hash::XxHash64;

/// Compute xxhash64 of a byte string with seed=0.
///
/// # Examples
///
/// ```
/// use vmingest_placement::xxhash64;
///
/// let hash = xxhash64(b"vmstorage-1:8400");
/// assert_eq!(hash, xxhash64(b"vmstorage-1:8400")); // Deterministic
/// ```
pub fn xxhash64(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}

/// Rendezvous hash over an immutable node list.
///
/// Each key is scored against every node and goes to the node with the
/// highest score. Removing (or excluding) a node only moves the keys that
/// were assigned to it; every other key keeps its node.
///
/// Lookups are O(N), which is fine for the tens to low hundreds of nodes a
/// cluster routes to. The table is read-only after construction, so a single
/// instance can be shared between threads without locking.
///
/// # Examples
///
/// ```
/// use vmingest_placement::ConsistentHash;
///
/// let hash = ConsistentHash::new(&["node-a", "node-b", "node-c"], 0);
/// let idx = hash.get_node_idx(0xdead_beef, &[]);
/// assert!(idx < 3);
///
/// // Retry on another node after a failure.
/// let retry = hash.get_node_idx(0xdead_beef, &[idx]);
/// assert_ne!(retry, idx);
/// ```
#[derive(Debug, Clone)]
pub struct ConsistentHash {
    hash_seed: u64,
    node_hashes: Vec<u64>,
}

impl ConsistentHash {
    /// Builds the table, hashing every node identifier once.
    pub fn new<N: AsRef<[u8]>>(nodes: &[N], hash_seed: u64) -> Self {
        let node_hashes = nodes.iter().map(|node| xxhash64(node.as_ref())).collect();
        Self {
            hash_seed,
            node_hashes,
        }
    }

    /// Number of nodes in the table.
    pub fn len(&self) -> usize {
        self.node_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_hashes.is_empty()
    }

    /// Returns the index of the node for key `h`, skipping `exclude_idxs`.
    ///
    /// When every node is excluded the exclusion list is ignored.
    ///
    /// An empty table returns 0.
    pub fn get_node_idx(&self, h: u64, exclude_idxs: &[usize]) -> usize {
        let h = h ^ self.hash_seed;
        let exclude_idxs = if exclude_idxs.len() == self.node_hashes.len() {
            &[][..]
        } else {
            exclude_idxs
        };

        let mut best: Option<(usize, u64)> = None;
        for (i, &nh) in self.node_hashes.iter().enumerate() {
            if exclude_idxs.contains(&i) {
                continue;
            }
            let m = fast_hash_u64(nh ^ h);
            match best {
                Some((_, m_max)) if m <= m_max => {}
                _ => best = Some((i, m)),
            }
        }
        best.map_or(0, |(idx, _)| idx)
    }
}

/// xorshift64* finalizer used to score (node, key) pairs.
#[inline]
fn fast_hash_u64(mut x: u64) -> u64 {
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    x.wrapping_mul(2685821657736338717)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_node_idx_valid_and_not_excluded(
            node_count in 1usize..32,
            key in any::<u64>(),
            seed in any::<u64>(),
            exclude in prop::collection::vec(0usize..32, 0..8),
        ) {
            let nodes: Vec<String> = (0..node_count).map(|i| format!("node-{}", i)).collect();
            let hash = ConsistentHash::new(&nodes, seed);
            let mut exclude: Vec<usize> = exclude.into_iter().filter(|&i| i < node_count).collect();
            exclude.sort_unstable();
            exclude.dedup();

            let idx = hash.get_node_idx(key, &exclude);
            prop_assert!(idx < node_count);
            if exclude.len() != node_count {
                prop_assert!(!exclude.contains(&idx));
            }
        }
    }
}
