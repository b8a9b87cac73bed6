use lru::LruCache;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::sharding::urn::Urn;

/// Virtual nodes per shard. Higher counts flatten the key distribution;
/// 150 keeps the per-shard coefficient of variation under 20% for realistic
/// cluster sizes.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

const LOOKUP_CACHE_CAPACITY: usize = 10_000;

#[derive(Default)]
struct RingState {
    /// token -> shard id, sorted. The ring proper.
    ring: BTreeMap<u64, String>,
    /// shard id -> its tokens. Reverse index for removal and range queries.
    shard_tokens: HashMap<String, Vec<u64>>,
}

/// Consistent hash ring with virtual nodes.
///
/// Mutations take the write lock and swap in a complete post-state; lookups
/// hold the read lock, so no caller ever observes a partially updated ring.
/// A bounded hash->shard cache fronts lookups and is invalidated on every
/// mutation.
pub struct ConsistentHashRing {
    state: RwLock<RingState>,
    lookup_cache: Mutex<LruCache<u64, String>>,
}

impl ConsistentHashRing {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RingState::default()),
            lookup_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(LOOKUP_CACHE_CAPACITY).unwrap(),
            )),
        }
    }

    /// Add a shard with `virtual_nodes` tokens derived from
    /// `"{shard_id}#{i}"`. Re-adding an existing shard replaces its tokens.
    pub fn add_shard(&self, shard_id: &str, virtual_nodes: usize) {
        let mut state = self.state.write().unwrap();

        if let Some(tokens) = state.shard_tokens.remove(shard_id) {
            for token in tokens {
                state.ring.remove(&token);
            }
        }

        let mut tokens = Vec::with_capacity(virtual_nodes);
        for i in 0..virtual_nodes {
            let token = Self::hash_key(&format!("{}#{}", shard_id, i));
            state.ring.insert(token, shard_id.to_string());
            tokens.push(token);
        }
        state.shard_tokens.insert(shard_id.to_string(), tokens);
        drop(state);

        self.lookup_cache.lock().unwrap().clear();
        info!(
            "Added shard {} to hash ring with {} virtual nodes",
            shard_id, virtual_nodes
        );
    }

    /// Remove every token belonging to `shard_id`. Absent shard is a no-op.
    pub fn remove_shard(&self, shard_id: &str) {
        let mut state = self.state.write().unwrap();
        let Some(tokens) = state.shard_tokens.remove(shard_id) else {
            return;
        };
        for token in tokens {
            state.ring.remove(&token);
        }
        drop(state);

        self.lookup_cache.lock().unwrap().clear();
        warn!("Removed shard {} from hash ring", shard_id);
    }

    /// First shard at or after `hash`, wrapping to the smallest token.
    /// `None` means the ring is empty, which callers treat as "no shards",
    /// not as an error.
    pub fn shard_for_hash(&self, hash: u64) -> Option<String> {
        if let Some(shard_id) = self.lookup_cache.lock().unwrap().get(&hash) {
            return Some(shard_id.clone());
        }

        let state = self.state.read().unwrap();
        if state.ring.is_empty() {
            return None;
        }

        let shard_id = state
            .ring
            .range(hash..)
            .next()
            .or_else(|| state.ring.iter().next())
            .map(|(_, id)| id.clone())?;
        drop(state);

        self.lookup_cache
            .lock()
            .unwrap()
            .put(hash, shard_id.clone());
        Some(shard_id)
    }

    pub fn shard_for_urn(&self, urn: &Urn) -> Option<String> {
        self.shard_for_hash(urn.hash())
    }

    /// Next `count` distinct shards clockwise from the first token >= `hash`.
    /// Returns fewer when the ring holds fewer distinct shards.
    pub fn successors(&self, hash: u64, count: usize) -> Vec<String> {
        let state = self.state.read().unwrap();
        if state.ring.is_empty() || count == 0 {
            return Vec::new();
        }

        let mut result = Vec::new();
        let mut seen = HashSet::new();

        let walk = state
            .ring
            .range(hash..)
            .chain(state.ring.range(..hash))
            .map(|(_, id)| id);

        for shard_id in walk {
            if result.len() >= count {
                break;
            }
            if seen.insert(shard_id.clone()) {
                result.push(shard_id.clone());
            }
        }

        result
    }

    /// Min/max token across the shard's virtual nodes. Conservative: the
    /// shard's arcs are interleaved with other shards', so this is not a
    /// contiguous range.
    pub fn shard_range(&self, shard_id: &str) -> Option<(u64, u64)> {
        let state = self.state.read().unwrap();
        let tokens = state.shard_tokens.get(shard_id)?;
        if tokens.is_empty() {
            return None;
        }
        let min = *tokens.iter().min().unwrap();
        let max = *tokens.iter().max().unwrap();
        Some((min, max))
    }

    pub fn all_shards(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        let mut shards: Vec<String> = state.shard_tokens.keys().cloned().collect();
        shards.sort();
        shards
    }

    /// Standard deviation of virtual-node counts per shard as a percentage
    /// of the mean. Under 5% is well-balanced.
    pub fn balance_factor(&self) -> f64 {
        let state = self.state.read().unwrap();
        if state.shard_tokens.is_empty() {
            return 0.0;
        }

        let total = state.ring.len() as f64;
        let mean = total / state.shard_tokens.len() as f64;

        let variance = state
            .shard_tokens
            .values()
            .map(|tokens| {
                let diff = tokens.len() as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / state.shard_tokens.len() as f64;

        (variance.sqrt() / mean) * 100.0
    }

    pub fn virtual_node_count(&self) -> usize {
        self.state.read().unwrap().ring.len()
    }

    pub fn shard_count(&self) -> usize {
        self.state.read().unwrap().shard_tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shard_count() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.write().unwrap();
        state.ring.clear();
        state.shard_tokens.clear();
        drop(state);
        self.lookup_cache.lock().unwrap().clear();
    }

    fn hash_key(key: &str) -> u64 {
        xxhash_rust::xxh64::xxh64(key.as_bytes(), 0)
    }
}

impl Default for ConsistentHashRing {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConsistentHashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistentHashRing")
            .field("shards", &self.shard_count())
            .field("virtual_nodes", &self.virtual_node_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ring_with(shards: &[&str]) -> ConsistentHashRing {
        let ring = ConsistentHashRing::new();
        for shard in shards {
            ring.add_shard(shard, DEFAULT_VIRTUAL_NODES);
        }
        ring
    }

    fn random_keys(count: usize) -> Vec<u64> {
        // Deterministic corpus: hash sequential strings so the distribution
        // assertions are reproducible.
        (0..count)
            .map(|i| xxhash_rust::xxh64::xxh64(format!("key_{}", i).as_bytes(), 0))
            .collect()
    }

    fn key_distribution(ring: &ConsistentHashRing, keys: &[u64]) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for &key in keys {
            let shard = ring.shard_for_hash(key).unwrap();
            *counts.entry(shard).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_empty_ring() {
        let ring = ConsistentHashRing::new();
        assert!(ring.shard_for_hash(42).is_none());
        assert!(ring.successors(42, 3).is_empty());
        assert_eq!(ring.shard_count(), 0);
        assert_eq!(ring.balance_factor(), 0.0);
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let ring = ring_with(&["shard_001", "shard_002", "shard_003"]);
        for key in random_keys(100) {
            let first = ring.shard_for_hash(key);
            let second = ring.shard_for_hash(key);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_lookup_matches_manual_walk() {
        let ring = ring_with(&["shard_001", "shard_002"]);
        // Rebuild the ring by hand and compare lookups against it.
        let mut manual = BTreeMap::new();
        for shard in ["shard_001", "shard_002"] {
            for i in 0..DEFAULT_VIRTUAL_NODES {
                let token = xxhash_rust::xxh64::xxh64(format!("{}#{}", shard, i).as_bytes(), 0);
                manual.insert(token, shard.to_string());
            }
        }
        for key in random_keys(500) {
            let expected = manual
                .range(key..)
                .next()
                .or_else(|| manual.iter().next())
                .map(|(_, id)| id.clone());
            assert_eq!(ring.shard_for_hash(key), expected);
        }
    }

    #[test]
    fn test_two_shard_distribution() {
        let ring = ring_with(&["shard_001", "shard_002"]);
        let counts = key_distribution(&ring, &random_keys(10_000));
        for (shard, count) in &counts {
            assert!(
                (4_500..=5_500).contains(count),
                "shard {} got {} of 10000 keys",
                shard,
                count
            );
        }
    }

    #[test]
    fn test_distribution_coefficient_of_variation() {
        for n in [3usize, 5, 10, 20] {
            let shards: Vec<String> = (0..n).map(|i| format!("shard_{:03}", i)).collect();
            let refs: Vec<&str> = shards.iter().map(|s| s.as_str()).collect();
            let ring = ring_with(&refs);
            let counts = key_distribution(&ring, &random_keys(10_000));

            let mean = 10_000.0 / n as f64;
            let variance = shards
                .iter()
                .map(|s| {
                    let c = *counts.get(s).unwrap_or(&0) as f64;
                    (c - mean) * (c - mean)
                })
                .sum::<f64>()
                / n as f64;
            let cv = variance.sqrt() / mean;
            assert!(cv < 0.20, "cv for {} shards was {:.3}", n, cv);
        }
    }

    #[test]
    fn test_add_shard_migration_ratio() {
        let shards: Vec<String> = (0..5).map(|i| format!("shard_{}", i)).collect();
        let refs: Vec<&str> = shards.iter().map(|s| s.as_str()).collect();
        let ring = ring_with(&refs);

        let keys = random_keys(10_000);
        let before: Vec<String> = keys.iter().map(|&k| ring.shard_for_hash(k).unwrap()).collect();

        ring.add_shard("shard_new", DEFAULT_VIRTUAL_NODES);

        let mut moved = 0;
        let mut on_new = 0;
        for (i, &key) in keys.iter().enumerate() {
            let after = ring.shard_for_hash(key).unwrap();
            if after != before[i] {
                moved += 1;
                // Keys only ever move onto the new shard.
                assert_eq!(after, "shard_new");
            }
            if after == "shard_new" {
                on_new += 1;
            }
        }

        // Ideal migration is 1/6 of 10000 ~ 1667; allow +/-50%.
        assert!(
            (1_000..=2_500).contains(&moved),
            "migrated {} keys, expected about 1667",
            moved
        );
        assert!(
            (1_167..=2_167).contains(&on_new),
            "shard_new owns {} keys",
            on_new
        );
    }

    #[test]
    fn test_remove_shard_migrates_only_its_keys() {
        let ring = ring_with(&["shard_0", "shard_1", "shard_2"]);
        let keys = random_keys(5_000);
        let before: Vec<String> = keys.iter().map(|&k| ring.shard_for_hash(k).unwrap()).collect();

        ring.remove_shard("shard_1");

        for (i, &key) in keys.iter().enumerate() {
            let after = ring.shard_for_hash(key).unwrap();
            if before[i] == "shard_1" {
                assert_ne!(after, "shard_1");
            } else {
                assert_eq!(after, before[i], "key not owned by shard_1 moved");
            }
        }
    }

    #[test]
    fn test_remove_absent_shard_is_noop() {
        let ring = ring_with(&["shard_0"]);
        ring.remove_shard("shard_missing");
        assert_eq!(ring.shard_count(), 1);
    }

    #[test]
    fn test_remove_last_shard_empties_ring() {
        let ring = ring_with(&["shard_0"]);
        ring.remove_shard("shard_0");
        assert!(ring.is_empty());
        assert!(ring.shard_for_hash(7).is_none());
    }

    #[test]
    fn test_readd_replaces_tokens() {
        let ring = ring_with(&["shard_0"]);
        ring.add_shard("shard_0", 50);
        assert_eq!(ring.virtual_node_count(), 50);
        assert_eq!(ring.shard_count(), 1);
    }

    #[test]
    fn test_successors_distinct_and_bounded() {
        let ring = ring_with(&["shard_0", "shard_1", "shard_2"]);
        let succ = ring.successors(12345, 2);
        assert_eq!(succ.len(), 2);
        assert_ne!(succ[0], succ[1]);

        // Asking for more shards than exist returns all distinct shards.
        let all = ring.successors(12345, 10);
        assert_eq!(all.len(), 3);
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_successors_first_matches_lookup() {
        let ring = ring_with(&["shard_0", "shard_1", "shard_2"]);
        for key in random_keys(200) {
            let succ = ring.successors(key, 1);
            assert_eq!(succ[0], ring.shard_for_hash(key).unwrap());
        }
    }

    #[test]
    fn test_shard_range() {
        let ring = ring_with(&["shard_0"]);
        let (min, max) = ring.shard_range("shard_0").unwrap();
        assert!(min < max);
        assert!(ring.shard_range("shard_x").is_none());
    }

    #[test]
    fn test_balance_factor_equal_vnodes() {
        let ring = ring_with(&["shard_0", "shard_1", "shard_2", "shard_3"]);
        // Same vnode count everywhere: stddev is zero.
        assert!(ring.balance_factor() < f64::EPSILON);

        ring.add_shard("shard_heavy", 300);
        assert!(ring.balance_factor() > 5.0);
    }
}
