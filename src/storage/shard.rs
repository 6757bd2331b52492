//! Sharded Map
//!
//! Concurrent key→entry map split into independently locked shards.
//!
//! # Design
//!
//! - Each shard has its own RwLock, so operations on different keys rarely
//!   contend; the shard lock is the unit of per-key mutual exclusion
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Mutations run as closures under the shard's write lock, so a
//!   check-then-write on one key is atomic

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Single shard containing a hashmap and access counters
pub struct Shard<V> {
    map: RwLock<HashMap<Arc<str>, V>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }
}

impl<V> Shard<V> {
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// Sharded map keyed by interned strings
pub struct ShardedMap<V, const N: usize = 256> {
    shards: Box<[Shard<V>]>,
}

impl<V, const N: usize> Default for ShardedMap<V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, const N: usize> ShardedMap<V, N> {
    pub fn new() -> Self {
        debug_assert!(N.is_power_of_two());
        let shards: Vec<Shard<V>> = (0..N).map(|_| Shard::default()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    #[inline]
    fn shard_for(&self, key: &str) -> &Shard<V> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (N - 1)]
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    pub fn total_reads(&self) -> u64 {
        self.shards.iter().map(|s| s.read_count()).sum()
    }

    pub fn total_writes(&self) -> u64 {
        self.shards.iter().map(|s| s.write_count()).sum()
    }

    /// Run `f` on the value under the shard's read lock
    pub fn read<R>(&self, key: &str, f: impl FnOnce(Option<&V>) -> R) -> R {
        let shard = self.shard_for(key);
        shard.reads.fetch_add(1, Ordering::Relaxed);
        let guard = shard.map.read();
        f(guard.get(key))
    }

    /// Run `f` on the key's shard under its write lock
    pub fn write<R>(&self, key: &str, f: impl FnOnce(&mut HashMap<Arc<str>, V>) -> R) -> R {
        let shard = self.shard_for(key);
        shard.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = shard.map.write();
        f(&mut guard)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read(key, |value| value.is_some())
    }

    pub fn keys(&self) -> Vec<Arc<str>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.map.read().keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Visit every value, one shard read lock at a time
    pub fn for_each(&self, mut f: impl FnMut(&Arc<str>, &V)) {
        for shard in self.shards.iter() {
            let guard = shard.map.read();
            for (key, value) in guard.iter() {
                f(key, value);
            }
        }
    }

    /// Remove every value for which `f` returns true, returning them
    pub fn drain_where(&self, mut f: impl FnMut(&V) -> bool) -> Vec<V> {
        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.map.write();
            let keys: Vec<Arc<str>> = guard
                .iter()
                .filter(|(_, value)| f(value))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(value) = guard.remove(&key) {
                    drained.push(value);
                }
            }
        }
        drained
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.map.write().clear();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let map: ShardedMap<u32, 16> = ShardedMap::new();
        map.write("a", |shard| shard.insert(Arc::from("a"), 1));
        assert_eq!(map.read("a", |v| v.copied()), Some(1));
        assert!(map.contains_key("a"));
        assert!(!map.contains_key("b"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_drain_where() {
        let map: ShardedMap<u32, 16> = ShardedMap::new();
        for i in 0..10u32 {
            let key = format!("k{}", i);
            map.write(&key, |shard| shard.insert(Arc::from(key.as_str()), i));
        }
        let mut drained = map.drain_where(|v| v % 2 == 0);
        drained.sort();
        assert_eq!(drained, vec![0, 2, 4, 6, 8]);
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn test_counters() {
        let map: ShardedMap<u32, 4> = ShardedMap::new();
        map.write("x", |shard| shard.insert(Arc::from("x"), 7));
        map.read("x", |_| ());
        map.read("x", |_| ());
        assert_eq!(map.total_reads(), 2);
        assert_eq!(map.total_writes(), 1);
        assert_eq!(map.shard_count(), 4);
    }
}
