//! Key interning.
//!
//! Request keys repeat heavily; interning lets every copy share one
//! allocation. Strings nobody else holds are trimmed once idle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::stats::StringPoolStats;
use crate::engine::ScheduledTask;

/// Interning pool for request keys
pub struct StringPool {
    enabled: bool,
    strings: DashMap<Arc<str>, Instant>,
    hits: AtomicU64,
    misses: AtomicU64,
    trimmed: AtomicU64,
}

impl StringPool {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            strings: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            trimmed: AtomicU64::new(0),
        }
    }

    /// Shared copy of `value`
    pub fn intern(&self, value: &str) -> Arc<str> {
        if !self.enabled {
            return Arc::from(value);
        }

        if let Some(mut entry) = self.strings.get_mut(value) {
            *entry.value_mut() = Instant::now();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return entry.key().clone();
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let interned = self
            .strings
            .entry(Arc::from(value))
            .or_insert_with(Instant::now);
        interned.key().clone()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Drop strings unused for `idle` that only the pool still references
    pub fn trim(&self, idle: Duration) -> usize {
        let before = self.strings.len();
        self.strings
            .retain(|key, last_used| Arc::strong_count(key) > 1 || last_used.elapsed() < idle);
        let removed = before.saturating_sub(self.strings.len());
        self.trimmed.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn clear(&self) {
        self.strings.clear();
    }

    pub fn stats(&self) -> StringPoolStats {
        StringPoolStats {
            interned: self.strings.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            trimmed: self.trimmed.load(Ordering::Relaxed),
        }
    }
}

/// Periodic trimming of a [`StringPool`]
pub struct StringPoolTrimTask {
    pool: Arc<crate::pool::PoolManager>,
    interval: Duration,
    idle: Duration,
}

impl StringPoolTrimTask {
    pub fn new(pool: Arc<crate::pool::PoolManager>, interval: Duration, idle: Duration) -> Self {
        Self {
            pool,
            interval,
            idle,
        }
    }
}

#[async_trait]
impl ScheduledTask for StringPoolTrimTask {
    fn name(&self) -> &str {
        "string-pool-trim"
    }

    fn next_interval(&self) -> Option<Duration> {
        (!self.interval.is_zero()).then_some(self.interval)
    }

    async fn run(&self) {
        let removed = self.pool.strings().trim(self.idle);
        if removed > 0 {
            debug!(removed, "Trimmed idle interned strings");
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
    fn test_intern_shares_allocation() {
        let pool = StringPool::new(true);
        let a = pool.intern("order:1");
        let b = pool.intern("order:1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_disabled_pool_does_not_intern() {
        let pool = StringPool::new(false);
        let a = pool.intern("k");
        let b = pool.intern("k");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_trim_keeps_referenced_strings() {
        let pool = StringPool::new(true);
        let held = pool.intern("held");
        {
            let _dropped = pool.intern("dropped");
        }
        let removed = pool.trim(Duration::ZERO);
        assert_eq!(removed, 1);
        assert_eq!(pool.len(), 1);
        assert!(Arc::ptr_eq(&held, &pool.intern("held")));
    }
}
