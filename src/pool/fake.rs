//! Allocating stand-ins used when pooling is disabled.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use super::array_pool::{get_bucket, get_length, BufferPool, PooledBuffer};
use super::lease::{Lease, Pool, Resettable};
use super::stats::{ArrayPoolStats, ObjectPoolStats};

/// Object pool that allocates on every rent and drops on every return
pub struct FakePool<T> {
    name: String,
    rents: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FakePool<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rents: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }
}

impl<T: Resettable + Default + Send + Sync + 'static> Pool<T> for FakePool<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn rent(&self) -> Lease<T> {
        self.rents.fetch_add(1, Ordering::Relaxed);
        Lease::out_of_pool(T::default())
    }

    fn give_back(&self, _lease: Lease<T>) {}

    fn stats(&self) -> ObjectPoolStats {
        let rents = self.rents.load(Ordering::Relaxed);
        ObjectPoolStats {
            name: self.name.clone(),
            total_requests: rents,
            misses: rents,
            out_of_pool: rents,
            fake: true,
            ..ObjectPoolStats::default()
        }
    }

    fn clear(&self) {}
}

/// Byte-array pool that allocates on every rent
#[derive(Default)]
pub struct FakeArrayPool {
    rents: AtomicU64,
}

impl FakeArrayPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferPool for FakeArrayPool {
    fn rent(&self, min_length: usize) -> PooledBuffer {
        self.rents.fetch_add(1, Ordering::Relaxed);
        // Same rounding as the real pool so callers observe identical lengths
        let length = get_bucket(min_length)
            .and_then(get_length)
            .unwrap_or(min_length);
        PooledBuffer::new(vec![0; length], None)
    }

    fn give_back(&self, _buffer: PooledBuffer) {}

    fn stats(&self) -> ArrayPoolStats {
        ArrayPoolStats {
            buckets: Vec::new(),
            oversized: self.rents.load(Ordering::Relaxed),
            fake: true,
        }
    }

    fn clear(&self) {}
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter(u32);

    impl Resettable for Counter {
        fn reset(&mut self) {
            self.0 = 0;
        }
    }

    #[test]
    fn test_fake_pool_always_allocates() {
        let pool: FakePool<Counter> = FakePool::new("fake");
        let mut lease = pool.rent();
        lease.0 = 5;
        assert!(lease.is_out_of_pool());
        pool.give_back(lease);

        let fresh = pool.rent();
        assert_eq!(fresh.0, 0);
        let stats = pool.stats();
        assert!(stats.fake);
        assert_eq!(stats.total_requests, 2);
    }

    #[test]
    fn test_fake_array_pool_matches_real_lengths() {
        let pool = FakeArrayPool::new();
        assert_eq!(pool.rent(100).len(), 128);
        assert_eq!(pool.rent(3_000_000).len(), 3_000_000);
    }
}
