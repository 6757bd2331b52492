//! Growable object pool.
//!
//! Tracks hits and misses; when the serving capability (hits / requests)
//! falls to the configured borderline the pool doubles its capacity plus the
//! number of misses, bounded by [`MAX_GROWTH_STEP`] and the maximum capacity.
//! Once the pool is at capacity, misses are served by out-of-pool instances.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use dashmap::DashSet;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::lease::{Lease, Pool, Resettable};
use super::stats::ObjectPoolStats;
use super::MAX_GROWTH_STEP;
use crate::config::PoolingConfig;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Sizing of one object pool
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPoolOptions {
    pub initial_capacity: usize,
    pub max_capacity: usize,
    pub serving_capability_borderline: f64,
}

impl Default for ObjectPoolOptions {
    fn default() -> Self {
        Self::from(&PoolingConfig::default())
    }
}

impl From<&PoolingConfig> for ObjectPoolOptions {
    fn from(config: &PoolingConfig) -> Self {
        Self {
            initial_capacity: config.initial_capacity.max(1),
            max_capacity: config.max_capacity.max(config.initial_capacity.max(1)),
            serving_capability_borderline: config.serving_capability_borderline,
        }
    }
}

/// Lock-free pool of resettable objects
pub struct ObjectPool<T> {
    id: u64,
    name: String,
    options: ObjectPoolOptions,
    /// Free list; replaced wholesale when the pool grows or clears
    free: RwLock<ArrayQueue<T>>,
    capacity: AtomicUsize,
    /// Tracked instances, free or leased
    live: AtomicUsize,
    outstanding: DashSet<u64>,
    next_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    total_requests: AtomicU64,
    out_of_pool: AtomicU64,
    returns: AtomicU64,
    rejected_returns: AtomicU64,
}

impl<T: Resettable + Default + Send + Sync + 'static> ObjectPool<T> {
    /// Create a pool pre-filled to its initial capacity
    pub fn new(name: impl Into<String>, options: ObjectPoolOptions) -> Self {
        let capacity = options.initial_capacity.max(1);
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            free: RwLock::new(Self::filled_queue(capacity, capacity)),
            capacity: AtomicUsize::new(capacity),
            live: AtomicUsize::new(capacity),
            outstanding: DashSet::new(),
            next_seq: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            out_of_pool: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            rejected_returns: AtomicU64::new(0),
            options,
        }
    }

    fn filled_queue(capacity: usize, fill: usize) -> ArrayQueue<T> {
        let queue = ArrayQueue::new(capacity.max(1));
        for _ in 0..fill.min(capacity) {
            let _ = queue.push(T::default());
        }
        queue
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Instances currently waiting in the free list
    pub fn available(&self) -> usize {
        self.free.read().len()
    }

    fn issue(&self, value: T) -> Lease<T> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.outstanding.insert(seq);
        Lease::pooled(value, self.id, seq)
    }

    fn should_grow(&self) -> bool {
        let misses = self.misses.load(Ordering::Relaxed);
        if misses == 0 || self.capacity() >= self.options.max_capacity {
            return false;
        }
        let total = self.total_requests.load(Ordering::Relaxed).max(1);
        let serving = self.hits.load(Ordering::Relaxed) as f64 / total as f64;
        serving <= self.options.serving_capability_borderline
    }

    fn grow(&self) {
        let mut free = self.free.write();
        // Another renter may have grown the pool while we waited
        if !self.should_grow() {
            return;
        }

        let current = self.capacity();
        let misses = self.misses.load(Ordering::Relaxed) as usize;
        let step = (current + misses).min(MAX_GROWTH_STEP);
        let target = (current + step).min(self.options.max_capacity);

        let grown = ArrayQueue::new(target);
        while let Some(item) = free.pop() {
            let _ = grown.push(item);
        }
        *free = grown;

        self.capacity.store(target, Ordering::Release);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.total_requests.store(0, Ordering::Relaxed);

        debug!(pool = %self.name, from = current, to = target, "Object pool grown");
    }
}

impl<T: Resettable + Default + Send + Sync + 'static> Pool<T> for ObjectPool<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn rent(&self) -> Lease<T> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.free.read().pop() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return self.issue(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if self.should_grow() {
            self.grow();
        }

        // Reserve a tracked slot if the pool is still under capacity
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity()).then_some(live + 1)
            })
            .is_ok();

        if reserved {
            self.issue(T::default())
        } else {
            self.out_of_pool.fetch_add(1, Ordering::Relaxed);
            Lease::out_of_pool(T::default())
        }
    }

    fn give_back(&self, lease: Lease<T>) {
        let Lease { mut value, ticket } = lease;

        let Some(ticket) = ticket else {
            // Out-of-pool instances are simply dropped
            return;
        };

        if ticket.pool_id != self.id || self.outstanding.remove(&ticket.seq).is_none() {
            self.rejected_returns.fetch_add(1, Ordering::Relaxed);
            warn!(
                pool = %self.name,
                seq = ticket.seq,
                "Ignoring return of a lease that is not outstanding in this pool"
            );
            return;
        }

        value.reset();
        self.returns.fetch_add(1, Ordering::Relaxed);
        if self.free.read().push(value).is_err() {
            // Free list shrank under a clear(); forget the instance
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn stats(&self) -> ObjectPoolStats {
        ObjectPoolStats {
            name: self.name.clone(),
            capacity: self.capacity(),
            available: self.available(),
            in_use: self.outstanding.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            out_of_pool: self.out_of_pool.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            rejected_returns: self.rejected_returns.load(Ordering::Relaxed),
            serving_capability_borderline: self.options.serving_capability_borderline,
            fake: false,
        }
    }

    fn clear(&self) {
        let mut free = self.free.write();
        let initial = self.options.initial_capacity.max(1);
        *free = Self::filled_queue(initial, initial);
        self.capacity.store(initial, Ordering::Release);
        // Outstanding leases come back as foreign and are dropped
        self.outstanding.clear();
        self.live.store(initial, Ordering::Release);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.total_requests.store(0, Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Scratch {
        items: Vec<u32>,
        label: String,
    }

    impl Resettable for Scratch {
        fn reset(&mut self) {
            self.items.clear();
            self.label.clear();
        }
    }

    fn options(initial: usize, max: usize) -> ObjectPoolOptions {
        ObjectPoolOptions {
            initial_capacity: initial,
            max_capacity: max,
            serving_capability_borderline: 0.5,
        }
    }

    #[test]
    fn test_rent_hits_prefilled_instances() {
        let pool: ObjectPool<Scratch> = ObjectPool::new("scratch", options(4, 4));
        let lease = pool.rent();
        assert!(!lease.is_out_of_pool());
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.available, 3);
    }

    #[test]
    fn test_returned_instance_is_reset() {
        let pool: ObjectPool<Scratch> = ObjectPool::new("scratch", options(1, 1));
        let mut lease = pool.rent();
        lease.items.extend([1, 2, 3]);
        lease.label.push_str("dirty");
        pool.give_back(lease);

        let again = pool.rent();
        assert_eq!(*again, Scratch::default());
    }

    #[test]
    fn test_exhausted_pool_falls_back_to_out_of_pool() {
        let pool: ObjectPool<Scratch> = ObjectPool::new("scratch", options(1, 1));
        let first = pool.rent();
        let second = pool.rent();
        assert!(!first.is_out_of_pool());
        assert!(second.is_out_of_pool());
        assert_eq!(pool.stats().out_of_pool, 1);

        // Out-of-pool returns are dropped, tracked returns refill the pool
        pool.give_back(second);
        pool.give_back(first);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_foreign_return_ignored() {
        let a: ObjectPool<Scratch> = ObjectPool::new("a", options(2, 2));
        let b: ObjectPool<Scratch> = ObjectPool::new("b", options(2, 2));
        let lease = a.rent();
        b.give_back(lease);
        assert_eq!(b.stats().rejected_returns, 1);
        assert_eq!(b.available(), 2);
        // The lease is lost to `a` but `a` stays consistent
        assert_eq!(a.stats().in_use, 1);
    }

    #[test]
    fn test_pool_grows_when_serving_capability_drops() {
        let pool: ObjectPool<Scratch> = ObjectPool::new("scratch", options(2, 1_000));
        let leases = pool.rent_many(6);
        assert_eq!(leases.len(), 6);
        // Hit ratio fell below 0.5, so capacity doubled plus misses
        assert!(pool.capacity() > 2);
        pool.give_back_many(leases);
        assert!(pool.available() >= 2);
    }

    #[test]
    fn test_growth_capped_by_max_capacity() {
        let pool: ObjectPool<Scratch> = ObjectPool::new("scratch", options(2, 3));
        let _leases = pool.rent_many(10);
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    fn test_clear_restores_initial_state() {
        let pool: ObjectPool<Scratch> = ObjectPool::new("scratch", options(2, 100));
        let leases = pool.rent_many(8);
        pool.clear();
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 2);
        pool.give_back_many(leases);
        assert_eq!(pool.available(), 2);
        assert!(pool.stats().rejected_returns >= 1);
    }
}
