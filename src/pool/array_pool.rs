//! Byte-array pool with fixed size classes.
//!
//! A requested length is rounded up to the smallest bucket that fits it, so
//! allocations come from a known set of sizes. Lengths above the largest
//! bucket are allocated exactly and never pooled.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

use super::stats::{ArrayPoolStats, BucketStats};

/// Ascending bucket sizes in bytes
pub const BUCKET_SIZES: &[usize] = &[
    16, 32, 64, 128, 256, 512, 1_024, 2_048, 4_096, 8_192, 16_384, 32_768, 65_536, 131_072,
    262_144, 524_288, 1_048_576,
];

/// Index of the smallest bucket whose size is at least `length`
pub fn get_bucket(length: usize) -> Option<usize> {
    let index = BUCKET_SIZES.partition_point(|&size| size < length);
    (index < BUCKET_SIZES.len()).then_some(index)
}

/// Size of a bucket
pub fn get_length(bucket: usize) -> Option<usize> {
    BUCKET_SIZES.get(bucket).copied()
}

/// Buffer rented from a [`BufferPool`].
///
/// Pooled buffers have the length of their bucket and are zeroed.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
    bucket: Option<usize>,
}

impl PooledBuffer {
    pub(crate) fn new(data: Vec<u8>, bucket: Option<usize>) -> Self {
        Self { data, bucket }
    }

    /// Bucket this buffer belongs to, `None` when allocated outside the pool
    pub fn bucket(&self) -> Option<usize> {
        self.bucket
    }

    /// Growable view, for writers that append
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, Option<usize>) {
        (self.data, self.bucket)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Common interface of real and fake byte-array pools
pub trait BufferPool: Send + Sync {
    /// Rent a zeroed buffer of at least `min_length` bytes
    fn rent(&self, min_length: usize) -> PooledBuffer;

    fn give_back(&self, buffer: PooledBuffer);

    fn stats(&self) -> ArrayPoolStats;

    fn clear(&self);
}

struct Bucket {
    size: usize,
    free: ArrayQueue<Vec<u8>>,
    rents: AtomicU64,
    hits: AtomicU64,
    returns: AtomicU64,
}

/// Bucketed pool of byte arrays
pub struct ArrayPool {
    buckets: Vec<Bucket>,
    oversized: AtomicU64,
}

impl ArrayPool {
    /// `per_bucket` bounds the number of free buffers kept per size class
    pub fn new(per_bucket: usize) -> Self {
        let buckets = BUCKET_SIZES
            .iter()
            .map(|&size| Bucket {
                size,
                free: ArrayQueue::new(per_bucket.max(1)),
                rents: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                returns: AtomicU64::new(0),
            })
            .collect();
        Self {
            buckets,
            oversized: AtomicU64::new(0),
        }
    }
}

impl BufferPool for ArrayPool {
    fn rent(&self, min_length: usize) -> PooledBuffer {
        let Some(index) = get_bucket(min_length) else {
            self.oversized.fetch_add(1, Ordering::Relaxed);
            return PooledBuffer::new(vec![0; min_length], None);
        };

        let bucket = &self.buckets[index];
        bucket.rents.fetch_add(1, Ordering::Relaxed);
        let data = match bucket.free.pop() {
            Some(data) => {
                bucket.hits.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => vec![0; bucket.size],
        };
        PooledBuffer::new(data, Some(index))
    }

    fn give_back(&self, buffer: PooledBuffer) {
        let (mut data, index) = buffer.into_parts();
        let Some(bucket) = index.and_then(|i| self.buckets.get(i)) else {
            return;
        };

        data.clear();
        data.resize(bucket.size, 0);
        bucket.returns.fetch_add(1, Ordering::Relaxed);
        // A full bucket drops the buffer
        let _ = bucket.free.push(data);
    }

    fn stats(&self) -> ArrayPoolStats {
        ArrayPoolStats {
            buckets: self
                .buckets
                .iter()
                .map(|b| BucketStats {
                    size: b.size,
                    available: b.free.len(),
                    rents: b.rents.load(Ordering::Relaxed),
                    hits: b.hits.load(Ordering::Relaxed),
                    returns: b.returns.load(Ordering::Relaxed),
                })
                .collect(),
            oversized: self.oversized.load(Ordering::Relaxed),
            fake: false,
        }
    }

    fn clear(&self) {
        for bucket in &self.buckets {
            while bucket.free.pop().is_some() {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
