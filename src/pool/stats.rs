//! Read-only pool statistics for the monitoring surface.

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectPoolStats {
    pub name: String,
    pub capacity: usize,
    /// Free instances ready to be rented
    pub available: usize,
    pub in_use: usize,
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub out_of_pool: u64,
    pub returns: u64,
    /// Foreign or repeated returns that were ignored
    pub rejected_returns: u64,
    pub serving_capability_borderline: f64,
    pub fake: bool,
}

impl ObjectPoolStats {
    /// Hits over requests since the last growth
    pub fn serving_capability(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.hits as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BucketStats {
    pub size: usize,
    pub available: usize,
    pub rents: u64,
    pub hits: u64,
    pub returns: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArrayPoolStats {
    pub buckets: Vec<BucketStats>,
    /// Rents served outside any bucket
    pub oversized: u64,
    pub fake: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StringPoolStats {
    pub interned: usize,
    pub hits: u64,
    pub misses: u64,
    pub trimmed: u64,
}

/// Aggregate of every pool owned by a [`super::PoolManager`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub fake: bool,
    pub object_pools: Vec<ObjectPoolStats>,
    pub array_pool: ArrayPoolStats,
    pub string_pool: StringPoolStats,
}
