//! Object Pooling Subsystem
//!
//! Reuse of hot-path objects so the request path does not allocate per call.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                  PoolManager (owned by one cache instance)           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Object pools (per ObjectPoolKind)   │  ArrayPool (byte buffers)     │
//! │  ┌──────────────────────────────┐    │  ┌─────────────────────────┐  │
//! │  │ ArrayQueue free list         │    │  │ 16B │ 32B │ ... │ 1MiB  │  │
//! │  │ grows when hit ratio drops   │    │  │ ArrayQueue per bucket   │  │
//! │  └──────────────────────────────┘    │  └─────────────────────────┘  │
//! │                                      │                               │
//! │  StringPool (interned keys, trimmed by a scheduled task)             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! With pooling disabled the manager is built from [`FakePool`] and
//! [`FakeArrayPool`], which allocate on rent and drop on return behind the
//! same traits. Callers never branch on the pooling mode.
//!
//! Rent and return are lock-free; the only exclusive lock is taken when an
//! object pool replaces its free list during growth or clear.

mod array_pool;
mod fake;
mod lease;
mod manager;
mod object_pool;
mod stats;
mod string_pool;

pub use array_pool::{get_bucket, get_length, ArrayPool, BufferPool, PooledBuffer, BUCKET_SIZES};
pub use fake::{FakeArrayPool, FakePool};
pub use lease::{Lease, ObjectPoolKind, Pool, PoolOwned, Resettable};
pub use manager::PoolManager;
pub use object_pool::{ObjectPool, ObjectPoolOptions};
pub use stats::{ArrayPoolStats, BucketStats, ObjectPoolStats, PoolStats, StringPoolStats};
pub use string_pool::{StringPool, StringPoolTrimTask};

/// Largest single growth step of an object pool
pub const MAX_GROWTH_STEP: usize = 100_000;
