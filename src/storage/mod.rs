//! Cache Entry & Storage Layer
//!
//! In-memory store for the locally owned key space: expiration, eviction,
//! item locks and payload representation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            LocalStore                                │
//! │  ┌─────────────────────────────┐   ┌──────────────────────────────┐  │
//! │  │ ShardedMap<CacheEntry>      │   │ EvictionPolicy               │  │
//! │  │  shard RwLock = key mutex   │   │  priority, then LRU          │  │
//! │  └─────────────────────────────┘   └──────────────────────────────┘  │
//! │  ┌─────────────────────────────┐   ┌──────────────────────────────┐  │
//! │  │ Clock (system / manual)     │   │ StoreObserver fan-out        │  │
//! │  └─────────────────────────────┘   └──────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//!                 ▲
//!                 │ stored CacheValue
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ DataFormatService (Binary | Object) ── PayloadCodec ── LZ4           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod compression;
pub mod entry;
pub mod format;
pub mod metrics;
pub mod policy;
pub mod shard;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use compression::{CompressionAlgorithm, CompressionManager};
pub use entry::{
    AttributeValue, CacheEntry, CacheValue, DataGroup, Expiration, LockInfo, Priority, QueryInfo,
};
pub use format::{format_service, BinaryFormat, DataFormatService, ObjectFormat, PayloadCodec};
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use policy::{EvictionCandidate, EvictionPolicy, NoEvictionPolicy, PriorityEvictionPolicy};
pub use store::{
    InsertOptions, LocalStore, LockAccess, Outcome, RemovalReason, StoreChange, StoreObserver,
    StoreStats,
};
