//! meshcache - Clustered In-Memory Cache
//!
//! A distributed key/value cache whose nodes form a cluster and keep data
//! partitioned, replicated or mirrored across members. Items carry
//! expiration, priority, locks, groups, tags and queryable attributes.
//! Continuous queries and MapReduce tasks run over the cluster's data.
//!
//! # Architecture
//!
//! ```text
//!             Command ──▶ CacheInstance ──▶ Response
//!                              │
//!        ┌─────────────────────┼──────────────────────┐
//!        ▼                     ▼                      ▼
//! ┌──────────────┐     ┌──────────────┐      ┌──────────────────┐
//! │ ClusterNode  │────▶│ LocalStore   │─────▶│ Continuous query │
//! │ ring, buckets│     │ shards, locks│      │ analyzer         │
//! │ RPC, transfer│     │ eviction     │      └──────────────────┘
//! └──────┬───────┘     └──────────────┘
//!        │ ClusterTransport
//!        ▼
//!    peer nodes
//! ```
//!
//! # Modules
//!
//! - [`cluster`] - Membership, topologies, routing and state transfer
//! - [`config`] - Cache configuration
//! - [`engine`] - Command boundary, scheduler and request ledger
//! - [`error`] - Error types
//! - [`monitoring`] - Prometheus metrics, health and API call log
//! - [`pool`] - Object, array and string pooling
//! - [`query`] - Continuous queries and MapReduce
//! - [`serialization`] - Compact serialization framework
//! - [`storage`] - Local store, expiration and eviction

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod monitoring;
pub mod pool;
pub mod query;
pub mod serialization;
pub mod storage;

// Re-export commonly used types
pub use cluster::{ClusterNode, InMemoryNetwork, NodeId, NodeStatus};
pub use config::{CacheConfig, TopologyKind};
pub use engine::{CacheInstance, ClientContext, Command, ItemOptions, Response, RuntimeContext};
pub use error::{Error, Result};
pub use storage::{CacheEntry, CacheValue, Expiration, LockAccess, Priority};
