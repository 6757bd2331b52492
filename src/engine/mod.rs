//! Cache Engine
//!
//! Ties one node's store, cluster membership and housekeeping together and
//! exposes them through the command boundary.
//!
//! # Architecture
//!
//! ```text
//!   ClientContext + Command
//!            │
//!            ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          CacheInstance                               │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐  │
//! │  │ RequestLedger    │   │ OperationContext │   │ ResponseEnvelope │  │
//! │  │ (track/cancel)   │   │ (pooled)         │   │ (pooled)         │  │
//! │  └────────┬─────────┘   └────────┬─────────┘   └────────▲─────────┘  │
//! │           │                      ▼                      │            │
//! │           │             ┌──────────────────┐            │            │
//! │           │             │   ClusterNode    │────────────┘            │
//! │           │             │   + LocalStore   │                         │
//! │           │             └──────────────────┘                         │
//! │  ┌────────▼─────────────────────────────────────────────────────┐    │
//! │  │ TimeScheduler: expiration sweep, string-pool trim,           │    │
//! │  │ request monitor, presence, failure detector                  │    │
//! │  └──────────────────────────────────────────────────────────────┘    │
//! │                     RuntimeContext (shared services)                 │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

mod command;
mod context;
mod instance;
mod ledger;
mod scheduler;

pub use command::{
    ClientContext, Command, ItemOptions, OperationContext, Response, ResponseEnvelope,
};
pub use context::RuntimeContext;
pub use instance::CacheInstance;
pub use ledger::{LedgerSnapshot, LockReleaser, RequestLedger, RequestMonitor, TrackedRequest};
pub use scheduler::{ScheduledTask, TimeScheduler};
