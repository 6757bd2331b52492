//! Continuous Query & MapReduce
//!
//! Live predicate evaluation over stored items and map/reduce execution
//! over the locally owned key space.
//!
//! ```text
//!  LocalStore ──StoreChange──▶ ActiveQueryAnalyzer
//!                               ├─ type → [ContinuousQuery]
//!                               ├─ type → TypeIndex (bound from the store)
//!                               └─ query id → result keys ──▶ QueryChange
//!
//!  InputProvider (key snapshot, values pulled lazily)
//!        │
//!        ▼
//!  Mapper ─▶ Combiner (optional, per node) ─▶ Reducer (coordinator)
//! ```

mod analyzer;
mod mapreduce;
mod predicate;

pub use analyzer::{
    ActiveQueryAnalyzer, ContinuousQuery, QueryChange, QueryChangeKind, QueryStateInfo,
    QueryStateTransfer,
};
pub use mapreduce::{
    reduce, run_local, Combiner, InputFilter, InputProvider, Intermediate, MapReduceTask, Mapper,
    Reducer, TaskRegistry,
};
pub use predicate::Predicate;
