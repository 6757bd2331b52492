//! Command boundary.
//!
//! A client operation arrives as a [`Command`], runs against the cache
//! instance and leaves as a [`Response`] inside a pooled
//! [`ResponseEnvelope`]. Lock, timeout and missing-key outcomes are
//! responses, not errors.

use std::time::{Duration, Instant};

use crate::cluster::{MapReduceOutcome, StreamOperationResult};
use crate::error::{Error, Result};
use crate::pool::{ObjectPoolKind, Pool, PoolManager, PoolOwned, Resettable};
use crate::query::{InputFilter, Predicate};
use crate::storage::{
    CacheEntry, CacheValue, DataGroup, Expiration, LockAccess, LockInfo, Outcome, Priority,
    QueryInfo,
};

/// Connection a command came in on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub client_id: String,
}

impl ClientContext {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

/// Item attributes supplied with a write
#[derive(Debug, Clone, Default)]
pub struct ItemOptions {
    /// `None` applies the configured default expiration
    pub expiration: Option<Expiration>,
    pub priority: Priority,
    pub group: Option<DataGroup>,
    pub tags: Vec<String>,
    pub query_info: Option<QueryInfo>,
}

#[derive(Debug, Clone)]
pub enum Command {
    Add {
        key: String,
        value: CacheValue,
        options: ItemOptions,
    },
    Insert {
        key: String,
        value: CacheValue,
        options: ItemOptions,
        access: LockAccess,
        expected_version: Option<u64>,
    },
    Get {
        key: String,
        access: LockAccess,
    },
    Remove {
        key: String,
        access: LockAccess,
    },
    Contains {
        key: String,
    },
    Lock {
        key: String,
        lease: Option<Duration>,
        access: LockAccess,
    },
    Unlock {
        key: String,
        /// `None` forces release
        lock_id: Option<u64>,
    },
    Count,
    Clear,
    RemoveGroup {
        group: String,
        subgroup: Option<String>,
    },
    KeysByTag {
        tags: Vec<String>,
        match_all: bool,
    },
    ReadStream {
        key: String,
        offset: u64,
        length: usize,
    },
    RegisterQuery {
        type_name: String,
        predicate: Predicate,
    },
    UnregisterQuery {
        query_id: String,
    },
    Search {
        type_name: String,
        predicate: Predicate,
    },
    MapReduce {
        task: String,
        filter: InputFilter,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Add { .. } => "add",
            Command::Insert { .. } => "insert",
            Command::Get { .. } => "get",
            Command::Remove { .. } => "remove",
            Command::Contains { .. } => "contains",
            Command::Lock { .. } => "lock",
            Command::Unlock { .. } => "unlock",
            Command::Count => "count",
            Command::Clear => "clear",
            Command::RemoveGroup { .. } => "remove_group",
            Command::KeysByTag { .. } => "keys_by_tag",
            Command::ReadStream { .. } => "read_stream",
            Command::RegisterQuery { .. } => "register_query",
            Command::UnregisterQuery { .. } => "unregister_query",
            Command::Search { .. } => "search",
            Command::MapReduce { .. } => "map_reduce",
        }
    }

    /// Key the command targets, if it targets one
    pub fn key(&self) -> Option<&str> {
        match self {
            Command::Add { key, .. }
            | Command::Insert { key, .. }
            | Command::Get { key, .. }
            | Command::Remove { key, .. }
            | Command::Contains { key }
            | Command::Lock { key, .. }
            | Command::Unlock { key, .. }
            | Command::ReadStream { key, .. } => Some(key),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    Ok,
    Version(u64),
    Value { value: CacheValue, version: u64 },
    Removed { value: CacheValue },
    Exists(bool),
    Locked(LockInfo),
    /// Lock acquired by this command
    LockAcquired(LockInfo),
    TimedOut,
    NotFound,
    Count(u64),
    Keys(Vec<String>),
    Stream(StreamOperationResult),
    QueryRegistered { query_id: String, keys: Vec<String> },
    MapReduce(MapReduceOutcome),
}

impl Response {
    pub fn from_version(outcome: Outcome<u64>) -> Self {
        Self::from_outcome(outcome, Response::Version)
    }

    pub fn from_entry(outcome: Outcome<CacheEntry>) -> Self {
        Self::from_outcome(outcome, |entry| Response::Value {
            value: entry.value,
            version: entry.version,
        })
    }

    pub fn from_removed(outcome: Outcome<CacheEntry>) -> Self {
        Self::from_outcome(outcome, |entry| Response::Removed { value: entry.value })
    }

    pub fn from_lock(outcome: Outcome<LockInfo>) -> Self {
        Self::from_outcome(outcome, Response::LockAcquired)
    }

    pub fn from_unit(outcome: Outcome<()>) -> Self {
        Self::from_outcome(outcome, |_| Response::Ok)
    }

    fn from_outcome<T>(outcome: Outcome<T>, done: impl FnOnce(T) -> Response) -> Self {
        match outcome {
            Outcome::Done(value) => done(value),
            Outcome::Locked(lock) => Response::Locked(lock),
            Outcome::TimedOut => Response::TimedOut,
            Outcome::NotFound => Response::NotFound,
        }
    }

    /// Lock conflict as an error, for callers that treat it as one
    pub fn into_locked_error(self, key: &str) -> Result<Response> {
        match self {
            Response::Locked(lock) => Err(Error::ItemLocked {
                key: key.to_string(),
                lock_id: lock.lock_id,
                holder: lock.holder,
            }),
            other => Ok(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Response::Ok => "ok",
            Response::Version(_) => "version",
            Response::Value { .. } => "value",
            Response::Removed { .. } => "removed",
            Response::Exists(_) => "exists",
            Response::Locked(_) => "locked",
            Response::LockAcquired(_) => "lock_acquired",
            Response::TimedOut => "timed_out",
            Response::NotFound => "not_found",
            Response::Count(_) => "count",
            Response::Keys(_) => "keys",
            Response::Stream(_) => "stream",
            Response::QueryRegistered { .. } => "query_registered",
            Response::MapReduce(_) => "map_reduce",
        }
    }
}

// =============================================================================
// Pooled envelopes
// =============================================================================

/// Scratch state of one command execution
#[derive(Debug, Default)]
pub struct OperationContext {
    pub request_id: u64,
    pub client_id: String,
    pub command: &'static str,
    pub key: Option<String>,
    pub started: Option<Instant>,
}

impl OperationContext {
    pub fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |started| started.elapsed())
    }
}

impl Resettable for OperationContext {
    fn reset(&mut self) {
        self.request_id = 0;
        self.client_id.clear();
        self.command = "";
        self.key = None;
        self.started = None;
    }
}

impl PoolOwned for OperationContext {
    const KIND: ObjectPoolKind = ObjectPoolKind::OperationContext;

    fn owning_pool(manager: &PoolManager) -> &dyn Pool<Self> {
        manager.operation_contexts()
    }
}

/// Result of one command, handed back to the caller
#[derive(Debug, Default)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub command: &'static str,
    pub elapsed: Duration,
    pub result: Option<Result<Response>>,
}

impl ResponseEnvelope {
    /// Move the result out, leaving the envelope ready to return
    pub fn take_result(&mut self) -> Result<Response> {
        self.result
            .take()
            .unwrap_or_else(|| Err(Error::Internal("response envelope is empty".into())))
    }
}

impl Resettable for ResponseEnvelope {
    fn reset(&mut self) {
        self.request_id = 0;
        self.command = "";
        self.elapsed = Duration::ZERO;
        self.result = None;
    }
}

impl PoolOwned for ResponseEnvelope {
    const KIND: ObjectPoolKind = ObjectPoolKind::ResponseEnvelope;

    fn owning_pool(manager: &PoolManager) -> &dyn Pool<Self> {
        manager.responses()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;

    #[test]
    fn test_outcomes_map_to_responses() {
        let lock = LockInfo {
            lock_id: 3,
            holder: "c1".into(),
            acquired_at: Utc::now(),
            expires_at: None,
        };
        assert_matches!(Response::from_version(Outcome::Done(4)), Response::Version(4));
        assert_matches!(Response::from_unit(Outcome::TimedOut), Response::TimedOut);
        assert_matches!(
            Response::from_entry(Outcome::NotFound),
            Response::NotFound
        );
        let locked = Response::from_version(Outcome::Locked(lock));
        assert_eq!(locked.name(), "locked");
        assert_matches!(
            locked.into_locked_error("k"),
            Err(Error::ItemLocked { lock_id: 3, .. })
        );
    }

    #[test]
    fn test_returned_envelopes_are_reset() {
        let pools = PoolManager::default();
        let mut envelope = pools.rent::<ResponseEnvelope>();
        envelope.request_id = 9;
        envelope.command = "get";
        envelope.result = Some(Ok(Response::Count(1)));
        pools.give_back(envelope);

        let again = pools.rent::<ResponseEnvelope>();
        assert_eq!(again.request_id, 0);
        assert_eq!(again.command, "");
        assert!(again.result.is_none());
    }

    #[test]
    fn test_command_key_and_name() {
        let command = Command::Get {
            key: "k".into(),
            access: LockAccess::Ignore,
        };
        assert_eq!(command.name(), "get");
        assert_eq!(command.key(), Some("k"));
        assert_eq!(Command::Count.key(), None);
    }
}
