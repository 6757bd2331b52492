//! Clustered Topology Layer
//!
//! Routes cache operations to the owning node, replicates writes, tracks
//! membership and moves state when membership changes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            ClusterNode                               │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────────────┐  │
//! │  │ DistributionMap  │  │ MirrorRing       │  │ Peer presence      │  │
//! │  │ 1000 buckets     │  │ backup = next    │  │ sequenced stats    │  │
//! │  └──────────────────┘  │ admission gate   │  └────────────────────┘  │
//! │                        └──────────────────┘                          │
//! │  ┌──────────────────────────────────────────────────────────────┐    │
//! │  │ RpcDispatcher: (Opcode, overload) → handler                  │    │
//! │  └──────────────────────────────────────────────────────────────┘    │
//! └───────────────────────────────┬──────────────────────────────────────┘
//!                                 │ ClusterTransport
//!                                 ▼
//!                 peers (InMemoryNetwork in process and tests)
//! ```
//!
//! # Node lifecycle
//!
//! ```text
//! Joining ──▶ Active ◀──▶ StateTransferInProgress
//!                │
//!                ├──▶ Leaving ──▶ Removed
//!                └──▶ Failed  ──▶ Removed
//! ```

pub mod distribution;
pub mod messages;
mod node;
mod ring;
mod rpc;
mod tasks;
mod transport;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use distribution::{DistributionMap, BUCKET_COUNT};
pub use node::{ClusterNode, MapReduceOutcome};
pub use ring::{CacheNode, MirrorRing, RelinkGuard, WriteAdmission};
pub use rpc::{Opcode, RpcDispatcher, RpcFuture, RpcHandlerFn, RpcTableBuilder};
pub use tasks::{FailureDetectorTask, PresenceTask};
pub use transport::{
    ClusterTransport, InMemoryNetwork, InMemoryTransport, RpcHandler, RpcRequest,
};

// =============================================================================
// Node identity and status
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Joining,
    Active,
    StateTransferInProgress,
    Leaving,
    Failed,
    Removed,
}

impl NodeStatus {
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Joining, Active)
                | (Joining, StateTransferInProgress)
                | (Joining, Failed)
                | (Active, StateTransferInProgress)
                | (StateTransferInProgress, Active)
                | (StateTransferInProgress, Failed)
                | (Active, Leaving)
                | (Active, Failed)
                | (Leaving, Removed)
                | (Failed, Removed)
        )
    }

    /// Serves client operations
    pub fn is_serving(&self) -> bool {
        matches!(self, NodeStatus::Active | NodeStatus::StateTransferInProgress)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Joining => "joining",
            NodeStatus::Active => "active",
            NodeStatus::StateTransferInProgress => "state-transfer",
            NodeStatus::Leaving => "leaving",
            NodeStatus::Failed => "failed",
            NodeStatus::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Load figures carried by presence announcements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub item_count: u64,
    pub data_size: u64,
    pub connected_clients: u64,
}

/// Last known state of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub status: NodeStatus,
    pub stats: NodeStats,
    /// Announcements with a counter at or below the known one are stale
    pub replication_counter: u64,
}

// =============================================================================
// Operation results
// =============================================================================

/// Outcome of an operation sent to one or more nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterOperationResult {
    Completed,
    /// Some targets answered; the operation may be applied on the rest
    PartialTimeout,
    FullTimeout,
}

impl ClusterOperationResult {
    pub fn from_counts(responded: usize, missing: usize) -> Self {
        match (responded, missing) {
            (_, 0) => ClusterOperationResult::Completed,
            (0, _) => ClusterOperationResult::FullTimeout,
            _ => ClusterOperationResult::PartialTimeout,
        }
    }
}

/// Responses gathered from a fan-out
#[derive(Debug)]
pub struct OperationResponse {
    pub result: ClusterOperationResult,
    pub responses: Vec<(NodeId, Bytes)>,
    /// Targets that answered with an error
    pub failures: Vec<(NodeId, Error)>,
    /// Targets that did not answer in time
    pub missing: Vec<NodeId>,
}

impl OperationResponse {
    pub fn responded(&self) -> Vec<String> {
        self.responses
            .iter()
            .map(|(id, _)| id.to_string())
            .chain(self.failures.iter().map(|(id, _)| id.to_string()))
            .collect()
    }

    /// Error for a fan-out that did not complete
    pub fn timeout_error(&self, operation: &str, timeout: Duration) -> Option<Error> {
        match self.result {
            ClusterOperationResult::Completed => None,
            ClusterOperationResult::FullTimeout => Some(Error::OperationTimeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            ClusterOperationResult::PartialTimeout => Some(Error::PartialTimeout {
                operation: operation.to_string(),
                responded: self.responded(),
                missing: self.missing.iter().map(NodeId::to_string).collect(),
            }),
        }
    }
}

/// Chunk of a streamed binary value
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOperationResult {
    pub result: ClusterOperationResult,
    /// Total length of the value, when known
    pub length: u64,
    pub bytes_read: usize,
    pub data: Bytes,
}

impl StreamOperationResult {
    /// Fewer bytes than requested because a node did not answer
    pub fn is_short_read_due_to_cluster(&self) -> bool {
        self.result != ClusterOperationResult::Completed
    }

    /// Fewer bytes than requested because the value ended
    pub fn is_end_of_stream(&self, offset: u64, requested: usize) -> bool {
        self.result == ClusterOperationResult::Completed
            && offset + (self.bytes_read as u64) >= self.length
            && self.bytes_read < requested
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use NodeStatus::*;
        assert!(Joining.can_transition_to(StateTransferInProgress));
        assert!(StateTransferInProgress.can_transition_to(Active));
        assert!(Active.can_transition_to(StateTransferInProgress));
        assert!(Active.can_transition_to(Leaving));
        assert!(Leaving.can_transition_to(Removed));
        assert!(!Removed.can_transition_to(Active));
        assert!(!Leaving.can_transition_to(Active));
    }

    #[test]
    fn test_result_from_counts() {
        assert_eq!(ClusterOperationResult::from_counts(3, 0), ClusterOperationResult::Completed);
        assert_eq!(ClusterOperationResult::from_counts(0, 0), ClusterOperationResult::Completed);
        assert_eq!(
            ClusterOperationResult::from_counts(1, 2),
            ClusterOperationResult::PartialTimeout
        );
        assert_eq!(ClusterOperationResult::from_counts(0, 2), ClusterOperationResult::FullTimeout);
    }

    #[test]
    fn test_partial_timeout_error_lists_nodes() {
        let response = OperationResponse {
            result: ClusterOperationResult::PartialTimeout,
            responses: vec![(NodeId::from("a"), Bytes::new())],
            failures: Vec::new(),
            missing: vec![NodeId::from("b")],
        };
        match response.timeout_error("insert", Duration::from_millis(100)) {
            Some(Error::PartialTimeout {
                responded, missing, ..
            }) => {
                assert_eq!(responded, vec!["a".to_string()]);
                assert_eq!(missing, vec!["b".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stream_short_read_kinds() {
        let end = StreamOperationResult {
            result: ClusterOperationResult::Completed,
            length: 10,
            bytes_read: 4,
            data: Bytes::from_static(b"6789"),
        };
        assert!(end.is_end_of_stream(6, 8));
        assert!(!end.is_short_read_due_to_cluster());

        let unstable = StreamOperationResult {
            result: ClusterOperationResult::FullTimeout,
            length: 0,
            bytes_read: 0,
            data: Bytes::new(),
        };
        assert!(unstable.is_short_read_due_to_cluster());
        assert!(!unstable.is_end_of_stream(0, 8));
    }
}
