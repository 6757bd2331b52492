//! Cluster node: routing, replication, membership and state transfer.
//!
//! Client-facing operations route by topology:
//!
//! | Topology             | Reads          | Writes and locks                      |
//! |----------------------|----------------|---------------------------------------|
//! | local                | local store    | local store                           |
//! | replicated           | local store    | coordinator, then every member        |
//! | partitioned          | bucket owner   | bucket owner                          |
//! | partitioned-replica  | bucket owner   | bucket owner, then its ring backup    |
//!
//! The coordinator is the member with the lowest ring sequence. RPC handlers
//! always apply on the receiving node; only client-facing calls route.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::distribution::{bucket_of, DistributionMap};
use super::messages::{
    from_json, to_json, Count, GroupRequest, HolderRequest, JoinAccepted, JoinRequest, KeyList, KeyRequest,
    LeaveNotice, LockRequest, MapReducePartial, MapReduceRequest, Member, MembershipView, OpReply,
    PresenceAnnouncement, QueryId, QueryStateRequest, RegisterQuery, ReplicateWrite,
    SearchRequest, StateTransferChunk, StateTransferRequest, StreamReply, StreamRequest, TagRequest,
    TransferComplete, WriteRequest,
};
use super::ring::MirrorRing;
use super::rpc::{Opcode, RpcDispatcher, RpcFuture, RpcTableBuilder};
use super::transport::{ClusterTransport, RpcHandler, RpcRequest};
use super::{
    ClusterOperationResult, NodeId, NodeInfo, NodeStats, NodeStatus, OperationResponse,
    StreamOperationResult,
};
use crate::config::{CacheConfig, StorageConfig, TopologyKind};
use crate::error::{Error, Result};
use crate::query::{
    reduce, run_local, ActiveQueryAnalyzer, ContinuousQuery, InputFilter, Predicate, QueryChange,
    QueryStateTransfer, TaskRegistry,
};
use crate::serialization::{CompactSerializable, SerializationContext, SurrogateSelector};
use crate::storage::{
    CacheEntry, InsertOptions, LocalStore, LockAccess, LockInfo, Outcome, StoreChange,
    StoreObserver,
};

/// Entries per state-transfer or resync chunk
const TRANSFER_CHUNK_SIZE: usize = 256;

/// Replicate overloads
const REPLICA_BUFFER: u16 = 0;
const MAIN_STORE: u16 = 1;

/// StateTransfer overloads
const PULL: u16 = 0;
const PUSH: u16 = 1;

const REQUIRED_RPCS: &[(Opcode, u16)] = &[
    (Opcode::Get, 0),
    (Opcode::Write, 0),
    (Opcode::Remove, 0),
    (Opcode::Lock, 0),
    (Opcode::Contains, 0),
    (Opcode::ReadStream, 0),
    (Opcode::Count, 0),
    (Opcode::Clear, 0),
    (Opcode::RemoveGroup, 0),
    (Opcode::KeysByTag, 0),
    (Opcode::ReleaseLocks, 0),
    (Opcode::Replicate, REPLICA_BUFFER),
    (Opcode::Replicate, MAIN_STORE),
    (Opcode::ReplicaResync, 0),
    (Opcode::Presence, 0),
    (Opcode::Join, 0),
    (Opcode::Membership, 0),
    (Opcode::Leave, 0),
    (Opcode::StateTransfer, PULL),
    (Opcode::StateTransfer, PUSH),
    (Opcode::TransferComplete, 0),
    (Opcode::QueryState, 0),
    (Opcode::RegisterQuery, 0),
    (Opcode::UnregisterQuery, 0),
    (Opcode::Search, 0),
    (Opcode::QueryNotification, 0),
    (Opcode::MapReduce, 0),
];

/// Reduced output of a MapReduce run and how the fan-out went
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapReduceOutcome {
    pub output: BTreeMap<String, Value>,
    pub result: ClusterOperationResult,
}

struct Peer {
    info: NodeInfo,
    last_seen: Instant,
}

/// Buckets still being pulled by a joining node
#[derive(Default)]
struct TransferState {
    active: bool,
    /// Every key comes from this node (replicated join)
    all_from: Option<NodeId>,
    sources: HashMap<u32, NodeId>,
    /// Keys removed locally while their bucket was still being pulled
    tombstones: HashSet<String>,
}

pub struct ClusterNode {
    id: NodeId,
    config: Arc<CacheConfig>,
    status: RwLock<NodeStatus>,
    store: Arc<LocalStore>,
    /// Replica buffers, keyed by the primary they mirror
    replicas: DashMap<NodeId, Arc<LocalStore>>,
    ring: MirrorRing,
    distribution: RwLock<DistributionMap>,
    view_version: AtomicU64,
    peers: DashMap<NodeId, Peer>,
    transport: Arc<dyn ClusterTransport>,
    selector: Arc<SurrogateSelector>,
    wire: SerializationContext,
    rpc: RpcDispatcher<ClusterNode>,
    queries: ActiveQueryAnalyzer,
    tasks: TaskRegistry,
    replication_counter: AtomicU64,
    connected_clients: AtomicU64,
    transfer: Mutex<TransferState>,
    /// Serializes membership changes decided by this node
    membership: tokio::sync::Mutex<()>,
    me: Weak<ClusterNode>,
}

impl ClusterNode {
    pub fn new(
        id: NodeId,
        config: Arc<CacheConfig>,
        store: Arc<LocalStore>,
        transport: Arc<dyn ClusterTransport>,
        selector: Arc<SurrogateSelector>,
    ) -> Result<Arc<Self>> {
        let rpc = rpc_table()?;
        rpc.verify(REQUIRED_RPCS)?;
        let wire = SerializationContext::new(config.cache_name.clone());

        let node = Arc::new_cyclic(|me| ClusterNode {
            id,
            config,
            status: RwLock::new(NodeStatus::Joining),
            store,
            replicas: DashMap::new(),
            ring: MirrorRing::new(),
            distribution: RwLock::new(DistributionMap::from_owners(Vec::new(), 0)),
            view_version: AtomicU64::new(0),
            peers: DashMap::new(),
            transport,
            selector,
            wire,
            rpc,
            queries: ActiveQueryAnalyzer::new(),
            tasks: TaskRegistry::new(),
            replication_counter: AtomicU64::new(0),
            connected_clients: AtomicU64::new(0),
            transfer: Mutex::new(TransferState::default()),
            membership: tokio::sync::Mutex::new(()),
            me: me.clone(),
        });
        node.store.add_observer(Arc::new(NodeObserver {
            node: Arc::downgrade(&node),
        }));
        info!(
            node = %node.id,
            topology = %node.config.topology,
            handlers = node.rpc.methods().len(),
            "Cluster node created"
        );
        Ok(node)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn ring(&self) -> &MirrorRing {
        &self.ring
    }

    pub fn distribution(&self) -> DistributionMap {
        self.distribution.read().clone()
    }

    pub fn view_version(&self) -> u64 {
        self.view_version.load(Ordering::Acquire)
    }

    pub fn queries(&self) -> &ActiveQueryAnalyzer {
        &self.queries
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryChange> {
        self.queries.subscribe()
    }

    /// Entries held for `primary`'s partition
    pub fn replica_len(&self, primary: &NodeId) -> usize {
        self.replicas.get(primary).map_or(0, |buffer| buffer.len())
    }

    pub fn replica_contains(&self, primary: &NodeId, key: &str) -> bool {
        self.replicas
            .get(primary)
            .is_some_and(|buffer| buffer.contains_key(key))
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        let _ = self
            .connected_clients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            item_count: self.store.len() as u64,
            data_size: self.store.used_bytes(),
            connected_clients: self.connected_clients.load(Ordering::Relaxed),
        }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            status: self.status(),
            stats: self.stats(),
            replication_counter: self.replication_counter.load(Ordering::Relaxed),
        }
    }

    /// Last accepted announcement of every known peer
    pub fn peers(&self) -> Vec<NodeInfo> {
        let mut peers: Vec<NodeInfo> = self.peers.iter().map(|p| p.info.clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn peer(&self, id: &NodeId) -> Option<NodeInfo> {
        self.peers.get(id).map(|p| p.info.clone())
    }

    pub fn set_status(&self, next: NodeStatus) -> Result<()> {
        let mut status = self.status.write();
        if *status == next {
            return Ok(());
        }
        if !status.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "node {} cannot go from {} to {}",
                self.id, *status, next
            )));
        }
        debug!(node = %self.id, from = %*status, to = %next, "Node status changed");
        *status = next;
        Ok(())
    }

    fn ensure_serving(&self) -> Result<()> {
        let status = self.status();
        if status.is_serving() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!("node {} is {}", self.id, status)))
        }
    }

    fn topology(&self) -> TopologyKind {
        self.config.topology
    }

    // =========================================================================
    // Routing
    // =========================================================================

    fn others(&self) -> Vec<NodeId> {
        self.ring
            .order()
            .into_iter()
            .filter(|id| id != &self.id)
            .collect()
    }

    /// Member with the lowest ring sequence
    pub fn coordinator(&self) -> NodeId {
        self.ring
            .order()
            .into_iter()
            .next()
            .unwrap_or_else(|| self.id.clone())
    }

    fn owner_of(&self, key: &str) -> NodeId {
        self.distribution
            .read()
            .owner_of(key)
            .cloned()
            .unwrap_or_else(|| self.id.clone())
    }

    fn read_target(&self, key: &str) -> NodeId {
        match self.topology() {
            TopologyKind::Local | TopologyKind::Replicated => self.id.clone(),
            TopologyKind::Partitioned | TopologyKind::PartitionedReplica => self.owner_of(key),
        }
    }

    fn write_target(&self, key: &str) -> NodeId {
        match self.topology() {
            TopologyKind::Local => self.id.clone(),
            TopologyKind::Replicated => self.coordinator(),
            TopologyKind::Partitioned | TopologyKind::PartitionedReplica => self.owner_of(key),
        }
    }

    /// Stored here but owned elsewhere after a membership change
    fn is_migrating(&self, key: &str) -> bool {
        self.topology().is_partitioned() && self.owner_of(key) != self.id
    }

    // =========================================================================
    // Transport helpers
    // =========================================================================

    fn encode<T: CompactSerializable>(&self, message: &T) -> Result<Bytes> {
        self.selector.serialize(message, &self.wire)
    }

    fn decode<T: CompactSerializable>(&self, payload: &[u8]) -> Result<T> {
        self.selector.deserialize_value(payload, &self.wire)
    }

    async fn call(&self, target: &NodeId, opcode: Opcode, overload: u16, payload: Bytes) -> Result<Bytes> {
        let timeout = self.config.operation_timeout();
        let request = RpcRequest::new(self.id.clone(), opcode, payload).with_overload(overload);
        tokio::time::timeout(timeout, self.transport.send(target, request))
            .await
            .map_err(|_| Error::OperationTimeout {
                operation: format!("{:?}", opcode),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    async fn broadcast(
        &self,
        targets: &[NodeId],
        opcode: Opcode,
        overload: u16,
        payload: Bytes,
    ) -> OperationResponse {
        let timeout = self.config.operation_timeout();
        let calls = targets.iter().map(|target| {
            let request =
                RpcRequest::new(self.id.clone(), opcode, payload.clone()).with_overload(overload);
            async move {
                let outcome = tokio::time::timeout(timeout, self.transport.send(target, request)).await;
                (target.clone(), outcome)
            }
        });

        let mut response = OperationResponse {
            result: ClusterOperationResult::Completed,
            responses: Vec::new(),
            failures: Vec::new(),
            missing: Vec::new(),
        };
        for (target, outcome) in join_all(calls).await {
            match outcome {
                Ok(Ok(reply)) => response.responses.push((target, reply)),
                Ok(Err(Error::NodeUnreachable(_))) | Err(_) => response.missing.push(target),
                Ok(Err(e)) => response.failures.push((target, e)),
            }
        }
        response.result = ClusterOperationResult::from_counts(
            response.responses.len() + response.failures.len(),
            response.missing.len(),
        );
        response
    }

    /// Replies of a fan-out this node also served locally
    fn gathered(&self, response: OperationResponse, operation: &str) -> Result<Vec<(NodeId, Bytes)>> {
        if let Some((node, error)) = response.failures.into_iter().next() {
            debug!(node = %node, operation, error = %error, "Peer failed fan-out");
            return Err(error);
        }
        if !response.missing.is_empty() {
            return Err(self.partial_timeout(
                operation,
                response.responses.iter().map(|(id, _)| id.clone()).collect(),
                response.missing,
            ));
        }
        Ok(response.responses)
    }

    fn partial_timeout(&self, operation: &str, responded: Vec<NodeId>, missing: Vec<NodeId>) -> Error {
        let mut answered = vec![self.id.to_string()];
        answered.extend(responded.iter().map(NodeId::to_string));
        Error::PartialTimeout {
            operation: operation.to_string(),
            responded: answered,
            missing: missing.iter().map(NodeId::to_string).collect(),
        }
    }

    // =========================================================================
    // Client operations
    // =========================================================================

    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn get(&self, key: &str, access: LockAccess) -> Result<Outcome<CacheEntry>> {
        self.ensure_serving()?;
        let target = self.read_target(key);
        if target == self.id {
            return self.local_get(key, access).await;
        }
        let request = KeyRequest {
            key: key.to_string(),
            access,
        };
        let reply = self.call(&target, Opcode::Get, 0, self.encode(&request)?).await?;
        self.decode::<OpReply>(&reply)?.into_entry()
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        self.ensure_serving()?;
        let target = self.read_target(key);
        if target == self.id {
            return self.local_contains(key).await;
        }
        let request = KeyRequest {
            key: key.to_string(),
            access: LockAccess::Ignore,
        };
        let reply = self.call(&target, Opcode::Contains, 0, self.encode(&request)?).await?;
        Ok(from_json::<Count>(&reply)?.count > 0)
    }

    /// Add a new key, failing if it exists
    #[instrument(skip(self, entry), fields(node = %self.id, key = %entry.key))]
    pub async fn add(&self, entry: CacheEntry) -> Result<u64> {
        let outcome = self
            .write(WriteRequest {
                entry,
                add: true,
                access: LockAccess::Ignore,
                expected_version: None,
            })
            .await?;
        match outcome {
            Outcome::Done(version) => Ok(version),
            other => Err(Error::Internal(format!("add returned {}", other.name()))),
        }
    }

    #[instrument(skip(self, entry, options), fields(node = %self.id, key = %entry.key))]
    pub async fn insert(&self, entry: CacheEntry, options: InsertOptions) -> Result<Outcome<u64>> {
        self.write(WriteRequest {
            entry,
            add: false,
            access: options.access,
            expected_version: options.expected_version,
        })
        .await
    }

    async fn write(&self, request: WriteRequest) -> Result<Outcome<u64>> {
        self.ensure_serving()?;
        let target = self.write_target(&request.entry.key);
        if target == self.id {
            return self.apply_write(request).await;
        }
        let reply = self.call(&target, Opcode::Write, 0, self.encode(&request)?).await?;
        self.decode::<OpReply>(&reply)?.into_version()
    }

    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn remove(&self, key: &str, access: LockAccess) -> Result<Outcome<CacheEntry>> {
        self.ensure_serving()?;
        let target = self.write_target(key);
        if target == self.id {
            return self.apply_remove(key, access).await;
        }
        let request = KeyRequest {
            key: key.to_string(),
            access,
        };
        let reply = self.call(&target, Opcode::Remove, 0, self.encode(&request)?).await?;
        self.decode::<OpReply>(&reply)?.into_entry()
    }

    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn lock(
        &self,
        key: &str,
        holder: &str,
        lease: Option<Duration>,
        access: LockAccess,
    ) -> Result<Outcome<LockInfo>> {
        self.ensure_serving()?;
        let request = LockRequest {
            key: key.to_string(),
            holder: holder.to_string(),
            lease,
            access,
            release: false,
            lock_id: None,
        };
        let target = self.write_target(key);
        if target == self.id {
            return self.apply_lock(&request).await;
        }
        let reply = self.call(&target, Opcode::Lock, 0, self.encode(&request)?).await?;
        self.decode::<OpReply>(&reply)?.into_lock()
    }

    /// Release an item lock; `None` forces release
    pub async fn unlock(&self, key: &str, lock_id: Option<u64>) -> Result<Outcome<()>> {
        self.ensure_serving()?;
        let request = LockRequest {
            key: key.to_string(),
            holder: String::new(),
            lease: None,
            access: LockAccess::Ignore,
            release: true,
            lock_id,
        };
        let target = self.write_target(key);
        if target == self.id {
            return self.apply_unlock(&request).await;
        }
        let reply = self.call(&target, Opcode::Lock, 0, self.encode(&request)?).await?;
        self.decode::<OpReply>(&reply)?.into_unit()
    }

    /// Item count across the cluster
    pub async fn count(&self) -> Result<u64> {
        self.ensure_serving()?;
        let local = self.store.len() as u64;
        if !self.topology().is_partitioned() {
            return Ok(local);
        }
        let response = self.broadcast(&self.others(), Opcode::Count, 0, Bytes::new()).await;
        let mut total = local;
        for (_, reply) in self.gathered(response, "count")? {
            total += from_json::<Count>(&reply)?.count;
        }
        Ok(total)
    }

    pub async fn clear(&self) -> Result<()> {
        self.ensure_serving()?;
        self.clear_local();
        if self.topology().is_clustered() {
            let response = self.broadcast(&self.others(), Opcode::Clear, 0, Bytes::new()).await;
            self.gathered(response, "clear")?;
        }
        Ok(())
    }

    /// Remove a data group everywhere, returning the removed keys
    pub async fn remove_group(&self, group: &str, subgroup: Option<&str>) -> Result<Vec<String>> {
        self.ensure_serving()?;
        let mut keys = self.remove_group_local(group, subgroup).await?;
        if self.topology().is_clustered() {
            let request = GroupRequest {
                group: group.to_string(),
                subgroup: subgroup.map(str::to_string),
            };
            let response = self
                .broadcast(&self.others(), Opcode::RemoveGroup, 0, to_json(&request)?)
                .await;
            for (_, reply) in self.gathered(response, "remove_group")? {
                keys.extend(from_json::<KeyList>(&reply)?.keys);
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub async fn keys_by_tag(&self, tags: &[String], match_all: bool) -> Result<Vec<String>> {
        self.ensure_serving()?;
        let mut keys: Vec<String> = self
            .store
            .keys_by_tag(tags, match_all)
            .iter()
            .map(|k| k.to_string())
            .collect();
        if self.topology().is_partitioned() {
            let request = TagRequest {
                tags: tags.to_vec(),
                match_all,
            };
            let response = self
                .broadcast(&self.others(), Opcode::KeysByTag, 0, to_json(&request)?)
                .await;
            for (_, reply) in self.gathered(response, "keys_by_tag")? {
                keys.extend(from_json::<KeyList>(&reply)?.keys);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Release the item locks `holder` has anywhere in the cluster,
    /// replica copies included. Returns how many were released.
    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn release_locks_held_by(&self, holder: &str) -> Result<usize> {
        let mut released = self.release_locks_local(holder);
        if self.topology().is_clustered() {
            let request = HolderRequest {
                holder: holder.to_string(),
            };
            let response = self
                .broadcast(&self.others(), Opcode::ReleaseLocks, 0, to_json(&request)?)
                .await;
            for (_, reply) in self.gathered(response, "release_locks")? {
                released += from_json::<Count>(&reply)?.count as usize;
            }
        }
        Ok(released)
    }

    /// Read `length` bytes of a binary value starting at `offset`.
    ///
    /// A silent owner yields `FullTimeout` with no data rather than an error,
    /// so callers can tell it from the end of the value.
    pub async fn read_stream(&self, key: &str, offset: u64, length: usize) -> Result<StreamOperationResult> {
        self.ensure_serving()?;
        let target = self.read_target(key);
        let reply = if target == self.id {
            self.local_read_stream(key, offset, length)?
        } else {
            let request = StreamRequest {
                key: key.to_string(),
                offset,
                length,
            };
            match self
                .call(&target, Opcode::ReadStream, 0, to_json(&request)?)
                .await
            {
                Ok(reply) => from_json::<StreamReply>(&reply)?,
                Err(Error::OperationTimeout { .. }) | Err(Error::NodeUnreachable(_)) => {
                    warn!(node = %self.id, owner = %target, key, "Stream read got no answer");
                    return Ok(StreamOperationResult {
                        result: ClusterOperationResult::FullTimeout,
                        length: 0,
                        bytes_read: 0,
                        data: Bytes::new(),
                    });
                }
                Err(e) => return Err(e),
            }
        };
        Ok(StreamOperationResult {
            result: ClusterOperationResult::Completed,
            length: reply.length,
            bytes_read: reply.data.len(),
            data: Bytes::from(reply.data),
        })
    }

    // =========================================================================
    // Continuous queries and MapReduce
    // =========================================================================

    /// Register a continuous query originating here, returning it and its
    /// initial result set
    pub async fn register_query(
        &self,
        type_name: &str,
        predicate: Predicate,
    ) -> Result<(ContinuousQuery, Vec<String>)> {
        self.ensure_serving()?;
        let query = ContinuousQuery::new(type_name, predicate, self.id.to_string());
        let mut keys = self.queries.register(query.clone(), &self.store)?;
        if self.topology().is_partitioned() {
            let request = RegisterQuery {
                query: query.clone(),
            };
            let response = self
                .broadcast(&self.others(), Opcode::RegisterQuery, 0, to_json(&request)?)
                .await;
            for (_, reply) in self.gathered(response, "register_query")? {
                keys.extend(from_json::<KeyList>(&reply)?.keys);
            }
        }
        keys.sort();
        Ok((query, keys))
    }

    pub async fn unregister_query(&self, query_id: &str) -> Result<()> {
        self.queries.unregister(query_id)?;
        if self.topology().is_partitioned() {
            let request = QueryId {
                query_id: query_id.to_string(),
            };
            let response = self
                .broadcast(&self.others(), Opcode::UnregisterQuery, 0, to_json(&request)?)
                .await;
            if response.result != ClusterOperationResult::Completed || !response.failures.is_empty() {
                warn!(
                    node = %self.id,
                    query_id,
                    missing = response.missing.len(),
                    failed = response.failures.len(),
                    "Query not unregistered everywhere"
                );
            }
        }
        Ok(())
    }

    pub async fn search(&self, type_name: &str, predicate: &Predicate) -> Result<Vec<String>> {
        self.ensure_serving()?;
        let mut keys = ActiveQueryAnalyzer::search(type_name, predicate, &self.store);
        if self.topology().is_partitioned() {
            let request = SearchRequest {
                type_name: type_name.to_string(),
                predicate: predicate.clone(),
            };
            let response = self
                .broadcast(&self.others(), Opcode::Search, 0, to_json(&request)?)
                .await;
            for (_, reply) in self.gathered(response, "search")? {
                keys.extend(from_json::<KeyList>(&reply)?.keys);
            }
            keys.sort();
        }
        Ok(keys)
    }

    /// Run a registered task over the cluster's entries.
    ///
    /// Owners that do not answer in time are left out of the reduction and
    /// reported through the outcome's result.
    #[instrument(skip(self, filter), fields(node = %self.id))]
    pub async fn run_map_reduce(&self, task_name: &str, filter: InputFilter) -> Result<MapReduceOutcome> {
        self.ensure_serving()?;
        let task = self.tasks.get(task_name)?;
        let mut partials = vec![run_local(&task, &self.store, &filter)];
        let mut result = ClusterOperationResult::Completed;

        if self.topology().is_partitioned() {
            let request = MapReduceRequest {
                task: task_name.to_string(),
                filter,
            };
            let response = self
                .broadcast(&self.others(), Opcode::MapReduce, 0, to_json(&request)?)
                .await;
            if let Some((node, error)) = response.failures.into_iter().next() {
                warn!(node = %node, task = task_name, error = %error, "Map phase failed on peer");
                return Err(error);
            }
            if !response.missing.is_empty() {
                warn!(task = task_name, missing = ?response.missing, "Map phase partially timed out");
                result = ClusterOperationResult::PartialTimeout;
            }
            for (_, reply) in response.responses {
                partials.push(from_json::<MapReducePartial>(&reply)?.output);
            }
        }

        Ok(MapReduceOutcome {
            output: reduce(&task, partials),
            result,
        })
    }

    // =========================================================================
    // Local application (owner side)
    // =========================================================================

    async fn local_get(&self, key: &str, access: LockAccess) -> Result<Outcome<CacheEntry>> {
        let outcome = self.store.get(key, access).await;
        if matches!(outcome, Outcome::NotFound) {
            if let Some(source) = self.pending_source(key) {
                let request = KeyRequest {
                    key: key.to_string(),
                    access,
                };
                let reply = self.call(&source, Opcode::Get, 0, self.encode(&request)?).await?;
                return self.decode::<OpReply>(&reply)?.into_entry();
            }
        }
        Ok(outcome)
    }

    async fn local_contains(&self, key: &str) -> Result<bool> {
        if self.store.contains_key(key) {
            return Ok(true);
        }
        match self.pending_source(key) {
            Some(source) => {
                let request = KeyRequest {
                    key: key.to_string(),
                    access: LockAccess::Ignore,
                };
                let reply = self.call(&source, Opcode::Contains, 0, self.encode(&request)?).await?;
                Ok(from_json::<Count>(&reply)?.count > 0)
            }
            None => Ok(false),
        }
    }

    fn local_read_stream(&self, key: &str, offset: u64, length: usize) -> Result<StreamReply> {
        let Some(entry) = self.store.peek(key) else {
            return Ok(StreamReply {
                length: 0,
                data: Vec::new(),
            });
        };
        let bytes = entry
            .value
            .as_binary()
            .ok_or_else(|| Error::InvalidState(format!("value of {} is not binary", key)))?;
        let total = bytes.len();
        let start = (offset as usize).min(total);
        let end = start.saturating_add(length).min(total);
        Ok(StreamReply {
            length: total as u64,
            data: bytes[start..end].to_vec(),
        })
    }

    async fn apply_write(&self, request: WriteRequest) -> Result<Outcome<u64>> {
        let key = request.entry.key.to_string();
        let WriteRequest {
            entry,
            add,
            access,
            expected_version,
        } = request;
        self.replicated(&key, "write", async move {
            if add {
                self.store.add(entry).map(Outcome::Done)
            } else {
                self.store
                    .insert(
                        entry,
                        InsertOptions {
                            access,
                            expected_version,
                        },
                    )
                    .await
            }
        })
        .await
    }

    async fn apply_remove(&self, key: &str, access: LockAccess) -> Result<Outcome<CacheEntry>> {
        {
            let mut transfer = self.transfer.lock();
            if transfer.active {
                transfer.tombstones.insert(key.to_string());
            }
        }
        self.replicated(key, "remove", async { Ok(self.store.remove(key, access).await) })
            .await
    }

    async fn apply_lock(&self, request: &LockRequest) -> Result<Outcome<LockInfo>> {
        self.replicated(&request.key, "lock", async {
            Ok(self
                .store
                .lock(&request.key, &request.holder, request.lease, request.access)
                .await)
        })
        .await
    }

    async fn apply_unlock(&self, request: &LockRequest) -> Result<Outcome<()>> {
        self.replicated(&request.key, "unlock", async {
            Ok(self.store.unlock(&request.key, request.lock_id))
        })
        .await
    }

    /// Apply a mutation of `key` here, then copy its resulting state to the
    /// replicas the topology requires before acknowledging
    async fn replicated<T, F>(&self, key: &str, operation: &str, apply: F) -> Result<Outcome<T>>
    where
        F: std::future::Future<Output = Result<Outcome<T>>>,
    {
        match self.topology() {
            TopologyKind::PartitionedReplica => {
                let admission = self.ring.admit_write(&self.id).await;
                let outcome = apply.await?;
                if outcome.is_done() {
                    if let Some(backup) = &admission.backup {
                        self.mirror(backup, key, operation).await?;
                    }
                }
                Ok(outcome)
            }
            TopologyKind::Replicated => {
                let outcome = apply.await?;
                if outcome.is_done() {
                    let message = self.replica_message(key);
                    let response = self
                        .broadcast(&self.others(), Opcode::Replicate, MAIN_STORE, self.encode(&message)?)
                        .await;
                    self.gathered(response, operation)?;
                }
                Ok(outcome)
            }
            TopologyKind::Local | TopologyKind::Partitioned => apply.await,
        }
    }

    fn replica_message(&self, key: &str) -> ReplicateWrite {
        ReplicateWrite {
            primary: self.id.to_string(),
            key: key.to_string(),
            entry: self.store.peek(key),
        }
    }

    /// Copy the current state of `key` to `backup`
    async fn mirror(&self, backup: &NodeId, key: &str, operation: &str) -> Result<()> {
        let message = self.replica_message(key);
        match self
            .call(backup, Opcode::Replicate, REPLICA_BUFFER, self.encode(&message)?)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::OperationTimeout { .. }) | Err(Error::NodeUnreachable(_)) => {
                warn!(node = %self.id, backup = %backup, key, operation, "Backup did not acknowledge");
                Err(self.partial_timeout(operation, Vec::new(), vec![backup.clone()]))
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_group_local(&self, group: &str, subgroup: Option<&str>) -> Result<Vec<String>> {
        if self.topology() != TopologyKind::PartitionedReplica {
            return Ok(self
                .store
                .remove_group(group, subgroup)
                .iter()
                .map(|k| k.to_string())
                .collect());
        }
        let admission = self.ring.admit_write(&self.id).await;
        let keys: Vec<String> = self
            .store
            .remove_group(group, subgroup)
            .iter()
            .map(|k| k.to_string())
            .collect();
        if let Some(backup) = &admission.backup {
            for key in &keys {
                self.mirror(backup, key, "remove_group").await?;
            }
        }
        Ok(keys)
    }

    fn release_locks_local(&self, holder: &str) -> usize {
        let mut released = self.store.release_locks_held_by(holder);
        for buffer in self.replicas.iter() {
            released += buffer.release_locks_held_by(holder);
        }
        released
    }

    fn clear_local(&self) {
        self.store.clear();
        for buffer in self.replicas.iter() {
            buffer.clear();
        }
    }

    fn replica_buffer(&self, primary: &NodeId) -> Arc<LocalStore> {
        self.replicas
            .entry(primary.clone())
            .or_insert_with(|| {
                let config = StorageConfig {
                    capacity_bytes: 0,
                    ..self.config.storage.clone()
                };
                Arc::new(LocalStore::new(
                    format!("{}-replica-{}", self.config.cache_name, primary),
                    &config,
                    self.store.clock().clone(),
                ))
            })
            .clone()
    }

    fn promote_replica(&self, failed: &NodeId) -> usize {
        let Some((_, buffer)) = self.replicas.remove(failed) else {
            warn!(node = %self.id, failed = %failed, "No replica buffer to promote");
            return 0;
        };
        let mut promoted = 0;
        for entry in buffer.entries() {
            if self.store.contains_key(&entry.key) {
                continue;
            }
            let key = entry.key.clone();
            match self.store.load_entry(entry) {
                Ok(()) => promoted += 1,
                Err(e) => warn!(node = %self.id, key = %key, error = %e, "Failed to promote replica"),
            }
        }
        info!(node = %self.id, failed = %failed, promoted, "Promoted replica buffer");
        promoted
    }

    /// Replace `backup`'s buffer of this node with the current store
    async fn resync_backup(&self, backup: &NodeId) -> Result<()> {
        let mut entries = self.store.entries();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let total = entries.len();
        let mut chunks: Vec<Vec<CacheEntry>> = entries
            .chunks(TRANSFER_CHUNK_SIZE)
            .map(<[CacheEntry]>::to_vec)
            .collect();
        if chunks.is_empty() {
            chunks.push(Vec::new());
        }
        let last = chunks.len() - 1;
        for (index, entries) in chunks.into_iter().enumerate() {
            let chunk = StateTransferChunk {
                primary: self.id.to_string(),
                entries,
                chunk: index as u32,
                has_more: index < last,
            };
            self.call(backup, Opcode::ReplicaResync, 0, self.encode(&chunk)?)
                .await?;
        }
        debug!(node = %self.id, backup = %backup, entries = total, "Resynchronized backup");
        Ok(())
    }

    async fn resync_backup_logged(&self) {
        if self.topology() != TopologyKind::PartitionedReplica {
            return;
        }
        if let Some(backup) = self.ring.backup_of(&self.id) {
            if let Err(e) = self.resync_backup(&backup).await {
                warn!(node = %self.id, backup = %backup, error = %e, "Backup resync failed");
            }
        }
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Start as the only member
    pub async fn bootstrap(&self) -> Result<()> {
        let guard = self.ring.relink().await;
        guard.install(&[Member {
            id: self.id.clone(),
            sequence: 1,
        }]);
        if self.topology().is_partitioned() {
            *self.distribution.write() = DistributionMap::round_robin(&[self.id.clone()]);
        }
        self.view_version.store(1, Ordering::Release);
        drop(guard);
        self.set_status(NodeStatus::Active)?;
        info!(node = %self.id, topology = %self.topology(), "Bootstrapped cluster");
        Ok(())
    }

    /// Join through `seed`, pull owned state, then go active.
    ///
    /// A pull that keeps failing after bounded retries leaves the node
    /// `Failed` and returns `StateTransferFailed`.
    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn join(&self, seed: &NodeId) -> Result<()> {
        if !self.topology().is_clustered() {
            return Err(Error::InvalidState("local caches do not join clusters".into()));
        }
        if self.status() != NodeStatus::Joining {
            return Err(Error::InvalidState(format!(
                "node {} is {}, not joining",
                self.id,
                self.status()
            )));
        }
        let request = JoinRequest {
            node: self.id.clone(),
        };
        let reply = self.call(seed, Opcode::Join, 0, to_json(&request)?).await?;
        let accepted: JoinAccepted = from_json(&reply)?;
        self.apply_membership(accepted.view).await?;
        self.set_status(NodeStatus::StateTransferInProgress)?;

        self.begin_transfer(&accepted.sources);
        let pulled = self.pull_state(&accepted.sources).await;
        if let Err(e) = pulled {
            self.finish_transfer();
            self.set_status(NodeStatus::Failed)?;
            return Err(e);
        }

        let coordinator = self.coordinator();
        if let Err(e) = self.import_queries(&coordinator).await {
            warn!(node = %self.id, coordinator = %coordinator, error = %e, "Query state import failed");
        }
        for (source, buckets) in &accepted.sources {
            let notice = TransferComplete {
                node: self.id.clone(),
                buckets: buckets.clone(),
            };
            if let Err(e) = self
                .call(source, Opcode::TransferComplete, 0, to_json(&notice)?)
                .await
            {
                warn!(node = %self.id, source = %source, error = %e, "Transfer completion not delivered");
            }
        }
        self.finish_transfer();

        {
            let _guard = self.ring.relink().await;
            self.resync_backup_logged().await;
        }
        self.set_status(NodeStatus::Active)?;
        info!(node = %self.id, items = self.store.len(), members = self.ring.len(), "Joined cluster");
        Ok(())
    }

    /// Leave gracefully, handing owned entries to their next owners
    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn leave(&self) -> Result<()> {
        self.set_status(NodeStatus::Leaving)?;
        let _membership = self.membership.lock().await;

        let remaining: Vec<Member> = self
            .ring
            .members()
            .into_iter()
            .filter(|m| m.id != self.id)
            .collect();
        let order: Vec<NodeId> = remaining.iter().map(|m| m.id.clone()).collect();
        let buckets = if self.topology().is_partitioned() && !order.is_empty() {
            let next = self.distribution.read().rebalance(&order);
            self.hand_off(&next).await;
            next.owners().to_vec()
        } else {
            Vec::new()
        };

        let view = MembershipView {
            members: remaining,
            buckets,
            version: self.view_version() + 1,
        };
        let response = self
            .broadcast(&order, Opcode::Membership, 0, to_json(&view)?)
            .await;
        if !response.missing.is_empty() {
            warn!(node = %self.id, missing = ?response.missing, "Departure view not acknowledged by all");
        }
        let notice = LeaveNotice {
            node: self.id.clone(),
        };
        self.broadcast(&order, Opcode::Leave, 0, to_json(&notice)?).await;

        self.ring.leave(&self.id).await?;
        self.peers.clear();
        self.replicas.clear();
        self.set_status(NodeStatus::Removed)?;
        info!(node = %self.id, "Left cluster");
        Ok(())
    }

    /// Push owned entries to their owners under `next`
    async fn hand_off(&self, next: &DistributionMap) {
        let mut by_owner: BTreeMap<NodeId, Vec<CacheEntry>> = BTreeMap::new();
        for entry in self.store.entries() {
            if let Some(owner) = next.owner_of(&entry.key) {
                by_owner.entry(owner.clone()).or_default().push(entry);
            }
        }
        for (owner, entries) in by_owner {
            let total = entries.len();
            let chunks: Vec<&[CacheEntry]> = entries.chunks(TRANSFER_CHUNK_SIZE).collect();
            let last = chunks.len().saturating_sub(1);
            for (index, slice) in chunks.into_iter().enumerate() {
                let chunk = StateTransferChunk {
                    primary: self.id.to_string(),
                    entries: slice.to_vec(),
                    chunk: index as u32,
                    has_more: index < last,
                };
                let sent = match self.encode(&chunk) {
                    Ok(payload) => self.call(&owner, Opcode::StateTransfer, PUSH, payload).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!(node = %self.id, owner = %owner, error = %e, "Hand-off chunk lost");
                }
            }
            debug!(node = %self.id, owner = %owner, entries = total, "Handed off entries");
        }
    }

    async fn admit_joiner(&self, joiner: NodeId) -> Result<JoinAccepted> {
        let _membership = self.membership.lock().await;
        if self.ring.contains(&joiner) {
            return Err(Error::ClusterMembership(format!("{} is already a member", joiner)));
        }

        let mut members = self.ring.members();
        members.push(Member {
            id: joiner.clone(),
            sequence: self.ring.next_sequence(),
        });
        let order: Vec<NodeId> = members.iter().map(|m| m.id.clone()).collect();
        let (buckets, sources) = if self.topology().is_partitioned() {
            let previous = self.distribution();
            let next = previous.rebalance(&order);
            let sources = next.gained_by(&previous, &joiner);
            (next.owners().to_vec(), sources)
        } else {
            (Vec::new(), BTreeMap::from([(self.id.clone(), Vec::new())]))
        };
        let view = MembershipView {
            members,
            buckets,
            version: self.view_version() + 1,
        };

        let others: Vec<NodeId> = order
            .into_iter()
            .filter(|id| id != &self.id && id != &joiner)
            .collect();
        let response = self
            .broadcast(&others, Opcode::Membership, 0, to_json(&view)?)
            .await;
        if !response.missing.is_empty() {
            warn!(joiner = %joiner, missing = ?response.missing, "Join view not acknowledged by all");
        }
        self.apply_membership(view.clone()).await?;
        info!(node = %self.id, joiner = %joiner, members = view.members.len(), "Admitted node");
        Ok(JoinAccepted { view, sources })
    }

    /// Install a membership view unless a newer one is already in place
    async fn apply_membership(&self, view: MembershipView) -> Result<()> {
        let guard = self.ring.relink().await;
        if view.version <= self.view_version() {
            debug!(node = %self.id, version = view.version, "Ignoring stale membership view");
            return Ok(());
        }
        let previous_backup = self.ring.backup_of(&self.id);
        guard.install(&view.members);
        if self.topology().is_partitioned() {
            *self.distribution.write() = DistributionMap::from_owners(view.buckets, view.version);
        }
        self.view_version.store(view.version, Ordering::Release);
        self.sync_peers();

        let backup = self.ring.backup_of(&self.id);
        if backup != previous_backup && self.status().is_serving() {
            self.resync_backup_logged().await;
        }
        drop(guard);
        debug!(node = %self.id, version = view.version, members = self.ring.len(), "Applied membership view");
        Ok(())
    }

    /// Align peer tracking and replica buffers with the ring
    fn sync_peers(&self) {
        let members: HashSet<NodeId> = self.others().into_iter().collect();
        self.peers.retain(|id, _| members.contains(id));
        for id in &members {
            self.peers.entry(id.clone()).or_insert_with(|| Peer {
                info: NodeInfo {
                    id: id.clone(),
                    status: NodeStatus::Active,
                    stats: NodeStats::default(),
                    replication_counter: 0,
                },
                last_seen: Instant::now(),
            });
        }
        let previous = self.ring.previous_of(&self.id);
        self.replicas
            .retain(|primary, _| previous.as_ref() == Some(primary));
    }

    /// React to a member that stopped announcing itself.
    ///
    /// Every survivor reaches the same view independently: the failed node's
    /// buckets go to its ring backup, which promotes its replica buffer.
    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn handle_node_failure(&self, failed: &NodeId) -> Result<()> {
        let guard = self.ring.relink().await;
        if !self.ring.contains(failed) || failed == &self.id {
            return Ok(());
        }
        let heir = self.ring.backup_of(failed);
        let previous_backup = self.ring.backup_of(&self.id);
        guard.leave(failed)?;
        self.view_version.fetch_add(1, Ordering::AcqRel);
        self.peers.remove(failed);

        let mut promoted = false;
        match self.topology() {
            TopologyKind::PartitionedReplica => {
                if let Some(heir) = &heir {
                    let next = self.distribution.read().reassign(failed, heir);
                    *self.distribution.write() = next;
                    if heir == &self.id {
                        self.promote_replica(failed);
                        promoted = true;
                    }
                }
            }
            TopologyKind::Partitioned => {
                let next = self.distribution.read().rebalance(&self.ring.order());
                *self.distribution.write() = next;
                warn!(node = %self.id, failed = %failed, "Entries of failed node are lost");
            }
            TopologyKind::Replicated | TopologyKind::Local => {}
        }
        self.replicas.remove(failed);

        let backup = self.ring.backup_of(&self.id);
        if promoted || backup != previous_backup {
            self.resync_backup_logged().await;
        }
        drop(guard);
        warn!(node = %self.id, failed = %failed, members = self.ring.len(), "Removed failed node");
        Ok(())
    }

    /// Declare peers silent for longer than the failure timeout as failed
    pub async fn check_failures(&self) -> Vec<NodeId> {
        let timeout = self.config.failure_timeout();
        let failed: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|peer| peer.last_seen.elapsed() > timeout)
            .map(|peer| peer.key().clone())
            .collect();
        for id in &failed {
            warn!(node = %self.id, peer = %id, "Peer missed presence announcements");
            if let Err(e) = self.handle_node_failure(id).await {
                warn!(node = %self.id, peer = %id, error = %e, "Failure handling failed");
            }
        }
        failed
    }

    /// Broadcast this node's status and load
    pub async fn announce_presence(&self) -> ClusterOperationResult {
        let counter = self.replication_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut info = self.info();
        info.replication_counter = counter;
        let payload = match to_json(&PresenceAnnouncement { info }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(node = %self.id, error = %e, "Failed to encode presence");
                return ClusterOperationResult::FullTimeout;
            }
        };
        let response = self.broadcast(&self.others(), Opcode::Presence, 0, payload).await;
        if response.result != ClusterOperationResult::Completed {
            debug!(node = %self.id, missing = ?response.missing, "Presence not delivered to all peers");
        }
        response.result
    }

    /// Accept an announcement only if it is newer than the last one seen
    pub fn handle_presence(&self, info: NodeInfo) -> bool {
        let Some(mut peer) = self.peers.get_mut(&info.id) else {
            debug!(node = %self.id, peer = %info.id, "Presence from non-member");
            return false;
        };
        if info.replication_counter <= peer.info.replication_counter {
            return false;
        }
        peer.info = info;
        peer.last_seen = Instant::now();
        true
    }

    // =========================================================================
    // State transfer
    // =========================================================================

    fn begin_transfer(&self, sources: &BTreeMap<NodeId, Vec<u32>>) {
        let mut transfer = self.transfer.lock();
        *transfer = TransferState {
            active: true,
            ..TransferState::default()
        };
        for (source, buckets) in sources {
            if source == &self.id {
                continue;
            }
            if buckets.is_empty() {
                transfer.all_from = Some(source.clone());
            }
            for bucket in buckets {
                transfer.sources.insert(*bucket, source.clone());
            }
        }
    }

    fn finish_transfer(&self) {
        *self.transfer.lock() = TransferState::default();
    }

    /// Node still holding `key` while this node pulls it
    fn pending_source(&self, key: &str) -> Option<NodeId> {
        let transfer = self.transfer.lock();
        if !transfer.active || transfer.tombstones.contains(key) {
            return None;
        }
        transfer
            .all_from
            .clone()
            .or_else(|| transfer.sources.get(&bucket_of(key)).cloned())
    }

    async fn pull_state(&self, sources: &BTreeMap<NodeId, Vec<u32>>) -> Result<()> {
        for (source, buckets) in sources {
            if source != &self.id {
                self.pull_from(source, buckets).await?;
            }
        }
        Ok(())
    }

    /// Pull `buckets` (empty = all) from `source` chunk by chunk, retrying a
    /// failing chunk with growing backoff
    async fn pull_from(&self, source: &NodeId, buckets: &[u32]) -> Result<()> {
        let attempts = self.config.cluster.state_transfer_retries + 1;
        let backoff = Duration::from_millis(self.config.cluster.state_transfer_backoff_ms);
        let mut chunk = 0u32;
        let mut failures = 0u32;
        let mut loaded = 0usize;

        loop {
            let request = StateTransferRequest {
                requester: self.id.to_string(),
                buckets: buckets.to_vec(),
                chunk,
            };
            let reply = match self.encode(&request) {
                Ok(payload) => self
                    .call(source, Opcode::StateTransfer, PULL, payload)
                    .await
                    .and_then(|reply| self.decode::<StateTransferChunk>(&reply)),
                Err(e) => Err(e),
            };
            match reply {
                Ok(reply) => {
                    failures = 0;
                    loaded += self.load_transferred(reply.entries);
                    if !reply.has_more {
                        break;
                    }
                    chunk += 1;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= attempts {
                        return Err(Error::StateTransferFailed {
                            source_node: source.to_string(),
                            attempts,
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        node = %self.id,
                        source = %source,
                        chunk,
                        attempt = failures,
                        error = %e,
                        "State transfer chunk failed, retrying"
                    );
                    tokio::time::sleep(backoff * failures).await;
                }
            }
        }
        info!(node = %self.id, source = %source, loaded, "Pulled state");
        Ok(())
    }

    /// Load pulled entries unless written or removed here since the pull began
    fn load_transferred(&self, entries: Vec<CacheEntry>) -> usize {
        let mut loaded = 0;
        for entry in entries {
            let skip = self.store.contains_key(&entry.key)
                || self.transfer.lock().tombstones.contains(entry.key.as_ref());
            if skip {
                continue;
            }
            let key = entry.key.clone();
            match self.store.load_entry(entry) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(node = %self.id, key = %key, error = %e, "Dropped transferred entry"),
            }
        }
        loaded
    }

    fn transfer_chunk(&self, request: &StateTransferRequest) -> StateTransferChunk {
        let buckets: HashSet<u32> = request.buckets.iter().copied().collect();
        let mut keys = self
            .store
            .keys_where(|entry| buckets.is_empty() || buckets.contains(&bucket_of(&entry.key)));
        keys.sort();
        let start = request.chunk as usize * TRANSFER_CHUNK_SIZE;
        let entries = keys
            .iter()
            .skip(start)
            .take(TRANSFER_CHUNK_SIZE)
            .filter_map(|key| self.store.peek(key))
            .collect();
        StateTransferChunk {
            primary: self.id.to_string(),
            entries,
            chunk: request.chunk,
            has_more: keys.len() > start + TRANSFER_CHUNK_SIZE,
        }
    }

    /// Drop entries whose buckets moved to other nodes
    fn purge_unowned(&self) -> usize {
        let keys = self.store.keys_where(|entry| self.is_migrating(&entry.key));
        for key in &keys {
            self.store.discard(key);
        }
        if !keys.is_empty() {
            info!(node = %self.id, purged = keys.len(), "Purged transferred entries");
        }
        keys.len()
    }

    async fn import_queries(&self, coordinator: &NodeId) -> Result<()> {
        if coordinator == &self.id {
            return Ok(());
        }
        let request = QueryStateRequest {
            known: self.queries.queries().into_iter().map(|q| q.id).collect(),
        };
        let reply = self
            .call(coordinator, Opcode::QueryState, 0, to_json(&request)?)
            .await?;
        let transfer: QueryStateTransfer = from_json(&reply)?;
        let imported = transfer.queries.len();
        self.queries.import_state(transfer, &self.store);
        debug!(node = %self.id, imported, "Imported query state");
        Ok(())
    }

    // =========================================================================
    // Query notifications
    // =========================================================================

    fn route_notification(&self, change: QueryChange, origin: String) {
        if origin == self.id.as_str() {
            self.queries.publish(change);
            return;
        }
        // Replicated members see every change themselves
        if !self.topology().is_partitioned() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(node = %self.id, origin = %origin, "No runtime to forward query change");
            return;
        };
        let Some(node) = self.me.upgrade() else {
            return;
        };
        runtime.spawn(async move {
            let target = NodeId::new(origin);
            let sent = match to_json(&change) {
                Ok(payload) => node.call(&target, Opcode::QueryNotification, 0, payload).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                debug!(node = %node.id, origin = %target, error = %e, "Query change not delivered");
            }
        });
    }

    // =========================================================================
    // RPC handlers
    // =========================================================================

    async fn on_get(&self, request: RpcRequest) -> Result<Bytes> {
        let message: KeyRequest = self.decode(&request.payload)?;
        let outcome = self.local_get(&message.key, message.access).await?;
        self.encode(&OpReply::from_entry(outcome))
    }

    async fn on_contains(&self, request: RpcRequest) -> Result<Bytes> {
        let message: KeyRequest = self.decode(&request.payload)?;
        let found = self.local_contains(&message.key).await?;
        to_json(&Count {
            count: u64::from(found),
        })
    }

    async fn on_write(&self, request: RpcRequest) -> Result<Bytes> {
        let message: WriteRequest = self.decode(&request.payload)?;
        let outcome = self.apply_write(message).await?;
        self.encode(&OpReply::from_version(outcome))
    }

    async fn on_remove(&self, request: RpcRequest) -> Result<Bytes> {
        let message: KeyRequest = self.decode(&request.payload)?;
        let outcome = self.apply_remove(&message.key, message.access).await?;
        self.encode(&OpReply::from_entry(outcome))
    }

    async fn on_lock(&self, request: RpcRequest) -> Result<Bytes> {
        let message: LockRequest = self.decode(&request.payload)?;
        if message.release {
            let outcome = self.apply_unlock(&message).await?;
            self.encode(&OpReply::from_unit(outcome))
        } else {
            let outcome = self.apply_lock(&message).await?;
            self.encode(&OpReply::from_lock(outcome))
        }
    }

    async fn on_read_stream(&self, request: RpcRequest) -> Result<Bytes> {
        let message: StreamRequest = from_json(&request.payload)?;
        to_json(&self.local_read_stream(&message.key, message.offset, message.length)?)
    }

    async fn on_count(&self, _request: RpcRequest) -> Result<Bytes> {
        to_json(&Count {
            count: self.store.len() as u64,
        })
    }

    async fn on_clear(&self, _request: RpcRequest) -> Result<Bytes> {
        self.clear_local();
        Ok(Bytes::new())
    }

    async fn on_release_locks(&self, request: RpcRequest) -> Result<Bytes> {
        let message: HolderRequest = from_json(&request.payload)?;
        to_json(&Count {
            count: self.release_locks_local(&message.holder) as u64,
        })
    }

    async fn on_remove_group(&self, request: RpcRequest) -> Result<Bytes> {
        let message: GroupRequest = from_json(&request.payload)?;
        let keys = self
            .remove_group_local(&message.group, message.subgroup.as_deref())
            .await?;
        to_json(&KeyList { keys })
    }

    async fn on_keys_by_tag(&self, request: RpcRequest) -> Result<Bytes> {
        let message: TagRequest = from_json(&request.payload)?;
        let keys = self
            .store
            .keys_by_tag(&message.tags, message.match_all)
            .iter()
            .map(|k| k.to_string())
            .collect();
        to_json(&KeyList { keys })
    }

    async fn on_replicate(&self, request: RpcRequest) -> Result<Bytes> {
        let message: ReplicateWrite = self.decode(&request.payload)?;
        let target = if request.overload == MAIN_STORE {
            self.store.clone()
        } else {
            self.replica_buffer(&NodeId::new(message.primary))
        };
        match message.entry {
            Some(entry) => {
                let stale = target
                    .peek(&message.key)
                    .is_some_and(|current| current.version > entry.version);
                if !stale {
                    target.load_entry(entry)?;
                }
            }
            None => {
                target.discard(&message.key);
            }
        }
        Ok(Bytes::new())
    }

    async fn on_replica_resync(&self, request: RpcRequest) -> Result<Bytes> {
        let message: StateTransferChunk = self.decode(&request.payload)?;
        let buffer = self.replica_buffer(&NodeId::new(message.primary));
        if message.chunk == 0 {
            buffer.clear();
        }
        for entry in message.entries {
            buffer.load_entry(entry)?;
        }
        Ok(Bytes::new())
    }

    async fn on_presence(&self, request: RpcRequest) -> Result<Bytes> {
        let message: PresenceAnnouncement = from_json(&request.payload)?;
        self.handle_presence(message.info);
        Ok(Bytes::new())
    }

    async fn on_join(&self, request: RpcRequest) -> Result<Bytes> {
        let coordinator = self.coordinator();
        if coordinator != self.id {
            debug!(node = %self.id, coordinator = %coordinator, "Forwarding join to coordinator");
            return self.call(&coordinator, Opcode::Join, 0, request.payload).await;
        }
        let message: JoinRequest = from_json(&request.payload)?;
        to_json(&self.admit_joiner(message.node).await?)
    }

    async fn on_membership(&self, request: RpcRequest) -> Result<Bytes> {
        let view: MembershipView = from_json(&request.payload)?;
        self.apply_membership(view).await?;
        Ok(Bytes::new())
    }

    async fn on_leave(&self, request: RpcRequest) -> Result<Bytes> {
        let message: LeaveNotice = from_json(&request.payload)?;
        self.peers.remove(&message.node);
        self.replicas.remove(&message.node);
        info!(node = %self.id, departed = %message.node, "Peer left");
        Ok(Bytes::new())
    }

    async fn on_state_transfer(&self, request: RpcRequest) -> Result<Bytes> {
        if request.overload == PUSH {
            let message: StateTransferChunk = self.decode(&request.payload)?;
            let keys: Vec<String> = message.entries.iter().map(|e| e.key.to_string()).collect();
            for entry in message.entries {
                self.store.load_entry(entry)?;
            }
            if self.topology() == TopologyKind::PartitionedReplica {
                let admission = self.ring.admit_write(&self.id).await;
                if let Some(backup) = &admission.backup {
                    for key in &keys {
                        self.mirror(backup, key, "hand_off").await?;
                    }
                }
            }
            return Ok(Bytes::new());
        }
        let message: StateTransferRequest = self.decode(&request.payload)?;
        self.encode(&self.transfer_chunk(&message))
    }

    async fn on_transfer_complete(&self, request: RpcRequest) -> Result<Bytes> {
        let message: TransferComplete = from_json(&request.payload)?;
        debug!(node = %self.id, joiner = %message.node, buckets = message.buckets.len(), "Transfer complete");
        if self.topology().is_partitioned() {
            let _guard = self.ring.relink().await;
            self.purge_unowned();
            self.resync_backup_logged().await;
        }
        Ok(Bytes::new())
    }

    async fn on_query_state(&self, request: RpcRequest) -> Result<Bytes> {
        let message: QueryStateRequest = from_json(&request.payload)?;
        to_json(&self.queries.export_state(&message.known))
    }

    async fn on_register_query(&self, request: RpcRequest) -> Result<Bytes> {
        let message: RegisterQuery = from_json(&request.payload)?;
        let keys = self.queries.register(message.query, &self.store)?;
        to_json(&KeyList { keys })
    }

    async fn on_unregister_query(&self, request: RpcRequest) -> Result<Bytes> {
        let message: QueryId = from_json(&request.payload)?;
        self.queries.unregister(&message.query_id)?;
        Ok(Bytes::new())
    }

    async fn on_search(&self, request: RpcRequest) -> Result<Bytes> {
        let message: SearchRequest = from_json(&request.payload)?;
        let keys = ActiveQueryAnalyzer::search(&message.type_name, &message.predicate, &self.store);
        to_json(&KeyList { keys })
    }

    async fn on_query_notification(&self, request: RpcRequest) -> Result<Bytes> {
        let change: QueryChange = from_json(&request.payload)?;
        self.queries.publish(change);
        Ok(Bytes::new())
    }

    async fn on_map_reduce(&self, request: RpcRequest) -> Result<Bytes> {
        let message: MapReduceRequest = from_json(&request.payload)?;
        let task = self.tasks.get(&message.task)?;
        let output = run_local(&task, &self.store, &message.filter);
        to_json(&MapReducePartial { output })
    }
}

#[async_trait]
impl RpcHandler for ClusterNode {
    async fn handle(&self, request: RpcRequest) -> Result<Bytes> {
        let node = self
            .me
            .upgrade()
            .ok_or_else(|| Error::InvalidState(format!("node {} is shut down", self.id)))?;
        self.rpc.dispatch(node, request).await
    }
}

/// Feeds store mutations to the continuous query analyzer
struct NodeObserver {
    node: Weak<ClusterNode>,
}

impl StoreObserver for NodeObserver {
    fn on_change(&self, change: &StoreChange<'_>) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let changes = node.queries.apply_change(change);
        if changes.is_empty() {
            return;
        }
        // Entries leaving after a bucket moved are not removals
        if let StoreChange::Removed { key, .. } = change {
            if node.is_migrating(key) {
                return;
            }
        }
        for (change, origin) in changes {
            node.route_notification(change, origin);
        }
    }
}

// =============================================================================
// RPC table
// =============================================================================

macro_rules! rpc_handlers {
    ($($name:ident => $method:ident),* $(,)?) => {
        $(
            fn $name(node: Arc<ClusterNode>, request: RpcRequest) -> RpcFuture {
                Box::pin(async move { node.$method(request).await })
            }
        )*
    };
}

rpc_handlers! {
    rpc_get => on_get,
    rpc_contains => on_contains,
    rpc_write => on_write,
    rpc_remove => on_remove,
    rpc_lock => on_lock,
    rpc_read_stream => on_read_stream,
    rpc_count => on_count,
    rpc_clear => on_clear,
    rpc_remove_group => on_remove_group,
    rpc_keys_by_tag => on_keys_by_tag,
    rpc_release_locks => on_release_locks,
    rpc_replicate => on_replicate,
    rpc_replica_resync => on_replica_resync,
    rpc_presence => on_presence,
    rpc_join => on_join,
    rpc_membership => on_membership,
    rpc_leave => on_leave,
    rpc_state_transfer => on_state_transfer,
    rpc_transfer_complete => on_transfer_complete,
    rpc_query_state => on_query_state,
    rpc_register_query => on_register_query,
    rpc_unregister_query => on_unregister_query,
    rpc_search => on_search,
    rpc_query_notification => on_query_notification,
    rpc_map_reduce => on_map_reduce,
}

fn rpc_table() -> Result<RpcDispatcher<ClusterNode>> {
    RpcTableBuilder::new()
        .register(Opcode::Get, 0, rpc_get)
        .register(Opcode::Contains, 0, rpc_contains)
        .register(Opcode::Write, 0, rpc_write)
        .register(Opcode::Remove, 0, rpc_remove)
        .register(Opcode::Lock, 0, rpc_lock)
        .register(Opcode::ReadStream, 0, rpc_read_stream)
        .register(Opcode::Count, 0, rpc_count)
        .register(Opcode::Clear, 0, rpc_clear)
        .register(Opcode::RemoveGroup, 0, rpc_remove_group)
        .register(Opcode::KeysByTag, 0, rpc_keys_by_tag)
        .register(Opcode::ReleaseLocks, 0, rpc_release_locks)
        .register(Opcode::Replicate, REPLICA_BUFFER, rpc_replicate)
        .register(Opcode::Replicate, MAIN_STORE, rpc_replicate)
        .register(Opcode::ReplicaResync, 0, rpc_replica_resync)
        .register(Opcode::Presence, 0, rpc_presence)
        .register(Opcode::Join, 0, rpc_join)
        .register(Opcode::Membership, 0, rpc_membership)
        .register(Opcode::Leave, 0, rpc_leave)
        .register(Opcode::StateTransfer, PULL, rpc_state_transfer)
        .register(Opcode::StateTransfer, PUSH, rpc_state_transfer)
        .register(Opcode::TransferComplete, 0, rpc_transfer_complete)
        .register(Opcode::QueryState, 0, rpc_query_state)
        .register(Opcode::RegisterQuery, 0, rpc_register_query)
        .register(Opcode::UnregisterQuery, 0, rpc_unregister_query)
        .register(Opcode::Search, 0, rpc_search)
        .register(Opcode::QueryNotification, 0, rpc_query_notification)
        .register(Opcode::MapReduce, 0, rpc_map_reduce)
        .build()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::storage::{CacheValue, SystemClock};
    use crate::cluster::InMemoryNetwork;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn config(topology: TopologyKind) -> Arc<CacheConfig> {
        Arc::new(CacheConfig {
            topology,
            operation_timeout_ms: 200,
            cluster: ClusterConfig {
                state_transfer_retries: 2,
                state_transfer_backoff_ms: 1,
                ..ClusterConfig::default()
            },
            ..CacheConfig::default()
        })
    }

    fn start(network: &Arc<InMemoryNetwork>, config: &Arc<CacheConfig>, name: &str) -> Arc<ClusterNode> {
        let id = NodeId::from(name);
        let store = Arc::new(LocalStore::new(name, &config.storage, Arc::new(SystemClock)));
        let node = ClusterNode::new(
            id.clone(),
            config.clone(),
            store,
            network.transport(id.clone()),
            Arc::new(SurrogateSelector::new()),
        )
        .unwrap();
        network.register(id, node.clone());
        node
    }

    fn entry(key: &str) -> CacheEntry {
        CacheEntry::new(key, CacheValue::object(format!("value-{}", key)), Utc::now())
    }

    /// A key whose bucket `node` owns
    fn key_owned_by(node: &ClusterNode) -> String {
        let map = node.distribution();
        (0..)
            .map(|i| format!("key-{}", i))
            .find(|key| map.owner_of(key) == Some(node.id()))
            .unwrap()
    }

    #[test]
    fn test_rpc_table_is_complete() {
        let table = rpc_table().unwrap();
        assert!(table.verify(REQUIRED_RPCS).is_ok());
        assert_eq!(table.methods().len(), REQUIRED_RPCS.len());
    }

    #[tokio::test]
    async fn test_local_topology_serves_locally() {
        let network = InMemoryNetwork::new();
        let node = start(&network, &config(TopologyKind::Local), "solo");
        assert_matches!(
            node.get("k", LockAccess::Ignore).await,
            Err(Error::InvalidState(_))
        );
        node.bootstrap().await.unwrap();

        node.add(entry("k")).await.unwrap();
        assert_matches!(
            node.add(entry("k")).await,
            Err(Error::KeyAlreadyExists { .. })
        );
        assert!(node.get("k", LockAccess::Ignore).await.unwrap().is_done());
        assert_eq!(node.count().await.unwrap(), 1);
        assert_matches!(
            node.join(&NodeId::from("other")).await,
            Err(Error::InvalidState(_))
        );
    }

    #[tokio::test]
    async fn test_silent_backup_surfaces_partial_timeout() {
        let network = InMemoryNetwork::new();
        let config = config(TopologyKind::PartitionedReplica);
        let a = start(&network, &config, "a");
        let b = start(&network, &config, "b");
        a.bootstrap().await.unwrap();
        b.join(a.id()).await.unwrap();

        let key = key_owned_by(&a);
        a.insert(entry(&key), InsertOptions::default()).await.unwrap();
        assert!(b.replica_contains(a.id(), &key));

        network.isolate(b.id());
        let result = a.insert(entry(&key), InsertOptions::default()).await;
        match result {
            Err(Error::PartialTimeout {
                responded, missing, ..
            }) => {
                assert_eq!(responded, vec!["a".to_string()]);
                assert_eq!(missing, vec!["b".to_string()]);
            }
            other => panic!("expected partial timeout, got {:?}", other),
        }
        // Applied on the primary, not rolled back
        assert!(a.store().contains_key(&key));
    }

    #[tokio::test]
    async fn test_presence_accepts_only_newer_counters() {
        let network = InMemoryNetwork::new();
        let config = config(TopologyKind::Replicated);
        let a = start(&network, &config, "a");
        let b = start(&network, &config, "b");
        a.bootstrap().await.unwrap();
        b.join(a.id()).await.unwrap();

        let mut info = b.info();
        info.replication_counter = 2;
        assert!(a.handle_presence(info.clone()));
        info.replication_counter = 1;
        info.stats.item_count = 99;
        assert!(!a.handle_presence(info));
        assert_eq!(a.peer(b.id()).unwrap().replication_counter, 2);

        // b's own counter starts at 1, below what a already accepted
        assert_eq!(b.announce_presence().await, ClusterOperationResult::Completed);
        assert_eq!(a.peer(b.id()).unwrap().replication_counter, 2);
    }

    #[tokio::test]
    async fn test_state_transfer_retries_are_bounded() {
        let network = InMemoryNetwork::new();
        let config = config(TopologyKind::Partitioned);
        let c = start(&network, &config, "c");

        let result = c.pull_from(&NodeId::from("ghost"), &[1, 2]).await;
        assert_matches!(
            result,
            Err(Error::StateTransferFailed { attempts: 3, ref source_node, .. }) if source_node == "ghost"
        );
    }

    #[tokio::test]
    async fn test_stream_read_distinguishes_end_from_timeout() {
        let network = InMemoryNetwork::new();
        let config = config(TopologyKind::Partitioned);
        let a = start(&network, &config, "a");
        let b = start(&network, &config, "b");
        a.bootstrap().await.unwrap();
        b.join(a.id()).await.unwrap();

        let key = key_owned_by(&b);
        let blob = CacheEntry::new(key.as_str(), CacheValue::binary(&b"0123456789"[..]), Utc::now());
        a.insert(blob, InsertOptions::default()).await.unwrap();

        let tail = a.read_stream(&key, 6, 8).await.unwrap();
        assert_eq!(tail.data, Bytes::from_static(b"6789"));
        assert!(tail.is_end_of_stream(6, 8));

        network.isolate(b.id());
        let short = a.read_stream(&key, 0, 8).await.unwrap();
        assert!(short.is_short_read_due_to_cluster());
        assert_eq!(short.bytes_read, 0);
    }
}
