//! Cache instance: one node's engine behind the command boundary.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::command::{
    ClientContext, Command, ItemOptions, OperationContext, Response, ResponseEnvelope,
};
use super::context::RuntimeContext;
use super::ledger::{RequestLedger, RequestMonitor};
use super::scheduler::{ScheduledTask, TimeScheduler};
use crate::cluster::{
    ClusterNode, ClusterTransport, FailureDetectorTask, InMemoryNetwork, NodeId, NodeStatus,
    PresenceTask,
};
use crate::error::{Error, Result};
use crate::monitoring::{ApiLogEntry, HealthCheck, HealthResponse, MetricsSnapshot};
use crate::pool::{Lease, StringPoolTrimTask};
use crate::query::{MapReduceTask, QueryChange};
use crate::storage::{CacheEntry, CacheValue, Expiration, InsertOptions, LocalStore};

pub struct CacheInstance {
    context: RuntimeContext,
    node: Arc<ClusterNode>,
    scheduler: TimeScheduler,
    ledger: Arc<RequestLedger>,
    health: HealthCheck,
}

impl CacheInstance {
    pub fn new(
        id: NodeId,
        context: RuntimeContext,
        transport: Arc<dyn ClusterTransport>,
    ) -> Result<Arc<Self>> {
        let config = context.config.clone();
        let store = Arc::new(LocalStore::new(
            config.cache_name.clone(),
            &config.storage,
            context.clock.clone(),
        ));
        let node = ClusterNode::new(id, config, store, transport, context.selector.clone())?;
        Ok(Arc::new(Self {
            context,
            node,
            scheduler: TimeScheduler::new(),
            ledger: Arc::new(RequestLedger::new()),
            health: HealthCheck::new(),
        }))
    }

    /// Instance with no peers, for the local topology
    pub fn standalone(context: RuntimeContext) -> Result<Arc<Self>> {
        let id = NodeId::new(format!("{}-local", context.cache_name()));
        let transport: Arc<dyn ClusterTransport> = InMemoryNetwork::new().transport(id.clone());
        Self::new(id, context, transport)
    }

    pub fn id(&self) -> &NodeId {
        self.node.id()
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn node(&self) -> &Arc<ClusterNode> {
        &self.node
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        self.node.store()
    }

    pub fn ledger(&self) -> &Arc<RequestLedger> {
        &self.ledger
    }

    pub fn scheduler(&self) -> &TimeScheduler {
        &self.scheduler
    }

    /// Bootstrap a new cluster, or join through `seed`, then start
    /// housekeeping
    #[instrument(skip(self), fields(cache = %self.context.cache_name(), node = %self.id()))]
    pub async fn start(&self, seed: Option<&NodeId>) -> Result<()> {
        match seed {
            Some(seed) => self.node.join(seed).await?,
            None => self.node.bootstrap().await?,
        }

        let config = &self.context.config;
        self.scheduler.add_task(Arc::new(ExpirationTask {
            store: Arc::downgrade(self.node.store()),
            interval: Duration::from_millis(config.storage.sweep_interval_ms),
        }))?;
        self.scheduler.add_task(Arc::new(StringPoolTrimTask::new(
            self.context.pools.clone(),
            Duration::from_millis(config.pooling.string_pool_trim_interval_ms),
            Duration::from_millis(config.pooling.string_pool_idle_ms),
        )))?;
        self.scheduler.add_task(Arc::new(RequestMonitor::new(
            self.ledger.clone(),
            self.node.clone(),
            Duration::from_millis(config.requests.monitor_interval_ms),
            config.request_timeout(),
            Duration::from_millis(config.requests.dead_client_grace_ms),
        )))?;
        if config.topology.is_clustered() {
            let interval = config.presence_interval();
            self.scheduler
                .add_task(Arc::new(PresenceTask::new(&self.node, interval)))?;
            self.scheduler
                .add_task(Arc::new(FailureDetectorTask::new(&self.node, interval)))?;
        }

        self.health.set_ready(true);
        info!(
            tasks = ?self.scheduler.task_names(),
            members = self.node.ring().len(),
            "Cache instance started"
        );
        Ok(())
    }

    /// Leave the cluster if still a member, then stop and join background
    /// tasks
    #[instrument(skip(self), fields(cache = %self.context.cache_name(), node = %self.id()))]
    pub async fn stop(&self) -> Result<()> {
        self.health.set_ready(false);
        let leave = if self.context.config.topology.is_clustered()
            && self.node.status() == NodeStatus::Active
        {
            self.node.leave().await
        } else {
            Ok(())
        };
        self.scheduler.shutdown().await;
        self.health.set_live(false);
        if let Err(e) = &leave {
            warn!(error = %e, "Leaving the cluster failed");
        }
        info!("Cache instance stopped");
        leave
    }

    pub fn register_task(&self, task: MapReduceTask) -> Result<()> {
        self.node.tasks().register(task)
    }

    /// Continuous query changes for queries registered on this node
    pub fn subscribe(&self) -> broadcast::Receiver<QueryChange> {
        self.node.subscribe()
    }

    // =========================================================================
    // Command boundary
    // =========================================================================

    /// Run one command for `client` and return its pooled response.
    ///
    /// The request is tracked in the ledger while it runs; a cancellation by
    /// the request monitor or a client disconnect ends it with
    /// `Error::Cancelled`. Hand the envelope back with
    /// [`CacheInstance::release`].
    pub async fn execute_command(
        &self,
        client: &ClientContext,
        command: Command,
    ) -> Lease<ResponseEnvelope> {
        let pools = &self.context.pools;
        let name = command.name();
        let mut operation = pools.rent::<OperationContext>();
        operation.client_id.push_str(&client.client_id);
        operation.command = name;
        operation.key = command.key().map(str::to_string);
        operation.started = Some(std::time::Instant::now());

        let request = self.ledger.track(&client.client_id, name);
        operation.request_id = request.id();
        let result = tokio::select! {
            result = self.dispatch(client, command) => result,
            _ = request.cancelled() => Err(Error::Cancelled(format!(
                "{} request {} of {}",
                name,
                request.id(),
                client.client_id
            ))),
        };
        self.ledger.complete(request.id());

        let elapsed = operation.elapsed();
        let outcome = match &result {
            Ok(response) => response.name(),
            Err(e) => e.kind(),
        };
        self.context.metrics.record_command(name, outcome, elapsed);
        self.context.api_log.log(ApiLogEntry {
            timestamp: Utc::now(),
            client_id: client.client_id.clone(),
            command: name.to_string(),
            key: operation.key.take(),
            outcome: outcome.to_string(),
            duration_us: elapsed.as_micros() as u64,
        });
        if let Err(e) = &result {
            debug!(command = name, client = %client.client_id, error = %e, "Command failed");
        }

        let mut envelope = pools.rent::<ResponseEnvelope>();
        envelope.request_id = operation.request_id;
        envelope.command = name;
        envelope.elapsed = elapsed;
        envelope.result = Some(result);
        pools.give_back(operation);
        envelope
    }

    /// Return a response envelope to its pool
    pub fn release(&self, envelope: Lease<ResponseEnvelope>) {
        self.context.pools.give_back(envelope);
    }

    /// Run one command and take its result, returning the envelope
    pub async fn execute(&self, client: &ClientContext, command: Command) -> Result<Response> {
        let mut envelope = self.execute_command(client, command).await;
        let result = envelope.take_result();
        self.release(envelope);
        result
    }

    async fn dispatch(&self, client: &ClientContext, command: Command) -> Result<Response> {
        let node = &self.node;
        match command {
            Command::Add {
                key,
                value,
                options,
            } => {
                let entry = self.build_entry(&key, value, options)?;
                node.add(entry).await.map(Response::Version)
            }
            Command::Insert {
                key,
                value,
                options,
                access,
                expected_version,
            } => {
                let entry = self.build_entry(&key, value, options)?;
                let options = InsertOptions {
                    access,
                    expected_version,
                };
                node.insert(entry, options).await.map(Response::from_version)
            }
            Command::Get { key, access } => {
                let outcome = node.get(&key, access).await?;
                self.to_client(Response::from_entry(outcome))
            }
            Command::Remove { key, access } => {
                let outcome = node.remove(&key, access).await?;
                self.to_client(Response::from_removed(outcome))
            }
            Command::Contains { key } => node.contains(&key).await.map(Response::Exists),
            Command::Lock { key, lease, access } => node
                .lock(&key, &client.client_id, lease, access)
                .await
                .map(Response::from_lock),
            Command::Unlock { key, lock_id } => {
                node.unlock(&key, lock_id).await.map(Response::from_unit)
            }
            Command::Count => node.count().await.map(Response::Count),
            Command::Clear => node.clear().await.map(|_| Response::Ok),
            Command::RemoveGroup { group, subgroup } => node
                .remove_group(&group, subgroup.as_deref())
                .await
                .map(Response::Keys),
            Command::KeysByTag { tags, match_all } => {
                node.keys_by_tag(&tags, match_all).await.map(Response::Keys)
            }
            Command::ReadStream {
                key,
                offset,
                length,
            } => node
                .read_stream(&key, offset, length)
                .await
                .map(Response::Stream),
            Command::RegisterQuery {
                type_name,
                predicate,
            } => {
                let (query, keys) = node.register_query(&type_name, predicate).await?;
                Ok(Response::QueryRegistered {
                    query_id: query.id,
                    keys,
                })
            }
            Command::UnregisterQuery { query_id } => {
                node.unregister_query(&query_id).await.map(|_| Response::Ok)
            }
            Command::Search {
                type_name,
                predicate,
            } => node.search(&type_name, &predicate).await.map(Response::Keys),
            Command::MapReduce { task, filter } => node
                .run_map_reduce(&task, filter)
                .await
                .map(Response::MapReduce),
        }
    }

    fn build_entry(&self, key: &str, value: CacheValue, options: ItemOptions) -> Result<CacheEntry> {
        let now = self.context.clock.now();
        let key = self.context.pools.strings().intern(key);
        let value = self.context.format.get_cache_data(value)?;
        let expiration = options
            .expiration
            .unwrap_or_else(|| self.default_expiration(now));

        let mut entry = CacheEntry::new(key, value, now)
            .with_expiration(expiration)
            .with_priority(options.priority)
            .with_tags(options.tags);
        if let Some(group) = options.group {
            entry = entry.with_group(group);
        }
        if let Some(query_info) = options.query_info {
            entry = entry.with_query_info(query_info);
        }
        Ok(entry)
    }

    fn default_expiration(&self, now: DateTime<Utc>) -> Expiration {
        let defaults = &self.context.config.expiration;
        if let Some(secs) = defaults.default_absolute_secs {
            Expiration::absolute_in(now, Duration::from_secs(secs))
        } else if let Some(secs) = defaults.default_sliding_secs {
            Expiration::sliding(Duration::from_secs(secs), now)
        } else {
            Expiration::None
        }
    }

    /// Convert a stored value to the client's representation
    fn to_client(&self, response: Response) -> Result<Response> {
        let format = &self.context.format;
        Ok(match response {
            Response::Value { value, version } => Response::Value {
                value: format.get_client_data(&value)?,
                version,
            },
            Response::Removed { value } => Response::Removed {
                value: format.get_client_data(&value)?,
            },
            other => other,
        })
    }

    // =========================================================================
    // Clients
    // =========================================================================

    pub fn client_connected(&self, client: &ClientContext) {
        self.ledger.client_reconnected(&client.client_id);
        self.node.client_connected();
        debug!(client = %client.client_id, "Client connected");
    }

    /// Cancel the client's requests; its locks are released cluster-wide
    /// after the configured grace period, immediately when there is none
    pub async fn client_disconnected(&self, client: &ClientContext) -> usize {
        let cancelled = self.ledger.client_disconnected(&client.client_id);
        self.node.client_disconnected();
        if self.context.config.requests.dead_client_grace_ms == 0 {
            for dead in self.ledger.take_dead_clients(Duration::ZERO) {
                match self.node.release_locks_held_by(&dead).await {
                    Ok(released) => {
                        debug!(client = %dead, released, "Released locks of disconnected client")
                    }
                    Err(e) => {
                        warn!(client = %dead, error = %e, "Releasing locks of disconnected client failed")
                    }
                }
            }
        }
        info!(client = %client.client_id, cancelled, "Client disconnected");
        cancelled
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    pub fn is_live(&self) -> bool {
        self.health.is_live()
    }

    pub fn is_ready(&self) -> bool {
        self.health.is_ready() && self.node.status().is_serving()
    }

    pub fn health(&self) -> HealthResponse {
        self.health.check_node(&self.node)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_name: self.context.cache_name().to_string(),
            node: self.node.info(),
            members: self.node.ring().len(),
            view_version: self.node.view_version(),
            health: self.health().status,
            store: self.store().stats(),
            pools: self.context.pools.stats(),
            ledger: self.ledger.snapshot(),
            queries: self.node.queries().state_info(),
        }
    }

    /// Prometheus text exposition of this instance
    pub fn render_metrics(&self) -> Result<String> {
        self.context.metrics.refresh(&self.snapshot());
        self.context.metrics.render()
    }

    pub fn recent_calls(&self, limit: usize) -> Vec<ApiLogEntry> {
        self.context.api_log.recent(limit)
    }
}

/// Removes expired entries; removals reach continuous queries through the
/// store observer
struct ExpirationTask {
    store: Weak<LocalStore>,
    interval: Duration,
}

#[async_trait]
impl ScheduledTask for ExpirationTask {
    fn name(&self) -> &str {
        "expiration-sweep"
    }

    fn next_interval(&self) -> Option<Duration> {
        (!self.interval.is_zero() && self.store.strong_count() > 0).then_some(self.interval)
    }

    async fn run(&self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let expired = store.sweep_expired();
        if !expired.is_empty() {
            debug!(store = store.name(), expired = expired.len(), "Swept expired entries");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ExpirationConfig, RequestConfig};
    use crate::storage::{LockAccess, ManualClock};
    use assert_matches::assert_matches;

    fn instance(config: CacheConfig) -> (Arc<CacheInstance>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let context = RuntimeContext::with_clock(config, clock.clone()).unwrap();
        (CacheInstance::standalone(context).unwrap(), clock)
    }

    fn add(key: &str, value: &str) -> Command {
        Command::Add {
            key: key.into(),
            value: CacheValue::object(value.to_string()),
            options: ItemOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_commands_round_trip_through_boundary() {
        let (cache, _) = instance(CacheConfig::default());
        cache.start(None).await.unwrap();
        let client = ClientContext::new("c1");

        assert_matches!(cache.execute(&client, add("k", "v")).await, Ok(Response::Version(_)));
        assert_matches!(
            cache.execute(&client, add("k", "v")).await,
            Err(Error::KeyAlreadyExists { .. })
        );
        let got = cache
            .execute(
                &client,
                Command::Get {
                    key: "k".into(),
                    access: LockAccess::Ignore,
                },
            )
            .await
            .unwrap();
        match got {
            Response::Value { value, .. } => {
                assert_eq!(value.downcast::<String>(), Some(&"v".to_string()))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_matches!(cache.execute(&client, Command::Count).await, Ok(Response::Count(1)));
        assert_eq!(cache.ledger().outstanding(), 0);
        assert_eq!(cache.ledger().snapshot().completed, 4);

        cache.stop().await.unwrap();
        assert!(!cache.is_live());
    }

    #[tokio::test]
    async fn test_default_expiration_applies() {
        let (cache, clock) = instance(CacheConfig {
            expiration: ExpirationConfig {
                default_absolute_secs: Some(5),
                default_sliding_secs: None,
            },
            ..CacheConfig::default()
        });
        cache.start(None).await.unwrap();
        let client = ClientContext::new("c1");
        cache.execute(&client, add("k", "v")).await.unwrap();

        clock.advance(Duration::from_secs(6));
        let got = cache
            .execute(
                &client,
                Command::Get {
                    key: "k".into(),
                    access: LockAccess::Ignore,
                },
            )
            .await;
        assert_matches!(got, Ok(Response::NotFound));
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_releases_locks() {
        let (cache, _) = instance(CacheConfig {
            requests: RequestConfig {
                dead_client_grace_ms: 0,
                ..RequestConfig::default()
            },
            ..CacheConfig::default()
        });
        cache.start(None).await.unwrap();
        let owner = ClientContext::new("owner");
        let other = ClientContext::new("other");
        cache.execute(&owner, add("k", "v")).await.unwrap();
        cache.client_connected(&owner);

        let lock = Command::Lock {
            key: "k".into(),
            lease: None,
            access: LockAccess::Fail,
        };
        assert_matches!(
            cache.execute(&owner, lock.clone()).await,
            Ok(Response::LockAcquired(_))
        );
        assert_matches!(cache.execute(&other, lock.clone()).await, Ok(Response::Locked(_)));

        cache.client_disconnected(&owner).await;
        assert_matches!(
            cache.execute(&other, lock).await,
            Ok(Response::LockAcquired(_))
        );
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_are_logged_and_counted() {
        let mut config = CacheConfig::default();
        config.api_log.enabled = true;
        let (cache, _) = instance(config);
        cache.start(None).await.unwrap();
        let client = ClientContext::new("c1");
        cache.execute(&client, add("k", "v")).await.unwrap();
        let _ = cache.execute(&client, add("k", "v")).await;

        let calls = cache.recent_calls(10);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].outcome, "key_already_exists");
        assert_eq!(calls[0].key.as_deref(), Some("k"));

        let text = cache.render_metrics().unwrap();
        assert!(text.contains("meshcache_store_entries"));
        assert!(cache.health().status.is_healthy());
        cache.stop().await.unwrap();
    }
}
