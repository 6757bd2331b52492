//! Prometheus exposition.
//!
//! Each cache instance owns its registry. Pool, store, node and ledger
//! figures are copied into gauges from a [`MetricsSnapshot`] on every scrape;
//! command counts and latencies are recorded as they happen.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;

use super::health::HealthStatus;
use crate::cluster::NodeInfo;
use crate::engine::LedgerSnapshot;
use crate::error::{Error, Result};
use crate::pool::PoolStats;
use crate::query::QueryStateInfo;
use crate::storage::StoreStats;

/// Read-only view of one cache instance
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cache_name: String,
    pub node: NodeInfo,
    pub members: usize,
    pub view_version: u64,
    pub health: HealthStatus,
    pub store: StoreStats,
    pub pools: PoolStats,
    pub ledger: LedgerSnapshot,
    pub queries: QueryStateInfo,
}

pub struct CacheMetrics {
    registry: Registry,
    commands: IntCounterVec,
    command_latency: HistogramVec,
    entries: IntGauge,
    used_bytes: IntGauge,
    store_events: IntGaugeVec,
    pool_in_use: IntGaugeVec,
    pool_capacity: IntGaugeVec,
    pool_out_of_pool: IntGaugeVec,
    interned_strings: IntGauge,
    cluster_members: IntGauge,
    view_version: IntGauge,
    node_healthy: IntGauge,
    outstanding_requests: IntGauge,
    ledger_events: IntGaugeVec,
    continuous_queries: IntGauge,
}

impl CacheMetrics {
    pub fn new(cache_name: &str) -> Result<Self> {
        let labels = std::collections::HashMap::from([("cache".to_string(), cache_name.to_string())]);
        let registry = Registry::new_custom(Some("meshcache".to_string()), Some(labels))?;

        let commands = IntCounterVec::new(
            Opts::new("commands_total", "Commands executed by outcome"),
            &["command", "outcome"],
        )?;
        let command_latency = HistogramVec::new(
            HistogramOpts::new("command_duration_seconds", "Command execution latency").buckets(
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
            ),
            &["command"],
        )?;
        let entries = IntGauge::new("store_entries", "Entries in the local store")?;
        let used_bytes = IntGauge::new("store_used_bytes", "Bytes used by the local store")?;
        let store_events = IntGaugeVec::new(
            Opts::new("store_events", "Cumulative store events by kind"),
            &["event"],
        )?;
        let pool_in_use = IntGaugeVec::new(
            Opts::new("pool_in_use", "Pooled instances rented out"),
            &["pool"],
        )?;
        let pool_capacity = IntGaugeVec::new(
            Opts::new("pool_capacity", "Pool capacity"),
            &["pool"],
        )?;
        let pool_out_of_pool = IntGaugeVec::new(
            Opts::new("pool_out_of_pool", "Instances handed out beyond pool capacity"),
            &["pool"],
        )?;
        let interned_strings = IntGauge::new("string_pool_interned", "Interned strings")?;
        let cluster_members = IntGauge::new("cluster_members", "Members in this node's ring")?;
        let view_version = IntGauge::new("cluster_view_version", "Installed membership view")?;
        let node_healthy = IntGauge::new("node_healthy", "1 when every health check passes")?;
        let outstanding_requests =
            IntGauge::new("requests_outstanding", "Requests tracked by the ledger")?;
        let ledger_events = IntGaugeVec::new(
            Opts::new("requests_events", "Cumulative ledger events by kind"),
            &["event"],
        )?;
        let continuous_queries =
            IntGauge::new("continuous_queries", "Registered continuous queries")?;

        registry.register(Box::new(commands.clone()))?;
        registry.register(Box::new(command_latency.clone()))?;
        registry.register(Box::new(entries.clone()))?;
        registry.register(Box::new(used_bytes.clone()))?;
        registry.register(Box::new(store_events.clone()))?;
        registry.register(Box::new(pool_in_use.clone()))?;
        registry.register(Box::new(pool_capacity.clone()))?;
        registry.register(Box::new(pool_out_of_pool.clone()))?;
        registry.register(Box::new(interned_strings.clone()))?;
        registry.register(Box::new(cluster_members.clone()))?;
        registry.register(Box::new(view_version.clone()))?;
        registry.register(Box::new(node_healthy.clone()))?;
        registry.register(Box::new(outstanding_requests.clone()))?;
        registry.register(Box::new(ledger_events.clone()))?;
        registry.register(Box::new(continuous_queries.clone()))?;

        Ok(Self {
            registry,
            commands,
            command_latency,
            entries,
            used_bytes,
            store_events,
            pool_in_use,
            pool_capacity,
            pool_out_of_pool,
            interned_strings,
            cluster_members,
            view_version,
            node_healthy,
            outstanding_requests,
            ledger_events,
            continuous_queries,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_command(&self, command: &str, outcome: &str, elapsed: Duration) {
        self.commands.with_label_values(&[command, outcome]).inc();
        self.command_latency
            .with_label_values(&[command])
            .observe(elapsed.as_secs_f64());
    }

    /// Copy a snapshot into the gauges
    pub fn refresh(&self, snapshot: &MetricsSnapshot) {
        self.entries.set(snapshot.store.entries as i64);
        self.used_bytes.set(snapshot.store.used_bytes as i64);
        let store = &snapshot.store.metrics;
        for (event, value) in [
            ("hits", store.hits),
            ("misses", store.misses),
            ("adds", store.adds),
            ("inserts", store.inserts),
            ("removes", store.removes),
            ("evictions", store.evictions),
            ("expirations", store.expirations),
            ("lock_conflicts", store.lock_conflicts),
            ("lock_timeouts", store.lock_timeouts),
        ] {
            self.store_events.with_label_values(&[event]).set(value as i64);
        }

        for pool in &snapshot.pools.object_pools {
            let name = pool.name.as_str();
            self.pool_in_use.with_label_values(&[name]).set(pool.in_use as i64);
            self.pool_capacity
                .with_label_values(&[name])
                .set(pool.capacity as i64);
            self.pool_out_of_pool
                .with_label_values(&[name])
                .set(pool.out_of_pool as i64);
        }
        self.interned_strings
            .set(snapshot.pools.string_pool.interned as i64);

        self.cluster_members.set(snapshot.members as i64);
        self.view_version.set(snapshot.view_version as i64);
        self.node_healthy
            .set(i64::from(snapshot.health == HealthStatus::Healthy));

        let ledger = &snapshot.ledger;
        self.outstanding_requests.set(ledger.outstanding as i64);
        for (event, value) in [
            ("tracked", ledger.tracked),
            ("completed", ledger.completed),
            ("cancelled", ledger.cancelled),
            ("timed_out", ledger.timed_out),
        ] {
            self.ledger_events.with_label_values(&[event]).set(value as i64);
        }
        self.continuous_queries.set(snapshot.queries.queries as i64);
    }

    /// Text exposition of the registry
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not UTF-8: {}", e)))
    }
}

// =============================================================================
// Tests
// =============================================================================
