//! Cache Configuration
//!
//! Loaded once at cache start (YAML or programmatic defaults), validated, then
//! shared read-only through [`crate::engine::RuntimeContext`].
//!
//! ```yaml
//! cache_name: orders
//! topology: partitioned-replica
//! cluster_port: 7800
//! storage:
//!   capacity_bytes: 1073741824
//!   eviction_ratio_percent: 5.0
//! cluster:
//!   presence_interval_ms: 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Enumerations
// =============================================================================

/// Cluster arrangement governing key ownership and replication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyKind {
    /// Single node, no cluster traffic
    Local,
    /// Every node holds every key
    Replicated,
    /// Keys spread over nodes by hash bucket, no backups
    Partitioned,
    /// Partitioned with each node mirrored to its ring successor
    PartitionedReplica,
}

impl TopologyKind {
    pub fn is_clustered(&self) -> bool {
        !matches!(self, TopologyKind::Local)
    }

    pub fn is_partitioned(&self) -> bool {
        matches!(
            self,
            TopologyKind::Partitioned | TopologyKind::PartitionedReplica
        )
    }
}

impl std::fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyKind::Local => write!(f, "local"),
            TopologyKind::Replicated => write!(f, "replicated"),
            TopologyKind::Partitioned => write!(f, "partitioned"),
            TopologyKind::PartitionedReplica => write!(f, "partitioned-replica"),
        }
    }
}

/// In-memory representation of stored values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataFormat {
    /// Stored pre-serialized; client payloads pass through
    Binary,
    /// Stored as native objects; serialized lazily at the boundary
    Object,
}

/// Whether clients share the engine's process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    InProc,
    OutProc,
}

/// Eviction strategy when capacity is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionKind {
    /// Lowest priority first, least recently used within a priority band
    Priority,
    /// Never evict; writes fail once full
    None,
}

// =============================================================================
// Sections
// =============================================================================

/// Storage capacity, eviction and locking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Capacity in bytes (0 = unbounded)
    pub capacity_bytes: u64,
    /// Eviction strategy
    pub eviction_policy: EvictionKind,
    /// Share of capacity freed by one eviction pass
    pub eviction_ratio_percent: f64,
    /// Default bound for lock waits
    pub lock_timeout_ms: u64,
    /// Expiration sweep interval
    pub sweep_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024,
            eviction_policy: EvictionKind::Priority,
            eviction_ratio_percent: 5.0,
            lock_timeout_ms: 5_000,
            sweep_interval_ms: 15_000,
        }
    }
}

/// Expiration applied to items written without their own expiration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    pub default_absolute_secs: Option<u64>,
    pub default_sliding_secs: Option<u64>,
}

/// Object pooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingConfig {
    /// When false every pool is replaced by its allocating fake
    pub enabled: bool,
    pub initial_capacity: usize,
    pub max_capacity: usize,
    /// Hit ratio at or below which a pool grows
    pub serving_capability_borderline: f64,
    /// Free buffers retained per array-pool bucket
    pub buffers_per_bucket: usize,
    pub string_pool_trim_interval_ms: u64,
    pub string_pool_idle_ms: u64,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_capacity: 64,
            max_capacity: 1_000_000,
            serving_capability_borderline: 0.7,
            buffers_per_bucket: 64,
            string_pool_trim_interval_ms: 60_000,
            string_pool_idle_ms: 300_000,
        }
    }
}

/// Cluster membership and state transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub presence_interval_ms: u64,
    /// Missed announcements before a peer is declared failed
    pub failure_threshold: u32,
    pub state_transfer_retries: u32,
    pub state_transfer_backoff_ms: u64,
    /// Seed peers contacted on join
    pub seeds: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            presence_interval_ms: 5_000,
            failure_threshold: 3,
            state_transfer_retries: 3,
            state_transfer_backoff_ms: 500,
            seeds: Vec::new(),
        }
    }
}

/// Client request tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub request_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    /// Grace period before a disconnected client's locks are released
    pub dead_client_grace_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 90_000,
            monitor_interval_ms: 1_000,
            dead_client_grace_ms: 0,
        }
    }
}

/// Payload compression at the data-format boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub enabled: bool,
    pub threshold_bytes: u64,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_bytes: 64 * 1024,
        }
    }
}

/// API call logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiLogConfig {
    pub enabled: bool,
    pub capacity: usize,
}

impl Default for ApiLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 1_024,
        }
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Complete configuration of one cache instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_name: String,
    pub topology: TopologyKind,
    pub cluster_port: u16,
    pub operation_timeout_ms: u64,
    pub data_format: DataFormat,
    pub deployment: DeploymentMode,
    pub storage: StorageConfig,
    pub expiration: ExpirationConfig,
    pub pooling: PoolingConfig,
    pub cluster: ClusterConfig,
    pub requests: RequestConfig,
    pub compression: CompressionSettings,
    pub api_log: ApiLogConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_name: "default".to_string(),
            topology: TopologyKind::Local,
            cluster_port: 7800,
            operation_timeout_ms: 5_000,
            data_format: DataFormat::Object,
            deployment: DeploymentMode::InProc,
            storage: StorageConfig::default(),
            expiration: ExpirationConfig::default(),
            pooling: PoolingConfig::default(),
            cluster: ClusterConfig::default(),
            requests: RequestConfig::default(),
            compression: CompressionSettings::default(),
            api_log: ApiLogConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(Error::Config("cache_name must not be empty".into()));
        }
        if self.operation_timeout_ms == 0 {
            return Err(Error::Config("operation_timeout_ms must be positive".into()));
        }
        if !(0.0..=100.0).contains(&self.storage.eviction_ratio_percent) {
            return Err(Error::Config(format!(
                "eviction_ratio_percent {} outside 0..=100",
                self.storage.eviction_ratio_percent
            )));
        }
        if self.expiration.default_absolute_secs.is_some()
            && self.expiration.default_sliding_secs.is_some()
        {
            return Err(Error::Config(
                "default absolute and sliding expiration are mutually exclusive".into(),
            ));
        }
        if self.pooling.initial_capacity > self.pooling.max_capacity {
            return Err(Error::Config(format!(
                "pool initial capacity {} exceeds max capacity {}",
                self.pooling.initial_capacity, self.pooling.max_capacity
            )));
        }
        if !(0.0..=1.0).contains(&self.pooling.serving_capability_borderline) {
            return Err(Error::Config(
                "serving_capability_borderline must be within 0..=1".into(),
            ));
        }
        if self.topology.is_clustered() && self.cluster.presence_interval_ms == 0 {
            return Err(Error::Config("presence_interval_ms must be positive".into()));
        }
        if self.cluster.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be positive".into()));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.presence_interval_ms)
    }

    /// Silence after which a peer is declared failed
    pub fn failure_timeout(&self) -> Duration {
        self.presence_interval() * self.cluster.failure_threshold
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.lock_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.requests.request_timeout_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.presence_interval_ms, 5_000);
        assert_eq!(config.storage.eviction_ratio_percent, 5.0);
        assert_eq!(config.failure_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
cache_name: orders
topology: partitioned-replica
cluster_port: 7900
storage:
  capacity_bytes: 1024
  eviction_ratio_percent: 10.0
expiration:
  default_sliding_secs: 300
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache_name, "orders");
        assert_eq!(config.topology, TopologyKind::PartitionedReplica);
        assert_eq!(config.cluster_port, 7900);
        assert_eq!(config.storage.capacity_bytes, 1024);
        assert_eq!(config.expiration.default_sliding_secs, Some(300));
        // Unspecified sections fall back to defaults
        assert!(config.pooling.enabled);
    }

    #[test]
    fn test_conflicting_default_expirations_rejected() {
        let yaml = r#"
cache_name: c
expiration:
  default_absolute_secs: 10
  default_sliding_secs: 10
"#;
        assert_matches!(CacheConfig::from_yaml_str(yaml), Err(Error::Config(_)));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        assert_matches!(
            CacheConfig::from_yaml_str("topology: [not, a, topology]"),
            Err(Error::Yaml(_))
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let config = CacheConfig {
            cache_name: "  ".into(),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_topology_display() {
        assert_eq!(TopologyKind::PartitionedReplica.to_string(), "partitioned-replica");
        assert!(TopologyKind::Partitioned.is_partitioned());
        assert!(!TopologyKind::Local.is_clustered());
    }
}
