//! Error types for the meshcache engine
//!
//! Lock conflicts, lock-wait timeouts and missing keys on the storage path are
//! not errors: they are reported through [`crate::storage::Outcome`]. The
//! variants here cover failures that abort an operation.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON payload error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Operation attempted in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation was cancelled by the request ledger or shutdown
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Add on a key that is already present
    #[error("Key already exists: {key}")]
    KeyAlreadyExists { key: String },

    /// Insert tried to change the data group of an existing key
    #[error("Data group mismatch for key {key}: stored {existing}, requested {requested}")]
    DataGroupMismatch {
        key: String,
        existing: String,
        requested: String,
    },

    /// Cache is full and eviction could not free enough space
    #[error("Not enough items evicted: needed {required} bytes, only {evictable} evictable")]
    NotEnoughItemsEvicted { required: u64, evictable: u64 },

    /// Optimistic concurrency check failed
    #[error("Version mismatch for key {key}: expected {expected}, found {actual}")]
    VersionMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Item locked by another holder (command-boundary form of `Outcome::Locked`)
    #[error("Item locked: {key} (lock {lock_id} held by {holder})")]
    ItemLocked {
        key: String,
        lock_id: u64,
        holder: String,
    },

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// Unresolvable type handle or corrupt compact stream
    #[error("Compact serialization error: {0}")]
    CompactSerialization(String),

    // =========================================================================
    // Cluster Errors
    // =========================================================================
    /// No targeted node answered within the operation timeout
    #[error("Operation {operation} timed out after {timeout_ms}ms")]
    OperationTimeout { operation: String, timeout_ms: u64 },

    /// Some targeted nodes answered, others did not; the operation may be applied
    #[error("Operation {operation} partially timed out: responded {responded:?}, missing {missing:?}")]
    PartialTimeout {
        operation: String,
        responded: Vec<String>,
        missing: Vec<String>,
    },

    /// Target node is not reachable through the transport
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// Cluster membership change could not be applied
    #[error("Cluster membership error: {0}")]
    ClusterMembership(String),

    /// State transfer gave up after bounded retries
    #[error("State transfer from {source_node} failed after {attempts} attempts: {reason}")]
    StateTransferFailed {
        source_node: String,
        attempts: u32,
        reason: String,
    },

    /// Remote node reported a failure for a forwarded operation
    #[error("Remote error from {node}: {message}")]
    Remote { node: String, message: String },

    // =========================================================================
    // Pooling Errors
    // =========================================================================
    /// Pool misconfiguration or misuse
    #[error("Pool error: {0}")]
    Pool(String),

    // =========================================================================
    // Query Errors
    // =========================================================================
    /// Continuous query id is not registered
    #[error("Continuous query not found: {0}")]
    QueryNotFound(String),

    /// MapReduce task name is not registered
    #[error("MapReduce task not registered: {0}")]
    TaskNotFound(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl Error {
    /// Short machine-readable kind, used by the command boundary and API log
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Yaml(_) | Error::Config(_) => "config",
            Error::Json(_) => "json",
            Error::Metrics(_) => "metrics",
            Error::Internal(_) => "internal",
            Error::InvalidState(_) => "invalid_state",
            Error::Cancelled(_) => "cancelled",
            Error::KeyAlreadyExists { .. } => "key_already_exists",
            Error::DataGroupMismatch { .. } => "data_group_mismatch",
            Error::NotEnoughItemsEvicted { .. } => "not_enough_items_evicted",
            Error::VersionMismatch { .. } => "version_mismatch",
            Error::ItemLocked { .. } => "item_locked",
            Error::CompactSerialization(_) => "compact_serialization",
            Error::OperationTimeout { .. } => "request_timeout",
            Error::PartialTimeout { .. } => "partial_timeout",
            Error::NodeUnreachable(_) => "node_unreachable",
            Error::ClusterMembership(_) => "cluster_membership",
            Error::StateTransferFailed { .. } => "state_transfer_failed",
            Error::Remote { .. } => "remote",
            Error::Pool(_) => "pool",
            Error::QueryNotFound(_) => "query_not_found",
            Error::TaskNotFound(_) => "task_not_found",
            Error::CompressionFailed { .. } | Error::DecompressionFailed { .. } => "compression",
        }
    }

    /// Whether a caller may retry after backing off.
    ///
    /// Timeouts are excluded: the operation may already have been applied.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ItemLocked { .. } | Error::NodeUnreachable(_) | Error::NotEnoughItemsEvicted { .. }
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
