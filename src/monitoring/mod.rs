//! Management and Monitoring Surface
//!
//! Read-only contracts consumed by management tools and probes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          CacheInstance                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐  ┌──────────────────┐  ┌──────────────────┐  │
//! │  │ CacheMetrics       │  │ HealthCheck      │  │ ApiLogger        │  │
//! │  │ (own Registry)     │  │ live/ready +     │  │ bounded ring of  │  │
//! │  │                    │  │ node/membership  │  │ recent calls     │  │
//! │  └─────────┬──────────┘  └────────┬─────────┘  └──────────────────┘  │
//! │            │                      │                                  │
//! │      MetricsSnapshot ◀────────────┘                                  │
//! │   (pools, store, node, ledger, queries)                              │
//! └──────────────────────────────────────────────────────────────────────┘
//!              │
//!              ▼  /metrics  /healthz  /livez  /readyz  (meshcache-node)
//! ```

mod api_log;
mod exporter;
mod health;

pub use api_log::{ApiLogEntry, ApiLogger};
pub use exporter::{CacheMetrics, MetricsSnapshot};
pub use health::{
    membership_check, node_status_check, HealthCheck, HealthCheckResult, HealthResponse,
    HealthStatus,
};
