//! Scheduled cluster housekeeping.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::node::ClusterNode;
use crate::engine::ScheduledTask;

/// Broadcasts this node's status and statistics every interval
pub struct PresenceTask {
    node: Weak<ClusterNode>,
    interval: Duration,
}

impl PresenceTask {
    pub fn new(node: &Arc<ClusterNode>, interval: Duration) -> Self {
        Self {
            node: Arc::downgrade(node),
            interval,
        }
    }
}

#[async_trait]
impl ScheduledTask for PresenceTask {
    fn name(&self) -> &str {
        "presence-announcement"
    }

    fn next_interval(&self) -> Option<Duration> {
        if self.node.strong_count() == 0 {
            return None;
        }
        Some(self.interval)
    }

    async fn run(&self) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        if !node.status().is_serving() {
            return;
        }
        let result = node.announce_presence().await;
        debug!(node = %node.id(), result = ?result, "Announced presence");
    }
}

/// Declares peers failed once they miss enough presence announcements
pub struct FailureDetectorTask {
    node: Weak<ClusterNode>,
    interval: Duration,
}

impl FailureDetectorTask {
    pub fn new(node: &Arc<ClusterNode>, interval: Duration) -> Self {
        Self {
            node: Arc::downgrade(node),
            interval,
        }
    }
}

#[async_trait]
impl ScheduledTask for FailureDetectorTask {
    fn name(&self) -> &str {
        "failure-detector"
    }

    fn next_interval(&self) -> Option<Duration> {
        if self.node.strong_count() == 0 {
            return None;
        }
        Some(self.interval)
    }

    async fn run(&self) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        if !node.status().is_serving() {
            return;
        }
        let failed = node.check_failures().await;
        if !failed.is_empty() {
            warn!(node = %node.id(), failed = ?failed, "Detected failed peers");
        }
    }
}
