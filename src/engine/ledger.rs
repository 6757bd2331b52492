//! Per-client request ledger.
//!
//! Every command executed for a client is tracked here until it completes.
//! The [`RequestMonitor`] task cancels requests that outlive the request
//! timeout and releases the item locks of clients that went away, on every
//! node that holds them.
//! Cancellation is cooperative: the executor races each command against its
//! request's cancellation token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::scheduler::ScheduledTask;
use crate::cluster::ClusterNode;
use crate::error::Result;
use crate::storage::LocalStore;

/// One in-flight client command
#[derive(Debug)]
pub struct TrackedRequest {
    id: u64,
    client_id: String,
    command: &'static str,
    started: Instant,
    token: CancellationToken,
}

impl TrackedRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn command(&self) -> &'static str {
        self.command
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn has_timed_out(&self, timeout: Duration) -> bool {
        self.elapsed() > timeout
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Completes once the request is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub outstanding: usize,
    pub tracked: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub disconnected_clients: usize,
}

#[derive(Default)]
pub struct RequestLedger {
    requests: DashMap<u64, Arc<TrackedRequest>>,
    /// Disconnected clients whose locks are not yet released
    disconnected: DashMap<String, Instant>,
    next_id: AtomicU64,
    tracked: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, client_id: &str, command: &'static str) -> Arc<TrackedRequest> {
        let request = Arc::new(TrackedRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            client_id: client_id.to_string(),
            command,
            started: Instant::now(),
            token: CancellationToken::new(),
        });
        self.requests.insert(request.id, request.clone());
        self.tracked.fetch_add(1, Ordering::Relaxed);
        request
    }

    pub fn complete(&self, id: u64) {
        if self.requests.remove(&id).is_some() {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<TrackedRequest>> {
        self.requests.get(&id).map(|r| r.clone())
    }

    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    pub fn outstanding_for(&self, client_id: &str) -> usize {
        self.requests
            .iter()
            .filter(|r| r.client_id == client_id)
            .count()
    }

    /// Cancel requests running longer than `timeout`, returning their ids
    pub fn cancel_timed_out(&self, timeout: Duration) -> Vec<u64> {
        let expired: Vec<Arc<TrackedRequest>> = self
            .requests
            .iter()
            .filter(|r| !r.is_cancelled() && r.has_timed_out(timeout))
            .map(|r| r.clone())
            .collect();
        for request in &expired {
            warn!(
                request = request.id,
                client = %request.client_id,
                command = request.command,
                elapsed_ms = request.elapsed().as_millis() as u64,
                "Cancelling timed-out request"
            );
            request.cancel();
            self.requests.remove(&request.id);
        }
        self.timed_out
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.iter().map(|r| r.id).collect()
    }

    /// Cancel every outstanding request of a client
    pub fn cancel_client(&self, client_id: &str) -> usize {
        let ids: Vec<u64> = self
            .requests
            .iter()
            .filter(|r| r.client_id == client_id)
            .map(|r| r.id)
            .collect();
        for id in &ids {
            if let Some((_, request)) = self.requests.remove(id) {
                request.cancel();
            }
        }
        self.cancelled.fetch_add(ids.len() as u64, Ordering::Relaxed);
        if !ids.is_empty() {
            debug!(client = client_id, cancelled = ids.len(), "Cancelled client requests");
        }
        ids.len()
    }

    /// Record a client disconnect and cancel its requests
    pub fn client_disconnected(&self, client_id: &str) -> usize {
        self.disconnected
            .insert(client_id.to_string(), Instant::now());
        self.cancel_client(client_id)
    }

    /// A disconnected client came back before its locks were released
    pub fn client_reconnected(&self, client_id: &str) {
        self.disconnected.remove(client_id);
    }

    /// Disconnected clients whose grace period ran out; each is returned once
    pub fn take_dead_clients(&self, grace: Duration) -> Vec<String> {
        let dead: Vec<String> = self
            .disconnected
            .iter()
            .filter(|c| c.value().elapsed() >= grace)
            .map(|c| c.key().clone())
            .collect();
        for client in &dead {
            self.disconnected.remove(client);
        }
        dead
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            outstanding: self.requests.len(),
            tracked: self.tracked.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            disconnected_clients: self.disconnected.len(),
        }
    }
}

/// Where the locks of a dead client are released
#[async_trait]
pub trait LockReleaser: Send + Sync {
    async fn release_locks(&self, holder: &str) -> Result<usize>;
}

#[async_trait]
impl LockReleaser for LocalStore {
    async fn release_locks(&self, holder: &str) -> Result<usize> {
        Ok(self.release_locks_held_by(holder))
    }
}

#[async_trait]
impl LockReleaser for ClusterNode {
    async fn release_locks(&self, holder: &str) -> Result<usize> {
        self.release_locks_held_by(holder).await
    }
}

/// Periodic scan of the ledger
pub struct RequestMonitor {
    ledger: Arc<RequestLedger>,
    releaser: Arc<dyn LockReleaser>,
    interval: Duration,
    request_timeout: Duration,
    dead_client_grace: Duration,
}

impl RequestMonitor {
    pub fn new(
        ledger: Arc<RequestLedger>,
        releaser: Arc<dyn LockReleaser>,
        interval: Duration,
        request_timeout: Duration,
        dead_client_grace: Duration,
    ) -> Self {
        Self {
            ledger,
            releaser,
            interval,
            request_timeout,
            dead_client_grace,
        }
    }
}

#[async_trait]
impl ScheduledTask for RequestMonitor {
    fn name(&self) -> &str {
        "request-monitor"
    }

    fn next_interval(&self) -> Option<Duration> {
        (!self.interval.is_zero()).then_some(self.interval)
    }

    async fn run(&self) {
        self.ledger.cancel_timed_out(self.request_timeout);
        for client in self.ledger.take_dead_clients(self.dead_client_grace) {
            match self.releaser.release_locks(&client).await {
                Ok(0) => {}
                Ok(released) => info!(client = %client, released, "Released locks of dead client"),
                Err(e) => warn!(client = %client, error = %e, "Releasing locks of dead client failed"),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::{CacheEntry, CacheValue, LockAccess, Outcome, SystemClock};
    use chrono::Utc;

    #[test]
    fn test_track_and_complete() {
        let ledger = RequestLedger::new();
        let a = ledger.track("client-1", "get");
        let b = ledger.track("client-1", "insert");
        assert_ne!(a.id(), b.id());
        assert_eq!(ledger.outstanding_for("client-1"), 2);

        ledger.complete(a.id());
        ledger.complete(a.id());
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.outstanding, 1);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.tracked, 2);
    }

    #[test]
    fn test_timed_out_requests_are_cancelled() {
        let ledger = RequestLedger::new();
        let slow = ledger.track("client-1", "lock");
        std::thread::sleep(Duration::from_millis(15));
        let fresh = ledger.track("client-1", "get");

        let cancelled = ledger.cancel_timed_out(Duration::from_millis(10));
        assert_eq!(cancelled, vec![slow.id()]);
        assert!(slow.is_cancelled());
        assert!(!fresh.is_cancelled());
        assert_eq!(ledger.snapshot().timed_out, 1);
    }

    #[test]
    fn test_disconnect_cancels_client_requests() {
        let ledger = RequestLedger::new();
        let mine = ledger.track("gone", "get");
        let theirs = ledger.track("other", "get");

        assert_eq!(ledger.client_disconnected("gone"), 1);
        assert!(mine.is_cancelled());
        assert!(!theirs.is_cancelled());

        assert!(ledger.take_dead_clients(Duration::from_secs(60)).is_empty());
        assert_eq!(ledger.take_dead_clients(Duration::ZERO), vec!["gone".to_string()]);
        assert!(ledger.take_dead_clients(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_cancel_wakes_waiting_request() {
        use tokio_test::{assert_pending, assert_ready, task};

        let ledger = RequestLedger::new();
        let request = ledger.track("client-1", "lock");
        let mut waiting = task::spawn(request.cancelled());
        assert_pending!(waiting.poll());

        ledger.cancel_client("client-1");
        assert!(waiting.is_woken());
        assert_ready!(waiting.poll());
    }

    #[tokio::test]
    async fn test_monitor_releases_dead_client_locks() {
        let store = Arc::new(LocalStore::new(
            "ledger",
            &StorageConfig::default(),
            Arc::new(SystemClock),
        ));
        store
            .add(CacheEntry::new("k", CacheValue::object(1i64), Utc::now()))
            .unwrap();
        assert!(store.lock("k", "gone", None, LockAccess::Fail).await.is_done());

        let ledger = Arc::new(RequestLedger::new());
        ledger.client_disconnected("gone");
        let monitor = RequestMonitor::new(
            ledger.clone(),
            store.clone(),
            Duration::from_millis(10),
            Duration::from_secs(90),
            Duration::ZERO,
        );
        monitor.run().await;

        assert!(matches!(
            store.lock("k", "next", None, LockAccess::Fail).await,
            Outcome::Done(_)
        ));
    }
}
