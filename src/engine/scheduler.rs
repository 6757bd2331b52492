//! Periodic task scheduler.
//!
//! Each task runs on its own loop and reports the delay before its next run,
//! so intervals can change at runtime. Loops stop on the scheduler's
//! cancellation token and are joined by [`TimeScheduler::shutdown`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A housekeeping job driven by the [`TimeScheduler`]
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;

    /// Delay before the next run; `None` retires the task
    fn next_interval(&self) -> Option<Duration>;

    async fn run(&self);
}

struct ScheduledLoop {
    name: String,
    handle: JoinHandle<()>,
}

pub struct TimeScheduler {
    token: CancellationToken,
    loops: Mutex<Vec<ScheduledLoop>>,
    runs: Arc<AtomicU64>,
}

impl TimeScheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the loop of `task` on the current runtime
    pub fn add_task(&self, task: Arc<dyn ScheduledTask>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::InvalidState(format!(
                "scheduler stopped, cannot add {}",
                task.name()
            )));
        }
        let name = task.name().to_string();
        let token = self.token.child_token();
        let runs = self.runs.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(delay) = task.next_interval() else {
                    debug!(task = task.name(), "Task retired");
                    break;
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                task.run().await;
                runs.fetch_add(1, Ordering::Relaxed);
            }
        });
        debug!(task = %name, "Scheduled task");
        self.loops.lock().push(ScheduledLoop { name, handle });
        Ok(())
    }

    pub fn task_names(&self) -> Vec<String> {
        self.loops.lock().iter().map(|l| l.name.clone()).collect()
    }

    /// Completed task runs across all loops
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal every loop to stop and wait for them to finish
    pub async fn shutdown(&self) {
        self.token.cancel();
        let loops = std::mem::take(&mut *self.loops.lock());
        let count = loops.len();
        for scheduled in loops {
            if let Err(e) = scheduled.handle.await {
                warn!(task = %scheduled.name, error = %e, "Scheduled task ended abnormally");
            }
        }
        info!(tasks = count, "Scheduler stopped");
    }
}

impl Default for TimeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Ticker {
        ticks: AtomicU64,
        limit: Option<u64>,
    }

    #[async_trait]
    impl ScheduledTask for Ticker {
        fn name(&self) -> &str {
            "ticker"
        }

        fn next_interval(&self) -> Option<Duration> {
            match self.limit {
                Some(limit) if self.ticks.load(Ordering::Relaxed) >= limit => None,
                _ => Some(Duration::from_millis(5)),
            }
        }

        async fn run(&self) {
            self.ticks.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn ticker(limit: Option<u64>) -> Arc<Ticker> {
        Arc::new(Ticker {
            ticks: AtomicU64::new(0),
            limit,
        })
    }

    #[tokio::test]
    async fn test_task_runs_until_shutdown() {
        let scheduler = TimeScheduler::new();
        let task = ticker(None);
        scheduler.add_task(task.clone()).unwrap();
        assert_eq!(scheduler.task_names(), vec!["ticker".to_string()]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown().await;
        let after_shutdown = task.ticks.load(Ordering::Relaxed);
        assert!(after_shutdown >= 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.ticks.load(Ordering::Relaxed), after_shutdown);
        assert!(scheduler.task_names().is_empty());
    }

    #[tokio::test]
    async fn test_task_retires_itself() {
        let scheduler = TimeScheduler::new();
        let task = ticker(Some(2));
        scheduler.add_task(task.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(task.ticks.load(Ordering::Relaxed), 2);
        assert_eq!(scheduler.runs(), 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_scheduler_rejects_tasks() {
        let scheduler = TimeScheduler::new();
        scheduler.shutdown().await;
        assert!(scheduler.is_stopped());
        assert_matches!(scheduler.add_task(ticker(None)), Err(Error::InvalidState(_)));
    }
}
