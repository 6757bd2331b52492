//! API call log.
//!
//! Keeps the most recent client calls in a bounded buffer for management
//! tools. Disabled loggers record nothing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ApiLogConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiLogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub command: String,
    pub key: Option<String>,
    /// Response name, or the error kind for failed calls
    pub outcome: String,
    pub duration_us: u64,
}

pub struct ApiLogger {
    enabled: bool,
    capacity: usize,
    entries: Mutex<VecDeque<ApiLogEntry>>,
    recorded: AtomicU64,
}

impl ApiLogger {
    pub fn new(config: &ApiLogConfig) -> Self {
        Self {
            enabled: config.enabled && config.capacity > 0,
            capacity: config.capacity,
            entries: Mutex::new(VecDeque::with_capacity(if config.enabled {
                config.capacity
            } else {
                0
            })),
            recorded: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn log(&self, entry: ApiLogEntry) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Up to `limit` most recent entries, newest last
    pub fn recent(&self, limit: usize) -> Vec<ApiLogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls recorded since creation, including those already dropped
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(command: &str) -> ApiLogEntry {
        ApiLogEntry {
            timestamp: Utc::now(),
            client_id: "c1".into(),
            command: command.into(),
            key: None,
            outcome: "ok".into(),
            duration_us: 10,
        }
    }

    #[test]
    fn test_keeps_most_recent_entries() {
        let logger = ApiLogger::new(&ApiLogConfig {
            enabled: true,
            capacity: 2,
        });
        logger.log(entry("add"));
        logger.log(entry("get"));
        logger.log(entry("remove"));

        let recent: Vec<String> = logger.recent(10).into_iter().map(|e| e.command).collect();
        assert_eq!(recent, vec!["get".to_string(), "remove".to_string()]);
        assert_eq!(logger.recent(1)[0].command, "remove");
        assert_eq!(logger.recorded(), 3);
    }

    #[test]
    fn test_disabled_logger_records_nothing() {
        let logger = ApiLogger::new(&ApiLogConfig::default());
        logger.log(entry("add"));
        assert!(logger.is_empty());
        assert!(!logger.is_enabled());
    }
}
