//! Local Store
//!
//! Authoritative key→entry map for the locally owned key space.
//!
//! Lock, timeout and not-found conditions are reported as [`Outcome`]
//! variants. Errors are reserved for rule violations (duplicate add, group
//! change, stale version, full cache).
//!
//! A write that meets an item lock either fails fast or waits for a
//! release, depending on the caller's [`LockAccess`]. Waiters are woken by
//! unlock, lock-releasing writes and removals; lock leases that run out on
//! their own are noticed by a short re-poll.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, instrument};

use super::clock::{add_duration, Clock};
use super::entry::{CacheEntry, LockInfo};
use super::metrics::{StoreMetrics, StoreMetricsSnapshot};
use super::policy::{policy_for, EvictionCandidate, EvictionPolicy};
use super::shard::ShardedMap;
use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Longest single wait before re-checking a lock whose lease may have run out
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Outcomes and options
// =============================================================================

/// How an operation treats an item lock held by someone else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAccess {
    /// Proceed regardless of locks
    Ignore,
    /// Report `Outcome::Locked` immediately
    Fail,
    /// Wait up to the duration for the lock to go away
    Wait(Duration),
    /// Caller holds this lock id
    Owner(u64),
}

/// Result of a storage operation that may meet a lock
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    Locked(LockInfo),
    TimedOut,
    NotFound,
}

impl<T> Outcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done(_))
    }

    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Done(value) => Outcome::Done(f(value)),
            Outcome::Locked(lock) => Outcome::Locked(lock),
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::NotFound => Outcome::NotFound,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Done(_) => "done",
            Outcome::Locked(_) => "locked",
            Outcome::TimedOut => "timed-out",
            Outcome::NotFound => "not-found",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InsertOptions {
    pub access: LockAccess,
    /// Fail with `VersionMismatch` unless the stored version equals this
    pub expected_version: Option<u64>,
}

impl Default for InsertOptions {
    fn default() -> Self {
        Self {
            access: LockAccess::Fail,
            expected_version: None,
        }
    }
}

// =============================================================================
// Change notification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemovalReason {
    Removed,
    Expired,
    Evicted,
    GroupRemoved,
    Cleared,
}

#[derive(Debug)]
pub enum StoreChange<'a> {
    Added(&'a CacheEntry),
    Updated(&'a CacheEntry),
    Removed {
        key: &'a str,
        reason: RemovalReason,
    },
}

/// Receives store mutations after they are applied
pub trait StoreObserver: Send + Sync {
    fn on_change(&self, change: &StoreChange<'_>);
}

/// Read-only store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub name: String,
    pub entries: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub eviction_policy: &'static str,
    pub metrics: StoreMetricsSnapshot,
}

// =============================================================================
// Store
// =============================================================================

enum Step<R> {
    Done(R),
    Blocked(LockInfo),
}

enum Gate<R> {
    Done(R),
    Locked(LockInfo),
    TimedOut,
}

type EntryMap = HashMap<Arc<str>, CacheEntry>;

/// Live entry for `key`, moving an expired one into `expired`
fn take_live<'m>(
    map: &'m mut EntryMap,
    key: &str,
    now: DateTime<Utc>,
    expired: &mut Vec<CacheEntry>,
) -> Option<&'m mut CacheEntry> {
    if map.get(key).is_some_and(|entry| entry.is_expired(now)) {
        expired.extend(map.remove(key));
        return None;
    }
    map.get_mut(key)
}

enum Admission {
    Admit,
    Blocked(LockInfo),
    Reject(Error),
}

/// Lock, version and group checks of an insert against the live entry
fn admit_insert(
    current: Option<&CacheEntry>,
    incoming: Option<&CacheEntry>,
    key: &str,
    options: InsertOptions,
    now: DateTime<Utc>,
) -> Admission {
    let Some(incoming) = incoming else {
        return Admission::Reject(Error::Internal("insert attempted twice".to_string()));
    };
    if let Some(lock) = current.and_then(|c| blocking_lock(c, options.access, now)) {
        return Admission::Blocked(lock);
    }

    let current_version = current.map_or(0, |c| c.version);
    if let Some(expected) = options.expected_version {
        if expected != current_version {
            return Admission::Reject(Error::VersionMismatch {
                key: key.to_string(),
                expected,
                actual: current_version,
            });
        }
    }

    if let Some(stored_group) = current.and_then(|c| c.group.as_ref()) {
        if incoming.group.as_ref() != Some(stored_group) {
            return Admission::Reject(Error::DataGroupMismatch {
                key: key.to_string(),
                existing: stored_group.to_string(),
                requested: incoming
                    .group
                    .as_ref()
                    .map_or_else(|| "none".to_string(), |g| g.to_string()),
            });
        }
    }
    Admission::Admit
}

/// Lock that stops `access` on `entry`, if any
fn blocking_lock(entry: &CacheEntry, access: LockAccess, now: DateTime<Utc>) -> Option<LockInfo> {
    let lock = entry.active_lock(now)?;
    match access {
        LockAccess::Ignore => None,
        LockAccess::Owner(lock_id) if lock_id == lock.lock_id => None,
        _ => Some(lock.clone()),
    }
}

pub struct LocalStore {
    name: String,
    entries: ShardedMap<CacheEntry>,
    used_bytes: AtomicU64,
    capacity_bytes: u64,
    eviction_ratio_percent: f64,
    eviction: Box<dyn EvictionPolicy>,
    clock: Arc<dyn Clock>,
    next_version: AtomicU64,
    next_lock_id: AtomicU64,
    lock_released: Notify,
    observers: RwLock<Vec<Arc<dyn StoreObserver>>>,
    metrics: StoreMetrics,
}

impl LocalStore {
    /// `capacity_bytes == 0` means unbounded
    pub fn new(name: impl Into<String>, config: &StorageConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            entries: ShardedMap::new(),
            used_bytes: AtomicU64::new(0),
            capacity_bytes: config.capacity_bytes,
            eviction_ratio_percent: config.eviction_ratio_percent,
            eviction: policy_for(config.eviction_policy),
            clock,
            next_version: AtomicU64::new(0),
            next_lock_id: AtomicU64::new(0),
            lock_released: Notify::new(),
            observers: RwLock::new(Vec::new()),
            metrics: StoreMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn add_observer(&self, observer: Arc<dyn StoreObserver>) {
        self.observers.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            name: self.name.clone(),
            entries: self.len(),
            used_bytes: self.used_bytes(),
            capacity_bytes: self.capacity_bytes,
            eviction_policy: self.eviction.name(),
            metrics: self.metrics.snapshot(),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read an entry; a hit refreshes sliding expiration
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn get(&self, key: &str, access: LockAccess) -> Outcome<CacheEntry> {
        let started = Instant::now();
        let gate = self
            .gate(access, || {
                let now = self.clock.now();
                let mut expired = Vec::new();
                let step = self.entries.write(key, |map| {
                    match take_live(map, key, now, &mut expired) {
                        None => Step::Done(None),
                        Some(entry) => match blocking_lock(entry, access, now) {
                            Some(lock) => Step::Blocked(lock),
                            None => {
                                entry.touch(now);
                                Step::Done(Some(entry.clone()))
                            }
                        },
                    }
                });
                self.finish_removals(expired, RemovalReason::Expired);
                step
            })
            .await;
        self.metrics.record_read_latency(started.elapsed());

        match gate {
            Gate::Done(Some(entry)) => {
                self.metrics.record_hit();
                Outcome::Done(entry)
            }
            Gate::Done(None) => {
                self.metrics.record_miss();
                Outcome::NotFound
            }
            Gate::Locked(lock) => Outcome::Locked(lock),
            Gate::TimedOut => Outcome::TimedOut,
        }
    }

    /// Live entry without touching it or checking locks
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        self.entries.read(key, |entry| {
            entry.filter(|e| !e.is_expired(now)).cloned()
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .read(key, |entry| entry.is_some_and(|e| !e.is_expired(now)))
    }

    pub fn keys(&self) -> Vec<Arc<str>> {
        let now = self.clock.now();
        let mut keys = Vec::new();
        self.entries.for_each(|key, entry| {
            if !entry.is_expired(now) {
                keys.push(key.clone());
            }
        });
        keys
    }

    /// Snapshot of every live entry
    pub fn entries(&self) -> Vec<CacheEntry> {
        let now = self.clock.now();
        let mut entries = Vec::new();
        self.entries.for_each(|_, entry| {
            if !entry.is_expired(now) {
                entries.push(entry.clone());
            }
        });
        entries
    }

    /// Keys carrying any (or all) of `tags`
    pub fn keys_by_tag(&self, tags: &[String], match_all: bool) -> Vec<Arc<str>> {
        let now = self.clock.now();
        let mut keys = Vec::new();
        self.entries.for_each(|key, entry| {
            if entry.is_expired(now) || tags.is_empty() {
                return;
            }
            let matched = if match_all {
                tags.iter().all(|t| entry.has_tag(t))
            } else {
                tags.iter().any(|t| entry.has_tag(t))
            };
            if matched {
                keys.push(key.clone());
            }
        });
        keys
    }

    pub fn keys_in_group(&self, group: &str, subgroup: Option<&str>) -> Vec<Arc<str>> {
        let now = self.clock.now();
        let mut keys = Vec::new();
        self.entries.for_each(|key, entry| {
            if !entry.is_expired(now)
                && entry.group.as_ref().is_some_and(|g| g.matches(group, subgroup))
            {
                keys.push(key.clone());
            }
        });
        keys
    }

    /// Keys of live entries satisfying `filter`
    pub fn keys_where(&self, mut filter: impl FnMut(&CacheEntry) -> bool) -> Vec<Arc<str>> {
        let now = self.clock.now();
        let mut keys = Vec::new();
        self.entries.for_each(|key, entry| {
            if !entry.is_expired(now) && filter(entry) {
                keys.push(key.clone());
            }
        });
        keys
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Add a new key; fails if a live entry exists
    #[instrument(skip(self, entry), fields(store = %self.name, key = %entry.key))]
    pub fn add(&self, mut entry: CacheEntry) -> Result<u64> {
        let now = self.clock.now();
        let key = entry.key.clone();
        if self.contains_key(&key) {
            return Err(Error::KeyAlreadyExists {
                key: key.to_string(),
            });
        }
        self.make_room(entry.size, &key)?;

        let mut expired = Vec::new();
        let applied = self.entries.write(&key, |map| {
            if take_live(map, &key, now, &mut expired).is_some() {
                return Err(Error::KeyAlreadyExists {
                    key: key.to_string(),
                });
            }
            entry.version = self.bump_version();
            entry.last_modified = now;
            self.charge(entry.size, 0);
            map.insert(key.clone(), entry.clone());
            Ok(entry)
        });
        self.finish_removals(expired, RemovalReason::Expired);

        let stored = applied?;
        self.metrics.record_add();
        self.notify(&StoreChange::Added(&stored));
        Ok(stored.version)
    }

    /// Add or overwrite; a successful insert releases the item lock
    #[instrument(skip(self, entry), fields(store = %self.name, key = %entry.key))]
    pub async fn insert(&self, entry: CacheEntry, options: InsertOptions) -> Result<Outcome<u64>> {
        let started = Instant::now();
        let key = entry.key.clone();
        let incoming_size = entry.size;

        let mut pending = Some(entry);
        let gate = self
            .gate(options.access, || {
                let now = self.clock.now();

                // Only an admissible insert may evict other entries
                let (admission, old_size) = self.entries.read(&key, |current| {
                    let live = current.filter(|c| !c.is_expired(now));
                    (
                        admit_insert(live, pending.as_ref(), &key, options, now),
                        live.map_or(0, |c| c.size),
                    )
                });
                match admission {
                    Admission::Admit => {}
                    Admission::Blocked(lock) => return Step::Blocked(lock),
                    Admission::Reject(e) => return Step::Done(Err(e)),
                }
                if let Err(e) = self.make_room(incoming_size.saturating_sub(old_size), &key) {
                    return Step::Done(Err(e));
                }

                let mut expired = Vec::new();
                let step = self.entries.write(&key, |map| {
                    let existing = take_live(map, &key, now, &mut expired);
                    match admit_insert(existing.as_deref(), pending.as_ref(), &key, options, now) {
                        Admission::Admit => {}
                        Admission::Blocked(lock) => return Step::Blocked(lock),
                        Admission::Reject(e) => return Step::Done(Err(e)),
                    }
                    let Some(mut entry) = pending.take() else {
                        return Step::Done(Err(Error::Internal(
                            "insert attempted twice".to_string(),
                        )));
                    };

                    let mut replaced = None;
                    if let Some(current) = existing {
                        entry.created_at = current.created_at;
                        replaced = Some((current.size, current.lock.is_some()));
                    }

                    entry.version = self.bump_version();
                    entry.last_modified = now;
                    entry.lock = None;
                    let (removed_size, released) = replaced.unwrap_or((0, false));
                    self.charge(entry.size, removed_size);
                    map.insert(key.clone(), entry.clone());
                    Step::Done(Ok((entry, replaced.is_some(), released)))
                });
                self.finish_removals(expired, RemovalReason::Expired);
                step
            })
            .await;
        self.metrics.record_write_latency(started.elapsed());

        match gate {
            Gate::Done(Ok((stored, replaced, released))) => {
                self.metrics.record_insert();
                if released {
                    self.lock_released.notify_waiters();
                }
                let change = if replaced {
                    StoreChange::Updated(&stored)
                } else {
                    StoreChange::Added(&stored)
                };
                self.notify(&change);
                Ok(Outcome::Done(stored.version))
            }
            Gate::Done(Err(e)) => Err(e),
            Gate::Locked(lock) => Ok(Outcome::Locked(lock)),
            Gate::TimedOut => Ok(Outcome::TimedOut),
        }
    }

    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn remove(&self, key: &str, access: LockAccess) -> Outcome<CacheEntry> {
        let gate = self
            .gate(access, || {
                let now = self.clock.now();
                let mut expired = Vec::new();
                let step = self.entries.write(key, |map| {
                    match take_live(map, key, now, &mut expired) {
                        None => return Step::Done(None),
                        Some(entry) => {
                            if let Some(lock) = blocking_lock(entry, access, now) {
                                return Step::Blocked(lock);
                            }
                        }
                    }
                    Step::Done(map.remove(key))
                });
                self.finish_removals(expired, RemovalReason::Expired);
                step
            })
            .await;

        match gate {
            Gate::Done(Some(entry)) => {
                self.metrics.record_remove();
                self.charge(0, entry.size);
                if entry.lock.is_some() {
                    self.lock_released.notify_waiters();
                }
                self.notify(&StoreChange::Removed {
                    key: &entry.key,
                    reason: RemovalReason::Removed,
                });
                Outcome::Done(entry)
            }
            Gate::Done(None) => Outcome::NotFound,
            Gate::Locked(lock) => Outcome::Locked(lock),
            Gate::TimedOut => Outcome::TimedOut,
        }
    }

    /// Remove every unlocked entry of a group
    pub fn remove_group(&self, group: &str, subgroup: Option<&str>) -> Vec<Arc<str>> {
        let now = self.clock.now();
        let removed = self.entries.drain_where(|entry| {
            entry.active_lock(now).is_none()
                && entry.group.as_ref().is_some_and(|g| g.matches(group, subgroup))
        });
        let keys = removed.iter().map(|e| e.key.clone()).collect();
        self.finish_removals(removed, RemovalReason::GroupRemoved);
        keys
    }

    /// Remove expired entries, returning their keys
    pub fn sweep_expired(&self) -> Vec<Arc<str>> {
        let now = self.clock.now();
        let expired = self.entries.drain_where(|entry| entry.is_expired(now));
        let keys: Vec<Arc<str>> = expired.iter().map(|e| e.key.clone()).collect();
        if !keys.is_empty() {
            debug!(store = %self.name, count = keys.len(), "Swept expired entries");
        }
        self.finish_removals(expired, RemovalReason::Expired);
        keys
    }

    pub fn clear(&self) {
        let removed = self.entries.drain_where(|_| true);
        self.finish_removals(removed, RemovalReason::Cleared);
        self.lock_released.notify_waiters();
    }

    /// Store a replicated or transferred entry as is, keeping its version
    pub fn load_entry(&self, entry: CacheEntry) -> Result<()> {
        let key = entry.key.clone();
        let old_size = self.entries.read(&key, |e| e.map_or(0, |e| e.size));
        self.make_room(entry.size.saturating_sub(old_size), &key)?;

        self.next_version.fetch_max(entry.version, Ordering::Relaxed);
        let stored = entry.clone();
        let previous = self.entries.write(&key, |map| map.insert(key.clone(), entry));
        self.charge(stored.size, previous.as_ref().map_or(0, |e| e.size));

        let change = if previous.is_some() {
            StoreChange::Updated(&stored)
        } else {
            StoreChange::Added(&stored)
        };
        self.notify(&change);
        Ok(())
    }

    /// Remove a key without lock checks (replica maintenance)
    pub fn discard(&self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.write(key, |map| map.remove(key))?;
        self.charge(0, removed.size);
        self.notify(&StoreChange::Removed {
            key: &removed.key,
            reason: RemovalReason::Removed,
        });
        Some(removed)
    }

    // =========================================================================
    // Item locks
    // =========================================================================

    /// Lock an item for `holder`, optionally with a lease
    #[instrument(skip(self), fields(store = %self.name))]
    pub async fn lock(
        &self,
        key: &str,
        holder: &str,
        lease: Option<Duration>,
        access: LockAccess,
    ) -> Outcome<LockInfo> {
        // Ignoring someone else's lock would steal it
        let access = match access {
            LockAccess::Ignore => LockAccess::Fail,
            other => other,
        };
        let gate = self
            .gate(access, || {
                let now = self.clock.now();
                let mut expired = Vec::new();
                let step = self.entries.write(key, |map| {
                    let Some(entry) = take_live(map, key, now, &mut expired) else {
                        return Step::Done(None);
                    };
                    if let Some(lock) = blocking_lock(entry, access, now) {
                        return Step::Blocked(lock);
                    }
                    let lock = LockInfo {
                        lock_id: self.next_lock_id.fetch_add(1, Ordering::Relaxed) + 1,
                        holder: holder.to_string(),
                        acquired_at: now,
                        expires_at: lease.map(|lease| add_duration(now, lease)),
                    };
                    entry.lock = Some(lock.clone());
                    Step::Done(Some(lock))
                });
                self.finish_removals(expired, RemovalReason::Expired);
                step
            })
            .await;

        match gate {
            Gate::Done(Some(lock)) => Outcome::Done(lock),
            Gate::Done(None) => Outcome::NotFound,
            Gate::Locked(lock) => Outcome::Locked(lock),
            Gate::TimedOut => Outcome::TimedOut,
        }
    }

    /// Release an item lock; `None` forces release regardless of id
    pub fn unlock(&self, key: &str, lock_id: Option<u64>) -> Outcome<()> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        let outcome = self.entries.write(key, |map| {
            let Some(entry) = take_live(map, key, now, &mut expired) else {
                return Outcome::NotFound;
            };
            if let (Some(lock), Some(lock_id)) = (&entry.lock, lock_id) {
                if lock.lock_id != lock_id && !lock.is_expired(now) {
                    return Outcome::Locked(lock.clone());
                }
            }
            entry.lock = None;
            Outcome::Done(())
        });
        self.finish_removals(expired, RemovalReason::Expired);
        if outcome.is_done() {
            self.lock_released.notify_waiters();
        }
        outcome
    }

    /// Release every lock held by `holder`, returning how many were released
    pub fn release_locks_held_by(&self, holder: &str) -> usize {
        let mut keys = Vec::new();
        self.entries.for_each(|key, entry| {
            if entry.lock.as_ref().is_some_and(|l| l.holder == holder) {
                keys.push(key.clone());
            }
        });

        let mut released = 0;
        for key in keys {
            let cleared = self.entries.write(&key, |map| match map.get_mut(&key) {
                Some(entry) if entry.lock.as_ref().is_some_and(|l| l.holder == holder) => {
                    entry.lock = None;
                    true
                }
                _ => false,
            });
            if cleared {
                released += 1;
            }
        }
        if released > 0 {
            debug!(store = %self.name, holder, released, "Released locks of holder");
            self.lock_released.notify_waiters();
        }
        released
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Run `attempt` until it is not blocked by a lock or `access` gives up
    async fn gate<R>(&self, access: LockAccess, mut attempt: impl FnMut() -> Step<R>) -> Gate<R> {
        let deadline = match access {
            LockAccess::Wait(timeout) => Some(tokio::time::Instant::now() + timeout),
            _ => None,
        };
        let mut conflicted = false;

        loop {
            let notified = self.lock_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let lock = match attempt() {
                Step::Done(result) => return Gate::Done(result),
                Step::Blocked(lock) => lock,
            };
            if !conflicted {
                conflicted = true;
                self.metrics.record_lock_conflict();
            }

            let Some(deadline) = deadline else {
                return Gate::Locked(lock);
            };
            let now = tokio::time::Instant::now();
            if now >= deadline {
                self.metrics.record_lock_timeout();
                return Gate::TimedOut;
            }
            let wait = (deadline - now).min(LOCK_POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn charge(&self, added: u64, removed: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_add(added).saturating_sub(removed))
            });
    }

    /// Evict until `incoming` more bytes fit; never evicts `exclude`
    fn make_room(&self, incoming: u64, exclude: &str) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Ok(());
        }
        let used = self.used_bytes();
        if used.saturating_add(incoming) <= self.capacity_bytes {
            return Ok(());
        }
        let required = used.saturating_add(incoming) - self.capacity_bytes;
        let target = (self.capacity_bytes as f64 * self.eviction_ratio_percent / 100.0) as u64;

        let now = self.clock.now();
        let mut candidates = Vec::new();
        self.entries.for_each(|key, entry| {
            if key.as_ref() != exclude && entry.active_lock(now).is_none() {
                candidates.push(EvictionCandidate {
                    key: key.clone(),
                    priority: entry.priority,
                    last_accessed: entry.last_accessed,
                    size: entry.size,
                });
            }
        });

        let victims = self.eviction.select(candidates, required, target)?;
        let mut evicted = Vec::with_capacity(victims.len());
        for key in victims {
            let removed = self.entries.write(&key, |map| {
                let evictable = map
                    .get(&key)
                    .is_some_and(|e| e.active_lock(now).is_none());
                if evictable {
                    map.remove(&key)
                } else {
                    None
                }
            });
            evicted.extend(removed);
        }

        debug!(
            store = %self.name,
            count = evicted.len(),
            required,
            "Evicted entries under memory pressure"
        );
        self.metrics.record_evictions(evicted.len() as u64);
        self.finish_removals(evicted, RemovalReason::Evicted);
        Ok(())
    }

    fn finish_removals(&self, removed: Vec<CacheEntry>, reason: RemovalReason) {
        if removed.is_empty() {
            return;
        }
        if reason == RemovalReason::Expired {
            self.metrics.record_expirations(removed.len() as u64);
        }
        for entry in &removed {
            self.charge(0, entry.size);
            self.notify(&StoreChange::Removed {
                key: &entry.key,
                reason,
            });
        }
    }

    fn notify(&self, change: &StoreChange<'_>) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_change(change);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvictionKind;
    use crate::storage::clock::ManualClock;
    use crate::storage::entry::{CacheValue, DataGroup, Expiration, Priority};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    fn store_with(config: StorageConfig) -> (LocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (LocalStore::new("test", &config, clock.clone()), clock)
    }

    fn store() -> (LocalStore, Arc<ManualClock>) {
        store_with(StorageConfig::default())
    }

    fn entry(key: &str, clock: &ManualClock) -> CacheEntry {
        CacheEntry::new(key, CacheValue::binary(vec![0u8; 10]), clock.now())
    }

    #[tokio::test]
    async fn test_add_rejects_existing_key() {
        let (store, clock) = store();
        store.add(entry("a", &clock)).unwrap();
        assert_matches!(
            store.add(entry("a", &clock)),
            Err(Error::KeyAlreadyExists { key }) if key == "a"
        );
    }

    #[tokio::test]
    async fn test_add_succeeds_after_expiry() {
        let (store, clock) = store();
        let first = entry("a", &clock)
            .with_expiration(Expiration::absolute_in(clock.now(), Duration::from_secs(5)));
        store.add(first).unwrap();

        clock.advance(Duration::from_secs(6));
        assert!(store.add(entry("a", &clock)).is_ok());
    }

    #[tokio::test]
    async fn test_absolute_expiration() {
        let (store, clock) = store();
        let e = entry("A", &clock)
            .with_expiration(Expiration::absolute_in(clock.now(), Duration::from_secs(5)));
        store.insert(e, InsertOptions::default()).await.unwrap();

        clock.advance(Duration::from_secs(6));
        assert_matches!(store.get("A", LockAccess::Fail).await, Outcome::NotFound);
        assert_eq!(store.used_bytes(), 0);
        assert_eq!(store.metrics().snapshot().expirations, 1);
    }

    #[tokio::test]
    async fn test_sliding_expiration_touched_on_read() {
        let (store, clock) = store();
        let window = Duration::from_secs(30);
        let e = entry("s", &clock).with_expiration(Expiration::sliding(window, clock.now()));
        store.add(e).unwrap();

        clock.advance(Duration::from_secs(20));
        let read_at = clock.now();
        let hit = store.get("s", LockAccess::Fail).await.done().unwrap();
        assert_eq!(hit.expiration.deadline(), Some(add_duration(read_at, window)));

        clock.advance(Duration::from_secs(20));
        assert!(store.get("s", LockAccess::Fail).await.is_done());

        clock.advance(Duration::from_secs(31));
        assert_matches!(store.get("s", LockAccess::Fail).await, Outcome::NotFound);
    }

    #[tokio::test]
    async fn test_group_is_immutable() {
        let (store, clock) = store();
        store
            .add(entry("g", &clock).with_group(DataGroup::new("orders")))
            .unwrap();

        let result = store
            .insert(
                entry("g", &clock).with_group(DataGroup::new("invoices")),
                InsertOptions::default(),
            )
            .await;
        assert_matches!(result, Err(Error::DataGroupMismatch { .. }));

        let same = store
            .insert(
                entry("g", &clock).with_group(DataGroup::new("orders")),
                InsertOptions::default(),
            )
            .await
            .unwrap();
        assert!(same.is_done());
    }

    #[tokio::test]
    async fn test_versions_increase_and_are_checked() {
        let (store, clock) = store();
        let v1 = store.add(entry("v", &clock)).unwrap();
        let v2 = store
            .insert(entry("v", &clock), InsertOptions::default())
            .await
            .unwrap()
            .done()
            .unwrap();
        assert!(v2 > v1);

        let stale = store
            .insert(
                entry("v", &clock),
                InsertOptions {
                    expected_version: Some(v1),
                    ..InsertOptions::default()
                },
            )
            .await;
        assert_matches!(stale, Err(Error::VersionMismatch { expected, actual, .. }) if expected == v1 && actual == v2);
    }

    #[tokio::test]
    async fn test_locked_item_fails_fast() {
        let (store, clock) = store();
        store.add(entry("l", &clock)).unwrap();
        let lock = store
            .lock("l", "client-1", None, LockAccess::Fail)
            .await
            .done()
            .unwrap();

        let result = store
            .insert(entry("l", &clock), InsertOptions::default())
            .await
            .unwrap();
        assert_matches!(result, Outcome::Locked(info) if info.lock_id == lock.lock_id);

        let owner = store
            .insert(
                entry("l", &clock),
                InsertOptions {
                    access: LockAccess::Owner(lock.lock_id),
                    ..InsertOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(owner.is_done());
        assert!(store.peek("l").unwrap().lock.is_none());
    }

    #[tokio::test]
    async fn test_locked_item_waits_for_release() {
        let (store, clock) = store();
        let store = Arc::new(store);
        store.add(entry("w", &clock)).unwrap();
        let lock = store
            .lock("w", "client-1", None, LockAccess::Fail)
            .await
            .done()
            .unwrap();

        let waiter = {
            let store = store.clone();
            let e = entry("w", &clock);
            tokio::spawn(async move {
                store
                    .insert(
                        e,
                        InsertOptions {
                            access: LockAccess::Wait(Duration::from_secs(5)),
                            ..InsertOptions::default()
                        },
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_matches!(store.unlock("w", Some(lock.lock_id)), Outcome::Done(()));
        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_wait_times_out() {
        let (store, clock) = store();
        store.add(entry("t", &clock)).unwrap();
        store
            .lock("t", "client-1", None, LockAccess::Fail)
            .await
            .done()
            .unwrap();

        let result = store
            .get("t", LockAccess::Wait(Duration::from_millis(200)))
            .await;
        assert_matches!(result, Outcome::TimedOut);
        assert_eq!(store.metrics().snapshot().lock_timeouts, 1);
    }

    #[tokio::test]
    async fn test_lock_lease_expires() {
        let (store, clock) = store();
        store.add(entry("e", &clock)).unwrap();
        store
            .lock("e", "client-1", Some(Duration::from_secs(10)), LockAccess::Fail)
            .await
            .done()
            .unwrap();
        assert_matches!(
            store.lock("e", "client-2", None, LockAccess::Fail).await,
            Outcome::Locked(_)
        );

        clock.advance(Duration::from_secs(11));
        assert_matches!(
            store.lock("e", "client-2", None, LockAccess::Fail).await,
            Outcome::Done(lock) if lock.holder == "client-2"
        );
    }

    #[tokio::test]
    async fn test_unlock_requires_matching_id_unless_forced() {
        let (store, clock) = store();
        store.add(entry("u", &clock)).unwrap();
        let lock = store
            .lock("u", "client-1", None, LockAccess::Fail)
            .await
            .done()
            .unwrap();

        assert_matches!(store.unlock("u", Some(lock.lock_id + 1)), Outcome::Locked(_));
        assert_matches!(store.unlock("u", None), Outcome::Done(()));
        assert_matches!(store.unlock("missing", None), Outcome::NotFound);
    }

    #[tokio::test]
    async fn test_release_locks_held_by_client() {
        let (store, clock) = store();
        for key in ["a", "b", "c"] {
            store.add(entry(key, &clock)).unwrap();
        }
        store.lock("a", "dead", None, LockAccess::Fail).await;
        store.lock("b", "dead", None, LockAccess::Fail).await;
        store.lock("c", "alive", None, LockAccess::Fail).await;

        assert_eq!(store.release_locks_held_by("dead"), 2);
        assert!(store.peek("a").unwrap().lock.is_none());
        assert!(store.peek("c").unwrap().lock.is_some());
    }

    #[tokio::test]
    async fn test_eviction_by_priority_then_recency() {
        let (store, clock) = store_with(StorageConfig {
            capacity_bytes: 33,
            eviction_policy: EvictionKind::Priority,
            eviction_ratio_percent: 0.0,
            ..StorageConfig::default()
        });
        // Each entry charges 1 (key) + 10 (payload) bytes
        store
            .add(entry("h", &clock).with_priority(Priority::High))
            .unwrap();
        clock.advance(Duration::from_secs(1));
        store.add(entry("o", &clock)).unwrap();
        clock.advance(Duration::from_secs(1));
        store.add(entry("n", &clock)).unwrap();
        clock.advance(Duration::from_secs(1));

        store.add(entry("x", &clock)).unwrap();
        assert!(store.peek("o").is_none());
        assert!(store.peek("n").is_some());
        assert!(store.peek("h").is_some());
        assert_eq!(store.metrics().snapshot().evictions, 1);
    }

    #[tokio::test]
    async fn test_not_enough_evictable_leaves_store_untouched() {
        let (store, clock) = store_with(StorageConfig {
            capacity_bytes: 22,
            ..StorageConfig::default()
        });
        store
            .add(entry("a", &clock).with_priority(Priority::NotRemovable))
            .unwrap();
        store.add(entry("b", &clock)).unwrap();
        store.lock("b", "holder", None, LockAccess::Fail).await;

        assert_matches!(
            store.add(entry("c", &clock)),
            Err(Error::NotEnoughItemsEvicted { .. })
        );
        assert_eq!(store.len(), 2);
        assert!(!store.contains_key("c"));
    }

    #[tokio::test]
    async fn test_object_values_charged_by_encoded_size() {
        let (store, clock) = store_with(StorageConfig {
            capacity_bytes: 64 * 1024,
            ..StorageConfig::default()
        });
        for i in 0..10 {
            let value = CacheValue::object("x".repeat(32 * 1024));
            store
                .add(CacheEntry::new(format!("k{}", i), value, clock.now()))
                .unwrap();
            assert!(store.used_bytes() <= 64 * 1024);
        }

        assert!(store.used_bytes() > 32 * 1024);
        assert_eq!(store.len(), 1);
        assert!(store.contains_key("k9"));
        assert_eq!(store.metrics().snapshot().evictions, 9);
    }

    #[tokio::test]
    async fn test_failed_insert_evicts_nothing() {
        let (store, clock) = store_with(StorageConfig {
            capacity_bytes: 22,
            ..StorageConfig::default()
        });
        store.add(entry("a", &clock)).unwrap();
        store.add(entry("b", &clock)).unwrap();
        store.lock("b", "holder", None, LockAccess::Fail).await;

        let larger = CacheEntry::new("b", CacheValue::binary(vec![1u8; 20]), clock.now());
        assert_matches!(
            store.insert(larger, InsertOptions::default()).await,
            Ok(Outcome::Locked(lock)) if lock.holder == "holder"
        );
        assert_eq!(store.len(), 2);
        assert_eq!(store.used_bytes(), 22);

        let stale = CacheEntry::new("c", CacheValue::binary(vec![1u8; 10]), clock.now());
        let options = InsertOptions {
            expected_version: Some(7),
            ..InsertOptions::default()
        };
        assert_matches!(
            store.insert(stale, options).await,
            Err(Error::VersionMismatch { .. })
        );
        assert_eq!(store.len(), 2);
        assert_eq!(store.used_bytes(), 22);
        assert!(store.contains_key("a"));
        assert_eq!(store.metrics().snapshot().evictions, 0);
    }

    #[tokio::test]
    async fn test_remove_group_and_tags() {
        let (store, clock) = store();
        store
            .add(entry("1", &clock).with_group(DataGroup::new("g")).with_tags(["red"]))
            .unwrap();
        store
            .add(entry("2", &clock).with_group(DataGroup::new("g")).with_tags(["red", "big"]))
            .unwrap();
        store.add(entry("3", &clock).with_tags(["big"])).unwrap();

        let tags = vec!["red".to_string(), "big".to_string()];
        assert_eq!(store.keys_by_tag(&tags, false).len(), 3);
        let all = store.keys_by_tag(&tags, true);
        assert_eq!(all, vec![Arc::<str>::from("2")]);

        let mut removed = store.remove_group("g", None);
        removed.sort();
        assert_eq!(removed, vec![Arc::<str>::from("1"), Arc::<str>::from("2")]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_notifies_observers() {
        struct Recorder(Mutex<Vec<(String, RemovalReason)>>);
        impl StoreObserver for Recorder {
            fn on_change(&self, change: &StoreChange<'_>) {
                if let StoreChange::Removed { key, reason } = change {
                    self.0.lock().push((key.to_string(), *reason));
                }
            }
        }

        let (store, clock) = store();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        store.add_observer(recorder.clone());
        store
            .add(entry("x", &clock).with_expiration(Expiration::absolute_in(
                clock.now(),
                Duration::from_secs(1),
            )))
            .unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.sweep_expired().len(), 1);
        assert_eq!(
            recorder.0.lock().as_slice(),
            &[("x".to_string(), RemovalReason::Expired)]
        );
    }

    #[tokio::test]
    async fn test_load_entry_keeps_version() {
        let (store, clock) = store();
        let mut replica = entry("r", &clock);
        replica.version = 41;
        store.load_entry(replica).unwrap();
        assert_eq!(store.peek("r").unwrap().version, 41);

        let next = store
            .insert(entry("r", &clock), InsertOptions::default())
            .await
            .unwrap()
            .done()
            .unwrap();
        assert_eq!(next, 42);
    }
}
