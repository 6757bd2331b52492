//! End-to-end scenarios through the command boundary
//!
//! - Expiration under a simulated clock
//! - Concurrent writers on a locked item
//! - Entry round-trip through the compact serializer
//! - Capacity eviction of object values
//! - Pooled envelopes and request bookkeeping

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{DateTime, Utc};

use meshcache::config::{CacheConfig, PoolingConfig, StorageConfig};
use meshcache::engine::{CacheInstance, ClientContext, Command, ItemOptions, Response, RuntimeContext};
use meshcache::storage::{
    CacheEntry, CacheValue, Clock, Expiration, LockAccess, ManualClock, Priority,
};
use meshcache::Error;

// =============================================================================
// Helpers
// =============================================================================

async fn started(config: CacheConfig) -> Arc<CacheInstance> {
    let context = RuntimeContext::new(config).unwrap();
    let cache = CacheInstance::standalone(context).unwrap();
    cache.start(None).await.unwrap();
    cache
}

async fn started_with_clock(config: CacheConfig) -> (Arc<CacheInstance>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let context = RuntimeContext::with_clock(config, clock.clone()).unwrap();
    let cache = CacheInstance::standalone(context).unwrap();
    cache.start(None).await.unwrap();
    (cache, clock)
}

fn insert(key: &str, value: &str, options: ItemOptions, access: LockAccess) -> Command {
    Command::Insert {
        key: key.into(),
        value: CacheValue::object(value.to_string()),
        options,
        access,
        expected_version: None,
    }
}

fn get(key: &str) -> Command {
    Command::Get {
        key: key.into(),
        access: LockAccess::Ignore,
    }
}

fn text(response: Response) -> String {
    match response {
        Response::Value { value, .. } => value
            .downcast::<String>()
            .cloned()
            .expect("string value"),
        other => panic!("expected a value, got {:?}", other),
    }
}

// =============================================================================
// Expiration
// =============================================================================

mod expiration_tests {
    use super::*;

    #[tokio::test]
    async fn test_absolute_expiration_hides_item_after_deadline() {
        let (cache, clock) = started_with_clock(CacheConfig::default()).await;
        let client = ClientContext::new("c1");
        let now = clock.now();
        let options = ItemOptions {
            expiration: Some(Expiration::absolute_in(now, Duration::from_secs(5))),
            ..ItemOptions::default()
        };

        cache
            .execute(&client, insert("A", "v", options, LockAccess::Ignore))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(4));
        assert_eq!(text(cache.execute(&client, get("A")).await.unwrap()), "v");

        clock.advance(Duration::from_secs(2));
        assert_matches!(cache.execute(&client, get("A")).await, Ok(Response::NotFound));
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sliding_expiration_is_renewed_by_reads() {
        let (cache, clock) = started_with_clock(CacheConfig::default()).await;
        let client = ClientContext::new("c1");
        let options = ItemOptions {
            expiration: Some(Expiration::sliding(Duration::from_secs(10), clock.now())),
            ..ItemOptions::default()
        };
        cache
            .execute(&client, insert("S", "v", options, LockAccess::Ignore))
            .await
            .unwrap();

        for _ in 0..3 {
            clock.advance(Duration::from_secs(8));
            assert_eq!(text(cache.execute(&client, get("S")).await.unwrap()), "v");
        }
        clock.advance(Duration::from_secs(11));
        assert_matches!(cache.execute(&client, get("S")).await, Ok(Response::NotFound));
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_succeeds_again_once_previous_item_expired() {
        let (cache, clock) = started_with_clock(CacheConfig::default()).await;
        let client = ClientContext::new("c1");
        let add = |ttl: u64| Command::Add {
            key: "K".into(),
            value: CacheValue::object("v".to_string()),
            options: ItemOptions {
                expiration: Some(Expiration::absolute_in(clock.now(), Duration::from_secs(ttl))),
                ..ItemOptions::default()
            },
        };

        cache.execute(&client, add(1)).await.unwrap();
        assert_matches!(
            cache.execute(&client, add(1)).await,
            Err(Error::KeyAlreadyExists { .. })
        );
        clock.advance(Duration::from_secs(2));
        assert_matches!(cache.execute(&client, add(1)).await, Ok(Response::Version(_)));
        cache.stop().await.unwrap();
    }
}

// =============================================================================
// Locking
// =============================================================================

mod locking_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_inserts_on_locked_item() {
        let cache = started(CacheConfig::default()).await;
        let owner = ClientContext::new("owner");
        let other = ClientContext::new("other");

        cache
            .execute(&owner, insert("A", "initial", ItemOptions::default(), LockAccess::Ignore))
            .await
            .unwrap();
        let lock = match cache
            .execute(
                &owner,
                Command::Lock {
                    key: "A".into(),
                    lease: None,
                    access: LockAccess::Fail,
                },
            )
            .await
            .unwrap()
        {
            Response::LockAcquired(lock) => lock,
            other => panic!("expected lock, got {:?}", other),
        };

        // Fail mode reports the holder instead of writing
        match cache
            .execute(&other, insert("A", "rejected", ItemOptions::default(), LockAccess::Fail))
            .await
            .unwrap()
        {
            Response::Locked(held) => assert_eq!(held.holder, "owner"),
            other => panic!("expected locked, got {:?}", other),
        }

        // Wait mode blocks until the owner's write releases the lock
        let waiter = {
            let cache = cache.clone();
            let other = other.clone();
            tokio::spawn(async move {
                cache
                    .execute(
                        &other,
                        insert(
                            "A",
                            "second",
                            ItemOptions::default(),
                            LockAccess::Wait(Duration::from_secs(5)),
                        ),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let first = match cache
            .execute(
                &owner,
                insert("A", "first", ItemOptions::default(), LockAccess::Owner(lock.lock_id)),
            )
            .await
            .unwrap()
        {
            Response::Version(version) => version,
            other => panic!("expected version, got {:?}", other),
        };
        let second = match waiter.await.unwrap().unwrap() {
            Response::Version(version) => version,
            other => panic!("expected version, got {:?}", other),
        };

        assert!(second > first);
        assert_eq!(text(cache.execute(&owner, get("A")).await.unwrap()), "second");
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out_while_lock_is_held() {
        let cache = started(CacheConfig::default()).await;
        let owner = ClientContext::new("owner");
        let other = ClientContext::new("other");
        cache
            .execute(&owner, insert("A", "v", ItemOptions::default(), LockAccess::Ignore))
            .await
            .unwrap();
        cache
            .execute(
                &owner,
                Command::Lock {
                    key: "A".into(),
                    lease: None,
                    access: LockAccess::Fail,
                },
            )
            .await
            .unwrap();

        let result = cache
            .execute(
                &other,
                Command::Remove {
                    key: "A".into(),
                    access: LockAccess::Wait(Duration::from_millis(30)),
                },
            )
            .await;
        assert_matches!(result, Ok(Response::TimedOut));
        assert_matches!(
            cache.execute(&other, Command::Contains { key: "A".into() }).await,
            Ok(Response::Exists(true))
        );
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let cache = started(CacheConfig::default()).await;
        let client = ClientContext::new("c1");
        let version = match cache
            .execute(&client, insert("V", "one", ItemOptions::default(), LockAccess::Ignore))
            .await
            .unwrap()
        {
            Response::Version(version) => version,
            other => panic!("expected version, got {:?}", other),
        };
        cache
            .execute(&client, insert("V", "two", ItemOptions::default(), LockAccess::Ignore))
            .await
            .unwrap();

        let stale = Command::Insert {
            key: "V".into(),
            value: CacheValue::object("three".to_string()),
            options: ItemOptions::default(),
            access: LockAccess::Ignore,
            expected_version: Some(version),
        };
        assert_matches!(
            cache.execute(&client, stale).await,
            Err(Error::VersionMismatch { .. })
        );
        cache.stop().await.unwrap();
    }
}

// =============================================================================
// Serialization
// =============================================================================

mod serialization_tests {
    use super::*;

    #[test]
    fn test_sliding_high_priority_entry_round_trip() {
        let context = RuntimeContext::new(CacheConfig::default()).unwrap();
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let entry = CacheEntry::new("A", CacheValue::object("payload".to_string()), now)
            .with_expiration(Expiration::sliding(Duration::from_secs(300), now))
            .with_priority(Priority::High);

        let bytes = context
            .selector
            .serialize(&entry, &context.serialization)
            .unwrap();
        let decoded: CacheEntry = context
            .selector
            .deserialize_value(&bytes, &context.serialization)
            .unwrap();

        assert_eq!(decoded.expiration, entry.expiration);
        assert_eq!(decoded.priority, Priority::High);
        assert_eq!(
            context
                .selector
                .serialize(&decoded, &context.serialization)
                .unwrap(),
            bytes
        );
    }

    #[test]
    fn test_skipping_context_steps_over_entry() {
        let context = RuntimeContext::new(CacheConfig::default()).unwrap();
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let entry = CacheEntry::new("A", CacheValue::object("payload".repeat(100)), now)
            .with_priority(Priority::Low);
        let bytes = context
            .selector
            .serialize(&entry, &context.serialization)
            .unwrap();

        let skipped = context
            .selector
            .deserialize(&bytes, &context.serialization.skipping())
            .unwrap();
        assert!(skipped.is_none());

        let decoded = context
            .selector
            .deserialize(&bytes, &context.serialization)
            .unwrap();
        assert!(decoded.is_some());
    }
}

// =============================================================================
// Eviction
// =============================================================================

mod eviction_tests {
    use super::*;

    const CAPACITY: u64 = 64 * 1024;

    fn bounded() -> CacheConfig {
        CacheConfig {
            storage: StorageConfig {
                capacity_bytes: CAPACITY,
                ..StorageConfig::default()
            },
            ..CacheConfig::default()
        }
    }

    fn sized(key: &str, kib: usize, priority: Priority) -> Command {
        let options = ItemOptions {
            priority,
            ..ItemOptions::default()
        };
        insert(key, &"x".repeat(kib * 1024), options, LockAccess::Ignore)
    }

    #[tokio::test]
    async fn test_object_values_are_evicted_at_capacity() {
        let (cache, clock) = started_with_clock(bounded()).await;
        let client = ClientContext::new("c1");
        for i in 0..10 {
            cache
                .execute(&client, sized(&format!("k{}", i), 24, Priority::Normal))
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let store = cache.store();
        assert!(store.used_bytes() <= CAPACITY);
        assert!(store.len() < 10);
        assert!(store.metrics().snapshot().evictions > 0);
        assert_eq!(text(cache.execute(&client, get("k9")).await.unwrap()).len(), 24 * 1024);
        assert_matches!(cache.execute(&client, get("k0")).await, Ok(Response::NotFound));
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_not_removable_items_survive_eviction() {
        let cache = started(bounded()).await;
        let client = ClientContext::new("c1");
        cache
            .execute(&client, sized("pinned", 24, Priority::NotRemovable))
            .await
            .unwrap();
        for i in 0..6 {
            cache
                .execute(&client, sized(&format!("k{}", i), 24, Priority::Low))
                .await
                .unwrap();
        }
        assert!(cache.store().contains_key("pinned"));
        assert!(cache.store().metrics().snapshot().evictions > 0);

        let before = cache.store().len();
        assert_matches!(
            cache.execute(&client, sized("big", 48, Priority::Normal)).await,
            Err(Error::NotEnoughItemsEvicted { .. })
        );
        assert_eq!(cache.store().len(), before);
        assert!(cache.store().contains_key("pinned"));
        assert_eq!(
            text(cache.execute(&client, get("pinned")).await.unwrap()).len(),
            24 * 1024
        );
        cache.stop().await.unwrap();
    }
}

// =============================================================================
// Command boundary
// =============================================================================

mod boundary_tests {
    use super::*;

    #[tokio::test]
    async fn test_envelopes_return_to_pool() {
        let cache = started(CacheConfig::default()).await;
        let client = ClientContext::new("c1");

        for i in 0..20 {
            let envelope = cache
                .execute_command(
                    &client,
                    insert(&format!("k{}", i), "v", ItemOptions::default(), LockAccess::Ignore),
                )
                .await;
            assert!(envelope.request_id > 0);
            assert_eq!(envelope.command, "insert");
            cache.release(envelope);
        }

        let stats = cache.context().pools.stats();
        assert!(stats.object_pools.iter().all(|pool| pool.in_use == 0));
        assert_eq!(cache.ledger().outstanding(), 0);
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pooling_disabled_still_serves() {
        let cache = started(CacheConfig {
            pooling: PoolingConfig {
                enabled: false,
                ..PoolingConfig::default()
            },
            ..CacheConfig::default()
        })
        .await;
        let client = ClientContext::new("c1");
        cache
            .execute(&client, insert("k", "v", ItemOptions::default(), LockAccess::Ignore))
            .await
            .unwrap();
        assert_eq!(text(cache.execute(&client, get("k")).await.unwrap()), "v");
        assert!(cache.context().pools.is_fake());
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_groups_and_tags() {
        use meshcache::storage::DataGroup;

        let cache = started(CacheConfig::default()).await;
        let client = ClientContext::new("c1");
        for (key, group, tag) in [("a", "eu", "hot"), ("b", "eu", "cold"), ("c", "us", "hot")] {
            let options = ItemOptions {
                group: Some(DataGroup::new(group)),
                tags: vec![tag.to_string()],
                ..ItemOptions::default()
            };
            cache
                .execute(&client, insert(key, "v", options, LockAccess::Ignore))
                .await
                .unwrap();
        }

        match cache
            .execute(
                &client,
                Command::KeysByTag {
                    tags: vec!["hot".into()],
                    match_all: true,
                },
            )
            .await
            .unwrap()
        {
            Response::Keys(mut keys) => {
                keys.sort();
                assert_eq!(keys, vec!["a".to_string(), "c".to_string()]);
            }
            other => panic!("expected keys, got {:?}", other),
        }

        cache
            .execute(
                &client,
                Command::RemoveGroup {
                    group: "eu".into(),
                    subgroup: None,
                },
            )
            .await
            .unwrap();
        assert_matches!(cache.execute(&client, Command::Count).await, Ok(Response::Count(1)));
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_instance_refuses_new_tasks() {
        let cache = started(CacheConfig::default()).await;
        cache.stop().await.unwrap();
        assert!(cache.scheduler().is_stopped());
        assert!(!cache.is_ready());
    }
}
