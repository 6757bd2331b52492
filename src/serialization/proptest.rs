//! Property-Based Tests for Compact Serialization and Pooling
//!
//! # Test Properties
//!
//! 1. **Roundtrip**: deserialize(serialize(x)) == x for every surrogate type
//! 2. **Nesting**: heterogeneous lists and maps survive arbitrary nesting
//! 3. **Handle stability**: the leading handle is the registered one
//! 4. **Bucketing**: get_length(get_bucket(l)) is the smallest bucket >= l
//! 5. **Reset on return**: a returned object comes back in default state

#![cfg(test)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use proptest::prelude::*;

use super::{
    CompactReader, CompactSerializable, CompactWriter, ObjectList, ObjectMap, ObjectRef,
    SerializationContext, SurrogateSelector,
};
use crate::error::Result;
use crate::pool::{
    get_bucket, get_length, ObjectPool, ObjectPoolOptions, Pool, Resettable, BUCKET_SIZES,
};
use crate::storage::{
    AttributeValue, CacheEntry, CacheValue, DataGroup, Expiration, LockInfo, Priority, QueryInfo,
};

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Customer {
    id: i64,
    name: String,
    score: f64,
    tags: Vec<String>,
    nickname: Option<String>,
}

impl CompactSerializable for Customer {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_i64(self.id);
        writer.write_str(&self.name)?;
        writer.write_f64(self.score);
        writer.write_str_list(&self.tags)?;
        writer.write_opt_str(self.nickname.as_deref())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        Ok(Self {
            id: reader.read_i64()?,
            name: reader.read_str()?,
            score: reader.read_f64()?,
            tags: reader.read_str_list()?,
            nickname: reader.read_opt_str()?,
        })
    }
}

#[derive(Debug, Default)]
struct Scratch {
    values: Vec<u64>,
    label: String,
}

impl Resettable for Scratch {
    fn reset(&mut self) {
        self.values.clear();
        self.label.clear();
    }
}

const CONTEXT: &str = "proptest";

fn selector() -> SurrogateSelector {
    let selector = SurrogateSelector::new();
    selector
        .register::<Customer>(CONTEXT, 1000)
        .expect("register customer");
    selector
}

fn context() -> SerializationContext {
    SerializationContext::new(CONTEXT)
}

// =============================================================================
// Property Strategies
// =============================================================================

/// Finite floats only; NaN breaks equality
fn finite_f64() -> impl Strategy<Value = f64> {
    prop::num::f64::NORMAL | prop::num::f64::ZERO | prop::num::f64::SUBNORMAL
}

fn datetime_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_000_000_000, 0u32..1_000_000_000)
        .prop_map(|(secs, nanos)| DateTime::from_timestamp(secs, nanos).unwrap())
}

fn customer_strategy() -> impl Strategy<Value = Customer> {
    (
        any::<i64>(),
        ".{0,24}",
        finite_f64(),
        prop::collection::vec("[a-z]{1,8}", 0..5),
        prop::option::of("[a-z]{1,8}"),
    )
        .prop_map(|(id, name, score, tags, nickname)| Customer {
            id,
            name,
            score,
            tags,
            nickname,
        })
}

fn leaf_strategy() -> impl Strategy<Value = Option<ObjectRef>> {
    prop_oneof![
        Just(None),
        any::<bool>().prop_map(|v| Some(Arc::new(v) as ObjectRef)),
        any::<i32>().prop_map(|v| Some(Arc::new(v) as ObjectRef)),
        any::<i64>().prop_map(|v| Some(Arc::new(v) as ObjectRef)),
        finite_f64().prop_map(|v| Some(Arc::new(v) as ObjectRef)),
        ".{0,16}".prop_map(|v: String| Some(Arc::new(v) as ObjectRef)),
        prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(|v| Some(Arc::new(Bytes::from(v)) as ObjectRef)),
        datetime_strategy().prop_map(|v| Some(Arc::new(v) as ObjectRef)),
        customer_strategy().prop_map(|v| Some(Arc::new(v) as ObjectRef)),
    ]
}

/// Nested lists and maps of leaves
fn graph_strategy() -> impl Strategy<Value = Option<ObjectRef>> {
    leaf_strategy().prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8)
                .prop_map(|items| Some(Arc::new(ObjectList(items)) as ObjectRef)),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                .prop_map(|map: BTreeMap<String, Option<ObjectRef>>| {
                    Some(Arc::new(ObjectMap(map)) as ObjectRef)
                }),
        ]
    })
}

fn priority_strategy() -> impl Strategy<Value = Priority> {
    (1u8..=7).prop_map(|ordinal| Priority::from_ordinal(ordinal).unwrap())
}

fn expiration_strategy() -> impl Strategy<Value = Expiration> {
    prop_oneof![
        Just(Expiration::None),
        datetime_strategy().prop_map(Expiration::Absolute),
        (0u64..1_000_000, datetime_strategy()).prop_map(|(secs, deadline)| {
            Expiration::Sliding {
                window: Duration::from_secs(secs),
                deadline,
            }
        }),
    ]
}

fn entry_strategy() -> impl Strategy<Value = CacheEntry> {
    (
        "[a-z0-9:]{1,32}",
        prop::collection::vec(any::<u8>(), 0..256),
        expiration_strategy(),
        priority_strategy(),
        prop::option::of((any::<u64>(), "[a-z]{1,8}", datetime_strategy())),
        prop::option::of(("[a-z]{1,8}", prop::option::of("[a-z]{1,8}"))),
        prop::collection::vec("[a-z]{1,8}", 0..4),
        prop::option::of((any::<i64>(), ".{0,8}")),
        any::<u64>(),
        datetime_strategy(),
    )
        .prop_map(
            |(key, payload, expiration, priority, lock, group, tags, query, version, now)| {
                let mut entry = CacheEntry::new(key, CacheValue::binary(payload), now)
                    .with_expiration(expiration)
                    .with_priority(priority)
                    .with_tags(tags);
                entry.lock = lock.map(|(lock_id, holder, acquired_at)| LockInfo {
                    lock_id,
                    holder,
                    acquired_at,
                    expires_at: None,
                });
                entry.group = group.map(|(group, subgroup)| DataGroup { group, subgroup });
                entry.query_info = query.map(|(age, city)| {
                    QueryInfo::new("Customer")
                        .with("age", AttributeValue::Int(age))
                        .with("city", AttributeValue::Text(city))
                });
                entry.version = version;
                entry
            },
        )
}

// =============================================================================
// Roundtrip Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: a registered user type survives a roundtrip.
    #[test]
    fn prop_user_type_roundtrip(customer in customer_strategy()) {
        let selector = selector();
        let ctx = context();
        let bytes = selector.serialize(&customer, &ctx).unwrap();
        prop_assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 1000);

        let decoded: Customer = selector.deserialize_value(&bytes, &ctx).unwrap();
        prop_assert_eq!(decoded, customer);
    }

    /// Property: nested object graphs survive a roundtrip.
    #[test]
    fn prop_object_graph_roundtrip(graph in graph_strategy()) {
        let selector = selector();
        let ctx = context();
        let list = ObjectList(vec![graph]);
        let bytes = selector.serialize(&list, &ctx).unwrap();
        let decoded: ObjectList = selector.deserialize_value(&bytes, &ctx).unwrap();
        prop_assert_eq!(decoded, list);
    }

    /// Property: cache entries keep every field, including expiration and priority.
    #[test]
    fn prop_cache_entry_roundtrip(entry in entry_strategy()) {
        let selector = selector();
        let ctx = context();
        let bytes = selector.serialize(&entry, &ctx).unwrap();
        let decoded: CacheEntry = selector.deserialize_value(&bytes, &ctx).unwrap();
        prop_assert_eq!(decoded, entry);
    }

    /// Property: any strict prefix of a valid stream is rejected.
    #[test]
    fn prop_truncated_stream_rejected(customer in customer_strategy(), cut in any::<prop::sample::Index>()) {
        let selector = selector();
        let ctx = context();
        let bytes = selector.serialize(&customer, &ctx).unwrap();
        let cut = cut.index(bytes.len());
        prop_assert!(selector.deserialize(&bytes[..cut], &ctx).is_err());
    }
}

// =============================================================================
// Pooling Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the bucket for a length is the smallest one that fits it.
    #[test]
    fn prop_bucket_is_smallest_fit(length in 0usize..=2_000_000) {
        match get_bucket(length) {
            Some(bucket) => {
                let size = get_length(bucket).unwrap();
                prop_assert!(size >= length);
                if bucket > 0 {
                    prop_assert!(BUCKET_SIZES[bucket - 1] < length);
                }
            }
            None => prop_assert!(length > *BUCKET_SIZES.last().unwrap()),
        }
    }

    /// Property: a returned object is in default state when rented again.
    #[test]
    fn prop_returned_object_is_reset(
        values in prop::collection::vec(any::<u64>(), 0..32),
        label in ".{0,16}",
    ) {
        let pool: ObjectPool<Scratch> = ObjectPool::new(
            "scratch",
            ObjectPoolOptions {
                initial_capacity: 1,
                max_capacity: 1,
                serving_capability_borderline: 0.7,
            },
        );

        let mut lease = pool.rent();
        lease.values = values;
        lease.label = label;
        pool.give_back(lease);

        let again = pool.rent();
        prop_assert!(again.values.is_empty());
        prop_assert!(again.label.is_empty());
    }
}

#[test]
fn test_cache_entry_sliding_high_priority_roundtrip() {
    let selector = selector();
    let ctx = context();
    let now = DateTime::from_timestamp(1_700_000_000, 500).unwrap();
    let entry = CacheEntry::new("session:42", CacheValue::object(String::from("state")), now)
        .with_expiration(Expiration::sliding(Duration::from_secs(300), now))
        .with_priority(Priority::High);

    let bytes = selector.serialize(&entry, &ctx).unwrap();
    let decoded: CacheEntry = selector.deserialize_value(&bytes, &ctx).unwrap();

    assert_eq!(decoded.expiration, entry.expiration);
    assert_eq!(decoded.priority, Priority::High);
    assert_eq!(decoded, entry);
    // Re-encoding the decoded entry reproduces the same bytes
    assert_eq!(selector.serialize(&decoded, &ctx).unwrap(), bytes);
}
