//! Cache entry model.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::clock::add_duration;
use crate::error::{Error, Result};
use crate::serialization::{self, CompactReader, CompactSerializable, CompactWriter, ObjectRef};

// =============================================================================
// Priority
// =============================================================================

/// Eviction priority; lower ordinals are evicted first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Priority {
    Low = 1,
    BelowNormal = 2,
    Normal = 3,
    AboveNormal = 4,
    High = 5,
    /// Never evicted
    NotRemovable = 6,
    /// Resolved to the configured default, `Normal`
    Default = 7,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Default
    }
}

impl Priority {
    pub fn effective(self) -> Priority {
        match self {
            Priority::Default => Priority::Normal,
            other => other,
        }
    }

    pub fn is_removable(self) -> bool {
        self.effective() != Priority::NotRemovable
    }

    pub fn from_ordinal(value: u8) -> Option<Self> {
        Some(match value {
            1 => Priority::Low,
            2 => Priority::BelowNormal,
            3 => Priority::Normal,
            4 => Priority::AboveNormal,
            5 => Priority::High,
            6 => Priority::NotRemovable,
            7 => Priority::Default,
            _ => return None,
        })
    }
}

// =============================================================================
// Expiration
// =============================================================================

/// Expiration hint; one entry carries at most one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    #[default]
    None,
    Absolute(DateTime<Utc>),
    /// Idle timeout; `deadline` moves forward on every read
    Sliding {
        window: Duration,
        deadline: DateTime<Utc>,
    },
}

impl Expiration {
    pub fn absolute(at: DateTime<Utc>) -> Self {
        Expiration::Absolute(at)
    }

    pub fn absolute_in(now: DateTime<Utc>, ttl: Duration) -> Self {
        Expiration::Absolute(add_duration(now, ttl))
    }

    pub fn sliding(window: Duration, now: DateTime<Utc>) -> Self {
        Expiration::Sliding {
            window,
            deadline: add_duration(now, window),
        }
    }

    /// Reset the sliding deadline to `now + window`
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if let Expiration::Sliding { window, deadline } = self {
            *deadline = add_duration(now, *window);
        }
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            Expiration::None => None,
            Expiration::Absolute(at) => Some(*at),
            Expiration::Sliding { deadline, .. } => Some(*deadline),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }
}

impl CompactSerializable for Expiration {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        match self {
            Expiration::None => writer.write_u8(0),
            Expiration::Absolute(at) => {
                writer.write_u8(1);
                writer.write_datetime(at);
            }
            Expiration::Sliding { window, deadline } => {
                writer.write_u8(2);
                writer.write_duration(*window);
                writer.write_datetime(deadline);
            }
        }
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        match reader.read_u8()? {
            0 => Ok(Expiration::None),
            1 => Ok(Expiration::Absolute(reader.read_datetime()?)),
            2 => Ok(Expiration::Sliding {
                window: reader.read_duration()?,
                deadline: reader.read_datetime()?,
            }),
            tag => Err(Error::CompactSerialization(format!(
                "invalid expiration tag {}",
                tag
            ))),
        }
    }
}

// =============================================================================
// Lock
// =============================================================================

/// Item lock state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_id: u64,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// Lock is considered released after this instant
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl CompactSerializable for LockInfo {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_u64(self.lock_id);
        writer.write_str(&self.holder)?;
        writer.write_datetime(&self.acquired_at);
        writer.write_opt(self.expires_at.as_ref())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        Ok(Self {
            lock_id: reader.read_u64()?,
            holder: reader.read_str()?,
            acquired_at: reader.read_datetime()?,
            expires_at: reader.read_opt()?,
        })
    }
}

// =============================================================================
// Grouping and query metadata
// =============================================================================

/// Data group of an entry; immutable per key once set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataGroup {
    pub group: String,
    pub subgroup: Option<String>,
}

impl DataGroup {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            subgroup: None,
        }
    }

    pub fn with_subgroup(mut self, subgroup: impl Into<String>) -> Self {
        self.subgroup = Some(subgroup.into());
        self
    }

    pub fn matches(&self, group: &str, subgroup: Option<&str>) -> bool {
        self.group == group && subgroup.map_or(true, |s| self.subgroup.as_deref() == Some(s))
    }
}

impl fmt::Display for DataGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subgroup {
            Some(subgroup) => write!(f, "{}/{}", self.group, subgroup),
            None => write!(f, "{}", self.group),
        }
    }
}

/// Queryable attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    /// Ordering between comparable values; numbers compare across int/float
    pub fn compare(&self, other: &AttributeValue) -> Option<Ordering> {
        use AttributeValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl CompactSerializable for AttributeValue {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        match self {
            AttributeValue::Bool(v) => {
                writer.write_u8(0);
                writer.write_bool(*v);
            }
            AttributeValue::Int(v) => {
                writer.write_u8(1);
                writer.write_i64(*v);
            }
            AttributeValue::Float(v) => {
                writer.write_u8(2);
                writer.write_f64(*v);
            }
            AttributeValue::Text(v) => {
                writer.write_u8(3);
                writer.write_str(v)?;
            }
        }
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        match reader.read_u8()? {
            0 => Ok(AttributeValue::Bool(reader.read_bool()?)),
            1 => Ok(AttributeValue::Int(reader.read_i64()?)),
            2 => Ok(AttributeValue::Float(reader.read_f64()?)),
            3 => Ok(AttributeValue::Text(reader.read_str()?)),
            tag => Err(Error::CompactSerialization(format!(
                "invalid attribute tag {}",
                tag
            ))),
        }
    }
}

/// Type name and indexed attributes used by continuous queries
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryInfo {
    pub type_name: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl QueryInfo {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

// =============================================================================
// Value
// =============================================================================

/// Stored payload: a live object or its serialized form
#[derive(Debug, Clone)]
pub enum CacheValue {
    Object(ObjectRef),
    Binary(Bytes),
}

impl CacheValue {
    pub fn object(value: impl CompactSerializable) -> Self {
        CacheValue::Object(Arc::new(value))
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        CacheValue::Binary(bytes.into())
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            CacheValue::Object(object) => Some(object),
            CacheValue::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            CacheValue::Binary(bytes) => Some(bytes),
            CacheValue::Object(_) => None,
        }
    }

    /// Downcast an object payload
    pub fn downcast<T: CompactSerializable>(&self) -> Option<&T> {
        self.as_object()
            .and_then(|object| object.as_any().downcast_ref::<T>())
    }

    /// Bytes charged against capacity; objects are charged their compact
    /// encoded length
    pub fn size_hint(&self) -> u64 {
        match self {
            CacheValue::Binary(bytes) => bytes.len() as u64,
            CacheValue::Object(object) => serialization::encoded_len(object.as_ref())
                .unwrap_or_else(|_| std::mem::size_of_val(object.as_ref()) as u64),
        }
    }
}

impl PartialEq for CacheValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CacheValue::Object(a), CacheValue::Object(b)) => a.eq_object(b.as_ref()),
            (CacheValue::Binary(a), CacheValue::Binary(b)) => a == b,
            _ => false,
        }
    }
}

// =============================================================================
// Entry
// =============================================================================

/// One stored item
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: Arc<str>,
    pub value: CacheValue,
    pub expiration: Expiration,
    pub priority: Priority,
    pub lock: Option<LockInfo>,
    pub group: Option<DataGroup>,
    pub tags: Vec<String>,
    pub query_info: Option<QueryInfo>,
    pub size: u64,
    /// Bumped on every successful write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: impl Into<Arc<str>>, value: CacheValue, now: DateTime<Utc>) -> Self {
        let key = key.into();
        let size = key.len() as u64 + value.size_hint();
        Self {
            key,
            value,
            expiration: Expiration::None,
            priority: Priority::Default,
            lock: None,
            group: None,
            tags: Vec::new(),
            query_info: None,
            size,
            version: 0,
            created_at: now,
            last_modified: now,
            last_accessed: now,
        }
    }

    pub fn with_expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_group(mut self, group: DataGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_query_info(mut self, query_info: QueryInfo) -> Self {
        self.query_info = Some(query_info);
        self
    }

    /// Replace the payload and recompute the charged size
    pub fn set_value(&mut self, value: CacheValue) {
        self.size = self.key.len() as u64 + value.size_hint();
        self.value = value;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_expired(now)
    }

    /// Record a successful read
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed = now;
        self.expiration.touch(now);
    }

    /// Lock held by someone at `now`, ignoring expired leases
    pub fn active_lock(&self, now: DateTime<Utc>) -> Option<&LockInfo> {
        self.lock.as_ref().filter(|lock| !lock.is_expired(now))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

impl CompactSerializable for CacheEntry {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_str(&self.key)?;
        match &self.value {
            CacheValue::Object(object) => {
                writer.write_u8(0);
                writer.write_object(object.as_ref())?;
            }
            CacheValue::Binary(bytes) => {
                writer.write_u8(1);
                writer.write_bytes(bytes)?;
            }
        }
        self.expiration.serialize_fields(writer)?;
        writer.write_u8(self.priority as u8);
        writer.write_opt(self.lock.as_ref())?;

        writer.write_bool(self.group.is_some());
        if let Some(group) = &self.group {
            writer.write_str(&group.group)?;
            writer.write_opt_str(group.subgroup.as_deref())?;
        }
        writer.write_str_list(&self.tags)?;

        writer.write_bool(self.query_info.is_some());
        if let Some(info) = &self.query_info {
            writer.write_str(&info.type_name)?;
            writer.write_len(info.attributes.len())?;
            for (name, value) in &info.attributes {
                writer.write_str(name)?;
                value.serialize_fields(writer)?;
            }
        }

        writer.write_u64(self.size);
        writer.write_u64(self.version);
        writer.write_datetime(&self.created_at);
        writer.write_datetime(&self.last_modified);
        writer.write_datetime(&self.last_accessed);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        let key: Arc<str> = Arc::from(reader.read_str()?);
        let value = match reader.read_u8()? {
            0 => CacheValue::Object(reader.read_object()?.ok_or_else(|| {
                Error::CompactSerialization(format!("null object value for key {}", key))
            })?),
            1 => CacheValue::Binary(Bytes::copy_from_slice(reader.read_bytes()?)),
            tag => {
                return Err(Error::CompactSerialization(format!(
                    "invalid value tag {}",
                    tag
                )))
            }
        };
        let expiration = Expiration::deserialize_fields(reader)?;
        let priority = reader.read_u8()?;
        let priority = Priority::from_ordinal(priority).ok_or_else(|| {
            Error::CompactSerialization(format!("invalid priority {}", priority))
        })?;
        let lock = reader.read_opt()?;

        let group = if reader.read_bool()? {
            Some(DataGroup {
                group: reader.read_str()?,
                subgroup: reader.read_opt_str()?,
            })
        } else {
            None
        };
        let tags = reader.read_str_list()?;

        let query_info = if reader.read_bool()? {
            let type_name = reader.read_str()?;
            let count = reader.read_len()?;
            let mut attributes = BTreeMap::new();
            for _ in 0..count {
                let name = reader.read_str()?;
                attributes.insert(name, AttributeValue::deserialize_fields(reader)?);
            }
            Some(QueryInfo {
                type_name,
                attributes,
            })
        } else {
            None
        };

        Ok(Self {
            key,
            value,
            expiration,
            priority,
            lock,
            group,
            tags,
            query_info,
            size: reader.read_u64()?,
            version: reader.read_u64()?,
            created_at: reader.read_datetime()?,
            last_modified: reader.read_datetime()?,
            last_accessed: reader.read_datetime()?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_sliding_touch_moves_deadline() {
        let mut expiration = Expiration::sliding(Duration::from_secs(30), at(100));
        assert_eq!(expiration.deadline(), Some(at(130)));

        expiration.touch(at(120));
        assert_eq!(expiration.deadline(), Some(at(150)));
        assert!(!expiration.is_expired(at(149)));
        assert!(expiration.is_expired(at(150)));
    }

    #[test]
    fn test_absolute_not_touched() {
        let mut expiration = Expiration::absolute(at(105));
        expiration.touch(at(104));
        assert_eq!(expiration.deadline(), Some(at(105)));
    }

    #[test]
    fn test_setting_one_expiration_clears_other() {
        let entry = CacheEntry::new("k", CacheValue::binary(vec![1u8]), at(0))
            .with_expiration(Expiration::absolute(at(10)))
            .with_expiration(Expiration::sliding(Duration::from_secs(5), at(0)));
        assert!(matches!(entry.expiration, Expiration::Sliding { .. }));
    }

    #[test]
    fn test_priority_default_resolves_to_normal() {
        assert_eq!(Priority::Default.effective(), Priority::Normal);
        assert!(!Priority::NotRemovable.is_removable());
        assert!(Priority::Low < Priority::High);
        assert_eq!(Priority::from_ordinal(5), Some(Priority::High));
        assert_eq!(Priority::from_ordinal(9), None);
    }

    #[test]
    fn test_expired_lock_not_active() {
        let mut entry = CacheEntry::new("k", CacheValue::binary(vec![1u8]), at(0));
        entry.lock = Some(LockInfo {
            lock_id: 1,
            holder: "client-1".into(),
            acquired_at: at(0),
            expires_at: Some(at(10)),
        });
        assert!(entry.active_lock(at(5)).is_some());
        assert!(entry.active_lock(at(10)).is_none());
    }

    #[test]
    fn test_group_matching() {
        let group = DataGroup::new("orders").with_subgroup("eu");
        assert!(group.matches("orders", None));
        assert!(group.matches("orders", Some("eu")));
        assert!(!group.matches("orders", Some("us")));
        assert_eq!(group.to_string(), "orders/eu");
    }

    #[test]
    fn test_attribute_compare_across_numbers() {
        assert_eq!(
            AttributeValue::Int(3).compare(&AttributeValue::Float(2.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            AttributeValue::Text("a".into()).compare(&AttributeValue::Int(1)),
            None
        );
    }
}
