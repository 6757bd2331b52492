//! Inter-node messages.
//!
//! Data-path messages carry cache entries and are compact-serialized under
//! reserved handles. Control messages (membership, presence, query state,
//! MapReduce) are small and travel as JSON.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{NodeId, NodeInfo};
use crate::error::{Error, Result};
use crate::query::{ContinuousQuery, InputFilter, Intermediate, Predicate};
use crate::serialization::{CompactReader, CompactSerializable, CompactWriter};
use crate::storage::{CacheEntry, LockAccess, LockInfo, Outcome};

// =============================================================================
// Compact data-path messages
// =============================================================================

fn write_access(writer: &mut CompactWriter<'_>, access: LockAccess) {
    match access {
        LockAccess::Ignore => writer.write_u8(0),
        LockAccess::Fail => writer.write_u8(1),
        LockAccess::Wait(timeout) => {
            writer.write_u8(2);
            writer.write_duration(timeout);
        }
        LockAccess::Owner(lock_id) => {
            writer.write_u8(3);
            writer.write_u64(lock_id);
        }
    }
}

fn read_access(reader: &mut CompactReader<'_>) -> Result<LockAccess> {
    match reader.read_u8()? {
        0 => Ok(LockAccess::Ignore),
        1 => Ok(LockAccess::Fail),
        2 => Ok(LockAccess::Wait(reader.read_duration()?)),
        3 => Ok(LockAccess::Owner(reader.read_u64()?)),
        tag => Err(Error::CompactSerialization(format!(
            "invalid lock access tag {}",
            tag
        ))),
    }
}

fn write_opt_u64(writer: &mut CompactWriter<'_>, value: Option<u64>) {
    writer.write_bool(value.is_some());
    if let Some(value) = value {
        writer.write_u64(value);
    }
}

fn read_opt_u64(reader: &mut CompactReader<'_>) -> Result<Option<u64>> {
    Ok(if reader.read_bool()? {
        Some(reader.read_u64()?)
    } else {
        None
    })
}

/// Keyed read or removal
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRequest {
    pub key: String,
    pub access: LockAccess,
}

impl CompactSerializable for KeyRequest {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_str(&self.key)?;
        write_access(writer, self.access);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        Ok(Self {
            key: reader.read_str()?,
            access: read_access(reader)?,
        })
    }
}

/// Add or insert forwarded to the owner
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub entry: CacheEntry,
    /// Add semantics: fail if present
    pub add: bool,
    pub access: LockAccess,
    pub expected_version: Option<u64>,
}

impl CompactSerializable for WriteRequest {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        self.entry.serialize_fields(writer)?;
        writer.write_bool(self.add);
        write_access(writer, self.access);
        write_opt_u64(writer, self.expected_version);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        Ok(Self {
            entry: CacheEntry::deserialize_fields(reader)?,
            add: reader.read_bool()?,
            access: read_access(reader)?,
            expected_version: read_opt_u64(reader)?,
        })
    }
}

/// Lock acquisition or release
#[derive(Debug, Clone, PartialEq)]
pub struct LockRequest {
    pub key: String,
    pub holder: String,
    pub lease: Option<Duration>,
    pub access: LockAccess,
    /// Release instead of acquire
    pub release: bool,
    /// Lock id to release; `None` forces
    pub lock_id: Option<u64>,
}

impl CompactSerializable for LockRequest {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_str(&self.key)?;
        writer.write_str(&self.holder)?;
        writer.write_bool(self.lease.is_some());
        if let Some(lease) = self.lease {
            writer.write_duration(lease);
        }
        write_access(writer, self.access);
        writer.write_bool(self.release);
        write_opt_u64(writer, self.lock_id);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        let key = reader.read_str()?;
        let holder = reader.read_str()?;
        let lease = if reader.read_bool()? {
            Some(reader.read_duration()?)
        } else {
            None
        };
        Ok(Self {
            key,
            holder,
            lease,
            access: read_access(reader)?,
            release: reader.read_bool()?,
            lock_id: read_opt_u64(reader)?,
        })
    }
}

const STATUS_DONE: u8 = 0;
const STATUS_LOCKED: u8 = 1;
const STATUS_TIMED_OUT: u8 = 2;
const STATUS_NOT_FOUND: u8 = 3;

/// Wire form of an [`Outcome`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpReply {
    pub status: u8,
    pub version: u64,
    pub lock: Option<LockInfo>,
    pub entry: Option<CacheEntry>,
}

impl OpReply {
    fn from_outcome<T>(outcome: Outcome<T>, fill: impl FnOnce(&mut OpReply, T)) -> Self {
        let mut reply = OpReply::default();
        match outcome {
            Outcome::Done(value) => {
                reply.status = STATUS_DONE;
                fill(&mut reply, value);
            }
            Outcome::Locked(lock) => {
                reply.status = STATUS_LOCKED;
                reply.lock = Some(lock);
            }
            Outcome::TimedOut => reply.status = STATUS_TIMED_OUT,
            Outcome::NotFound => reply.status = STATUS_NOT_FOUND,
        }
        reply
    }

    fn into_outcome<T>(self, take: impl FnOnce(OpReply) -> Result<T>) -> Result<Outcome<T>> {
        match self.status {
            STATUS_DONE => take(self).map(Outcome::Done),
            STATUS_LOCKED => self
                .lock
                .map(Outcome::Locked)
                .ok_or_else(|| Error::CompactSerialization("locked reply without lock".into())),
            STATUS_TIMED_OUT => Ok(Outcome::TimedOut),
            STATUS_NOT_FOUND => Ok(Outcome::NotFound),
            status => Err(Error::CompactSerialization(format!(
                "invalid reply status {}",
                status
            ))),
        }
    }

    pub fn from_entry(outcome: Outcome<CacheEntry>) -> Self {
        Self::from_outcome(outcome, |reply, entry| reply.entry = Some(entry))
    }

    pub fn into_entry(self) -> Result<Outcome<CacheEntry>> {
        self.into_outcome(|reply| {
            reply
                .entry
                .ok_or_else(|| Error::CompactSerialization("done reply without entry".into()))
        })
    }

    pub fn from_version(outcome: Outcome<u64>) -> Self {
        Self::from_outcome(outcome, |reply, version| reply.version = version)
    }

    pub fn into_version(self) -> Result<Outcome<u64>> {
        self.into_outcome(|reply| Ok(reply.version))
    }

    pub fn from_lock(outcome: Outcome<LockInfo>) -> Self {
        Self::from_outcome(outcome, |reply, lock| reply.lock = Some(lock))
    }

    pub fn into_lock(self) -> Result<Outcome<LockInfo>> {
        self.into_outcome(|reply| {
            reply
                .lock
                .ok_or_else(|| Error::CompactSerialization("done reply without lock".into()))
        })
    }

    pub fn from_unit(outcome: Outcome<()>) -> Self {
        Self::from_outcome(outcome, |_, ()| {})
    }

    pub fn into_unit(self) -> Result<Outcome<()>> {
        self.into_outcome(|_| Ok(()))
    }
}

impl CompactSerializable for OpReply {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_u8(self.status);
        writer.write_u64(self.version);
        writer.write_opt(self.lock.as_ref())?;
        writer.write_opt(self.entry.as_ref())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        Ok(Self {
            status: reader.read_u8()?,
            version: reader.read_u64()?,
            lock: reader.read_opt()?,
            entry: reader.read_opt()?,
        })
    }
}

/// Primary → backup copy of one write; no entry means removal
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicateWrite {
    pub primary: String,
    pub key: String,
    pub entry: Option<CacheEntry>,
}

impl CompactSerializable for ReplicateWrite {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_str(&self.primary)?;
        writer.write_str(&self.key)?;
        writer.write_opt(self.entry.as_ref())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        Ok(Self {
            primary: reader.read_str()?,
            key: reader.read_str()?,
            entry: reader.read_opt()?,
        })
    }
}

/// Pull one chunk of entries in `buckets` (empty = every bucket)
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransferRequest {
    pub requester: String,
    pub buckets: Vec<u32>,
    pub chunk: u32,
}

impl CompactSerializable for StateTransferRequest {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_str(&self.requester)?;
        writer.write_len(self.buckets.len())?;
        for bucket in &self.buckets {
            writer.write_u32(*bucket);
        }
        writer.write_u32(self.chunk);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        let requester = reader.read_str()?;
        let len = reader.read_len()?;
        let mut buckets = Vec::with_capacity(len.min(reader.remaining()));
        for _ in 0..len {
            buckets.push(reader.read_u32()?);
        }
        Ok(Self {
            requester,
            buckets,
            chunk: reader.read_u32()?,
        })
    }
}

/// Entries sent during state transfer or replica resync
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateTransferChunk {
    /// Primary the entries belong to, for replica resync
    pub primary: String,
    pub entries: Vec<CacheEntry>,
    pub chunk: u32,
    pub has_more: bool,
}

impl CompactSerializable for StateTransferChunk {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_str(&self.primary)?;
        writer.write_list(&self.entries)?;
        writer.write_u32(self.chunk);
        writer.write_bool(self.has_more);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        Ok(Self {
            primary: reader.read_str()?,
            entries: reader.read_list()?,
            chunk: reader.read_u32()?,
            has_more: reader.read_bool()?,
        })
    }
}

// =============================================================================
// JSON control messages
// =============================================================================

/// Member and its ring sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node: NodeId,
}

/// Membership after a change, applied by every member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipView {
    pub members: Vec<Member>,
    /// Bucket owners, index = bucket id
    pub buckets: Vec<NodeId>,
    pub version: u64,
}

/// Reply to a joiner: the new view and where to pull its buckets from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAccepted {
    pub view: MembershipView,
    /// Source node → buckets; an empty list means every bucket
    pub sources: BTreeMap<NodeId, Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub key: String,
    pub offset: u64,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamReply {
    /// Total value length, 0 when the key is absent
    pub length: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveNotice {
    pub node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceAnnouncement {
    pub info: NodeInfo,
}

/// Joining node's pull is complete; sources may drop `buckets`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferComplete {
    pub node: NodeId,
    pub buckets: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStateRequest {
    pub known: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterQuery {
    pub query: ContinuousQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryId {
    pub query_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub type_name: String,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyList {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRequest {
    pub group: String,
    pub subgroup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRequest {
    pub tags: Vec<String>,
    pub match_all: bool,
}

/// Locks of this holder are released wherever they are held
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolderRequest {
    pub holder: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Count {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapReduceRequest {
    pub task: String,
    pub filter: InputFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapReducePartial {
    pub output: Intermediate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapReduceResult {
    pub output: BTreeMap<String, Value>,
}

pub fn to_json<T: Serialize>(message: &T) -> Result<bytes::Bytes> {
    Ok(bytes::Bytes::from(serde_json::to_vec(message)?))
}

pub fn from_json<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::{SerializationContext, SurrogateSelector};
    use crate::storage::CacheValue;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn roundtrip<T: CompactSerializable>(message: &T) -> T {
        let selector = SurrogateSelector::new();
        let ctx = SerializationContext::new("cluster");
        let bytes = selector.serialize(message, &ctx).unwrap();
        selector.deserialize_value(&bytes, &ctx).unwrap()
    }

    #[test]
    fn test_write_request_carries_options() {
        let request = WriteRequest {
            entry: CacheEntry::new("k", CacheValue::object(String::from("v")), Utc::now()),
            add: false,
            access: LockAccess::Wait(Duration::from_millis(250)),
            expected_version: Some(7),
        };
        assert_eq!(roundtrip(&request), request);
    }

    #[test]
    fn test_reply_preserves_outcomes() {
        let lock = LockInfo {
            lock_id: 3,
            holder: "c1".into(),
            acquired_at: Utc::now(),
            expires_at: None,
        };
        let locked = roundtrip(&OpReply::from_version(Outcome::Locked(lock.clone())));
        assert_matches!(locked.into_version(), Ok(Outcome::Locked(l)) if l == lock);

        let done = roundtrip(&OpReply::from_version(Outcome::Done(42)));
        assert_matches!(done.into_version(), Ok(Outcome::Done(42)));

        let missing = roundtrip(&OpReply::from_entry(Outcome::NotFound));
        assert_matches!(missing.into_entry(), Ok(Outcome::NotFound));

        let timed_out = roundtrip(&OpReply::from_unit(Outcome::TimedOut));
        assert_matches!(timed_out.into_unit(), Ok(Outcome::TimedOut));
    }

    #[test]
    fn test_corrupt_reply_status_rejected() {
        let reply = OpReply {
            status: 9,
            ..Default::default()
        };
        assert_matches!(reply.into_unit(), Err(Error::CompactSerialization(_)));
    }

    #[test]
    fn test_transfer_request_buckets() {
        let request = StateTransferRequest {
            requester: "n3".into(),
            buckets: vec![0, 3, 999],
            chunk: 2,
        };
        assert_eq!(roundtrip(&request), request);
    }

    #[test]
    fn test_lock_request_release_form() {
        let request = LockRequest {
            key: "k".into(),
            holder: "c1".into(),
            lease: Some(Duration::from_secs(30)),
            access: LockAccess::Owner(5),
            release: true,
            lock_id: Some(5),
        };
        assert_eq!(roundtrip(&request), request);
    }
}
