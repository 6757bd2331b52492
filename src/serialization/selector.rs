//! Surrogate registry.
//!
//! Built-in surrogates are fixed at construction. User surrogates are
//! registered per cache context and looked up by type (on write) or by
//! handle (on read).

use std::any::TypeId;
use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::builtins::{ObjectList, ObjectMap};
use super::context::SerializationContext;
use super::handles;
use super::reader::CompactReader;
use super::writer::CompactWriter;
use super::{read_as_object, CompactObject, CompactSerializable, ObjectRef, ReadFn};
use crate::cluster::messages::{
    KeyRequest, LockRequest, OpReply, ReplicateWrite, StateTransferChunk, StateTransferRequest,
    WriteRequest,
};
use crate::error::{Error, Result};
use crate::storage::{CacheEntry, LockInfo};

/// Type-specific encoder/decoder binding
#[derive(Clone, Copy)]
pub struct Surrogate {
    pub handle: i16,
    /// Set for members of a polymorphic family
    pub sub_handle: Option<i16>,
    pub type_name: &'static str,
    pub(crate) read: ReadFn,
}

impl Surrogate {
    fn of<T: CompactSerializable>(handle: i16, sub_handle: Option<i16>) -> Self {
        Self {
            handle,
            sub_handle,
            type_name: std::any::type_name::<T>(),
            read: read_as_object::<T>,
        }
    }
}

impl std::fmt::Debug for Surrogate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surrogate")
            .field("handle", &self.handle)
            .field("sub_handle", &self.sub_handle)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Outcome of a handle lookup
pub(crate) enum Resolution {
    Type(Surrogate),
    /// A sub-handle follows in the stream
    Family,
    Missing,
}

enum HandleEntry {
    Type(Surrogate),
    Family(HashMap<i16, Surrogate>),
}

#[derive(Default)]
struct ContextRegistry {
    by_type: HashMap<TypeId, Surrogate>,
    by_handle: HashMap<i16, HandleEntry>,
}

/// Surrogate lookup for one cache instance
pub struct SurrogateSelector {
    builtin_by_type: HashMap<TypeId, Surrogate>,
    builtin_by_handle: HashMap<i16, Surrogate>,
    contexts: DashMap<String, ContextRegistry>,
}

impl Default for SurrogateSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl SurrogateSelector {
    pub fn new() -> Self {
        let builtins = [
            (TypeId::of::<bool>(), Surrogate::of::<bool>(handles::BOOL, None)),
            (TypeId::of::<i32>(), Surrogate::of::<i32>(handles::I32, None)),
            (TypeId::of::<i64>(), Surrogate::of::<i64>(handles::I64, None)),
            (TypeId::of::<f64>(), Surrogate::of::<f64>(handles::F64, None)),
            (TypeId::of::<String>(), Surrogate::of::<String>(handles::STRING, None)),
            (TypeId::of::<Bytes>(), Surrogate::of::<Bytes>(handles::BYTES, None)),
            (
                TypeId::of::<DateTime<Utc>>(),
                Surrogate::of::<DateTime<Utc>>(handles::DATETIME, None),
            ),
            (TypeId::of::<ObjectList>(), Surrogate::of::<ObjectList>(handles::LIST, None)),
            (TypeId::of::<ObjectMap>(), Surrogate::of::<ObjectMap>(handles::MAP, None)),
            (
                TypeId::of::<CacheEntry>(),
                Surrogate::of::<CacheEntry>(handles::CACHE_ENTRY, None),
            ),
            (TypeId::of::<LockInfo>(), Surrogate::of::<LockInfo>(handles::LOCK_INFO, None)),
            (
                TypeId::of::<KeyRequest>(),
                Surrogate::of::<KeyRequest>(handles::KEY_REQUEST, None),
            ),
            (
                TypeId::of::<WriteRequest>(),
                Surrogate::of::<WriteRequest>(handles::WRITE_REQUEST, None),
            ),
            (
                TypeId::of::<LockRequest>(),
                Surrogate::of::<LockRequest>(handles::LOCK_REQUEST, None),
            ),
            (TypeId::of::<OpReply>(), Surrogate::of::<OpReply>(handles::OP_REPLY, None)),
            (
                TypeId::of::<ReplicateWrite>(),
                Surrogate::of::<ReplicateWrite>(handles::REPLICATE_WRITE, None),
            ),
            (
                TypeId::of::<StateTransferRequest>(),
                Surrogate::of::<StateTransferRequest>(handles::STATE_TRANSFER_REQUEST, None),
            ),
            (
                TypeId::of::<StateTransferChunk>(),
                Surrogate::of::<StateTransferChunk>(handles::STATE_TRANSFER_CHUNK, None),
            ),
        ];

        let builtin_by_handle = builtins.iter().map(|(_, s)| (s.handle, *s)).collect();
        Self {
            builtin_by_type: builtins.into_iter().collect(),
            builtin_by_handle,
            contexts: DashMap::new(),
        }
    }

    /// Register a user type under `handle` in `cache_context`
    pub fn register<T: CompactSerializable>(&self, cache_context: &str, handle: i16) -> Result<()> {
        Self::check_user_handle(handle)?;
        self.reject_builtin_type::<T>()?;

        let mut registry = self.contexts.entry(cache_context.to_string()).or_default();
        if registry.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(Error::CompactSerialization(format!(
                "type {} already registered in context '{}'",
                std::any::type_name::<T>(),
                cache_context
            )));
        }
        if registry.by_handle.contains_key(&handle) {
            return Err(Error::CompactSerialization(format!(
                "handle {} already registered in context '{}'",
                handle, cache_context
            )));
        }

        let surrogate = Surrogate::of::<T>(handle, None);
        registry.by_type.insert(TypeId::of::<T>(), surrogate);
        registry.by_handle.insert(handle, HandleEntry::Type(surrogate));
        debug!(handle, type_name = surrogate.type_name, cache_context, "Registered surrogate");
        Ok(())
    }

    /// Register a member of the polymorphic family rooted at `handle`
    pub fn register_family_member<T: CompactSerializable>(
        &self,
        cache_context: &str,
        handle: i16,
        sub_handle: i16,
    ) -> Result<()> {
        Self::check_user_handle(handle)?;
        self.reject_builtin_type::<T>()?;

        let mut registry = self.contexts.entry(cache_context.to_string()).or_default();
        if registry.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(Error::CompactSerialization(format!(
                "type {} already registered in context '{}'",
                std::any::type_name::<T>(),
                cache_context
            )));
        }

        let surrogate = Surrogate::of::<T>(handle, Some(sub_handle));
        match registry
            .by_handle
            .entry(handle)
            .or_insert_with(|| HandleEntry::Family(HashMap::new()))
        {
            HandleEntry::Type(_) => {
                return Err(Error::CompactSerialization(format!(
                    "handle {} is a plain type, not a family",
                    handle
                )))
            }
            HandleEntry::Family(members) => {
                if members.contains_key(&sub_handle) {
                    return Err(Error::CompactSerialization(format!(
                        "sub-handle {} already registered in family {}",
                        sub_handle, handle
                    )));
                }
                members.insert(sub_handle, surrogate);
            }
        }
        registry.by_type.insert(TypeId::of::<T>(), surrogate);
        Ok(())
    }

    /// Drop every user registration of a cache context
    pub fn unregister_context(&self, cache_context: &str) {
        self.contexts.remove(cache_context);
    }

    pub fn is_registered<T: CompactSerializable>(&self, cache_context: &str) -> bool {
        self.surrogate_for_type(TypeId::of::<T>(), cache_context)
            .is_some()
    }

    fn check_user_handle(handle: i16) -> Result<()> {
        if handle < handles::CUSTOM_TYPE_RANGE {
            return Err(Error::CompactSerialization(format!(
                "user handle {} below reserved range {}",
                handle,
                handles::CUSTOM_TYPE_RANGE
            )));
        }
        Ok(())
    }

    fn reject_builtin_type<T: CompactSerializable>(&self) -> Result<()> {
        if self.builtin_by_type.contains_key(&TypeId::of::<T>()) {
            return Err(Error::CompactSerialization(format!(
                "type {} has a built-in surrogate",
                std::any::type_name::<T>()
            )));
        }
        Ok(())
    }

    /// Surrogate used to write a value of the given type
    pub fn surrogate_for_type(&self, type_id: TypeId, cache_context: &str) -> Option<Surrogate> {
        if let Some(surrogate) = self.builtin_by_type.get(&type_id) {
            return Some(*surrogate);
        }
        self.contexts
            .get(cache_context)
            .and_then(|registry| registry.by_type.get(&type_id).copied())
    }

    pub(crate) fn resolve(&self, handle: i16, cache_context: &str) -> Resolution {
        if handles::is_builtin(handle) {
            return match self.builtin_by_handle.get(&handle) {
                Some(surrogate) => Resolution::Type(*surrogate),
                None => Resolution::Missing,
            };
        }
        match self.contexts.get(cache_context) {
            Some(registry) => match registry.by_handle.get(&handle) {
                Some(HandleEntry::Type(surrogate)) => Resolution::Type(*surrogate),
                Some(HandleEntry::Family(_)) => Resolution::Family,
                None => Resolution::Missing,
            },
            None => Resolution::Missing,
        }
    }

    pub(crate) fn resolve_member(
        &self,
        handle: i16,
        sub_handle: i16,
        cache_context: &str,
    ) -> Option<Surrogate> {
        let registry = self.contexts.get(cache_context)?;
        match registry.by_handle.get(&handle)? {
            HandleEntry::Family(members) => members.get(&sub_handle).copied(),
            HandleEntry::Type(_) => None,
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Append the encoding of `graph` to `out`
    pub fn serialize_into(
        &self,
        graph: &dyn CompactObject,
        context: &SerializationContext,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let mut writer = CompactWriter::new(out, self, context);
        writer.write_object(graph)
    }

    pub fn serialize(&self, graph: &dyn CompactObject, context: &SerializationContext) -> Result<Bytes> {
        let mut out = Vec::new();
        self.serialize_into(graph, context, &mut out)?;
        Ok(Bytes::from(out))
    }

    /// Decode one object; `None` for a null graph or in skip mode
    pub fn deserialize(&self, bytes: &[u8], context: &SerializationContext) -> Result<Option<ObjectRef>> {
        let mut reader = CompactReader::new(bytes, self, context);
        let object = reader.read_object()?;
        if reader.remaining() != 0 {
            return Err(Error::CompactSerialization(format!(
                "{} trailing bytes after object",
                reader.remaining()
            )));
        }
        Ok(object)
    }

    /// Decode one object of a known type
    pub fn deserialize_value<T: CompactSerializable>(
        &self,
        bytes: &[u8],
        context: &SerializationContext,
    ) -> Result<T> {
        let mut reader = CompactReader::new(bytes, self, context);
        let value = reader.read_value::<T>()?;
        if reader.remaining() != 0 {
            return Err(Error::CompactSerialization(format!(
                "{} trailing bytes after {}",
                reader.remaining(),
                std::any::type_name::<T>()
            )));
        }
        Ok(value)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::{NativeTypeBinder, OpaqueObject};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Order {
        id: i64,
        customer: String,
        lines: Vec<OrderLine>,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct OrderLine {
        sku: String,
        quantity: i32,
    }

    impl CompactSerializable for OrderLine {
        fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
            writer.write_str(&self.sku)?;
            writer.write_i32(self.quantity);
            Ok(())
        }

        fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
            Ok(Self {
                sku: reader.read_str()?,
                quantity: reader.read_i32()?,
            })
        }
    }

    impl CompactSerializable for Order {
        fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
            writer.write_i64(self.id);
            writer.write_str(&self.customer)?;
            writer.write_list(&self.lines)
        }

        fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
            Ok(Self {
                id: reader.read_i64()?,
                customer: reader.read_str()?,
                lines: reader.read_list()?,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Circle(f64);

    #[derive(Debug, Clone, PartialEq)]
    struct Square(f64);

    impl CompactSerializable for Circle {
        fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
            writer.write_f64(self.0);
            Ok(())
        }

        fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
            Ok(Self(reader.read_f64()?))
        }
    }

    impl CompactSerializable for Square {
        fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
            writer.write_f64(self.0);
            Ok(())
        }

        fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
            Ok(Self(reader.read_f64()?))
        }
    }

    fn order() -> Order {
        Order {
            id: 42,
            customer: "acme".into(),
            lines: vec![
                OrderLine {
                    sku: "a-1".into(),
                    quantity: 3,
                },
                OrderLine {
                    sku: "b-2".into(),
                    quantity: 1,
                },
            ],
        }
    }

    #[test]
    fn test_leading_handle_written() {
        let selector = SurrogateSelector::new();
        let ctx = SerializationContext::new("orders");
        selector.register::<Order>("orders", 1001).unwrap();

        let bytes = selector.serialize(&order(), &ctx).unwrap();
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 1001);

        let decoded: Order = selector.deserialize_value(&bytes, &ctx).unwrap();
        assert_eq!(decoded, order());
    }

    #[test]
    fn test_user_handles_scoped_per_context() {
        let selector = SurrogateSelector::new();
        selector.register::<Order>("a", 1001).unwrap();

        let bytes = selector
            .serialize(&order(), &SerializationContext::new("a"))
            .unwrap();
        let result = selector.deserialize(&bytes, &SerializationContext::new("b"));
        assert_matches!(result, Err(Error::CompactSerialization(_)));
    }

    #[test]
    fn test_reserved_and_duplicate_handles_rejected() {
        let selector = SurrogateSelector::new();
        assert_matches!(
            selector.register::<Order>("c", 50),
            Err(Error::CompactSerialization(_))
        );
        selector.register::<Order>("c", 1001).unwrap();
        assert_matches!(
            selector.register::<OrderLine>("c", 1001),
            Err(Error::CompactSerialization(_))
        );
        assert_matches!(
            selector.register::<String>("c", 1002),
            Err(Error::CompactSerialization(_))
        );
    }

    #[test]
    fn test_unknown_handle_is_fatal() {
        let selector = SurrogateSelector::new();
        let ctx = SerializationContext::new("c");
        let bytes = 4242i16.to_le_bytes();
        assert_matches!(
            selector.deserialize(&bytes, &ctx),
            Err(Error::CompactSerialization(msg)) if msg.contains("4242")
        );
    }

    #[test]
    fn test_family_sub_handles() {
        let selector = SurrogateSelector::new();
        let ctx = SerializationContext::new("shapes");
        selector
            .register_family_member::<Circle>("shapes", 2000, 1)
            .unwrap();
        selector
            .register_family_member::<Square>("shapes", 2000, 2)
            .unwrap();

        let bytes = selector.serialize(&Square(2.5), &ctx).unwrap();
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 2000);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 2);

        let decoded = selector.deserialize(&bytes, &ctx).unwrap().unwrap();
        assert!(decoded.eq_object(&Square(2.5)));
    }

    #[test]
    fn test_unknown_sub_handle_is_fatal() {
        let selector = SurrogateSelector::new();
        let ctx = SerializationContext::new("shapes");
        selector
            .register_family_member::<Circle>("shapes", 2000, 1)
            .unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2000i16.to_le_bytes());
        bytes.extend_from_slice(&9i16.to_le_bytes());
        bytes.extend_from_slice(&1.0f64.to_bits().to_le_bytes());
        assert_matches!(
            selector.deserialize(&bytes, &ctx),
            Err(Error::CompactSerialization(_))
        );
    }

    #[test]
    fn test_unregistered_type_uses_native_path() {
        let selector = SurrogateSelector::new();
        let ctx = SerializationContext::new("c");

        let bytes = selector.serialize(&order(), &ctx).unwrap();
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), handles::NATIVE);

        // Without a binder the value surfaces as opaque and re-encodes identically
        let opaque = selector.deserialize(&bytes, &ctx).unwrap().unwrap();
        let opaque_ref = opaque.as_any().downcast_ref::<OpaqueObject>().unwrap();
        assert!(opaque_ref.type_name.ends_with("Order"));
        assert_eq!(selector.serialize(opaque.as_ref(), &ctx).unwrap(), bytes);

        // With a binder it materializes
        let binder = Arc::new(NativeTypeBinder::new());
        binder.bind::<Order>();
        let bound_ctx = SerializationContext::new("c").with_binder(binder);
        let decoded: Order = selector.deserialize_value(&bytes, &bound_ctx).unwrap();
        assert_eq!(decoded, order());
    }

    static TALLY_READS: AtomicUsize = AtomicUsize::new(0);

    /// Counts how often its fields are decoded
    #[derive(Debug, Clone, PartialEq)]
    struct Tally(i64);

    impl CompactSerializable for Tally {
        fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
            writer.write_i64(self.0);
            Ok(())
        }

        fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
            TALLY_READS.fetch_add(1, Ordering::SeqCst);
            Ok(Self(reader.read_i64()?))
        }
    }

    #[test]
    fn test_skip_mode_consumes_without_materializing() {
        let selector = SurrogateSelector::new();
        let ctx = SerializationContext::new("c");
        selector.register::<Tally>("c", 1500).unwrap();

        let graph = ObjectList(vec![
            Some(Arc::new(Tally(1)) as ObjectRef),
            Some(Arc::new(order()) as ObjectRef),
            None,
        ]);
        let bytes = selector.serialize(&graph, &ctx).unwrap();

        let before = TALLY_READS.load(Ordering::SeqCst);
        assert!(selector
            .deserialize(&bytes, &ctx.skipping())
            .unwrap()
            .is_none());
        assert_eq!(TALLY_READS.load(Ordering::SeqCst), before);

        let single = selector.serialize(&Tally(7), &ctx).unwrap();
        assert!(selector
            .deserialize(&single, &ctx.skipping())
            .unwrap()
            .is_none());
        assert_eq!(TALLY_READS.load(Ordering::SeqCst), before);

        let decoded = selector.deserialize(&single, &ctx).unwrap().unwrap();
        assert!(decoded.eq_object(&Tally(7)));
        assert_eq!(TALLY_READS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_skip_mode_still_rejects_unknown_handles() {
        let selector = SurrogateSelector::new();
        let ctx = SerializationContext::new("c").skipping();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4242i16.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert_matches!(
            selector.deserialize(&bytes, &ctx),
            Err(Error::CompactSerialization(_))
        );
    }

    #[test]
    fn test_payload_overrun_rejected() {
        let selector = SurrogateSelector::new();
        let ctx = SerializationContext::new("c");
        selector.register::<Circle>("c", 1600).unwrap();

        // Frame claims 9 bytes but the fields only use 8
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1600i16.to_le_bytes());
        bytes.extend_from_slice(&9u32.to_le_bytes());
        bytes.extend_from_slice(&1.5f64.to_bits().to_le_bytes());
        bytes.push(0);
        assert_matches!(
            selector.deserialize(&bytes, &ctx),
            Err(Error::CompactSerialization(msg)) if msg.contains("unread")
        );
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let selector = SurrogateSelector::new();
        let ctx = SerializationContext::new("c");
        let bytes = selector.serialize(&String::from("payload"), &ctx).unwrap();
        assert_matches!(
            selector.deserialize(&bytes[..bytes.len() - 2], &ctx),
            Err(Error::CompactSerialization(_))
        );
    }
}
