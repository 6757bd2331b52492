//! Compact Binary Serialization
//!
//! Type-handle based encoding of object graphs. Every value is written as
//! a 2-byte handle followed by a payload produced by the type's surrogate.
//!
//! # Wire Format
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────────────┐
//! │ i16 handle   │ payload                                              │
//! ├──────────────┼──────────────────────────────────────────────────────┤
//! │ 0            │ (null, no payload)                                   │
//! │ 1..999       │ u32 len │ built-in surrogate fields                  │
//! │ NATIVE (10)  │ u32 name len │ type name │ u32 len │ fields          │
//! │ >= 1000      │ u32 len │ user surrogate fields                      │
//! │ family       │ i16 sub-handle │ u32 len │ member surrogate fields   │
//! └──────────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! Every payload is length-prefixed, so a reader in skip mode can step over
//! an object without decoding its fields.
//!
//! All integers are little-endian. User handles are scoped per cache context
//! and must stay stable for the lifetime of the data they encoded. A handle
//! with no registered surrogate is a fatal stream error: the remaining
//! layout is unknown.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

mod builtins;
mod context;
pub mod handles;
mod proptest;
mod reader;
mod selector;
mod writer;

pub use builtins::{ObjectList, ObjectMap, OpaqueObject};
pub use context::{NativeTypeBinder, SerializationContext, TypeBinder};
pub use reader::CompactReader;
pub use selector::{Surrogate, SurrogateSelector};
pub use writer::CompactWriter;

/// Shared handle to a deserialized object
pub type ObjectRef = Arc<dyn CompactObject>;

/// Reads one object's fields after its handle has been consumed
pub type ReadFn = fn(&mut CompactReader<'_>) -> Result<ObjectRef>;

/// Field-level encoding of a concrete type
pub trait CompactSerializable: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()>;

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self>;
}

/// Object-safe view of any [`CompactSerializable`] value
pub trait CompactObject: Any + Send + Sync + fmt::Debug {
    fn write_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str;

    fn eq_object(&self, other: &dyn CompactObject) -> bool;
}

impl<T: CompactSerializable> CompactObject for T {
    fn write_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        self.serialize_fields(writer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn eq_object(&self, other: &dyn CompactObject) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| other == self)
    }
}

/// Equality of optional object references by value
pub fn objects_equal(a: Option<&ObjectRef>, b: Option<&ObjectRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.eq_object(b.as_ref()),
        _ => false,
    }
}

/// Length of the compact encoding of `object`, handle included.
///
/// Registered user handles are not resolved, so a value that would travel
/// the native path is charged without its type name.
pub fn encoded_len(object: &dyn CompactObject) -> Result<u64> {
    let context = SerializationContext::default();
    let mut out = Vec::new();
    CompactWriter::measuring(&mut out, &context).write_object(object)?;
    Ok(out.len() as u64)
}

pub(crate) fn read_as_object<T: CompactSerializable>(
    reader: &mut CompactReader<'_>,
) -> Result<ObjectRef> {
    Ok(Arc::new(T::deserialize_fields(reader)?))
}
