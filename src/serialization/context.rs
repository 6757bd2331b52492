//! Per-call serialization context and custom type binding.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use super::{read_as_object, CompactSerializable, ReadFn};

/// Resolves native (unregistered) type names to readers
pub trait TypeBinder: Send + Sync {
    fn resolve(&self, type_name: &str) -> Option<ReadFn>;
}

/// Binder populated by explicitly binding concrete types
#[derive(Default)]
pub struct NativeTypeBinder {
    readers: DashMap<String, ReadFn>,
}

impl NativeTypeBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make values of `T` written through the native path readable again
    pub fn bind<T: CompactSerializable>(&self) {
        self.readers.insert(
            std::any::type_name::<T>().to_string(),
            read_as_object::<T> as ReadFn,
        );
    }
}

impl TypeBinder for NativeTypeBinder {
    fn resolve(&self, type_name: &str) -> Option<ReadFn> {
        self.readers.get(type_name).map(|r| *r.value())
    }
}

/// Scope and options of one serialize/deserialize call
#[derive(Clone, Default)]
pub struct SerializationContext {
    /// Cache whose user type registry applies
    pub cache_context: String,
    pub binder: Option<Arc<dyn TypeBinder>>,
    /// Parse and discard instead of materializing the top-level object
    pub skip: bool,
}

impl SerializationContext {
    pub fn new(cache_context: impl Into<String>) -> Self {
        Self {
            cache_context: cache_context.into(),
            binder: None,
            skip: false,
        }
    }

    pub fn with_binder(mut self, binder: Arc<dyn TypeBinder>) -> Self {
        self.binder = Some(binder);
        self
    }

    pub fn skipping(&self) -> Self {
        Self {
            skip: true,
            ..self.clone()
        }
    }
}

impl fmt::Debug for SerializationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializationContext")
            .field("cache_context", &self.cache_context)
            .field("binder", &self.binder.is_some())
            .field("skip", &self.skip)
            .finish()
    }
}
