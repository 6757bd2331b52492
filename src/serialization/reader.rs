//! Compact stream reader.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::builtins::OpaqueObject;
use super::context::SerializationContext;
use super::handles;
use super::selector::{Resolution, SurrogateSelector};
use super::{CompactSerializable, ObjectRef};
use crate::error::{Error, Result};

/// Cursor over a compact byte stream
pub struct CompactReader<'a> {
    data: &'a [u8],
    pos: usize,
    selector: &'a SurrogateSelector,
    context: &'a SerializationContext,
}

impl<'a> CompactReader<'a> {
    pub fn new(
        data: &'a [u8],
        selector: &'a SurrogateSelector,
        context: &'a SerializationContext,
    ) -> Self {
        Self {
            data,
            pos: 0,
            selector,
            context,
        }
    }

    pub fn context(&self) -> &SerializationContext {
        self.context
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::CompactSerialization(format!(
                "unexpected end of stream: need {} bytes at offset {}, {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::CompactSerialization(format!(
                "invalid boolean byte {}",
                other
            ))),
        }
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_len(&mut self) -> Result<usize> {
        Ok(self.read_u32()? as usize)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_len()?;
        self.take(len)
    }

    pub fn read_str(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::CompactSerialization(format!("invalid UTF-8 string: {}", e)))
    }

    pub fn read_opt_str(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            Ok(Some(self.read_str()?))
        } else {
            Ok(None)
        }
    }

    pub fn read_str_list(&mut self) -> Result<Vec<String>> {
        let len = self.read_len()?;
        let mut values = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            values.push(self.read_str()?);
        }
        Ok(values)
    }

    pub fn read_datetime(&mut self) -> Result<DateTime<Utc>> {
        let secs = self.read_i64()?;
        let nanos = self.read_u32()?;
        DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
            Error::CompactSerialization(format!("timestamp {}s {}ns out of range", secs, nanos))
        })
    }

    pub fn read_duration(&mut self) -> Result<Duration> {
        let secs = self.read_u64()?;
        let nanos = self.read_u32()?;
        if nanos >= 1_000_000_000 {
            return Err(Error::CompactSerialization(format!(
                "duration nanos {} out of range",
                nanos
            )));
        }
        Ok(Duration::new(secs, nanos))
    }

    /// Next object, `None` for a null handle.
    ///
    /// In skip mode the handle is still resolved, so an unknown handle stays
    /// fatal, but the payload is stepped over and never decoded.
    pub fn read_object(&mut self) -> Result<Option<ObjectRef>> {
        let handle = self.read_i16()?;
        if handle == handles::NULL {
            return Ok(None);
        }
        if handle == handles::NATIVE {
            if self.context.skip {
                self.read_bytes()?;
                self.read_bytes()?;
                return Ok(None);
            }
            return self.read_native().map(Some);
        }

        let context = self.context;
        let cache_context = context.cache_context.as_str();
        let surrogate = match self.selector.resolve(handle, cache_context) {
            Resolution::Type(surrogate) => surrogate,
            Resolution::Family => {
                let sub_handle = self.read_i16()?;
                self.selector
                    .resolve_member(handle, sub_handle, cache_context)
                    .ok_or_else(|| {
                        Error::CompactSerialization(format!(
                            "no surrogate registered for sub-handle {} of family {} in context '{}'",
                            sub_handle, handle, cache_context
                        ))
                    })?
            }
            Resolution::Missing => {
                return Err(Error::CompactSerialization(format!(
                    "no surrogate registered for handle {} in context '{}'",
                    handle, cache_context
                )))
            }
        };

        let payload = self.read_bytes()?;
        if context.skip {
            return Ok(None);
        }
        let mut fields = CompactReader::new(payload, self.selector, context);
        let object = (surrogate.read)(&mut fields)?;
        if fields.remaining() != 0 {
            return Err(Error::CompactSerialization(format!(
                "{} unread bytes in {} payload",
                fields.remaining(),
                surrogate.type_name
            )));
        }
        Ok(Some(object))
    }

    /// Next object downcast to `T`
    pub fn read_value<T: CompactSerializable>(&mut self) -> Result<T> {
        self.read_opt_value()?.ok_or_else(|| {
            Error::CompactSerialization(format!(
                "expected {}, found null",
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn read_opt_value<T: CompactSerializable>(&mut self) -> Result<Option<T>> {
        match self.read_object()? {
            None => Ok(None),
            Some(object) => object
                .as_any()
                .downcast_ref::<T>()
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    Error::CompactSerialization(format!(
                        "expected {}, found {}",
                        std::any::type_name::<T>(),
                        object.type_name()
                    ))
                }),
        }
    }

    pub fn read_list<T: CompactSerializable>(&mut self) -> Result<Vec<T>> {
        let len = self.read_len()?;
        let mut values = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            values.push(T::deserialize_fields(self)?);
        }
        Ok(values)
    }

    pub fn read_opt<T: CompactSerializable>(&mut self) -> Result<Option<T>> {
        if self.read_bool()? {
            Ok(Some(T::deserialize_fields(self)?))
        } else {
            Ok(None)
        }
    }

    fn read_native(&mut self) -> Result<ObjectRef> {
        let type_name = self.read_str()?;
        let payload = self.read_bytes()?;

        let reader = self
            .context
            .binder
            .as_ref()
            .and_then(|binder| binder.resolve(&type_name));

        match reader {
            Some(read) => {
                let mut nested = CompactReader::new(payload, self.selector, self.context);
                read(&mut nested)
            }
            None => Ok(Arc::new(OpaqueObject {
                type_name,
                payload: Bytes::copy_from_slice(payload),
            })),
        }
    }
}
