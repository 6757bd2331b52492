//! Compact stream writer.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::builtins::OpaqueObject;
use super::context::SerializationContext;
use super::handles;
use super::selector::SurrogateSelector;
use super::{CompactObject, CompactSerializable};
use crate::error::{Error, Result};

/// Appends compact encodings to a caller-owned buffer
pub struct CompactWriter<'a> {
    out: &'a mut Vec<u8>,
    /// `None` while measuring: nested handles are charged at their fixed width
    selector: Option<&'a SurrogateSelector>,
    context: &'a SerializationContext,
}

impl<'a> CompactWriter<'a> {
    pub fn new(
        out: &'a mut Vec<u8>,
        selector: &'a SurrogateSelector,
        context: &'a SerializationContext,
    ) -> Self {
        Self {
            out,
            selector: Some(selector),
            context,
        }
    }

    /// Writer that sizes an encoding without resolving registered handles
    pub(crate) fn measuring(out: &'a mut Vec<u8>, context: &'a SerializationContext) -> Self {
        Self {
            out,
            selector: None,
            context,
        }
    }

    pub fn context(&self) -> &SerializationContext {
        self.context
    }

    pub fn written(&self) -> usize {
        self.out.len()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.out.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.out.push(value as u8);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.out.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    /// Bytes with no length prefix
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Collection or byte length prefix
    pub fn write_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| Error::CompactSerialization(format!("length {} exceeds u32", len)))?;
        self.write_u32(len);
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_len(bytes.len())?;
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_opt_str(&mut self, value: Option<&str>) -> Result<()> {
        self.write_bool(value.is_some());
        match value {
            Some(v) => self.write_str(v),
            None => Ok(()),
        }
    }

    pub fn write_str_list(&mut self, values: &[String]) -> Result<()> {
        self.write_len(values.len())?;
        for value in values {
            self.write_str(value)?;
        }
        Ok(())
    }

    /// Exact timestamp: seconds plus sub-second nanos
    pub fn write_datetime(&mut self, value: &DateTime<Utc>) {
        self.write_i64(value.timestamp());
        self.write_u32(value.timestamp_subsec_nanos());
    }

    pub fn write_duration(&mut self, value: Duration) {
        self.write_u64(value.as_secs());
        self.write_u32(value.subsec_nanos());
    }

    /// Handle plus fields of a nested object
    pub fn write_object(&mut self, object: &dyn CompactObject) -> Result<()> {
        if let Some(opaque) = object.as_any().downcast_ref::<OpaqueObject>() {
            self.write_i16(handles::NATIVE);
            self.write_str(&opaque.type_name)?;
            return self.write_bytes(&opaque.payload);
        }

        let Some(selector) = self.selector else {
            self.write_i16(handles::NULL);
            return self.write_framed(|writer| object.write_fields(writer));
        };
        let type_id = object.as_any().type_id();
        match selector.surrogate_for_type(type_id, &self.context.cache_context) {
            Some(surrogate) => {
                self.write_i16(surrogate.handle);
                if let Some(sub_handle) = surrogate.sub_handle {
                    self.write_i16(sub_handle);
                }
                self.write_framed(|writer| object.write_fields(writer))
            }
            None => self.write_native(object),
        }
    }

    /// Length-prefixed block; the prefix is patched once the fields are written
    fn write_framed<F>(&mut self, fields: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let start = self.out.len();
        self.write_u32(0);
        fields(self)?;
        let len = self.out.len() - start - 4;
        let len = u32::try_from(len).map_err(|_| {
            Error::CompactSerialization(format!("object payload of {} bytes too large", len))
        })?;
        self.out[start..start + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    pub fn write_opt_object(&mut self, object: Option<&dyn CompactObject>) -> Result<()> {
        match object {
            Some(object) => self.write_object(object),
            None => {
                self.write_i16(handles::NULL);
                Ok(())
            }
        }
    }

    /// Homogeneous list: one length prefix, no per-element handle
    pub fn write_list<T: CompactSerializable>(&mut self, values: &[T]) -> Result<()> {
        self.write_len(values.len())?;
        for value in values {
            value.serialize_fields(self)?;
        }
        Ok(())
    }

    pub fn write_opt<T: CompactSerializable>(&mut self, value: Option<&T>) -> Result<()> {
        self.write_bool(value.is_some());
        match value {
            Some(v) => v.serialize_fields(self),
            None => Ok(()),
        }
    }

    fn write_native(&mut self, object: &dyn CompactObject) -> Result<()> {
        let mut payload = Vec::new();
        {
            let mut nested = CompactWriter {
                out: &mut payload,
                selector: self.selector,
                context: self.context,
            };
            object.write_fields(&mut nested)?;
        }
        self.write_i16(handles::NATIVE);
        self.write_str(object.type_name())?;
        self.write_bytes(&payload)
    }
}
