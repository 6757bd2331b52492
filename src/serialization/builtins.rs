//! Built-in surrogates for primitives, collections and opaque payloads.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::reader::CompactReader;
use super::writer::CompactWriter;
use super::{objects_equal, CompactSerializable, ObjectRef};
use crate::error::{Error, Result};

impl CompactSerializable for bool {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_bool(*self);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        reader.read_bool()
    }
}

impl CompactSerializable for i32 {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_i32(*self);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        reader.read_i32()
    }
}

impl CompactSerializable for i64 {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_i64(*self);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        reader.read_i64()
    }
}

impl CompactSerializable for f64 {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_f64(*self);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        reader.read_f64()
    }
}

impl CompactSerializable for String {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_str(self)
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        reader.read_str()
    }
}

impl CompactSerializable for Bytes {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_bytes(self)
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        Ok(Bytes::copy_from_slice(reader.read_bytes()?))
    }
}

impl CompactSerializable for DateTime<Utc> {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_datetime(self);
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        reader.read_datetime()
    }
}

/// Heterogeneous list; each element carries its own handle
#[derive(Debug, Clone, Default)]
pub struct ObjectList(pub Vec<Option<ObjectRef>>);

impl PartialEq for ObjectList {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| objects_equal(a.as_ref(), b.as_ref()))
    }
}

impl CompactSerializable for ObjectList {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_len(self.0.len())?;
        for item in &self.0 {
            writer.write_opt_object(item.as_deref())?;
        }
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        let len = reader.read_len()?;
        let mut items = Vec::with_capacity(len.min(reader.remaining()));
        for _ in 0..len {
            items.push(reader.read_object()?);
        }
        Ok(Self(items))
    }
}

/// String-keyed map of objects, encoded in key order
#[derive(Debug, Clone, Default)]
pub struct ObjectMap(pub BTreeMap<String, Option<ObjectRef>>);

impl PartialEq for ObjectMap {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(&other.0).all(|((ka, va), (kb, vb))| {
                ka == kb && objects_equal(va.as_ref(), vb.as_ref())
            })
    }
}

impl CompactSerializable for ObjectMap {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_len(self.0.len())?;
        for (key, value) in &self.0 {
            writer.write_str(key)?;
            writer.write_opt_object(value.as_deref())?;
        }
        Ok(())
    }

    fn deserialize_fields(reader: &mut CompactReader<'_>) -> Result<Self> {
        let len = reader.read_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let key = reader.read_str()?;
            map.insert(key, reader.read_object()?);
        }
        Ok(Self(map))
    }
}

/// Native-path value read without a binder for its type
///
/// Kept as raw fields so it can be stored and re-encoded unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueObject {
    pub type_name: String,
    pub payload: Bytes,
}

impl CompactSerializable for OpaqueObject {
    fn serialize_fields(&self, writer: &mut CompactWriter<'_>) -> Result<()> {
        writer.write_raw(&self.payload);
        Ok(())
    }

    fn deserialize_fields(_reader: &mut CompactReader<'_>) -> Result<Self> {
        Err(Error::CompactSerialization(
            "opaque objects are produced by the native path only".to_string(),
        ))
    }
}
