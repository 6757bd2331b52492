//! Data Format Boundary
//!
//! Converts payloads between the representation clients hand in, the one the
//! store keeps and the one handed back out.
//!
//! ```text
//!                 get_cache_data                 get_client_data
//!   client value ───────────────▶ stored value ────────────────▶ client value
//!
//!   Binary format:  object → envelope bytes       in-proc: bytes → object
//!                   bytes  → as is                out-proc: as is
//!   Object format:  bytes  → object               in-proc: as is
//!                   object → as is                out-proc: object → bytes
//! ```
//!
//! The envelope is `[codec tag][compact bytes, possibly compressed]`.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use super::compression::{CompressionAlgorithm, CompressionManager};
use super::entry::{CacheEntry, CacheValue};
use crate::config::{DataFormat, DeploymentMode};
use crate::error::{Error, Result};
use crate::pool::PoolManager;
use crate::serialization::{CompactObject, ObjectRef, SerializationContext, SurrogateSelector};

/// Encodes objects to envelopes and back
pub struct PayloadCodec {
    selector: Arc<SurrogateSelector>,
    context: SerializationContext,
    pools: Arc<PoolManager>,
    compression: CompressionManager,
}

impl PayloadCodec {
    pub fn new(
        selector: Arc<SurrogateSelector>,
        context: SerializationContext,
        pools: Arc<PoolManager>,
        compression: CompressionManager,
    ) -> Self {
        Self {
            selector,
            context,
            pools,
            compression,
        }
    }

    pub fn selector(&self) -> &SurrogateSelector {
        &self.selector
    }

    pub fn context(&self) -> &SerializationContext {
        &self.context
    }

    pub fn encode(&self, object: &dyn CompactObject) -> Result<Bytes> {
        let mut buffer = self.pools.buffers().rent(256);
        buffer.vec_mut().clear();
        let encoded = self
            .selector
            .serialize_into(object, &self.context, buffer.vec_mut())
            .map(|()| self.compression.compress(&buffer));
        self.pools.buffers().give_back(buffer);

        let (payload, algorithm) = encoded?;
        let mut envelope = BytesMut::with_capacity(payload.len() + 1);
        envelope.put_u8(algorithm.tag());
        envelope.put_slice(&payload);
        Ok(envelope.freeze())
    }

    pub fn decode(&self, envelope: &[u8]) -> Result<ObjectRef> {
        let (&tag, payload) = envelope.split_first().ok_or_else(|| {
            Error::CompactSerialization("empty payload envelope".to_string())
        })?;
        let algorithm = CompressionAlgorithm::from_tag(tag)?;
        let object = match algorithm {
            CompressionAlgorithm::None => self.selector.deserialize(payload, &self.context)?,
            _ => {
                let raw = self.compression.decompress(payload, algorithm)?;
                self.selector.deserialize(&raw, &self.context)?
            }
        };
        object.ok_or_else(|| Error::CompactSerialization("null payload".to_string()))
    }
}

/// Conversion between client and stored representations
pub trait DataFormatService: Send + Sync {
    fn format(&self) -> DataFormat;

    /// Client value → stored value
    fn get_cache_data(&self, value: CacheValue) -> Result<CacheValue>;

    /// Stored value → client value
    fn get_client_data(&self, value: &CacheValue) -> Result<CacheValue>;

    /// Copy of an entry carrying the client representation
    fn get_entry_clone(&self, entry: &CacheEntry) -> Result<CacheEntry> {
        let mut clone = entry.clone();
        clone.value = self.get_client_data(&entry.value)?;
        Ok(clone)
    }

    fn codec(&self) -> &PayloadCodec;
}

/// Entries stored pre-serialized
pub struct BinaryFormat {
    codec: PayloadCodec,
    deployment: DeploymentMode,
}

impl BinaryFormat {
    pub fn new(codec: PayloadCodec, deployment: DeploymentMode) -> Self {
        Self { codec, deployment }
    }
}

impl DataFormatService for BinaryFormat {
    fn format(&self) -> DataFormat {
        DataFormat::Binary
    }

    fn get_cache_data(&self, value: CacheValue) -> Result<CacheValue> {
        match value {
            CacheValue::Object(object) => Ok(CacheValue::Binary(self.codec.encode(object.as_ref())?)),
            binary => Ok(binary),
        }
    }

    fn get_client_data(&self, value: &CacheValue) -> Result<CacheValue> {
        match (self.deployment, value) {
            (DeploymentMode::InProc, CacheValue::Binary(bytes)) => {
                Ok(CacheValue::Object(self.codec.decode(bytes)?))
            }
            _ => Ok(value.clone()),
        }
    }

    fn codec(&self) -> &PayloadCodec {
        &self.codec
    }
}

/// Entries stored as live objects, serialized lazily for remote clients
pub struct ObjectFormat {
    codec: PayloadCodec,
    deployment: DeploymentMode,
}

impl ObjectFormat {
    pub fn new(codec: PayloadCodec, deployment: DeploymentMode) -> Self {
        Self { codec, deployment }
    }
}

impl DataFormatService for ObjectFormat {
    fn format(&self) -> DataFormat {
        DataFormat::Object
    }

    fn get_cache_data(&self, value: CacheValue) -> Result<CacheValue> {
        match value {
            CacheValue::Binary(bytes) => Ok(CacheValue::Object(self.codec.decode(&bytes)?)),
            object => Ok(object),
        }
    }

    fn get_client_data(&self, value: &CacheValue) -> Result<CacheValue> {
        match (self.deployment, value) {
            (DeploymentMode::OutProc, CacheValue::Object(object)) => {
                Ok(CacheValue::Binary(self.codec.encode(object.as_ref())?))
            }
            _ => Ok(value.clone()),
        }
    }

    fn codec(&self) -> &PayloadCodec {
        &self.codec
    }
}

pub fn format_service(
    format: DataFormat,
    deployment: DeploymentMode,
    codec: PayloadCodec,
) -> Arc<dyn DataFormatService> {
    match format {
        DataFormat::Binary => Arc::new(BinaryFormat::new(codec, deployment)),
        DataFormat::Object => Arc::new(ObjectFormat::new(codec, deployment)),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionSettings, PoolingConfig};
    use chrono::Utc;

    fn codec(compress: bool) -> PayloadCodec {
        PayloadCodec::new(
            Arc::new(SurrogateSelector::new()),
            SerializationContext::new("test"),
            Arc::new(PoolManager::new(&PoolingConfig::default())),
            CompressionManager::new(&CompressionSettings {
                enabled: compress,
                threshold_bytes: 32,
            }),
        )
    }

    #[test]
    fn test_envelope_roundtrip() {
        let codec = codec(false);
        let value = String::from("hello");
        let envelope = codec.encode(&value).unwrap();
        assert_eq!(envelope[0], CompressionAlgorithm::None.tag());

        let decoded = codec.decode(&envelope).unwrap();
        assert!(decoded.eq_object(&value));
    }

    #[test]
    fn test_compressed_envelope_roundtrip() {
        let codec = codec(true);
        let value = "abc".repeat(200);
        let envelope = codec.encode(&value).unwrap();
        assert_eq!(envelope[0], CompressionAlgorithm::Lz4.tag());
        assert!(envelope.len() < value.len());
        assert!(codec.decode(&envelope).unwrap().eq_object(&value));
    }

    #[test]
    fn test_binary_format_stores_bytes() {
        let format = BinaryFormat::new(codec(false), DeploymentMode::InProc);
        let stored = format
            .get_cache_data(CacheValue::object(42i64))
            .unwrap();
        assert!(stored.as_binary().is_some());

        let client = format.get_client_data(&stored).unwrap();
        assert_eq!(client.downcast::<i64>(), Some(&42));
    }

    #[test]
    fn test_binary_format_out_proc_passthrough() {
        let format = BinaryFormat::new(codec(false), DeploymentMode::OutProc);
        let bytes = CacheValue::binary(vec![9u8, 9, 9]);
        let stored = format.get_cache_data(bytes.clone()).unwrap();
        assert_eq!(stored, bytes);
        assert_eq!(format.get_client_data(&stored).unwrap(), bytes);
    }

    #[test]
    fn test_object_format_serializes_for_remote_clients() {
        let codec_for_client = codec(false);
        let envelope = codec_for_client.encode(&String::from("v")).unwrap();

        let format = ObjectFormat::new(codec(false), DeploymentMode::OutProc);
        let stored = format
            .get_cache_data(CacheValue::Binary(envelope.clone()))
            .unwrap();
        assert_eq!(stored.downcast::<String>().map(String::as_str), Some("v"));

        let entry = CacheEntry::new("k", stored, Utc::now());
        let clone = format.get_entry_clone(&entry).unwrap();
        assert_eq!(clone.value, CacheValue::Binary(envelope));
    }

    #[test]
    fn test_empty_envelope_rejected() {
        assert!(codec(false).decode(&[]).is_err());
    }
}
