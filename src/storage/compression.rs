//! Payload Compression
//!
//! LZ4 compression of serialized payloads above a size threshold, with
//! fallback to the raw bytes when compression fails or does not help.
//! The chosen codec travels with the payload as a one-byte tag.

use bytes::Bytes;
use tracing::warn;

use crate::config::CompressionSettings;
use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Envelope tag byte
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            other => Err(Error::DecompressionFailed {
                algorithm: "unknown".into(),
                reason: format!("unknown codec tag {}", other),
            }),
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 block compressor, size-prefixed
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(data, Some(lz4::block::CompressionMode::DEFAULT), true).map_err(
            |e| Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            },
        )
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

pub struct CompressionManager {
    enabled: bool,
    threshold_bytes: u64,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl CompressionManager {
    pub fn new(settings: &CompressionSettings) -> Self {
        Self {
            enabled: settings.enabled,
            threshold_bytes: settings.threshold_bytes,
            noop: NoopCompressor,
            lz4: Lz4Compressor,
        }
    }

    /// Manager that never compresses
    pub fn disabled() -> Self {
        Self::new(&CompressionSettings {
            enabled: false,
            ..CompressionSettings::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Compress if enabled and above threshold, else return the input
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if !self.enabled || (data.len() as u64) < self.threshold_bytes {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.lz4.compress(data) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), CompressionAlgorithm::Lz4)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                warn!("Compression failed, using uncompressed: {}", e);
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        let decompressed = self.compressor(algorithm).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    fn enabled(threshold_bytes: u64) -> CompressionManager {
        CompressionManager::new(&CompressionSettings {
            enabled: true,
            threshold_bytes,
        })
    }

    #[test]
    fn test_lz4_roundtrip() {
        let compressed = Lz4Compressor.compress(TEST_DATA).unwrap();
        assert!(compressed.len() < TEST_DATA.len());
        assert_eq!(Lz4Compressor.decompress(&compressed).unwrap(), TEST_DATA);
    }

    #[test]
    fn test_below_threshold_not_compressed() {
        let manager = enabled(1024);
        let (result, algorithm) = manager.compress(TEST_DATA);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(result.as_ref(), TEST_DATA);
    }

    #[test]
    fn test_disabled_never_compresses() {
        let (_, algorithm) = CompressionManager::disabled().compress(&[b'a'; 100_000]);
        assert_eq!(algorithm, CompressionAlgorithm::None);
    }

    #[test]
    fn test_manager_roundtrip() {
        let manager = enabled(16);
        let (compressed, algorithm) = manager.compress(TEST_DATA);
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        let decompressed = manager.decompress(&compressed, algorithm).unwrap();
        assert_eq!(decompressed.as_ref(), TEST_DATA);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_matches!(
            CompressionAlgorithm::from_tag(9),
            Err(Error::DecompressionFailed { .. })
        );
        assert_eq!(
            CompressionAlgorithm::from_tag(1).unwrap(),
            CompressionAlgorithm::Lz4
        );
    }
}
