//! Payload Codec
//!
//! Serializes values with serde_json and LZ4-compresses payloads above a size
//! threshold, falling back to uncompressed storage on any failure.
//!
//! # Example
//!
//! ```
//! use hearthcache::cache::compression::{Codec, CompressionConfig};
//!
//! let codec = Codec::new(CompressionConfig { min_size_bytes: 16, ..Default::default() });
//!
//! let value = vec!["flour"; 64];
//! let encoded = codec.encode(&value).unwrap();
//! assert!(encoded.compressed);
//!
//! let decoded: Vec<String> = codec.decode(&encoded.bytes, encoded.compressed).unwrap();
//! assert_eq!(decoded.len(), 64);
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for payload compression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionConfig {
    /// Compress at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Payloads smaller than this are stored uncompressed
    #[serde(default = "default_min_size")]
    pub min_size_bytes: u64,
    /// LZ4 high-compression level
    #[serde(default = "default_level")]
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_size_bytes: default_min_size(),
            level: default_level(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_min_size() -> u64 {
    1024 // 1KB minimum
}

fn default_level() -> i32 {
    4
}

// =============================================================================
// LZ4 Compressor
// =============================================================================

/// LZ4 block compressor with a size prefix
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::with_level(default_level())
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Result of encoding a value
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    /// Bytes to store
    pub bytes: Bytes,
    /// Whether `bytes` is LZ4-compressed
    pub compressed: bool,
    /// Serialized length minus stored length
    pub bytes_saved: u64,
}

/// Serialize + compress values for storage
pub struct Codec {
    config: CompressionConfig,
    lz4: Lz4Compressor,
}

impl Codec {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            config,
        }
    }

    /// Serialize a value, compressing it when large enough.
    ///
    /// Only serialization can fail; compression problems fall back to the
    /// uncompressed form.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<EncodedPayload> {
        let serialized = serde_json::to_vec(value)?;
        Ok(self.compress(serialized))
    }

    /// Compress already-serialized bytes
    pub fn compress(&self, serialized: Vec<u8>) -> EncodedPayload {
        if !self.config.enabled || (serialized.len() as u64) < self.config.min_size_bytes {
            return uncompressed(serialized);
        }

        match self.lz4.compress(&serialized) {
            // Only use compressed if it's actually smaller
            Ok(compressed) if compressed.len() < serialized.len() => EncodedPayload {
                bytes_saved: (serialized.len() - compressed.len()) as u64,
                bytes: Bytes::from(compressed),
                compressed: true,
            },
            Ok(_) => uncompressed(serialized),
            Err(e) => {
                tracing::warn!("Compression failed, using uncompressed: {}", e);
                uncompressed(serialized)
            }
        }
    }

    /// Reverse [`Codec::encode`]
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8], compressed: bool) -> Result<T> {
        if compressed {
            let raw = self.lz4.decompress(bytes)?;
            Ok(serde_json::from_slice(&raw)?)
        } else {
            Ok(serde_json::from_slice(bytes)?)
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

fn uncompressed(serialized: Vec<u8>) -> EncodedPayload {
    EncodedPayload {
        bytes: Bytes::from(serialized),
        compressed: false,
        bytes_saved: 0,
    }
}
