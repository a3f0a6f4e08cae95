//! Error types for the cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache engine
///
/// Only construction and configuration loading surface these to callers.
/// Everything on the read/write path degrades to a miss or a skipped tier.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    // =========================================================================
    // Storage Tier Errors
    // =========================================================================
    /// Tier or backend quota exceeded
    #[error("Quota exceeded on tier {tier}: need {needed} bytes, {available} available")]
    QuotaExceeded {
        tier: String,
        needed: u64,
        available: u64,
    },

    /// Backend is disabled or cannot be reached
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// Persisted record failed validation
    #[error("Corrupt cache entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a corrupt record error
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CorruptEntry {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
