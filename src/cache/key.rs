//! Cache Key Construction
//!
//! Turns a logical request (service, operation, parameters) into a
//! deterministic key of the form `service:operation:<16 hex digits>`.

use serde::Serialize;
use serde_json::{Map, Value};

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// FxHash followed by the murmur3 fmix64 finalizer.
///
/// FxHash alone leaves the high bits weakly mixed for short inputs; the
/// finalizer spreads every input bit across the whole word.
#[inline]
pub fn hash64(bytes: &[u8]) -> u64 {
    let mut h = fx_hash(bytes) ^ (bytes.len() as u64);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Builds namespaced cache keys from request parameters
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    salt: Option<String>,
}

impl KeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a salt into every hash, e.g. to roll a key scheme version
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    /// Build a key from JSON parameters
    pub fn build_key(&self, service: &str, operation: &str, params: &Value) -> String {
        let canonical = canonical_json(params);

        let mut material = String::with_capacity(canonical.len() + 64);
        material.push_str(service);
        material.push('\u{1f}');
        material.push_str(operation);
        material.push('\u{1f}');
        if let Some(ref salt) = self.salt {
            material.push_str(salt);
            material.push('\u{1f}');
        }
        material.push_str(&canonical);

        format!("{}:{}:{:016x}", service, operation, hash64(material.as_bytes()))
    }

    /// Build a key from any serializable parameter type
    ///
    /// Parameters that fail to serialize hash as `null`.
    pub fn key_for<P: Serialize>(&self, service: &str, operation: &str, params: &P) -> String {
        let value = serde_json::to_value(params).unwrap_or(Value::Null);
        self.build_key(service, operation, &value)
    }
}

/// Normalize a parameter tree: drop null fields, lower-case strings, sort
/// object fields.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_lowercase()),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(fields) => {
            let mut sorted: Vec<(&String, &Value)> =
                fields.iter().filter(|(_, v)| !v.is_null()).collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));

            let mut out = Map::new();
            for (name, v) in sorted {
                out.insert(name.clone(), normalize(v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Canonical compact serialization of the normalized tree
fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&normalize(value), &mut out);
    out
}

// Field order is written explicitly so the result does not depend on the
// map implementation serde_json was built with.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(fields) => {
            let mut names: Vec<&String> = fields.keys().collect();
            names.sort();
            out.push('{');
            for (i, name) in names.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(&fields[name], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================
