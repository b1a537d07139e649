//! Deterministic JSON canonicalization and SHA-256 content hashing.
//!
//! Object keys are emitted in sorted order at every depth, so two values
//! that differ only in key insertion order serialize byte-identically.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::policy::PolicyBundle;
use crate::types::AgentSpec;

/// Prefix on every content hash.
pub const HASH_PREFIX: &str = "sha256:";

/// Record-envelope fields that never contribute to a spec hash.
const VOLATILE_FIELDS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "expires_at",
    "status",
    "status_reason",
];

/// Errors from canonical serialization.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    /// The value could not be serialized to JSON.
    #[error("canonical serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Rebuild `value` with every object's keys sorted.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact canonical JSON bytes of any serializable value.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialize`] if serialization fails.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalError> {
    // serde_json's `Map` may preserve insertion order; write sorted explicitly.
    Ok(write_sorted(&serde_json::to_value(value)?))
}

fn write_sorted(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    let key = Value::String(k.clone()).to_string();
                    let val = map.get(k).map(write_sorted).unwrap_or_default();
                    format!("{key}:{val}")
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(write_sorted).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Hex-encoded SHA-256 of `bytes`, without prefix.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `sha256:<hex>` of the canonical JSON of `value`.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialize`] if serialization fails.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalError> {
    let json = canonical_json(value)?;
    Ok(format!("{HASH_PREFIX}{}", sha256_hex(json.as_bytes())))
}

/// Canonical hashable view of an agent spec.
///
/// Drops record-envelope fields and the embedded proof bundle, which would
/// otherwise make the hash depend on itself.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialize`] if serialization fails.
pub fn spec_hash_input(spec: &AgentSpec) -> Result<Value, CanonicalError> {
    let mut value = serde_json::to_value(spec)?;
    strip_volatile(&mut value);
    Ok(canonicalize(&value))
}

/// Strip volatile fields from a raw agent document in place.
pub fn strip_volatile(value: &mut Value) {
    if let Value::Object(map) = value {
        for field in VOLATILE_FIELDS {
            map.remove(*field);
        }
        if let Some(Value::Object(governance)) = map.get_mut("governance") {
            governance.remove("proof");
            governance.remove("status");
        }
    }
}

/// `sha256:<hex>` spec hash of an agent spec.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialize`] if serialization fails.
pub fn spec_hash(spec: &AgentSpec) -> Result<String, CanonicalError> {
    content_hash(&spec_hash_input(spec)?)
}

/// `sha256:<hex>` of a policy bundle.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialize`] if serialization fails.
pub fn bundle_hash(bundle: &PolicyBundle) -> Result<String, CanonicalError> {
    content_hash(bundle)
}
