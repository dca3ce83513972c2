//! BLAKE3 hashing of resolved resource attributes.

use crate::core::types::AttrValue;
use indexmap::IndexMap;
use std::collections::BTreeMap;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash a resolved attribute map. Top-level key order does not affect the hash.
pub fn hash_attributes(attributes: &IndexMap<String, AttrValue>) -> String {
    let sorted: BTreeMap<&String, &AttrValue> = attributes.iter().collect();
    let canonical = serde_json::to_string(&sorted).unwrap_or_default();
    hash_string(&canonical)
}
