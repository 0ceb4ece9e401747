//! Payload extraction and the content-hash change detector.
//!
//! The hash covers the *payload* of an object only. Metadata and status are
//! excluded, so two objects that differ only in cluster bookkeeping hash the
//! same.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use api::keys;

// Top-level keys that are never payload for unknown kinds. apiVersion and
// kind live in TypeMeta on a DynamicObject, but they can also appear in the
// free-form body when objects are built from raw JSON.
const NON_PAYLOAD_KEYS: [&str; 4] = ["metadata", "status", "apiVersion", "kind"];

/// Payload_of extracts the hashable payload of an object's body.
///
/// Known kinds use their concrete shape: Secret `{type, data, stringData}`,
/// ConfigMap `{data, binaryData}`. Unknown kinds use `spec` when present,
/// otherwise every top-level key except metadata, status, apiVersion, kind.
/// The result is a deep copy; the input is never mutated.
pub fn payload_of(kind: &str, data: &Value) -> Value {
    let fields: &[&str] = match kind {
        "Secret" => &["type", "data", "stringData"],
        "ConfigMap" => &["data", "binaryData"],
        _ => {
            if let Some(spec) = data.get("spec") {
                return Value::Object(Map::from_iter([("spec".to_string(), spec.clone())]));
            }
            let mut out = Map::new();
            if let Value::Object(body) = data {
                for (k, v) in body {
                    if !NON_PAYLOAD_KEYS.contains(&k.as_str()) {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
            return Value::Object(out);
        }
    };
    let mut out = Map::new();
    for f in fields {
        if let Some(v) = data.get(f) {
            out.insert(f.to_string(), v.clone());
        }
    }
    Value::Object(out)
}

/// Copy_payload is the payload as written into a mirror: like [`payload_of`]
/// but `stringData` is never carried (the server has already folded it into
/// `data` on the source).
pub(crate) fn copy_payload(kind: &str, data: &Value) -> Value {
    let mut p = payload_of(kind, data);
    if kind == "Secret" {
        if let Value::Object(m) = &mut p {
            m.remove("stringData");
        }
    }
    p
}

/// Content_hash is the 64-character lowercase hex SHA-256 of the canonical
/// serialization of the payload.
pub fn content_hash(kind: &str, data: &Value) -> String {
    let payload = payload_of(kind, data);
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(&payload));
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

// Canonical form: objects re-keyed in sorted order, recursively, then compact
// JSON. Byte-equal logical payloads serialize byte-equal regardless of the
// map backend's iteration order.
fn canonical_bytes(v: &Value) -> Vec<u8> {
    serde_json::to_vec(&sorted(v)).expect("JSON value always serializes")
}

fn sorted(v: &Value) -> Value {
    match v {
        Value::Object(m) => {
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), sorted(&m[k]));
            }
            Value::Object(out)
        }
        Value::Array(a) => Value::Array(a.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Needs_sync reports whether a mirror must be rewritten for the source.
///
/// Generation is a cheap accelerator: a non-zero source generation that
/// disagrees with the mirror's recorded one forces a sync without hashing
/// anything. The hash comparison is the authoritative layer.
pub fn needs_sync(source_generation: Option<i64>, source_hash: &str, mirror: &ObjectMeta) -> bool {
    let ann = mirror.annotations.as_ref();
    if let Some(g) = source_generation.filter(|&g| g != 0) {
        let recorded = ann
            .and_then(|a| a.get(keys::SOURCE_GENERATION_ANNOTATION))
            .and_then(|s| s.parse::<i64>().ok());
        if recorded != Some(g) {
            return true;
        }
    }
    ann.and_then(|a| a.get(keys::SOURCE_CONTENT_HASH_ANNOTATION))
        .is_none_or(|h| h != source_hash)
}
