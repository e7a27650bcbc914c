//! Stable query fingerprints.

use std::fmt;

use blake3::Hasher;
use serde::{Serialize, Serializer};
use serde_json::Value;

use super::filter::Filter;

/// Deterministic hash of `(collection, canonical filter)`.
///
/// Object keys are hashed in sorted order, so two filters with the same
/// criteria always collide regardless of how they were built.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprints an already canonicalized filter.
    #[must_use]
    pub fn of(collection: &str, filter: &Filter) -> Self {
        let mut h = Hasher::new();
        h.update(b"recache/index/v1\0");
        h.update(collection.as_bytes());
        h.update(b"\0");
        write_object(&mut h, filter.as_map());
        Self(*h.finalize().as_bytes())
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

fn write_object(h: &mut Hasher, map: &serde_json::Map<String, Value>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    h.update(b"{");
    for key in keys {
        write_value(h, &Value::String(key.clone()));
        h.update(b":");
        write_value(h, &map[key.as_str()]);
        h.update(b",");
    }
    h.update(b"}");
}

fn write_value(h: &mut Hasher, value: &Value) {
    match value {
        Value::Object(map) => write_object(h, map),
        Value::Array(items) => {
            h.update(b"[");
            for item in items {
                write_value(h, item);
                h.update(b",");
            }
            h.update(b"]");
        }
        scalar => {
            h.update(scalar.to_string().as_bytes());
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}
