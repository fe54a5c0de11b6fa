//! Payload model and canonical byte encoding
//!
//! Sign and verify both hash the output of [`canonical_bytes`], never the
//! payload structure itself, so the encoding must be bit-identical on both
//! sides. Layout (scheme version 1):
//!
//! ```text
//! "KSG1"                         domain tag
//! u32 BE                         number of payload entries
//! field(key) field(value) ...    entries, keys in UTF-8 byte order
//! field(signerID)
//! field(lastModified)
//! field(signingKeyID)
//! ```
//!
//! Every `field` is a one-byte type tag, a u32 BE body length and the body,
//! so adjacent fields can never run into each other.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::constants::canonical::{DOMAIN_TAG, TAG_BOOLEAN, TAG_BYTES, TAG_INTEGER, TAG_STRING};
use crate::error::SignatureError;

/// JSON key marking a byte-sequence value: `{"$bytes": "<base64>"}`
pub const BYTES_KEY: &str = "$bytes";

/// A single payload value. The set is closed on purpose: anything else is
/// rejected as `MalformedPayload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Bytes(Vec<u8>),
}

impl PayloadValue {
    /// Convert one JSON value; `key` only feeds the error message.
    pub fn from_json(key: &str, value: &Value) -> Result<Self, SignatureError> {
        match value {
            Value::String(s) => Ok(Self::String(s.clone())),
            Value::Bool(b) => Ok(Self::Boolean(*b)),
            Value::Number(n) => n.as_i64().map(Self::Integer).ok_or_else(|| {
                SignatureError::MalformedPayload(format!("'{}' is not a 64-bit signed integer: {}", key, n))
            }),
            Value::Object(map) => match (map.len(), map.get(BYTES_KEY)) {
                (1, Some(Value::String(encoded))) => STANDARD
                    .decode(encoded.as_bytes())
                    .map(Self::Bytes)
                    .map_err(|e| SignatureError::MalformedPayload(format!("'{}' has invalid base64: {}", key, e))),
                _ => Err(SignatureError::MalformedPayload(format!(
                    "'{}' is a nested object; only {{\"{}\": ...}} is supported",
                    key, BYTES_KEY
                ))),
            },
            Value::Array(_) => Err(SignatureError::MalformedPayload(format!("'{}' is an array", key))),
            Value::Null => Err(SignatureError::MalformedPayload(format!("'{}' is null", key))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Integer(i) => Value::from(*i),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Bytes(bytes) => {
                let mut object = serde_json::Map::new();
                object.insert(BYTES_KEY.to_string(), Value::String(STANDARD.encode(bytes)));
                Value::Object(object)
            }
        }
    }
}

impl Serialize for PayloadValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) => serializer.serialize_str(s),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Bytes(bytes) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BYTES_KEY, &STANDARD.encode(bytes))?;
                map.end()
            }
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Vec<u8>> for PayloadValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// String-keyed payload. Keys are kept sorted, which is the canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, PayloadValue>);

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(|e| match e {
            SignatureError::MalformedPayload(reason) => D::Error::custom(reason),
            other => D::Error::custom(other),
        })
    }
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Option<PayloadValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder form of `insert`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PayloadValue> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.0.iter()
    }

    /// Convert a JSON object, rejecting unsupported value types.
    pub fn from_json(value: &Value) -> Result<Self, SignatureError> {
        let object = value
            .as_object()
            .ok_or_else(|| SignatureError::MalformedPayload("payload must be a JSON object".to_string()))?;

        object
            .iter()
            .map(|(key, value)| Ok((key.clone(), PayloadValue::from_json(key, value)?)))
            .collect::<Result<BTreeMap<_, _>, SignatureError>>()
            .map(Self)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
    }
}

impl From<BTreeMap<String, PayloadValue>> for Payload {
    fn from(map: BTreeMap<String, PayloadValue>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<PayloadValue>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ============================================================================
// CANONICAL ENCODING
// ============================================================================

struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    fn new() -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(DOMAIN_TAG);
        Self { buf }
    }

    fn length(&mut self, len: usize, what: &str) -> Result<(), SignatureError> {
        let len = u32::try_from(len)
            .map_err(|_| SignatureError::MalformedPayload(format!("{} exceeds {} bytes", what, u32::MAX)))?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        Ok(())
    }

    fn field(&mut self, tag: u8, body: &[u8]) -> Result<(), SignatureError> {
        self.buf.push(tag);
        self.length(body.len(), "field")?;
        self.buf.extend_from_slice(body);
        Ok(())
    }

    fn string(&mut self, s: &str) -> Result<(), SignatureError> {
        self.field(TAG_STRING, s.as_bytes())
    }

    fn integer(&mut self, i: i64) -> Result<(), SignatureError> {
        self.field(TAG_INTEGER, &i.to_be_bytes())
    }

    fn value(&mut self, value: &PayloadValue) -> Result<(), SignatureError> {
        match value {
            PayloadValue::String(s) => self.string(s),
            PayloadValue::Integer(i) => self.integer(*i),
            PayloadValue::Boolean(b) => self.field(TAG_BOOLEAN, &[u8::from(*b)]),
            PayloadValue::Bytes(bytes) => self.field(TAG_BYTES, bytes),
        }
    }
}

/// Deterministic byte sequence covering the payload and the signer metadata.
pub fn canonical_bytes(
    payload: &Payload,
    signer_id: &str,
    last_modified: i64,
    signing_key_id: &str,
) -> Result<Vec<u8>, SignatureError> {
    let mut writer = CanonicalWriter::new();
    writer.length(payload.len(), "entry count")?;

    for (key, value) in payload.iter() {
        writer.string(key)?;
        writer.value(value)?;
    }

    writer.string(signer_id)?;
    writer.integer(last_modified)?;
    writer.string(signing_key_id)?;
    Ok(writer.buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_layout() {
        let payload = Payload::new().with("n", 1i64);
        let bytes = canonical_bytes(&payload, "s", 2, "k").unwrap();

        let mut expected = b"KSG1".to_vec();
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&[b's', 0, 0, 0, 1, b'n']);
        expected.extend_from_slice(&[b'i', 0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 1]);
        expected.extend_from_slice(&[b's', 0, 0, 0, 1, b's']);
        expected.extend_from_slice(&[b'i', 0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 2]);
        expected.extend_from_slice(&[b's', 0, 0, 0, 1, b'k']);

        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = Payload::new().with("zeta", "z").with("alpha", 1i64).with("mid", true);
        let b = Payload::new().with("mid", true).with("alpha", 1i64).with("zeta", "z");

        assert_eq!(
            canonical_bytes(&a, "alice", 10, "k").unwrap(),
            canonical_bytes(&b, "alice", 10, "k").unwrap()
        );
    }

    #[test]
    fn test_adjacent_fields_do_not_collide() {
        let split_a = Payload::new().with("a", "b1");
        let split_b = Payload::new().with("ab", "1");
        assert_ne!(
            canonical_bytes(&split_a, "s", 0, "k").unwrap(),
            canonical_bytes(&split_b, "s", 0, "k").unwrap()
        );

        // Payload content cannot impersonate the trailing metadata
        let empty = canonical_bytes(&Payload::new(), "s", 0, "k").unwrap();
        let padded = canonical_bytes(&Payload::new().with("s", "s"), "", 0, "k").unwrap();
        assert_ne!(empty, padded);
    }

    #[test]
    fn test_types_are_distinguished() {
        let variants = vec![
            PayloadValue::String("1".into()),
            PayloadValue::Integer(1),
            PayloadValue::Boolean(true),
            PayloadValue::Bytes(vec![1]),
            PayloadValue::Bytes(b"1".to_vec()),
        ];

        let encodings: Vec<Vec<u8>> = variants
            .iter()
            .map(|v| canonical_bytes(&Payload::new().with("v", v.clone()), "s", 0, "k").unwrap())
            .collect();

        for i in 0..encodings.len() {
            for j in (i + 1)..encodings.len() {
                assert_ne!(encodings[i], encodings[j], "{:?} vs {:?}", variants[i], variants[j]);
            }
        }
    }

    #[test]
    fn test_metadata_is_covered() {
        let payload = Payload::new().with("msg", "hi");
        let base = canonical_bytes(&payload, "alice", 100, "k1").unwrap();

        assert_ne!(base, canonical_bytes(&payload, "bob", 100, "k1").unwrap());
        assert_ne!(base, canonical_bytes(&payload, "alice", 101, "k1").unwrap());
        assert_ne!(base, canonical_bytes(&payload, "alice", 100, "k2").unwrap());
    }

    #[test]
    fn test_payload_from_json() {
        let payload = Payload::from_json(&json!({
            "name": "door",
            "count": -3,
            "open": false,
            "blob": { "$bytes": "AQID" },
        }))
        .unwrap();

        assert_eq!(payload.get("name"), Some(&PayloadValue::String("door".into())));
        assert_eq!(payload.get("count"), Some(&PayloadValue::Integer(-3)));
        assert_eq!(payload.get("open"), Some(&PayloadValue::Boolean(false)));
        assert_eq!(payload.get("blob"), Some(&PayloadValue::Bytes(vec![1, 2, 3])));

        assert_eq!(Payload::from_json(&payload.to_json()).unwrap(), payload);
    }

    #[test]
    fn test_payload_rejects_unsupported_values() {
        let cases = vec![
            json!({ "lat": 51.5 }),
            json!({ "missing": null }),
            json!({ "list": [1, 2] }),
            json!({ "nested": { "a": 1 } }),
            json!({ "blob": { "$bytes": "not base64!" } }),
            json!({ "big": u64::MAX }),
            json!("not an object"),
        ];

        for case in cases {
            assert!(
                matches!(Payload::from_json(&case), Err(SignatureError::MalformedPayload(_))),
                "accepted {}",
                case
            );
        }
    }

    #[test]
    fn test_payload_serde_matches_json_form() {
        let payload = Payload::new().with("blob", vec![0xffu8]).with("n", 7i64);
        let text = serde_json::to_string(&payload).unwrap();
        assert_eq!(text, r#"{"blob":{"$bytes":"/w=="},"n":7}"#);

        let back: Payload = serde_json::from_str(&text).unwrap();
        assert_eq!(back, payload);

        let err = serde_json::from_str::<Payload>(r#"{"ok":1,"ratio":1.5}"#).unwrap_err();
        assert!(err.to_string().contains("'ratio'"), "{}", err);
    }
}
