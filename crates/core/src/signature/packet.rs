//! Signature packet and its JSON wire form
//!
//! ```json
//! {"payload": {...}, "signerID": "alice", "lastModified": 1700000000000,
//!  "signingKeyID": "3f1c...", "alg": "ES256", "sig": "<base64 DER>"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::KeyAlgorithm;
use crate::error::SignatureError;
use crate::signature::canonical::{self, Payload};

/// A signed payload with the metadata bound into its signature.
///
/// Immutable once built; any change to a field after signing makes
/// verification fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignaturePacket {
    pub(crate) payload: Payload,
    #[serde(rename = "signerID")]
    pub(crate) signer_id: String,
    #[serde(rename = "lastModified")]
    pub(crate) last_modified: i64,
    #[serde(rename = "signingKeyID")]
    pub(crate) signing_key_id: String,
    #[serde(rename = "alg")]
    pub(crate) algorithm: KeyAlgorithm,
    #[serde(rename = "sig", with = "base64_bytes")]
    pub(crate) signature: Vec<u8>,
}

impl SignaturePacket {
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn signer_id(&self) -> &str {
        &self.signer_id
    }

    /// Milliseconds since the Unix epoch, as supplied by the signer
    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// Fingerprint of the key that produced the signature
    pub fn signing_key_id(&self) -> &str {
        &self.signing_key_id
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Bytes the signature covers.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, SignatureError> {
        canonical::canonical_bytes(&self.payload, &self.signer_id, self.last_modified, &self.signing_key_id)
    }

    pub fn to_json(&self) -> Result<Value, SignatureError> {
        serde_json::to_value(self).map_err(|e| SignatureError::MalformedPayload(e.to_string()))
    }

    pub fn from_json(value: &Value) -> Result<Self, SignatureError> {
        Self::deserialize(value).map_err(|e| SignatureError::MalformedPayload(format!("bad signature packet: {}", e)))
    }

    pub fn from_json_str(text: &str) -> Result<Self, SignatureError> {
        serde_json::from_str(text).map_err(|e| SignatureError::MalformedPayload(format!("bad signature packet: {}", e)))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}
