//! Sign and verify payloads bound to a signer identity

use serde_json::Value;
use tracing::{debug, warn};

use crate::crypto::{pem, PrivateKeyRef, PublicKeyHandle};
use crate::error::SignatureError;
use crate::signature::canonical::{canonical_bytes, Payload};
use crate::signature::packet::SignaturePacket;

/// Stateless signing engine. All key state lives behind the key refs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureEngine;

impl SignatureEngine {
    pub fn new() -> Self {
        Self
    }

    /// Sign `payload` as `signer_id` at `last_modified` (ms since epoch).
    ///
    /// The signature covers the canonical encoding of the payload together
    /// with the signer, the timestamp and the signing key's fingerprint.
    pub fn sign(
        &self,
        payload: Payload,
        key: &PrivateKeyRef,
        signer_id: &str,
        last_modified: i64,
    ) -> Result<SignaturePacket, SignatureError> {
        let message = canonical_bytes(&payload, signer_id, last_modified, key.key_id())?;
        let signature = key.sign(&message)?;
        if signature.is_empty() {
            return Err(SignatureError::Store(format!("empty signature for {}", key.uid())));
        }

        debug!(
            "✍️ Signed {} entries as {} with key {} ({} bytes)",
            payload.len(),
            signer_id,
            key.key_id(),
            signature.len()
        );

        Ok(SignaturePacket {
            payload,
            signer_id: signer_id.to_string(),
            last_modified,
            signing_key_id: key.key_id().to_string(),
            algorithm: key.algorithm(),
            signature,
        })
    }

    /// Verify `packet` against PEM public key text for `expected_signer_id`.
    ///
    /// `Ok(false)` means the signature does not hold; errors are reserved for
    /// unusable input and identity mismatch.
    pub fn verify(
        &self,
        packet: &SignaturePacket,
        public_key_text: &str,
        expected_signer_id: &str,
    ) -> Result<bool, SignatureError> {
        let key = pem::decode_pem(public_key_text, expected_signer_id)?;
        self.verify_with_key(packet, &key, expected_signer_id)
    }

    /// Verify a packet still in JSON form: an object, or its serialized text.
    ///
    /// Failures surface in the same order as `verify`: key text first, then
    /// the signer, then the packet body.
    pub fn verify_json(
        &self,
        packet: &Value,
        public_key_text: &str,
        expected_signer_id: &str,
    ) -> Result<bool, SignatureError> {
        let key = pem::decode_pem(public_key_text, expected_signer_id)?;

        let parsed;
        let packet = match packet {
            Value::String(text) => {
                parsed = serde_json::from_str::<Value>(text)
                    .map_err(|e| SignatureError::MalformedPayload(format!("bad signature packet: {}", e)))?;
                &parsed
            }
            other => other,
        };

        match packet.get("signerID").and_then(Value::as_str) {
            Some(signer) if signer != expected_signer_id => {
                return Err(SignatureError::SignerMismatch {
                    expected: expected_signer_id.to_string(),
                    actual: signer.to_string(),
                })
            }
            Some(_) => {}
            None => {
                return Err(SignatureError::MalformedPayload(
                    "bad signature packet: missing signerID".to_string(),
                ))
            }
        }

        let packet = SignaturePacket::from_json(packet)?;
        self.verify_with_key(&packet, &key, expected_signer_id)
    }

    /// Verify `packet` against an already parsed public key.
    pub fn verify_with_key(
        &self,
        packet: &SignaturePacket,
        key: &PublicKeyHandle,
        expected_signer_id: &str,
    ) -> Result<bool, SignatureError> {
        if packet.signer_id() != expected_signer_id {
            return Err(SignatureError::SignerMismatch {
                expected: expected_signer_id.to_string(),
                actual: packet.signer_id().to_string(),
            });
        }

        let message = packet.canonical_bytes()?;

        if packet.algorithm() != key.algorithm() {
            debug!("Packet algorithm {} does not match key algorithm {}", packet.algorithm(), key.algorithm());
            return Ok(false);
        }
        let fingerprint = key.fingerprint();
        if packet.signing_key_id() != fingerprint {
            debug!("Packet was signed by key {}, not {}", packet.signing_key_id(), fingerprint);
            return Ok(false);
        }
        if packet.signature().is_empty() {
            return Ok(false);
        }

        let valid = key.verify(&message, packet.signature());
        if valid {
            debug!("✅ Verified packet from {}", expected_signer_id);
        } else {
            warn!("❌ Signature check failed for packet from {}", expected_signer_id);
        }
        Ok(valid)
    }
}
