//! PEM encoding of public keys and the in-memory public key handle

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::constants::pem::{FOOTER, HEADER, LINE_LENGTH};
use crate::crypto::algorithm::{self, KeyAlgorithm};
use crate::error::SignatureError;

/// A parsed public key, usable for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyHandle {
    key_id: String,
    algorithm: KeyAlgorithm,
    spki_der: Vec<u8>,
}

impl PublicKeyHandle {
    pub(crate) fn new(key_id: impl Into<String>, algorithm: KeyAlgorithm, spki_der: Vec<u8>) -> Self {
        Self { key_id: key_id.into(), algorithm, spki_der }
    }

    /// Label the handle was created with.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// DER SubjectPublicKeyInfo (public material, freely exportable).
    pub fn spki_der(&self) -> &[u8] {
        &self.spki_der
    }

    /// Fingerprint of the key material, independent of the label.
    pub fn fingerprint(&self) -> String {
        algorithm::fingerprint(&self.spki_der)
    }

    pub fn to_pem(&self) -> String {
        encode_pem(&self.spki_der)
    }

    /// Check a signature over `message` with this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        algorithm::verify_with_spki(self.algorithm, &self.spki_der, message, signature)
    }
}

/// Wrap DER bytes in a PEM public key block.
///
/// Lines are `LINE_LENGTH` characters, joined by `\n`, with no trailing newline.
pub fn encode_pem(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::with_capacity(body.len() + body.len() / LINE_LENGTH + HEADER.len() + FOOTER.len() + 2);
    pem.push_str(HEADER);
    pem.push('\n');

    let mut rest = body.as_str();
    while rest.len() > LINE_LENGTH {
        let (line, tail) = rest.split_at(LINE_LENGTH);
        pem.push_str(line);
        pem.push('\n');
        rest = tail;
    }
    pem.push_str(rest);
    pem.push('\n');

    pem.push_str(FOOTER);
    pem
}

/// Parse PEM public key text into a handle labelled `key_id`.
///
/// Accepts any line layout between the header and footer. Rejects anything
/// that is not a P-256 SubjectPublicKeyInfo whose point lies on the curve.
pub fn decode_pem(text: &str, key_id: &str) -> Result<PublicKeyHandle, SignatureError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix(HEADER)
        .and_then(|rest| rest.strip_suffix(FOOTER))
        .ok_or_else(|| SignatureError::InvalidPublicKeyFormat("missing PEM header or footer".to_string()))?;

    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(SignatureError::InvalidPublicKeyFormat("empty PEM body".to_string()));
    }

    let der = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| SignatureError::InvalidPublicKeyFormat(format!("bad base64: {}", e)))?;

    handle_from_spki(key_id, KeyAlgorithm::EcdsaP256Sha256, der)
}

/// Validate DER SubjectPublicKeyInfo bytes and wrap them in a handle.
pub(crate) fn handle_from_spki(
    key_id: &str,
    algorithm: KeyAlgorithm,
    der: Vec<u8>,
) -> Result<PublicKeyHandle, SignatureError> {
    match algorithm {
        KeyAlgorithm::EcdsaP256Sha256 => {
            let point = algorithm::point_from_spki(&der).ok_or_else(|| {
                SignatureError::InvalidPublicKeyFormat("not a P-256 SubjectPublicKeyInfo".to_string())
            })?;

            p256::PublicKey::from_sec1_bytes(point)
                .map_err(|_| SignatureError::InvalidPublicKeyFormat("point is not on P-256".to_string()))?;
        }
    }

    Ok(PublicKeyHandle::new(key_id, algorithm, der))
}
