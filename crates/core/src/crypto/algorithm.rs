//! Signature algorithm policy and the raw ring primitives behind it

use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, KeyPair, UnparsedPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

use crate::constants::keys::{FINGERPRINT_BYTES, P256_POINT_LEN, P256_SPKI_PREFIX};
use crate::error::StoreError;

/// Signature algorithm a key pair is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// ECDSA over P-256 with SHA-256, ASN.1 DER signatures
    #[serde(rename = "ES256")]
    EcdsaP256Sha256,
}

impl KeyAlgorithm {
    /// Tag carried in every signature packet.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::EcdsaP256Sha256 => "ES256",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ES256" => Some(Self::EcdsaP256Sha256),
            _ => None,
        }
    }
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        Self::EcdsaP256Sha256
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Freshly generated key material, as handed to a store for persistence.
pub struct GeneratedKey {
    /// PKCS#8 private key document, wiped on drop
    pub pkcs8: Zeroizing<Vec<u8>>,
    /// DER SubjectPublicKeyInfo of the public half
    pub spki_der: Vec<u8>,
}

/// Generate a new key pair for `algorithm`.
pub fn generate(algorithm: KeyAlgorithm) -> Result<GeneratedKey, StoreError> {
    let rng = SystemRandom::new();
    match algorithm {
        KeyAlgorithm::EcdsaP256Sha256 => {
            let document = EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
                .map_err(|_| StoreError::Crypto("P-256 key generation failed".to_string()))?;
            let pkcs8 = Zeroizing::new(document.as_ref().to_vec());
            let spki_der = public_spki_from_pkcs8(algorithm, &pkcs8)?;
            Ok(GeneratedKey { pkcs8, spki_der })
        }
    }
}

/// Derive the DER SubjectPublicKeyInfo from a PKCS#8 private key.
pub fn public_spki_from_pkcs8(algorithm: KeyAlgorithm, pkcs8: &[u8]) -> Result<Vec<u8>, StoreError> {
    match algorithm {
        KeyAlgorithm::EcdsaP256Sha256 => {
            let rng = SystemRandom::new();
            let key_pair = EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
                .map_err(|e| StoreError::Crypto(format!("PKCS#8 rejected: {}", e)))?;
            Ok(spki_from_point(key_pair.public_key().as_ref()))
        }
    }
}

/// Sign `message` with a PKCS#8 private key.
pub fn sign_with_pkcs8(algorithm: KeyAlgorithm, pkcs8: &[u8], message: &[u8]) -> Result<Vec<u8>, StoreError> {
    match algorithm {
        KeyAlgorithm::EcdsaP256Sha256 => {
            let rng = SystemRandom::new();
            let key_pair = EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
                .map_err(|e| StoreError::Crypto(format!("PKCS#8 rejected: {}", e)))?;
            let sig = key_pair
                .sign(&rng, message)
                .map_err(|_| StoreError::Crypto("ECDSA signing failed".to_string()))?;
            Ok(sig.as_ref().to_vec())
        }
    }
}

/// Check `signature` over `message` against a DER SubjectPublicKeyInfo.
pub fn verify_with_spki(algorithm: KeyAlgorithm, spki_der: &[u8], message: &[u8], signature: &[u8]) -> bool {
    match algorithm {
        KeyAlgorithm::EcdsaP256Sha256 => match point_from_spki(spki_der) {
            Some(point) => UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, point)
                .verify(message, signature)
                .is_ok(),
            None => false,
        },
    }
}

/// Wrap an uncompressed P-256 point in a SubjectPublicKeyInfo.
pub fn spki_from_point(point: &[u8]) -> Vec<u8> {
    let mut der = Vec::with_capacity(P256_SPKI_PREFIX.len() + point.len());
    der.extend_from_slice(&P256_SPKI_PREFIX);
    der.extend_from_slice(point);
    der
}

/// Extract the uncompressed point from a P-256 SubjectPublicKeyInfo.
pub fn point_from_spki(spki_der: &[u8]) -> Option<&[u8]> {
    if spki_der.len() != P256_SPKI_PREFIX.len() + P256_POINT_LEN {
        return None;
    }
    let (prefix, point) = spki_der.split_at(P256_SPKI_PREFIX.len());
    if prefix != P256_SPKI_PREFIX || point[0] != 0x04 {
        return None;
    }
    Some(point)
}

/// Short, stable identifier for a public key.
pub fn fingerprint(spki_der: &[u8]) -> String {
    let digest = Sha256::digest(spki_der);
    hex::encode(&digest[..FINGERPRINT_BYTES])
}
