//! Error types for key management and payload signing

use thiserror::Error;

/// Errors surfaced by `KeyManager`, `SignatureEngine` and the command layer.
///
/// A signature that simply does not match is *not* an error: `verify`
/// returns `Ok(false)` for that case. These variants describe structural
/// failures that prevent an operation from running at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Key pair generation failed for {uid}: {reason}")]
    KeyGenerationFailed { uid: String, reason: String },

    #[error("No key pair found for {0}")]
    KeyNotFound(String),

    #[error("Invalid public key format: {0}")]
    InvalidPublicKeyFormat(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Signer mismatch: packet signed by {actual}, expected {expected}")]
    SignerMismatch { expected: String, actual: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Key store error: {0}")]
    Store(String),
}

impl SignatureError {
    /// Stable failure code reported to the bridge layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyGenerationFailed { .. } => "KEY_GENERATION_FAILED",
            Self::KeyNotFound(_) => "KEY_NOT_FOUND",
            Self::InvalidPublicKeyFormat(_) => "INVALID_PUBLIC_KEY_FORMAT",
            Self::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Self::SignerMismatch { .. } => "SIGNER_MISMATCH",
            Self::InvalidArgument(_) => "INVALID_PARAMS",
            Self::Store(_) => "KEY_STORE_ERROR",
        }
    }

    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyGenerationFailed { .. } | Self::Store(_))
    }
}

/// Errors reported by a `SecureKeyStore` backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No entry for {0}")]
    NotFound(String),

    #[error("Corrupt entry for {uid}: {reason}")]
    Corrupt { uid: String, reason: String },

    #[error("Key store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

impl StoreError {
    /// Lift a store failure into the public error vocabulary.
    ///
    /// `NotFound` becomes `KeyNotFound` so callers see "generate first"
    /// instead of a backend fault.
    pub fn into_signature_error(self, uid: &str) -> SignatureError {
        match self {
            StoreError::NotFound(_) => SignatureError::KeyNotFound(uid.to_string()),
            other => SignatureError::Store(other.to_string()),
        }
    }
}
