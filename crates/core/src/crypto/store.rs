//! Secure key store abstraction
//!
//! The platform key store (Android Keystore, iOS Keychain, ...) holds private
//! key material and performs raw signing without exposing key bytes. The core
//! talks to it only through [`SecureKeyStore`], so it can run against the
//! file-backed store in `storage.rs` or the in-memory store below.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::algorithm::{self, KeyAlgorithm};
use crate::error::StoreError;

/// Validity window of a stored key pair, in milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: i64,
    pub not_after: i64,
}

impl Validity {
    /// Window opening now and lasting `days`.
    ///
    /// Fails when the end of the window is not representable.
    pub fn starting_now(days: i64) -> Result<Self, StoreError> {
        let now = Utc::now();
        let not_after = Duration::try_days(days)
            .and_then(|length| now.checked_add_signed(length))
            .ok_or_else(|| StoreError::Unavailable(format!("validity of {} days is out of range", days)))?;

        Ok(Self {
            not_before: now.timestamp_millis(),
            not_after: not_after.timestamp_millis(),
        })
    }

    pub fn contains(&self, at_millis: i64) -> bool {
        self.not_before <= at_millis && at_millis <= self.not_after
    }

    pub fn is_current(&self) -> bool {
        self.contains(Utc::now().timestamp_millis())
    }
}

/// Public half of a stored key pair plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPublicKey {
    pub algorithm: KeyAlgorithm,
    pub spki_der: Vec<u8>,
    pub validity: Validity,
    /// Changes every time the pair under this alias is (re)generated
    pub serial: u64,
}

/// Store-issued reference to a private key.
///
/// Holds the alias and generation serial only. A handle whose serial no
/// longer matches the stored pair is stale and cannot sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeyHandle {
    alias: String,
    serial: u64,
    algorithm: KeyAlgorithm,
}

impl StoreKeyHandle {
    pub fn new(alias: impl Into<String>, serial: u64, algorithm: KeyAlgorithm) -> Self {
        Self { alias: alias.into(), serial, algorithm }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }
}

/// Operations the core consumes from a secure key store.
pub trait SecureKeyStore: Send + Sync {
    /// A short backend name (e.g. `"memory"`, `"file"`).
    fn backend(&self) -> &'static str {
        "unknown"
    }

    /// Generate a key pair under `uid`, replacing any existing entry.
    ///
    /// Must be atomic: on failure the previous entry (or absence) is intact.
    fn generate(&self, algorithm: KeyAlgorithm, uid: &str, validity: Validity) -> Result<StoredPublicKey, StoreError>;

    /// Public half of the pair stored under `uid`.
    fn lookup_public(&self, uid: &str) -> Result<Option<StoredPublicKey>, StoreError>;

    /// Reference to the private half stored under `uid`.
    fn lookup_private_ref(&self, uid: &str) -> Result<Option<StoreKeyHandle>, StoreError>;

    /// Sign `bytes` with the referenced private key.
    fn sign_bytes(&self, handle: &StoreKeyHandle, bytes: &[u8]) -> Result<Vec<u8>, StoreError>;

    /// Remove the pair stored under `uid`. Returns whether one existed.
    fn delete(&self, uid: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

struct MemoryEntry {
    pkcs8: Zeroizing<Vec<u8>>,
    public: StoredPublicKey,
}

/// Process-local key store. Keys vanish with the process.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    next_serial: AtomicU64,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored key pairs
    pub fn len(&self) -> usize {
        self.entries().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, MemoryEntry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl SecureKeyStore for MemoryKeyStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn generate(&self, algorithm: KeyAlgorithm, uid: &str, validity: Validity) -> Result<StoredPublicKey, StoreError> {
        // Key material is complete before it becomes visible
        let generated = algorithm::generate(algorithm)?;
        let public = StoredPublicKey {
            algorithm,
            spki_der: generated.spki_der,
            validity,
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed) + 1,
        };

        self.entries()?.insert(
            uid.to_string(),
            MemoryEntry { pkcs8: generated.pkcs8, public: public.clone() },
        );
        debug!("Stored {} key pair for {} in memory", algorithm, uid);
        Ok(public)
    }

    fn lookup_public(&self, uid: &str) -> Result<Option<StoredPublicKey>, StoreError> {
        Ok(self.entries()?.get(uid).map(|entry| entry.public.clone()))
    }

    fn lookup_private_ref(&self, uid: &str) -> Result<Option<StoreKeyHandle>, StoreError> {
        Ok(self
            .entries()?
            .get(uid)
            .map(|entry| StoreKeyHandle::new(uid, entry.public.serial, entry.public.algorithm)))
    }

    fn sign_bytes(&self, handle: &StoreKeyHandle, bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
        let pkcs8 = {
            let entries = self.entries()?;
            match entries.get(handle.alias()) {
                Some(entry) if entry.public.serial == handle.serial() => entry.pkcs8.clone(),
                _ => return Err(StoreError::NotFound(handle.alias().to_string())),
            }
        };
        algorithm::sign_with_pkcs8(handle.algorithm(), &pkcs8, bytes)
    }

    fn delete(&self, uid: &str) -> Result<bool, StoreError> {
        Ok(self.entries()?.remove(uid).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::pem::PublicKeyHandle;

    #[test]
    fn test_validity_window() {
        let validity = Validity::starting_now(1).unwrap();
        assert!(validity.is_current());
        assert!(Validity::starting_now(i64::MAX).is_err());
        assert!(Validity::starting_now(100_000_000).is_err());
        assert!(!validity.contains(validity.not_before - 1));
        assert!(!validity.contains(validity.not_after + 1));

        let expired = Validity { not_before: 0, not_after: 1 };
        assert!(!expired.is_current());
    }

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemoryKeyStore::new();
        assert!(store.lookup_public("alice").unwrap().is_none());
        assert!(store.lookup_private_ref("alice").unwrap().is_none());

        let public = store
            .generate(KeyAlgorithm::EcdsaP256Sha256, "alice", Validity::starting_now(1).unwrap())
            .unwrap();
        assert_eq!(store.lookup_public("alice").unwrap(), Some(public.clone()));
        assert_eq!(store.len(), 1);

        let handle = store.lookup_private_ref("alice").unwrap().unwrap();
        let sig = store.sign_bytes(&handle, b"data").unwrap();
        let key = PublicKeyHandle::new("alice", public.algorithm, public.spki_der);
        assert!(key.verify(b"data", &sig));

        assert!(store.delete("alice").unwrap());
        assert!(!store.delete("alice").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_handle_cannot_sign() {
        let store = MemoryKeyStore::new();
        store.generate(KeyAlgorithm::EcdsaP256Sha256, "alice", Validity::starting_now(1).unwrap()).unwrap();
        let stale = store.lookup_private_ref("alice").unwrap().unwrap();

        store.generate(KeyAlgorithm::EcdsaP256Sha256, "alice", Validity::starting_now(1).unwrap()).unwrap();
        let fresh = store.lookup_private_ref("alice").unwrap().unwrap();

        assert_ne!(stale.serial(), fresh.serial());
        assert!(matches!(store.sign_bytes(&stale, b"data"), Err(StoreError::NotFound(_))));
        assert!(store.sign_bytes(&fresh, b"data").is_ok());
    }
}
