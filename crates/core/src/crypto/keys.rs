//! Key management for keysign
//!
//! `KeyManager` guarantees at most one valid key pair per identity on top of
//! an injected [`SecureKeyStore`]. Generation for one identity is serialized
//! through a per-identity lock; different identities never wait on each
//! other.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::constants::keys::DEFAULT_VALIDITY_DAYS;
use crate::crypto::algorithm::{self, KeyAlgorithm};
use crate::crypto::pem::{self, PublicKeyHandle};
use crate::crypto::store::{SecureKeyStore, StoreKeyHandle, StoredPublicKey, Validity};
use crate::error::SignatureError;

/// Outcome of `generate_key_pair_if_necessary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPairStatus {
    /// A new pair was created and persisted
    Generated,
    /// A well-formed, unexpired pair already existed; nothing changed
    Valid,
    /// Nothing was persisted
    Failed(String),
}

impl KeyPairStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::Valid => "valid",
            Self::Failed(_) => "failed",
        }
    }
}

/// Key generation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPolicy {
    pub algorithm: KeyAlgorithm,
    pub validity_days: i64,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            algorithm: KeyAlgorithm::default(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }
}

/// Opaque capability to sign with one identity's private key.
///
/// Never yields key bytes; the only thing it can do is ask the store that
/// issued it for a signature.
#[derive(Clone)]
pub struct PrivateKeyRef {
    uid: String,
    key_id: String,
    handle: StoreKeyHandle,
    store: Arc<dyn SecureKeyStore>,
}

impl PrivateKeyRef {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Fingerprint of the matching public key
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.handle.algorithm()
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        self.store
            .sign_bytes(&self.handle, message)
            .map_err(|e| e.into_signature_error(&self.uid))
    }
}

impl fmt::Debug for PrivateKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyRef")
            .field("uid", &self.uid)
            .field("key_id", &self.key_id)
            .field("backend", &self.store.backend())
            .finish()
    }
}

enum ExistingPair {
    Usable,
    Expired,
    Malformed(String),
}

/// Lifecycle manager for per-identity key pairs.
pub struct KeyManager {
    store: Arc<dyn SecureKeyStore>,
    policy: KeyPolicy,
    identity_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn SecureKeyStore>) -> Self {
        Self::with_policy(store, KeyPolicy::default())
    }

    pub fn with_policy(store: Arc<dyn SecureKeyStore>, policy: KeyPolicy) -> Self {
        Self {
            store,
            policy,
            identity_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn SecureKeyStore> {
        &self.store
    }

    /// Ensure a valid key pair exists for `uid`.
    ///
    /// Safe to call repeatedly and concurrently: callers for the same uid
    /// converge on one stored pair and at most one of them sees `Generated`.
    pub fn generate_key_pair_if_necessary(&self, uid: &str) -> KeyPairStatus {
        if uid.is_empty() {
            warn!("Refusing key generation for an empty uid");
            return KeyPairStatus::Failed("uid must not be empty".to_string());
        }

        self.with_identity_lock(uid, || match self.store.lookup_public(uid) {
            Ok(Some(existing)) => match self.inspect(&existing) {
                ExistingPair::Usable => {
                    debug!("Key pair for {} is valid", uid);
                    KeyPairStatus::Valid
                }
                ExistingPair::Expired => {
                    info!("⏰ Key pair for {} expired, regenerating", uid);
                    self.generate_locked(uid)
                }
                ExistingPair::Malformed(reason) => {
                    warn!("Stored key pair for {} is corrupt: {}", uid, reason);
                    KeyPairStatus::Failed(reason)
                }
            },
            Ok(None) => self.generate_locked(uid),
            Err(e) => {
                warn!("Key store lookup for {} failed: {}", uid, e);
                KeyPairStatus::Failed(e.to_string())
            }
        })
    }

    /// Like `generate_key_pair_if_necessary`, but as a `Result`.
    pub fn ensure_key_pair(&self, uid: &str) -> Result<KeyPairStatus, SignatureError> {
        match self.generate_key_pair_if_necessary(uid) {
            KeyPairStatus::Failed(reason) => Err(SignatureError::KeyGenerationFailed {
                uid: uid.to_string(),
                reason,
            }),
            status => Ok(status),
        }
    }

    /// PEM encoding of the public key stored for `uid`.
    pub fn public_key(&self, uid: &str) -> Result<String, SignatureError> {
        Ok(self.public_key_ref(uid)?.to_pem())
    }

    /// Parse PEM text into a verification handle labelled `key_id`.
    ///
    /// Does not touch any store.
    pub fn public_key_from_text(text: &str, key_id: &str) -> Result<PublicKeyHandle, SignatureError> {
        pem::decode_pem(text, key_id)
    }

    /// Verification handle for the public key stored under `uid`.
    pub fn public_key_ref(&self, uid: &str) -> Result<PublicKeyHandle, SignatureError> {
        require_uid(uid)?;
        let stored = self
            .store
            .lookup_public(uid)
            .map_err(|e| e.into_signature_error(uid))?
            .ok_or_else(|| SignatureError::KeyNotFound(uid.to_string()))?;

        stored_handle(&stored).map_err(|e| {
            warn!("Stored public key for {} is unreadable: {}", uid, e);
            SignatureError::Store(format!("corrupt entry for {}: {}", uid, e))
        })
    }

    /// Signing capability for the private key stored under `uid`.
    pub fn private_key_ref(&self, uid: &str) -> Result<PrivateKeyRef, SignatureError> {
        require_uid(uid)?;

        self.with_identity_lock(uid, || {
            let handle = self
                .store
                .lookup_private_ref(uid)
                .map_err(|e| e.into_signature_error(uid))?
                .ok_or_else(|| SignatureError::KeyNotFound(uid.to_string()))?;

            let public = self.public_key_ref(uid)?;
            debug!("Resolved private key reference for {} ({})", uid, public.key_id());

            Ok(PrivateKeyRef {
                uid: uid.to_string(),
                key_id: public.key_id().to_string(),
                handle,
                store: Arc::clone(&self.store),
            })
        })
    }

    /// Delete the key pair for `uid`. Returns whether one existed.
    pub fn delete_key_pair(&self, uid: &str) -> Result<bool, SignatureError> {
        require_uid(uid)?;

        self.with_identity_lock(uid, || {
            let existed = self.store.delete(uid).map_err(|e| e.into_signature_error(uid))?;
            if existed {
                info!("🗑️ Deleted key pair for {}", uid);
            }
            Ok(existed)
        })
    }

    fn generate_locked(&self, uid: &str) -> KeyPairStatus {
        let validity = match Validity::starting_now(self.policy.validity_days) {
            Ok(validity) => validity,
            Err(e) => {
                warn!("Cannot generate key pair for {}: {}", uid, e);
                return KeyPairStatus::Failed(e.to_string());
            }
        };
        match self.store.generate(self.policy.algorithm, uid, validity) {
            Ok(stored) => match stored_handle(&stored) {
                Ok(handle) => {
                    info!("🔑 Generated {} key pair for {} ({})", self.policy.algorithm, uid, handle.key_id());
                    KeyPairStatus::Generated
                }
                Err(e) => {
                    warn!("Store produced an unusable public key for {}: {}", uid, e);
                    KeyPairStatus::Failed(e.to_string())
                }
            },
            Err(e) => {
                warn!("Key generation for {} failed on {} store: {}", uid, self.store.backend(), e);
                KeyPairStatus::Failed(e.to_string())
            }
        }
    }

    fn inspect(&self, stored: &StoredPublicKey) -> ExistingPair {
        if let Err(e) = stored_handle(stored) {
            return ExistingPair::Malformed(e.to_string());
        }
        if stored.algorithm != self.policy.algorithm {
            return ExistingPair::Malformed(format!("stored algorithm {} does not match policy", stored.algorithm));
        }
        if stored.validity.is_current() {
            ExistingPair::Usable
        } else {
            ExistingPair::Expired
        }
    }

    fn with_identity_lock<T>(&self, uid: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.identity_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(uid.to_string()).or_default())
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        // Drop the table entry once nobody else holds or waits on it
        let mut locks = self.identity_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(uid);
        }
        result
    }
}

fn require_uid(uid: &str) -> Result<(), SignatureError> {
    if uid.is_empty() {
        return Err(SignatureError::InvalidArgument("uid must not be empty".to_string()));
    }
    Ok(())
}

fn stored_handle(stored: &StoredPublicKey) -> Result<PublicKeyHandle, SignatureError> {
    let key_id = algorithm::fingerprint(&stored.spki_der);
    pem::handle_from_spki(&key_id, stored.algorithm, stored.spki_der.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::store::MemoryKeyStore;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (Arc<MemoryKeyStore>, KeyManager) {
        let store = Arc::new(MemoryKeyStore::new());
        let manager = KeyManager::new(store.clone());
        (store, manager)
    }

    /// Store wrapper that counts generations and can be told to fail or to
    /// hand back corrupt public keys.
    struct ScriptedStore {
        inner: MemoryKeyStore,
        generations: AtomicUsize,
        fail_generation: bool,
        corrupt_lookups: bool,
    }

    impl ScriptedStore {
        fn new(fail_generation: bool, corrupt_lookups: bool) -> Self {
            Self {
                inner: MemoryKeyStore::new(),
                generations: AtomicUsize::new(0),
                fail_generation,
                corrupt_lookups,
            }
        }
    }

    impl SecureKeyStore for ScriptedStore {
        fn generate(&self, algorithm: KeyAlgorithm, uid: &str, validity: Validity) -> Result<StoredPublicKey, StoreError> {
            self.generations.fetch_add(1, Ordering::SeqCst);
            if self.fail_generation {
                return Err(StoreError::Unavailable("hardware key store locked".to_string()));
            }
            self.inner.generate(algorithm, uid, validity)
        }

        fn lookup_public(&self, uid: &str) -> Result<Option<StoredPublicKey>, StoreError> {
            if self.corrupt_lookups {
                return Ok(Some(StoredPublicKey {
                    algorithm: KeyAlgorithm::EcdsaP256Sha256,
                    spki_der: vec![0x30, 0x00],
                    validity: Validity::starting_now(1).unwrap(),
                    serial: 1,
                }));
            }
            self.inner.lookup_public(uid)
        }

        fn lookup_private_ref(&self, uid: &str) -> Result<Option<StoreKeyHandle>, StoreError> {
            self.inner.lookup_private_ref(uid)
        }

        fn sign_bytes(&self, handle: &StoreKeyHandle, bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
            self.inner.sign_bytes(handle, bytes)
        }

        fn delete(&self, uid: &str) -> Result<bool, StoreError> {
            self.inner.delete(uid)
        }
    }

    #[test]
    fn test_generate_then_valid() {
        let (_store, manager) = manager();

        assert_eq!(manager.generate_key_pair_if_necessary("alice"), KeyPairStatus::Generated);
        let first = manager.public_key("alice").unwrap();

        assert_eq!(manager.generate_key_pair_if_necessary("alice"), KeyPairStatus::Valid);
        let second = manager.public_key("alice").unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_identities_get_distinct_keys() {
        let (store, manager) = manager();
        manager.generate_key_pair_if_necessary("alice");
        manager.generate_key_pair_if_necessary("bob");

        assert_eq!(store.len(), 2);
        assert_ne!(manager.public_key("alice").unwrap(), manager.public_key("bob").unwrap());
    }

    #[test]
    fn test_empty_uid_fails() {
        let (store, manager) = manager();
        assert!(matches!(manager.generate_key_pair_if_necessary(""), KeyPairStatus::Failed(_)));
        assert!(store.is_empty());
        assert!(matches!(manager.public_key(""), Err(SignatureError::InvalidArgument(_))));
    }

    #[test]
    fn test_unknown_identity() {
        let (_store, manager) = manager();
        assert_eq!(manager.public_key("ghost"), Err(SignatureError::KeyNotFound("ghost".into())));
        assert!(matches!(manager.public_key_ref("ghost"), Err(SignatureError::KeyNotFound(_))));
        assert!(matches!(manager.private_key_ref("ghost"), Err(SignatureError::KeyNotFound(_))));
    }

    #[test]
    fn test_public_key_round_trips_through_text() {
        let (_store, manager) = manager();
        manager.generate_key_pair_if_necessary("alice");

        let pem = manager.public_key("alice").unwrap();
        let parsed = KeyManager::public_key_from_text(&pem, "alice-key").unwrap();
        let stored = manager.public_key_ref("alice").unwrap();

        assert_eq!(parsed.spki_der(), stored.spki_der());
        assert_eq!(parsed.key_id(), "alice-key");
        assert_eq!(parsed.fingerprint(), stored.key_id());
    }

    #[test]
    fn test_corrupted_public_key_text_is_rejected() {
        let (_store, manager) = manager();
        manager.generate_key_pair_if_necessary("alice");
        let pem = manager.public_key("alice").unwrap();

        // Flip one body character to a different base64 character
        let body_start = pem.find('\n').unwrap() + 1;
        let mut chars: Vec<char> = pem.chars().collect();
        let index = body_start + 40;
        chars[index] = if chars[index] == 'A' { 'B' } else { 'A' };
        let corrupted: String = chars.into_iter().collect();

        assert!(matches!(
            KeyManager::public_key_from_text(&corrupted, "alice"),
            Err(SignatureError::InvalidPublicKeyFormat(_))
        ));
    }

    #[test]
    fn test_expired_pair_is_replaced() {
        let store = Arc::new(MemoryKeyStore::new());
        let expiring = KeyManager::with_policy(
            store.clone(),
            KeyPolicy { algorithm: KeyAlgorithm::EcdsaP256Sha256, validity_days: -1 },
        );

        assert_eq!(expiring.generate_key_pair_if_necessary("alice"), KeyPairStatus::Generated);
        let old = expiring.public_key("alice").unwrap();

        let manager = KeyManager::new(store.clone());
        assert_eq!(manager.generate_key_pair_if_necessary("alice"), KeyPairStatus::Generated);
        assert_eq!(manager.generate_key_pair_if_necessary("alice"), KeyPairStatus::Valid);

        assert_ne!(manager.public_key("alice").unwrap(), old);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_generation_failure_leaves_store_empty() {
        let store = Arc::new(ScriptedStore::new(true, false));
        let manager = KeyManager::new(store.clone());

        assert!(matches!(manager.generate_key_pair_if_necessary("alice"), KeyPairStatus::Failed(_)));
        assert!(store.inner.is_empty());
        assert!(matches!(
            manager.ensure_key_pair("alice"),
            Err(SignatureError::KeyGenerationFailed { .. })
        ));
    }

    #[test]
    fn test_unrepresentable_validity_fails_without_generating() {
        let store = Arc::new(ScriptedStore::new(false, false));
        let manager = KeyManager::with_policy(
            store.clone(),
            KeyPolicy { algorithm: KeyAlgorithm::EcdsaP256Sha256, validity_days: 100_000_000 },
        );

        assert!(matches!(manager.generate_key_pair_if_necessary("alice"), KeyPairStatus::Failed(_)));
        assert_eq!(store.generations.load(Ordering::SeqCst), 0);
        assert!(store.inner.is_empty());
    }

    #[test]
    fn test_corrupt_entry_fails_without_regenerating() {
        let store = Arc::new(ScriptedStore::new(false, true));
        let manager = KeyManager::new(store.clone());

        assert!(matches!(manager.generate_key_pair_if_necessary("alice"), KeyPairStatus::Failed(_)));
        assert_eq!(store.generations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_generation_converges() {
        let store = Arc::new(ScriptedStore::new(false, false));
        let manager = Arc::new(KeyManager::new(store.clone()));

        let outcomes: Vec<KeyPairStatus> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    scope.spawn(move || manager.generate_key_pair_if_necessary("alice"))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let generated = outcomes.iter().filter(|s| **s == KeyPairStatus::Generated).count();
        let valid = outcomes.iter().filter(|s| **s == KeyPairStatus::Valid).count();

        assert_eq!(generated, 1);
        assert_eq!(valid, 15);
        assert_eq!(store.generations.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.len(), 1);
    }

    #[test]
    fn test_other_identities_do_not_wait() {
        let (_store, manager) = manager();

        // Holding alice's lock must not block work on bob
        let status = manager.with_identity_lock("alice", || manager.generate_key_pair_if_necessary("bob"));
        assert_eq!(status, KeyPairStatus::Generated);
    }

    #[test]
    fn test_lock_table_is_pruned() {
        let (_store, manager) = manager();
        manager.generate_key_pair_if_necessary("alice");
        manager.generate_key_pair_if_necessary("bob");

        assert!(manager.identity_locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_private_key_ref_debug_hides_store() {
        let (_store, manager) = manager();
        manager.generate_key_pair_if_necessary("alice");
        let key = manager.private_key_ref("alice").unwrap();

        let debug = format!("{:?}", key);
        assert!(debug.contains("alice"));
        assert!(debug.contains("memory"));
        assert_eq!(key.key_id(), manager.public_key_ref("alice").unwrap().key_id());
    }

    #[test]
    fn test_delete_key_pair() {
        let (_store, manager) = manager();
        manager.generate_key_pair_if_necessary("alice");
        let stale = manager.private_key_ref("alice").unwrap();

        assert!(manager.delete_key_pair("alice").unwrap());
        assert!(!manager.delete_key_pair("alice").unwrap());
        assert!(matches!(manager.public_key("alice"), Err(SignatureError::KeyNotFound(_))));
        assert!(matches!(stale.sign(b"data"), Err(SignatureError::KeyNotFound(_))));
    }
}
