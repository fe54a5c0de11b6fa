//! Key material for keysign
//!
//! Algorithm primitives, PEM handling, the secure key store seam and the
//! per-identity key manager built on top of it.

pub mod algorithm;
pub mod keys;
pub mod pem;
pub mod store;

pub use algorithm::KeyAlgorithm;
pub use keys::{KeyManager, KeyPairStatus, KeyPolicy, PrivateKeyRef};
pub use pem::PublicKeyHandle;
pub use store::{MemoryKeyStore, SecureKeyStore, StoreKeyHandle, StoredPublicKey, Validity};
