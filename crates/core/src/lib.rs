//! Keysign Core Library
//!
//! Per-identity signing keys and a signing protocol that binds every payload
//! to its signer and modification time.

pub mod commands;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod signature;
pub mod storage;

// Re-export important types for easier access
pub use commands::{CommandDispatcher, CommandResult, KeysignCommand};
pub use config::{Config, KeyStoreBackend};
pub use crypto::{KeyAlgorithm, KeyManager, KeyPairStatus, KeyPolicy, MemoryKeyStore, PrivateKeyRef, PublicKeyHandle, SecureKeyStore};
pub use error::{SignatureError, StoreError};
pub use signature::{Payload, PayloadValue, SignatureEngine, SignaturePacket};
pub use storage::FileKeyStore;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Build the key store, key manager and dispatcher described by `config`.
pub fn init(config: &Config) -> Result<CommandDispatcher> {
    config.validate()?;

    let store: Arc<dyn SecureKeyStore> = match config.key_store {
        KeyStoreBackend::File => Arc::new(FileKeyStore::new(&config.data_dir)?),
        KeyStoreBackend::Memory => Arc::new(MemoryKeyStore::new()),
    };

    let policy = KeyPolicy {
        validity_days: config.key_validity_days,
        ..KeyPolicy::default()
    };

    info!(
        "🔐 Keysign initialized ({} store, {} keys valid {} days)",
        store.backend(),
        policy.algorithm,
        policy.validity_days
    );

    let key_manager = Arc::new(KeyManager::with_policy(store, policy));
    Ok(CommandDispatcher::new(key_manager, SignatureEngine::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_init_file_store() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            key_store: KeyStoreBackend::File,
            key_validity_days: 10,
        };

        let dispatcher = init(&config).unwrap();
        assert_eq!(dispatcher.key_manager().store().backend(), "file");
        assert_eq!(dispatcher.key_manager().policy().validity_days, 10);

        let result = dispatcher.execute("genKeyPairIfNecessary", &[json!("alice")]);
        assert_eq!(result, CommandResult::Success(json!("generated")));
        assert!(dir.path().join("keys").is_dir());

        // A second process over the same directory sees the same pair
        let again = init(&config).unwrap();
        assert_eq!(
            again.execute("genKeyPairIfNecessary", &[json!("alice")]),
            CommandResult::Success(json!("valid"))
        );
    }

    #[test]
    fn test_init_rejects_bad_config() {
        for days in [-1, 100_000_000] {
            let config = Config {
                key_store: KeyStoreBackend::Memory,
                key_validity_days: days,
                ..Config::default()
            };
            assert!(init(&config).is_err(), "accepted {} days", days);
        }
    }
}
