//! File-backed key store
//!
//! One JSON document per identity under `<data_dir>/keys/`, named after the
//! SHA-256 of the uid so identifiers of any length or content map to short,
//! safe file names. The uid inside the document is checked on every read.
//! Writes go to a temporary file first and are renamed into place, so a
//! failed generation never leaves a half-written entry behind.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::rand::{self, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::algorithm::{self, KeyAlgorithm};
use crate::crypto::store::{SecureKeyStore, StoreKeyHandle, StoredPublicKey, Validity};
use crate::error::StoreError;

const KEY_FILE_VERSION: u32 = 1;

/// On-disk form of one identity's key pair.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyFile {
    version: u32,
    uid: String,
    #[zeroize(skip)]
    algorithm: KeyAlgorithm,
    serial: u64,
    not_before: i64,
    not_after: i64,
    /// base64 DER SubjectPublicKeyInfo
    public_key: String,
    /// base64 PKCS#8
    private_key: String,
}

/// Key store persisting key pairs as files.
pub struct FileKeyStore {
    keys_dir: PathBuf,
    rng: SystemRandom,
}

impl FileKeyStore {
    /// Open (and create if needed) the store under `data_dir/keys`.
    pub fn new(data_dir: &Path) -> Result<Self, StoreError> {
        let keys_dir = data_dir.join("keys");
        if !keys_dir.exists() {
            fs::create_dir_all(&keys_dir)?;
            info!("📁 Created key directory {}", keys_dir.display());
        }

        Ok(Self {
            keys_dir,
            rng: SystemRandom::new(),
        })
    }

    pub fn keys_dir(&self) -> &Path {
        &self.keys_dir
    }

    fn path_for(&self, uid: &str) -> PathBuf {
        self.keys_dir.join(format!("{}.json", file_stem(uid)))
    }

    fn next_serial(&self) -> Result<u64, StoreError> {
        let bytes: [u8; 8] = rand::generate(&self.rng)
            .map_err(|_| StoreError::Crypto("random serial generation failed".to_string()))?
            .expose();
        Ok(u64::from_be_bytes(bytes))
    }

    fn read_entry(&self, uid: &str) -> Result<Option<KeyFile>, StoreError> {
        let path = self.path_for(uid);
        let bytes = match fs::read(&path) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let entry: KeyFile = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            uid: uid.to_string(),
            reason: format!("unreadable key file: {}", e),
        })?;

        if entry.version != KEY_FILE_VERSION {
            return Err(StoreError::Corrupt {
                uid: uid.to_string(),
                reason: format!("unsupported key file version {}", entry.version),
            });
        }
        if entry.uid != uid {
            return Err(StoreError::Corrupt {
                uid: uid.to_string(),
                reason: "key file belongs to another identity".to_string(),
            });
        }
        Ok(Some(entry))
    }

    fn write_entry(&self, uid: &str, entry: &KeyFile) -> Result<(), StoreError> {
        let json = Zeroizing::new(
            serde_json::to_vec_pretty(entry).map_err(|e| StoreError::Unavailable(e.to_string()))?,
        );

        let path = self.path_for(uid);
        let tmp_path = self.keys_dir.join(format!("{}.json.{:016x}.tmp", file_stem(uid), entry.serial));

        let written = (|| -> io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            restrict_permissions(&file)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::Io(e));
        }
        Ok(())
    }
}

/// 64 hex characters, whatever the uid
fn file_stem(uid: &str) -> String {
    hex::encode(Sha256::digest(uid.as_bytes()))
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

fn stored_public(uid: &str, entry: &KeyFile) -> Result<StoredPublicKey, StoreError> {
    let spki_der = STANDARD.decode(entry.public_key.as_bytes()).map_err(|e| StoreError::Corrupt {
        uid: uid.to_string(),
        reason: format!("public key is not base64: {}", e),
    })?;

    Ok(StoredPublicKey {
        algorithm: entry.algorithm,
        spki_der,
        validity: Validity {
            not_before: entry.not_before,
            not_after: entry.not_after,
        },
        serial: entry.serial,
    })
}

impl SecureKeyStore for FileKeyStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    fn generate(&self, algorithm: KeyAlgorithm, uid: &str, validity: Validity) -> Result<StoredPublicKey, StoreError> {
        let generated = algorithm::generate(algorithm)?;
        let entry = KeyFile {
            version: KEY_FILE_VERSION,
            uid: uid.to_string(),
            algorithm,
            serial: self.next_serial()?,
            not_before: validity.not_before,
            not_after: validity.not_after,
            public_key: STANDARD.encode(&generated.spki_der),
            private_key: STANDARD.encode(generated.pkcs8.as_slice()),
        };

        self.write_entry(uid, &entry)?;
        debug!("Stored {} key pair for {} in {}", algorithm, uid, self.keys_dir.display());

        Ok(StoredPublicKey {
            algorithm,
            spki_der: generated.spki_der,
            validity,
            serial: entry.serial,
        })
    }

    fn lookup_public(&self, uid: &str) -> Result<Option<StoredPublicKey>, StoreError> {
        match self.read_entry(uid)? {
            Some(entry) => stored_public(uid, &entry).map(Some),
            None => Ok(None),
        }
    }

    fn lookup_private_ref(&self, uid: &str) -> Result<Option<StoreKeyHandle>, StoreError> {
        Ok(self
            .read_entry(uid)?
            .map(|entry| StoreKeyHandle::new(uid, entry.serial, entry.algorithm)))
    }

    fn sign_bytes(&self, handle: &StoreKeyHandle, bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
        let entry = match self.read_entry(handle.alias())? {
            Some(entry) if entry.serial == handle.serial() => entry,
            _ => return Err(StoreError::NotFound(handle.alias().to_string())),
        };

        let pkcs8 = Zeroizing::new(STANDARD.decode(entry.private_key.as_bytes()).map_err(|e| {
            StoreError::Corrupt {
                uid: handle.alias().to_string(),
                reason: format!("private key is not base64: {}", e),
            }
        })?);
        algorithm::sign_with_pkcs8(handle.algorithm(), &pkcs8, bytes)
    }

    fn delete(&self, uid: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(uid)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!("Could not delete key file for {}: {}", uid, e);
                Err(StoreError::Io(e))
            }
        }
    }
}
