use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::keys::{DEFAULT_VALIDITY_DAYS, MAX_VALIDITY_DAYS};

/// Where key pairs are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStoreBackend {
    /// One JSON file per identity under `data_dir/keys`
    File,
    /// Process memory only
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub key_store: KeyStoreBackend,
    pub key_validity_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("keysign"),
            key_store: KeyStoreBackend::File,
            key_validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &PathBuf) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_VALIDITY_DAYS).contains(&self.key_validity_days) {
            anyhow::bail!(
                "key_validity_days must be between 1 and {}, got {}",
                MAX_VALIDITY_DAYS,
                self.key_validity_days
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = Config {
            data_dir: dir.path().to_path_buf(),
            key_store: KeyStoreBackend::Memory,
            key_validity_days: 30,
        };
        config.save_to_file(&path).unwrap();

        assert_eq!(Config::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "key_store": "memory" }"#).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.key_store, KeyStoreBackend::Memory);
        assert_eq!(config.key_validity_days, DEFAULT_VALIDITY_DAYS);
        assert!(config.data_dir.ends_with("keysign"));
    }

    #[test]
    fn test_rejects_out_of_range_validity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        for days in [0, -5, MAX_VALIDITY_DAYS + 1, 100_000_000] {
            std::fs::write(&path, format!(r#"{{ "key_validity_days": {} }}"#, days)).unwrap();
            assert!(Config::load_from_file(&path).is_err(), "accepted {} days", days);
        }

        let longest = Config {
            key_validity_days: MAX_VALIDITY_DAYS,
            ..Config::default()
        };
        assert!(longest.validate().is_ok());
    }
}
