use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};

/// On-disk form: the 32-byte seed, plus the public key for quick inspection
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKey {
    public_key: String,
    seed: String,
}

/// Node identity key. Only the public half leaves the machine, inside `register`.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Read the key at `path`, creating one on first use
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let keypair = Self::generate();
        keypair.save(path)?;
        Ok(keypair)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let stored: StoredKey = serde_json::from_str(&std::fs::read_to_string(path)?)?;

        let seed: [u8; 32] = BASE64
            .decode(&stored.seed)
            .map_err(|e| RelayError::Crypto(format!("seed is not base64: {}", e)))?
            .try_into()
            .map_err(|_| RelayError::Crypto("seed must be 32 bytes".to_string()))?;

        let keypair = Self {
            signing_key: SigningKey::from_bytes(&seed),
        };
        if keypair.public_key_base64() != stored.public_key {
            return Err(RelayError::Crypto(format!(
                "public key in {} does not match its seed",
                path.display()
            )));
        }
        Ok(keypair)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredKey {
            public_key: self.public_key_base64(),
            seed: BASE64.encode(self.signing_key.as_bytes()),
        };
        std::fs::write(path, serde_json::to_string_pretty(&stored)?)?;
        Ok(())
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }
}

/// `<data dir>/nodelink/keypair.json`, or `.nodelink/keypair.json` without one
pub fn default_keypair_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "nodelink")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".nodelink"))
        .join("keypair.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_saved_key_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keypair.json");

        let key = Keypair::generate();
        key.save(&path).unwrap();

        let loaded = Keypair::load(&path).unwrap();
        assert_eq!(key.public_key_base64(), loaded.public_key_base64());
        assert_eq!(BASE64.decode(loaded.public_key_base64()).unwrap().len(), 32);
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("keypair.json");

        let first = Keypair::load_or_generate(&path).unwrap();
        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key_base64(), second.public_key_base64());
    }

    #[test]
    fn test_load_rejects_mismatched_public_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keypair.json");
        Keypair::generate().save(&path).unwrap();

        let mut stored: StoredKey =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        stored.public_key = Keypair::generate().public_key_base64();
        std::fs::write(&path, serde_json::to_string(&stored).unwrap()).unwrap();

        assert!(matches!(Keypair::load(&path), Err(RelayError::Crypto(_))));
    }

    #[test]
    fn test_load_rejects_short_seed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keypair.json");
        let stored = StoredKey {
            public_key: String::new(),
            seed: BASE64.encode([7u8; 16]),
        };
        std::fs::write(&path, serde_json::to_string(&stored).unwrap()).unwrap();

        assert!(matches!(Keypair::load(&path), Err(RelayError::Crypto(_))));
    }
}
