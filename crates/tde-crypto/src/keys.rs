//! Master key management.
//!
//! Every column key is derived from one 32-byte master key, stored hex-encoded
//! in a file or an environment variable.

use crate::error::CryptoError;
use rand::RngCore;
use std::fmt;
use std::path::Path;
use tde_core::config::EncryptionConfig;

/// Length of the master key in bytes.
pub const MASTER_KEY_LEN: usize = 32;

/// The root secret all column keys are derived from.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LEN],
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    /// Generate a new random master key.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; MASTER_KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; MASTER_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                MASTER_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded key.
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Get the key as hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Save the key to a file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), CryptoError> {
        std::fs::write(path, self.to_hex())?;
        Ok(())
    }

    /// Load a key from a file.
    pub fn load_from_file(path: &Path) -> Result<Self, CryptoError> {
        let hex = std::fs::read_to_string(path)?;
        Self::from_hex(&hex)
    }

    /// Load a key from an environment variable.
    pub fn from_env(var: &str) -> Result<Self, CryptoError> {
        let hex = std::env::var(var).map_err(|_| {
            CryptoError::MissingKey(format!("environment variable {var} is not set"))
        })?;
        Self::from_hex(&hex)
    }

    /// Load the key the configuration points at: the key file if set,
    /// otherwise the environment variable.
    pub fn from_config(config: &EncryptionConfig) -> Result<Self, CryptoError> {
        match &config.master_key_file {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading master key from file");
                Self::load_from_file(path)
            }
            None => {
                tracing::debug!(
                    env = %config.master_key_env,
                    "Loading master key from environment"
                );
                Self::from_env(&config.master_key_env)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_key_generation() {
        let a = MasterKey::generate();
        let b = MasterKey::generate();
        assert_eq!(a.to_hex().len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_hex_roundtrip() {
        let key = MasterKey::generate();
        let parsed = MasterKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn test_short_key_rejected() {
        let err = MasterKey::from_hex("abcd").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKey(_)));
        assert!(MasterKey::from_hex("not hex at all").is_err());
    }

    #[test]
    fn test_key_file_load() {
        let key = MasterKey::generate();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", key.to_hex()).unwrap();

        let loaded = MasterKey::load_from_file(file.path()).unwrap();
        assert_eq!(key, loaded);
    }

    #[test]
    fn test_from_config_prefers_file() {
        let key = MasterKey::generate();
        let file = NamedTempFile::new().unwrap();
        key.save_to_file(file.path()).unwrap();

        let config = EncryptionConfig {
            master_key_env: "TDE_TEST_UNSET_MASTER_KEY".to_string(),
            master_key_file: Some(file.path().to_path_buf()),
            ..EncryptionConfig::default()
        };
        assert_eq!(MasterKey::from_config(&config).unwrap(), key);
    }

    #[test]
    fn test_missing_env_key() {
        let config = EncryptionConfig {
            master_key_env: "TDE_TEST_UNSET_MASTER_KEY".to_string(),
            ..EncryptionConfig::default()
        };
        let err = MasterKey::from_config(&config).unwrap_err();
        assert!(matches!(err, CryptoError::MissingKey(_)));
    }

    #[test]
    fn test_debug_redacts() {
        assert_eq!(format!("{:?}", MasterKey::generate()), "MasterKey(..)");
    }
}
