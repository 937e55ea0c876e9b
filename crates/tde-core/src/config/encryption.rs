//! Encryption key and join bucket configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::ConfigError;

/// Largest join bucket width, the length of an HMAC-SHA256 digest.
pub const MAX_JOIN_KEY_SIZE: usize = 32;

/// Where the master key comes from and how wide join buckets are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Bytes of the join digest kept as the bucket value.
    ///
    /// Narrow buckets collide more often; the extra candidate rows are
    /// removed after decryption.
    #[serde(default = "default_join_key_size")]
    pub join_key_size: usize,

    /// Environment variable holding the hex-encoded master key.
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,

    /// File holding the hex-encoded master key. Takes precedence over the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key_file: Option<PathBuf>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            join_key_size: default_join_key_size(),
            master_key_env: default_master_key_env(),
            master_key_file: None,
        }
    }
}

impl EncryptionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.join_key_size == 0 || self.join_key_size > MAX_JOIN_KEY_SIZE {
            return Err(ConfigError::Config(format!(
                "encryption.join_key_size must be between 1 and {}, got {}",
                MAX_JOIN_KEY_SIZE, self.join_key_size
            )));
        }
        Ok(())
    }
}

fn default_join_key_size() -> usize {
    2
}

fn default_master_key_env() -> String {
    "TDE_MASTER_KEY".to_string()
}
