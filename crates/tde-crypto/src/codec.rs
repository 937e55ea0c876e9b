//! The encryption codec capability and its default implementation.

use aes_gcm::Aes256Gcm;
use aes_gcm::Nonce;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tde_core::catalog::ColumnDescriptor;
use tde_core::config::EncryptionConfig;
use tde_core::config::encryption::MAX_JOIN_KEY_SIZE;

use crate::error::CryptoError;
use crate::keys::MasterKey;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Transforms applied to protected column values.
///
/// Implementations must be deterministic for [`blind_index`](Self::blind_index)
/// and [`join_bucket`](Self::join_bucket), and must produce the same bucket for
/// equal plaintexts in *different* columns so that equi-joins line up.
pub trait EncryptionCodec: Send + Sync {
    /// Deterministic equality token for a searchable column.
    fn blind_index(&self, column: &ColumnDescriptor, plaintext: &[u8])
    -> Result<Vec<u8>, CryptoError>;

    /// Short deterministic digest shared by all joinable columns.
    fn join_bucket(&self, column: &ColumnDescriptor, plaintext: &[u8])
    -> Result<Vec<u8>, CryptoError>;

    /// Randomized encryption of a column value.
    fn encrypt(&self, column: &ColumnDescriptor, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Inverse of [`encrypt`](Self::encrypt).
    fn decrypt(&self, column: &ColumnDescriptor, ciphertext: &[u8])
    -> Result<Vec<u8>, CryptoError>;
}

/// Codec deriving all keys from one [`MasterKey`].
///
/// - blind index: HMAC-SHA256 under a per-column derived key
/// - join bucket: truncated HMAC-SHA256 under a database-wide join key
/// - encryption: AES-256-GCM under a per-column derived key, the column name
///   bound as associated data and a random nonce prepended
#[derive(Debug, Clone)]
pub struct KeyedCodec {
    master: MasterKey,
    join_key: [u8; 32],
    join_key_size: usize,
}

impl KeyedCodec {
    pub fn new(master: MasterKey, join_key_size: usize) -> Result<Self, CryptoError> {
        if join_key_size == 0 || join_key_size > MAX_JOIN_KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "join key size must be between 1 and {MAX_JOIN_KEY_SIZE}, got {join_key_size}"
            )));
        }
        let join_key = hmac_sha256(master.as_bytes(), b"tde:join-key")?;
        Ok(Self {
            master,
            join_key,
            join_key_size,
        })
    }

    /// Load the master key and bucket width from configuration.
    pub fn from_config(config: &EncryptionConfig) -> Result<Self, CryptoError> {
        Self::new(MasterKey::from_config(config)?, config.join_key_size)
    }

    pub fn join_key_size(&self) -> usize {
        self.join_key_size
    }

    fn column_key(
        &self,
        purpose: &str,
        column: &ColumnDescriptor,
    ) -> Result<[u8; 32], CryptoError> {
        let label = format!("tde:{}:{}", purpose, column.qualified_name());
        hmac_sha256(self.master.as_bytes(), label.as_bytes())
    }
}

impl EncryptionCodec for KeyedCodec {
    fn blind_index(
        &self,
        column: &ColumnDescriptor,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.column_key("blind-index", column)?;
        Ok(hmac_sha256(&key, plaintext)?.to_vec())
    }

    fn join_bucket(
        &self,
        _column: &ColumnDescriptor,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let digest = hmac_sha256(&self.join_key, plaintext)?;
        Ok(digest[..self.join_key_size].to_vec())
    }

    fn encrypt(&self, column: &ColumnDescriptor, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.column_key("encryption", column)?;
        let cipher = <Aes256Gcm as KeyInit>::new_from_slice(&key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let aad = column.qualified_name();
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed { column: aad.clone() })?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(
        &self,
        column: &ColumnDescriptor,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let aad = column.qualified_name();
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::DecryptionFailed {
                column: aad,
                reason: format!("ciphertext too short ({} bytes)", ciphertext.len()),
            });
        }

        let key = self.column_key("encryption", column)?;
        let cipher = <Aes256Gcm as KeyInit>::new_from_slice(&key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed {
                column: aad.clone(),
                reason: "authentication failed".to_string(),
            })
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(data);
    let digest = mac.finalize().into_bytes();

    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Render bytes as a Postgres hex-format bytea value (`\x0a1b...`).
pub fn encode_bytea(bytes: &[u8]) -> String {
    format!("\\x{}", hex::encode(bytes))
}

/// Parse a Postgres hex-format bytea value.
pub fn decode_bytea(text: &str) -> Result<Vec<u8>, CryptoError> {
    let digits = text
        .strip_prefix("\\x")
        .ok_or_else(|| CryptoError::MalformedBytea("missing \\x prefix".to_string()))?;
    hex::decode(digits).map_err(|e| CryptoError::MalformedBytea(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tde_core::catalog::ColumnMode;

    fn codec() -> KeyedCodec {
        KeyedCodec::new(MasterKey::from_bytes(&[7u8; 32]).unwrap(), 2).unwrap()
    }

    fn column(table: &str, name: &str, mode: ColumnMode) -> ColumnDescriptor {
        ColumnDescriptor::new(table, name, mode)
    }

    #[test]
    fn test_blind_index_is_deterministic_per_column() {
        let codec = codec();
        let name = column("cities", "name", ColumnMode::BlindIndexed);
        let other = column("cities", "title", ColumnMode::BlindIndexed);

        let a = codec.blind_index(&name, b"City 1").unwrap();
        let b = codec.blind_index(&name, b"City 1").unwrap();
        let c = codec.blind_index(&name, b"City 2").unwrap();
        let d = codec.blind_index(&other, b"City 1").unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_join_bucket_shared_across_columns() {
        let codec = codec();
        let left = column("cities", "id", ColumnMode::Joinable);
        let right = column("city2region", "id", ColumnMode::Joinable);

        let a = codec.join_bucket(&left, b"42").unwrap();
        let b = codec.join_bucket(&right, b"42").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_encryption_is_randomized_and_reversible() {
        let codec = codec();
        let col = column("cities", "kladr_id", ColumnMode::Encrypted);

        let a = codec.encrypt(&col, b"7700000000000").unwrap();
        let b = codec.encrypt(&col, b"7700000000000").unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.decrypt(&col, &a).unwrap(), b"7700000000000");
        assert_eq!(codec.decrypt(&col, &b).unwrap(), b"7700000000000");
    }

    #[test]
    fn test_ciphertext_bound_to_column() {
        let codec = codec();
        let a = column("cities", "kladr_id", ColumnMode::Encrypted);
        let b = column("cities", "timezone", ColumnMode::Encrypted);

        let sealed = codec.encrypt(&a, b"UTC+3").unwrap();
        let err = codec.decrypt(&b, &sealed).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed { .. }));
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let codec = codec();
        let col = column("cities", "kladr_id", ColumnMode::Encrypted);
        assert!(codec.decrypt(&col, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_join_key_size_bounds() {
        let key = MasterKey::generate();
        assert!(KeyedCodec::new(key.clone(), 0).is_err());
        assert!(KeyedCodec::new(key.clone(), 33).is_err());
        assert_eq!(KeyedCodec::new(key, 32).unwrap().join_key_size(), 32);
    }

    #[test]
    fn test_bytea_text_form() {
        assert_eq!(encode_bytea(&[0x0a, 0xff]), "\\x0aff");
        assert_eq!(decode_bytea("\\x0aff").unwrap(), vec![0x0a, 0xff]);
        assert!(decode_bytea("0aff").is_err());
        assert!(decode_bytea("\\xzz").is_err());
    }
}
