//! Error types for the crypto crate.

use thiserror::Error;

/// Errors that can occur while handling keys or column values.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material has the wrong length or encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// No master key was configured.
    #[error("master key not found: {0}")]
    MissingKey(String),

    /// Encrypting a value failed.
    #[error("encryption failed for {column}")]
    EncryptionFailed { column: String },

    /// Ciphertext could not be authenticated or is truncated.
    #[error("decryption failed for {column}: {reason}")]
    DecryptionFailed { column: String, reason: String },

    /// A bytea value was not in `\x<hex>` form.
    #[error("malformed bytea value: {0}")]
    MalformedBytea(String),

    /// IO error (reading/writing keys).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
