//! # tde-crypto
//!
//! Column encryption for the Postgres TDE proxy.
//!
//! This crate provides:
//! - The [`EncryptionCodec`] capability used by the query rewriter and result decoder
//! - [`KeyedCodec`], the default codec built on a single master key
//! - Master key generation, parsing and file handling
//!
//! ## Transforms
//!
//! | Transform | Deterministic | Output |
//! |-----------|---------------|--------|
//! | blind index | yes, per column | 32 bytes |
//! | join bucket | yes, database wide | `join_key_size` bytes |
//! | encryption | no | nonce + ciphertext + tag |

pub mod codec;
pub mod error;
pub mod keys;

pub use codec::{EncryptionCodec, KeyedCodec, decode_bytea, encode_bytea};
pub use error::CryptoError;
pub use keys::MasterKey;
