//! Error types for the proxy crate.

use tde_core::ConfigError;
use tde_crypto::CryptoError;
use tde_sql::QueryError;
use thiserror::Error;

/// Errors that can occur in the Postgres proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind to the listen address.
    #[error("failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    /// Client presented the wrong password.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Failed to connect to upstream Postgres.
    #[error("failed to connect to upstream: {0}")]
    UpstreamConnectionFailed(String),

    /// Upstream Postgres rejected the rewritten statement.
    #[error("upstream query failed: {0}")]
    UpstreamQueryFailed(String),

    /// A result cell could not be read as text.
    #[error("failed to read upstream column {column}: {reason}")]
    UnreadableValue { column: String, reason: String },

    /// Statement rejected by the rewriting pipeline. Rendered verbatim.
    #[error(transparent)]
    Rejected(#[from] QueryError),

    /// Key material could not be loaded.
    #[error("failed to initialize encryption: {0}")]
    Crypto(#[from] CryptoError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
