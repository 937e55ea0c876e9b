//! # tde-proxy
//!
//! Postgres wire protocol proxy applying transparent column encryption.
//!
//! ## Architecture
//!
//! ```text
//! Application
//!       │
//!       │ Postgres wire protocol (simple query)
//!       ▼
//! ┌──────────────────────┐
//! │  TDE Proxy           │
//! │  1. Validate SQL     │  ← tde-sql
//! │  2. Rewrite SQL      │  ← tde-sql + tde-crypto
//! │  3. Forward          │
//! │  4. Filter buckets   │  ← tde-sql
//! │  5. Decrypt results  │  ← tde-crypto
//! └──────────┬───────────┘
//!            │
//!            ▼
//!    Upstream Postgres
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use tde_core::TdeConfig;
//! use tde_proxy::TdeProxy;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TdeConfig::load_with_context("tde.yaml")?;
//!     let proxy = TdeProxy::from_config(&config)?;
//!     proxy.run().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod handler;
pub mod proxy;

pub use error::ProxyError;
pub use handler::{
    PasswordStartupHandler, QueryResult, SessionContext, TdeQueryHandler, TdeServerHandlers,
};
pub use proxy::TdeProxy;
