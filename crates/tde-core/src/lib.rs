//! # tde-core
//!
//! Shared types for the Postgres TDE proxy.
//!
//! - [`config`]: YAML configuration (`tde.yaml`, catalog files)
//! - [`catalog`]: the column policy catalog consulted on every statement
//!
//! ## Column Modes
//!
//! | Mode | Stored as | Searchable |
//! |------|-----------|------------|
//! | `plain` | plaintext | anything |
//! | `encrypted` | randomized ciphertext | no |
//! | `blind_indexed` | ciphertext + `<col>_bi` | `=` against literals |
//! | `joinable` | ciphertext + `<col>_bi` + `<col>_join_key` | `=` against literals, equi-joins |

pub mod catalog;
pub mod config;

pub use catalog::{ColumnCatalog, ColumnDescriptor, ColumnMode, TableSchema};
pub use config::{
    CatalogConfig, ColumnConfig, ConfigError, EncryptionConfig, ProxyConfig, SqlConfig,
    TableConfig, TdeConfig, UpstreamConfig,
};
