//! Configuration types for the Postgres TDE proxy.
//!
//! Configuration is loaded from YAML files and combined into a single
//! [`TdeConfig`] structure.
//!
//! # Configuration Files
//!
//! - **tde.yaml**: upstream database, proxy listener, encryption keys and SQL handling
//! - **catalog.yaml**: per-table column modes (inline under `catalog:` or via `catalog_file`)

pub mod catalog;
pub mod encryption;
pub mod proxy;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use catalog::{CatalogConfig, ColumnConfig, TableConfig};
pub use encryption::EncryptionConfig;
pub use proxy::{ProxyConfig, UpstreamConfig};

/// Complete proxy configuration loaded from files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TdeConfig {
    /// Upstream Postgres connection.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Proxy settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Key material and join bucket settings.
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Column policy catalog (inline or from file).
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Path to catalog file (alternative to inline).
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,

    /// Statement handling options.
    #[serde(default)]
    pub sql: SqlConfig,
}

/// Statement handling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConfig {
    /// Require a table/alias qualifier on every column reference in statements
    /// touching TDE-enabled tables, even when only one relation is in scope.
    #[serde(default)]
    pub strict_qualification: bool,

    /// Forward `SET`, `SHOW`, `BEGIN`, `COMMIT` and `ROLLBACK` unchanged.
    #[serde(default = "default_true")]
    pub passthrough_utility_statements: bool,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            strict_qualification: false,
            passthrough_utility_statements: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TdeConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Load configuration and resolve all external references.
    ///
    /// Relative `catalog_file` and `encryption.master_key_file` paths are
    /// resolved against the directory containing `path`.
    pub fn load_with_context(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::from_file(path)?;

        let base_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        if let Some(catalog_file) = &config.catalog_file {
            let catalog_path = resolve(&base_dir, catalog_file);
            if !catalog_path.exists() {
                return Err(ConfigError::Config(format!(
                    "catalog file {} does not exist",
                    catalog_path.display()
                )));
            }
            tracing::debug!(path = %catalog_path.display(), "Loading catalog file");
            config.catalog = CatalogConfig::from_file(&catalog_path)?;
            config.catalog_file = Some(catalog_path);
        }

        if let Some(key_file) = &config.encryption.master_key_file {
            config.encryption.master_key_file = Some(resolve(&base_dir, key_file));
        }

        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.encryption.validate()?;
        self.catalog.validate()
    }
}

fn resolve(base_dir: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        base_dir.join(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnMode;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_parse_minimal_config() {
        let config = TdeConfig::from_yaml("upstream:\n  database: cities\n").unwrap();
        assert_eq!(config.upstream.database, "cities");
        assert_eq!(config.proxy.listen_port, 5433);
        assert_eq!(config.encryption.join_key_size, 2);
        assert!(!config.sql.strict_qualification);
        assert!(config.sql.passthrough_utility_statements);
        assert!(config.catalog.tables.is_empty());
    }

    #[test]
    fn test_parse_inline_catalog() {
        let yaml = r#"
catalog:
  tables:
    cities:
      columns:
        - name: id
          mode: joinable
        - name: name
          mode: blind_indexed
        - name: kladr_id
          mode: encrypted
        - name: population
"#;
        let config = TdeConfig::from_yaml(yaml).unwrap();
        let cities = &config.catalog.tables["cities"];
        assert_eq!(cities.columns.len(), 4);
        assert_eq!(cities.columns[0].mode, ColumnMode::Joinable);
        assert_eq!(cities.columns[3].mode, ColumnMode::Plain);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_with_context_resolves_catalog_file() {
        let dir = tempdir().unwrap();

        let mut catalog = fs::File::create(dir.path().join("catalog.yaml")).unwrap();
        writeln!(
            catalog,
            "tables:\n  city2region:\n    columns:\n      - name: id\n        mode: joinable\n      - name: region\n        mode: encrypted"
        )
        .unwrap();

        let config_path = dir.path().join("tde.yaml");
        fs::write(
            &config_path,
            "catalog_file: catalog.yaml\nencryption:\n  master_key_file: master.key\n",
        )
        .unwrap();

        let config = TdeConfig::load_with_context(&config_path).unwrap();
        assert!(config.catalog.tables.contains_key("city2region"));
        assert_eq!(
            config.encryption.master_key_file,
            Some(dir.path().join("master.key"))
        );
    }

    #[test]
    fn test_load_with_context_missing_catalog_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("tde.yaml");
        fs::write(&config_path, "catalog_file: nowhere.yaml\n").unwrap();

        let err = TdeConfig::load_with_context(&config_path).unwrap_err();
        assert!(matches!(err, ConfigError::Config(_)));
    }

    #[test]
    fn test_invalid_join_key_size_rejected() {
        let config = TdeConfig::from_yaml("encryption:\n  join_key_size: 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
