//! Column policy configuration.
//!
//! Declares, for every table that holds protected data, the mode of each of
//! its columns. Tables absent from the catalog are treated as plain tables.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use super::ConfigError;
use crate::catalog::ColumnMode;

/// Column policy catalog as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Suffix appended to a column name to form its blind index column.
    #[serde(default = "default_blind_index_suffix")]
    pub blind_index_suffix: String,

    /// Suffix appended to a column name to form its join bucket column.
    #[serde(default = "default_join_key_suffix")]
    pub join_key_suffix: String,

    /// Per-table column declarations.
    #[serde(default)]
    pub tables: HashMap<String, TableConfig>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            blind_index_suffix: default_blind_index_suffix(),
            join_key_suffix: default_join_key_suffix(),
            tables: HashMap::new(),
        }
    }
}

/// Ordered column declarations of one table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
}

/// A single column declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    /// Column name as stored in the database.
    pub name: String,

    /// Protection mode. Defaults to `plain`.
    #[serde(default)]
    pub mode: ColumnMode,

    /// Overrides the blind index column name (`<name><blind_index_suffix>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blind_index_column: Option<String>,

    /// Overrides the join bucket column name (`<name><join_key_suffix>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_key_column: Option<String>,
}

impl ColumnConfig {
    /// Physical blind index column, if the mode has one.
    pub fn blind_index_name(&self, suffix: &str) -> Option<String> {
        self.mode.is_searchable().then(|| {
            self.blind_index_column
                .clone()
                .unwrap_or_else(|| format!("{}{}", self.name, suffix))
        })
    }

    /// Physical join bucket column, if the mode has one.
    pub fn join_key_name(&self, suffix: &str) -> Option<String> {
        self.mode.is_joinable().then(|| {
            self.join_key_column
                .clone()
                .unwrap_or_else(|| format!("{}{}", self.name, suffix))
        })
    }
}

impl CatalogConfig {
    /// Load a catalog from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse a catalog from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Reject duplicate columns and auxiliary columns that shadow declared ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blind_index_suffix.is_empty() || self.join_key_suffix.is_empty() {
            return Err(ConfigError::Config(
                "catalog suffixes must not be empty".to_string(),
            ));
        }

        for (table, table_config) in &self.tables {
            let mut names = HashSet::new();
            for column in &table_config.columns {
                if column.name.is_empty() {
                    return Err(ConfigError::Config(format!(
                        "table {table} declares a column without a name"
                    )));
                }
                if !names.insert(column.name.as_str()) {
                    return Err(ConfigError::Config(format!(
                        "column {}.{} is declared more than once",
                        table, column.name
                    )));
                }
            }

            let mut auxiliary = HashSet::new();
            for column in &table_config.columns {
                let extra = [
                    column.blind_index_name(&self.blind_index_suffix),
                    column.join_key_name(&self.join_key_suffix),
                ];
                for name in extra.into_iter().flatten() {
                    if names.contains(name.as_str()) || !auxiliary.insert(name.clone()) {
                        return Err(ConfigError::Config(format!(
                            "auxiliary column {}.{} collides with another column",
                            table, name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn default_blind_index_suffix() -> String {
    "_bi".to_string()
}

fn default_join_key_suffix() -> String {
    "_join_key".to_string()
}
