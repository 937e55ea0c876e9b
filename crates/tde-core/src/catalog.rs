//! Column policy catalog.
//!
//! Built once from [`CatalogConfig`] and shared read-only behind an `Arc`.
//! A schema change replaces the whole catalog; nothing mutates it in place.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{CatalogConfig, ConfigError};

/// How a column is stored and which predicates may touch it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnMode {
    /// Stored as plaintext. No restrictions.
    #[default]
    Plain,
    /// Randomized ciphertext only. Can be read back but never searched.
    Encrypted,
    /// Ciphertext plus a deterministic blind index for equality lookups.
    BlindIndexed,
    /// Blind-indexed, plus a join bucket for equi-joins across tables.
    Joinable,
}

impl ColumnMode {
    /// Whether values are stored as ciphertext.
    pub fn is_encrypted(self) -> bool {
        !matches!(self, ColumnMode::Plain)
    }

    /// Whether `column = literal` can be answered through a blind index.
    pub fn is_searchable(self) -> bool {
        matches!(self, ColumnMode::BlindIndexed | ColumnMode::Joinable)
    }

    /// Whether the column carries a join bucket.
    pub fn is_joinable(self) -> bool {
        matches!(self, ColumnMode::Joinable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnMode::Plain => "plain",
            ColumnMode::Encrypted => "encrypted",
            ColumnMode::BlindIndexed => "blind_indexed",
            ColumnMode::Joinable => "joinable",
        }
    }
}

impl fmt::Display for ColumnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy of a single physical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub table: String,
    pub column: String,
    pub mode: ColumnMode,
    blind_index_column: Option<String>,
    join_key_column: Option<String>,
}

impl ColumnDescriptor {
    /// Descriptor with auxiliary column names derived from the default suffixes.
    pub fn new(table: impl Into<String>, column: impl Into<String>, mode: ColumnMode) -> Self {
        let table = table.into();
        let column = column.into();
        let defaults = CatalogConfig::default();
        let blind_index_column = mode
            .is_searchable()
            .then(|| format!("{}{}", column, defaults.blind_index_suffix));
        let join_key_column = mode
            .is_joinable()
            .then(|| format!("{}{}", column, defaults.join_key_suffix));

        Self {
            table,
            column,
            mode,
            blind_index_column,
            join_key_column,
        }
    }

    /// Physical column holding the blind index.
    pub fn blind_index_column(&self) -> Option<&str> {
        self.blind_index_column.as_deref()
    }

    /// Physical column holding the join bucket.
    pub fn join_key_column(&self) -> Option<&str> {
        self.join_key_column.as_deref()
    }

    /// `table.column`, as used in error messages and key derivation.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// Ordered column descriptors of one table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    name: String,
    columns: Vec<Arc<ColumnDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        let columns: Vec<Arc<ColumnDescriptor>> = columns.into_iter().map(Arc::new).collect();
        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.column.clone(), i))
            .collect();

        Self {
            name: name.into(),
            columns,
            by_name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Arc<ColumnDescriptor>] {
        &self.columns
    }

    /// Exact, case-sensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&Arc<ColumnDescriptor>> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    /// A table is TDE-enabled once any of its columns is encrypted.
    pub fn has_encrypted_columns(&self) -> bool {
        self.columns.iter().any(|c| c.mode.is_encrypted())
    }
}

/// Read-only view of every catalogued table.
#[derive(Debug, Clone, Default)]
pub struct ColumnCatalog {
    tables: HashMap<String, TableSchema>,
}

impl ColumnCatalog {
    /// Catalog without any tables; every table is plain.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from configuration, validating it first.
    pub fn from_config(config: &CatalogConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let tables = config
            .tables
            .iter()
            .map(|(table, table_config)| {
                let columns = table_config
                    .columns
                    .iter()
                    .map(|c| ColumnDescriptor {
                        table: table.clone(),
                        column: c.name.clone(),
                        mode: c.mode,
                        blind_index_column: c.blind_index_name(&config.blind_index_suffix),
                        join_key_column: c.join_key_name(&config.join_key_suffix),
                    })
                    .collect();
                (table.clone(), TableSchema::new(table.clone(), columns))
            })
            .collect();

        Ok(Self { tables })
    }

    /// Add or replace a table definition.
    pub fn with_table(mut self, schema: TableSchema) -> Self {
        self.tables.insert(schema.name().to_string(), schema);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&Arc<ColumnDescriptor>> {
        self.tables.get(table).and_then(|t| t.column(column))
    }

    /// Whether the table has at least one encrypted column.
    pub fn is_tde_table(&self, name: &str) -> bool {
        self.tables
            .get(name)
            .is_some_and(TableSchema::has_encrypted_columns)
    }

    /// Tables sorted by name.
    pub fn tables(&self) -> Vec<&TableSchema> {
        let mut tables: Vec<&TableSchema> = self.tables.values().collect();
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ColumnCatalog {
        let yaml = r#"
join_key_suffix: _jk
tables:
  cities:
    columns:
      - name: id
        mode: joinable
      - name: name
        mode: blind_indexed
        blind_index_column: name_hash
      - name: kladr_id
        mode: encrypted
  regions:
    columns:
      - name: id
      - name: title
"#;
        ColumnCatalog::from_config(&CatalogConfig::from_yaml(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_lookup_is_exact() {
        let catalog = catalog();
        assert_eq!(catalog.column("cities", "name").unwrap().mode, ColumnMode::BlindIndexed);
        assert!(catalog.column("cities", "Name").is_none());
        assert!(catalog.column("Cities", "name").is_none());
        assert!(catalog.column("missing", "name").is_none());
    }

    #[test]
    fn test_auxiliary_columns() {
        let catalog = catalog();
        let id = catalog.column("cities", "id").unwrap();
        assert_eq!(id.blind_index_column(), Some("id_bi"));
        assert_eq!(id.join_key_column(), Some("id_jk"));

        let name = catalog.column("cities", "name").unwrap();
        assert_eq!(name.blind_index_column(), Some("name_hash"));
        assert_eq!(name.join_key_column(), None);

        let kladr = catalog.column("cities", "kladr_id").unwrap();
        assert_eq!(kladr.blind_index_column(), None);
        assert_eq!(kladr.qualified_name(), "cities.kladr_id");
    }

    #[test]
    fn test_tde_tables() {
        let catalog = catalog();
        assert!(catalog.is_tde_table("cities"));
        assert!(!catalog.is_tde_table("regions"));
        assert!(!catalog.is_tde_table("unknown"));
        assert_eq!(catalog.tables()[0].name(), "cities");
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_columns_keep_declaration_order() {
        let catalog = catalog();
        let names: Vec<&str> = catalog
            .table("cities")
            .unwrap()
            .columns()
            .iter()
            .map(|c| c.column.as_str())
            .collect();
        assert_eq!(names, vec!["id", "name", "kladr_id"]);
    }

    #[test]
    fn test_mode_predicates() {
        assert!(!ColumnMode::Plain.is_encrypted());
        assert!(ColumnMode::Encrypted.is_encrypted());
        assert!(!ColumnMode::Encrypted.is_searchable());
        assert!(ColumnMode::BlindIndexed.is_searchable());
        assert!(!ColumnMode::BlindIndexed.is_joinable());
        assert!(ColumnMode::Joinable.is_searchable());
        assert!(ColumnMode::Joinable.is_joinable());
    }

    #[test]
    fn test_descriptor_new_uses_default_suffixes() {
        let d = ColumnDescriptor::new("t", "c", ColumnMode::Joinable);
        assert_eq!(d.blind_index_column(), Some("c_bi"));
        assert_eq!(d.join_key_column(), Some("c_join_key"));
    }
}
