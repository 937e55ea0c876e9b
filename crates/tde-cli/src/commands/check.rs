//! `tde check` command implementation.
//!
//! Loads the configuration the way `tde serve` does and reports problems
//! with the catalog, the key material and the proxy settings.

use anyhow::Result;
use std::path::Path;

use tde_core::{ColumnCatalog, ColumnMode, TdeConfig};
use tde_crypto::KeyedCodec;

/// Severity level for check results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// A single check finding.
#[derive(Debug, Clone)]
pub struct CheckFinding {
    pub severity: Severity,
    /// Configuration section the finding belongs to.
    pub category: &'static str,
    pub message: String,
}

impl CheckFinding {
    fn error(category: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            message: message.into(),
        }
    }

    fn warning(category: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            message: message.into(),
        }
    }

    fn info(category: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            category,
            message: message.into(),
        }
    }
}

/// Results from running all checks.
#[derive(Debug, Default)]
pub struct CheckResults {
    pub findings: Vec<CheckFinding>,
}

impl CheckResults {
    fn add(&mut self, finding: CheckFinding) {
        self.findings.push(finding);
    }

    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    /// Print findings, most severe first.
    pub fn print_summary(&self) {
        let mut findings: Vec<&CheckFinding> = self.findings.iter().collect();
        findings.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.category.cmp(b.category)));

        for finding in findings {
            println!(
                "  {:<5} [{}] {}",
                finding.severity, finding.category, finding.message
            );
        }

        println!();
        if self.has_errors() {
            println!(
                "✗ {} error(s), {} warning(s)",
                self.count(Severity::Error),
                self.count(Severity::Warning)
            );
        } else {
            println!(
                "✔ Configuration is valid ({} warning(s))",
                self.count(Severity::Warning)
            );
        }
    }
}

/// Summary line for one table, e.g. `cities: 3 column(s) (1 joinable, 2 encrypted)`.
fn describe_table(catalog: &ColumnCatalog, name: &str) -> Option<String> {
    let table = catalog.table(name)?;
    let modes = [
        ColumnMode::Joinable,
        ColumnMode::BlindIndexed,
        ColumnMode::Encrypted,
        ColumnMode::Plain,
    ];
    let counts: Vec<String> = modes
        .iter()
        .filter_map(|mode| {
            let n = table.columns().iter().filter(|c| c.mode == *mode).count();
            (n > 0).then(|| format!("{n} {mode}"))
        })
        .collect();
    Some(format!(
        "{}: {} column(s) ({})",
        name,
        table.columns().len(),
        counts.join(", ")
    ))
}

/// Run all checks without printing.
pub fn run_quiet(config_path: &Path) -> Result<CheckResults> {
    let mut results = CheckResults::default();

    let config = match TdeConfig::load_with_context(config_path) {
        Ok(config) => config,
        Err(e) => {
            results.add(CheckFinding::error("config", e.to_string()));
            return Ok(results);
        }
    };

    match ColumnCatalog::from_config(&config.catalog) {
        Ok(catalog) => {
            if catalog.is_empty() {
                results.add(CheckFinding::warning(
                    "catalog",
                    "no tables declared, every statement is forwarded unchanged",
                ));
            }
            for table in catalog.tables() {
                if !table.has_encrypted_columns() {
                    results.add(CheckFinding::warning(
                        "catalog",
                        format!("table {} declares no protected columns", table.name()),
                    ));
                }
                if let Some(line) = describe_table(&catalog, table.name()) {
                    results.add(CheckFinding::info("catalog", line));
                }
            }
        }
        Err(e) => results.add(CheckFinding::error("catalog", e.to_string())),
    }

    match KeyedCodec::from_config(&config.encryption) {
        Ok(codec) => results.add(CheckFinding::info(
            "encryption",
            format!("master key loaded, join bucket width {} byte(s)", codec.join_key_size()),
        )),
        Err(e) => results.add(CheckFinding::error("encryption", e.to_string())),
    }

    if config.proxy.password.is_none() {
        results.add(CheckFinding::warning(
            "proxy",
            "proxy.password is not set, any client password is accepted",
        ));
    }
    results.add(CheckFinding::info(
        "proxy",
        format!(
            "listening on {}, upstream {}",
            config.proxy.bind_address(),
            config.upstream.display_target()
        ),
    ));

    Ok(results)
}

/// Run all checks and print the findings. Fails when any check errors.
pub fn run(config_path: &Path) -> Result<()> {
    println!("Checking {}", config_path.display());
    println!();

    let results = run_quiet(config_path)?;
    results.print_summary();

    if results.has_errors() {
        anyhow::bail!("configuration check failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tde_crypto::MasterKey;
    use tempfile::tempdir;

    const CATALOG: &str = r#"
catalog:
  tables:
    cities:
      columns:
        - name: id
          mode: joinable
        - name: kladr_id
          mode: encrypted
        - name: population
    audit_log:
      columns:
        - name: message
"#;

    #[test]
    fn test_check_valid_config() {
        let dir = tempdir().unwrap();
        MasterKey::generate()
            .save_to_file(&dir.path().join("master.key"))
            .unwrap();
        let config_path = dir.path().join("tde.yaml");
        std::fs::write(
            &config_path,
            format!("proxy:\n  password: secret\nencryption:\n  master_key_file: master.key\n{CATALOG}"),
        )
        .unwrap();

        let results = run_quiet(&config_path).unwrap();
        assert!(!results.has_errors());
        assert_eq!(results.count(Severity::Warning), 1);
        assert!(results.findings.iter().any(|f| f.message
            == "cities: 3 column(s) (1 joinable, 1 encrypted, 1 plain)"));
        assert!(results
            .findings
            .iter()
            .any(|f| f.message.contains("audit_log declares no protected columns")));
    }

    #[test]
    fn test_check_missing_key() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("tde.yaml");
        std::fs::write(
            &config_path,
            format!("encryption:\n  master_key_file: missing.key\n{CATALOG}"),
        )
        .unwrap();

        let results = run_quiet(&config_path).unwrap();
        assert!(results.has_errors());
        assert!(results
            .findings
            .iter()
            .any(|f| f.severity == Severity::Error && f.category == "encryption"));
    }

    #[test]
    fn test_check_unreadable_config() {
        let dir = tempdir().unwrap();
        let results = run_quiet(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(results.count(Severity::Error), 1);
        assert_eq!(results.findings[0].category, "config");
    }
}
