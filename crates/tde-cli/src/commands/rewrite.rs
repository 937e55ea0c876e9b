//! `tde rewrite` - show what the proxy would send upstream for a statement.

use anyhow::Context;
use serde_json::json;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;

use tde_core::{ColumnCatalog, TdeConfig};
use tde_crypto::KeyedCodec;
use tde_sql::{PipelineOptions, QueryPipeline, RewrittenStatement};

fn build_pipeline(config: &TdeConfig) -> anyhow::Result<QueryPipeline> {
    let catalog = ColumnCatalog::from_config(&config.catalog)?;
    let codec = KeyedCodec::from_config(&config.encryption)
        .context("rewriting needs the master key to compute blind indexes")?;
    Ok(QueryPipeline::with_options(
        Arc::new(catalog),
        Arc::new(codec),
        PipelineOptions::from(&config.sql),
    ))
}

/// Human-readable report of a rewritten statement.
pub fn render(statement: &RewrittenStatement) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", statement.sql);

    let decrypted: Vec<String> = statement
        .output_columns
        .iter()
        .enumerate()
        .filter_map(|(i, c)| {
            c.descriptor
                .as_ref()
                .map(|d| format!("#{} {} ({})", i + 1, c.name, d.qualified_name()))
        })
        .collect();
    if !decrypted.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Decrypted output columns:");
        for line in decrypted {
            let _ = writeln!(out, "  {line}");
        }
    }

    if !statement.joins.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Bucket joins re-checked after decryption:");
        for join in &statement.joins {
            let _ = writeln!(
                out,
                "  #{} {} = #{} {}",
                join.left.position + 1,
                join.left.descriptor.qualified_name(),
                join.right.position + 1,
                join.right.descriptor.qualified_name()
            );
        }
    }

    let window = statement.window;
    if !window.is_unbounded() {
        let limit = window.limit.map_or("ALL".to_string(), |l| l.to_string());
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Applied after join filtering: OFFSET {} LIMIT {limit}",
            window.offset
        );
    }

    out
}

/// Machine-readable form of [`render`].
pub fn to_json(statement: &RewrittenStatement) -> serde_json::Value {
    let columns: Vec<serde_json::Value> = statement
        .output_columns
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "decrypts": c.descriptor.as_ref().map(|d| d.qualified_name()),
            })
        })
        .collect();
    let joins: Vec<serde_json::Value> = statement
        .joins
        .iter()
        .map(|j| {
            json!({
                "left": { "position": j.left.position, "column": j.left.descriptor.qualified_name() },
                "right": { "position": j.right.position, "column": j.right.descriptor.qualified_name() },
            })
        })
        .collect();

    json!({
        "sql": statement.sql,
        "kind": format!("{:?}", statement.kind).to_lowercase(),
        "output_columns": columns,
        "joins": joins,
        "window": {
            "offset": statement.window.offset,
            "limit": statement.window.limit,
        },
    })
}

pub fn run(config_path: &Path, sql: &str, as_json: bool) -> anyhow::Result<()> {
    let config = TdeConfig::load_with_context(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let pipeline = build_pipeline(&config)?;

    let rewritten = pipeline.process(sql)?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&to_json(&rewritten))?);
    } else {
        print!("{}", render(&rewritten));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tde_crypto::MasterKey;

    fn pipeline() -> QueryPipeline {
        let config = TdeConfig::from_yaml(
            r#"
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
    city2region:
      columns:
        - name: id
          mode: joinable
        - name: region
          mode: encrypted
"#,
        )
        .unwrap();
        let catalog = ColumnCatalog::from_config(&config.catalog).unwrap();
        let codec = KeyedCodec::new(MasterKey::generate(), 2).unwrap();
        QueryPipeline::new(Arc::new(catalog), Arc::new(codec))
    }

    #[test]
    fn test_render_plain_statement() {
        let rewritten = pipeline().process("SELECT x FROM audit_log").unwrap();
        assert_eq!(render(&rewritten), "SELECT x FROM audit_log\n");
    }

    #[test]
    fn test_render_join() {
        let rewritten = pipeline()
            .process(
                "SELECT c.id AS c_id, r.id AS r_id, r.region FROM cities c JOIN city2region r ON c.id = r.id",
            )
            .unwrap();
        let report = render(&rewritten);

        assert!(report.starts_with(
            "SELECT c.id AS c_id, r.id AS r_id, r.region FROM cities AS c JOIN city2region AS r ON c.id_join_key = r.id_join_key\n"
        ));
        assert!(report.contains("  #3 region (city2region.region)\n"));
        assert!(report.contains("  #1 cities.id = #2 city2region.id\n"));
    }

    #[test]
    fn test_json_report() {
        let rewritten = pipeline()
            .process("SELECT c.id AS c_id, r.id AS r_id, r.region FROM cities c JOIN city2region r ON c.id = r.id")
            .unwrap();
        let value = to_json(&rewritten);

        assert_eq!(value["kind"], "select");
        assert_eq!(value["output_columns"][2]["decrypts"], "city2region.region");
        assert_eq!(value["joins"][0]["left"]["position"], 0);
        assert_eq!(value["joins"][0]["right"]["column"], "city2region.id");
    }

    #[test]
    fn test_render_held_back_limit() {
        let rewritten = pipeline()
            .process("SELECT c.id AS c_id, r.id AS r_id FROM cities c JOIN city2region r ON c.id = r.id LIMIT 10")
            .unwrap();
        assert!(render(&rewritten).ends_with("\nApplied after join filtering: OFFSET 0 LIMIT 10\n"));
        assert_eq!(to_json(&rewritten)["window"]["limit"], 10);
    }

    #[test]
    fn test_rejected_statement() {
        let err = pipeline()
            .process("SELECT c.kladr_id FROM cities c WHERE c.kladr_id = '7700'")
            .unwrap_err();
        assert!(err.to_string().starts_with("postgres_tde: "));
    }
}
