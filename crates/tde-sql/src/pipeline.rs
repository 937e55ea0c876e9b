//! The query pipeline: parse, resolve, validate, classify, rewrite.

use std::sync::Arc;
use tde_core::catalog::ColumnCatalog;
use tde_core::config::SqlConfig;
use tde_crypto::EncryptionCodec;
use tracing::{debug, warn};

use crate::ast::{ParsedStatement, SelectItem, SelectStatement, StatementKind};
use crate::classifier::classify;
use crate::decoder::{OutputColumn, ResultDecoder, Row};
use crate::error::QueryError;
use crate::join_filter::{JoinBucketFilter, JoinSpec};
use crate::parser::{SqlOperation, StatementParser, lower_statement, operation};
use crate::resolver::{Resolver, ResolverOptions};
use crate::rewriter::Rewriter;
use crate::validator::{validate, validate_join_projection};

/// Pipeline behavior switches.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub strict_qualification: bool,
    /// Forward `SET`, `SHOW` and transaction control unchanged.
    pub passthrough_utility_statements: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            strict_qualification: false,
            passthrough_utility_statements: true,
        }
    }
}

impl From<&SqlConfig> for PipelineOptions {
    fn from(config: &SqlConfig) -> Self {
        Self {
            strict_qualification: config.strict_qualification,
            passthrough_utility_statements: config.passthrough_utility_statements,
        }
    }
}

/// A statement ready to be sent upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenStatement {
    pub sql: String,
    pub kind: StatementKind,
    /// Output columns of a SELECT, in projection order.
    pub output_columns: Vec<OutputColumn>,
    /// Bucket joins whose results must be re-checked.
    pub joins: Vec<JoinSpec>,
    /// LIMIT/OFFSET held back from the upstream query until join filtering is done.
    pub window: RowWindow,
}

/// OFFSET and LIMIT applied to result rows by the proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowWindow {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl RowWindow {
    pub fn is_unbounded(&self) -> bool {
        self.offset == 0 && self.limit.is_none()
    }

    pub fn apply(&self, rows: Vec<Row>) -> Vec<Row> {
        if self.is_unbounded() {
            return rows;
        }
        let rows = rows.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        }
    }

    /// Move the statement's LIMIT and OFFSET into a window.
    fn take_from(select: &mut SelectStatement) -> Result<Self, QueryError> {
        let count = |value: Option<String>, clause: &str| -> Result<Option<usize>, QueryError> {
            value
                .map(|v| {
                    v.trim().parse::<usize>().map_err(|_| {
                        QueryError::Unsupported(format!("non-constant {clause} with bucket joins"))
                    })
                })
                .transpose()
        };
        Ok(Self {
            offset: count(select.offset.take(), "OFFSET")?.unwrap_or(0),
            limit: count(select.limit.take(), "LIMIT")?,
        })
    }
}

impl RewrittenStatement {
    fn passthrough(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            kind: StatementKind::Utility,
            output_columns: Vec::new(),
            joins: Vec::new(),
            window: RowWindow::default(),
        }
    }

    /// Whether result rows need the join filter or decoder.
    pub fn needs_post_processing(&self) -> bool {
        !self.joins.is_empty()
            || !self.window.is_unbounded()
            || self.output_columns.iter().any(OutputColumn::is_encrypted)
    }
}

/// Rewrites client statements against a column catalog.
///
/// The pipeline holds no per-statement state; share it behind an `Arc`.
pub struct QueryPipeline {
    parser: StatementParser,
    catalog: Arc<ColumnCatalog>,
    codec: Arc<dyn EncryptionCodec>,
    options: PipelineOptions,
}

impl QueryPipeline {
    pub fn new(catalog: Arc<ColumnCatalog>, codec: Arc<dyn EncryptionCodec>) -> Self {
        Self::with_options(catalog, codec, PipelineOptions::default())
    }

    pub fn with_options(
        catalog: Arc<ColumnCatalog>,
        codec: Arc<dyn EncryptionCodec>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            parser: StatementParser::new(),
            catalog,
            codec,
            options,
        }
    }

    pub fn catalog(&self) -> &ColumnCatalog {
        &self.catalog
    }

    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    /// Validate and rewrite one client statement.
    pub fn process(&self, sql: &str) -> Result<RewrittenStatement, QueryError> {
        let result = self.process_inner(sql);
        match &result {
            Ok(rewritten) => debug!(
                kind = ?rewritten.kind,
                joins = rewritten.joins.len(),
                sql = %rewritten.sql,
                "Rewrote statement"
            ),
            Err(e) => warn!(kind = ?e.kind(), error = %e, "Rejected statement"),
        }
        result
    }

    fn process_inner(&self, sql: &str) -> Result<RewrittenStatement, QueryError> {
        let statement = self.parser.parse_single(sql)?;
        if self.options.passthrough_utility_statements
            && operation(&statement) == SqlOperation::Utility
        {
            return Ok(RewrittenStatement::passthrough(sql));
        }

        let mut statement = lower_statement(statement)?;
        Resolver::new(
            &self.catalog,
            ResolverOptions {
                strict_qualification: self.options.strict_qualification,
            },
        )
        .resolve(&mut statement)?;
        validate(&statement, &self.catalog)?;
        let classification = classify(&statement)?;

        let (output_columns, joins) = match &statement {
            ParsedStatement::Select(select) => (
                output_columns(select),
                validate_join_projection(select, &classification.joins)?,
            ),
            _ => (Vec::new(), Vec::new()),
        };
        debug!(
            lookups = classification.lookups,
            joins = joins.len(),
            "Classified statement"
        );

        // The database would cut the window before bucket collisions are dropped.
        let mut window = RowWindow::default();
        if let ParsedStatement::Select(select) = &mut statement
            && !joins.is_empty()
        {
            if !select.group_by.is_empty() {
                return Err(QueryError::Unsupported(
                    "GROUP BY with bucket joins".to_string(),
                ));
            }
            window = RowWindow::take_from(select)?;
        }

        Rewriter::new(self.codec.as_ref()).rewrite(&mut statement)?;

        Ok(RewrittenStatement {
            sql: statement.to_string(),
            kind: statement.kind(),
            output_columns,
            joins,
            window,
        })
    }

    /// Drop rows produced by join bucket collisions.
    pub fn filter_join_results(
        &self,
        rows: Vec<Row>,
        joins: &[JoinSpec],
    ) -> Result<Vec<Row>, QueryError> {
        JoinBucketFilter::new(self.codec.as_ref()).filter(rows, joins)
    }

    /// Decrypt the encrypted output columns.
    pub fn decode_rows(
        &self,
        rows: Vec<Row>,
        columns: &[OutputColumn],
    ) -> Result<Vec<Row>, QueryError> {
        ResultDecoder::new(self.codec.as_ref()).decode_rows(rows, columns)
    }

    /// Join filtering, the held-back row window, then decoding, for the rows of `statement`.
    pub fn finish(
        &self,
        statement: &RewrittenStatement,
        rows: Vec<Row>,
    ) -> Result<Vec<Row>, QueryError> {
        let rows = self.filter_join_results(rows, &statement.joins)?;
        let rows = statement.window.apply(rows);
        self.decode_rows(rows, &statement.output_columns)
    }
}

fn output_columns(select: &SelectStatement) -> Vec<OutputColumn> {
    // Positions are unknown once a wildcard expands; such queries carry no
    // encrypted columns.
    if select.has_wildcard() {
        return Vec::new();
    }

    select
        .projection
        .iter()
        .map(|item| {
            let name = item.output_name().unwrap_or("?column?").to_string();
            let descriptor = match item {
                SelectItem::Expr { expr, .. } => expr
                    .as_column()
                    .and_then(|c| c.descriptor())
                    .filter(|d| d.mode.is_encrypted())
                    .cloned(),
                SelectItem::Wildcard { .. } => None,
            };
            OutputColumn { name, descriptor }
        })
        .collect()
}
