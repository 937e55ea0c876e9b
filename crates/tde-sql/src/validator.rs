//! Structural validation of resolved statements.
//!
//! Shape rules that hold regardless of which predicates are used: no `*` over
//! TDE tables, explicit INSERT column lists, literal-only values for encrypted
//! columns, and projected join columns for bucket joins.

use std::sync::Arc;
use tde_core::catalog::{ColumnCatalog, ColumnDescriptor};

use crate::ast::{
    ColumnRef, Expr, InsertSource, InsertStatement, ParsedStatement, SelectItem, SelectStatement,
    UpdateStatement,
};
use crate::classifier::JoinPair;
use crate::error::QueryError;
use crate::join_filter::{JoinSide, JoinSpec};

/// Check the structural rules for a resolved statement.
pub fn validate(statement: &ParsedStatement, catalog: &ColumnCatalog) -> Result<(), QueryError> {
    let touches_tde = statement
        .relations()
        .iter()
        .any(|r| catalog.is_tde_table(r.table()));

    match statement {
        ParsedStatement::Select(select) => {
            if touches_tde && select.has_wildcard() {
                return Err(QueryError::StarExpression);
            }
            Ok(())
        }
        ParsedStatement::Insert(insert) => validate_insert(insert, catalog, touches_tde),
        ParsedStatement::Update(update) => validate_update(update),
    }
}

fn validate_insert(
    insert: &InsertStatement,
    catalog: &ColumnCatalog,
    touches_tde: bool,
) -> Result<(), QueryError> {
    let rows = match &insert.source {
        InsertSource::Query { tables, .. } => {
            if touches_tde {
                return Err(QueryError::InsertSelect);
            }
            if tables.iter().any(|t| catalog.is_tde_table(t)) {
                return Err(QueryError::Unsupported(
                    "INSERT INTO SELECT reading TDE-enabled tables".to_string(),
                ));
            }
            return Ok(());
        }
        InsertSource::Values(rows) => rows,
    };

    if !touches_tde {
        return Ok(());
    }
    if insert.columns.is_empty() {
        return Err(QueryError::MissingInsertColumns);
    }

    for row in rows {
        if row.len() != insert.columns.len() {
            return Err(QueryError::BadInsert);
        }
        for (column, value) in insert.columns.iter().zip(row) {
            if column.mode().is_encrypted() && value.as_literal().is_none() {
                return Err(QueryError::NonLiteralInsert);
            }
        }
    }
    Ok(())
}

fn validate_update(update: &UpdateStatement) -> Result<(), QueryError> {
    let non_literal = update
        .assignments
        .iter()
        .any(|a| a.column.mode().is_encrypted() && a.value.as_literal().is_none());
    if non_literal {
        return Err(QueryError::NonLiteralUpdate);
    }
    Ok(())
}

/// Locate both sides of every bucket join among the projected columns.
///
/// The join filter needs both join values in the result set to drop bucket
/// collisions, so each side must be selected as a bare column.
pub fn validate_join_projection(
    select: &SelectStatement,
    pairs: &[JoinPair],
) -> Result<Vec<JoinSpec>, QueryError> {
    pairs
        .iter()
        .map(|pair| {
            Ok(JoinSpec {
                left: projected_side(select, &pair.left)?,
                right: projected_side(select, &pair.right)?,
            })
        })
        .collect()
}

fn projected_side(select: &SelectStatement, column: &ColumnRef) -> Result<JoinSide, QueryError> {
    let key = column.relation_key();
    let descriptor: Option<&Arc<ColumnDescriptor>> = column.descriptor();

    let position = select.projection.iter().position(|item| match item {
        SelectItem::Expr {
            expr: Expr::Column(projected),
            ..
        } => key.is_some() && projected.relation_key() == key,
        _ => false,
    });

    match (position, descriptor) {
        (Some(position), Some(descriptor)) => Ok(JoinSide {
            position,
            descriptor: descriptor.clone(),
        }),
        _ => Err(QueryError::JoinColumnsNotSelected),
    }
}
