//! Predicate classification.
//!
//! Decides, for every place an encrypted column appears, whether the
//! rewriter can answer it: equality lookups go through the blind index,
//! equi-joins between joinable columns go through the join bucket, grouping
//! goes through the blind index, and bare projections are decrypted on the
//! way back. Everything else is rejected
//! with an "invalid use" error naming the offending column.

use crate::ast::{
    ColumnRef, ComparisonOp, Expr, InsertSource, JoinKind, ParsedStatement, SelectItem,
    SelectStatement,
};
use crate::error::QueryError;

/// A bucket join found in a JOIN ... ON condition.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinPair {
    pub left: ColumnRef,
    pub right: ColumnRef,
}

/// What the rewriter has to do for a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Blind-index lookups in WHERE.
    pub lookups: usize,
    /// Bucket joins, in declaration order.
    pub joins: Vec<JoinPair>,
    /// GROUP BY items answered by the blind index.
    pub group_keys: usize,
}

impl Classification {
    pub fn is_trivial(&self) -> bool {
        self.lookups == 0 && self.joins.is_empty() && self.group_keys == 0
    }
}

fn invalid(column: &ColumnRef) -> QueryError {
    match column.descriptor() {
        Some(d) => QueryError::invalid_use(&d.table, &d.column),
        None => QueryError::invalid_use("", &column.name.value),
    }
}

fn reject_encrypted(expr: &Expr) -> Result<(), QueryError> {
    match expr.first_encrypted_column() {
        Some(column) => Err(invalid(column)),
        None => Ok(()),
    }
}

/// Classify every use of an encrypted column in the statement.
pub fn classify(statement: &ParsedStatement) -> Result<Classification, QueryError> {
    let mut classification = Classification::default();

    match statement {
        ParsedStatement::Select(select) => classify_select(select, &mut classification)?,
        ParsedStatement::Insert(insert) => {
            if let InsertSource::Values(rows) = &insert.source {
                for value in rows.iter().flatten() {
                    reject_encrypted(value)?;
                }
            }
        }
        ParsedStatement::Update(update) => {
            for assignment in &update.assignments {
                reject_encrypted(&assignment.value)?;
            }
            if let Some(selection) = &update.selection {
                classify_where(selection, &mut classification)?;
            }
        }
    }

    Ok(classification)
}

fn classify_select(
    select: &SelectStatement,
    classification: &mut Classification,
) -> Result<(), QueryError> {
    for item in &select.projection {
        let SelectItem::Expr { expr, .. } = item else {
            continue;
        };
        match expr {
            Expr::Column(column) => {
                if select.distinct && column.mode().is_encrypted() {
                    return Err(invalid(column));
                }
            }
            other => reject_encrypted(other)?,
        }
    }

    for join in select.joins() {
        if let Some(pair) = classify_join(&join.on, join.kind)? {
            classification.joins.push(pair);
        }
    }

    if let Some(selection) = &select.selection {
        classify_where(selection, classification)?;
    }

    for expr in &select.group_by {
        match expr {
            Expr::Column(column) if column.mode().is_encrypted() => {
                if !column.mode().is_searchable() {
                    return Err(invalid(column));
                }
                classification.group_keys += 1;
            }
            other => reject_encrypted(other)?,
        }
    }

    for item in &select.order_by {
        reject_encrypted(&item.expr)?;
    }
    Ok(())
}

fn classify_join(on: &Expr, kind: JoinKind) -> Result<Option<JoinPair>, QueryError> {
    let Some(first) = on.first_encrypted_column() else {
        return Ok(None);
    };

    let mut condition = on;
    while let Expr::Nested(inner) = condition {
        condition = inner;
    }

    if let Expr::Comparison {
        left,
        op: ComparisonOp::Eq,
        right,
    } = condition
        && let (Some(l), Some(r)) = (left.as_column(), right.as_column())
        && l.mode().is_joinable()
        && r.mode().is_joinable()
        && kind == JoinKind::Inner
    {
        return Ok(Some(JoinPair {
            left: l.clone(),
            right: r.clone(),
        }));
    }

    Err(invalid(first))
}

fn classify_where(expr: &Expr, classification: &mut Classification) -> Result<(), QueryError> {
    match expr {
        Expr::Logical { left, right, .. } => {
            classify_where(left, classification)?;
            classify_where(right, classification)
        }
        // NOT over an encrypted comparison is an inequality the blind index can't answer.
        Expr::Not(inner) => reject_encrypted(inner),
        Expr::Nested(inner) => classify_where(inner, classification),
        Expr::Comparison { left, op, right } => {
            match (left.as_ref(), right.as_ref()) {
                (Expr::Column(column), Expr::Literal(_)) | (Expr::Literal(_), Expr::Column(column))
                    if column.mode().is_encrypted() =>
                {
                    if *op == ComparisonOp::Eq && column.mode().is_searchable() {
                        classification.lookups += 1;
                        Ok(())
                    } else {
                        Err(invalid(column))
                    }
                }
                _ => reject_encrypted(expr),
            }
        }
        other => reject_encrypted(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::StatementParser;
    use crate::resolver::{Resolver, ResolverOptions};
    use pretty_assertions::assert_eq;
    use tde_core::catalog::{ColumnCatalog, ColumnDescriptor, ColumnMode, TableSchema};

    fn catalog() -> ColumnCatalog {
        ColumnCatalog::empty()
            .with_table(TableSchema::new(
                "cities",
                vec![
                    ColumnDescriptor::new("cities", "id", ColumnMode::Joinable),
                    ColumnDescriptor::new("cities", "name", ColumnMode::BlindIndexed),
                    ColumnDescriptor::new("cities", "kladr_id", ColumnMode::Encrypted),
                    ColumnDescriptor::new("cities", "population", ColumnMode::Plain),
                ],
            ))
            .with_table(TableSchema::new(
                "city2region",
                vec![
                    ColumnDescriptor::new("city2region", "id", ColumnMode::Joinable),
                    ColumnDescriptor::new("city2region", "region", ColumnMode::Encrypted),
                    ColumnDescriptor::new("city2region", "code", ColumnMode::Plain),
                ],
            ))
    }

    fn run(sql: &str) -> Result<Classification, QueryError> {
        let catalog = catalog();
        let mut statement = StatementParser::new().parse(sql)?;
        Resolver::new(&catalog, ResolverOptions::default()).resolve(&mut statement)?;
        classify(&statement)
    }

    fn invalid_use(table: &str, column: &str) -> Result<Classification, QueryError> {
        Err(QueryError::invalid_use(table, column))
    }

    #[test]
    fn test_equality_lookups() {
        let c = run("SELECT id FROM cities WHERE name = 'Moscow' AND population > 10").unwrap();
        assert_eq!(c.lookups, 1);
        let c = run("SELECT id FROM cities WHERE 'x' = name OR id = 'y'").unwrap();
        assert_eq!(c.lookups, 2);
    }

    #[test]
    fn test_encrypted_only_column_not_searchable() {
        assert_eq!(
            run("SELECT id FROM cities WHERE kladr_id = '77'"),
            invalid_use("cities", "kladr_id")
        );
    }

    #[test]
    fn test_non_equality_rejected() {
        assert_eq!(
            run("SELECT id FROM cities WHERE name > 'a'"),
            invalid_use("cities", "name")
        );
        assert_eq!(
            run("SELECT id FROM cities WHERE name LIKE 'M%'"),
            invalid_use("cities", "name")
        );
        assert_eq!(
            run("SELECT id FROM cities WHERE name IS NULL"),
            invalid_use("cities", "name")
        );
        assert_eq!(
            run("SELECT id FROM cities WHERE name = id"),
            invalid_use("cities", "name")
        );
    }

    #[test]
    fn test_negated_lookup_rejected_like_inequality() {
        assert_eq!(
            run("SELECT id FROM cities WHERE name <> 'Moscow'"),
            invalid_use("cities", "name")
        );
        assert_eq!(
            run("SELECT id FROM cities WHERE NOT name = 'Moscow'"),
            invalid_use("cities", "name")
        );
        assert_eq!(
            run("SELECT id FROM cities WHERE NOT (population > 1 AND name = 'Moscow')"),
            invalid_use("cities", "name")
        );
        let c = run("SELECT id FROM cities WHERE NOT population > 1 AND name = 'Moscow'").unwrap();
        assert_eq!(c.lookups, 1);
    }

    #[test]
    fn test_group_by_rules() {
        let c = run("SELECT name, count(population) AS n FROM cities GROUP BY name").unwrap();
        assert_eq!(c.group_keys, 1);
        assert!(run("SELECT population FROM cities GROUP BY population").unwrap().is_trivial());
        assert_eq!(
            run("SELECT kladr_id FROM cities GROUP BY kladr_id"),
            invalid_use("cities", "kladr_id")
        );
        assert_eq!(
            run("SELECT count(population) AS n FROM cities GROUP BY lower(name)"),
            invalid_use("cities", "name")
        );
    }

    #[test]
    fn test_projection_rules() {
        assert!(run("SELECT id, name, kladr_id FROM cities").is_ok());
        assert_eq!(
            run("SELECT upper(name) FROM cities"),
            invalid_use("cities", "name")
        );
        assert_eq!(
            run("SELECT DISTINCT kladr_id FROM cities"),
            invalid_use("cities", "kladr_id")
        );
        assert!(run("SELECT DISTINCT population FROM cities").is_ok());
    }

    #[test]
    fn test_order_by_encrypted_rejected() {
        assert_eq!(
            run("SELECT id FROM cities ORDER BY name"),
            invalid_use("cities", "name")
        );
        assert!(run("SELECT id FROM cities ORDER BY population DESC").is_ok());
    }

    #[test]
    fn test_bucket_join() {
        let c = run(
            "SELECT c.id, r.id AS rid FROM cities c JOIN city2region r ON c.id = r.id",
        )
        .unwrap();
        assert_eq!(c.joins.len(), 1);
        assert_eq!(c.joins[0].left.to_string(), "c.id");
        assert_eq!(c.joins[0].right.to_string(), "r.id");
    }

    #[test]
    fn test_invalid_joins() {
        assert_eq!(
            run("SELECT c.id FROM cities c JOIN city2region r ON c.id = r.region"),
            invalid_use("cities", "id")
        );
        assert_eq!(
            run("SELECT c.id FROM cities c JOIN city2region r ON c.name = r.id"),
            invalid_use("cities", "name")
        );
        assert_eq!(
            run("SELECT c.id FROM cities c LEFT JOIN city2region r ON c.id = r.id"),
            invalid_use("cities", "id")
        );
        assert_eq!(
            run("SELECT c.id FROM cities c JOIN city2region r ON c.id = r.id AND r.code = 1"),
            invalid_use("cities", "id")
        );
    }

    #[test]
    fn test_plain_join_unrestricted() {
        let c = run(
            "SELECT c.id FROM cities c LEFT JOIN city2region r ON c.population > r.code",
        )
        .unwrap();
        assert!(c.is_trivial());
    }

    #[test]
    fn test_update_values() {
        assert_eq!(
            run("UPDATE cities SET population = length(name)"),
            invalid_use("cities", "name")
        );
        let c = run("UPDATE cities SET name = 'x' WHERE id = '1'").unwrap();
        assert_eq!(c.lookups, 1);
    }
}
