//! Column provenance resolution.
//!
//! Binds every column reference to the relation it reads from and to its
//! catalog descriptor. Later stages rely on every reference being bound.

use std::collections::HashSet;
use tde_core::catalog::{ColumnCatalog, TableSchema};

use crate::ast::{
    ColumnBinding, ColumnRef, ColumnSource, Expr, InsertSource, ParsedStatement, RelationBinding,
    SelectItem, SelectStatement,
};
use crate::error::QueryError;

/// Options controlling how strictly references must be qualified.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverOptions {
    /// Require qualified references in SELECT and WHERE of statements that
    /// touch TDE-enabled tables, even with a single relation in scope.
    pub strict_qualification: bool,
}

struct ScopeEntry<'c> {
    effective_name: String,
    table: String,
    schema: Option<&'c TableSchema>,
}

struct Scope<'c> {
    entries: Vec<ScopeEntry<'c>>,
    touches_tde: bool,
}

impl<'c> Scope<'c> {
    fn new(catalog: &'c ColumnCatalog, relations: &[&RelationBinding]) -> Result<Self, QueryError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(relations.len());
        for relation in relations {
            let effective_name = relation.effective_name().to_string();
            if !seen.insert(effective_name.clone()) {
                return Err(QueryError::Unsupported(format!(
                    "table name {effective_name} specified more than once"
                )));
            }
            entries.push(ScopeEntry {
                effective_name,
                table: relation.table().to_string(),
                schema: catalog.table(relation.table()),
            });
        }
        let touches_tde = entries
            .iter()
            .any(|e| e.schema.is_some_and(TableSchema::has_encrypted_columns));

        Ok(Self {
            entries,
            touches_tde,
        })
    }

    fn bind_to(&self, index: usize, column: &str) -> Result<ColumnBinding, QueryError> {
        let entry = &self.entries[index];
        let descriptor = match entry.schema {
            Some(schema) => Some(schema.column(column).cloned().ok_or_else(|| {
                QueryError::UnknownColumn {
                    table: entry.table.clone(),
                    column: column.to_string(),
                }
            })?),
            None => None,
        };

        Ok(ColumnBinding {
            source: ColumnSource::Relation {
                index,
                table: entry.table.clone(),
            },
            descriptor,
        })
    }

    fn resolve(&self, column: &mut ColumnRef, strict: bool) -> Result<(), QueryError> {
        if column.is_resolved() {
            return Ok(());
        }

        let binding = match column.qualifier_name() {
            Some(qualifier) => {
                let index = self
                    .entries
                    .iter()
                    .position(|e| e.effective_name == qualifier)
                    .ok_or_else(|| QueryError::UnknownRelation {
                        name: qualifier.to_string(),
                    })?;
                self.bind_to(index, &column.name.value)?
            }
            None => {
                let unresolved = || QueryError::UnresolvedColumn {
                    column: column.name.value.clone(),
                };
                if strict && self.touches_tde {
                    return Err(unresolved());
                }
                match self.entries.len() {
                    1 => self.bind_to(0, &column.name.value)?,
                    // Without TDE tables in scope every column is plain, wherever it lives.
                    n if n > 1 && !self.touches_tde => ColumnBinding {
                        source: ColumnSource::Relation {
                            index: 0,
                            table: self.entries[0].table.clone(),
                        },
                        descriptor: None,
                    },
                    _ => return Err(unresolved()),
                }
            }
        };

        column.bind(binding);
        Ok(())
    }

    fn resolve_expr(&self, expr: &mut Expr, strict: bool) -> Result<(), QueryError> {
        expr.try_for_each_column_mut(&mut |column| self.resolve(column, strict))
    }
}

/// Binds column references against a [`ColumnCatalog`].
pub struct Resolver<'c> {
    catalog: &'c ColumnCatalog,
    options: ResolverOptions,
}

impl<'c> Resolver<'c> {
    pub fn new(catalog: &'c ColumnCatalog, options: ResolverOptions) -> Self {
        Self { catalog, options }
    }

    /// Resolve every column reference of the statement in place.
    pub fn resolve(&self, statement: &mut ParsedStatement) -> Result<(), QueryError> {
        let scope = Scope::new(self.catalog, &statement.relations())?;
        let strict = self.options.strict_qualification;

        match statement {
            ParsedStatement::Select(select) => self.resolve_select(&scope, select, strict),
            ParsedStatement::Insert(insert) => {
                for column in &mut insert.columns {
                    scope.resolve(column, false)?;
                }
                if let InsertSource::Values(rows) = &mut insert.source {
                    for value in rows.iter_mut().flatten() {
                        scope.resolve_expr(value, false)?;
                    }
                }
                Ok(())
            }
            ParsedStatement::Update(update) => {
                for assignment in &mut update.assignments {
                    scope.resolve(&mut assignment.column, false)?;
                    scope.resolve_expr(&mut assignment.value, strict)?;
                }
                if let Some(selection) = &mut update.selection {
                    scope.resolve_expr(selection, strict)?;
                }
                Ok(())
            }
        }
    }

    fn resolve_select(
        &self,
        scope: &Scope<'_>,
        select: &mut SelectStatement,
        strict: bool,
    ) -> Result<(), QueryError> {
        for item in &mut select.projection {
            if let SelectItem::Expr { expr, .. } = item {
                scope.resolve_expr(expr, strict)?;
            }
        }
        check_output_names(&select.projection)?;

        for item in &mut select.from {
            for join in &mut item.joins {
                scope.resolve_expr(&mut join.on, strict)?;
            }
        }
        if let Some(selection) = &mut select.selection {
            scope.resolve_expr(selection, strict)?;
        }
        for expr in &mut select.group_by {
            scope.resolve_expr(expr, strict)?;
        }

        for position in 0..select.order_by.len() {
            if let Some(binding) = output_alias_binding(select, position) {
                if let Expr::Column(column) = &mut select.order_by[position].expr {
                    column.bind(binding);
                }
                continue;
            }
            scope.resolve_expr(&mut select.order_by[position].expr, strict)?;
        }
        Ok(())
    }
}

fn check_output_names(projection: &[SelectItem]) -> Result<(), QueryError> {
    let mut seen = HashSet::new();
    for name in projection.iter().filter_map(SelectItem::output_name) {
        if !seen.insert(name) {
            return Err(QueryError::AmbiguousOutputColumn {
                column: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Binding for an ORDER BY item that names an aliased output column.
fn output_alias_binding(select: &SelectStatement, position: usize) -> Option<ColumnBinding> {
    let Expr::Column(column) = &select.order_by[position].expr else {
        return None;
    };
    if !column.qualifier.is_empty() {
        return None;
    }

    select
        .projection
        .iter()
        .enumerate()
        .find_map(|(output, item)| match item {
            SelectItem::Expr {
                expr,
                alias: Some(alias),
            } if alias.value == column.name.value => Some(ColumnBinding {
                source: ColumnSource::Output { position: output },
                descriptor: expr.as_column().and_then(|c| c.descriptor().cloned()),
            }),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::StatementParser;
    use pretty_assertions::assert_eq;
    use tde_core::catalog::{ColumnDescriptor, ColumnMode};

    fn catalog() -> ColumnCatalog {
        ColumnCatalog::empty()
            .with_table(TableSchema::new(
                "cities",
                vec![
                    ColumnDescriptor::new("cities", "id", ColumnMode::Joinable),
                    ColumnDescriptor::new("cities", "name", ColumnMode::BlindIndexed),
                    ColumnDescriptor::new("cities", "population", ColumnMode::Plain),
                ],
            ))
            .with_table(TableSchema::new(
                "city2region",
                vec![
                    ColumnDescriptor::new("city2region", "id", ColumnMode::Joinable),
                    ColumnDescriptor::new("city2region", "region", ColumnMode::Encrypted),
                ],
            ))
    }

    fn resolve(sql: &str, strict: bool) -> Result<ParsedStatement, QueryError> {
        let catalog = catalog();
        let mut statement = StatementParser::new().parse(sql)?;
        Resolver::new(
            &catalog,
            ResolverOptions {
                strict_qualification: strict,
            },
        )
        .resolve(&mut statement)?;
        Ok(statement)
    }

    fn projected_modes(statement: &ParsedStatement) -> Vec<ColumnMode> {
        let ParsedStatement::Select(select) = statement else {
            panic!("expected SELECT");
        };
        select
            .projection
            .iter()
            .map(|item| match item {
                SelectItem::Expr { expr, .. } => expr.as_column().unwrap().mode(),
                SelectItem::Wildcard { .. } => panic!("unexpected wildcard"),
            })
            .collect()
    }

    #[test]
    fn test_single_relation_binds_unqualified() {
        let statement = resolve("SELECT id, name, population FROM cities", false).unwrap();
        assert_eq!(
            projected_modes(&statement),
            vec![ColumnMode::Joinable, ColumnMode::BlindIndexed, ColumnMode::Plain]
        );
    }

    #[test]
    fn test_alias_qualifier() {
        let statement = resolve(
            "SELECT c.id, r.region FROM cities c JOIN city2region r ON c.id = r.id",
            false,
        )
        .unwrap();
        assert_eq!(
            projected_modes(&statement),
            vec![ColumnMode::Joinable, ColumnMode::Encrypted]
        );
    }

    #[test]
    fn test_unqualified_with_two_relations() {
        let err = resolve(
            "SELECT id FROM cities c JOIN city2region r ON c.id = r.id",
            false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            QueryError::UnresolvedColumn {
                column: "id".to_string()
            }
        );
    }

    #[test]
    fn test_strict_mode_requires_qualifier() {
        let err = resolve("SELECT id FROM cities", true).unwrap_err();
        assert!(matches!(err, QueryError::UnresolvedColumn { .. }));
        assert!(resolve("SELECT c.id FROM cities c", true).is_ok());
    }

    #[test]
    fn test_plain_tables_resolve_freely() {
        assert!(resolve("SELECT a FROM t JOIN u ON t.x = u.x", true).is_ok());
    }

    #[test]
    fn test_unknown_relation_and_column() {
        assert_eq!(
            resolve("SELECT x.id FROM cities", false).unwrap_err(),
            QueryError::UnknownRelation {
                name: "x".to_string()
            }
        );
        assert_eq!(
            resolve("SELECT missing FROM cities", false).unwrap_err(),
            QueryError::UnknownColumn {
                table: "cities".to_string(),
                column: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_ambiguous_output_names() {
        let err = resolve(
            "SELECT c.id, r.id FROM cities c JOIN city2region r ON c.id = r.id",
            false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            QueryError::AmbiguousOutputColumn {
                column: "id".to_string()
            }
        );
        assert!(
            resolve(
                "SELECT c.id, r.id AS region_id FROM cities c JOIN city2region r ON c.id = r.id",
                false
            )
            .is_ok()
        );
    }

    #[test]
    fn test_order_by_output_alias() {
        let statement = resolve("SELECT name AS n FROM cities ORDER BY n", false).unwrap();
        let ParsedStatement::Select(select) = statement else {
            panic!("expected SELECT");
        };
        let column = select.order_by[0].expr.as_column().unwrap();
        assert_eq!(column.mode(), ColumnMode::BlindIndexed);
        assert_eq!(
            column.binding().unwrap().source,
            ColumnSource::Output { position: 0 }
        );
    }

    #[test]
    fn test_group_by_binds_input_columns() {
        let statement = resolve(
            "SELECT c.name, count(c.id) AS n FROM cities c GROUP BY c.name",
            true,
        )
        .unwrap();
        let ParsedStatement::Select(select) = statement else {
            panic!("expected SELECT");
        };
        let column = select.group_by[0].as_column().unwrap();
        assert_eq!(column.mode(), ColumnMode::BlindIndexed);
        assert!(matches!(
            resolve("SELECT c.name FROM cities c GROUP BY name", true),
            Err(QueryError::UnresolvedColumn { .. })
        ));
    }

    #[test]
    fn test_insert_and_update_targets() {
        assert!(resolve("INSERT INTO cities (id, name) VALUES (1, 'a')", true).is_ok());
        assert!(matches!(
            resolve("UPDATE cities SET nope = 1", false),
            Err(QueryError::UnknownColumn { .. })
        ));
    }
}
