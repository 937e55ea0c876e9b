//! SQL parsing.
//!
//! Wraps `sqlparser` with the PostgreSQL dialect and lowers the resulting AST
//! into [`ParsedStatement`]. Constructs the rewriter cannot faithfully express
//! are rejected here rather than passed through.

use sqlparser::ast::{
    AssignmentTarget, BinaryOperator, Distinct, Expr as SqlExpr, GroupByExpr, Ident, Insert,
    JoinConstraint, JoinOperator, LimitClause, ObjectName, ObjectNamePart, OrderByKind, Query,
    Select, SelectItem as SqlSelectItem, SetExpr, Statement, TableFactor, TableObject,
    UnaryOperator, Update, Value, ValueWithSpan, visit_expressions, visit_relations,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::ops::ControlFlow;

use crate::ast::{
    Assignment, ColumnRef, ComparisonOp, Expr, FromItem, InsertSource, InsertStatement, Join,
    JoinKind, Literal, LogicalOp, OrderItem, ParsedStatement, RelationBinding, SelectItem,
    SelectStatement, UpdateStatement,
};
use crate::error::QueryError;

/// Coarse classification of a parsed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    /// Session and transaction control (`SET`, `SHOW`, `BEGIN`, `COMMIT`, `ROLLBACK`).
    Utility,
    Other,
}

impl SqlOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            SqlOperation::Select => "SELECT",
            SqlOperation::Insert => "INSERT",
            SqlOperation::Update => "UPDATE",
            SqlOperation::Delete => "DELETE",
            SqlOperation::Ddl => "DDL",
            SqlOperation::Utility => "UTILITY",
            SqlOperation::Other => "OTHER",
        }
    }
}

/// Parses client SQL into the pipeline's statement model.
#[derive(Debug)]
pub struct StatementParser {
    dialect: PostgreSqlDialect,
}

impl Clone for StatementParser {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl Default for StatementParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementParser {
    pub fn new() -> Self {
        Self {
            dialect: PostgreSqlDialect {},
        }
    }

    /// Parse exactly one statement.
    pub fn parse_single(&self, sql: &str) -> Result<Statement, QueryError> {
        let mut statements =
            Parser::parse_sql(&self.dialect, sql).map_err(|e| QueryError::Parse(e.to_string()))?;

        match statements.len() {
            0 => Err(QueryError::Parse("empty query".to_string())),
            1 => Ok(statements.remove(0)),
            n => Err(QueryError::Unsupported(format!(
                "expected a single statement, got {n}"
            ))),
        }
    }

    /// Parse and lower one statement.
    pub fn parse(&self, sql: &str) -> Result<ParsedStatement, QueryError> {
        let statement = self.parse_single(sql)?;
        lower_statement(statement)
    }
}

/// Classify a statement.
pub fn operation(statement: &Statement) -> SqlOperation {
    match statement {
        Statement::Query(_) => SqlOperation::Select,
        Statement::Insert { .. } => SqlOperation::Insert,
        Statement::Update { .. } => SqlOperation::Update,
        Statement::Delete { .. } => SqlOperation::Delete,
        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::AlterTable { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. } => SqlOperation::Ddl,
        Statement::Set { .. }
        | Statement::ShowVariable { .. }
        | Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. } => SqlOperation::Utility,
        _ => SqlOperation::Other,
    }
}

/// Lower a parsed `sqlparser` statement.
pub fn lower_statement(statement: Statement) -> Result<ParsedStatement, QueryError> {
    reject_subqueries(&statement)?;

    match statement {
        Statement::Query(query) => Ok(ParsedStatement::Select(lower_query(*query)?)),
        Statement::Insert(insert) => Ok(ParsedStatement::Insert(lower_insert(insert)?)),
        Statement::Update(update) => Ok(ParsedStatement::Update(lower_update(update)?)),
        other => Err(QueryError::UnsupportedStatement(
            operation(&other).as_str().to_string(),
        )),
    }
}

fn unsupported(what: &str) -> QueryError {
    QueryError::Unsupported(what.to_string())
}

fn reject_subqueries(statement: &Statement) -> Result<(), QueryError> {
    let found = visit_expressions(statement, |expr| match expr {
        SqlExpr::Subquery(_) | SqlExpr::InSubquery { .. } | SqlExpr::Exists { .. } => {
            ControlFlow::Break(())
        }
        _ => ControlFlow::Continue(()),
    });

    if found.is_break() {
        return Err(unsupported("subqueries"));
    }
    Ok(())
}

fn lower_query(query: Query) -> Result<SelectStatement, QueryError> {
    if query.with.is_some() {
        return Err(unsupported("WITH clauses"));
    }
    if query.fetch.is_some() {
        return Err(unsupported("FETCH"));
    }
    if !query.locks.is_empty() {
        return Err(unsupported("locking clauses"));
    }

    let select = match *query.body {
        SetExpr::Select(select) => *select,
        SetExpr::SetOperation { .. } => return Err(unsupported("set operations")),
        _ => return Err(unsupported("query body")),
    };
    let mut statement = lower_select(select)?;

    if let Some(order_by) = query.order_by {
        let OrderByKind::Expressions(exprs) = order_by.kind else {
            return Err(unsupported("ORDER BY ALL"));
        };
        for item in exprs {
            statement.order_by.push(OrderItem {
                expr: lower_expr(item.expr)?,
                asc: item.options.asc,
                nulls_first: item.options.nulls_first,
            });
        }
    }

    match query.limit_clause {
        None => {}
        Some(LimitClause::LimitOffset {
            limit,
            offset,
            limit_by,
        }) => {
            if !limit_by.is_empty() {
                return Err(unsupported("LIMIT BY"));
            }
            statement.limit = limit.map(|e| e.to_string());
            statement.offset = offset.map(|o| o.value.to_string());
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            statement.limit = Some(limit.to_string());
            statement.offset = Some(offset.to_string());
        }
    }

    Ok(statement)
}

fn lower_select(select: Select) -> Result<SelectStatement, QueryError> {
    let distinct = match select.distinct {
        None => false,
        Some(Distinct::Distinct) => true,
        Some(_) => return Err(unsupported("DISTINCT ON")),
    };
    if select.into.is_some() {
        return Err(unsupported("SELECT INTO"));
    }
    if select.having.is_some() {
        return Err(unsupported("HAVING"));
    }
    let group_by = match select.group_by {
        GroupByExpr::Expressions(exprs, modifiers) if modifiers.is_empty() => exprs
            .into_iter()
            .map(lower_expr)
            .collect::<Result<Vec<_>, _>>()?,
        GroupByExpr::Expressions(..) => return Err(unsupported("GROUP BY modifiers")),
        GroupByExpr::All(_) => return Err(unsupported("GROUP BY ALL")),
    };

    let mut projection = Vec::with_capacity(select.projection.len());
    for item in select.projection {
        projection.push(match item {
            SqlSelectItem::UnnamedExpr(expr) => SelectItem::Expr {
                expr: lower_expr(expr)?,
                alias: None,
            },
            SqlSelectItem::ExprWithAlias { expr, alias } => SelectItem::Expr {
                expr: lower_expr(expr)?,
                alias: Some(alias),
            },
            wildcard => SelectItem::Wildcard {
                sql: wildcard.to_string(),
            },
        });
    }

    let mut from = Vec::with_capacity(select.from.len());
    for table in select.from {
        let relation = lower_relation(table.relation)?;
        let mut joins = Vec::with_capacity(table.joins.len());
        for join in table.joins {
            let (kind, constraint) = match join.join_operator {
                JoinOperator::Join(c) | JoinOperator::Inner(c) => (JoinKind::Inner, c),
                JoinOperator::Left(c) | JoinOperator::LeftOuter(c) => (JoinKind::Left, c),
                JoinOperator::Right(c) | JoinOperator::RightOuter(c) => (JoinKind::Right, c),
                JoinOperator::FullOuter(c) => (JoinKind::Full, c),
                _ => return Err(unsupported("join type")),
            };
            let JoinConstraint::On(on) = constraint else {
                return Err(unsupported("joins without an ON condition"));
            };
            joins.push(Join {
                relation: lower_relation(join.relation)?,
                kind,
                on: lower_expr(on)?,
            });
        }
        from.push(FromItem { relation, joins });
    }

    Ok(SelectStatement {
        distinct,
        projection,
        from,
        selection: select.selection.map(lower_expr).transpose()?,
        group_by,
        order_by: Vec::new(),
        limit: None,
        offset: None,
    })
}

fn lower_relation(factor: TableFactor) -> Result<RelationBinding, QueryError> {
    match factor {
        TableFactor::Table {
            name, alias, args, ..
        } => {
            if args.is_some() {
                return Err(unsupported("table functions"));
            }
            if alias.as_ref().is_some_and(|a| !a.columns.is_empty()) {
                return Err(unsupported("column aliases in FROM"));
            }
            Ok(RelationBinding {
                name: object_name_idents(name)?,
                alias: alias.map(|a| a.name),
            })
        }
        _ => Err(unsupported("derived tables and nested joins")),
    }
}

fn object_name_idents(name: ObjectName) -> Result<Vec<Ident>, QueryError> {
    name.0
        .into_iter()
        .map(|part| match part {
            ObjectNamePart::Identifier(ident) => Ok(ident),
            #[allow(unreachable_patterns)]
            _ => Err(unsupported("computed identifiers")),
        })
        .collect()
}

/// Bare name of a (possibly qualified) object, without quotes.
fn last_name_part(name: &ObjectName) -> String {
    match name.0.last() {
        Some(ObjectNamePart::Identifier(ident)) => ident.value.clone(),
        _ => name.to_string(),
    }
}

/// Rebuild an identifier from its rendered form, keeping double quotes.
fn ident_from_display(text: String) -> Ident {
    match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        Some(inner) => Ident::with_quote('"', inner.replace("\"\"", "\"")),
        None => Ident::new(text),
    }
}

fn lower_insert(insert: Insert) -> Result<InsertStatement, QueryError> {
    let TableObject::TableName(name) = insert.table else {
        return Err(unsupported("INSERT into table functions"));
    };
    if insert.returning.is_some() {
        return Err(unsupported("RETURNING"));
    }
    if insert.on.is_some() {
        return Err(unsupported("ON CONFLICT"));
    }

    let table = RelationBinding {
        name: object_name_idents(name)?,
        alias: None,
    };
    let columns = insert
        .columns
        .into_iter()
        .map(|c| ColumnRef::new(Vec::new(), ident_from_display(c.to_string())))
        .collect();

    let Some(query) = insert.source else {
        return Err(QueryError::BadInsert);
    };
    let query = *query;
    let source = if let SetExpr::Values(values) = query.body.as_ref()
        && query.order_by.is_none()
        && query.limit_clause.is_none()
    {
        let mut rows = Vec::with_capacity(values.rows.len());
        for row in values.rows.clone() {
            rows.push(row.into_iter().map(lower_expr).collect::<Result<Vec<_>, _>>()?);
        }
        InsertSource::Values(rows)
    } else {
        let mut tables = Vec::new();
        let _ = visit_relations(&query, |relation| {
            tables.push(last_name_part(relation));
            ControlFlow::<()>::Continue(())
        });
        InsertSource::Query {
            sql: query.to_string(),
            tables,
        }
    };

    Ok(InsertStatement {
        table,
        columns,
        source,
    })
}

fn lower_update(update: Update) -> Result<UpdateStatement, QueryError> {
    if update.from.is_some() {
        return Err(unsupported("UPDATE ... FROM"));
    }
    if update.returning.is_some() {
        return Err(unsupported("RETURNING"));
    }
    if !update.table.joins.is_empty() {
        return Err(unsupported("multi-table UPDATE"));
    }

    let table = lower_relation(update.table.relation)?;
    let mut assignments = Vec::with_capacity(update.assignments.len());
    for assignment in update.assignments {
        let AssignmentTarget::ColumnName(target) = assignment.target else {
            return Err(unsupported("tuple assignments"));
        };
        let mut parts = object_name_idents(target)?;
        let Some(name) = parts.pop() else {
            return Err(QueryError::Parse("empty assignment target".to_string()));
        };
        assignments.push(Assignment {
            column: ColumnRef::new(parts, name),
            value: lower_expr(assignment.value)?,
        });
    }

    Ok(UpdateStatement {
        table,
        assignments,
        selection: update.selection.map(lower_expr).transpose()?,
    })
}

fn comparison_op(op: &BinaryOperator) -> Option<ComparisonOp> {
    match op {
        BinaryOperator::Eq => Some(ComparisonOp::Eq),
        BinaryOperator::NotEq => Some(ComparisonOp::NotEq),
        BinaryOperator::Lt => Some(ComparisonOp::Lt),
        BinaryOperator::LtEq => Some(ComparisonOp::LtEq),
        BinaryOperator::Gt => Some(ComparisonOp::Gt),
        BinaryOperator::GtEq => Some(ComparisonOp::GtEq),
        _ => None,
    }
}

fn lower_expr(expr: SqlExpr) -> Result<Expr, QueryError> {
    match expr {
        SqlExpr::Identifier(ident) if is_default_keyword(&ident) => Ok(Expr::Other {
            sql: ident.to_string(),
            columns: Vec::new(),
        }),
        SqlExpr::Identifier(ident) => Ok(Expr::Column(ColumnRef::new(Vec::new(), ident))),
        SqlExpr::CompoundIdentifier(mut parts) => {
            let Some(name) = parts.pop() else {
                return Err(QueryError::Parse("empty identifier".to_string()));
            };
            if parts.len() > 2 {
                return Err(unsupported("identifiers with more than three parts"));
            }
            Ok(Expr::Column(ColumnRef::new(parts, name)))
        }
        SqlExpr::Value(value) => Ok(lower_value(value)),
        SqlExpr::Nested(inner) => Ok(Expr::Nested(Box::new(lower_expr(*inner)?))),
        SqlExpr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(Expr::Not(Box::new(lower_expr(*expr)?))),
        SqlExpr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match *expr {
            SqlExpr::Value(ValueWithSpan {
                value: Value::Number(n, _),
                ..
            }) => Ok(Expr::Literal(Literal::Number(format!("-{n}")))),
            inner => Ok(opaque(SqlExpr::UnaryOp {
                op: UnaryOperator::Minus,
                expr: Box::new(inner),
            })),
        },
        SqlExpr::BinaryOp { left, op, right } => {
            if let Some(op) = comparison_op(&op) {
                return Ok(Expr::Comparison {
                    left: Box::new(lower_expr(*left)?),
                    op,
                    right: Box::new(lower_expr(*right)?),
                });
            }
            let logical = match op {
                BinaryOperator::And => LogicalOp::And,
                BinaryOperator::Or => LogicalOp::Or,
                op => return Ok(opaque(SqlExpr::BinaryOp { left, op, right })),
            };
            Ok(Expr::Logical {
                left: Box::new(lower_expr(*left)?),
                op: logical,
                right: Box::new(lower_expr(*right)?),
            })
        }
        other => Ok(opaque(other)),
    }
}

fn lower_value(value: ValueWithSpan) -> Expr {
    match value.value {
        Value::Null => Expr::Literal(Literal::Null),
        Value::Boolean(b) => Expr::Literal(Literal::Boolean(b)),
        Value::Number(n, _) => Expr::Literal(Literal::Number(n)),
        Value::SingleQuotedString(s) => Expr::Literal(Literal::String(s)),
        other => Expr::Other {
            sql: other.to_string(),
            columns: Vec::new(),
        },
    }
}

fn is_default_keyword(ident: &Ident) -> bool {
    ident.quote_style.is_none() && ident.value.eq_ignore_ascii_case("DEFAULT")
}

/// Keep an expression verbatim, remembering the columns it reads.
fn opaque(expr: SqlExpr) -> Expr {
    let mut columns = Vec::new();
    let _ = visit_expressions(&expr, |e| {
        match e {
            SqlExpr::Identifier(ident) if !is_default_keyword(ident) => {
                columns.push(ColumnRef::new(Vec::new(), ident.clone()));
            }
            SqlExpr::CompoundIdentifier(parts) => {
                if let Some((name, qualifier)) = parts.split_last() {
                    columns.push(ColumnRef::new(qualifier.to_vec(), name.clone()));
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });

    Expr::Other {
        sql: expr.to_string(),
        columns,
    }
}
