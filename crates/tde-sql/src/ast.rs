//! Statement model shared by every pipeline stage.
//!
//! The parser lowers `sqlparser` output into these types; the resolver fills in
//! column bindings; the rewriter mutates them in place; `Display` renders the
//! SQL sent upstream. Expressions the pipeline never needs to look inside are
//! kept as [`Expr::Other`] with their original text and the column references
//! they contain.

use sqlparser::ast::Ident;
use std::fmt;
use std::sync::Arc;
use tde_core::catalog::{ColumnDescriptor, ColumnMode};
use tde_crypto::encode_bytea;

/// Statement kinds the pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    /// Forwarded unchanged (`SET`, `BEGIN`, ...).
    Utility,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedStatement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
}

impl ParsedStatement {
    pub fn kind(&self) -> StatementKind {
        match self {
            ParsedStatement::Select(_) => StatementKind::Select,
            ParsedStatement::Insert(_) => StatementKind::Insert,
            ParsedStatement::Update(_) => StatementKind::Update,
        }
    }

    /// Relations in scope, in declaration order. Binding indices refer to this order.
    pub fn relations(&self) -> Vec<&RelationBinding> {
        match self {
            ParsedStatement::Select(select) => select.relations(),
            ParsedStatement::Insert(insert) => vec![&insert.table],
            ParsedStatement::Update(update) => vec![&update.table],
        }
    }
}

/// A table in FROM/JOIN, or the target of INSERT/UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationBinding {
    /// Name parts as written (`schema.table` or `table`).
    pub name: Vec<Ident>,
    pub alias: Option<Ident>,
}

impl RelationBinding {
    /// Bare table name used for catalog lookups.
    pub fn table(&self) -> &str {
        self.name.last().map(|i| i.value.as_str()).unwrap_or_default()
    }

    /// Alias if present, table name otherwise.
    pub fn effective_name(&self) -> &str {
        match &self.alias {
            Some(alias) => &alias.value,
            None => self.table(),
        }
    }
}

impl fmt::Display for RelationBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_dotted(f, &self.name)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {alias}")?;
        }
        Ok(())
    }
}

/// Where a resolved column reference points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// A column of the relation at `index` in the statement's scope.
    Relation { index: usize, table: String },
    /// An output column referenced by alias (ORDER BY).
    Output { position: usize },
}

/// Resolution result attached to a [`ColumnRef`].
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBinding {
    pub source: ColumnSource,
    /// Catalog entry; `None` for columns of tables outside the catalog.
    pub descriptor: Option<Arc<ColumnDescriptor>>,
}

impl ColumnBinding {
    pub fn mode(&self) -> ColumnMode {
        self.descriptor
            .as_ref()
            .map(|d| d.mode)
            .unwrap_or(ColumnMode::Plain)
    }
}

/// A column reference, optionally qualified.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub qualifier: Vec<Ident>,
    pub name: Ident,
    binding: Option<ColumnBinding>,
}

impl ColumnRef {
    pub fn new(qualifier: Vec<Ident>, name: Ident) -> Self {
        Self {
            qualifier,
            name,
            binding: None,
        }
    }

    /// The relation name the qualifier points at (last qualifier part).
    pub fn qualifier_name(&self) -> Option<&str> {
        self.qualifier.last().map(|i| i.value.as_str())
    }

    pub fn binding(&self) -> Option<&ColumnBinding> {
        self.binding.as_ref()
    }

    /// Attach the resolution result. A reference is resolved exactly once.
    pub fn bind(&mut self, binding: ColumnBinding) {
        debug_assert!(self.binding.is_none(), "column {} bound twice", self.name);
        self.binding = Some(binding);
    }

    pub fn is_resolved(&self) -> bool {
        self.binding.is_some()
    }

    /// Mode of the referenced column; unresolved or uncatalogued columns are plain.
    pub fn mode(&self) -> ColumnMode {
        self.binding
            .as_ref()
            .map(ColumnBinding::mode)
            .unwrap_or(ColumnMode::Plain)
    }

    pub fn descriptor(&self) -> Option<&Arc<ColumnDescriptor>> {
        self.binding.as_ref().and_then(|b| b.descriptor.as_ref())
    }

    /// Same reference pointing at another physical column of the same relation.
    pub fn renamed(&self, column: &str) -> Self {
        let mut name = self.name.clone();
        name.value = column.to_string();
        Self {
            qualifier: self.qualifier.clone(),
            name,
            binding: self.binding.clone(),
        }
    }

    /// `(relation index, column name)` for columns read from a relation.
    pub fn relation_key(&self) -> Option<(usize, &str)> {
        match self.binding.as_ref().map(|b| &b.source) {
            Some(ColumnSource::Relation { index, .. }) => Some((*index, self.name.value.as_str())),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.qualifier {
            write!(f, "{part}.")?;
        }
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    /// Numeric literal kept in its source spelling.
    Number(String),
    String(String),
    /// Produced by the rewriter; rendered as a hex bytea literal.
    Bytes(Vec<u8>),
}

impl Literal {
    /// Bytes handed to the codec. `None` for NULL, which is never encrypted.
    pub fn plaintext(&self) -> Option<Vec<u8>> {
        match self {
            Literal::Null => None,
            Literal::Boolean(b) => Some(b.to_string().into_bytes()),
            Literal::Number(n) => Some(n.clone().into_bytes()),
            Literal::String(s) => Some(s.clone().into_bytes()),
            Literal::Bytes(b) => Some(b.clone()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("NULL"),
            Literal::Boolean(true) => f.write_str("true"),
            Literal::Boolean(false) => f.write_str("false"),
            Literal::Number(n) => f.write_str(n),
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Bytes(b) => write!(f, "'{}'", encode_bytea(b)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::LtEq => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::GtEq => ">=",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
        })
    }
}

/// Predicate and value expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Literal(Literal),
    Comparison {
        left: Box<Expr>,
        op: ComparisonOp,
        right: Box<Expr>,
    },
    Logical {
        left: Box<Expr>,
        op: LogicalOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Nested(Box<Expr>),
    /// Any other expression, rendered verbatim.
    Other { sql: String, columns: Vec<ColumnRef> },
}

impl Expr {
    pub fn as_column(&self) -> Option<&ColumnRef> {
        match self {
            Expr::Column(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Expr::Literal(l) => Some(l),
            _ => None,
        }
    }

    /// Column references in pre-order, left to right.
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a ColumnRef>) {
        match self {
            Expr::Column(c) => out.push(c),
            Expr::Literal(_) => {}
            Expr::Comparison { left, right, .. } | Expr::Logical { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Not(inner) | Expr::Nested(inner) => inner.collect_columns(out),
            Expr::Other { columns, .. } => out.extend(columns.iter()),
        }
    }

    /// Visit every column reference mutably, in the same order as [`columns`](Self::columns).
    pub fn try_for_each_column_mut<E>(
        &mut self,
        f: &mut impl FnMut(&mut ColumnRef) -> Result<(), E>,
    ) -> Result<(), E> {
        match self {
            Expr::Column(c) => f(c),
            Expr::Literal(_) => Ok(()),
            Expr::Comparison { left, right, .. } | Expr::Logical { left, right, .. } => {
                left.try_for_each_column_mut(f)?;
                right.try_for_each_column_mut(f)
            }
            Expr::Not(inner) | Expr::Nested(inner) => inner.try_for_each_column_mut(f),
            Expr::Other { columns, .. } => columns.iter_mut().try_for_each(f),
        }
    }

    /// First reference to an encrypted column, if any.
    pub fn first_encrypted_column(&self) -> Option<&ColumnRef> {
        self.columns().into_iter().find(|c| c.mode().is_encrypted())
    }

    fn is_compound(&self) -> bool {
        matches!(self, Expr::Comparison { .. } | Expr::Logical { .. })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{c}"),
            Expr::Literal(l) => write!(f, "{l}"),
            Expr::Comparison { left, op, right } => {
                write_operand(f, left, left.is_compound())?;
                write!(f, " {op} ")?;
                write_operand(f, right, right.is_compound())
            }
            Expr::Logical { left, op, right } => {
                let needs_parens = |e: &Expr| {
                    *op == LogicalOp::And
                        && matches!(e, Expr::Logical { op: LogicalOp::Or, .. })
                };
                write_operand(f, left, needs_parens(left))?;
                write!(f, " {op} ")?;
                write_operand(f, right, needs_parens(right))
            }
            Expr::Not(inner) => {
                f.write_str("NOT ")?;
                write_operand(f, inner, inner.is_compound())
            }
            Expr::Nested(inner) => write!(f, "({inner})"),
            Expr::Other { sql, .. } => f.write_str(sql),
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, parens: bool) -> fmt::Result {
    if parens {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

fn write_dotted(f: &mut fmt::Formatter<'_>, parts: &[Ident]) -> fmt::Result {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(".")?;
        }
        write!(f, "{part}")?;
    }
    Ok(())
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*` or `t.*`, kept as written.
    Wildcard { sql: String },
    Expr { expr: Expr, alias: Option<Ident> },
}

impl SelectItem {
    /// Name of the output column, when it has one.
    pub fn output_name(&self) -> Option<&str> {
        match self {
            SelectItem::Wildcard { .. } => None,
            SelectItem::Expr {
                alias: Some(alias), ..
            } => Some(&alias.value),
            SelectItem::Expr {
                expr: Expr::Column(c),
                ..
            } => Some(&c.name.value),
            SelectItem::Expr { .. } => None,
        }
    }
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectItem::Wildcard { sql } => f.write_str(sql),
            SelectItem::Expr { expr, alias: None } => write!(f, "{expr}"),
            SelectItem::Expr {
                expr,
                alias: Some(alias),
            } => write!(f, "{expr} AS {alias}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub relation: RelationBinding,
    pub kind: JoinKind,
    pub on: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FromItem {
    pub relation: RelationBinding,
    pub joins: Vec<Join>,
}

impl fmt::Display for FromItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relation)?;
        for join in &self.joins {
            write!(f, " {} {} ON {}", join.kind, join.relation, join.on)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub asc: Option<bool>,
    pub nulls_first: Option<bool>,
}

impl fmt::Display for OrderItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        match self.asc {
            Some(true) => f.write_str(" ASC")?,
            Some(false) => f.write_str(" DESC")?,
            None => {}
        }
        match self.nulls_first {
            Some(true) => f.write_str(" NULLS FIRST")?,
            Some(false) => f.write_str(" NULLS LAST")?,
            None => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub distinct: bool,
    pub projection: Vec<SelectItem>,
    pub from: Vec<FromItem>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderItem>,
    /// LIMIT and OFFSET operands, as written.
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl SelectStatement {
    pub fn relations(&self) -> Vec<&RelationBinding> {
        self.from
            .iter()
            .flat_map(|item| {
                std::iter::once(&item.relation).chain(item.joins.iter().map(|j| &j.relation))
            })
            .collect()
    }

    pub fn joins(&self) -> impl Iterator<Item = &Join> {
        self.from.iter().flat_map(|item| item.joins.iter())
    }

    pub fn has_wildcard(&self) -> bool {
        self.projection
            .iter()
            .any(|item| matches!(item, SelectItem::Wildcard { .. }))
    }
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        if self.distinct {
            f.write_str("DISTINCT ")?;
        }
        write_list(f, &self.projection)?;
        if !self.from.is_empty() {
            f.write_str(" FROM ")?;
            write_list(f, &self.from)?;
        }
        if let Some(selection) = &self.selection {
            write!(f, " WHERE {selection}")?;
        }
        if !self.group_by.is_empty() {
            f.write_str(" GROUP BY ")?;
            write_list(f, &self.group_by)?;
        }
        if !self.order_by.is_empty() {
            f.write_str(" ORDER BY ")?;
            write_list(f, &self.order_by)?;
        }
        if let Some(limit) = &self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        if let Some(offset) = &self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    Values(Vec<Vec<Expr>>),
    /// `INSERT ... SELECT`, kept verbatim with the tables it reads.
    Query { sql: String, tables: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: RelationBinding,
    pub columns: Vec<ColumnRef>,
    pub source: InsertSource,
}

impl fmt::Display for InsertStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INSERT INTO {}", self.table)?;
        if !self.columns.is_empty() {
            f.write_str(" (")?;
            write_list(f, &self.columns)?;
            f.write_str(")")?;
        }
        match &self.source {
            InsertSource::Values(rows) => {
                f.write_str(" VALUES ")?;
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str("(")?;
                    write_list(f, row)?;
                    f.write_str(")")?;
                }
                Ok(())
            }
            InsertSource::Query { sql, .. } => write!(f, " {sql}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: ColumnRef,
    pub value: Expr,
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Postgres rejects qualified SET targets.
        write!(f, "{} = {}", self.column.name, self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: RelationBinding,
    pub assignments: Vec<Assignment>,
    pub selection: Option<Expr>,
}

impl fmt::Display for UpdateStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UPDATE {} SET ", self.table)?;
        write_list(f, &self.assignments)?;
        if let Some(selection) = &self.selection {
            write!(f, " WHERE {selection}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ParsedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedStatement::Select(s) => write!(f, "{s}"),
            ParsedStatement::Insert(s) => write!(f, "{s}"),
            ParsedStatement::Update(s) => write!(f, "{s}"),
        }
    }
}
