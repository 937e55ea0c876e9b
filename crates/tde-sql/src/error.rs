//! Error types for statement processing.
//!
//! Every message is surfaced verbatim to the client, so the texts below are
//! part of the proxy's observable contract.

use thiserror::Error;

/// Stage of the pipeline an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Resolution,
    Structural,
    Classification,
    Rewrite,
}

/// Terminal rejection of a statement.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// SQL text could not be parsed.
    #[error("postgres_tde: failed to parse SQL: {0}")]
    Parse(String),

    /// Statement kind is not handled.
    #[error("postgres_tde: unsupported statement: {0}")]
    UnsupportedStatement(String),

    /// Statement uses a construct the rewriter cannot express.
    #[error("postgres_tde: unsupported SQL: {0}")]
    Unsupported(String),

    /// Unqualified column with several relations in scope.
    #[error(
        "postgres_tde: unable to determine the source of column {column}. Please specify an explicit table/alias reference"
    )]
    UnresolvedColumn { column: String },

    /// Qualifier names no relation in scope.
    #[error("postgres_tde: unknown table or alias {name}")]
    UnknownRelation { name: String },

    /// Column missing from a catalogued table.
    #[error("postgres_tde: column {table}.{column} is not defined")]
    UnknownColumn { table: String, column: String },

    /// Two output columns share a name.
    #[error(
        "postgres_tde: detected ambiguous column name {column}. Please specify a different alias for each column"
    )]
    AmbiguousOutputColumn { column: String },

    #[error("postgres_tde: star expression is not supported")]
    StarExpression,

    #[error("postgres_tde: columns definition for INSERT is required for TDE-enabled tables")]
    MissingInsertColumns,

    #[error("postgres_tde: INSERT INTO SELECT is not supported for TDE-enabled tables")]
    InsertSelect,

    /// VALUES row length differs from the column list.
    #[error("postgres_tde: bad INSERT statement")]
    BadInsert,

    #[error("postgres_tde: only literals can be used as INSERT values for encrypted columns")]
    NonLiteralInsert,

    #[error("postgres_tde: only literals can be used as UPDATE values for blind-indexed columns")]
    NonLiteralUpdate,

    #[error("postgres_tde: columns present in join condition must be also present in SELECT body")]
    JoinColumnsNotSelected,

    /// Encrypted column used in a way its mode does not permit.
    #[error("postgres_tde: invalid use of encrypted column {table}.{column}")]
    InvalidEncryptedUse { table: String, column: String },

    /// Codec failed while producing a rewritten value.
    #[error("postgres_tde: failed to encode value for column {table}.{column}: {reason}")]
    EncodeFailed {
        table: String,
        column: String,
        reason: String,
    },

    /// Codec failed while decoding a result cell.
    #[error("postgres_tde: failed to decode column {table}.{column}: {reason}")]
    DecodeFailed {
        table: String,
        column: String,
        reason: String,
    },
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::Parse(_)
            | QueryError::UnsupportedStatement(_)
            | QueryError::Unsupported(_) => ErrorKind::Parse,
            QueryError::UnresolvedColumn { .. }
            | QueryError::UnknownRelation { .. }
            | QueryError::UnknownColumn { .. }
            | QueryError::AmbiguousOutputColumn { .. } => ErrorKind::Resolution,
            QueryError::StarExpression
            | QueryError::MissingInsertColumns
            | QueryError::InsertSelect
            | QueryError::BadInsert
            | QueryError::NonLiteralInsert
            | QueryError::NonLiteralUpdate
            | QueryError::JoinColumnsNotSelected => ErrorKind::Structural,
            QueryError::InvalidEncryptedUse { .. } => ErrorKind::Classification,
            QueryError::EncodeFailed { .. } | QueryError::DecodeFailed { .. } => ErrorKind::Rewrite,
        }
    }

    pub(crate) fn invalid_use(table: &str, column: &str) -> Self {
        QueryError::InvalidEncryptedUse {
            table: table.to_string(),
            column: column.to_string(),
        }
    }
}
