//! # tde-sql
//!
//! SQL validation and rewriting for the Postgres TDE proxy.
//!
//! A client statement flows through these stages:
//!
//! 1. [`parser`]: parse with the PostgreSQL dialect and lower to [`ast`]
//! 2. [`resolver`]: bind every column reference to its relation and policy
//! 3. [`validator`]: structural rules (no `*`, explicit INSERT columns, ...)
//! 4. [`classifier`]: decide how each encrypted column use is answered
//! 5. [`rewriter`]: produce SQL for the physical layout
//!
//! Result rows come back through [`join_filter`] and [`decoder`].
//! [`QueryPipeline`] runs the whole sequence.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tde_sql::QueryPipeline;
//!
//! let pipeline = QueryPipeline::new(Arc::new(catalog), Arc::new(codec));
//! let rewritten = pipeline.process("SELECT c.id FROM cities c WHERE c.name = 'Moscow'")?;
//! // send rewritten.sql upstream, then:
//! let rows = pipeline.finish(&rewritten, rows)?;
//! ```

pub mod ast;
pub mod classifier;
pub mod decoder;
pub mod error;
pub mod join_filter;
pub mod parser;
pub mod pipeline;
pub mod resolver;
pub mod rewriter;
pub mod validator;

pub use ast::StatementKind;
pub use decoder::{OutputColumn, ResultDecoder, Row};
pub use error::{ErrorKind, QueryError};
pub use join_filter::{JoinBucketFilter, JoinSide, JoinSpec};
pub use parser::{SqlOperation, StatementParser};
pub use pipeline::{PipelineOptions, QueryPipeline, RewrittenStatement, RowWindow};
