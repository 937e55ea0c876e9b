//! Post-filtering of bucket joins.
//!
//! Join buckets are short digests, so distinct values can share a bucket and
//! the database returns rows that do not satisfy the original `a = b`. Both
//! join columns are projected; this module decrypts them and drops the rows
//! whose plaintexts differ.

use std::sync::Arc;
use tde_core::catalog::ColumnDescriptor;
use tde_crypto::{EncryptionCodec, decode_bytea};
use tracing::debug;

use crate::decoder::Row;
use crate::error::QueryError;

/// One side of a bucket join, located in the result row.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSide {
    /// Zero-based output column index.
    pub position: usize,
    pub descriptor: Arc<ColumnDescriptor>,
}

/// A bucket join whose result rows must be re-checked.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub left: JoinSide,
    pub right: JoinSide,
}

/// Drops rows admitted only by a bucket collision.
pub struct JoinBucketFilter<'a> {
    codec: &'a dyn EncryptionCodec,
}

impl<'a> JoinBucketFilter<'a> {
    pub fn new(codec: &'a dyn EncryptionCodec) -> Self {
        Self { codec }
    }

    /// Keep the rows whose join columns decrypt to equal, non-NULL values.
    pub fn filter(&self, rows: Vec<Row>, joins: &[JoinSpec]) -> Result<Vec<Row>, QueryError> {
        if joins.is_empty() {
            return Ok(rows);
        }

        let total = rows.len();
        let mut kept = Vec::with_capacity(total);
        for row in rows {
            if self.matches(&row, joins)? {
                kept.push(row);
            }
        }

        let discarded = total - kept.len();
        if discarded > 0 {
            debug!(discarded, kept = kept.len(), "Dropped join bucket collisions");
        }
        Ok(kept)
    }

    fn matches(&self, row: &Row, joins: &[JoinSpec]) -> Result<bool, QueryError> {
        for join in joins {
            let left = self.plaintext(row, &join.left)?;
            let right = self.plaintext(row, &join.right)?;
            match (left, right) {
                (Some(l), Some(r)) if l == r => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn plaintext(&self, row: &Row, side: &JoinSide) -> Result<Option<Vec<u8>>, QueryError> {
        let Some(Some(cell)) = row.get(side.position) else {
            return Ok(None);
        };
        let descriptor = &side.descriptor;
        let decode_failed = |reason: String| QueryError::DecodeFailed {
            table: descriptor.table.clone(),
            column: descriptor.column.clone(),
            reason,
        };

        let ciphertext = decode_bytea(cell).map_err(|e| decode_failed(e.to_string()))?;
        self.codec
            .decrypt(descriptor, &ciphertext)
            .map(Some)
            .map_err(|e| decode_failed(e.to_string()))
    }
}
