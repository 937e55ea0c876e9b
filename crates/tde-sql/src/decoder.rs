//! Decryption of result rows.

use std::sync::Arc;
use tde_core::catalog::ColumnDescriptor;
use tde_crypto::{EncryptionCodec, decode_bytea};

use crate::error::QueryError;

/// A result row in text format; `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// Output column of a rewritten SELECT.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub name: String,
    /// Set when the column holds ciphertext that must be decrypted.
    pub descriptor: Option<Arc<ColumnDescriptor>>,
}

impl OutputColumn {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.descriptor.is_some()
    }
}

/// Decrypts encrypted output columns positionally.
pub struct ResultDecoder<'a> {
    codec: &'a dyn EncryptionCodec,
}

impl<'a> ResultDecoder<'a> {
    pub fn new(codec: &'a dyn EncryptionCodec) -> Self {
        Self { codec }
    }

    pub fn decode_rows(
        &self,
        rows: Vec<Row>,
        columns: &[OutputColumn],
    ) -> Result<Vec<Row>, QueryError> {
        if !columns.iter().any(OutputColumn::is_encrypted) {
            return Ok(rows);
        }
        rows.into_iter()
            .map(|row| self.decode_row(row, columns))
            .collect()
    }

    fn decode_row(&self, mut row: Row, columns: &[OutputColumn]) -> Result<Row, QueryError> {
        for (cell, column) in row.iter_mut().zip(columns) {
            let (Some(descriptor), Some(text)) = (&column.descriptor, cell.as_ref()) else {
                continue;
            };
            *cell = Some(self.decode_cell(descriptor, text)?);
        }
        Ok(row)
    }

    fn decode_cell(&self, descriptor: &ColumnDescriptor, text: &str) -> Result<String, QueryError> {
        let failed = |reason: String| QueryError::DecodeFailed {
            table: descriptor.table.clone(),
            column: descriptor.column.clone(),
            reason,
        };

        let ciphertext = decode_bytea(text).map_err(|e| failed(e.to_string()))?;
        let plaintext = self
            .codec
            .decrypt(descriptor, &ciphertext)
            .map_err(|e| failed(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| failed(e.to_string()))
    }
}
