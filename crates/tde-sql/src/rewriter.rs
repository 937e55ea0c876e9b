//! Statement rewriting.
//!
//! Turns a classified statement into one that runs against the physical
//! layout: WHERE lookups and GROUP BY move to the blind index column, bucket
//! joins move to the join key column, and written values are replaced with
//! ciphertext plus their auxiliary columns.

use tde_core::catalog::ColumnDescriptor;
use tde_crypto::{CryptoError, EncryptionCodec};

use crate::ast::{
    Assignment, ColumnRef, ComparisonOp, Expr, InsertSource, InsertStatement, Literal,
    ParsedStatement, SelectItem, SelectStatement, UpdateStatement,
};
use crate::error::QueryError;

fn encode_failed(descriptor: &ColumnDescriptor, error: CryptoError) -> QueryError {
    QueryError::EncodeFailed {
        table: descriptor.table.clone(),
        column: descriptor.column.clone(),
        reason: error.to_string(),
    }
}

fn missing_auxiliary(descriptor: &ColumnDescriptor, kind: &str) -> QueryError {
    QueryError::EncodeFailed {
        table: descriptor.table.clone(),
        column: descriptor.column.clone(),
        reason: format!("no {kind} column configured"),
    }
}

fn strip_nested_mut(expr: &mut Expr) -> &mut Expr {
    match expr {
        Expr::Nested(inner) => strip_nested_mut(inner),
        other => other,
    }
}

/// Physical values written for one encrypted column.
struct EncodedValue {
    ciphertext: Literal,
    blind_index: Option<Literal>,
    join_key: Option<Literal>,
}

/// Rewrites statements for the physical layout using an [`EncryptionCodec`].
pub struct Rewriter<'a> {
    codec: &'a dyn EncryptionCodec,
}

impl<'a> Rewriter<'a> {
    pub fn new(codec: &'a dyn EncryptionCodec) -> Self {
        Self { codec }
    }

    /// Rewrite a resolved, validated and classified statement in place.
    pub fn rewrite(&self, statement: &mut ParsedStatement) -> Result<(), QueryError> {
        match statement {
            ParsedStatement::Select(select) => {
                for item in &mut select.from {
                    for join in &mut item.joins {
                        self.rewrite_join(&mut join.on)?;
                    }
                }
                if let Some(selection) = &mut select.selection {
                    self.rewrite_where(selection)?;
                }
                self.rewrite_group_by(select)
            }
            ParsedStatement::Insert(insert) => self.rewrite_insert(insert),
            ParsedStatement::Update(update) => self.rewrite_update(update),
        }
    }

    fn rewrite_where(&self, expr: &mut Expr) -> Result<(), QueryError> {
        match expr {
            Expr::Logical { left, right, .. } => {
                self.rewrite_where(left)?;
                self.rewrite_where(right)
            }
            Expr::Nested(inner) => self.rewrite_where(inner),
            Expr::Comparison {
                left,
                op: ComparisonOp::Eq,
                right,
            } => {
                let (column, literal) = match (left.as_mut(), right.as_mut()) {
                    (Expr::Column(c), Expr::Literal(l)) | (Expr::Literal(l), Expr::Column(c)) => {
                        (c, l)
                    }
                    _ => return Ok(()),
                };
                if !column.mode().is_searchable() {
                    return Ok(());
                }
                let Some(descriptor) = column.descriptor().cloned() else {
                    return Ok(());
                };

                let target = descriptor
                    .blind_index_column()
                    .ok_or_else(|| missing_auxiliary(&descriptor, "blind index"))?;
                if let Some(plaintext) = literal.plaintext() {
                    let token = self
                        .codec
                        .blind_index(&descriptor, &plaintext)
                        .map_err(|e| encode_failed(&descriptor, e))?;
                    *literal = Literal::Bytes(token);
                }
                *column = column.renamed(target);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn rewrite_join(&self, on: &mut Expr) -> Result<(), QueryError> {
        let Expr::Comparison {
            left,
            op: ComparisonOp::Eq,
            right,
        } = strip_nested_mut(on)
        else {
            return Ok(());
        };
        let (Expr::Column(l), Expr::Column(r)) = (left.as_mut(), right.as_mut()) else {
            return Ok(());
        };
        if !(l.mode().is_joinable() && r.mode().is_joinable()) {
            return Ok(());
        }

        for column in [l, r] {
            let Some(descriptor) = column.descriptor().cloned() else {
                continue;
            };
            let target = descriptor
                .join_key_column()
                .ok_or_else(|| missing_auxiliary(&descriptor, "join key"))?;
            *column = column.renamed(target);
        }
        Ok(())
    }

    /// Group encrypted columns by their blind index.
    ///
    /// Rows of one group carry different ciphertexts of the same value, so a
    /// projected grouping column is reduced to any one of them.
    fn rewrite_group_by(&self, select: &mut SelectStatement) -> Result<(), QueryError> {
        let mut grouped: Vec<(usize, String)> = Vec::new();
        for expr in &mut select.group_by {
            let Expr::Column(column) = expr else {
                continue;
            };
            if !column.mode().is_searchable() {
                continue;
            }
            let Some(descriptor) = column.descriptor().cloned() else {
                continue;
            };
            let target = descriptor
                .blind_index_column()
                .ok_or_else(|| missing_auxiliary(&descriptor, "blind index"))?;
            if let Some((index, name)) = column.relation_key() {
                grouped.push((index, name.to_string()));
            }
            *column = column.renamed(target);
        }
        if grouped.is_empty() {
            return Ok(());
        }

        let is_grouped = |column: &ColumnRef| {
            column
                .relation_key()
                .is_some_and(|(i, n)| grouped.iter().any(|(gi, gn)| *gi == i && gn == n))
        };
        for item in &mut select.projection {
            let SelectItem::Expr { expr, alias } = item else {
                continue;
            };
            let Some(column) = expr.as_column().filter(|c| is_grouped(*c)).cloned() else {
                continue;
            };
            alias.get_or_insert_with(|| column.name.clone());
            *expr = Expr::Other {
                sql: format!("(array_agg({column}))[1]"),
                columns: vec![column],
            };
        }
        Ok(())
    }

    fn encode_value(
        &self,
        descriptor: &ColumnDescriptor,
        literal: &Literal,
    ) -> Result<EncodedValue, QueryError> {
        let Some(plaintext) = literal.plaintext() else {
            return Ok(EncodedValue {
                ciphertext: Literal::Null,
                blind_index: descriptor.mode.is_searchable().then_some(Literal::Null),
                join_key: descriptor.mode.is_joinable().then_some(Literal::Null),
            });
        };

        let ciphertext = self
            .codec
            .encrypt(descriptor, &plaintext)
            .map_err(|e| encode_failed(descriptor, e))?;
        let blind_index = if descriptor.mode.is_searchable() {
            let token = self
                .codec
                .blind_index(descriptor, &plaintext)
                .map_err(|e| encode_failed(descriptor, e))?;
            Some(Literal::Bytes(token))
        } else {
            None
        };
        let join_key = if descriptor.mode.is_joinable() {
            let bucket = self
                .codec
                .join_bucket(descriptor, &plaintext)
                .map_err(|e| encode_failed(descriptor, e))?;
            Some(Literal::Bytes(bucket))
        } else {
            None
        };

        Ok(EncodedValue {
            ciphertext: Literal::Bytes(ciphertext),
            blind_index,
            join_key,
        })
    }

    /// Auxiliary columns written alongside `column`, in physical order.
    fn auxiliary_columns(column: &ColumnRef) -> Result<Vec<ColumnRef>, QueryError> {
        let Some(descriptor) = column.descriptor() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        if descriptor.mode.is_searchable() {
            let name = descriptor
                .blind_index_column()
                .ok_or_else(|| missing_auxiliary(descriptor, "blind index"))?;
            out.push(column.renamed(name));
        }
        if descriptor.mode.is_joinable() {
            let name = descriptor
                .join_key_column()
                .ok_or_else(|| missing_auxiliary(descriptor, "join key"))?;
            out.push(column.renamed(name));
        }
        Ok(out)
    }

    fn rewrite_insert(&self, insert: &mut InsertStatement) -> Result<(), QueryError> {
        let InsertSource::Values(rows) = &mut insert.source else {
            return Ok(());
        };

        let encrypted: Vec<usize> = insert
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.mode().is_encrypted())
            .map(|(i, _)| i)
            .collect();
        if encrypted.is_empty() {
            return Ok(());
        }

        let mut extra_columns = Vec::new();
        for &index in &encrypted {
            extra_columns.extend(Self::auxiliary_columns(&insert.columns[index])?);
        }

        for row in rows.iter_mut() {
            let mut extra_values = Vec::new();
            for &index in &encrypted {
                let Some(descriptor) = insert.columns[index].descriptor() else {
                    continue;
                };
                let Some(literal) = row.get(index).and_then(Expr::as_literal) else {
                    return Err(QueryError::NonLiteralInsert);
                };
                let encoded = self.encode_value(descriptor, literal)?;
                row[index] = Expr::Literal(encoded.ciphertext);
                extra_values.extend(encoded.blind_index.map(Expr::Literal));
                extra_values.extend(encoded.join_key.map(Expr::Literal));
            }
            row.extend(extra_values);
        }

        insert.columns.extend(extra_columns);
        Ok(())
    }

    fn rewrite_update(&self, update: &mut UpdateStatement) -> Result<(), QueryError> {
        let mut extra = Vec::new();
        for assignment in &mut update.assignments {
            let Some(descriptor) = assignment.column.descriptor().cloned() else {
                continue;
            };
            if !descriptor.mode.is_encrypted() {
                continue;
            }
            let Expr::Literal(literal) = &assignment.value else {
                return Err(QueryError::NonLiteralUpdate);
            };

            let encoded = self.encode_value(&descriptor, literal)?;
            let auxiliary = Self::auxiliary_columns(&assignment.column)?;
            let values = encoded.blind_index.into_iter().chain(encoded.join_key);
            for (column, value) in auxiliary.into_iter().zip(values) {
                extra.push(Assignment {
                    column,
                    value: Expr::Literal(value),
                });
            }
            assignment.value = Expr::Literal(encoded.ciphertext);
        }
        update.assignments.extend(extra);

        if let Some(selection) = &mut update.selection {
            self.rewrite_where(selection)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::StatementParser;
    use crate::resolver::{Resolver, ResolverOptions};
    use pretty_assertions::assert_eq;
    use tde_core::catalog::{ColumnCatalog, ColumnMode, TableSchema};
    use tde_crypto::encode_bytea;

    /// Codec with readable, deterministic output.
    struct FakeCodec;

    impl EncryptionCodec for FakeCodec {
        fn blind_index(&self, _: &ColumnDescriptor, p: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok([b"bi:", p].concat())
        }

        fn join_bucket(&self, _: &ColumnDescriptor, p: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(p[..1].to_vec())
        }

        fn encrypt(&self, _: &ColumnDescriptor, p: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok([b"ct:", p].concat())
        }

        fn decrypt(&self, _: &ColumnDescriptor, c: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(c[3..].to_vec())
        }
    }

    fn hex(bytes: &[u8]) -> String {
        format!("'{}'", encode_bytea(bytes))
    }

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
                vec![ColumnDescriptor::new("city2region", "id", ColumnMode::Joinable)],
            ))
    }

    fn rewrite(sql: &str) -> String {
        let catalog = catalog();
        let mut statement = StatementParser::new().parse(sql).unwrap();
        Resolver::new(&catalog, ResolverOptions::default())
            .resolve(&mut statement)
            .unwrap();
        Rewriter::new(&FakeCodec).rewrite(&mut statement).unwrap();
        statement.to_string()
    }

    #[test]
    fn test_where_lookup() {
        assert_eq!(
            rewrite("SELECT population FROM cities WHERE name = 'Moscow' AND population > 1"),
            format!(
                "SELECT population FROM cities WHERE name_bi = {} AND population > 1",
                hex(b"bi:Moscow")
            )
        );
    }

    #[test]
    fn test_null_lookup_stays_null() {
        assert_eq!(
            rewrite("SELECT population FROM cities WHERE name = NULL"),
            "SELECT population FROM cities WHERE name_bi = NULL"
        );
    }

    #[test]
    fn test_bucket_join() {
        assert_eq!(
            rewrite("SELECT c.id, r.id AS rid FROM cities c JOIN city2region r ON (c.id = r.id)"),
            "SELECT c.id, r.id AS rid FROM cities AS c JOIN city2region AS r ON (c.id_join_key = r.id_join_key)"
        );
    }

    #[test]
    fn test_group_by_blind_index() {
        assert_eq!(
            rewrite("SELECT c.name, count(c.population) AS n FROM cities c GROUP BY c.name"),
            "SELECT (array_agg(c.name))[1] AS name, count(c.population) AS n FROM cities AS c GROUP BY c.name_bi"
        );
        assert_eq!(
            rewrite("SELECT population, count(*) AS n FROM cities GROUP BY population"),
            "SELECT population, count(*) AS n FROM cities GROUP BY population"
        );
    }

    #[test]
    fn test_insert_appends_auxiliary_columns() {
        assert_eq!(
            rewrite("INSERT INTO cities (id, population, kladr_id) VALUES ('7', 5, NULL)"),
            format!(
                "INSERT INTO cities (id, population, kladr_id, id_bi, id_join_key) VALUES ({}, 5, NULL, {}, {})",
                hex(b"ct:7"),
                hex(b"bi:7"),
                hex(b"7")
            )
        );
    }

    #[test]
    fn test_update_appends_auxiliary_assignments() {
        assert_eq!(
            rewrite("UPDATE cities SET name = 'Kazan', population = 3 WHERE id = 1"),
            format!(
                "UPDATE cities SET name = {}, population = 3, name_bi = {} WHERE id_bi = {}",
                hex(b"ct:Kazan"),
                hex(b"bi:Kazan"),
                hex(b"bi:1")
            )
        );
    }
}
