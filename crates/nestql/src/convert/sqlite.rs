// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Table creation and bulk insert helpers shared by the built-in converters
//! and the directory indexer.

use crate::query::quote_ident;
use crate::{Error, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use std::collections::HashSet;
use std::path::Path;

/// SQLite column affinity chosen for a source column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

/// Make header names usable as distinct column names
///
/// Blank names become `column_<n>` (1-based); repeats get `_2`, `_3`, ...
#[must_use]
pub fn unique_column_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (idx, name) in names.into_iter().enumerate() {
        let trimmed = name.as_ref().trim();
        let base = if trimmed.is_empty() {
            format!("column_{}", idx + 1)
        } else {
            trimmed.to_string()
        };

        let mut candidate = base.clone();
        let mut suffix = 2;
        while !seen.insert(candidate.to_ascii_lowercase()) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        out.push(candidate);
    }
    out
}

/// Write one table into a new SQLite database at `dest`
///
/// `rows` yields one value per column; every row must match `columns`.
/// Returns the number of rows written.
pub fn write_table<I>(dest: &Path, table: &str, columns: &[(String, ColumnType)], rows: I) -> Result<u64>
where
    I: IntoIterator<Item = Result<Vec<Value>>>,
{
    if columns.is_empty() {
        return Err(Error::conversion(format!("no columns to write into '{}'", table)));
    }

    let mut conn = Connection::open(dest)?;
    let tx = conn.transaction()?;

    let column_defs = columns
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.as_sql()))
        .collect::<Vec<_>>()
        .join(", ");
    _ = tx.execute(&format!("CREATE TABLE {} ({})", quote_ident(table), column_defs), [])?;

    let placeholders = vec!["?"; columns.len()].join(", ");
    let insert = format!("INSERT INTO {} VALUES ({})", quote_ident(table), placeholders);

    let mut count = 0u64;
    {
        let mut stmt = tx.prepare(&insert)?;
        for row in rows {
            let row = row?;
            if row.len() != columns.len() {
                return Err(Error::conversion(format!(
                    "row {} has {} values, expected {}",
                    count + 1,
                    row.len(),
                    columns.len()
                )));
            }
            _ = stmt.execute(params_from_iter(row.iter()))?;
            count += 1;
        }
    }
    tx.commit()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unique_column_names() {
        assert_eq!(
            unique_column_names(["id", "", "Name", "name", "id"]),
            vec!["id", "column_2", "Name", "name_2", "id_2"]
        );
    }

    #[test]
    fn test_write_table() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let dest = tmp.path().join("out.db");
        let columns = vec![
            ("n".to_string(), ColumnType::Integer),
            ("label".to_string(), ColumnType::Text),
        ];
        let rows = vec![
            Ok(vec![Value::Integer(1), Value::Text("one".into())]),
            Ok(vec![Value::Null, Value::Text("none".into())]),
        ];
        assert_eq!(write_table(&dest, "tb0", &columns, rows).expect("write"), 2);

        let conn = Connection::open(&dest).expect("open");
        let count: i64 = conn
            .query_row("SELECT count(*) FROM tb0 WHERE n IS NULL", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_mismatched_row_is_rejected() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let columns = vec![("a".to_string(), ColumnType::Text)];
        let rows = vec![Ok(vec![Value::Null, Value::Null])];
        let err = write_table(&tmp.path().join("x.db"), "tb0", &columns, rows).expect_err("mismatch");
        assert_eq!(err.kind(), crate::ErrorKind::ConversionFailed);
    }
}
