// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! JSON records to SQLite
//!
//! Accepts a top-level array of objects, or a sequence of objects
//! (newline-delimited or simply concatenated). Columns are the union of all
//! keys in sorted order. Nested arrays and objects are stored as JSON text.

use super::sqlite::{ColumnType, write_table};
use super::{ConvertHints, Converter};
use crate::{Error, Result};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct JsonConverter;

#[async_trait]
impl Converter for JsonConverter {
    fn name(&self) -> &str {
        "json"
    }

    async fn convert(&self, source: &Path, dest: &Path, hints: &ConvertHints) -> Result<()> {
        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        let table = hints.table_name.clone();

        let rows = tokio::task::spawn_blocking(move || {
            let text = std::fs::read_to_string(&source)?;
            let records = parse_records(&text)
                .map_err(|e| Error::conversion(format!("'{}': {}", source.display(), e)))?;
            records_to_sqlite(&records, &dest, &table)
        })
        .await??;
        diagnostics::debug!("JSON conversion wrote {rows} rows", rows: rows);
        Ok(())
    }
}

fn parse_records(text: &str) -> std::result::Result<Vec<Map<String, Value>>, String> {
    let values = serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;

    let values = match values.as_slice() {
        [Value::Array(items)] => items.clone(),
        _ => values,
    };

    values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| match value {
            Value::Object(map) => Ok(map),
            other => Err(format!(
                "record {} is {}, expected an object",
                idx + 1,
                type_name(&other)
            )),
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Narrowest affinity that fits every non-null value in a column
fn column_type<'a, I: Iterator<Item = &'a Value>>(values: I) -> ColumnType {
    let mut ty = ColumnType::Integer;
    for value in values {
        match value {
            Value::Null => {}
            Value::Bool(_) => {}
            Value::Number(n) if n.is_i64() => {}
            Value::Number(_) => ty = ColumnType::Real,
            _ => return ColumnType::Text,
        }
    }
    ty
}

fn sql_value(value: Option<&Value>, ty: ColumnType) -> SqlValue {
    match (value, ty) {
        (None | Some(Value::Null), _) => SqlValue::Null,
        (Some(Value::Bool(b)), ColumnType::Integer | ColumnType::Real) => SqlValue::Integer(i64::from(*b)),
        (Some(Value::Number(n)), ColumnType::Integer) => n.as_i64().map_or(SqlValue::Null, SqlValue::Integer),
        (Some(Value::Number(n)), ColumnType::Real) => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        (Some(Value::String(s)), _) => SqlValue::Text(s.clone()),
        (Some(other), _) => SqlValue::Text(other.to_string()),
    }
}

fn records_to_sqlite(records: &[Map<String, Value>], dest: &Path, table: &str) -> Result<u64> {
    let mut by_column: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
    for record in records {
        for (key, value) in record {
            by_column.entry(key.as_str()).or_default().push(value);
        }
    }
    if by_column.is_empty() {
        return Err(Error::conversion("JSON source contains no fields"));
    }

    let columns: Vec<(String, ColumnType)> = by_column
        .iter()
        .map(|(name, values)| (name.to_string(), column_type(values.iter().copied())))
        .collect();

    let rows = records.iter().map(|record| {
        Ok(columns
            .iter()
            .map(|(name, ty)| sql_value(record.get(name), *ty))
            .collect())
    });

    write_table(dest, table, &columns, rows)
}
