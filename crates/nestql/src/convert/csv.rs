// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Delimited text to SQLite, using arrow-csv schema inference

use super::sqlite::{ColumnType, unique_column_names, write_table};
use super::{ConvertHints, Converter};
use crate::{Error, Result};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_cast::display::{ArrayFormatter, FormatOptions};
use arrow_csv::ReaderBuilder;
use arrow_csv::reader::Format;
use arrow_schema::{ArrowError, DataType};
use async_trait::async_trait;
use rusqlite::types::Value;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

const BATCH_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub struct CsvConverter {
    delimiter: u8,
}

impl CsvConverter {
    #[must_use]
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl Default for CsvConverter {
    fn default() -> Self {
        Self::new(b',')
    }
}

#[async_trait]
impl Converter for CsvConverter {
    fn name(&self) -> &str {
        "csv"
    }

    async fn convert(&self, source: &Path, dest: &Path, hints: &ConvertHints) -> Result<()> {
        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        let table = hints.table_name.clone();
        let delimiter = hints.delimiter.unwrap_or(self.delimiter);

        let rows = tokio::task::spawn_blocking(move || csv_to_sqlite(&source, &dest, &table, delimiter)).await??;
        diagnostics::debug!("CSV conversion wrote {rows} rows", rows: rows);
        Ok(())
    }
}

fn arrow_error(source: &Path, err: ArrowError) -> Error {
    Error::conversion(format!("'{}': {}", source.display(), err))
}

fn column_type(data_type: &DataType) -> ColumnType {
    if data_type.is_integer() {
        ColumnType::Integer
    } else if data_type.is_floating() {
        ColumnType::Real
    } else {
        ColumnType::Text
    }
}

fn csv_to_sqlite(source: &Path, dest: &Path, table: &str, delimiter: u8) -> Result<u64> {
    let mut file = std::fs::File::open(source)?;
    // Infer over every row; the reader below parses strictly against this schema.
    let (schema, _) = Format::default()
        .with_header(true)
        .with_delimiter(delimiter)
        .infer_schema(&mut file, None)
        .map_err(|e| arrow_error(source, e))?;
    if schema.fields().is_empty() {
        return Err(Error::conversion(format!(
            "'{}' has no header row",
            source.display()
        )));
    }
    _ = file.seek(SeekFrom::Start(0))?;

    let types: Vec<ColumnType> = schema
        .fields()
        .iter()
        .map(|f| column_type(f.data_type()))
        .collect();
    let names = unique_column_names(schema.fields().iter().map(|f| f.name().as_str()));
    let columns: Vec<(String, ColumnType)> = names.into_iter().zip(types.iter().copied()).collect();

    let reader = ReaderBuilder::new(Arc::new(schema))
        .with_header(true)
        .with_delimiter(delimiter)
        .with_batch_size(BATCH_SIZE)
        .build(file)
        .map_err(|e| arrow_error(source, e))?;

    let rows = reader.flat_map(|batch| match batch {
        Ok(batch) => match batch_rows(&batch, &types) {
            Ok(rows) => rows.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(e) => vec![Err(arrow_error(source, e))],
        },
        Err(e) => vec![Err(arrow_error(source, e))],
    });

    write_table(dest, table, &columns, rows)
}

/// Transpose a record batch into SQLite row values
fn batch_rows(batch: &RecordBatch, types: &[ColumnType]) -> std::result::Result<Vec<Vec<Value>>, ArrowError> {
    let columns = batch
        .columns()
        .iter()
        .zip(types)
        .map(|(array, ty)| column_values(array, *ty))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok((0..batch.num_rows())
        .map(|row| columns.iter().map(|col| col[row].clone()).collect())
        .collect())
}

fn column_values(array: &ArrayRef, ty: ColumnType) -> std::result::Result<Vec<Value>, ArrowError> {
    Ok(match ty {
        ColumnType::Integer => arrow_cast::cast(array.as_ref(), &DataType::Int64)?
            .as_primitive::<Int64Type>()
            .iter()
            .map(|v| v.map_or(Value::Null, Value::Integer))
            .collect(),
        ColumnType::Real => arrow_cast::cast(array.as_ref(), &DataType::Float64)?
            .as_primitive::<Float64Type>()
            .iter()
            .map(|v| v.map_or(Value::Null, Value::Real))
            .collect(),
        ColumnType::Text => {
            let formatter = ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default())?;
            (0..array.len())
                .map(|i| {
                    if array.is_null(i) {
                        Value::Null
                    } else {
                        Value::Text(formatter.value(i).to_string())
                    }
                })
                .collect()
        }
    })
}
