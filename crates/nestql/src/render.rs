// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Output renderers for query results

use crate::stream::{QueryResult, Row, RowLinks};
use crate::{Error, Result};
use arrow::util::pretty::pretty_format_batches;
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_csv::WriterBuilder;
use arrow_schema::{ArrowError, DataType, Field, Schema};
use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

/// Rows per record batch when streaming CSV
const CSV_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Csv,
    Count,
    Html,
}

impl OutputFormat {
    #[must_use]
    pub fn renderer(self) -> Box<dyn TableRenderer> {
        match self {
            Self::Table => Box::new(PrettyRenderer),
            Self::Csv => Box::new(CsvRenderer),
            Self::Count => Box::new(CountRenderer),
            Self::Html => Box::new(HtmlRenderer),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "csv" => Ok(Self::Csv),
            "count" => Ok(Self::Count),
            "html" => Ok(Self::Html),
            other => Err(Error::malformed(format!(
                "Unsupported output format: {}. Use 'table', 'csv', 'count' or 'html'.",
                other
            ))),
        }
    }
}

/// Consumes a query result and writes it somewhere
#[async_trait]
pub trait TableRenderer: Send + Sync {
    /// Returns the number of rows rendered
    async fn render(&self, result: QueryResult, links: &RowLinks, out: &mut (dyn Write + Send)) -> Result<u64>;
}

fn output_error(err: std::io::Error) -> Error {
    Error::io(format!("Failed to write output: {}", err))
}

fn format_error(err: ArrowError) -> Error {
    Error::io(format!("Failed to format results: {}", err))
}

/// All-text record batch over the given rows
fn text_batch(columns: &[String], rows: &[Row]) -> Result<RecordBatch> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|name| Field::new(name, DataType::Utf8, false))
        .collect();
    let arrays: Vec<ArrayRef> = (0..columns.len())
        .map(|idx| {
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|row| row.get(idx).map(String::as_str).unwrap_or_default()),
            )) as ArrayRef
        })
        .collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).map_err(format_error)
}

/// Boxed table, with a `link` column when rows are navigable
#[derive(Debug, Clone, Copy, Default)]
pub struct PrettyRenderer;

#[async_trait]
impl TableRenderer for PrettyRenderer {
    async fn render(&self, result: QueryResult, links: &RowLinks, out: &mut (dyn Write + Send)) -> Result<u64> {
        let mut columns = result.columns;
        let mut rows = result.rows.collect_rows().await?;
        if rows.is_empty() || columns.is_empty() {
            writeln!(out, "No results found.").map_err(output_error)?;
            return Ok(0);
        }

        if links.is_enabled() {
            columns.push("link".to_string());
            for row in &mut rows {
                let link = links.link(row).unwrap_or_default();
                row.push(link);
            }
        }

        let batch = text_batch(&columns, &rows)?;
        let formatted = pretty_format_batches(&[batch]).map_err(format_error)?;
        writeln!(out, "{}", formatted).map_err(output_error)?;
        Ok(rows.len() as u64)
    }
}

/// CSV with a header row, written in chunks as rows arrive
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvRenderer;

#[async_trait]
impl TableRenderer for CsvRenderer {
    async fn render(&self, result: QueryResult, _links: &RowLinks, out: &mut (dyn Write + Send)) -> Result<u64> {
        let QueryResult { columns, mut rows } = result;
        if columns.is_empty() {
            return Ok(0);
        }

        let mut writer = WriterBuilder::new().with_header(true).build(out);
        let mut chunk = Vec::with_capacity(CSV_CHUNK);
        let mut total = 0u64;
        let mut wrote_any = false;

        while let Some(row) = rows.next_row().await {
            chunk.push(row?);
            if chunk.len() == CSV_CHUNK {
                writer.write(&text_batch(&columns, &chunk)?).map_err(format_error)?;
                total += chunk.len() as u64;
                chunk.clear();
                wrote_any = true;
            }
        }
        if !chunk.is_empty() || !wrote_any {
            writer.write(&text_batch(&columns, &chunk)?).map_err(format_error)?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }
}

/// Only the number of rows
#[derive(Debug, Clone, Copy, Default)]
pub struct CountRenderer;

#[async_trait]
impl TableRenderer for CountRenderer {
    async fn render(&self, result: QueryResult, _links: &RowLinks, out: &mut (dyn Write + Send)) -> Result<u64> {
        let mut rows = result.rows;
        let mut total = 0u64;
        while let Some(row) = rows.next_row().await {
            _ = row?;
            total += 1;
        }
        writeln!(out, "{}", total).map_err(output_error)?;
        Ok(total)
    }
}

const HTML_TEMPLATE: &str = r#"<table>
<thead><tr>{% for column in columns %}<th>{{ column }}</th>{% endfor %}</tr></thead>
<tbody>
{% for row in rows %}<tr>{% for cell in row.cells %}<td>{% if row.link and loop.index0 == link_column %}<a href="{{ row.link }}">{{ cell }}</a>{% else %}{{ cell }}{% endif %}</td>{% endfor %}</tr>
{% endfor %}</tbody>
</table>
"#;

#[derive(Serialize)]
struct HtmlRow {
    cells: Row,
    link: Option<String>,
}

/// HTML table; navigable rows link their name cell to the deeper address
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlRenderer;

#[async_trait]
impl TableRenderer for HtmlRenderer {
    async fn render(&self, result: QueryResult, links: &RowLinks, out: &mut (dyn Write + Send)) -> Result<u64> {
        let columns = result.columns;
        let rows: Vec<HtmlRow> = result
            .rows
            .collect_rows()
            .await?
            .into_iter()
            .map(|cells| HtmlRow {
                link: links.link(&cells),
                cells,
            })
            .collect();

        let mut context = tera::Context::new();
        context.insert("columns", &columns);
        context.insert("rows", &rows);
        context.insert(
            "link_column",
            &links.column().map_or(-1, |c| i64::try_from(c).unwrap_or(-1)),
        );

        let html = tera::Tera::one_off(HTML_TEMPLATE, &context, true)?;
        out.write_all(html.as_bytes()).map_err(output_error)?;
        Ok(rows.len() as u64)
    }
}
