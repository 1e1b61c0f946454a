// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Query execution against a cached artifact
//!
//! The statement runs on a blocking thread with a read-only connection and
//! feeds string-rendered rows through a bounded channel. The resulting
//! [`RowStream`] is forward-only; dropping it stops the worker at its next
//! row.

use crate::{Error, Result};
use futures::Stream;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// Rows buffered between the SQLite worker and the consumer
const ROW_BUFFER: usize = 64;

pub type Row = Vec<String>;

/// Column names plus the rows still to be read
#[derive(Debug)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: RowStream,
}

#[derive(Debug)]
pub struct RowStream {
    rx: mpsc::Receiver<Result<Row>>,
}

impl RowStream {
    pub async fn next_row(&mut self) -> Option<Result<Row>> {
        self.rx.recv().await
    }

    /// Drain the remaining rows
    pub async fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

impl Stream for RowStream {
    type Item = Result<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

fn open_read_only(artifact: &Path) -> Result<Connection> {
    Ok(Connection::open_with_flags(
        artifact,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?)
}

/// Render one SQLite value as text
fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Run `sql` against `artifact` and stream the rows
///
/// `debug` attaches the statement to any QueryFailed error.
pub async fn execute(artifact: &Path, sql: &str, debug: bool) -> Result<QueryResult> {
    let (columns_tx, columns_rx) = oneshot::channel();
    let (rows_tx, rows_rx) = mpsc::channel(ROW_BUFFER);
    let artifact = artifact.to_path_buf();
    let sql = sql.to_string();

    drop(tokio::task::spawn_blocking(move || {
        run_query(&artifact, &sql, debug, columns_tx, rows_tx);
    }));

    let columns = columns_rx
        .await
        .map_err(|_| Error::io("query worker exited before reporting columns"))??;
    Ok(QueryResult {
        columns,
        rows: RowStream { rx: rows_rx },
    })
}

fn run_query(
    artifact: &Path,
    sql: &str,
    debug: bool,
    columns_tx: oneshot::Sender<Result<Vec<String>>>,
    rows_tx: mpsc::Sender<Result<Row>>,
) {
    let conn = match open_read_only(artifact) {
        Ok(conn) => conn,
        Err(e) => {
            _ = columns_tx.send(Err(e));
            return;
        }
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            _ = columns_tx.send(Err(Error::query(e.to_string(), sql, debug)));
            return;
        }
    };

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(e) => {
            _ = columns_tx.send(Err(Error::query(e.to_string(), sql, debug)));
            return;
        }
    };
    if columns_tx.send(Ok(columns)).is_err() {
        return;
    }

    let mut sent = 0u64;
    loop {
        let next = match rows.next() {
            Ok(Some(row)) => (0..width)
                .map(|i| row.get_ref(i).map(render))
                .collect::<rusqlite::Result<Row>>()
                .map_err(|e| Error::query(e.to_string(), sql, debug)),
            Ok(None) => break,
            Err(e) => Err(Error::query(e.to_string(), sql, debug)),
        };
        let failed = next.is_err();
        if rows_tx.blocking_send(next).is_err() {
            diagnostics::debug!("Row consumer went away after {sent} rows", sent: sent);
            return;
        }
        if failed {
            return;
        }
        sent += 1;
    }
    diagnostics::debug!("Streamed {sent} rows", sent: sent);
}

/// Whether `artifact` has a table or view called `table`
/// Column names of a table or view, empty when it does not exist
pub async fn table_columns(artifact: &Path, table: &str) -> Result<Vec<String>> {
    let artifact = artifact.to_path_buf();
    let table = table.to_string();
    tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let conn = open_read_only(&artifact)?;
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
        let names = stmt
            .query_map([&table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    })
    .await?
}

/// Characters escaped inside one link path segment
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkSource {
    /// Catalog rows: only `table`/`view` types link
    Catalog { name: usize, kind: usize },
    Name(usize),
    Path(usize),
}

/// Navigable links for rows whose columns look like a listing or catalog
#[derive(Debug, Clone)]
pub struct RowLinks {
    base: String,
    source: Option<LinkSource>,
}

impl RowLinks {
    /// Inspect column names; rows get no links when no known column is present
    #[must_use]
    pub fn detect(columns: &[String], dataset_address: &str) -> Self {
        let find = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));
        let source = match (find("name"), find("type"), find("path")) {
            (Some(name), Some(kind), _) => Some(LinkSource::Catalog { name, kind }),
            (Some(name), None, _) => Some(LinkSource::Name(name)),
            (None, _, Some(path)) => Some(LinkSource::Path(path)),
            (None, _, None) => None,
        };

        let trimmed = dataset_address.trim_end_matches('/');
        let base = if trimmed.starts_with('/') || trimmed.is_empty() {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        };
        Self { base, source }
    }

    /// Plain rows, no links
    #[must_use]
    pub fn none() -> Self {
        Self {
            base: String::new(),
            source: None,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.source.is_some()
    }

    /// Index of the column the link belongs to
    #[must_use]
    pub fn column(&self) -> Option<usize> {
        match self.source? {
            LinkSource::Catalog { name, .. } | LinkSource::Name(name) => Some(name),
            LinkSource::Path(path) => Some(path),
        }
    }

    /// Link for one row, if it has one
    #[must_use]
    pub fn link(&self, row: &[String]) -> Option<String> {
        let target = match self.source? {
            LinkSource::Catalog { name, kind } => {
                let kind = row.get(kind)?;
                if !(kind.eq_ignore_ascii_case("table") || kind.eq_ignore_ascii_case("view")) {
                    return None;
                }
                row.get(name)?.as_str()
            }
            LinkSource::Name(name) => row.get(name)?.as_str(),
            LinkSource::Path(path) => row.get(path)?.trim_end_matches('/').rsplit('/').next()?,
        };
        if target.is_empty() {
            return None;
        }
        Some(format!("{}/{}", self.base, utf8_percent_encode(target, SEGMENT)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn artifact(tmp: &TempDir) -> PathBuf {
        let path = tmp.path().join("a.db");
        let conn = Connection::open(&path).expect("open");
        conn.execute_batch(
            "CREATE TABLE tb0 (id INTEGER, label TEXT, score REAL, raw BLOB);
             INSERT INTO tb0 VALUES (1, 'one', 1.5, X'6869');
             INSERT INTO tb0 VALUES (2, NULL, NULL, NULL);
             CREATE VIEW v AS SELECT id FROM tb0;",
        )
        .expect("seed");
        path
    }

    #[tokio::test]
    async fn test_rows_are_rendered_as_text() {
        let tmp = TempDir::new().expect("tempdir");
        let path = artifact(&tmp);
        let result = execute(&path, "SELECT * FROM tb0 ORDER BY rowid", false)
            .await
            .expect("execute");
        assert_eq!(result.columns, vec!["id", "label", "score", "raw"]);
        let rows = result.rows.collect_rows().await.expect("rows");
        assert_eq!(
            rows,
            vec![
                vec!["1".to_string(), "one".to_string(), "1.5".to_string(), "hi".to_string()],
                vec!["2".to_string(), String::new(), String::new(), String::new()],
            ]
        );
    }

    #[tokio::test]
    async fn test_rows_as_futures_stream() {
        use futures::StreamExt;
        let tmp = TempDir::new().expect("tempdir");
        let path = artifact(&tmp);
        let result = execute(&path, "SELECT id FROM tb0", false).await.expect("execute");
        let count = result.rows.count().await;
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_query_error_carries_sql_only_in_debug() {
        let tmp = TempDir::new().expect("tempdir");
        let path = artifact(&tmp);
        let sql = "SELECT nope FROM tb0";

        match execute(&path, sql, false).await.expect_err("bad column") {
            Error::QueryFailed { message, sql } => {
                assert!(message.contains("nope"));
                assert_eq!(sql, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        match execute(&path, sql, true).await.expect_err("bad column") {
            Error::QueryFailed { sql: Some(s), .. } => assert_eq!(s, sql),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_artifact_is_read_only() {
        let tmp = TempDir::new().expect("tempdir");
        let path = artifact(&tmp);
        let result = execute(&path, "DELETE FROM tb0", false).await;
        let failed = match result {
            Err(_) => true,
            Ok(r) => r.rows.collect_rows().await.is_err(),
        };
        assert!(failed);
    }

    #[tokio::test]
    async fn test_table_columns() {
        let tmp = TempDir::new().expect("tempdir");
        let path = artifact(&tmp);
        assert_eq!(
            table_columns(&path, "tb0").await.expect("lookup"),
            vec!["id", "label", "score", "raw"]
        );
        assert_eq!(table_columns(&path, "v").await.expect("lookup"), vec!["id"]);
        assert!(table_columns(&path, "missing").await.expect("lookup").is_empty());
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn row(values: &[&str]) -> Vec<String> {
        cols(values)
    }

    #[test]
    fn test_listing_links() {
        let links = RowLinks::detect(
            &cols(&["path", "name", "size", "extension", "mod_time", "is_dir"]),
            "https://web@host/data/",
        );
        assert!(links.is_enabled());
        assert_eq!(
            links.link(&row(&["data/q 1.csv", "q 1.csv", "10", ".csv", "", "0"])),
            Some("/https://web@host/data/q%201.csv".to_string())
        );
    }

    #[test]
    fn test_catalog_links() {
        let links = RowLinks::detect(&cols(&["name", "type"]), "/exports/app.sqlite");
        assert_eq!(
            links.link(&row(&["orders", "table"])),
            Some("/exports/app.sqlite/orders".to_string())
        );
        assert_eq!(links.link(&row(&["idx_orders", "index"])), None);
    }

    #[test]
    fn test_path_only_and_plain_rows() {
        let links = RowLinks::detect(&cols(&["path"]), "/");
        assert_eq!(links.link(&row(&["a/b/c.csv"])), Some("/c.csv".to_string()));

        let plain = RowLinks::detect(&cols(&["id", "total"]), "/x.csv");
        assert!(!plain.is_enabled());
        assert_eq!(plain.link(&row(&["1", "2"])), None);
    }
}
