// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Build a cache artifact from a remote object or directory
//!
//! Directories become a fixed-schema listing table. Objects are downloaded
//! to `staging/<key>.<ext>` and handed to the converter for their extension.
//! The staged download is removed after a successful conversion and kept
//! after a failed one so it can be inspected.

use crate::convert::sqlite::{ColumnType, write_table};
use crate::convert::{ConvertHints, ConverterRegistry, DEFAULT_EXTENSION, DEFAULT_TABLE, source_extension};
use crate::remote::{Entry, RemoteStore};
use crate::{Error, Result};
use chrono::SecondsFormat;
use rusqlite::types::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// Columns of a directory listing, all stored as text
pub const LISTING_COLUMNS: [&str; 6] = ["path", "name", "size", "extension", "mod_time", "is_dir"];

/// What a build produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Directory { entries: u64 },
    Object { bytes: u64, converter: String },
}

/// Run `fut` under an optional deadline
pub async fn with_deadline<T, F>(stage: &str, limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        None => fut.await,
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| Error::timeout(stage, after))?,
    }
}

/// Sequences stat, fetch and convert for one artifact
#[derive(Debug, Clone)]
pub struct FetchConvert<'a> {
    converters: &'a ConverterRegistry,
    staging_dir: PathBuf,
    fetch_timeout: Option<Duration>,
    convert_timeout: Option<Duration>,
}

impl<'a> FetchConvert<'a> {
    pub fn new<P: Into<PathBuf>>(converters: &'a ConverterRegistry, staging_dir: P) -> Self {
        Self {
            converters,
            staging_dir: staging_dir.into(),
            fetch_timeout: None,
            convert_timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, fetch: Option<Duration>, convert: Option<Duration>) -> Self {
        self.fetch_timeout = fetch;
        self.convert_timeout = convert;
        self
    }

    /// Probe `path` and write its artifact to `dest`
    pub async fn build(
        &self,
        store: &dyn RemoteStore,
        path: &str,
        key: &str,
        dest: &Path,
    ) -> Result<BuildOutcome> {
        let started = Instant::now();
        let entry = with_deadline("stat", self.fetch_timeout, store.stat(path)).await?;

        let outcome = if entry.is_dir {
            self.index_directory(store, path, dest).await?
        } else {
            self.fetch_and_convert(store, &entry, key, dest).await?
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        diagnostics::info!(
            "Built {key} from {kind} remote in {elapsed_ms}ms",
            key: key,
            kind: store.kind(),
            elapsed_ms: elapsed_ms
        );
        Ok(outcome)
    }

    async fn index_directory(&self, store: &dyn RemoteStore, path: &str, dest: &Path) -> Result<BuildOutcome> {
        let children = with_deadline("list", self.fetch_timeout, store.list(path)).await?;
        let dest = dest.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || write_listing(&dest, &children)).await??;
        diagnostics::debug!("Indexed directory {path} with {entries} entries", path: path, entries: entries);
        Ok(BuildOutcome::Directory { entries })
    }

    async fn fetch_and_convert(
        &self,
        store: &dyn RemoteStore,
        entry: &Entry,
        key: &str,
        dest: &Path,
    ) -> Result<BuildOutcome> {
        let extension = source_extension(&entry.path).unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        // Pick the converter first so unsupported sources are never downloaded.
        let converter = self.converters.for_extension(&extension)?;

        let staged = self.staging_dir.join(format!("{}.{}", key, extension));
        let bytes = match with_deadline("fetch", self.fetch_timeout, download(store, &entry.path, &staged)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                remove_quietly(&staged).await;
                return Err(e);
            }
        };

        let hints = ConvertHints {
            table_name: DEFAULT_TABLE.to_string(),
            delimiter: None,
        };
        if let Err(e) = with_deadline(
            "convert",
            self.convert_timeout,
            converter.convert(&staged, dest, &hints),
        )
        .await
        {
            let kept = staged.display().to_string();
            diagnostics::warn!(
                "Conversion of {source} failed, staged copy kept at {staged}",
                source: entry.path.as_str(),
                staged: kept.as_str()
            );
            return Err(e);
        }

        remove_quietly(&staged).await;
        Ok(BuildOutcome::Object {
            bytes,
            converter: converter.name().to_string(),
        })
    }
}

async fn download(store: &dyn RemoteStore, path: &str, staged: &Path) -> Result<u64> {
    let mut reader = store.open(path).await?;
    let mut file = tokio::fs::File::create(staged).await?;
    let bytes = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    diagnostics::debug!("Staged {bytes} bytes from {path}", bytes: bytes, path: path);
    Ok(bytes)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            let shown = path.display().to_string();
            diagnostics::warn!("Could not remove {path}: {error}", path: shown.as_str(), error: e.to_string().as_str());
        }
    }
}

fn write_listing(dest: &Path, children: &[Entry]) -> Result<u64> {
    let columns: Vec<(String, ColumnType)> = LISTING_COLUMNS
        .iter()
        .map(|name| (name.to_string(), ColumnType::Text))
        .collect();

    let rows = children.iter().map(|entry| {
        Ok(vec![
            Value::Text(entry.path.clone()),
            Value::Text(entry.name.clone()),
            Value::Text(entry.size.to_string()),
            Value::Text(entry.extension()),
            Value::Text(
                entry
                    .modified
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default(),
            ),
            Value::Text(if entry.is_dir { "1" } else { "0" }.to_string()),
        ])
    });

    write_table(dest, DEFAULT_TABLE, &columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ByteStream, HostStore};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        staging: PathBuf,
        out: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("remote");
        let staging = tmp.path().join("staging");
        std::fs::create_dir_all(&root).expect("root");
        std::fs::create_dir_all(&staging).expect("staging");
        let out = tmp.path().join("out.db");
        Fixture {
            _tmp: tmp,
            root,
            staging,
            out,
        }
    }

    fn staged_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .expect("readdir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_directory_listing() {
        let fx = fixture();
        std::fs::write(fx.root.join("a.csv"), "x\n1\n").expect("write");
        std::fs::write(fx.root.join("b.json"), "[]").expect("write");
        std::fs::create_dir(fx.root.join("sub")).expect("mkdir");

        let registry = ConverterRegistry::builtin();
        let store = HostStore::new(&fx.root);
        let outcome = FetchConvert::new(&registry, &fx.staging)
            .build(&store, "", "k", &fx.out)
            .await
            .expect("build");
        assert_eq!(outcome, BuildOutcome::Directory { entries: 3 });

        let conn = rusqlite::Connection::open(&fx.out).expect("open");
        let rows: Vec<(String, String, String)> = conn
            .prepare("SELECT name, extension, is_dir FROM tb0 ORDER BY rowid")
            .expect("prepare")
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .expect("query")
            .collect::<rusqlite::Result<_>>()
            .expect("rows");
        assert_eq!(
            rows,
            vec![
                ("a.csv".to_string(), ".csv".to_string(), "0".to_string()),
                ("b.json".to_string(), ".json".to_string(), "0".to_string()),
                ("sub".to_string(), String::new(), "1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_object_is_staged_then_cleaned() {
        let fx = fixture();
        std::fs::write(fx.root.join("data.csv"), "a,b\n1,2\n3,4\n").expect("write");

        let registry = ConverterRegistry::builtin();
        let store = HostStore::new(&fx.root);
        let outcome = FetchConvert::new(&registry, &fx.staging)
            .build(&store, "data.csv", "k", &fx.out)
            .await
            .expect("build");
        assert_eq!(
            outcome,
            BuildOutcome::Object {
                bytes: 12,
                converter: "csv".to_string()
            }
        );
        assert!(staged_files(&fx.staging).is_empty());
        assert!(fx.out.exists());
    }

    #[tokio::test]
    async fn test_failed_conversion_keeps_staged_copy() {
        let fx = fixture();
        std::fs::write(fx.root.join("bad.json"), "{ not json").expect("write");

        let registry = ConverterRegistry::builtin();
        let store = HostStore::new(&fx.root);
        let err = FetchConvert::new(&registry, &fx.staging)
            .build(&store, "bad.json", "k", &fx.out)
            .await
            .expect_err("bad json");
        assert_eq!(err.kind(), crate::ErrorKind::ConversionFailed);
        assert_eq!(staged_files(&fx.staging), vec!["k.json".to_string()]);
    }

    #[tokio::test]
    async fn test_unsupported_extension_is_not_downloaded() {
        let fx = fixture();
        std::fs::write(fx.root.join("deck.pptx"), "zip").expect("write");

        let registry = ConverterRegistry::builtin();
        let store = HostStore::new(&fx.root);
        let err = FetchConvert::new(&registry, &fx.staging)
            .build(&store, "deck.pptx", "k", &fx.out)
            .await
            .expect_err("unsupported");
        assert_eq!(err.kind(), crate::ErrorKind::ConversionFailed);
        assert!(staged_files(&fx.staging).is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let fx = fixture();
        let registry = ConverterRegistry::builtin();
        let store = HostStore::new(&fx.root);
        let err = FetchConvert::new(&registry, &fx.staging)
            .build(&store, "nope.csv", "k", &fx.out)
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[derive(Debug)]
    struct StalledStore;

    #[async_trait]
    impl RemoteStore for StalledStore {
        fn kind(&self) -> &'static str {
            "stalled"
        }

        async fn stat(&self, path: &str) -> Result<Entry> {
            Ok(Entry {
                path: path.to_string(),
                name: path.to_string(),
                size: 1,
                modified: None,
                is_dir: false,
            })
        }

        async fn open(&self, _path: &str) -> Result<ByteStream> {
            std::future::pending::<Result<ByteStream>>().await
        }

        async fn list(&self, _path: &str) -> Result<Vec<Entry>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_fetch_deadline() {
        let fx = fixture();
        let registry = ConverterRegistry::builtin();
        let err = FetchConvert::new(&registry, &fx.staging)
            .with_timeouts(Some(Duration::from_millis(50)), None)
            .build(&StalledStore, "slow.csv", "k", &fx.out)
            .await
            .expect_err("timeout");
        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
        assert!(staged_files(&fx.staging).is_empty());
    }
}
