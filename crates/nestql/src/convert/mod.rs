// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Source file to SQLite conversion
//!
//! Converters are selected by the (lowercased) source extension. Built-in
//! converters cover delimited text, JSON and SQLite passthrough; commands
//! configured under `converters:` override or extend them.

mod command;
mod csv;
mod json;
pub(crate) mod sqlite;

pub use command::{CommandConverter, SqliteCopy};
pub use csv::CsvConverter;
pub use json::JsonConverter;

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Table written by converters and directory listings
pub const DEFAULT_TABLE: &str = "tb0";

/// Extension assumed when the source path has none
pub const DEFAULT_EXTENSION: &str = "csv";

/// Structural hints passed to a converter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertHints {
    pub table_name: String,
    /// Field delimiter for delimited text; converter default when `None`
    pub delimiter: Option<u8>,
}

impl Default for ConvertHints {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE.to_string(),
            delimiter: None,
        }
    }
}

#[async_trait]
pub trait Converter: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Read `source` and create a SQLite database at `dest`
    async fn convert(&self, source: &Path, dest: &Path, hints: &ConvertHints) -> Result<()>;
}

/// Extension of a source path, lowercased, without the dot
#[must_use]
pub fn source_extension(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
}

/// Converters by extension
#[derive(Debug, Clone)]
pub struct ConverterRegistry {
    by_extension: HashMap<String, Arc<dyn Converter>>,
}

impl ConverterRegistry {
    /// Built-in converters only
    #[must_use]
    pub fn builtin() -> Self {
        let csv: Arc<dyn Converter> = Arc::new(CsvConverter::new(b','));
        let tsv: Arc<dyn Converter> = Arc::new(CsvConverter::new(b'\t'));
        let json: Arc<dyn Converter> = Arc::new(JsonConverter);
        let sqlite: Arc<dyn Converter> = Arc::new(SqliteCopy);

        let mut by_extension = HashMap::new();
        for (ext, converter) in [
            ("csv", &csv),
            ("txt", &csv),
            ("tsv", &tsv),
            ("tab", &tsv),
            ("json", &json),
            ("ndjson", &json),
            ("jsonl", &json),
            ("db", &sqlite),
            ("sqlite", &sqlite),
            ("sqlite3", &sqlite),
        ] {
            _ = by_extension.insert(ext.to_string(), Arc::clone(converter));
        }
        Self { by_extension }
    }

    /// Built-ins plus configured command converters, which take precedence
    pub fn with_commands(commands: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut registry = Self::builtin();
        for (ext, argv) in commands {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            let converter = CommandConverter::new(ext.clone(), argv.clone())?;
            registry.register(&ext, Arc::new(converter));
        }
        Ok(registry)
    }

    pub fn register(&mut self, extension: &str, converter: Arc<dyn Converter>) {
        _ = self
            .by_extension
            .insert(extension.to_ascii_lowercase(), converter);
    }

    /// Converter for an extension, or ConversionFailed naming it
    pub fn for_extension(&self, extension: &str) -> Result<Arc<dyn Converter>> {
        self.by_extension
            .get(&extension.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                let mut known: Vec<_> = self.by_extension.keys().map(String::as_str).collect();
                known.sort_unstable();
                Error::conversion(format!(
                    "no converter for '.{}' (supported: {})",
                    extension,
                    known.join(", ")
                ))
            })
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_extension() {
        assert_eq!(source_extension("a/b/Data.CSV").as_deref(), Some("csv"));
        assert_eq!(source_extension("a/b/noext"), None);
        assert_eq!(source_extension("archive.tar.gz").as_deref(), Some("gz"));
    }

    #[test]
    fn test_builtin_lookup() {
        let registry = ConverterRegistry::builtin();
        assert_eq!(registry.for_extension("TSV").expect("tsv").name(), "csv");
        assert_eq!(registry.for_extension("sqlite3").expect("db").name(), "sqlite");

        let err = registry.for_extension("xlsx").expect_err("unknown");
        assert_eq!(err.kind(), crate::ErrorKind::ConversionFailed);
        assert!(err.to_string().contains(".xlsx"));
    }

    #[test]
    fn test_commands_override_builtins() {
        let mut commands = BTreeMap::new();
        _ = commands.insert(".CSV".to_string(), vec!["mksqlite".to_string()]);
        _ = commands.insert("xlsx".to_string(), vec!["mksqlite".to_string()]);
        let registry = ConverterRegistry::with_commands(&commands).expect("registry");
        assert_eq!(registry.for_extension("csv").expect("csv").name(), "csv");
        assert!(registry.for_extension("xlsx").is_ok());
        assert!(
            format!("{:?}", registry.for_extension("csv").expect("csv")).contains("CommandConverter")
        );
    }
}
