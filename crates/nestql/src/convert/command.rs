// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Converters that are not built in: SQLite passthrough and external commands

use super::{ConvertHints, Converter};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncReadExt;

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Sources that are already SQLite databases are copied verbatim
#[derive(Debug, Clone, Default)]
pub struct SqliteCopy;

#[async_trait]
impl Converter for SqliteCopy {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn convert(&self, source: &Path, dest: &Path, _hints: &ConvertHints) -> Result<()> {
        let mut header = [0u8; 16];
        let mut file = tokio::fs::File::open(source).await?;
        let read = file.read(&mut header).await?;
        if read < header.len() || &header != SQLITE_MAGIC {
            return Err(Error::conversion(format!(
                "'{}' is not a SQLite database",
                source.display()
            )));
        }
        drop(file);

        _ = tokio::fs::copy(source, dest).await?;
        Ok(())
    }
}

/// External program invoked as `argv`, with `{input}` and `{output}` replaced
/// by the staged source and destination paths
#[derive(Debug, Clone)]
pub struct CommandConverter {
    name: String,
    argv: Vec<String>,
}

impl CommandConverter {
    pub fn new<S: Into<String>>(name: S, argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(Error::config("converter command is empty"));
        }
        Ok(Self {
            name: name.into(),
            argv,
        })
    }

    fn expand(&self, source: &Path, dest: &Path) -> Vec<String> {
        let input = source.to_string_lossy();
        let output = dest.to_string_lossy();
        self.argv
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl Converter for CommandConverter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn convert(&self, source: &Path, dest: &Path, hints: &ConvertHints) -> Result<()> {
        let argv = self.expand(source, dest);
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::config("converter command is empty"));
        };

        diagnostics::debug!("Running converter {program}", program: program.as_str());
        let output = tokio::process::Command::new(program)
            .args(args)
            .env("NESTQL_TABLE", &hints.table_name)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::conversion(format!("cannot run converter '{}': {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::conversion(format!(
                "converter '{}' exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
