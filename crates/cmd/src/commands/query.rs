// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use nestql::{Engine, OutputFormat, RequestOptions};

/// Serve one nested request path and render its rows to `out`
pub async fn query_command(
    engine: &Engine,
    request_path: &str,
    format: OutputFormat,
    deadline_secs: Option<u64>,
    out: &mut (dyn Write + Send),
) -> Result<()> {
    diagnostics::debug!("query_command called with {path}", path: request_path);

    let options = match deadline_secs {
        Some(secs) => RequestOptions::with_deadline(Duration::from_secs(secs)),
        None => RequestOptions::default(),
    };

    let served = engine.serve(request_path, &options).await?;
    let rows = format
        .renderer()
        .render(served.result, &served.links, out)
        .await?;
    out.flush()?;

    diagnostics::info!("Rendered {rows} rows for {key}", rows: rows, key: served.key.as_str());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestql::{Config, Settings};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(tmp: &TempDir) -> Engine {
        let root = tmp.path().join("serve");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(root.join("flow.csv"), "site,rate\nnorth,4\nsouth,7\n").expect("write");
        let settings = Settings::new(tmp.path().join("cache")).with_serve_root(root);
        Engine::new(Arc::new(Config::new(settings))).expect("engine")
    }

    #[tokio::test]
    async fn test_query_csv() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = engine(&tmp);
        let mut out = Vec::new();
        query_command(&engine, "/flow.csv?orderby=rate&sortdirection=desc", OutputFormat::Csv, None, &mut out)
            .await
            .expect("query");
        assert_eq!(String::from_utf8(out).expect("utf8"), "site,rate\nsouth,7\nnorth,4\n");
    }

    #[tokio::test]
    async fn test_query_count_with_deadline() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = engine(&tmp);
        let mut out = Vec::new();
        query_command(&engine, "/flow.csv", OutputFormat::Count, Some(30), &mut out)
            .await
            .expect("query");
        assert_eq!(String::from_utf8(out).expect("utf8"), "2\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = engine(&tmp);
        let mut out = Vec::new();
        let err = query_command(&engine, "/nope.csv", OutputFormat::Table, None, &mut out)
            .await
            .expect_err("missing");
        assert_eq!(crate::common::exit_code(&err), 3);
        assert!(out.is_empty());
    }
}
