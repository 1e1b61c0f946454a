// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;

use anyhow::Result;
use nestql::Engine;

/// Print MISSING, VALID or EXPIRED for a request's artifact without building it
pub async fn status_command(engine: &Engine, request_path: &str, out: &mut dyn Write) -> Result<()> {
    let plan = engine.plan(request_path)?;
    let state = engine.status(&plan).await?;
    writeln!(out, "{}", state)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestql::{Config, RequestOptions, Settings};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_status_before_and_after_build() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("serve");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(root.join("a.csv"), "x\n1\n").expect("write");
        let settings = Settings::new(tmp.path().join("cache")).with_serve_root(root);
        let engine = Engine::new(Arc::new(Config::new(settings))).expect("engine");

        let mut out = Vec::new();
        status_command(&engine, "/a.csv", &mut out).await.expect("status");
        assert_eq!(String::from_utf8(out).expect("utf8"), "MISSING\n");

        let _served = engine.serve("/a.csv", &RequestOptions::default()).await.expect("serve");

        let mut out = Vec::new();
        status_command(&engine, "/a.csv", &mut out).await.expect("status");
        assert_eq!(String::from_utf8(out).expect("utf8"), "VALID\n");
    }
}
