// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;

use anyhow::Result;
use nestql::Engine;

/// Show how a request path is parsed, routed and keyed
pub async fn resolve_command(engine: &Engine, request_path: &str, out: &mut dyn Write) -> Result<()> {
    let plan = engine.plan(request_path)?;
    let state = engine.status(&plan).await?;
    let request = &plan.request;
    let resolution = &plan.resolution;
    let none = "-";

    writeln!(out, "=== Request ===")?;
    writeln!(out, "descriptor:    {}", request)?;
    writeln!(out, "scheme:        {}", request.scheme.as_deref().unwrap_or(none))?;
    writeln!(out, "alias:         {}", request.user_alias.as_deref().unwrap_or(none))?;
    writeln!(out, "host:          {}", request.host.as_deref().unwrap_or(none))?;
    writeln!(out, "data set path: {}", request.data_set_path)?;
    writeln!(out, "table:         {}", resolution.table.as_deref().unwrap_or(none))?;
    writeln!(out, "column:        {}", resolution.column.as_deref().unwrap_or(none))?;

    writeln!(out, "=== Resolution ===")?;
    writeln!(out, "remote:        {}", resolution.remote_name())?;
    writeln!(out, "backend:       {}", resolution.backend.kind())?;
    writeln!(out, "source path:   /{}", resolution.source_path)?;
    writeln!(out, "ttl minutes:   {}", resolution.ttl_minutes)?;
    writeln!(out, "cache key:     {}", plan.key)?;
    writeln!(out, "artifact:      {}", engine.cache().artifact_path(&plan.key).display())?;
    writeln!(out, "cache state:   {}", state)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestql::{BackendConfig, Config, RemoteDescriptor, Settings};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_alias_request() {
        let tmp = TempDir::new().expect("tempdir");
        let settings = Settings::new(tmp.path().join("cache"));
        let config = Config::new(settings).with_remote(
            RemoteDescriptor::new("files", BackendConfig::Local { root: tmp.path().to_path_buf() })
                .with_ttl(15),
        );
        let engine = Engine::new(Arc::new(config)).expect("engine");

        let mut out = Vec::new();
        resolve_command(&engine, "/https:/files@example.org/reports/q1.csv/tb0", &mut out)
            .await
            .expect("resolve");
        let text = String::from_utf8(out).expect("utf8");

        assert!(text.contains("scheme:        https"), "{text}");
        assert!(text.contains("alias:         files"), "{text}");
        assert!(text.contains("host:          example.org"), "{text}");
        assert!(text.contains("data set path: /reports/q1.csv"), "{text}");
        assert!(text.contains("table:         tb0"), "{text}");
        assert!(text.contains("backend:       local"), "{text}");
        assert!(text.contains("ttl minutes:   15"), "{text}");
        assert!(text.contains("cache state:   MISSING"), "{text}");
    }
}
