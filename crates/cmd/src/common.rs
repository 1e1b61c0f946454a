// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use nestql::{Config, Engine, ErrorKind};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "NESTQL_CONFIG";

/// Get the config path with an optional override, falling back to NESTQL_CONFIG
pub fn config_path_with_override(override_path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(path);
    }

    env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .map_err(|_| anyhow!("{} environment variable not set and no --config given", CONFIG_ENV))
}

/// Load the configuration and open the cache it names
pub fn open_engine(config_path: Option<PathBuf>) -> Result<Engine> {
    let path = config_path_with_override(config_path)?;
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    let engine = Engine::new(Arc::new(config))?;
    Ok(engine)
}

/// Process exit code for a failed command
#[must_use]
pub fn exit_code(err: &anyhow::Error) -> u8 {
    let Some(err) = err.downcast_ref::<nestql::Error>() else {
        return 1;
    };
    match err.kind() {
        ErrorKind::MalformedRequest => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::ConversionFailed => 4,
        ErrorKind::IoFailure => 5,
        ErrorKind::QueryFailed => 6,
        ErrorKind::Config => 7,
        ErrorKind::Timeout => 8,
        ErrorKind::Cancelled => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_wins() {
        let path = config_path_with_override(Some(PathBuf::from("/etc/nestql.yaml"))).expect("path");
        assert_eq!(path, PathBuf::from("/etc/nestql.yaml"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&anyhow!("plain")), 1);
        assert_eq!(exit_code(&nestql::Error::malformed("x").into()), 2);
        assert_eq!(exit_code(&nestql::Error::not_found("x").into()), 3);

        let wrapped = anyhow::Error::from(nestql::Error::config("x")).context("loading");
        assert_eq!(exit_code(&wrapped), 7);
    }
}
