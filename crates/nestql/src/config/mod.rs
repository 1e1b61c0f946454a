// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Remote, pipeline and service configuration
//!
//! Configuration is loaded once from YAML (after `env()` template expansion)
//! and validated at that boundary. Backend settings are a typed enum, so the
//! rest of the pipeline never decodes loose maps.

mod template;

pub use template::expand_config_template;

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default artifact lifetime: one day
pub const DEFAULT_TTL_MINUTES: u32 = 1440;

/// A credential value that never appears in Debug output or logs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Storage backend settings, one variant per backend kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Host directory
    Local { root: PathBuf },

    /// Plain HTTP(S) file server
    Http {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// S3 or an S3-compatible service (R2, MinIO)
    S3 {
        /// When absent, the first path segment of each request names the bucket
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bucket: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_key_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret_access_key: Option<Secret>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

impl BackendConfig {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Local { .. } => "local",
            BackendConfig::Http { .. } => "http",
            BackendConfig::S3 { .. } => "s3",
        }
    }

    /// Whether this backend talks to a network endpoint
    #[must_use]
    pub fn requires_endpoint(&self) -> bool {
        matches!(self, BackendConfig::Http { .. } | BackendConfig::S3 { .. })
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            BackendConfig::Local { .. } => None,
            BackendConfig::Http { endpoint } | BackendConfig::S3 { endpoint, .. } => {
                endpoint.as_deref()
            }
        }
    }

    /// Copy of this configuration with `endpoint` filled in, if it has an endpoint slot
    #[must_use]
    pub fn with_endpoint(&self, new_endpoint: &str) -> BackendConfig {
        let mut derived = self.clone();
        match &mut derived {
            BackendConfig::Local { .. } => {}
            BackendConfig::Http { endpoint } | BackendConfig::S3 { endpoint, .. } => {
                *endpoint = Some(new_endpoint.to_string());
            }
        }
        derived
    }

    /// Copy of an S3 configuration with the bucket filled in
    #[must_use]
    pub fn with_bucket(&self, new_bucket: &str) -> BackendConfig {
        let mut derived = self.clone();
        if let BackendConfig::S3 { bucket, .. } = &mut derived {
            *bucket = Some(new_bucket.to_string());
        }
        derived
    }

    /// Content digest of the canonical serialized form
    ///
    /// Stable across processes: struct fields serialize in declaration order.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_else(|_| format!("{:?}", self).into_bytes());
        hex::encode(Sha256::digest(&canonical))
    }

    fn validate(&self, remote: &str) -> Result<()> {
        match self {
            BackendConfig::Local { root } => {
                if !root.is_absolute() {
                    return Err(Error::config(format!(
                        "remote '{}': local root '{}' must be absolute",
                        remote,
                        root.display()
                    )));
                }
            }
            BackendConfig::Http { endpoint } => validate_endpoint(remote, endpoint.as_deref())?,
            BackendConfig::S3 {
                bucket, endpoint, ..
            } => {
                if bucket.as_deref().is_some_and(|b| b.trim().is_empty()) {
                    return Err(Error::config(format!("remote '{}': bucket is empty", remote)));
                }
                validate_endpoint(remote, endpoint.as_deref())?;
            }
        }
        Ok(())
    }
}

fn validate_endpoint(remote: &str, endpoint: Option<&str>) -> Result<()> {
    if let Some(endpoint) = endpoint {
        let parsed = url::Url::parse(endpoint).map_err(|e| {
            Error::config(format!("remote '{}': invalid endpoint '{}': {}", remote, endpoint, e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "remote '{}': endpoint must be http or https, got '{}'",
                remote,
                parsed.scheme()
            )));
        }
    }
    Ok(())
}

/// A named storage backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDescriptor {
    #[serde(skip)]
    pub name: String,
    pub backend: BackendConfig,
    #[serde(default)]
    pub ttl_minutes: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RemoteDescriptor {
    pub fn new<S: Into<String>>(name: S, backend: BackendConfig) -> Self {
        Self {
            name: name.into(),
            backend,
            ttl_minutes: None,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl_minutes: u32) -> Self {
        self.ttl_minutes = Some(ttl_minutes);
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A named shortcut binding a fixed remote, path and TTL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    #[serde(skip)]
    pub name: String,
    /// Stable identifier used directly as the cache key; defaults to the name
    #[serde(default)]
    pub id: String,
    pub remote: String,
    pub path: String,
    #[serde(default)]
    pub ttl_minutes: Option<u32>,
}

impl PipelineDescriptor {
    pub fn new<N, R, P>(name: N, remote: R, path: P) -> Self
    where
        N: Into<String>,
        R: Into<String>,
        P: Into<String>,
    {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            remote: remote.into(),
            path: path.into(),
            ttl_minutes: None,
        }
    }

    #[must_use]
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl_minutes: u32) -> Self {
        self.ttl_minutes = Some(ttl_minutes);
        self
    }
}

/// Service-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding `<key>.db` artifacts and the `staging/` area
    pub cache_dir: PathBuf,

    /// Root directory for schemeless (local mode) requests
    #[serde(default)]
    pub serve_root: Option<PathBuf>,

    #[serde(default = "default_ttl")]
    pub default_ttl_minutes: u32,

    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,

    #[serde(default)]
    pub convert_timeout_secs: Option<u64>,

    /// External converter commands by file extension, e.g.
    /// `xlsx: ["mksqlite", "-i", "{input}", "-o", "{output}"]`
    #[serde(default)]
    pub converters: BTreeMap<String, Vec<String>>,
}

fn default_ttl() -> u32 {
    DEFAULT_TTL_MINUTES
}

impl Settings {
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            serve_root: None,
            default_ttl_minutes: DEFAULT_TTL_MINUTES,
            fetch_timeout_secs: None,
            convert_timeout_secs: None,
            converters: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_serve_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.serve_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl_minutes: u32) -> Self {
        self.default_ttl_minutes = ttl_minutes;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::config("cache_dir is required"));
        }
        for (ext, argv) in &self.converters {
            if argv.is_empty() {
                return Err(Error::config(format!("converter for '{}' has no program", ext)));
            }
        }
        Ok(())
    }
}

/// Lookup interface over remotes and pipelines
pub trait ConfigStore: Send + Sync {
    fn settings(&self) -> &Settings;

    /// Remote by name, regardless of its enabled flag
    fn remote(&self, name: &str) -> Option<RemoteDescriptor>;

    fn pipeline(&self, name: &str) -> Option<PipelineDescriptor>;

    /// Remote by name, only when enabled
    fn enabled_remote(&self, name: &str) -> Option<RemoteDescriptor> {
        self.remote(name).filter(|r| r.enabled)
    }
}

/// On-disk configuration file shape
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(flatten)]
    settings: Settings,
    #[serde(default)]
    remotes: BTreeMap<String, RemoteDescriptor>,
    #[serde(default)]
    pipelines: BTreeMap<String, PipelineDescriptor>,
}

/// In-memory configuration, loaded from YAML or assembled programmatically
#[derive(Debug, Clone)]
pub struct Config {
    settings: Settings,
    remotes: BTreeMap<String, RemoteDescriptor>,
    pipelines: BTreeMap<String, PipelineDescriptor>,
}

impl Config {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            remotes: BTreeMap::new(),
            pipelines: BTreeMap::new(),
        }
    }

    /// Load and validate a YAML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_config_template(content)?;
        let file: ConfigFile = serde_yaml_ng::from_str(&expanded)?;

        let mut config = Config::new(file.settings);
        for (name, mut remote) in file.remotes {
            remote.name = name;
            config = config.with_remote(remote);
        }
        for (name, mut pipeline) in file.pipelines {
            if pipeline.id.is_empty() {
                pipeline.id = name.clone();
            }
            pipeline.name = name;
            config = config.with_pipeline(pipeline);
        }
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_remote(mut self, remote: RemoteDescriptor) -> Self {
        _ = self.remotes.insert(remote.name.clone(), remote);
        self
    }

    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PipelineDescriptor) -> Self {
        _ = self.pipelines.insert(pipeline.name.clone(), pipeline);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        for remote in self.remotes.values() {
            remote.backend.validate(&remote.name)?;
        }
        for pipeline in self.pipelines.values() {
            if !self.remotes.contains_key(&pipeline.remote) {
                return Err(Error::config(format!(
                    "pipeline '{}' references unknown remote '{}'",
                    pipeline.name, pipeline.remote
                )));
            }
        }
        Ok(())
    }
}

impl ConfigStore for Config {
    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn remote(&self, name: &str) -> Option<RemoteDescriptor> {
        self.remotes.get(name).cloned()
    }

    fn pipeline(&self, name: &str) -> Option<PipelineDescriptor> {
        self.pipelines.get(name).cloned()
    }
}
