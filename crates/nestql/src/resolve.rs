// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Map a parsed request onto a configured remote
//!
//! Resolution order: named pipeline, then local mode, then alias (userinfo
//! or first path segment). The stored remote configuration is never
//! modified; fields inferred from the request go into a derived copy.

use crate::config::{BackendConfig, ConfigStore, RemoteDescriptor};
use crate::request::{NestedRequest, PIPELINE_MARKER};
use crate::{Error, Result};

/// How a request reached its remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Pipeline { id: String, name: String },
    Alias { name: String },
    Local,
}

/// Everything needed to key, build and query one request
#[derive(Debug, Clone)]
pub struct Resolution {
    pub route: Route,
    /// Stored configuration with request-derived fields filled in
    pub backend: BackendConfig,
    /// Fingerprint of the stored (not derived) configuration
    pub stored_fingerprint: String,
    /// Path within the backend, without a leading slash; empty for the root
    pub source_path: String,
    pub ttl_minutes: u32,
    pub table: Option<String>,
    pub column: Option<String>,
    /// Address of the data set as the client sees it, used for links
    pub dataset_address: String,
}

impl Resolution {
    #[must_use]
    pub fn remote_name(&self) -> &str {
        match &self.route {
            Route::Pipeline { name, .. } | Route::Alias { name } => name,
            Route::Local => "local",
        }
    }
}

/// Resolve a request against the configuration store
pub fn resolve(request: &NestedRequest, config: &dyn ConfigStore) -> Result<Resolution> {
    if request.is_pipeline() {
        if let Some(resolution) = resolve_pipeline(request, config)? {
            return Ok(resolution);
        }
    }

    if request.is_local() {
        return resolve_local(request, config);
    }

    resolve_alias(request, config)
}

fn resolve_pipeline(request: &NestedRequest, config: &dyn ConfigStore) -> Result<Option<Resolution>> {
    let segments = request.path_segments();
    let Some(name) = segments.get(1) else {
        return Ok(None);
    };
    let Some(pipeline) = config.pipeline(name) else {
        return Ok(None);
    };
    if segments.len() > 4 {
        return Err(Error::malformed(format!(
            "pipeline '{}' takes at most <table>/<column>, got '{}'",
            pipeline.name, request
        )));
    }

    let remote = config.enabled_remote(&pipeline.remote).ok_or_else(|| {
        Error::not_found(format!(
            "pipeline '{}' remote '{}' is not available",
            pipeline.name, pipeline.remote
        ))
    })?;

    let ttl_minutes = pipeline
        .ttl_minutes
        .or(remote.ttl_minutes)
        .unwrap_or(config.settings().default_ttl_minutes);

    diagnostics::debug!(
        "Resolved pipeline {pipeline} to remote {remote} path {path}",
        pipeline: pipeline.name.as_str(),
        remote: remote.name.as_str(),
        path: pipeline.path.as_str()
    );

    Ok(Some(Resolution {
        route: Route::Pipeline {
            id: pipeline.id.clone(),
            name: pipeline.name.clone(),
        },
        stored_fingerprint: remote.backend.fingerprint(),
        backend: remote.backend,
        source_path: pipeline.path.trim_matches('/').to_string(),
        ttl_minutes,
        table: segments.get(2).map(|s| s.to_string()),
        column: segments.get(3).map(|s| s.to_string()),
        dataset_address: format!("/{}/{}", PIPELINE_MARKER, pipeline.name),
    }))
}

fn resolve_local(request: &NestedRequest, config: &dyn ConfigStore) -> Result<Resolution> {
    let settings = config.settings();
    let root = settings.serve_root.clone().ok_or_else(|| {
        Error::not_found(format!(
            "'{}' has no scheme and local serving is not configured",
            request.data_set_path
        ))
    })?;

    let backend = BackendConfig::Local { root };
    Ok(Resolution {
        route: Route::Local,
        stored_fingerprint: backend.fingerprint(),
        backend,
        source_path: request.data_set_path.trim_matches('/').to_string(),
        ttl_minutes: settings.default_ttl_minutes,
        table: request.table.clone(),
        column: request.column_path.clone(),
        dataset_address: request.dataset_address(),
    })
}

fn resolve_alias(request: &NestedRequest, config: &dyn ConfigStore) -> Result<Resolution> {
    let trimmed = request.data_set_path.trim_matches('/');
    let (alias, mut path) = match &request.user_alias {
        Some(alias) => (alias.clone(), trimmed.to_string()),
        None => match trimmed.split_once('/') {
            Some((first, rest)) => (first.to_string(), rest.to_string()),
            None if !trimmed.is_empty() => (trimmed.to_string(), String::new()),
            None => {
                return Err(Error::malformed(format!(
                    "'{}' names no remote alias",
                    request
                )));
            }
        },
    };

    // Disabled and absent remotes get the same answer.
    let remote: RemoteDescriptor = config
        .enabled_remote(&alias)
        .ok_or_else(|| Error::not_found(format!("remote alias '{}' for '{}'", alias, request)))?;

    let mut backend = remote.backend.clone();
    if backend.requires_endpoint() && backend.endpoint().is_none() {
        if let (Some(scheme), Some(host)) = (&request.scheme, &request.host) {
            backend = backend.with_endpoint(&format!("{}://{}", scheme, host));
        }
    }

    if let BackendConfig::S3 { bucket: None, .. } = &backend {
        let (bucket, rest) = match path.split_once('/') {
            Some((b, r)) => (b.to_string(), r.to_string()),
            None => (path.clone(), String::new()),
        };
        if bucket.is_empty() {
            return Err(Error::malformed(format!(
                "remote '{}' has no bucket and '{}' names none",
                alias, request
            )));
        }
        backend = backend.with_bucket(&bucket);
        path = rest;
    }

    let ttl_minutes = remote
        .ttl_minutes
        .unwrap_or(config.settings().default_ttl_minutes);

    diagnostics::debug!(
        "Resolved alias {alias} ({kind}) path {path}",
        alias: alias.as_str(),
        kind: backend.kind(),
        path: path.as_str()
    );

    Ok(Resolution {
        route: Route::Alias { name: alias },
        stored_fingerprint: remote.backend.fingerprint(),
        backend,
        source_path: path,
        ttl_minutes,
        table: request.table.clone(),
        column: request.column_path.clone(),
        dataset_address: request.dataset_address(),
    })
}
