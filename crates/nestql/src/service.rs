// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! One request, end to end
//!
//! [`Engine`] owns the long-lived pieces (configuration, cache directory,
//! backend handles, converters) and runs the pipeline for each request:
//! resolve, key, validate, build on a miss, compose and stream.

use crate::cache::{CacheState, CacheStore};
use crate::cache_key::cache_key;
use crate::config::ConfigStore;
use crate::convert::{ConverterRegistry, DEFAULT_TABLE};
use crate::fetch::{FetchConvert, LISTING_COLUMNS};
use crate::query::{QueryShape, compose_catalog};
use crate::remote::BackendRegistry;
use crate::request::NestedRequest;
use crate::resolve::{Resolution, resolve};
use crate::stream::{QueryResult, RowLinks, execute, table_columns};
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Per-request knobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Overrides the configured fetch and convert timeouts
    pub deadline: Option<Duration>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }
}

/// A request resolved and keyed, before any I/O
#[derive(Debug, Clone)]
pub struct Plan {
    pub request: NestedRequest,
    pub resolution: Resolution,
    pub key: String,
}

/// The outcome of serving one request
#[derive(Debug)]
pub struct Served {
    pub request: NestedRequest,
    pub resolution: Resolution,
    pub key: String,
    pub artifact: PathBuf,
    /// Cache state seen before any rebuild
    pub cache_state: CacheState,
    pub sql: String,
    pub result: QueryResult,
    pub links: RowLinks,
}

pub struct Engine {
    config: Arc<dyn ConfigStore>,
    cache: CacheStore,
    backends: BackendRegistry,
    converters: ConverterRegistry,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("cache", &self.cache)
            .field("backends", &self.backends.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the cache directory and build the converter table
    pub fn new(config: Arc<dyn ConfigStore>) -> Result<Self> {
        let settings = config.settings();
        let cache = CacheStore::open(settings.cache_dir.clone())?;
        let converters = ConverterRegistry::with_commands(&settings.converters)?;
        Ok(Self {
            config,
            cache,
            backends: BackendRegistry::new(),
            converters,
        })
    }

    #[must_use]
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    #[must_use]
    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Parse, resolve and key a raw request path
    pub fn plan(&self, raw: &str) -> Result<Plan> {
        let request = NestedRequest::parse(raw)?;
        let resolution = resolve(&request, self.config.as_ref())?;
        let key = cache_key(&request, &resolution);
        Ok(Plan {
            request,
            resolution,
            key,
        })
    }

    /// Cache state for a plan, without building anything
    pub async fn status(&self, plan: &Plan) -> Result<CacheState> {
        self.cache.state(&plan.key, plan.resolution.ttl_minutes).await
    }

    fn timeouts(&self, options: &RequestOptions) -> (Option<Duration>, Option<Duration>) {
        if let Some(deadline) = options.deadline {
            return (Some(deadline), Some(deadline));
        }
        let settings = self.config.settings();
        (
            settings.fetch_timeout_secs.map(Duration::from_secs),
            settings.convert_timeout_secs.map(Duration::from_secs),
        )
    }

    /// Return a valid artifact for the plan, building it on a miss
    pub async fn ensure_artifact(&self, plan: &Plan, options: &RequestOptions) -> Result<(PathBuf, CacheState)> {
        let resolution = &plan.resolution;
        let store = self.backends.get(&resolution.backend)?;
        let (fetch_timeout, convert_timeout) = self.timeouts(options);
        let fetch = FetchConvert::new(&self.converters, self.cache.staging_dir())
            .with_timeouts(fetch_timeout, convert_timeout);

        let remote = resolution.remote_name();
        let fingerprint = resolution.stored_fingerprint.get(..16).unwrap_or_default();
        diagnostics::debug!(
            "Ensuring {key} from remote {remote} ({fingerprint})",
            key: plan.key.as_str(),
            remote: remote,
            fingerprint: fingerprint
        );

        let artifact = self
            .cache
            .get_or_build(&plan.key, resolution.ttl_minutes, |dest| {
                let fetch = &fetch;
                let store = &store;
                async move {
                    fetch
                        .build(store.as_ref(), &resolution.source_path, &plan.key, &dest)
                        .await
                        .map(|_| ())
                }
            })
            .await?;
        Ok((artifact.path, artifact.state))
    }

    /// Choose the statement for a plan against its artifact
    ///
    /// A request naming no table on an artifact without the default table
    /// gets the artifact's catalog instead. Returns whether the rows form a
    /// navigable view (a directory listing or a catalog).
    async fn compose(&self, plan: &Plan, artifact: &Path) -> Result<(String, bool)> {
        let resolution = &plan.resolution;
        if resolution.table.is_some() {
            let shape = QueryShape::from_request(&plan.request, resolution.table.clone(), resolution.column.clone());
            return Ok((shape.compose(), false));
        }
        let columns = table_columns(artifact, DEFAULT_TABLE).await?;
        if columns.is_empty() {
            diagnostics::debug!("No {table} in {key}, listing catalog", table: DEFAULT_TABLE, key: plan.key.as_str());
            return Ok((compose_catalog(), true));
        }

        let shape = QueryShape::from_request(&plan.request, None, resolution.column.clone());
        let is_listing = columns.iter().map(String::as_str).eq(LISTING_COLUMNS);
        Ok((shape.compose(), is_listing))
    }

    /// Serve a raw request path
    pub async fn serve(&self, raw: &str, options: &RequestOptions) -> Result<Served> {
        let plan = self.plan(raw)?;
        let (artifact, cache_state) = self.ensure_artifact(&plan, options).await?;
        let (sql, navigable) = self.compose(&plan, &artifact).await?;

        let debug = plan.request.debug;
        if debug {
            diagnostics::info!("Query for {key}: {sql}", key: plan.key.as_str(), sql: sql.as_str());
        }

        let result = execute(&artifact, &sql, debug).await?;
        let links = if navigable {
            RowLinks::detect(&result.columns, &plan.resolution.dataset_address)
        } else {
            RowLinks::none()
        };

        let state_name = cache_state.to_string();
        diagnostics::info!(
            "Serving {key} ({state}) with {columns} columns",
            key: plan.key.as_str(),
            state: state_name.as_str(),
            columns: result.columns.len()
        );

        let Plan {
            request,
            resolution,
            key,
        } = plan;
        Ok(Served {
            request,
            resolution,
            key,
            artifact,
            cache_state,
            sql,
            result,
            links,
        })
    }
}
