// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Remote storage access: stat, open for read, list children
//!
//! Network backends go through `object_store`; local backends read a host
//! directory directly. Connections are cached per configuration
//! fingerprint in a [`BackendRegistry`] owned by the caller.

use crate::config::BackendConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::AsyncRead;

/// One file or directory on a remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Path relative to the backend root
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

impl Entry {
    /// File extension including the dot, empty for directories
    #[must_use]
    pub fn extension(&self) -> String {
        if self.is_dir {
            return String::new();
        }
        Path::new(&self.name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }

    fn directory(path: &str) -> Self {
        Self {
            path: path.to_string(),
            name: last_segment(path).to_string(),
            size: 0,
            modified: None,
            is_dir: true,
        }
    }
}

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> &'static str;

    async fn stat(&self, path: &str) -> Result<Entry>;

    async fn open(&self, path: &str) -> Result<ByteStream>;

    /// Direct children only, sorted by name
    async fn list(&self, path: &str) -> Result<Vec<Entry>>;
}

/// Host directory backend
#[derive(Debug, Clone)]
pub struct HostStore {
    root: PathBuf,
}

impl HostStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn host_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(Error::malformed(format!(
                        "path '{}' escapes the remote root",
                        path
                    )));
                }
            }
        }
        Ok(self.root.join(relative))
    }

    async fn entry_for(&self, path: &str, host: &Path) -> Result<Entry> {
        let metadata = tokio::fs::metadata(host).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("'{}' on local remote", path)),
            _ => Error::from(e),
        })?;
        Ok(host_entry(path, &metadata))
    }

    /// Metadata for a listed child, `None` when it vanished mid-listing
    async fn child_metadata(host: &Path) -> Result<Option<std::fs::Metadata>> {
        match tokio::fs::metadata(host).await {
            Ok(metadata) => Ok(Some(metadata)),
            // A dangling symlink still gets a row, described by the link itself.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match tokio::fs::symlink_metadata(host).await {
                    Ok(metadata) => Ok(Some(metadata)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn host_entry(path: &str, metadata: &std::fs::Metadata) -> Entry {
    Entry {
        path: path.trim_matches('/').to_string(),
        name: last_segment(path).to_string(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        is_dir: metadata.is_dir(),
    }
}

#[async_trait]
impl RemoteStore for HostStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn stat(&self, path: &str) -> Result<Entry> {
        let host = self.host_path(path)?;
        self.entry_for(path, &host).await
    }

    async fn open(&self, path: &str) -> Result<ByteStream> {
        let host = self.host_path(path)?;
        let file = tokio::fs::File::open(&host).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("'{}' on local remote", path)),
            _ => Error::from(e),
        })?;
        Ok(Box::pin(file))
    }

    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        let host = self.host_path(path)?;
        let mut reader = tokio::fs::read_dir(&host).await?;
        let mut entries = Vec::new();
        while let Some(child) = reader.next_entry().await? {
            let name = child.file_name().to_string_lossy().into_owned();
            let child_path = join_path(path, &name);
            match Self::child_metadata(&child.path()).await? {
                Some(metadata) => entries.push(host_entry(&child_path, &metadata)),
                None => {
                    diagnostics::warn!("Skipping {path}, removed while listing", path: child_path.as_str());
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// `object_store` backed remote (HTTP, S3 and S3-compatible)
#[derive(Debug, Clone)]
pub struct ObjectStoreRemote {
    kind: &'static str,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreRemote {
    pub fn new(kind: &'static str, store: Arc<dyn ObjectStore>) -> Self {
        Self { kind, store }
    }

    fn location(path: &str) -> ObjectPath {
        ObjectPath::from(path.trim_matches('/'))
    }

    fn entry(meta: &object_store::ObjectMeta) -> Entry {
        let path = meta.location.to_string();
        Entry {
            name: last_segment(&path).to_string(),
            path,
            size: meta.size,
            modified: Some(meta.last_modified),
            is_dir: false,
        }
    }
}

#[async_trait]
impl RemoteStore for ObjectStoreRemote {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn stat(&self, path: &str) -> Result<Entry> {
        let location = Self::location(path);
        if !location.as_ref().is_empty() {
            match self.store.head(&location).await {
                Ok(meta) => return Ok(Self::entry(&meta)),
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        // No object at this path: a non-empty listing means a directory.
        let prefix = (!location.as_ref().is_empty()).then_some(&location);
        let listing = self.store.list_with_delimiter(prefix).await.map_err(|e| {
            diagnostics::debug!("Listing probe failed: {error}", error: e.to_string().as_str());
            Error::not_found(format!("'{}' on {} remote", path, self.kind))
        })?;
        if listing.objects.is_empty() && listing.common_prefixes.is_empty() {
            return Err(Error::not_found(format!("'{}' on {} remote", path, self.kind)));
        }
        Ok(Entry::directory(location.as_ref()))
    }

    async fn open(&self, path: &str) -> Result<ByteStream> {
        let location = Self::location(path);
        let stream = self
            .store
            .get(&location)
            .await?
            .into_stream()
            .map_err(std::io::Error::other);
        Ok(Box::pin(tokio_util::io::StreamReader::new(stream)))
    }

    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        let location = Self::location(path);
        let prefix = (!location.as_ref().is_empty()).then_some(&location);
        let listing = self.store.list_with_delimiter(prefix).await?;

        let mut entries: Vec<Entry> = listing
            .common_prefixes
            .iter()
            .map(|p| Entry::directory(p.as_ref()))
            .chain(
                listing
                    .objects
                    .iter()
                    .filter(|m| m.location != location)
                    .map(Self::entry),
            )
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Open a store for a (possibly derived) backend configuration
pub fn connect(backend: &BackendConfig) -> Result<Arc<dyn RemoteStore>> {
    match backend {
        BackendConfig::Local { root } => Ok(Arc::new(HostStore::new(root.clone()))),
        BackendConfig::Http { endpoint } => {
            let endpoint = endpoint
                .as_deref()
                .ok_or_else(|| Error::config("http remote has no endpoint and the request named no host"))?;
            let store = object_store::http::HttpBuilder::new()
                .with_url(endpoint)
                .build()
                .map_err(|e| Error::config(format!("Failed to build HTTP store: {}", e)))?;
            Ok(Arc::new(ObjectStoreRemote::new("http", Arc::new(store))))
        }
        BackendConfig::S3 {
            bucket,
            region,
            access_key_id,
            secret_access_key,
            endpoint,
        } => {
            let bucket = bucket
                .as_deref()
                .ok_or_else(|| Error::config("s3 remote has no bucket"))?;
            let mut builder = object_store::aws::AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_region(region.as_deref().unwrap_or("us-east-1"));

            if let Some(key) = access_key_id {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = secret_access_key {
                builder = builder.with_secret_access_key(secret.expose());
            }
            if let Some(endpoint) = endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }

            let store = builder
                .build()
                .map_err(|e| Error::config(format!("Failed to build S3 store: {}", e)))?;
            Ok(Arc::new(ObjectStoreRemote::new("s3", Arc::new(store))))
        }
    }
}

/// Long-lived store handles keyed by configuration fingerprint
#[derive(Debug, Default)]
pub struct BackendRegistry {
    stores: RwLock<HashMap<String, Arc<dyn RemoteStore>>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store for `backend`, connecting on first use
    pub fn get(&self, backend: &BackendConfig) -> Result<Arc<dyn RemoteStore>> {
        let fingerprint = backend.fingerprint();
        {
            let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(store) = stores.get(&fingerprint) {
                return Ok(Arc::clone(store));
            }
        }

        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = stores.get(&fingerprint) {
            return Ok(Arc::clone(store));
        }

        let store = connect(backend)?;
        diagnostics::debug!(
            "Connected {kind} remote {fingerprint}",
            kind: backend.kind(),
            fingerprint: &fingerprint[..16]
        );
        _ = stores.insert(fingerprint, Arc::clone(&store));
        Ok(store)
    }

    /// Register a store for a configuration, replacing any existing handle
    pub fn insert(&self, backend: &BackendConfig, store: Arc<dyn RemoteStore>) {
        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        _ = stores.insert(backend.fingerprint(), store);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn last_segment(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_matches('/');
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}
