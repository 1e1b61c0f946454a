// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! TTL-gated artifact cache
//!
//! Each key maps to `<cache_dir>/<key>.db`. Artifacts are rebuilt into a
//! temporary sibling and renamed over the final path only when the build
//! succeeds, so readers never observe a partial file and a failed rebuild
//! leaves the previous artifact in place.
//!
//! Concurrent misses for the same key share one build through [`BuildGate`].

use crate::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

/// Subdirectory of the cache directory holding downloaded sources
pub const STAGING_DIR: &str = "staging";

/// Temporary artifacts older than this belong to abandoned builds
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Missing,
    Valid,
    Expired,
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CacheState::Missing => "MISSING",
            CacheState::Valid => "VALID",
            CacheState::Expired => "EXPIRED",
        })
    }
}

/// Classify an artifact by existence, size and age
///
/// A TTL of zero means the artifact is always expired.
pub async fn validate(path: &Path, ttl_minutes: u32) -> Result<CacheState> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CacheState::Missing),
        Err(e) => return Err(e.into()),
    };

    if metadata.len() == 0 || ttl_minutes == 0 {
        return Ok(CacheState::Expired);
    }

    let modified = metadata.modified()?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    let ttl = Duration::from_secs(u64::from(ttl_minutes) * 60);

    Ok(if age > ttl {
        CacheState::Expired
    } else {
        CacheState::Valid
    })
}

/// Artifact handed back by [`CacheStore::get_or_build`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub path: PathBuf,
    /// State observed before any rebuild
    pub state: CacheState,
}

/// Directory of converted SQLite artifacts
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    gate: BuildGate,
}

impl CacheStore {
    /// Open (creating if needed) a cache directory
    ///
    /// Temporary artifacts older than [`STALE_TEMP_AGE`] are removed; a
    /// converter that outlives its deadline can leave one behind.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(STAGING_DIR)).map_err(|e| {
            Error::io(format!("cannot create cache directory '{}': {}", dir.display(), e))
        })?;
        let store = Self {
            dir,
            gate: BuildGate::default(),
        };
        _ = store.sweep_stale_temps(STALE_TEMP_AGE);
        Ok(store)
    }

    /// Remove `*.tmp` artifacts older than `max_age`, returning how many went
    pub fn sweep_stale_temps(&self, max_age: Duration) -> u64 {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                diagnostics::warn!("Cannot scan cache directory: {error}", error: e.to_string().as_str());
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0u64;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension() != Some(std::ffi::OsStr::new("tmp")) {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age);
            if !stale {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    let shown = path.display().to_string();
                    diagnostics::warn!(
                        "Could not remove {path}: {error}",
                        path: shown.as_str(),
                        error: e.to_string().as_str()
                    );
                }
            }
        }

        if removed > 0 {
            diagnostics::info!("Removed {removed} abandoned temporary artifacts", removed: removed);
        }
        removed
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.db", key))
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    pub async fn state(&self, key: &str, ttl_minutes: u32) -> Result<CacheState> {
        validate(&self.artifact_path(key), ttl_minutes).await
    }

    /// Build a fresh artifact for `key` and atomically install it
    ///
    /// `build` receives a path that does not exist yet and must leave a
    /// SQLite database there.
    pub async fn regenerate<F, Fut>(&self, key: &str, build: F) -> Result<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let final_path = self.artifact_path(key);
        let temp = tempfile::Builder::new()
            .prefix(&format!("{}.", key))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| Error::io(format!("cannot create temporary artifact: {}", e)))?
            .into_temp_path();

        // Builders expect to create the file themselves.
        tokio::fs::remove_file(&temp).await?;

        build(temp.to_path_buf()).await?;

        let size = tokio::fs::metadata(&temp)
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        if size == 0 {
            return Err(Error::conversion(format!("build for '{}' produced an empty artifact", key)));
        }

        temp.persist(&final_path).map_err(|e| {
            Error::io(format!(
                "cannot install artifact '{}': {}",
                final_path.display(),
                e.error
            ))
        })?;

        let installed = final_path.display().to_string();
        diagnostics::debug!("Installed artifact {path}", path: installed.as_str());
        Ok(final_path)
    }

    /// Return a valid artifact for `key`, building it at most once across
    /// concurrent callers
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &str,
        ttl_minutes: u32,
        build: F,
    ) -> Result<CachedArtifact>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let path = self.artifact_path(key);
        let state = validate(&path, ttl_minutes).await?;
        if state == CacheState::Valid {
            diagnostics::info!("Cache hit for {key}", key: key);
            return Ok(CachedArtifact { path, state });
        }

        let state_name = state.to_string();
        diagnostics::info!("Cache {state} for {key}, building", state: state_name.as_str(), key: key);
        let path = self
            .gate
            .run(key, || async {
                // A previous leader may have finished between our check and now.
                if validate(&path, ttl_minutes).await? == CacheState::Valid {
                    return Ok(path.clone());
                }
                self.regenerate(key, build).await
            })
            .await?;

        Ok(CachedArtifact { path, state })
    }
}

type SharedOutcome = watch::Receiver<Option<Result<PathBuf>>>;

/// Per-key single flight
///
/// The first caller for a key runs the build; later callers wait on a
/// watch channel and receive a clone of the same result. If the leading
/// future is dropped before finishing, waiters get [`Error::Cancelled`].
#[derive(Debug, Default)]
pub struct BuildGate {
    inflight: Mutex<HashMap<String, SharedOutcome>>,
}

enum Role {
    Leader(watch::Sender<Option<Result<PathBuf>>>),
    Follower(SharedOutcome),
}

impl BuildGate {
    fn join(&self, key: &str) -> Role {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = inflight.get(key) {
            if rx.has_changed().is_ok() {
                return Role::Follower(rx.clone());
            }
        }
        let (tx, rx) = watch::channel(None);
        _ = inflight.insert(key.to_string(), rx);
        Role::Leader(tx)
    }

    fn leave(&self, key: &str) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        _ = inflight.remove(key);
    }

    /// Number of keys currently being built
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn run<F, Fut>(&self, key: &str, build: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf>>,
    {
        match self.join(key) {
            Role::Follower(mut rx) => {
                diagnostics::debug!("Waiting on in-flight build for {key}", key: key);
                match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome
                        .clone()
                        .unwrap_or_else(|| Err(Error::Cancelled(key.to_string()))),
                    Err(_) => Err(Error::Cancelled(key.to_string())),
                }
            }
            Role::Leader(tx) => {
                let _guard = InflightGuard { gate: self, key };
                let outcome = build().await;
                _ = tx.send_replace(Some(outcome.clone()));
                outcome
            }
        }
    }
}

/// Removes the in-flight entry when the leader finishes or is dropped
struct InflightGuard<'a> {
    gate: &'a BuildGate,
    key: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn age_file(path: &Path, by: Duration) {
        let file = std::fs::File::options()
            .write(true)
            .open(path)
            .expect("open artifact");
        file.set_modified(SystemTime::now() - by)
            .expect("set mtime");
    }

    #[tokio::test]
    async fn test_validate_states() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("k.db");
        assert_eq!(validate(&path, 10).await.expect("validate"), CacheState::Missing);

        std::fs::write(&path, b"").expect("write");
        assert_eq!(validate(&path, 10).await.expect("validate"), CacheState::Expired);

        std::fs::write(&path, b"data").expect("write");
        assert_eq!(validate(&path, 10).await.expect("validate"), CacheState::Valid);
        assert_eq!(validate(&path, 0).await.expect("validate"), CacheState::Expired);

        age_file(&path, Duration::from_secs(11 * 60));
        assert_eq!(validate(&path, 10).await.expect("validate"), CacheState::Expired);
    }

    #[test]
    fn test_open_sweeps_abandoned_temps() {
        let tmp = TempDir::new().expect("tempdir");
        let abandoned = tmp.path().join("k.a1b2c3.tmp");
        let in_progress = tmp.path().join("k.d4e5f6.tmp");
        let artifact = tmp.path().join("k.db");
        for path in [&abandoned, &in_progress, &artifact] {
            std::fs::write(path, b"data").expect("write");
        }
        age_file(&abandoned, Duration::from_secs(2 * 60 * 60));
        age_file(&artifact, Duration::from_secs(2 * 60 * 60));

        let store = CacheStore::open(tmp.path()).expect("store");
        assert!(!abandoned.exists());
        assert!(in_progress.exists());
        assert!(artifact.exists());
        assert_eq!(store.sweep_stale_temps(STALE_TEMP_AGE), 0);
    }

    #[tokio::test]
    async fn test_regenerate_installs_atomically() {
        let tmp = TempDir::new().expect("tempdir");
        let store = CacheStore::open(tmp.path()).expect("store");

        let path = store
            .regenerate("k", |dest| async move {
                tokio::fs::write(&dest, b"first").await?;
                Ok::<(), Error>(())
            })
            .await
            .expect("build");
        assert_eq!(path, store.artifact_path("k"));
        assert_eq!(std::fs::read(&path).expect("read"), b"first");
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous_artifact() {
        let tmp = TempDir::new().expect("tempdir");
        let store = CacheStore::open(tmp.path()).expect("store");
        std::fs::write(store.artifact_path("k"), b"previous").expect("seed");

        let err = store
            .regenerate("k", |dest| async move {
                tokio::fs::write(&dest, b"partial").await?;
                Err::<(), Error>(Error::conversion("bad input"))
            })
            .await
            .expect_err("build fails");
        assert_eq!(err.kind(), crate::ErrorKind::ConversionFailed);
        assert_eq!(std::fs::read(store.artifact_path("k")).expect("read"), b"previous");

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .expect("readdir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_empty_build_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let store = CacheStore::open(tmp.path()).expect("store");
        let err = store
            .regenerate("k", |_dest| async { Ok::<(), Error>(()) })
            .await
            .expect_err("nothing written");
        assert_eq!(err.kind(), crate::ErrorKind::ConversionFailed);
        assert!(!store.artifact_path("k").exists());
    }

    #[tokio::test]
    async fn test_valid_artifact_is_not_rebuilt() {
        let tmp = TempDir::new().expect("tempdir");
        let store = CacheStore::open(tmp.path()).expect("store");
        std::fs::write(store.artifact_path("k"), b"cached").expect("seed");

        let built = store
            .get_or_build("k", 60, |_dest| async {
                Err::<(), Error>(Error::io("must not build"))
            })
            .await
            .expect("hit");
        assert_eq!(built.state, CacheState::Valid);
    }

    #[tokio::test]
    async fn test_concurrent_misses_build_once() {
        let tmp = TempDir::new().expect("tempdir");
        let store = CacheStore::open(tmp.path()).expect("store");
        let builds = Arc::new(AtomicUsize::new(0));

        let build = |counter: Arc<AtomicUsize>| {
            move |dest: PathBuf| async move {
                _ = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                tokio::fs::write(&dest, b"built").await?;
                Ok::<(), Error>(())
            }
        };

        let (a, b) = tokio::join!(
            store.get_or_build("k", 60, build(builds.clone())),
            store.get_or_build("k", 60, build(builds.clone())),
        );
        assert_eq!(a.expect("a").path, b.expect("b").path);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(store.gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_leader_cancels_followers() {
        let gate = BuildGate::default();

        let mut leader = Box::pin(gate.run("k", || std::future::pending::<Result<PathBuf>>()));
        assert!(futures::poll!(leader.as_mut()).is_pending());

        let mut follower = Box::pin(gate.run("k", || async {
            Err::<PathBuf, Error>(Error::io("follower must not build"))
        }));
        assert!(futures::poll!(follower.as_mut()).is_pending());

        drop(leader);
        let err = follower.await.expect_err("cancelled");
        assert_eq!(err, Error::Cancelled("k".to_string()));
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_next_call_retries() {
        let gate = BuildGate::default();
        let (a, b) = tokio::join!(
            gate.run("k", || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<PathBuf, Error>(Error::not_found("source gone"))
            }),
            gate.run("k", || async { Ok::<PathBuf, Error>(PathBuf::from("/never")) }),
        );
        assert_eq!(a.clone().expect_err("a"), b.expect_err("b"));
        assert_eq!(a.expect_err("a").kind(), crate::ErrorKind::NotFound);

        let retry = gate.run("k", || async { Ok::<PathBuf, Error>(PathBuf::from("/ok")) }).await;
        assert_eq!(retry.expect("retry"), PathBuf::from("/ok"));
    }
}
