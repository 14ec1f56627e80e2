//! Snapshot cache facade
//!
//! [`SnapshotCache::ensure`] is the single entry point analysis tools go
//! through before touching a snapshot. It parses the reference, serves a
//! fresh snapshot straight from disk, and otherwise runs one coalesced sync
//! per key through the [`CloneManager`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::clone::{CloneManager, SyncError, SyncKind};
use super::flight::{KeyLocks, Role, SingleFlight};
use super::git::{GitCli, GitOps};
use super::paths::remove_tree;
use super::{CacheIndex, CachePaths, RefreshPolicy};
use crate::config::CacheConfig;
use crate::reference::{RepoReference, parse_reference};
use crate::types::{Owner, ParseError, Repo, RepoKey};

/// Errors returned by [`SnapshotCache::ensure`].
///
/// `Clone` so that coalesced callers can share one result.
#[derive(Debug, Clone, Error)]
pub enum EnsureError {
    /// The reference did not parse. Nothing was touched.
    #[error("invalid repository reference: {0}")]
    InvalidReference(#[from] ParseError),
    /// The clone, or the re-clone after a failed refresh, did not complete.
    #[error("failed to clone {key}: {reason}")]
    CloneFailure { key: String, reason: String },
    /// Cancellation was observed before the snapshot was ready.
    #[error("operation cancelled")]
    Cancelled,
    /// Local filesystem failure.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for EnsureError {
    fn from(err: io::Error) -> Self {
        EnsureError::Io(Arc::new(err))
    }
}

impl EnsureError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EnsureError::Cancelled)
    }
}

/// A ready snapshot, handed to read-only consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotHandle {
    /// Working tree of the snapshot.
    pub path: PathBuf,
    pub owner: Owner,
    pub name: Repo,
    /// True when no network operation ran for this call.
    pub served_from_cache: bool,
    /// What the sync did, when one ran.
    pub sync: Option<SyncKind>,
    /// HEAD commit, if it could be read.
    pub commit: Option<String>,
}

impl SnapshotHandle {
    pub fn key(&self) -> RepoKey {
        RepoKey::new(self.owner.clone(), self.name.clone())
    }
}

/// What to remove in [`SnapshotCache::cleanup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupTarget {
    All,
    Key(RepoReference),
}

impl FromStr for CleanupTarget {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim() == "all" {
            Ok(CleanupTarget::All)
        } else {
            parse_reference(s).map(CleanupTarget::Key)
        }
    }
}

/// Result of a cleanup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed(PathBuf),
    NotCached(RepoKey),
    ClearedAll(PathBuf),
}

impl fmt::Display for CleanupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupOutcome::Removed(path) => write!(f, "Removed: {}", path.display()),
            CleanupOutcome::NotCached(key) => write!(f, "{} is not in cache", key),
            CleanupOutcome::ClearedAll(root) => {
                write!(f, "Cleared all repos from {}", root.display())
            }
        }
    }
}

/// A snapshot found on disk.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub key: RepoKey,
    pub path: PathBuf,
    pub last_synced_at: Option<SystemTime>,
    pub is_repository: bool,
}

type EnsureResult = Result<SnapshotHandle, EnsureError>;

/// Bounded-freshness cache of repository snapshots.
pub struct SnapshotCache {
    paths: CachePaths,
    index: Arc<CacheIndex>,
    policy: RefreshPolicy,
    clones: CloneManager,
    flights: SingleFlight<RepoKey, EnsureResult>,
    locks: KeyLocks<RepoKey>,
    /// Syncs and single-key cleanups hold it shared; `cleanup(All)` exclusively.
    tree: RwLock<()>,
    index_file: Option<PathBuf>,
}

impl SnapshotCache {
    /// Build a cache from configuration, seeding the index from the
    /// configured index file if there is one.
    pub fn new(config: &CacheConfig) -> io::Result<Self> {
        let index = match &config.index_file {
            Some(path) => CacheIndex::load(path)?,
            None => CacheIndex::new(),
        };
        let git = Arc::new(GitCli::with_git_path(config.git_path.clone()));
        let mut cache = Self::with_parts(config, Arc::new(index), git);
        cache.index_file = config.index_file.clone();
        Ok(cache)
    }

    /// Build a cache around an existing index and git implementation.
    pub fn with_parts(config: &CacheConfig, index: Arc<CacheIndex>, git: Arc<dyn GitOps>) -> Self {
        Self {
            paths: CachePaths::new(&config.root),
            index,
            policy: RefreshPolicy::new(config.freshness_window),
            clones: CloneManager::new(git, config.clone_depth),
            flights: SingleFlight::new(),
            locks: KeyLocks::new(),
            tree: RwLock::new(()),
            index_file: None,
        }
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// Write the index to the configured index file, if any.
    pub fn save_index(&self) -> io::Result<()> {
        match &self.index_file {
            Some(path) => self.index.save(path),
            None => Ok(()),
        }
    }

    /// Make sure a usable snapshot of `input` exists and return it.
    pub async fn ensure(
        &self,
        input: &str,
        cancel: &CancellationToken,
        force_refresh: bool,
    ) -> EnsureResult {
        let reference = parse_reference(input)?;
        self.ensure_reference(&reference, cancel, force_refresh).await
    }

    /// [`SnapshotCache::ensure`] for an already parsed reference.
    pub async fn ensure_reference(
        &self,
        reference: &RepoReference,
        cancel: &CancellationToken,
        force_refresh: bool,
    ) -> EnsureResult {
        let key = &reference.key;
        if cancel.is_cancelled() {
            return Err(EnsureError::Cancelled);
        }

        self.paths.ensure_owner_dir(key).await?;
        if cancel.is_cancelled() {
            return Err(EnsureError::Cancelled);
        }

        if let Some(handle) = self.serve_cached(reference, force_refresh).await {
            return Ok(handle);
        }

        loop {
            match self.flights.join(key) {
                Role::Leader(flight) => {
                    let result = self.lead(reference, cancel, force_refresh).await;
                    flight.complete(result.clone());
                    return result;
                }
                Role::Follower(waiter) => {
                    log::debug!("joining in-flight sync of {}", key);
                    let shared = tokio::select! {
                        shared = waiter.wait() => shared,
                        _ = cancel.cancelled() => return Err(EnsureError::Cancelled),
                    };
                    match shared {
                        // The leader gave up for its own reasons; try again.
                        None | Some(Err(EnsureError::Cancelled)) => {
                            if cancel.is_cancelled() {
                                return Err(EnsureError::Cancelled);
                            }
                        }
                        // A forced refresh never settles for a cached handle.
                        Some(Ok(handle)) if force_refresh && handle.served_from_cache => {
                            log::debug!("{} was served from cache, forcing a sync", key);
                        }
                        Some(result) => return result,
                    }
                }
            }
        }
    }

    async fn lead(
        &self,
        reference: &RepoReference,
        cancel: &CancellationToken,
        force_refresh: bool,
    ) -> EnsureResult {
        let key = &reference.key;
        let _tree = self.tree.read().await;
        let _guard = self.locks.lock(key).await;

        // A flight that ended just before this one may have synced already.
        if let Some(handle) = self.serve_cached(reference, force_refresh).await {
            return Ok(handle);
        }
        // cleanup may have pruned the owner directory while we waited.
        self.paths.ensure_owner_dir(key).await?;

        let path = self.paths.snapshot_dir(key);
        match self.clones.sync(reference, &path, cancel).await {
            Ok(kind) => {
                self.index.set(key.clone(), SystemTime::now());
                log::info!("{} ready at {} ({:?})", key, path.display(), kind);
                Ok(self.handle(reference, path, false, Some(kind)))
            }
            Err(SyncError::Cancelled) => {
                log::debug!("sync of {} cancelled", key);
                Err(EnsureError::Cancelled)
            }
            Err(SyncError::CloneFailed { source, .. }) => Err(EnsureError::CloneFailure {
                key: key.to_string(),
                reason: source.to_string(),
            }),
            Err(SyncError::Io(err)) => Err(err.into()),
        }
    }

    /// A handle for the on-disk snapshot, if it exists and is fresh.
    async fn serve_cached(
        &self,
        reference: &RepoReference,
        force_refresh: bool,
    ) -> Option<SnapshotHandle> {
        if force_refresh {
            return None;
        }
        let key = &reference.key;
        let path = self.paths.snapshot_dir(key);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return None;
        }
        if self.policy.needs_sync(&self.index, key, false) {
            return None;
        }
        log::debug!("serving {} from cache", key);
        Some(self.handle(reference, path, true, None))
    }

    fn handle(
        &self,
        reference: &RepoReference,
        path: PathBuf,
        served_from_cache: bool,
        sync: Option<SyncKind>,
    ) -> SnapshotHandle {
        let commit = self.clones.git().head_commit(&path);
        SnapshotHandle {
            path,
            owner: reference.owner().clone(),
            name: reference.name().clone(),
            served_from_cache,
            sync,
            commit,
        }
    }

    /// Remove one snapshot, or every snapshot, and forget their sync times.
    pub async fn cleanup(&self, target: &CleanupTarget) -> io::Result<CleanupOutcome> {
        match target {
            CleanupTarget::Key(reference) => {
                let key = &reference.key;
                let _tree = self.tree.read().await;
                let _guard = self.locks.lock(key).await;
                let path = self.paths.snapshot_dir(key);
                let removed = remove_tree(&path).await?;
                self.index.remove(key);
                if removed {
                    self.paths.prune_owner_dir(key).await;
                    log::info!("removed snapshot {}", path.display());
                    Ok(CleanupOutcome::Removed(path))
                } else {
                    Ok(CleanupOutcome::NotCached(key.clone()))
                }
            }
            CleanupTarget::All => {
                // Waits for every running sync, including ones whose
                // directory does not exist yet.
                let _tree = self.tree.write().await;
                remove_tree(self.paths.root()).await?;
                self.index.clear();
                log::info!("cleared snapshot cache at {}", self.paths.root().display());
                Ok(CleanupOutcome::ClearedAll(self.paths.root().to_path_buf()))
            }
        }
    }

    /// Snapshots currently on disk.
    pub fn list(&self) -> io::Result<Vec<SnapshotInfo>> {
        let git = self.clones.git();
        Ok(self
            .paths
            .list_snapshots()?
            .into_iter()
            .map(|(key, path)| SnapshotInfo {
                last_synced_at: self.index.get(&key),
                is_repository: git.is_repository(&path),
                key,
                path,
            })
            .collect())
    }

    /// Snapshot path for `reference`, whether or not it exists yet.
    pub fn snapshot_path(&self, reference: &RepoReference) -> PathBuf {
        self.paths.snapshot_dir(&reference.key)
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }
}
