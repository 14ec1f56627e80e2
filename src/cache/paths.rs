//! Snapshot directory layout
//!
//! ```text
//! ~/.cache/repo-autopsy/
//! ├── .index.json            # optional persisted sync index
//! └── <owner>/
//!     └── <name>/            # shallow working tree, one per canonical key
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::types::RepoKey;

/// Manages the filesystem paths of the snapshot store.
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Creates a new CachePaths with the specified root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the owner directory: `{root}/{owner}`
    pub fn owner_dir(&self, key: &RepoKey) -> PathBuf {
        self.root.join(key.owner.as_str())
    }

    /// Returns the snapshot directory: `{root}/{owner}/{name}`
    pub fn snapshot_dir(&self, key: &RepoKey) -> PathBuf {
        self.owner_dir(key).join(key.repo.as_str())
    }

    /// Create the root and owner directories for `key`.
    pub async fn ensure_owner_dir(&self, key: &RepoKey) -> io::Result<PathBuf> {
        let dir = self.owner_dir(key);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove the owner directory for `key` if nothing else lives in it.
    pub async fn prune_owner_dir(&self, key: &RepoKey) {
        // remove_dir refuses non-empty directories, which is what we want.
        let _ = tokio::fs::remove_dir(self.owner_dir(key)).await;
    }

    /// Enumerate `{root}/{owner}/{name}` directories.
    ///
    /// Hidden entries and names that are not valid keys are skipped. A missing
    /// root yields an empty list.
    pub fn list_snapshots(&self) -> io::Result<Vec<(RepoKey, PathBuf)>> {
        let owners = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut snapshots = Vec::new();
        for owner in owners.flatten() {
            if !owner.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(owner_name) = visible_name(&owner.path()) else {
                continue;
            };

            let Ok(repos) = std::fs::read_dir(owner.path()) else {
                continue;
            };
            for repo in repos.flatten() {
                if !repo.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let Some(repo_name) = visible_name(&repo.path()) else {
                    continue;
                };
                match format!("{owner_name}/{repo_name}").parse::<RepoKey>() {
                    Ok(key) => snapshots.push((key, repo.path())),
                    Err(err) => {
                        log::debug!("skipping {}: {}", repo.path().display(), err);
                    }
                }
            }
        }

        snapshots.sort();
        Ok(snapshots)
    }
}

fn visible_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    (!name.starts_with('.')).then(|| name.to_string())
}

/// Remove a directory tree, or a stray file in its place.
///
/// Returns `Ok(false)` when nothing existed at `path`.
pub async fn remove_tree(path: &Path) -> io::Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(true)
}
