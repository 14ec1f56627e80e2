//! Snapshot synchronization: clone, fetch + reset, or destructive re-clone.
//!
//! ```text
//! Absent ──clone──▶ Fresh ◀──fetch+reset── Stale
//!   ▲                                        │ fetch/reset failed
//!   └──── clone failed ◀── remove + clone ◀──┘
//! ```
//!
//! Cancellation is checked before and after every external operation. An
//! operation already running is allowed to finish; the next checkpoint then
//! reports [`SyncError::Cancelled`].

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::git::{GitError, GitOps};
use super::paths::remove_tree;
use crate::reference::RepoReference;

/// What a successful sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    /// First shallow clone.
    Cloned,
    /// Fetch + hard reset of an existing snapshot.
    Fetched,
    /// Refresh failed; the snapshot was removed and cloned again.
    Recloned,
}

/// Errors returned by [`CloneManager::sync`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// The (re-)clone failed; no snapshot directory is left behind.
    #[error("clone of {url} failed: {source}")]
    CloneFailed {
        url: String,
        #[source]
        source: GitError,
    },
    /// Cancellation was observed at a checkpoint.
    #[error("sync cancelled")]
    Cancelled,
    /// Local filesystem failure while cleaning up.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Why an in-place refresh did not complete.
enum RefreshError {
    Cancelled,
    Git(GitError),
}

impl From<GitError> for RefreshError {
    fn from(err: GitError) -> Self {
        RefreshError::Git(err)
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

/// Runs the external synchronization for one snapshot directory.
///
/// The only component that spawns processes. Callers are expected to
/// serialize calls per snapshot path.
pub struct CloneManager {
    git: Arc<dyn GitOps>,
    depth: u32,
}

impl CloneManager {
    pub fn new(git: Arc<dyn GitOps>, depth: u32) -> Self {
        Self { git, depth }
    }

    pub fn git(&self) -> &dyn GitOps {
        self.git.as_ref()
    }

    /// Bring the snapshot at `path` up to date with the remote.
    ///
    /// A fetch or reset failure is recovered exactly once by removing the
    /// snapshot and cloning again. On error the directory either does not
    /// exist or still holds the tree from before the call.
    pub async fn sync(
        &self,
        reference: &RepoReference,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<SyncKind, SyncError> {
        checkpoint(cancel)?;

        if !path_exists(path).await {
            self.clone_into(reference, path, cancel).await?;
            return Ok(SyncKind::Cloned);
        }

        match self.refresh(path, cancel).await {
            Ok(()) => Ok(SyncKind::Fetched),
            Err(RefreshError::Cancelled) => Err(SyncError::Cancelled),
            Err(RefreshError::Git(err)) => {
                log::warn!(
                    "refresh of {} failed, re-cloning: {}",
                    reference.key,
                    err
                );
                remove_tree(path).await?;
                checkpoint(cancel)?;
                self.clone_into(reference, path, cancel).await?;
                Ok(SyncKind::Recloned)
            }
        }
    }

    async fn refresh(&self, path: &Path, cancel: &CancellationToken) -> Result<(), RefreshError> {
        if !self.git.is_repository(path) {
            return Err(GitError::NotFound(path.display().to_string()).into());
        }

        self.git.fetch_all(path).await?;
        if cancel.is_cancelled() {
            return Err(RefreshError::Cancelled);
        }

        self.git.reset_to_remote_head(path).await?;
        if cancel.is_cancelled() {
            return Err(RefreshError::Cancelled);
        }

        Ok(())
    }

    async fn clone_into(
        &self,
        reference: &RepoReference,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        checkpoint(cancel)?;

        if let Err(source) = self
            .git
            .clone_shallow(&reference.clone_url, path, self.depth)
            .await
        {
            if let Err(err) = remove_tree(path).await {
                log::warn!(
                    "failed to remove partial clone at {}: {}",
                    path.display(),
                    err
                );
            }
            return Err(SyncError::CloneFailed {
                url: reference.clone_url.clone(),
                source,
            });
        }

        checkpoint(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fake::{FakeGit, Op, OpKind};
    use crate::reference::parse_reference;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
        git: Arc<FakeGit>,
        manager: CloneManager,
        reference: RepoReference,
    }

    fn fixture(git: FakeGit) -> Fixture {
        let dir = tempdir().unwrap();
        let path = dir.path().join("octocat").join("Hello-World");
        let git = Arc::new(git);
        let manager = CloneManager::new(git.clone(), 100);
        Fixture {
            _dir: dir,
            path,
            git,
            manager,
            reference: parse_reference("octocat/Hello-World").unwrap(),
        }
    }

    impl Fixture {
        async fn sync(&self, cancel: &CancellationToken) -> Result<SyncKind, SyncError> {
            self.manager.sync(&self.reference, &self.path, cancel).await
        }

        async fn seed(&self) {
            self.sync(&CancellationToken::new()).await.unwrap();
            self.git.clear_ops();
        }
    }

    #[tokio::test]
    async fn absent_snapshot_is_cloned() {
        let f = fixture(FakeGit::new());
        let kind = f.sync(&CancellationToken::new()).await.unwrap();

        assert_eq!(kind, SyncKind::Cloned);
        assert_eq!(f.git.ops(), vec![Op::Clone(f.path.clone(), 100)]);
        assert!(f.git.is_repository(&f.path));
    }

    #[tokio::test]
    async fn clone_uses_canonical_https_url() {
        let f = fixture(FakeGit::new());
        f.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            f.git.cloned_urls(),
            vec!["https://github.com/octocat/Hello-World.git".to_string()]
        );
    }

    #[tokio::test]
    async fn existing_snapshot_is_fetched_and_reset() {
        let f = fixture(FakeGit::new());
        f.seed().await;
        let before = f.git.head_commit(&f.path);

        let kind = f.sync(&CancellationToken::new()).await.unwrap();

        assert_eq!(kind, SyncKind::Fetched);
        assert_eq!(
            f.git.ops(),
            vec![Op::Fetch(f.path.clone()), Op::Reset(f.path.clone())]
        );
        assert_ne!(before, f.git.head_commit(&f.path));
    }

    #[tokio::test]
    async fn fetch_failure_recovers_with_fresh_clone() {
        let f = fixture(FakeGit::new());
        f.seed().await;
        f.git.fail_fetch(true);

        let kind = f.sync(&CancellationToken::new()).await.unwrap();

        assert_eq!(kind, SyncKind::Recloned);
        assert_eq!(
            f.git.ops(),
            vec![Op::Fetch(f.path.clone()), Op::Clone(f.path.clone(), 100)]
        );
        assert!(f.git.is_repository(&f.path));
    }

    #[tokio::test]
    async fn reset_failure_recovers_with_fresh_clone() {
        let f = fixture(FakeGit::new());
        f.seed().await;
        f.git.fail_reset(true);

        let kind = f.sync(&CancellationToken::new()).await.unwrap();

        assert_eq!(kind, SyncKind::Recloned);
        assert_eq!(f.git.count(OpKind::Clone), 1);
        assert_eq!(f.git.count(OpKind::Reset), 1);
    }

    #[tokio::test]
    async fn recovery_is_attempted_once() {
        let f = fixture(FakeGit::new());
        f.seed().await;
        f.git.fail_fetch(true);
        f.git.fail_next_clones(5);

        let err = f.sync(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, SyncError::CloneFailed { .. }));
        assert_eq!(f.git.count(OpKind::Clone), 1);
        assert!(!f.path.exists());
    }

    #[tokio::test]
    async fn failed_initial_clone_leaves_nothing_behind() {
        let f = fixture(FakeGit::new());
        f.git.fail_next_clones(1);

        let err = f.sync(&CancellationToken::new()).await.unwrap_err();

        match err {
            SyncError::CloneFailed { url, .. } => {
                assert_eq!(url, "https://github.com/octocat/Hello-World.git")
            }
            other => panic!("expected CloneFailed, got {other:?}"),
        }
        assert!(!f.path.exists());
    }

    #[tokio::test]
    async fn non_repository_directory_is_recloned_without_fetch() {
        let f = fixture(FakeGit::new());
        std::fs::create_dir_all(&f.path).unwrap();
        std::fs::write(f.path.join("junk"), "x").unwrap();

        let kind = f.sync(&CancellationToken::new()).await.unwrap();

        assert_eq!(kind, SyncKind::Recloned);
        assert_eq!(f.git.ops(), vec![Op::Clone(f.path.clone(), 100)]);
        assert!(!f.path.join("junk").exists());
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let f = fixture(FakeGit::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.sync(&cancel).await.unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert!(f.git.ops().is_empty());
        assert!(!f.path.exists());
    }

    #[tokio::test]
    async fn cancel_during_clone_is_seen_after_it_finishes() {
        let cancel = CancellationToken::new();
        let f = fixture(FakeGit::new().cancel_during(OpKind::Clone, cancel.clone()));

        let err = f.sync(&cancel).await.unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(f.git.count(OpKind::Clone), 1);
        // The finished clone is a valid snapshot, so it stays.
        assert!(f.git.is_repository(&f.path));
    }

    #[tokio::test]
    async fn cancel_during_fetch_skips_reset() {
        let cancel = CancellationToken::new();
        let f = fixture(FakeGit::new().cancel_during(OpKind::Fetch, cancel.clone()));
        f.seed().await;

        let err = f.sync(&cancel).await.unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(f.git.ops(), vec![Op::Fetch(f.path.clone())]);
    }

    #[tokio::test]
    async fn cancel_during_failed_fetch_removes_snapshot_and_stops() {
        let cancel = CancellationToken::new();
        let f = fixture(FakeGit::new().cancel_during(OpKind::Fetch, cancel.clone()));
        f.seed().await;
        f.git.fail_fetch(true);

        let err = f.sync(&cancel).await.unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(f.git.count(OpKind::Clone), 0);
        assert!(!f.path.exists());
    }
}
