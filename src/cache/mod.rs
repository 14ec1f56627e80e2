//! Snapshot cache: layout, sync index, git plumbing and the `ensure` facade

mod clone;
#[cfg(test)]
pub(crate) mod fake;
mod flight;
mod git;
mod index;
mod paths;
mod policy;
mod snapshot;

pub use clone::{CloneManager, SyncError, SyncKind};
pub use git::{GitCli, GitError, GitOps, open_repository};
pub use index::CacheIndex;
pub use paths::CachePaths;
pub use policy::RefreshPolicy;
pub use snapshot::{
    CleanupOutcome, CleanupTarget, EnsureError, SnapshotCache, SnapshotHandle, SnapshotInfo,
};
