//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for network operations**, run as async child
//! processes so a slow clone never blocks other callers:
//! - `clone_shallow` - needs `--depth` for bandwidth/disk savings
//! - `fetch_all` - `fetch --all --prune`
//! - `reset_to_remote_head` - `reset --hard origin/HEAD`
//!
//! **libgit2 for local reads:**
//! - `open_repository`, `repository_exists`, `head_commit`

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use git2::Repository;
use thiserror::Error;
use tokio::process::Command;

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// Clone failed.
    #[error("clone failed: {0}")]
    CloneError(String),
    /// Fetch failed.
    #[error("fetch failed: {0}")]
    FetchError(String),
    /// Reset failed.
    #[error("reset failed: {0}")]
    ResetError(String),
    /// Underlying IO error, including a missing git binary.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// The external operations the snapshot cache depends on.
///
/// [`GitCli`] is the production implementation; tests substitute a scripted
/// one to drive the clone state machine without a network.
#[async_trait]
pub trait GitOps: Send + Sync {
    /// Clone `url` into `dest` with at most `depth` commits of history.
    async fn clone_shallow(&self, url: &str, dest: &Path, depth: u32) -> Result<(), GitError>;

    /// Fetch every remote of `repo`, pruning deleted branches.
    async fn fetch_all(&self, repo: &Path) -> Result<(), GitError>;

    /// Hard-reset the working tree of `repo` to the remote default branch.
    async fn reset_to_remote_head(&self, repo: &Path) -> Result<(), GitError>;

    /// Whether `path` opens as a git repository.
    fn is_repository(&self, path: &Path) -> bool;

    /// The commit HEAD points at, if readable.
    fn head_commit(&self, path: &Path) -> Option<String>;
}

/// Reject values git could mistake for options, or that smuggle control bytes.
fn validate_arg(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

fn stderr_text(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Git CLI wrapper with security hardening.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_path: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Create a new GitCli instance using the system git.
    pub fn new() -> Self {
        Self::with_git_path("git")
    }

    /// Use a specific git executable.
    pub fn with_git_path(git_path: impl Into<String>) -> Self {
        Self {
            git_path: git_path.into(),
        }
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["-c", "core.hooksPath="]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl GitOps for GitCli {
    async fn clone_shallow(&self, url: &str, dest: &Path, depth: u32) -> Result<(), GitError> {
        validate_arg(url, "url")?;

        let dest_existed = dest.exists();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        log::info!("cloning {} into {} (depth {})", url, dest.display(), depth);
        let output = self
            .command()
            .args(["clone", "--depth"])
            .arg(depth.max(1).to_string())
            .arg("--")
            .arg(url)
            .arg(dest)
            .output()
            .await?;

        if !output.status.success() {
            if !dest_existed {
                let _ = tokio::fs::remove_dir_all(dest).await;
            }
            return Err(GitError::CloneError(stderr_text(&output)));
        }

        Ok(())
    }

    async fn fetch_all(&self, repo: &Path) -> Result<(), GitError> {
        log::info!("fetching {}", repo.display());
        let output = self
            .command()
            .arg("-C")
            .arg(repo)
            .args(["fetch", "--all", "--prune"])
            .output()
            .await?;

        if !output.status.success() {
            return Err(GitError::FetchError(stderr_text(&output)));
        }

        Ok(())
    }

    async fn reset_to_remote_head(&self, repo: &Path) -> Result<(), GitError> {
        let output = self
            .command()
            .arg("-C")
            .arg(repo)
            .args(["reset", "--hard", "origin/HEAD"])
            .output()
            .await?;

        if !output.status.success() {
            return Err(GitError::ResetError(stderr_text(&output)));
        }

        Ok(())
    }

    fn is_repository(&self, path: &Path) -> bool {
        repository_exists(path)
    }

    fn head_commit(&self, path: &Path) -> Option<String> {
        head_commit(path).ok()
    }
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(repo)
}

/// Check if a path contains a valid git repository.
pub fn repository_exists(path: &Path) -> bool {
    Repository::open(path).is_ok()
}

/// Resolve the commit HEAD points at.
pub fn head_commit(path: &Path) -> Result<String, GitError> {
    let repo = open_repository(path)?;
    let commit = repo.head()?.peel_to_commit()?;
    Ok(commit.id().to_string())
}
