//! Scripted [`GitOps`] used by the cache tests.
//!
//! A "repository" is any directory holding a `.fake-head` file with the
//! current commit id. Operations are recorded in call order.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::git::{GitError, GitOps};

const HEAD_FILE: &str = ".fake-head";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Clone(PathBuf, u32),
    Fetch(PathBuf),
    Reset(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Clone,
    Fetch,
    Reset,
}

impl Op {
    fn kind(&self) -> OpKind {
        match self {
            Op::Clone(..) => OpKind::Clone,
            Op::Fetch(_) => OpKind::Fetch,
            Op::Reset(_) => OpKind::Reset,
        }
    }
}

#[derive(Default)]
pub struct FakeGit {
    ops: Mutex<Vec<Op>>,
    urls: Mutex<Vec<String>>,
    failing_clones: AtomicUsize,
    fail_fetch: AtomicBool,
    fail_reset: AtomicBool,
    commits: AtomicU64,
    delay: Option<Duration>,
    cancel_during: Option<(OpKind, CancellationToken)>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation sleeps this long before finishing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Cancel `token` while an operation of `kind` is running.
    pub fn cancel_during(mut self, kind: OpKind, token: CancellationToken) -> Self {
        self.cancel_during = Some((kind, token));
        self
    }

    pub fn fail_next_clones(&self, n: usize) {
        self.failing_clones.store(n, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reset(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::SeqCst);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, kind: OpKind) -> usize {
        self.ops().iter().filter(|op| op.kind() == kind).count()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub fn cloned_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    async fn begin(&self, op: Op) {
        let kind = op.kind();
        self.ops.lock().unwrap().push(op);
        if let Some((when, token)) = &self.cancel_during {
            if *when == kind {
                token.cancel();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn next_commit(&self) -> String {
        format!("{:040x}", self.commits.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl GitOps for FakeGit {
    async fn clone_shallow(&self, url: &str, dest: &Path, depth: u32) -> Result<(), GitError> {
        self.urls.lock().unwrap().push(url.to_string());
        std::fs::create_dir_all(dest)?;
        self.begin(Op::Clone(dest.to_path_buf(), depth)).await;

        let failing = self
            .failing_clones
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            std::fs::write(dest.join("partial"), "half a pack")?;
            return Err(GitError::CloneError("remote hung up".into()));
        }

        std::fs::write(dest.join(HEAD_FILE), self.next_commit())?;
        Ok(())
    }

    async fn fetch_all(&self, repo: &Path) -> Result<(), GitError> {
        self.begin(Op::Fetch(repo.to_path_buf())).await;
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(GitError::FetchError("could not resolve host".into()));
        }
        if !self.is_repository(repo) {
            return Err(GitError::NotFound(repo.display().to_string()));
        }
        Ok(())
    }

    async fn reset_to_remote_head(&self, repo: &Path) -> Result<(), GitError> {
        self.begin(Op::Reset(repo.to_path_buf())).await;
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(GitError::ResetError("index.lock exists".into()));
        }
        std::fs::write(repo.join(HEAD_FILE), self.next_commit())?;
        Ok(())
    }

    fn is_repository(&self, path: &Path) -> bool {
        path.join(HEAD_FILE).is_file()
    }

    fn head_commit(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path.join(HEAD_FILE)).ok()
    }
}
