//! Cache configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default freshness window (5 minutes).
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default history depth for snapshot clones. Deep enough for blame and churn
/// queries without paying for full history.
pub const DEFAULT_CLONE_DEPTH: u32 = 100;

/// File name of the persisted index, relative to the cache root.
pub const INDEX_FILE_NAME: &str = ".index.json";

/// Settings for a [`SnapshotCache`](crate::cache::SnapshotCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding `<owner>/<name>` snapshots.
    pub root: PathBuf,
    /// Maximum age of a sync before the snapshot is refreshed.
    pub freshness_window: Duration,
    /// `--depth` passed to `git clone`.
    pub clone_depth: u32,
    /// Git executable.
    pub git_path: String,
    /// Where the sync index is loaded from and saved to, if anywhere.
    pub index_file: Option<PathBuf>,
}

impl CacheConfig {
    /// Create a config rooted at `root` with default settings.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            clone_depth: DEFAULT_CLONE_DEPTH,
            git_path: "git".into(),
            index_file: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    /// Set the clone depth. A depth of zero is clamped to one.
    pub fn with_clone_depth(mut self, depth: u32) -> Self {
        self.clone_depth = depth.max(1);
        self
    }

    pub fn with_git_path(mut self, git_path: impl Into<String>) -> Self {
        self.git_path = git_path.into();
        self
    }

    pub fn with_index_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.index_file = Some(path.into());
        self
    }

    /// Persist the index next to the snapshots, at `<root>/.index.json`.
    pub fn with_persisted_index(self) -> Self {
        let path = self.root.join(INDEX_FILE_NAME);
        self.with_index_file(path)
    }
}

impl Default for CacheConfig {
    /// Uses the system cache directory + "repo-autopsy"
    ///
    /// `dirs::cache_dir()` resolves to:
    /// - Linux: `~/.cache`
    /// - macOS: `~/Library/Caches`
    /// - Windows: `C:\Users\<user>\AppData\Local`
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("repo-autopsy"))
    }
}
