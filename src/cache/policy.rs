//! Freshness checks for cached snapshots.

use std::time::{Duration, SystemTime};

use super::CacheIndex;
use crate::types::RepoKey;

/// Decides whether an existing snapshot can be served as-is.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    freshness_window: Duration,
}

impl RefreshPolicy {
    pub fn new(freshness_window: Duration) -> Self {
        Self { freshness_window }
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Returns true if `key` must be synchronized before it is served.
    pub fn needs_sync(&self, index: &CacheIndex, key: &RepoKey, force_refresh: bool) -> bool {
        self.needs_sync_at(index.get(key), SystemTime::now(), force_refresh)
    }

    /// Returns true if:
    /// - `force_refresh` is set
    /// - the key was never synchronized
    /// - the last sync is at least `freshness_window` old
    ///
    /// A sync time in the future (clock moved backwards) counts as fresh.
    pub fn needs_sync_at(
        &self,
        last_synced_at: Option<SystemTime>,
        now: SystemTime,
        force_refresh: bool,
    ) -> bool {
        if force_refresh {
            return true;
        }
        let Some(last) = last_synced_at else {
            return true;
        };
        match now.duration_since(last) {
            Ok(age) => age >= self.freshness_window,
            Err(_) => false,
        }
    }
}
