//! In-memory record of when each snapshot was last synchronized.
//!
//! An entry exists only for keys whose clone or fetch completed in this
//! process, or that were seeded from a persisted index file. Absence means
//! "never synchronized", not "absent on disk".

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::types::RepoKey;

/// On-disk shape of a persisted index: canonical key to epoch milliseconds.
///
/// Values stay untyped on load so one bad entry cannot sink the rest.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    entries: BTreeMap<String, Value>,
}

/// Map from canonical key to `last_synced_at`.
#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: DashMap<RepoKey, SystemTime>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an index from a JSON file written by [`CacheIndex::save`].
    ///
    /// A missing or unreadable-as-JSON file yields an empty index; the sync
    /// times are only a hint, so every snapshot is then treated as stale.
    /// Entries with a bad key or a non-integer timestamp are skipped.
    pub fn load(path: &Path) -> io::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };

        let file: IndexFile = match serde_json::from_str(&contents) {
            Ok(file) => file,
            Err(err) => {
                log::warn!("ignoring malformed index {}: {}", path.display(), err);
                return Ok(Self::new());
            }
        };

        let index = Self::new();
        for (key, value) in file.entries {
            let Some(millis) = value.as_u64() else {
                log::warn!("ignoring index entry {:?}: bad timestamp {}", key, value);
                continue;
            };
            match key.parse::<RepoKey>() {
                Ok(parsed) => index.set(parsed, UNIX_EPOCH + Duration::from_millis(millis)),
                Err(err) => log::warn!("ignoring index entry {:?}: {}", key, err),
            }
        }
        log::debug!("loaded {} index entries from {}", index.len(), path.display());
        Ok(index)
    }

    /// Write the index as JSON, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = IndexFile {
            entries: self
                .entries()
                .into_iter()
                .map(|(key, at)| (key.to_string(), Value::from(epoch_millis(at))))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(io::Error::other)?;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&json)?;
        tmp.persist(path)?;
        Ok(())
    }

    pub fn get(&self, key: &RepoKey) -> Option<SystemTime> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    /// Record a sync time. Later writers win; ordering is not enforced.
    pub fn set(&self, key: RepoKey, at: SystemTime) {
        self.entries.insert(key, at);
    }

    pub fn remove(&self, key: &RepoKey) -> Option<SystemTime> {
        self.entries.remove(key).map(|(_, at)| at)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries, sorted by key.
    pub fn entries(&self) -> Vec<(RepoKey, SystemTime)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
