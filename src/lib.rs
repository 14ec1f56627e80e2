//! Bounded-freshness cache of local repository snapshots.
//!
//! Analysis tools call [`cache::SnapshotCache::ensure`] with any accepted
//! reference form and get back the path of a snapshot that is at most one
//! freshness window old.

pub mod cache;
pub mod config;
pub mod reference;
pub mod types;
