//! Per-key coordination: single-flight coalescing and key locks.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};

/// Coalesces concurrent work for the same key.
///
/// The first caller for a key becomes the leader and must publish a result
/// through [`Flight::complete`]; callers arriving while it runs become
/// followers and receive a clone of that result.
pub struct SingleFlight<K, V> {
    flights: DashMap<K, (u64, watch::Receiver<Option<V>>)>,
    next_id: AtomicU64,
}

/// How a caller takes part in a flight.
pub enum Role<'a, K: Eq + Hash + Clone, V: Clone> {
    Leader(Flight<'a, K, V>),
    Follower(Waiter<V>),
}

impl<K: Eq + Hash + Clone, V: Clone> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            flights: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a flight for `key`, or join the one already running.
    pub fn join(&self, key: &K) -> Role<'_, K, V> {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => Role::Follower(Waiter(entry.get().1.clone())),
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                entry.insert((id, rx));
                Role::Leader(Flight {
                    flights: &self.flights,
                    key: key.clone(),
                    id,
                    tx,
                })
            }
        }
    }

    /// Number of flights currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// A follower's view of someone else's flight.
pub struct Waiter<V>(watch::Receiver<Option<V>>);

impl<V: Clone> Waiter<V> {
    /// Wait for the leader's result.
    ///
    /// Returns `None` if the leader went away without publishing one.
    pub async fn wait(mut self) -> Option<V> {
        match self.0.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        }
    }
}

/// The leader's handle on a running flight.
///
/// Dropping it without calling [`Flight::complete`] releases followers with
/// no result.
pub struct Flight<'a, K: Eq + Hash + Clone, V: Clone> {
    flights: &'a DashMap<K, (u64, watch::Receiver<Option<V>>)>,
    key: K,
    id: u64,
    tx: watch::Sender<Option<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Flight<'_, K, V> {
    /// Publish the result to every follower and end the flight.
    pub fn complete(self, value: V) {
        self.retire();
        // No followers is fine.
        let _ = self.tx.send(Some(value));
    }

    fn retire(&self) {
        self.flights.remove_if(&self.key, |_, (id, _)| *id == self.id);
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for Flight<'_, K, V> {
    fn drop(&mut self) {
        self.retire();
    }
}

/// One async mutex per key, created on first use and dropped once nobody
/// holds or waits for it.
pub struct KeyLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyLocks<K> {
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `key`, waiting for any current holder.
    pub async fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: &self.locks,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Holds a key's lock; the map entry goes away with the last user.
pub struct KeyGuard<'a, K: Eq + Hash> {
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        // Release first so our own Arc no longer counts.
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_caller_leads_and_later_callers_follow() {
        let flights: SingleFlight<&str, u32> = SingleFlight::new();

        let Role::Leader(flight) = flights.join(&"a") else {
            panic!("first caller should lead");
        };
        let Role::Follower(rx) = flights.join(&"a") else {
            panic!("second caller should follow");
        };
        assert_eq!(flights.in_flight(), 1);

        flight.complete(7);
        assert_eq!(rx.wait().await, Some(7));
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_fly_independently() {
        let flights: SingleFlight<&str, u32> = SingleFlight::new();
        let a = flights.join(&"a");
        let b = flights.join(&"b");
        assert!(matches!(a, Role::Leader(_)));
        assert!(matches!(b, Role::Leader(_)));
        assert_eq!(flights.in_flight(), 2);
    }

    #[tokio::test]
    async fn dropped_leader_releases_followers_empty_handed() {
        let flights: SingleFlight<&str, u32> = SingleFlight::new();
        let leader = flights.join(&"a");
        let Role::Follower(rx) = flights.join(&"a") else {
            panic!("second caller should follow");
        };

        drop(leader);
        assert_eq!(rx.wait().await, None);
        assert!(matches!(flights.join(&"a"), Role::Leader(_)));
    }

    #[tokio::test]
    async fn stale_leader_drop_does_not_end_newer_flight() {
        let flights: SingleFlight<&str, u32> = SingleFlight::new();
        let Role::Leader(old) = flights.join(&"a") else {
            panic!("expected leader");
        };
        old.retire();

        let Role::Leader(new) = flights.join(&"a") else {
            panic!("expected a new leader after retire");
        };
        drop(old);
        assert_eq!(flights.in_flight(), 1);
        assert!(matches!(flights.join(&"a"), Role::Follower(_)));
        drop(new);
    }

    #[tokio::test]
    async fn follower_waits_for_result() {
        let flights: SingleFlight<&str, u32> = SingleFlight::new();
        let Role::Leader(flight) = flights.join(&"a") else {
            panic!("expected leader");
        };
        let Role::Follower(rx) = flights.join(&"a") else {
            panic!("expected follower");
        };

        let (got, ()) = tokio::join!(rx.wait(), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flight.complete(42);
        });
        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn key_locks_serialize_same_key() {
        let locks: KeyLocks<&str> = KeyLocks::new();
        let guard = locks.lock(&"a").await;

        let other = tokio::time::timeout(Duration::from_millis(20), locks.lock(&"b")).await;
        assert!(other.is_ok(), "distinct keys must not block");

        let same = tokio::time::timeout(Duration::from_millis(20), locks.lock(&"a")).await;
        assert!(same.is_err(), "same key must wait for the holder");

        drop(guard);
        let again = tokio::time::timeout(Duration::from_millis(20), locks.lock(&"a")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn key_locks_forget_unused_keys() {
        let locks: KeyLocks<&str> = KeyLocks::new();
        let first = locks.lock(&"a").await;
        assert_eq!(locks.len(), 1);

        let (released, ()) = tokio::join!(
            async {
                let second = locks.lock(&"a").await;
                // The first holder left while we waited; the entry stayed.
                assert_eq!(locks.len(), 1);
                drop(second);
                locks.is_empty()
            },
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(first);
            },
        );

        assert!(released);
        assert!(locks.is_empty());
    }
}
