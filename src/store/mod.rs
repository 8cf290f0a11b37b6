//! # Session Store Adapter
//!
//! TTL-bounded key/value and bounded-list access to session state. This layer
//! has no business logic; it only guarantees the primitives the tracker needs:
//!
//! - `get` / `set_with_ttl` / `expire` for the session record
//! - `append_to_list` for the event log, which appends, trims to `max_len`
//!   and refreshes the TTL as **one atomic operation** and returns the list
//!   as it stands after the append
//! - `append_guarded`, the same append made conditional on a live companion
//!   key that is rewritten and refreshed in that same operation
//! - `purge_expired` to reclaim space held by keys nobody touches again
//!
//! Absent and expired keys are indistinguishable to callers. Every call is
//! bounded by a timeout and reports [`StoreError`] instead of blocking.
//!
//! Two adapters ship with the crate:
//!
//! - [`SqliteStore`] – durable, safe across processes sharing one file
//! - [`MemoryStore`] – process-local fallback and test double

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::clock::Clock;
use crate::config::{RuntimeConfig, StoreBackend};
use crate::error::StoreError;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Contract consumed by the session tracker.
pub trait SessionStore: Send + Sync {
    /// Value under `key`, `None` when absent or expired.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite `key` with `value`, expiring after `ttl`.
    fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Reset the TTL of a live key. Returns `false` when the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Atomically append `item`, keep only the newest `max_len` items and
    /// refresh the TTL. Returns the retained list, oldest first.
    fn append_to_list(
        &self,
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Like [`append_to_list`](Self::append_to_list), but only while `guard`
    /// is live. `guard` is overwritten with `guard_value` and given the same
    /// `ttl` inside the same atomic operation. Returns `None`, having written
    /// nothing, when `guard` is absent or expired.
    fn append_guarded(
        &self,
        guard: &str,
        guard_value: &[u8],
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> Result<Option<Vec<Vec<u8>>>, StoreError>;

    /// Retained list under `key`, oldest first. Empty when absent or expired.
    fn get_list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Drop every expired key. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize, StoreError>;

    /// Cheap liveness probe.
    fn ping(&self) -> Result<(), StoreError>;
}

impl<S: SessionStore + ?Sized> SessionStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        (**self).set_with_ttl(key, value, ttl)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).expire(key, ttl)
    }

    fn append_to_list(
        &self,
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        (**self).append_to_list(key, item, max_len, ttl)
    }

    fn append_guarded(
        &self,
        guard: &str,
        guard_value: &[u8],
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
        (**self).append_guarded(guard, guard_value, key, item, max_len, ttl)
    }

    fn get_list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        (**self).get_list(key)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        (**self).purge_expired()
    }

    fn ping(&self) -> Result<(), StoreError> {
        (**self).ping()
    }
}

impl<S: SessionStore + ?Sized> SessionStore for Box<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        (**self).set_with_ttl(key, value, ttl)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).expire(key, ttl)
    }

    fn append_to_list(
        &self,
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        (**self).append_to_list(key, item, max_len, ttl)
    }

    fn append_guarded(
        &self,
        guard: &str,
        guard_value: &[u8],
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
        (**self).append_guarded(guard, guard_value, key, item, max_len, ttl)
    }

    fn get_list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        (**self).get_list(key)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        (**self).purge_expired()
    }

    fn ping(&self) -> Result<(), StoreError> {
        (**self).ping()
    }
}

/// Open the configured backend.
///
/// A SQLite store that cannot be opened degrades to a [`MemoryStore`] with a
/// warning: sessions then live only as long as this process, but requests
/// keep being served.
pub fn open_store(config: &RuntimeConfig, clock: Arc<dyn Clock>) -> Box<dyn SessionStore> {
    match config.store_backend {
        StoreBackend::Memory => {
            info!("Using in-memory session store");
            Box::new(MemoryStore::new(clock))
        }
        StoreBackend::Sqlite => {
            match SqliteStore::open(&config.db_path, config.store_timeout(), Arc::clone(&clock)) {
                Ok(store) => {
                    info!("Session store opened at {}", config.db_path.display());
                    Box::new(store)
                }
                Err(e) => {
                    warn!(
                        "Failed to open session store at {}: {e}; falling back to in-memory store",
                        config.db_path.display()
                    );
                    Box::new(MemoryStore::new(clock))
                }
            }
        }
    }
}

/// Shared behaviour checks run against every adapter.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::clock::ManualClock;

    pub fn absent_and_expired_look_the_same<S: SessionStore>(store: &S, clock: &ManualClock) {
        assert_eq!(store.get("missing").unwrap(), None);

        store.set_with_ttl("k", b"v", Duration::from_secs(10)).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));

        clock.advance(Duration::from_secs(11));
        assert_eq!(store.get("k").unwrap(), None);
        assert!(!store.expire("k", Duration::from_secs(10)).unwrap());
    }

    pub fn expire_extends_live_keys<S: SessionStore>(store: &S, clock: &ManualClock) {
        store.set_with_ttl("k", b"v", Duration::from_secs(10)).unwrap();
        clock.advance(Duration::from_secs(8));
        assert!(store.expire("k", Duration::from_secs(10)).unwrap());
        clock.advance(Duration::from_secs(8));
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }

    pub fn bounded_append_evicts_oldest<S: SessionStore>(store: &S) {
        let ttl = Duration::from_secs(60);
        for i in 0..5u8 {
            let list = store.append_to_list("events", &[i], 3, ttl).unwrap();
            assert!(list.len() <= 3);
            assert_eq!(list.last(), Some(&vec![i]));
        }
        assert_eq!(store.get_list("events").unwrap(), vec![vec![2], vec![3], vec![4]]);
    }

    pub fn guarded_append_needs_live_guard<S: SessionStore>(store: &S, clock: &ManualClock) {
        let ttl = Duration::from_secs(10);
        assert_eq!(store.append_guarded("meta", b"m1", "l", b"a", 5, ttl).unwrap(), None);
        assert!(store.get_list("l").unwrap().is_empty());
        assert_eq!(store.get("meta").unwrap(), None, "a missing guard is not created");

        store.set_with_ttl("meta", b"m0", ttl).unwrap();
        clock.advance(Duration::from_secs(8));
        let list = store.append_guarded("meta", b"m1", "l", b"a", 5, ttl).unwrap();
        assert_eq!(list, Some(vec![b"a".to_vec()]));
        assert_eq!(store.get("meta").unwrap(), Some(b"m1".to_vec()));

        clock.advance(Duration::from_secs(8));
        assert_eq!(store.get("meta").unwrap(), Some(b"m1".to_vec()), "guard TTL refreshed");
        assert_eq!(store.get_list("l").unwrap().len(), 1);

        clock.advance(Duration::from_secs(11));
        assert_eq!(store.append_guarded("meta", b"m2", "l", b"b", 5, ttl).unwrap(), None);
        assert_eq!(store.get("meta").unwrap(), None, "an expired guard stays expired");
        assert!(store.get_list("l").unwrap().is_empty());
    }

    pub fn purge_reclaims_only_expired<S: SessionStore>(store: &S, clock: &ManualClock) {
        store.set_with_ttl("a", b"1", Duration::from_secs(1)).unwrap();
        store.append_to_list("b", b"2", 5, Duration::from_secs(1)).unwrap();
        store.set_with_ttl("c", b"3", Duration::from_secs(100)).unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.purge_expired().unwrap(), 2);
        assert_eq!(store.purge_expired().unwrap(), 0);
        assert_eq!(store.get("c").unwrap(), Some(b"3".to_vec()));
    }

    pub fn list_expires_and_restarts<S: SessionStore>(store: &S, clock: &ManualClock) {
        let ttl = Duration::from_secs(5);
        store.append_to_list("l", b"a", 10, ttl).unwrap();
        clock.advance(Duration::from_secs(4));
        store.append_to_list("l", b"b", 10, ttl).unwrap();
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.get_list("l").unwrap().len(), 2, "append refreshes TTL");

        clock.advance(Duration::from_secs(6));
        assert!(store.get_list("l").unwrap().is_empty());
        let list = store.append_to_list("l", b"c", 10, ttl).unwrap();
        assert_eq!(list, vec![b"c".to_vec()]);
    }
}
