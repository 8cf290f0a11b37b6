//! In-memory store: one mutex over a map. Expired keys are dropped when
//! touched and by a periodic sweep on writes.

use super::SessionStore;
use crate::clock::{duration_millis, Clock};
use crate::error::StoreError;
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Minimum gap between two sweeps triggered by writes.
const SWEEP_INTERVAL_MS: i64 = 60_000;

#[derive(Debug)]
enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: i64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    next_sweep_at: i64,
}

impl State {
    /// Live entry under `key`; drops it first if it has expired.
    fn live(&mut self, key: &str, now: i64) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| e.expires_at <= now) {
            trace!("Evicting expired key '{key}'");
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn sweep(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        self.next_sweep_at = now.saturating_add(SWEEP_INTERVAL_MS);
        before - self.entries.len()
    }

    fn sweep_if_due(&mut self, now: i64) {
        if now >= self.next_sweep_at {
            let purged = self.sweep(now);
            if purged > 0 {
                debug!("Swept {purged} expired keys from memory store");
            }
        }
    }

    /// Append to the live list under `key`, creating it if needed, and trim
    /// it to `max_len`.
    fn push_bounded(
        &mut self,
        key: &str,
        item: &[u8],
        max_len: usize,
        now: i64,
        expires_at: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        if self.live(key, now).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at,
                },
            );
        }
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| StoreError::Backend(format!("list '{key}' vanished under lock")))?;
        let Value::List(list) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };

        list.push_back(item.to_vec());
        while list.len() > max_len.max(1) {
            list.pop_front();
        }
        entry.expires_at = expires_at;
        Ok(list.iter().cloned().collect())
    }
}

/// Process-local [`SessionStore`]. All operations take the same lock, which
/// makes the list appends trivially atomic.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Number of keys held, expired ones included until they are swept.
    pub fn key_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.entries.len())
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.lock()?;
        match state.live(key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Bytes(bytes), .. }) => Ok(Some(bytes.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        let mut state = self.lock()?;
        state.sweep_if_due(now);
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at,
            },
        );
        Ok(())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.lock()?;
        Ok(match state.live(key, now) {
            Some(entry) => {
                entry.expires_at = now.saturating_add(duration_millis(ttl));
                true
            }
            None => false,
        })
    }

    fn append_to_list(
        &self,
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        let mut state = self.lock()?;
        state.sweep_if_due(now);
        state.push_bounded(key, item, max_len, now, expires_at)
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
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        let mut state = self.lock()?;
        state.sweep_if_due(now);

        match state.live(guard, now) {
            None => return Ok(None),
            Some(Entry { value: Value::List(_), .. }) => {
                return Err(StoreError::WrongType(guard.to_string()))
            }
            Some(_) => {}
        }
        // Reject a mistyped list before touching the guard.
        if let Some(Entry { value: Value::Bytes(_), .. }) = state.live(key, now) {
            return Err(StoreError::WrongType(key.to_string()));
        }

        let list = state.push_bounded(key, item, max_len, now, expires_at)?;
        if let Some(entry) = state.entries.get_mut(guard) {
            entry.value = Value::Bytes(guard_value.to_vec());
            entry.expires_at = expires_at;
        }
        Ok(Some(list))
    }

    fn get_list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.lock()?;
        match state.live(key, now) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::List(list), .. }) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        Ok(self.lock()?.sweep(now))
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}
