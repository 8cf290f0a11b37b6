//! # Session Tracker
//!
//! The only writer of session state. A session is two store keys that share
//! one sliding TTL:
//!
//! - `session:{id}` – [`SessionMeta`] as JSON
//! - `events:{id}` – bounded list of [`Event`]s as JSON, oldest first
//!
//! Recording an event validates it, then hands the store one guarded append
//! that checks the session key is still live, rewrites it with the new
//! activity time, appends to the event log and refreshes both TTLs. Either
//! all of that happens or none of it does, so an expired session is never
//! revived and a failed call leaves nothing behind. Aggregates are recomputed
//! from the list that append returned: two concurrent recordings for one
//! session both land in the log, and whichever returns second reports
//! aggregates over both.
//!
//! Sessions started with a user id also mirror their events into
//! `user_activity:{user}`, a shorter log with a longer TTL that gives the
//! next session of the same listener some history to start from.

use crate::clock::{duration_millis, Clock};
use crate::config::SessionConfig;
use crate::error::{SessionError, StoreError};
use crate::session::{Aggregates, Event, EventInput, Session, SessionMeta, SessionSeed};
use crate::store::SessionStore;
use log::{debug, info, trace, warn};
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn session_key(id: &str) -> String {
    format!("session:{id}")
}

fn events_key(id: &str) -> String {
    format!("events:{id}")
}

fn user_activity_key(user_id: &str) -> String {
    format!("user_activity:{user_id}")
}

/// Fresh opaque session id: 128 random bits, hex encoded.
#[must_use]
pub fn generate_session_id() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

/// Creates sessions and records playback events against a [`SessionStore`].
#[derive(Debug)]
pub struct SessionTracker<S> {
    store: S,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    last_purge: AtomicI64,
}

impl<S: SessionStore> SessionTracker<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: SessionConfig) -> Self {
        let last_purge = AtomicI64::new(clock.now_millis());
        Self {
            store,
            clock,
            config,
            last_purge,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session with zeroed aggregates.
    ///
    /// Also purges expired keys from the store when the last purge is older
    /// than `purge_interval_secs`.
    ///
    /// # Errors
    ///
    /// [`SessionError::StoreUnavailable`] if the record cannot be written.
    pub fn start_session(&self, seed: SessionSeed) -> Result<String, SessionError> {
        let now = self.clock.now_millis();
        self.purge_if_due(now);

        let meta = SessionMeta {
            id: generate_session_id(),
            created_at: now,
            last_activity: now,
            seed,
        };
        let bytes = serde_json::to_vec(&meta).map_err(StoreError::from)?;
        self.store
            .set_with_ttl(&session_key(&meta.id), &bytes, self.config.ttl())?;
        info!("Started session {} (device: {:?})", meta.id, meta.seed.device);
        Ok(meta.id)
    }

    /// Validate and append one event, refresh the TTL, and return the
    /// aggregates over the retained events.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidEvent`] before anything is written
    /// - [`SessionError::SessionNotFound`] if the id is unknown or expired
    /// - [`SessionError::StoreUnavailable`] on store failure, with nothing
    ///   written
    pub fn record_event(
        &self,
        session_id: &str,
        input: EventInput,
    ) -> Result<Aggregates, SessionError> {
        let now = self.clock.now_millis();
        let event = Event::validate(input, now)?;

        let mut meta = self
            .read_meta(session_id)?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        meta.last_activity = now;

        let meta_bytes = serde_json::to_vec(&meta).map_err(StoreError::from)?;
        let encoded = serde_json::to_vec(&event).map_err(StoreError::from)?;
        let raw = self
            .store
            .append_guarded(
                &session_key(session_id),
                &meta_bytes,
                &events_key(session_id),
                &encoded,
                self.config.max_events,
                self.config.ttl(),
            )?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        let events = self.retained(decode_events(&raw)?, now);
        let aggregates = Aggregates::from_events(&events, &self.config);

        if let Some(user) = meta.seed.user() {
            self.mirror_to_user(user, &encoded);
        }

        debug!(
            "Recorded {} of '{}' in session {session_id} ({} events, skip rate {:.2})",
            event.kind, event.track_id, aggregates.event_count, aggregates.skip_rate
        );
        Ok(aggregates)
    }

    /// Resolve a session with its retained events and aggregates.
    ///
    /// A session without events of its own but with a user id carries that
    /// user's earlier activity instead. Failing to read it is not an error.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] or [`SessionError::StoreUnavailable`].
    pub fn load_session(&self, session_id: &str) -> Result<Session, SessionError> {
        let now = self.clock.now_millis();
        let meta = self
            .read_meta(session_id)?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        let raw = self.store.get_list(&events_key(session_id))?;
        let events = self.retained(decode_events(&raw)?, now);
        trace!("Loaded session {session_id} with {} events", events.len());

        let user = meta.seed.user().map(str::to_string);
        let session = Session::from_parts(meta, events, &self.config);
        match user {
            Some(user) if session.events.is_empty() => match self.load_user_activity(&user) {
                Ok(activity) => Ok(session.with_user_activity(activity)),
                Err(e) => {
                    warn!("Failed to load activity of user {user}: {e}");
                    Ok(session)
                }
            },
            _ => Ok(session),
        }
    }

    /// Events mirrored from every identified session of `user_id`, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// [`SessionError::StoreUnavailable`] on store failure.
    pub fn load_user_activity(&self, user_id: &str) -> Result<Vec<Event>, SessionError> {
        let raw = self.store.get_list(&user_activity_key(user_id))?;
        Ok(decode_events(&raw)?)
    }

    /// The session's own write has already committed, so a failure here only
    /// costs cross-session history.
    fn mirror_to_user(&self, user_id: &str, encoded: &[u8]) {
        if let Err(e) = self.store.append_to_list(
            &user_activity_key(user_id),
            encoded,
            self.config.user_activity_max,
            self.config.user_activity_ttl(),
        ) {
            warn!("Failed to record activity for user {user_id}: {e}");
        }
    }

    fn purge_if_due(&self, now: i64) {
        let interval = duration_millis(Duration::from_secs(self.config.purge_interval_secs));
        let last = self.last_purge.load(Ordering::Relaxed);
        if now.saturating_sub(last) < interval {
            return;
        }
        // Only one caller per interval does the work.
        if self
            .last_purge
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        match self.store.purge_expired() {
            Ok(0) => {}
            Ok(n) => debug!("Purged {n} expired keys"),
            Err(e) => warn!("Failed to purge expired keys: {e}"),
        }
    }

    fn read_meta(&self, session_id: &str) -> Result<Option<SessionMeta>, SessionError> {
        match self.store.get(&session_key(session_id))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(StoreError::from)?,
            )),
        }
    }

    /// Apply the optional age bound on top of the store's count bound.
    fn retained(&self, mut events: Vec<Event>, now: i64) -> Vec<Event> {
        if let Some(max_age) = self.config.max_event_age() {
            let cutoff = now.saturating_sub(duration_millis(max_age));
            events.retain(|e| e.timestamp >= cutoff);
        }
        events
    }
}

fn decode_events(raw: &[Vec<u8>]) -> Result<Vec<Event>, StoreError> {
    raw.iter()
        .map(|bytes| serde_json::from_slice(bytes).map_err(StoreError::from))
        .collect()
}
