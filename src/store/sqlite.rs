//! SQLite-backed store.
//!
//! Plain values live in `kv`, lists in `list_items` keyed by `(key, seq)`
//! with their expiry and sequence counter in `list_meta`. Expired rows are
//! invisible to every read. They are deleted on the next write to the same
//! key, and in bulk by [`SessionStore::purge_expired`], which also runs
//! whenever a store is opened.
//!
//! Multiple processes may share one database file. Bounded appends run in an
//! `IMMEDIATE` transaction, so concurrent appenders serialize on SQLite's
//! write lock. Waits for that lock and for the connection inside this process
//! are both bounded by the store timeout and reported as
//! [`StoreError::Timeout`].

use super::SessionStore;
use crate::clock::{duration_millis, Clock};
use crate::error::StoreError;
use log::{debug, warn};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

/// Poll interval while waiting for the connection mutex.
const LOCK_POLL: Duration = Duration::from_millis(1);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS kv (
        key        TEXT    PRIMARY KEY,
        value      BLOB    NOT NULL,
        expires_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS list_meta (
        key        TEXT    PRIMARY KEY,
        expires_at INTEGER NOT NULL,
        next_seq   INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS list_items (
        key  TEXT    NOT NULL,
        seq  INTEGER NOT NULL,
        item BLOB    NOT NULL,
        PRIMARY KEY (key, seq)
    );
    CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);
";

/// Durable [`SessionStore`] on a SQLite file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the parent directory cannot be created or the file cannot be
    /// opened as a SQLite database.
    pub fn open(path: &Path, timeout: Duration, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| map_sqlite(e, timeout))?;
        Self::with_connection(conn, timeout, clock)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory(timeout: Duration, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| map_sqlite(e, timeout))?;
        Self::with_connection(conn, timeout, clock)
    }

    fn with_connection(
        conn: Connection,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        conn.busy_timeout(timeout).map_err(|e| map_sqlite(e, timeout))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| map_sqlite(e, timeout))?;
        debug!("SQLite session store journal mode: {mode}");
        conn.execute_batch(SCHEMA).map_err(|e| map_sqlite(e, timeout))?;

        let store = Self {
            conn: Mutex::new(conn),
            timeout,
            clock,
        };
        if let Err(e) = store.purge_expired() {
            warn!("Could not purge expired session keys on open: {e}");
        }
        Ok(store)
    }

    /// Connection guard, waiting at most the store timeout.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.conn.try_lock() {
                Ok(conn) => return Ok(conn),
                Err(TryLockError::Poisoned(_)) => return Err(StoreError::Poisoned),
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                    return Err(StoreError::Timeout(self.timeout));
                }
                Err(TryLockError::WouldBlock) => thread::sleep(LOCK_POLL),
            }
        }
    }

    fn err(&self, e: rusqlite::Error) -> StoreError {
        map_sqlite(e, self.timeout)
    }
}

/// Append `item` to the list under `key` inside `tx`, trim it to the newest
/// `keep` items and return what is left, oldest first.
fn push_bounded(
    tx: &Transaction<'_>,
    key: &str,
    item: &[u8],
    keep: i64,
    now: i64,
    expires_at: i64,
) -> rusqlite::Result<Vec<Vec<u8>>> {
    let meta: Option<(i64, i64)> = tx
        .query_row(
            "SELECT expires_at, next_seq FROM list_meta WHERE key = ?1",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let seq = match meta {
        Some((exp, next_seq)) if exp > now => next_seq,
        Some(_) => {
            // Expired list: start over.
            tx.execute("DELETE FROM list_items WHERE key = ?1", [key])?;
            0
        }
        None => 0,
    };

    tx.execute(
        "INSERT INTO list_items (key, seq, item) VALUES (?1, ?2, ?3)",
        params![key, seq, item],
    )?;
    tx.execute(
        "INSERT INTO list_meta (key, expires_at, next_seq) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at, next_seq = excluded.next_seq",
        params![key, expires_at, seq + 1],
    )?;
    tx.execute(
        "DELETE FROM list_items WHERE key = ?1 AND seq <= ?2",
        params![key, seq - keep],
    )?;

    let mut stmt = tx.prepare("SELECT item FROM list_items WHERE key = ?1 ORDER BY seq")?;
    let items = stmt
        .query_map([key], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

fn map_sqlite(e: rusqlite::Error, timeout: Duration) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(code.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Timeout(timeout)
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

impl SessionStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now_millis();
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2",
            params![key, now],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| self.err(e))
    }

    fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let expires_at = self.clock.now_millis().saturating_add(duration_millis(ttl));
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )
        .map_err(|e| self.err(e))?;
        Ok(())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        let conn = self.lock()?;
        let kv = conn
            .execute(
                "UPDATE kv SET expires_at = ?1 WHERE key = ?2 AND expires_at > ?3",
                params![expires_at, key, now],
            )
            .map_err(|e| self.err(e))?;
        let list = conn
            .execute(
                "UPDATE list_meta SET expires_at = ?1 WHERE key = ?2 AND expires_at > ?3",
                params![expires_at, key, now],
            )
            .map_err(|e| self.err(e))?;
        Ok(kv + list > 0)
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
        let keep = i64::try_from(max_len.max(1)).unwrap_or(i64::MAX);

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.err(e))?;
        let items = push_bounded(&tx, key, item, keep, now, expires_at).map_err(|e| self.err(e))?;
        tx.commit().map_err(|e| self.err(e))?;
        Ok(items)
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
        let keep = i64::try_from(max_len.max(1)).unwrap_or(i64::MAX);

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.err(e))?;

        let refreshed = tx
            .execute(
                "UPDATE kv SET value = ?1, expires_at = ?2 WHERE key = ?3 AND expires_at > ?4",
                params![guard_value, expires_at, guard, now],
            )
            .map_err(|e| self.err(e))?;
        if refreshed == 0 {
            // Dropping the transaction rolls it back.
            return Ok(None);
        }

        let items = push_bounded(&tx, key, item, keep, now, expires_at).map_err(|e| self.err(e))?;
        tx.commit().map_err(|e| self.err(e))?;
        Ok(Some(items))
    }

    fn get_list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let now = self.clock.now_millis();
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT i.item FROM list_items i
                 JOIN list_meta m ON m.key = i.key
                 WHERE i.key = ?1 AND m.expires_at > ?2
                 ORDER BY i.seq",
            )
            .map_err(|e| self.err(e))?;
        let rows = stmt
            .query_map(params![key, now], |row| row.get::<_, Vec<u8>>(0))
            .map_err(|e| self.err(e))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| self.err(e))
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.err(e))?;
        let kv = tx
            .execute("DELETE FROM kv WHERE expires_at <= ?1", [now])
            .map_err(|e| self.err(e))?;
        tx.execute(
            "DELETE FROM list_items WHERE key IN (SELECT key FROM list_meta WHERE expires_at <= ?1)",
            [now],
        )
        .map_err(|e| self.err(e))?;
        let lists = tx
            .execute("DELETE FROM list_meta WHERE expires_at <= ?1", [now])
            .map_err(|e| self.err(e))?;
        tx.commit().map_err(|e| self.err(e))?;
        if kv + lists > 0 {
            debug!("Purged {} expired session keys", kv + lists);
        }
        Ok(kv + lists)
    }

    fn ping(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| self.err(e))
    }
}
