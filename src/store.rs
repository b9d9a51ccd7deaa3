//! Durable envelope cache backed by SQLite
//!
//! One database file per account holds mailbox sync checkpoints, cached
//! envelopes and per-mailbox sync locks. The [`CacheStore`] wraps a
//! `rusqlite::Connection` behind an `Arc<Mutex<>>` and runs every call on the
//! blocking thread pool via `tokio::task::spawn_blocking`.
//!
//! WAL journaling lets other processes read while a sync commits. A sync run
//! publishes its whole result through [`CacheStore::commit_sync`], a single
//! IMMEDIATE transaction, so readers observe either the previous snapshot or
//! the new one.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::{CachedEnvelope, Envelope, MailboxState, SearchOptions, SearchResult};
use crate::search;

/// Current schema version stored in `PRAGMA user_version`
const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS mailbox_state (
    name            TEXT PRIMARY KEY NOT NULL,
    uid_validity    INTEGER NOT NULL,
    last_uid        INTEGER NOT NULL DEFAULT 0,
    last_sync_unix  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS envelopes (
    mailbox         TEXT NOT NULL,
    uid             INTEGER NOT NULL,
    message_id      TEXT,
    date_unix       INTEGER NOT NULL DEFAULT 0,
    from_address    TEXT NOT NULL DEFAULT '',
    from_name       TEXT NOT NULL DEFAULT '',
    subject         TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (mailbox, uid)
);

CREATE INDEX IF NOT EXISTS idx_envelopes_date ON envelopes(mailbox, date_unix);
CREATE INDEX IF NOT EXISTS idx_envelopes_from ON envelopes(mailbox, from_address);
CREATE INDEX IF NOT EXISTS idx_envelopes_subject ON envelopes(mailbox, subject);

CREATE TABLE IF NOT EXISTS sync_locks (
    mailbox         TEXT PRIMARY KEY NOT NULL,
    owner           TEXT NOT NULL,
    acquired_unix   INTEGER NOT NULL
);
";

const ENVELOPE_COLUMNS: &str =
    "mailbox, uid, message_id, date_unix, from_address, from_name, subject";

/// Per-mailbox sync lease
///
/// Returned by [`CacheStore::acquire_sync_lock`]; the `owner` token proves
/// the lease at commit and release time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLock {
    pub mailbox: String,
    pub owner: String,
}

/// Everything one sync run publishes
#[derive(Debug, Clone)]
pub struct SyncCommit {
    pub mailbox: String,
    pub uid_validity: u32,
    pub last_uid: u32,
    /// Drop every cached row of the mailbox before inserting
    pub clear_first: bool,
    pub envelopes: Vec<Envelope>,
}

/// Thread-safe handle to the cache database
#[derive(Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl CacheStore {
    /// Open (or create) the cache at `path` and apply migrations
    ///
    /// Creates the parent directory when missing. This call blocks briefly
    /// (file I/O), so call it during startup.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the directory or database cannot be created.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::Store(format!(
                    "cannot create cache directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        info!(path = %path.display(), "opening cache database");
        let conn = Connection::open(path)?;
        Self::prepare(conn)
    }

    /// Create an in-memory cache, useful for tests
    pub fn open_in_memory() -> AppResult<Self> {
        debug!("opening in-memory cache database");
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> AppResult<Self> {
        apply_pragmas(&conn)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn execute<F, T>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| AppError::Internal(format!("cache mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Run a closure that needs `&mut Connection` (transactions)
    async fn execute_mut<F, T>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| AppError::Internal(format!("cache mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    // ── mailbox state ────────────────────────────────────────────────

    /// Sync checkpoint for a mailbox, if it was ever synced
    pub async fn get_mailbox_state(&self, name: &str) -> AppResult<Option<MailboxState>> {
        let name = name.to_owned();
        self.execute(move |conn| load_state(conn, &name)).await
    }

    /// Upsert a checkpoint, stamping the current time as last sync
    pub async fn update_mailbox_state(
        &self,
        name: &str,
        uid_validity: u32,
        last_uid: u32,
    ) -> AppResult<()> {
        let name = name.to_owned();
        self.execute(move |conn| {
            upsert_state(conn, &name, uid_validity, last_uid, Utc::now().timestamp())
        })
        .await
    }

    /// All checkpoints, ordered by mailbox name
    pub async fn list_mailbox_states(&self) -> AppResult<Vec<MailboxState>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, uid_validity, last_uid, last_sync_unix
                 FROM mailbox_state ORDER BY name",
            )?;
            let rows = stmt.query_map([], state_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Delete the mailbox's envelopes and checkpoint in one transaction
    pub async fn clear_mailbox(&self, name: &str) -> AppResult<()> {
        let name = name.to_owned();
        self.execute_mut(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            clear_rows(&tx, &name)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // ── envelopes ────────────────────────────────────────────────────

    /// Upsert envelopes keyed by `(mailbox, uid)`
    ///
    /// Re-inserting a UID overwrites the row. Empty input is a no-op.
    pub async fn insert_envelopes(&self, mailbox: &str, envelopes: Vec<Envelope>) -> AppResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }
        let mailbox = mailbox.to_owned();
        self.execute_mut(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            upsert_envelopes(&tx, &mailbox, &envelopes)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Point lookup of one cached envelope
    pub async fn get_envelope(&self, mailbox: &str, uid: u32) -> AppResult<Option<CachedEnvelope>> {
        let mailbox = mailbox.to_owned();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT {ENVELOPE_COLUMNS} FROM envelopes WHERE mailbox = ?1 AND uid = ?2"
            );
            Ok(conn
                .query_row(&sql, params![mailbox, uid], envelope_from_row)
                .optional()?)
        })
        .await
    }

    /// Number of envelopes cached for a mailbox
    pub async fn count_envelopes(&self, mailbox: &str) -> AppResult<u64> {
        let mailbox = mailbox.to_owned();
        self.execute(move |conn| count_rows(conn, &mailbox)).await
    }

    /// Query cached envelopes, newest first
    ///
    /// Sender and subject filters are ASCII case-insensitive substring
    /// matches. `since` is inclusive and `before` exclusive. Ties on date are
    /// broken by descending UID. Never writes.
    pub async fn search(&self, mailbox: &str, options: &SearchOptions) -> AppResult<SearchResult> {
        let mailbox = mailbox.to_owned();
        let options = options.clone();
        self.execute(move |conn| {
            let limit = i64::try_from(options.effective_limit()).unwrap_or(i64::MAX);
            let sql = format!(
                r"SELECT {ENVELOPE_COLUMNS} FROM envelopes
                  WHERE mailbox = ?1
                    AND (?2 IS NULL OR from_address LIKE ?2 ESCAPE '\')
                    AND (?3 IS NULL OR subject LIKE ?3 ESCAPE '\')
                    AND (?4 IS NULL OR date_unix >= ?4)
                    AND (?5 IS NULL OR date_unix < ?5)
                  ORDER BY date_unix DESC, uid DESC
                  LIMIT ?6"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![
                    mailbox,
                    options.from.as_deref().map(like_pattern),
                    options.subject.as_deref().map(like_pattern),
                    options.since,
                    options.before,
                    limit,
                ],
                envelope_from_row,
            )?;
            let messages = rows.collect::<Result<Vec<_>, _>>()?;

            let total_cached = count_rows(conn, &mailbox)?;
            let last_sync_unix = load_state(conn, &mailbox)?.map(|s| s.last_sync_unix);
            let freshness = search::describe_freshness(last_sync_unix, Utc::now().timestamp());

            Ok(SearchResult {
                mailbox,
                messages,
                total_cached,
                last_sync_unix,
                freshness,
            })
        })
        .await
    }

    // ── sync publication ─────────────────────────────────────────────

    /// Publish a sync run atomically
    ///
    /// In one IMMEDIATE transaction: verify `lock` still owns the mailbox,
    /// optionally clear the stale epoch, upsert the envelopes, and upsert the
    /// checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `SyncInProgress` if the lease was taken over, `Store` on any
    /// SQLite failure. Nothing is written in either case.
    pub async fn commit_sync(&self, lock: &SyncLock, commit: SyncCommit) -> AppResult<()> {
        let owner = lock.owner.clone();
        self.execute_mut(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_lock_owner(&tx, &commit.mailbox, &owner)?;
            if commit.clear_first {
                clear_rows(&tx, &commit.mailbox)?;
            }
            upsert_envelopes(&tx, &commit.mailbox, &commit.envelopes)?;
            upsert_state(
                &tx,
                &commit.mailbox,
                commit.uid_validity,
                commit.last_uid,
                Utc::now().timestamp(),
            )?;
            tx.commit()?;
            debug!(
                mailbox = %commit.mailbox,
                uid_validity = commit.uid_validity,
                last_uid = commit.last_uid,
                inserted = commit.envelopes.len(),
                cleared = commit.clear_first,
                "sync committed"
            );
            Ok(())
        })
        .await
    }

    /// Take the sync lease for a mailbox
    ///
    /// A lease older than `ttl` is considered abandoned and taken over.
    ///
    /// # Errors
    ///
    /// Returns `SyncInProgress` while another live run holds the lease.
    pub async fn acquire_sync_lock(&self, mailbox: &str, ttl: Duration) -> AppResult<SyncLock> {
        let lock = SyncLock {
            mailbox: mailbox.to_owned(),
            owner: Uuid::new_v4().to_string(),
        };
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let pending = lock.clone();
        self.execute_mut(move |conn| {
            let now = Utc::now().timestamp();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let expired = tx.execute(
                "DELETE FROM sync_locks WHERE mailbox = ?1 AND acquired_unix < ?2",
                params![pending.mailbox, now.saturating_sub(ttl_secs)],
            )?;
            if expired > 0 {
                warn!(mailbox = %pending.mailbox, "taking over abandoned sync lock");
            }
            let inserted = tx.execute(
                "INSERT INTO sync_locks (mailbox, owner, acquired_unix) VALUES (?1, ?2, ?3)
                 ON CONFLICT(mailbox) DO NOTHING",
                params![pending.mailbox, pending.owner, now],
            )?;
            if inserted == 0 {
                return Err(AppError::SyncInProgress(format!(
                    "mailbox '{}' is being synced by another run",
                    pending.mailbox
                )));
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        debug!(mailbox, owner = %lock.owner, "sync lock acquired");
        Ok(lock)
    }

    /// Refresh the lease's acquisition time so long runs do not expire
    ///
    /// # Errors
    ///
    /// Returns `SyncInProgress` if another run has taken the lease over.
    pub async fn renew_sync_lock(&self, lock: &SyncLock) -> AppResult<()> {
        let lock = lock.clone();
        self.execute(move |conn| {
            let renewed = conn.execute(
                "UPDATE sync_locks SET acquired_unix = ?3 WHERE mailbox = ?1 AND owner = ?2",
                params![lock.mailbox, lock.owner, Utc::now().timestamp()],
            )?;
            if renewed == 0 {
                return Err(AppError::SyncInProgress(format!(
                    "sync lock for mailbox '{}' was taken over by another run",
                    lock.mailbox
                )));
            }
            Ok(())
        })
        .await
    }

    /// Age a lease as if it had been acquired at `acquired_unix`
    #[cfg(test)]
    pub(crate) async fn backdate_sync_lock(
        &self,
        mailbox: &str,
        acquired_unix: i64,
    ) -> AppResult<()> {
        let mailbox = mailbox.to_owned();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sync_locks SET acquired_unix = ?2 WHERE mailbox = ?1",
                params![mailbox, acquired_unix],
            )?;
            Ok(())
        })
        .await
    }

    /// Release a lease; a no-op if it was already taken over
    pub async fn release_sync_lock(&self, lock: &SyncLock) -> AppResult<()> {
        let lock = lock.clone();
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM sync_locks WHERE mailbox = ?1 AND owner = ?2",
                params![lock.mailbox, lock.owner],
            )?;
            Ok(())
        })
        .await
    }
}

/// Apply journaling and contention pragmas to a fresh connection
fn apply_pragmas(conn: &Connection) -> AppResult<()> {
    // WAL: readers proceed while a sync commits.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

fn migrate(conn: &Connection) -> AppResult<()> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        info!(from = version, to = SCHEMA_VERSION, "migrating cache schema");
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

fn load_state(conn: &Connection, name: &str) -> AppResult<Option<MailboxState>> {
    Ok(conn
        .query_row(
            "SELECT name, uid_validity, last_uid, last_sync_unix
             FROM mailbox_state WHERE name = ?1",
            params![name],
            state_from_row,
        )
        .optional()?)
}

fn upsert_state(
    conn: &Connection,
    name: &str,
    uid_validity: u32,
    last_uid: u32,
    now: i64,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO mailbox_state (name, uid_validity, last_uid, last_sync_unix)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
             uid_validity = excluded.uid_validity,
             last_uid = excluded.last_uid,
             last_sync_unix = excluded.last_sync_unix",
        params![name, uid_validity, last_uid, now],
    )?;
    Ok(())
}

fn clear_rows(conn: &Connection, name: &str) -> AppResult<()> {
    let removed = conn.execute("DELETE FROM envelopes WHERE mailbox = ?1", params![name])?;
    conn.execute("DELETE FROM mailbox_state WHERE name = ?1", params![name])?;
    info!(mailbox = name, removed, "cleared cached mailbox");
    Ok(())
}

fn upsert_envelopes(conn: &Connection, mailbox: &str, envelopes: &[Envelope]) -> AppResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO envelopes
             (mailbox, uid, message_id, date_unix, from_address, from_name, subject)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(mailbox, uid) DO UPDATE SET
             message_id = excluded.message_id,
             date_unix = excluded.date_unix,
             from_address = excluded.from_address,
             from_name = excluded.from_name,
             subject = excluded.subject",
    )?;
    for env in envelopes {
        stmt.execute(params![
            mailbox,
            env.uid,
            env.message_id,
            env.date,
            env.from_address,
            env.from_name,
            env.subject,
        ])?;
    }
    Ok(())
}

fn count_rows(conn: &Connection, mailbox: &str) -> AppResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM envelopes WHERE mailbox = ?1",
        params![mailbox],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
}

fn ensure_lock_owner(conn: &Connection, mailbox: &str, owner: &str) -> AppResult<()> {
    let holder: Option<String> = conn
        .query_row(
            "SELECT owner FROM sync_locks WHERE mailbox = ?1",
            params![mailbox],
            |row| row.get(0),
        )
        .optional()?;
    if holder.as_deref() == Some(owner) {
        Ok(())
    } else {
        Err(AppError::SyncInProgress(format!(
            "sync lock for mailbox '{mailbox}' is no longer held by this run"
        )))
    }
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<MailboxState> {
    Ok(MailboxState {
        name: row.get(0)?,
        uid_validity: row.get(1)?,
        last_uid: row.get(2)?,
        last_sync_unix: row.get(3)?,
    })
}

fn envelope_from_row(row: &Row<'_>) -> rusqlite::Result<CachedEnvelope> {
    Ok(CachedEnvelope {
        mailbox: row.get(0)?,
        uid: row.get(1)?,
        message_id: row.get(2)?,
        date: row.get(3)?,
        from_address: row.get(4)?,
        from_name: row.get(5)?,
        subject: row.get(6)?,
    })
}

/// Build a `LIKE` pattern matching `needle` literally anywhere
fn like_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for ch in needle.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}
