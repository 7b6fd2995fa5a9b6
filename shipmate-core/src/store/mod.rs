//! Persistent store — typed SQLite collections behind one owner.
//!
//! The store is the single writer of persistent truth: conversations,
//! facts, tasks, scheduled jobs, chat registrations, and secrets all live
//! here, and every mutation goes through it. Write-time triggers enforce
//! the per-entity invariants (fact `updated_at` bumps, task `completed_at`
//! set/clear); the job collection recomputes `next_run` on writes that
//! change the schedule.
//!
//! Writes run in WAL mode and are durable before the call returns. When
//! the database is unreachable callers get a structured [`StoreError`] and
//! are expected to degrade rather than propagate a panic.

mod conversations;
mod facts;
mod jobs;
mod registrations;
mod secret_rows;
mod tasks;

pub use conversations::{ConversationEntry, ConversationRole};
pub use facts::Fact;
pub use jobs::{JobSpec, JobStatus, ScheduledJob};
pub use registrations::{ChatRegistration, ChatType, NotificationLevel};
pub use secret_rows::SecretRow;
pub use tasks::{Task, TaskPriority, TaskStatus};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

use crate::error::StoreError;

/// The SQLite-backed store. Thread-safe; share behind an `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Unreachable {
                message: format!("cannot create data dir: {e}"),
            })?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Unreachable {
            message: e.to_string(),
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::from)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(StoreError::from)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreError::from)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Unreachable {
            message: e.to_string(),
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Migration {
                message: e.to_string(),
            })
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }
}

/// Serialize a timestamp the way every column stores it.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a stored timestamp.
pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidField {
            field: "timestamp".into(),
            message: format!("{s}: {e}"),
        })
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL,
    role        TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content     TEXT NOT NULL CHECK (length(content) > 0),
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_user
    ON conversations (user_id, id DESC);

CREATE TABLE IF NOT EXISTS facts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL,
    category    TEXT NOT NULL DEFAULT 'general',
    fact        TEXT NOT NULL CHECK (length(fact) > 0),
    source      TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_facts_user ON facts (user_id, category);

-- Any row mutation bumps updated_at, keeping updated_at >= created_at.
CREATE TRIGGER IF NOT EXISTS facts_touch_updated_at
AFTER UPDATE ON facts
FOR EACH ROW
WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE facts
    SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
    WHERE id = NEW.id;
END;

CREATE TABLE IF NOT EXISTS tasks (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      TEXT NOT NULL,
    title        TEXT NOT NULL CHECK (length(title) > 0),
    description  TEXT,
    status       TEXT NOT NULL DEFAULT 'pending'
                 CHECK (status IN ('pending', 'in_progress', 'completed', 'cancelled')),
    priority     TEXT NOT NULL DEFAULT 'medium'
                 CHECK (priority IN ('low', 'medium', 'high', 'urgent')),
    due_date     TEXT,
    created_at   TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks (user_id, status);

-- status = completed <=> completed_at set.
CREATE TRIGGER IF NOT EXISTS tasks_set_completed_at
AFTER UPDATE OF status ON tasks
FOR EACH ROW
WHEN NEW.status = 'completed' AND OLD.status != 'completed'
BEGIN
    UPDATE tasks
    SET completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
    WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS tasks_clear_completed_at
AFTER UPDATE OF status ON tasks
FOR EACH ROW
WHEN NEW.status != 'completed' AND OLD.status = 'completed'
BEGIN
    UPDATE tasks SET completed_at = NULL WHERE id = NEW.id;
END;

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    name        TEXT PRIMARY KEY,
    kind        TEXT NOT NULL CHECK (kind IN ('cron', 'one_shot')),
    cron_expr   TEXT,
    trigger_at  TEXT,
    handler     TEXT NOT NULL,
    params      TEXT NOT NULL DEFAULT '{}',
    enabled     INTEGER NOT NULL DEFAULT 1,
    last_run    TEXT,
    next_run    TEXT,
    status      TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'completed', 'cancelled', 'failed')),
    user_id     TEXT,
    CHECK ((kind = 'cron') = (cron_expr IS NOT NULL)),
    CHECK ((kind = 'one_shot') = (trigger_at IS NOT NULL))
);
CREATE INDEX IF NOT EXISTS idx_jobs_due ON scheduled_jobs (enabled, status, next_run);

CREATE TABLE IF NOT EXISTS chat_registrations (
    chat_id        TEXT PRIMARY KEY,
    reg_type       TEXT NOT NULL CHECK (reg_type IN ('repo', 'company', 'hq')),
    target         TEXT,
    notifications  TEXT NOT NULL DEFAULT 'all'
                   CHECK (notifications IN ('all', 'critical', 'digest')),
    platform       TEXT NOT NULL,
    label          TEXT,
    registered_at  TEXT NOT NULL,
    registered_by  TEXT NOT NULL,
    CHECK ((reg_type = 'hq') = (target IS NULL))
);

CREATE TABLE IF NOT EXISTS secrets (
    name               TEXT PRIMARY KEY,
    encrypted_value    TEXT NOT NULL,
    encryption_key_id  TEXT NOT NULL,
    owner_user_id      TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_migrates() {
        let store = Store::open_in_memory().unwrap();
        // Schema is idempotent.
        store.migrate().unwrap();
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("shipmate.db");
        let _store = Store::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_ts_roundtrip() {
        let now = Utc::now();
        let parsed = parse_ts(&ts(now)).unwrap();
        assert!((parsed - now).num_milliseconds().abs() <= 1);
    }
}
