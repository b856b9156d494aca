//! Scheduled flush task storage and persistence.
//!
//! Provides SQLite-backed storage for delayed, identity-deduplicated flush
//! tasks consumed by the worker loop.

use super::models::*;
use super::schema::FLUSH_TASK_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Trait for flush task scheduling and worker-side consumption.
pub trait FlushTaskStore: Send + Sync {
    // === Scheduling ===

    /// Schedule a payload for execution after `delay`. Deduplicated by
    /// identity: if a task with this identity already exists, in whatever
    /// state, the existing one wins. Returns whether a new task was
    /// enqueued.
    fn schedule(&self, identity: &str, payload: &TaskPayload, delay: Duration) -> Result<bool>;

    // === Worker Side ===

    /// Pending tasks whose due time has passed, oldest due first.
    fn due_tasks(&self, now: i64, limit: usize) -> Result<Vec<FlushTask>>;

    /// Remove a completed task; its identity becomes schedulable again.
    fn ack(&self, identity: &str) -> Result<()>;

    /// Record a failed attempt and push the task's due time to `retry_at`.
    fn mark_retry(&self, identity: &str, retry_at: i64, error: &str) -> Result<()>;

    /// Record a final failed attempt and park the task. The row is kept for
    /// inspection and keeps blocking its identity.
    fn mark_failed(&self, identity: &str, error: &str) -> Result<()>;

    /// Get a task by identity. Returns `Ok(None)` if it does not exist.
    fn get_task(&self, identity: &str) -> Result<Option<FlushTask>>;
}

/// SQLite-backed flush task store.
pub struct SqliteFlushTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFlushTaskStore {
    /// Open an existing database or create a new one with the current
    /// schema. Fails if an existing database does not match any known
    /// schema version.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            FLUSH_TASK_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new flush task database at {:?}", db_path.as_ref());
            conn
        };

        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Flush task database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = FLUSH_TASK_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Flush task database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        FLUSH_TASK_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteFlushTaskStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        FLUSH_TASK_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteFlushTaskStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a raw row, bypassing payload encoding. Lets tests plant
    /// undecodable payloads.
    #[cfg(test)]
    pub fn insert_raw(&self, identity: &str, payload_json: &str, due_at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO flush_tasks (identity, payload, status, due_at, attempts, created_at)
               VALUES (?1, ?2, ?3, ?4, 0, ?5)"#,
            rusqlite::params![
                identity,
                payload_json,
                TaskStatus::Pending.as_db_str(),
                due_at,
                now_millis()
            ],
        )?;
        Ok(())
    }

    /// Run any pending migrations.
    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = FLUSH_TASK_VERSIONED_SCHEMAS.len() - 1;

        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating flush task database from version {} to {}",
            current_version, target_version
        );

        for schema in FLUSH_TASK_VERSIONED_SCHEMAS
            .iter()
            .skip(current_version + 1)
        {
            if let Some(migration_fn) = schema.migration {
                info!("Running flush task migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }

        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;

        Ok(())
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<FlushTask> {
        Ok(FlushTask {
            identity: row.get("identity")?,
            payload: row.get("payload")?,
            status: TaskStatus::from_db_str(&row.get::<_, String>("status")?),
            due_at: row.get("due_at")?,
            attempts: row.get("attempts")?,
            created_at: row.get("created_at")?,
            last_error: row.get("last_error")?,
        })
    }
}

/// Current time in epoch milliseconds.
fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl FlushTaskStore for SqliteFlushTaskStore {
    // === Scheduling ===

    fn schedule(&self, identity: &str, payload: &TaskPayload, delay: Duration) -> Result<bool> {
        let payload_json = serde_json::to_string(payload)?;
        let now = now_millis();
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO flush_tasks
               (identity, payload, status, due_at, attempts, created_at)
               VALUES (?1, ?2, ?3, ?4, 0, ?5)"#,
            rusqlite::params![
                identity,
                payload_json,
                TaskStatus::Pending.as_db_str(),
                now + delay.as_millis() as i64,
                now
            ],
        )?;
        Ok(inserted > 0)
    }

    // === Worker Side ===

    fn due_tasks(&self, now: i64, limit: usize) -> Result<Vec<FlushTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM flush_tasks
               WHERE status = ?1 AND due_at <= ?2
               ORDER BY due_at ASC
               LIMIT ?3"#,
        )?;
        let tasks = stmt
            .query_map(
                rusqlite::params![TaskStatus::Pending.as_db_str(), now, limit as i64],
                Self::row_to_task,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn ack(&self, identity: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM flush_tasks WHERE identity = ?1", [identity])?;
        Ok(())
    }

    fn mark_retry(&self, identity: &str, retry_at: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE flush_tasks
               SET attempts = attempts + 1, due_at = ?2, last_error = ?3
               WHERE identity = ?1"#,
            rusqlite::params![identity, retry_at, error],
        )?;
        Ok(())
    }

    fn mark_failed(&self, identity: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE flush_tasks
               SET status = ?2, attempts = attempts + 1, last_error = ?3
               WHERE identity = ?1"#,
            rusqlite::params![identity, TaskStatus::Failed.as_db_str(), error],
        )?;
        Ok(())
    }

    fn get_task(&self, identity: &str) -> Result<Option<FlushTask>> {
        let conn = self.conn.lock().unwrap();
        let task = conn
            .query_row(
                "SELECT * FROM flush_tasks WHERE identity = ?1",
                [identity],
                Self::row_to_task,
            )
            .optional()?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::models::{EventKind, TargetRef};
    use tempfile::tempdir;

    fn follow_payload(group_id: &str) -> TaskPayload {
        TaskPayload::FlushNotification {
            kind: EventKind::Follow,
            recipient_id: "bob".to_string(),
            target: TargetRef::none(),
            group_id: group_id.to_string(),
        }
    }

    #[test]
    fn test_create_new_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("flush_tasks.db");

        let store = SqliteFlushTaskStore::new(&db_path).unwrap();

        assert!(db_path.exists());
        let conn = store.conn.lock().unwrap();
        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='flush_tasks'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_open_existing_database_keeps_tasks() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("flush_tasks.db");

        {
            let store = SqliteFlushTaskStore::new(&db_path).unwrap();
            store
                .schedule("flush:a", &follow_payload("g-1"), Duration::from_secs(600))
                .unwrap();
        }

        let store = SqliteFlushTaskStore::new(&db_path).unwrap();
        let task = store.get_task("flush:a").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
    }

    #[test]
    fn test_schema_version_stored() {
        let store = SqliteFlushTaskStore::in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version as usize, BASE_DB_VERSION);
    }

    #[test]
    fn test_schedule_deduplicates_by_identity() {
        let store = SqliteFlushTaskStore::in_memory().unwrap();

        let first = store
            .schedule("flush:a", &follow_payload("g-1"), Duration::from_millis(100))
            .unwrap();
        let original = store.get_task("flush:a").unwrap().unwrap();

        let second = store
            .schedule("flush:a", &follow_payload("g-1"), Duration::from_secs(3600))
            .unwrap();

        assert!(first);
        assert!(!second);
        let task = store.get_task("flush:a").unwrap().unwrap();
        assert_eq!(task.due_at, original.due_at, "reschedule must not move due time");
    }

    #[test]
    fn test_tasks_become_due_after_delay() {
        let store = SqliteFlushTaskStore::in_memory().unwrap();
        store
            .schedule("flush:a", &follow_payload("g-1"), Duration::from_millis(50))
            .unwrap();

        let now = now_millis();
        assert!(store.due_tasks(now, 10).unwrap().is_empty());

        let due = store.due_tasks(now + 60, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].identity, "flush:a");
    }

    #[test]
    fn test_due_tasks_orders_and_limits() {
        let store = SqliteFlushTaskStore::in_memory().unwrap();
        store
            .schedule("flush:b", &follow_payload("g-b"), Duration::from_millis(20))
            .unwrap();
        store
            .schedule("flush:a", &follow_payload("g-a"), Duration::from_millis(10))
            .unwrap();
        store
            .schedule("flush:c", &follow_payload("g-c"), Duration::from_millis(30))
            .unwrap();

        let due = store.due_tasks(now_millis() + 1000, 2).unwrap();
        let identities: Vec<&str> = due.iter().map(|t| t.identity.as_str()).collect();
        assert_eq!(identities, vec!["flush:a", "flush:b"]);
    }

    #[test]
    fn test_ack_removes_task_and_frees_identity() {
        let store = SqliteFlushTaskStore::in_memory().unwrap();
        store
            .schedule("flush:a", &follow_payload("g-1"), Duration::from_millis(10))
            .unwrap();

        store.ack("flush:a").unwrap();

        assert!(store.get_task("flush:a").unwrap().is_none());
        assert!(store
            .schedule("flush:a", &follow_payload("g-2"), Duration::from_millis(10))
            .unwrap());
    }

    #[test]
    fn test_mark_retry_defers_and_counts_attempt() {
        let store = SqliteFlushTaskStore::in_memory().unwrap();
        store
            .schedule("flush:a", &follow_payload("g-1"), Duration::from_millis(0))
            .unwrap();

        let retry_at = now_millis() + 5000;
        store.mark_retry("flush:a", retry_at, "db locked").unwrap();

        let task = store.get_task("flush:a").unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        assert_eq!(task.due_at, retry_at);
        assert_eq!(task.last_error, Some("db locked".to_string()));
        assert!(store.due_tasks(now_millis(), 10).unwrap().is_empty());
    }

    #[test]
    fn test_mark_failed_parks_task_and_blocks_identity() {
        let store = SqliteFlushTaskStore::in_memory().unwrap();
        store
            .schedule("flush:a", &follow_payload("g-1"), Duration::from_millis(0))
            .unwrap();

        store.mark_failed("flush:a", "gave up").unwrap();

        let task = store.get_task("flush:a").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error, Some("gave up".to_string()));

        // Failed tasks never come back as due, and keep owning the identity
        assert!(store.due_tasks(now_millis() + 1000, 10).unwrap().is_empty());
        assert!(!store
            .schedule("flush:a", &follow_payload("g-1"), Duration::from_millis(0))
            .unwrap());
    }

    #[test]
    fn test_payload_round_trips_through_storage() {
        let store = SqliteFlushTaskStore::in_memory().unwrap();
        let payload = TaskPayload::FlushNotification {
            kind: EventKind::Comment,
            recipient_id: "bob".to_string(),
            target: TargetRef::comment("post-1", "comment-9"),
            group_id: "g-1".to_string(),
        };
        store
            .schedule("flush:a", &payload, Duration::from_millis(10))
            .unwrap();

        let task = store.get_task("flush:a").unwrap().unwrap();
        let decoded: TaskPayload = serde_json::from_str(&task.payload).unwrap();
        assert_eq!(decoded, payload);
    }
}
