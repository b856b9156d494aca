//! Notification group storage and persistence.
//!
//! Provides SQLite-backed storage for aggregated notification groups and
//! their actor memberships.

use super::models::*;
use super::schema::NOTIFICATION_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// How many actor ids the list view carries per group.
const ACTOR_PREVIEW_LIMIT: usize = 3;

/// Trait for notification group storage operations.
///
/// The aggregation engine only needs the write operations; the read surface
/// serves whatever presents notifications to the recipient.
pub trait NotificationGroupStore: Send + Sync {
    // === Aggregation Writes ===

    /// Persist a freshly opened group. The caller owns id generation.
    fn create_group(&self, group: NotificationGroup) -> Result<NotificationGroup>;

    /// Atomically fold a flush into a group: add `delta` actors and replace
    /// the last actor. Returns the updated group, or `Ok(None)` if the group
    /// no longer exists.
    fn increment_group(
        &self,
        group_id: &str,
        delta: i64,
        last_actor_id: &str,
    ) -> Result<Option<NotificationGroup>>;

    /// Record `(group, actor)` pairs. Idempotent: pairs that already exist
    /// are skipped, never an error.
    fn add_actor_memberships(&self, group_id: &str, actor_ids: &[String]) -> Result<()>;

    /// Find the newest unread group matching an aggregation key with
    /// activity at or after `since` (epoch millis). Returns `Ok(None)` if
    /// there is none.
    fn find_recent_unread_group(
        &self,
        recipient_id: &str,
        kind: EventKind,
        target: &TargetRef,
        since: i64,
    ) -> Result<Option<NotificationGroup>>;

    // === Read Surface ===

    /// Get a group by id. Returns `Ok(None)` if it does not exist.
    fn get_group(&self, group_id: &str) -> Result<Option<NotificationGroup>>;

    /// Page through a recipient's groups, newest activity first, with an
    /// actor preview per group plus total and unread counts.
    fn list_groups(&self, recipient_id: &str, limit: usize, offset: usize) -> Result<GroupPage>;

    /// Mark a group read. Idempotent: marking an already-read group keeps
    /// its `updated_at`. Returns `Ok(None)` if the group does not exist or
    /// belongs to another recipient.
    fn mark_read(&self, group_id: &str, recipient_id: &str) -> Result<Option<NotificationGroup>>;

    /// Delete a group (and, via cascade, its memberships). Returns whether a
    /// row was removed; false covers both missing and not-owned groups.
    fn delete_group(&self, group_id: &str, recipient_id: &str) -> Result<bool>;

    /// All actor ids recorded for a group, oldest first.
    fn actor_memberships(&self, group_id: &str) -> Result<Vec<String>>;
}

/// SQLite-backed notification group store.
pub struct SqliteNotificationGroupStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteNotificationGroupStore {
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
            NOTIFICATION_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new notification database at {:?}", db_path.as_ref());
            conn
        };

        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Notification database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = NOTIFICATION_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Notification database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        NOTIFICATION_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteNotificationGroupStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        NOTIFICATION_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteNotificationGroupStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run any pending migrations.
    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = NOTIFICATION_VERSIONED_SCHEMAS.len() - 1;

        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating notification database from version {} to {}",
            current_version, target_version
        );

        for schema in NOTIFICATION_VERSIONED_SCHEMAS
            .iter()
            .skip(current_version + 1)
        {
            if let Some(migration_fn) = schema.migration {
                info!("Running notification migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }

        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;

        Ok(())
    }

    fn row_to_group(row: &rusqlite::Row) -> rusqlite::Result<NotificationGroup> {
        Ok(NotificationGroup {
            id: row.get("id")?,
            recipient_id: row.get("recipient_id")?,
            kind: EventKind::from_str(&row.get::<_, String>("kind")?)
                .unwrap_or(EventKind::Follow),
            target: TargetRef {
                post_id: row.get("post_id")?,
                comment_id: row.get("comment_id")?,
            },
            actors_count: row.get("actors_count")?,
            last_actor_id: row.get("last_actor_id")?,
            is_read: row.get::<_, i64>("is_read")? != 0,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl NotificationGroupStore for SqliteNotificationGroupStore {
    // === Aggregation Writes ===

    fn create_group(&self, group: NotificationGroup) -> Result<NotificationGroup> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO notification_groups (
                id, recipient_id, kind, post_id, comment_id,
                actors_count, last_actor_id, is_read, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            rusqlite::params![
                group.id,
                group.recipient_id,
                group.kind.as_str(),
                group.target.post_id,
                group.target.comment_id,
                group.actors_count,
                group.last_actor_id,
                group.is_read as i64,
                group.created_at,
                group.updated_at,
            ],
        )?;
        Ok(group)
    }

    fn increment_group(
        &self,
        group_id: &str,
        delta: i64,
        last_actor_id: &str,
    ) -> Result<Option<NotificationGroup>> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"UPDATE notification_groups
               SET actors_count = actors_count + ?2,
                   last_actor_id = ?3,
                   updated_at = ?4
               WHERE id = ?1"#,
            rusqlite::params![group_id, delta, last_actor_id, now_millis()],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let group = conn
            .query_row(
                "SELECT * FROM notification_groups WHERE id = ?1",
                [group_id],
                Self::row_to_group,
            )
            .optional()?;
        Ok(group)
    }

    fn add_actor_memberships(&self, group_id: &str, actor_ids: &[String]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_millis();
        let mut stmt = conn.prepare(
            r#"INSERT OR IGNORE INTO actor_memberships (group_id, actor_id, created_at)
               VALUES (?1, ?2, ?3)"#,
        )?;
        for actor_id in actor_ids {
            stmt.execute(rusqlite::params![group_id, actor_id, now])?;
        }
        Ok(())
    }

    fn find_recent_unread_group(
        &self,
        recipient_id: &str,
        kind: EventKind,
        target: &TargetRef,
        since: i64,
    ) -> Result<Option<NotificationGroup>> {
        let conn = self.conn.lock().unwrap();
        // IS instead of = so NULL target columns compare as equal
        let group = conn
            .query_row(
                r#"SELECT * FROM notification_groups
                   WHERE recipient_id = ?1 AND kind = ?2
                     AND post_id IS ?3 AND comment_id IS ?4
                     AND is_read = 0 AND updated_at >= ?5
                   ORDER BY updated_at DESC
                   LIMIT 1"#,
                rusqlite::params![
                    recipient_id,
                    kind.as_str(),
                    target.post_id,
                    target.comment_id,
                    since
                ],
                Self::row_to_group,
            )
            .optional()?;
        Ok(group)
    }

    // === Read Surface ===

    fn get_group(&self, group_id: &str) -> Result<Option<NotificationGroup>> {
        let conn = self.conn.lock().unwrap();
        let group = conn
            .query_row(
                "SELECT * FROM notification_groups WHERE id = ?1",
                [group_id],
                Self::row_to_group,
            )
            .optional()?;
        Ok(group)
    }

    fn list_groups(&self, recipient_id: &str, limit: usize, offset: usize) -> Result<GroupPage> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            r#"SELECT * FROM notification_groups
               WHERE recipient_id = ?1
               ORDER BY updated_at DESC
               LIMIT ?2 OFFSET ?3"#,
        )?;
        let groups = stmt
            .query_map(
                rusqlite::params![recipient_id, limit as i64, offset as i64],
                Self::row_to_group,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut preview_stmt = conn.prepare(
            r#"SELECT actor_id FROM actor_memberships
               WHERE group_id = ?1
               ORDER BY id DESC
               LIMIT ?2"#,
        )?;
        let mut summaries = Vec::with_capacity(groups.len());
        for group in groups {
            let actor_preview = preview_stmt
                .query_map(
                    rusqlite::params![group.id, ACTOR_PREVIEW_LIMIT as i64],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            summaries.push(GroupSummary {
                group,
                actor_preview,
            });
        }

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notification_groups WHERE recipient_id = ?1",
            [recipient_id],
            |row| row.get(0),
        )?;
        let unread: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notification_groups WHERE recipient_id = ?1 AND is_read = 0",
            [recipient_id],
            |row| row.get(0),
        )?;

        Ok(GroupPage {
            groups: summaries,
            total,
            unread,
        })
    }

    fn mark_read(&self, group_id: &str, recipient_id: &str) -> Result<Option<NotificationGroup>> {
        let conn = self.conn.lock().unwrap();
        // Only touch unread rows so a repeated mark keeps the original
        // read timestamp
        conn.execute(
            r#"UPDATE notification_groups
               SET is_read = 1, updated_at = ?3
               WHERE id = ?1 AND recipient_id = ?2 AND is_read = 0"#,
            rusqlite::params![group_id, recipient_id, now_millis()],
        )?;

        let group = conn
            .query_row(
                "SELECT * FROM notification_groups WHERE id = ?1 AND recipient_id = ?2",
                rusqlite::params![group_id, recipient_id],
                Self::row_to_group,
            )
            .optional()?;
        Ok(group)
    }

    fn delete_group(&self, group_id: &str, recipient_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM notification_groups WHERE id = ?1 AND recipient_id = ?2",
            rusqlite::params![group_id, recipient_id],
        )?;
        Ok(deleted > 0)
    }

    fn actor_memberships(&self, group_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT actor_id FROM actor_memberships
               WHERE group_id = ?1
               ORDER BY id ASC"#,
        )?;
        let actors = stmt
            .query_map([group_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(actors)
    }
}
