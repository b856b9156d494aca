//! Database schema for notifications.db.
//!
//! Defines versioned schema migrations for the notification group database.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

// =============================================================================
// Notification Groups - Version 1
// =============================================================================

/// One row per aggregation window, folding every actor the window saw.
const NOTIFICATION_GROUPS_TABLE_V1: Table = Table {
    name: "notification_groups",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("recipient_id", &SqlType::Text, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("post_id", &SqlType::Text),
        sqlite_column!("comment_id", &SqlType::Text),
        sqlite_column!("actors_count", &SqlType::Integer, non_null = true),
        sqlite_column!("last_actor_id", &SqlType::Text, non_null = true),
        sqlite_column!("is_read", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        // Recipient list view, newest activity first
        ("idx_groups_recipient_updated", "recipient_id, updated_at"),
        // Fallback lookup of a recent group for one aggregation key
        (
            "idx_groups_aggregation_key",
            "recipient_id, kind, post_id, comment_id",
        ),
    ],
    unique_constraints: &[],
};

const NOTIFICATION_GROUPS_FK: ForeignKey = ForeignKey {
    foreign_table: "notification_groups",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

/// Distinct `(group, actor)` pairs; the unique constraint is what makes
/// membership insertion idempotent via INSERT OR IGNORE.
const ACTOR_MEMBERSHIPS_TABLE_V1: Table = Table {
    name: "actor_memberships",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "group_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&NOTIFICATION_GROUPS_FK)
        ),
        sqlite_column!("actor_id", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["group_id", "actor_id"]],
};

pub const NOTIFICATION_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[NOTIFICATION_GROUPS_TABLE_V1, ACTOR_MEMBERSHIPS_TABLE_V1],
    migration: None,
}];
