//! Database schema for flush_tasks.db.
//!
//! Defines versioned schema migrations for the scheduled flush task database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Flush Tasks - Version 1
// =============================================================================

/// Scheduled flush tasks. The identity primary key is what deduplicates
/// repeated scheduling of the same window flush.
const FLUSH_TASKS_TABLE_V1: Table = Table {
    name: "flush_tasks",
    columns: &[
        sqlite_column!("identity", &SqlType::Text, is_primary_key = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("due_at", &SqlType::Integer, non_null = true),
        sqlite_column!("attempts", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("last_error", &SqlType::Text),
    ],
    indices: &[("idx_tasks_status_due", "status, due_at")],
    unique_constraints: &[],
};

pub const FLUSH_TASK_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[FLUSH_TASKS_TABLE_V1],
    migration: None,
}];
