//! Flush queue data models and the execution contract.

use crate::notifications::models::{EventKind, TargetRef};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a scheduled task.
///
/// There is no "running" state: a crash mid-execution leaves the row
/// pending and due, so the task simply runs again (at-least-once).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Failed,
}

impl TaskStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> TaskStatus {
        match s {
            "FAILED" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

/// What a scheduled task does, serialized as `{"type": ..., "data": ...}`
/// into the task row. Closed set: unknown payloads fail decoding and are
/// never executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskPayload {
    FlushNotification {
        kind: EventKind,
        recipient_id: String,
        target: TargetRef,
        group_id: String,
    },
}

/// A scheduled task row.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushTask {
    /// Dedup identity, also the primary key.
    pub identity: String,
    /// JSON-encoded [`TaskPayload`], decoded at execution time.
    pub payload: String,
    pub status: TaskStatus,
    /// Epoch millis at which the task becomes eligible to run.
    pub due_at: i64,
    /// Completed execution attempts.
    pub attempts: i64,
    /// Epoch millis.
    pub created_at: i64,
    /// Message from the most recent failed attempt.
    pub last_error: Option<String>,
}

/// What a successful flush execution did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Batch merged into the scheduled group.
    Flushed { new_actors: i64 },
    /// Nothing to merge; an earlier execution already consumed the batch.
    EmptyBatch,
    /// The scheduled group had vanished; batch merged into a fallback
    /// group or a freshly created one.
    Reseeded { new_actors: i64 },
}

/// Why a flush execution failed.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    /// Worth retrying: a store signalled a (presumably) passing failure.
    #[error("transient failure: {0}")]
    Transient(#[from] anyhow::Error),
    /// Never worth retrying: the payload cannot be executed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl FlushError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FlushError::MalformedPayload(_))
    }
}

/// Executes one scheduled task.
///
/// The queue delivers at least once, so implementations must tolerate
/// running twice for the same payload.
pub trait FlushHandler: Send + Sync {
    fn handle(&self, payload: &TaskPayload) -> Result<FlushOutcome, FlushError>;
}
