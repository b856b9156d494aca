//! Notification aggregation module
//!
//! Collapses bursts of "actor did X to recipient" events into single
//! notification records: the first event of a burst is delivered instantly,
//! everything after it aggregates into the same group through an ephemeral
//! batch and a delayed, deduplicated flush.

mod engine;
mod group_store;
pub mod models;
mod reconciler;
mod schema;

pub use engine::AggregationEngine;
pub use group_store::{NotificationGroupStore, SqliteNotificationGroupStore};
pub use models::{
    AggregationKey, EventKind, GroupPage, GroupSummary, NotificationGroup, TargetRef,
};
pub use reconciler::FlushReconciler;
pub use schema::NOTIFICATION_VERSIONED_SCHEMAS;

use crate::config::{FlushWorkerSettings, NotificationSettings};
use crate::ephemeral::EphemeralStore;
use crate::flush_queue::{FlushTaskStore, FlushWorker, RetryPolicy};
use std::sync::Arc;

/// Wire an engine and the worker that flushes its windows around one shared
/// set of stores.
pub fn build_aggregation(
    ephemeral: Arc<dyn EphemeralStore>,
    groups: Arc<dyn NotificationGroupStore>,
    tasks: Arc<dyn FlushTaskStore>,
    notifications: NotificationSettings,
    flush_worker: &FlushWorkerSettings,
) -> (Arc<AggregationEngine>, FlushWorker) {
    let reconciler = Arc::new(FlushReconciler::new(
        ephemeral.clone(),
        groups.clone(),
        notifications.window,
    ));
    let engine = Arc::new(AggregationEngine::new(
        ephemeral,
        groups,
        tasks.clone(),
        notifications,
    ));
    let worker = FlushWorker::new(
        tasks,
        reconciler,
        RetryPolicy::new(flush_worker),
        flush_worker.poll_interval,
    );
    (engine, worker)
}
