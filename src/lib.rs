//! Notifd Library
//!
//! This library exposes the internal modules for testing and embedding the
//! aggregation engine in a host process.

pub mod config;
pub mod ephemeral;
pub mod flush_queue;
pub mod notifications;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use ephemeral::{EphemeralStore, MemoryEphemeralStore, SetIfAbsent};
pub use flush_queue::{FlushTaskStore, FlushWorker, SqliteFlushTaskStore};
pub use notifications::{
    build_aggregation, AggregationEngine, EventKind, FlushReconciler, NotificationGroupStore,
    SqliteNotificationGroupStore, TargetRef,
};
