//! Durable delayed task queue for notification flushes.
//!
//! Tasks are deduplicated by identity at enqueue time, survive process
//! restarts, and are executed at least once after their delay by a polling
//! worker.

mod models;
mod retry_policy;
mod schema;
mod task_store;
mod worker;

pub use models::*;
pub use retry_policy::RetryPolicy;
pub use schema::FLUSH_TASK_VERSIONED_SCHEMAS;
pub use task_store::{FlushTaskStore, SqliteFlushTaskStore};
pub use worker::FlushWorker;
