//! Sequential executor of due flush tasks.
//!
//! Polls the task store on a fixed interval and runs whatever has come due,
//! one task at a time. A task is only acknowledged after its handler
//! returns, so a crash mid-execution leaves the row due and it runs again
//! after restart.

use crate::flush_queue::{
    FlushError, FlushHandler, FlushOutcome, FlushTask, FlushTaskStore, RetryPolicy, TaskPayload,
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How many due tasks a single poll picks up.
const DRAIN_LIMIT: usize = 16;

pub struct FlushWorker {
    task_store: Arc<dyn FlushTaskStore>,
    handler: Arc<dyn FlushHandler>,
    retry_policy: RetryPolicy,
    poll_interval: Duration,
}

impl FlushWorker {
    pub fn new(
        task_store: Arc<dyn FlushTaskStore>,
        handler: Arc<dyn FlushHandler>,
        retry_policy: RetryPolicy,
        poll_interval: Duration,
    ) -> Self {
        Self {
            task_store,
            handler,
            retry_policy,
            poll_interval,
        }
    }

    /// Run the polling loop until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Flush worker starting (poll interval: {:?})",
            self.poll_interval
        );
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_due_tasks() {
                        warn!("Flush worker poll failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Flush worker shutting down");
                    break;
                }
            }
        }

        info!("Flush worker stopped");
    }

    /// Execute every currently due task, oldest due first.
    fn drain_due_tasks(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let due = self.task_store.due_tasks(now, DRAIN_LIMIT)?;
        if !due.is_empty() {
            debug!("Executing {} due flush task(s)", due.len());
        }
        let count = due.len();
        for task in due {
            if let Err(e) = self.execute(&task) {
                warn!("Failed to settle task '{}': {}", task.identity, e);
            }
        }
        Ok(count)
    }

    /// Run one task and settle it: ack on success, reschedule or park on
    /// failure.
    fn execute(&self, task: &FlushTask) -> Result<()> {
        let payload: TaskPayload = match serde_json::from_str(&task.payload) {
            Ok(payload) => payload,
            Err(e) => {
                let error = FlushError::MalformedPayload(e.to_string());
                warn!(
                    "Task '{}' has an undecodable payload, parking it: {}",
                    task.identity, e
                );
                return self.task_store.mark_failed(&task.identity, &error.to_string());
            }
        };

        match self.handler.handle(&payload) {
            Ok(outcome) => {
                self.log_outcome(task, &outcome);
                self.task_store.ack(&task.identity)
            }
            Err(error) => {
                let attempts_made = task.attempts + 1;
                if self.retry_policy.should_retry(&error, attempts_made) {
                    let retry_at = self.retry_policy.next_retry_at(attempts_made);
                    debug!(
                        "Task '{}' failed (attempt {}), retrying: {}",
                        task.identity, attempts_made, error
                    );
                    self.task_store
                        .mark_retry(&task.identity, retry_at, &error.to_string())
                } else {
                    warn!(
                        "Task '{}' failed permanently after {} attempt(s): {}",
                        task.identity, attempts_made, error
                    );
                    self.task_store.mark_failed(&task.identity, &error.to_string())
                }
            }
        }
    }

    fn log_outcome(&self, task: &FlushTask, outcome: &FlushOutcome) {
        match outcome {
            FlushOutcome::Flushed { new_actors } => {
                debug!("Task '{}' flushed {} actor(s)", task.identity, new_actors)
            }
            FlushOutcome::EmptyBatch => {
                debug!("Task '{}' found nothing to flush", task.identity)
            }
            FlushOutcome::Reseeded { new_actors } => {
                info!(
                    "Task '{}' flushed {} actor(s) via fallback",
                    task.identity, new_actors
                )
            }
        }
    }
}
