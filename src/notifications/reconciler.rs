//! Flush reconciliation: folds ephemeral batch state into durable groups.
//!
//! Runs as the queue's [`FlushHandler`]. Executions are idempotent: the
//! batch keys are the unit of work, and once consumed a re-run finds
//! nothing and reports an empty batch instead of double counting.

use crate::ephemeral::EphemeralStore;
use crate::flush_queue::{FlushError, FlushHandler, FlushOutcome, TaskPayload};
use crate::notifications::group_store::NotificationGroupStore;
use crate::notifications::models::{
    batch_fields, now_millis, AggregationKey, EventKind, NotificationGroup, TargetRef,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct FlushReconciler {
    ephemeral: Arc<dyn EphemeralStore>,
    groups: Arc<dyn NotificationGroupStore>,
    /// Window length, bounding how far back the fallback lookup reaches.
    window: Duration,
}

impl FlushReconciler {
    pub fn new(
        ephemeral: Arc<dyn EphemeralStore>,
        groups: Arc<dyn NotificationGroupStore>,
        window: Duration,
    ) -> Self {
        Self {
            ephemeral,
            groups,
            window,
        }
    }

    fn flush(
        &self,
        kind: EventKind,
        recipient_id: &str,
        target: &TargetRef,
        group_id: &str,
    ) -> Result<FlushOutcome, FlushError> {
        let key = AggregationKey::new(kind, recipient_id, target.clone());

        let batch = self.ephemeral.read_hash(&key.batch_key())?;
        if batch.is_empty() {
            debug!(
                "No batch behind '{}', nothing to flush",
                key.batch_key()
            );
            return Ok(FlushOutcome::EmptyBatch);
        }

        let actors = self.ephemeral.read_set(&key.actors_key())?;
        let pending_count = batch
            .get(batch_fields::PENDING_COUNT)
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        let Some(last_actor_id) = batch
            .get(batch_fields::LAST_ACTOR_ID)
            .cloned()
            .or_else(|| actors.last().cloned())
        else {
            // A batch that never recorded an actor carries nothing worth
            // merging; drop it.
            self.delete_batch(&key)?;
            return Ok(FlushOutcome::EmptyBatch);
        };

        // Distinct actors drive the count; pending_count only says how many
        // raw events the window absorbed.
        let delta = actors.len() as i64;

        match self.groups.increment_group(group_id, delta, &last_actor_id)? {
            Some(group) => {
                self.groups.add_actor_memberships(&group.id, &actors)?;
                self.delete_batch(&key)?;
                debug!(
                    "Flushed {} actor(s) ({} pending events) into group {}",
                    delta, pending_count, group.id
                );
                Ok(FlushOutcome::Flushed { new_actors: delta })
            }
            None => self.reseed(&key, delta, &last_actor_id, &actors),
        }
    }

    /// The scheduled group is gone (read and discarded mid-window). Merge
    /// into the newest unread group on the same key if one exists, otherwise
    /// recreate one seeded with the whole batch.
    fn reseed(
        &self,
        key: &AggregationKey,
        delta: i64,
        last_actor_id: &str,
        actors: &[String],
    ) -> Result<FlushOutcome, FlushError> {
        warn!(
            "Group behind '{}' vanished before its flush, falling back",
            key.batch_key()
        );

        let since = now_millis() - self.window.as_millis() as i64;
        let merged = match self.groups.find_recent_unread_group(
            &key.recipient_id,
            key.kind,
            &key.target,
            since,
        )? {
            Some(candidate) => self
                .groups
                .increment_group(&candidate.id, delta, last_actor_id)?,
            None => None,
        };

        let group_id = match merged {
            Some(group) => group.id,
            None => {
                let seeded = NotificationGroup::new(
                    Uuid::new_v4().to_string(),
                    &key.recipient_id,
                    key.kind,
                    key.target.clone(),
                    last_actor_id,
                )
                .with_actors_count(delta);
                let created = self.groups.create_group(seeded)?;
                warn!(
                    "Recreated group {} seeded with {} actor(s)",
                    created.id, delta
                );
                created.id
            }
        };

        self.groups.add_actor_memberships(&group_id, actors)?;
        self.delete_batch(key)?;
        Ok(FlushOutcome::Reseeded { new_actors: delta })
    }

    /// Consume the batch keys. The window marker stays: the burst keeps
    /// aggregating into the same group until the marker expires.
    fn delete_batch(&self, key: &AggregationKey) -> Result<(), FlushError> {
        self.ephemeral
            .delete(&[&key.batch_key(), &key.actors_key()])?;
        Ok(())
    }
}

impl FlushHandler for FlushReconciler {
    fn handle(&self, payload: &TaskPayload) -> Result<FlushOutcome, FlushError> {
        let TaskPayload::FlushNotification {
            kind,
            recipient_id,
            target,
            group_id,
        } = payload;
        self.flush(*kind, recipient_id, target, group_id)
    }
}
