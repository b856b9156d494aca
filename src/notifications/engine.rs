//! Event ingestion: window detection, instant delivery and batching.
//!
//! The first event of a burst opens an aggregation window and delivers a
//! durable group immediately. Every further event on the same key lands in
//! ephemeral batch state and (re-)requests a delayed flush, deduplicated by
//! the queue, that later folds the batch into the group.

use crate::config::NotificationSettings;
use crate::ephemeral::{EphemeralStore, SetIfAbsent};
use crate::flush_queue::{FlushTaskStore, TaskPayload};
use crate::notifications::group_store::NotificationGroupStore;
use crate::notifications::models::{
    batch_fields, AggregationKey, EventKind, NotificationGroup, TargetRef,
};
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct AggregationEngine {
    ephemeral: Arc<dyn EphemeralStore>,
    groups: Arc<dyn NotificationGroupStore>,
    tasks: Arc<dyn FlushTaskStore>,
    settings: NotificationSettings,
}

impl AggregationEngine {
    pub fn new(
        ephemeral: Arc<dyn EphemeralStore>,
        groups: Arc<dyn NotificationGroupStore>,
        tasks: Arc<dyn FlushTaskStore>,
        settings: NotificationSettings,
    ) -> Self {
        Self {
            ephemeral,
            groups,
            tasks,
            settings,
        }
    }

    /// Record one "actor did `kind` to recipient" event.
    ///
    /// Fire and forget: a storage failure is logged and swallowed, so a
    /// broken notification pipeline never takes the calling operation down
    /// with it.
    pub fn add_event(&self, kind: EventKind, recipient_id: &str, actor_id: &str, target: TargetRef) {
        if let Err(e) = self.try_add_event(kind, recipient_id, actor_id, target) {
            warn!(
                "Failed to record {} event for recipient '{}': {:#}",
                kind.as_str(),
                recipient_id,
                e
            );
        }
    }

    fn try_add_event(
        &self,
        kind: EventKind,
        recipient_id: &str,
        actor_id: &str,
        target: TargetRef,
    ) -> Result<()> {
        let key = AggregationKey::new(kind, recipient_id, target);

        // Claim the window marker atomically. The group id is generated
        // before the claim so the marker can carry it from the start; a
        // losing writer learns the winner's id from the marker instead.
        let group_id = Uuid::new_v4().to_string();
        match self
            .ephemeral
            .set_if_absent(&key.window_key(), &group_id, self.settings.window)?
        {
            SetIfAbsent::Set => self.open_window(&key, group_id, actor_id),
            SetIfAbsent::Exists(open_group_id) => self.accumulate(&key, &open_group_id, actor_id),
        }
    }

    /// First event of a window: deliver a durable group right away.
    fn open_window(&self, key: &AggregationKey, group_id: String, actor_id: &str) -> Result<()> {
        let group = NotificationGroup::new(
            group_id,
            &key.recipient_id,
            key.kind,
            key.target.clone(),
            actor_id,
        );
        let created = match self.groups.create_group(group) {
            Ok(created) => created,
            Err(e) => {
                // A marker pointing at a group that was never written would
                // park every follow-up event in limbo; roll it back so the
                // next event can claim the window again.
                if let Err(cleanup) = self.ephemeral.delete(&[&key.window_key()]) {
                    warn!("Failed to roll back window marker: {:#}", cleanup);
                }
                return Err(e);
            }
        };
        self.groups
            .add_actor_memberships(&created.id, &[actor_id.to_string()])?;

        debug!(
            "Window opened for '{}', group {} delivered instantly",
            key.window_key(),
            created.id
        );
        Ok(())
    }

    /// Later event of a window: batch it and make sure a flush is scheduled.
    fn accumulate(&self, key: &AggregationKey, group_id: &str, actor_id: &str) -> Result<()> {
        let ttl = self.settings.batch_ttl();
        let pending = self
            .ephemeral
            .hash_increment(&key.batch_key(), batch_fields::PENDING_COUNT, 1, ttl)?;
        self.ephemeral
            .hash_set(&key.batch_key(), batch_fields::LAST_ACTOR_ID, actor_id, ttl)?;
        self.ephemeral.set_add(&key.actors_key(), actor_id, ttl)?;

        let payload = TaskPayload::FlushNotification {
            kind: key.kind,
            recipient_id: key.recipient_id.clone(),
            target: key.target.clone(),
            group_id: group_id.to_string(),
        };
        let scheduled = self.tasks.schedule(
            &key.flush_identity(group_id),
            &payload,
            self.settings.flush_delay,
        )?;
        if scheduled {
            debug!(
                "Flush scheduled for group {} in {:?}",
                group_id, self.settings.flush_delay
            );
        }

        debug!(
            "Event by '{}' batched for group {} ({} pending)",
            actor_id, group_id, pending
        );
        Ok(())
    }
}
