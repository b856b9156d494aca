//! Notification aggregation data models

use serde::{Deserialize, Serialize};

/// Kind of social event that can raise a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Follow,
    Reaction,
    Comment,
    Mention,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Follow => "follow",
            EventKind::Reaction => "reaction",
            EventKind::Comment => "comment",
            EventKind::Mention => "mention",
        }
    }

    pub fn from_str(s: &str) -> Option<EventKind> {
        match s {
            "follow" => Some(EventKind::Follow),
            "reaction" => Some(EventKind::Reaction),
            "comment" => Some(EventKind::Comment),
            "mention" => Some(EventKind::Mention),
            _ => None,
        }
    }
}

/// Optional secondary discriminator narrowing an aggregation key beyond
/// recipient and kind: the post and/or comment the event happened on.
/// Follow events carry no target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub post_id: Option<String>,
    pub comment_id: Option<String>,
}

impl TargetRef {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn post(post_id: impl Into<String>) -> Self {
        Self {
            post_id: Some(post_id.into()),
            comment_id: None,
        }
    }

    pub fn comment(post_id: impl Into<String>, comment_id: impl Into<String>) -> Self {
        Self {
            post_id: Some(post_id.into()),
            comment_id: Some(comment_id.into()),
        }
    }
}

/// Names one aggregation window and derives every key the engine uses for
/// it. Absent target components encode as the literal string `null` so that
/// `(kind, recipient, target)` maps to exactly one key string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    pub kind: EventKind,
    pub recipient_id: String,
    pub target: TargetRef,
}

impl AggregationKey {
    pub fn new(kind: EventKind, recipient_id: impl Into<String>, target: TargetRef) -> Self {
        Self {
            kind,
            recipient_id: recipient_id.into(),
            target,
        }
    }

    fn base_key(&self) -> String {
        format!(
            "notif:{}:{}:{}:{}",
            self.kind.as_str(),
            self.recipient_id,
            self.target.post_id.as_deref().unwrap_or("null"),
            self.target.comment_id.as_deref().unwrap_or("null"),
        )
    }

    /// Key of the window marker; holds the owning group id while open.
    pub fn window_key(&self) -> String {
        format!("{}:window", self.base_key())
    }

    /// Key of the batch hash (`pending_count`, `last_actor_id` fields).
    pub fn batch_key(&self) -> String {
        format!("{}:batch", self.base_key())
    }

    /// Key of the distinct-actor set accumulated during the window.
    pub fn actors_key(&self) -> String {
        format!("{}:actors", self.base_key())
    }

    /// Dedup identity for this window's scheduled flush. Including the group
    /// id means a later window on the same key schedules its own flush.
    pub fn flush_identity(&self, group_id: &str) -> String {
        format!(
            "flush:{}:{}:{}:{}:{}",
            self.kind.as_str(),
            self.recipient_id,
            self.target.post_id.as_deref().unwrap_or("null"),
            self.target.comment_id.as_deref().unwrap_or("null"),
            group_id,
        )
    }
}

/// Field names of the batch hash.
pub mod batch_fields {
    /// Events accumulated since the window opened.
    pub const PENDING_COUNT: &str = "pending_count";
    /// Actor of the most recent accumulated event.
    pub const LAST_ACTOR_ID: &str = "last_actor_id";
}

/// A durable, user-visible notification: one row per aggregation window,
/// folding every actor the window saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationGroup {
    pub id: String,
    pub recipient_id: String,
    pub kind: EventKind,
    pub target: TargetRef,
    /// Number of distinct actors folded into this group.
    pub actors_count: i64,
    /// The most recent actor, for "X and N others" rendering.
    pub last_actor_id: String,
    pub is_read: bool,
    /// Epoch millis.
    pub created_at: i64,
    /// Epoch millis; bumped on every merge and on mark-read.
    pub updated_at: i64,
}

impl NotificationGroup {
    /// Build a fresh unread group seeded with the window's first actor.
    pub fn new(
        id: impl Into<String>,
        recipient_id: impl Into<String>,
        kind: EventKind,
        target: TargetRef,
        actor_id: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            recipient_id: recipient_id.into(),
            kind,
            target,
            actors_count: 1,
            last_actor_id: actor_id.into(),
            is_read: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Override the seeded actor count (used when a flush has to recreate a
    /// group that disappeared mid-window).
    pub fn with_actors_count(mut self, actors_count: i64) -> Self {
        self.actors_count = actors_count;
        self
    }
}

/// One row of a recipient's notification list: the group plus a preview of
/// its most recently added actors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group: NotificationGroup,
    /// Up to three actor ids, most recently added first.
    pub actor_preview: Vec<String>,
}

/// A page of a recipient's notification list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPage {
    pub groups: Vec<GroupSummary>,
    /// Total group count for the recipient, across all pages.
    pub total: i64,
    /// Unread group count for the recipient, across all pages.
    pub unread: i64,
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_serializes_snake_case() {
        let serialized = serde_json::to_string(&EventKind::Reaction).unwrap();
        assert_eq!(serialized, "\"reaction\"");

        let deserialized: EventKind = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, EventKind::Reaction);
    }

    #[test]
    fn test_event_kind_str_round_trip() {
        for kind in [
            EventKind::Follow,
            EventKind::Reaction,
            EventKind::Comment,
            EventKind::Mention,
        ] {
            assert_eq!(EventKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_str("poke"), None);
    }

    #[test]
    fn test_base_key_encodes_missing_target_as_null() {
        let key = AggregationKey::new(EventKind::Follow, "bob", TargetRef::none());
        assert_eq!(key.window_key(), "notif:follow:bob:null:null:window");
        assert_eq!(key.batch_key(), "notif:follow:bob:null:null:batch");
        assert_eq!(key.actors_key(), "notif:follow:bob:null:null:actors");
    }

    #[test]
    fn test_key_encodes_full_target() {
        let key = AggregationKey::new(
            EventKind::Comment,
            "bob",
            TargetRef::comment("post-1", "comment-9"),
        );
        assert_eq!(key.window_key(), "notif:comment:bob:post-1:comment-9:window");
    }

    #[test]
    fn test_post_only_target_leaves_comment_null() {
        let key = AggregationKey::new(EventKind::Reaction, "bob", TargetRef::post("post-1"));
        assert_eq!(key.batch_key(), "notif:reaction:bob:post-1:null:batch");
    }

    #[test]
    fn test_flush_identity_includes_group_id() {
        let key = AggregationKey::new(EventKind::Reaction, "bob", TargetRef::post("post-1"));
        assert_eq!(
            key.flush_identity("11111111-2222-3333-4444-555555555555"),
            "flush:reaction:bob:post-1:null:11111111-2222-3333-4444-555555555555"
        );
    }

    #[test]
    fn test_new_group_starts_unread_with_one_actor() {
        let group = NotificationGroup::new("g-1", "bob", EventKind::Follow, TargetRef::none(), "alice");

        assert_eq!(group.actors_count, 1);
        assert_eq!(group.last_actor_id, "alice");
        assert!(!group.is_read);
        assert_eq!(group.created_at, group.updated_at);
    }

    #[test]
    fn test_with_actors_count_overrides_seed() {
        let group = NotificationGroup::new("g-1", "bob", EventKind::Follow, TargetRef::none(), "alice")
            .with_actors_count(4);
        assert_eq!(group.actors_count, 4);
    }

    #[test]
    fn test_group_serialization_round_trip() {
        let group = NotificationGroup {
            id: "g-1".to_string(),
            recipient_id: "bob".to_string(),
            kind: EventKind::Comment,
            target: TargetRef::comment("post-1", "comment-9"),
            actors_count: 3,
            last_actor_id: "carol".to_string(),
            is_read: false,
            created_at: 1700000000000,
            updated_at: 1700000300000,
        };

        let serialized = serde_json::to_string(&group).unwrap();
        let deserialized: NotificationGroup = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized, group);
        assert_eq!(deserialized.target.post_id, Some("post-1".to_string()));
        assert_eq!(deserialized.kind, EventKind::Comment);
    }
}
