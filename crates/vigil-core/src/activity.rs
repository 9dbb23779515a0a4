use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a forum user as it appears in upstream payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActorRef {
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_template: Option<String>,
}

impl ActorRef {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            name: None,
            avatar_template: None,
        }
    }
}

/// What kind of activity an item records.
///
/// `Reaction` carries the upstream reaction value (an emoji name); the three
/// numeric upstream action types map to the unit variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    NewTopic,
    Reply,
    Like,
    Reaction(String),
}

impl ActionKind {
    /// Numeric action codes used by the upstream feed.
    pub fn from_action_type(code: u64) -> Option<Self> {
        match code {
            1 => Some(ActionKind::Like),
            4 => Some(ActionKind::NewTopic),
            5 => Some(ActionKind::Reply),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::NewTopic => f.write_str("new_topic"),
            ActionKind::Reply => f.write_str("reply"),
            ActionKind::Like => f.write_str("like"),
            ActionKind::Reaction(value) => write!(f, "reaction:{value}"),
        }
    }
}

/// One observed activity event. Immutable once constructed; diffing and
/// dedup never mutate items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityItem {
    #[serde(default)]
    pub id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub kind: ActionKind,
    pub actor: ActorRef,
    #[serde(default)]
    pub acting: Option<ActorRef>,
    #[serde(default)]
    pub topic_id: Option<u64>,
    #[serde(default)]
    pub post_number: Option<u64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub category_id: Option<u64>,
}

impl ActivityItem {
    /// Stable identifier used for cursors and dedup: the upstream id when
    /// present, else `topic_post` composite, else a timestamp-derived
    /// fallback (deterministic for a given item, unlike a wall-clock stamp).
    pub fn unique_id(&self) -> String {
        if let Some(id) = self.id {
            return id.to_string();
        }
        if let (Some(topic_id), Some(post_number)) = (self.topic_id, self.post_number) {
            return format!("{topic_id}_{post_number}");
        }
        format!("ts_{}", self.created_at.timestamp_millis())
    }
}
