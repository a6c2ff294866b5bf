// src/types/mod.rs - Core data model shared by the bot systems

use serde::{Deserialize, Serialize};

/// A room participant as observed in a snapshot. Users are transient; only
/// counters derived from them are ever persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Composite key used for all moderation bookkeeping. Keyed on name AND
    /// id, so a rename starts a fresh record.
    pub fn moderation_key(&self) -> String {
        format!("{}_{}", self.name, self.id)
    }
}

/// Kind of a room event. The wire format carries more kinds than the bot
/// reacts to; anything unrecognized lands in `Other` instead of failing
/// deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Message,
    Join,
    Leave,
    Music,
    Me,
    #[serde(other)]
    Other,
}

/// A single entry of the room's shared conversation feed ("talk").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    pub kind: EventKind,
    pub sender: User,
    pub body: String,
    /// Epoch seconds as reported by the service.
    pub timestamp: i64,
}

impl RoomEvent {
    /// Dedup fingerprint. Two semantically different events with the same
    /// body, sender and second-resolution timestamp collide; accepted
    /// imprecision.
    pub fn key(&self) -> EventKey {
        EventKey {
            body: self.body.clone(),
            sender_id: self.sender.id.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Fingerprint of a [`RoomEvent`] for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub body: String,
    pub sender_id: String,
    pub timestamp: i64,
}

/// Full state of the room as returned by one poll: who is present and the
/// recent event feed. The service never pushes deltas; every poll re-reads
/// this and the bot diffs it against what it already processed.
#[derive(Debug, Clone, Default)]
pub struct RoomSnapshot {
    pub users: Vec<User>,
    pub events: Vec<RoomEvent>,
}

/// Outcome of running one incoming message through the moderation pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    RateLimited { count: u32 },
    Repeating { count: u32 },
    Flagged { reason: String, count: u32 },
}

impl Decision {
    /// Violation count carried by a non-Allow decision.
    pub fn violation_count(&self) -> Option<u32> {
        match self {
            Decision::Allow => None,
            Decision::RateLimited { count }
            | Decision::Repeating { count }
            | Decision::Flagged { count, .. } => Some(*count),
        }
    }
}

/// Room-level action requested by the escalation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomAction {
    None,
    Ban,
    Kick,
}

/// One queued track of the bot-owned playlist. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub title: String,
    pub url: String,
}

/// A reply waiting in the outbox. `url` attaches a link to the post, `to`
/// tags a whisper target; both map straight onto the service's message form.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub text: String,
    pub url: Option<String>,
    pub to: Option<String>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: None,
            to: None,
        }
    }
}

/// Liveness record overwritten on a fixed interval. External supervision
/// restarts the bot when `timestamp` goes stale, so the field names are part
/// of the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub timestamp: f64,
    pub room_id: String,
    pub is_connected: bool,
}
