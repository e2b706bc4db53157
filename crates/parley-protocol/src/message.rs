//! Chat message model.
//!
//! A [`Message`] is the unit that sessions exchange and backends store. The
//! read receipt and reaction helpers enforce the model's invariants so every
//! storage layer gets them for free.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Recipient value addressing every participant.
pub const RECIPIENT_ALL: &str = "ALL";

/// Generate a unique, time-ordered message ID.
#[must_use]
pub fn generate_message_id() -> String {
    Uuid::now_v7().to_string()
}

/// Message payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    Code,
    Image,
    SharedItem,
}

impl MessageType {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Code => "CODE",
            Self::Image => "IMAGE",
            Self::SharedItem => "SHARED_ITEM",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single emoji reaction left by a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user: String,
}

impl Reaction {
    #[must_use]
    pub fn new(emoji: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            emoji: emoji.into(),
            user: user.into(),
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique identifier (UUIDv7).
    pub id: String,
    /// Username of the author.
    pub sender: String,
    /// `ALL` or a specific username.
    pub recipient: String,
    /// Payload kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Text, code, image reference or share caption.
    pub content: String,
    /// Kind-specific structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the message was first read, if ever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// Reactions, unique by `(user, emoji)`.
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// Create a broadcast message with a fresh id and `created_at = now`.
    #[must_use]
    pub fn new(sender: impl Into<String>, content: impl Into<String>, kind: MessageType) -> Self {
        Self {
            id: generate_message_id(),
            sender: sender.into(),
            recipient: RECIPIENT_ALL.to_string(),
            kind,
            content: content.into(),
            metadata: None,
            created_at: Utc::now(),
            read_at: None,
            reactions: Vec::new(),
        }
    }

    /// Address the message to a recipient. Empty strings mean `ALL`.
    #[must_use]
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        let recipient = recipient.into();
        self.recipient = if recipient.is_empty() {
            RECIPIENT_ALL.to_string()
        } else {
            recipient
        };
        self
    }

    /// Attach a metadata payload.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether the message is addressed to everyone.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.recipient == RECIPIENT_ALL
    }

    /// Whether `user` may see this message.
    #[must_use]
    pub fn is_visible_to(&self, user: &str) -> bool {
        self.is_broadcast() || self.recipient == user || self.sender == user
    }

    /// Set `read_at` if it is unset.
    ///
    /// Returns `true` if the receipt was recorded by this call.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(at);
        true
    }

    /// Add a reaction unless the same user already left the same emoji.
    ///
    /// Returns `true` if the reaction was added.
    pub fn add_reaction(&mut self, reaction: Reaction) -> bool {
        if self.reactions.contains(&reaction) {
            return false;
        }
        self.reactions.push(reaction);
        true
    }
}

/// One online participant as seen by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub username: String,
    pub team: String,
    pub session_id: String,
    pub last_seen: DateTime<Utc>,
}

impl PresenceEntry {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        team: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            team: team.into(),
            session_id: session_id.into(),
            last_seen: Utc::now(),
        }
    }

    /// Override the activity timestamp.
    #[must_use]
    pub fn seen_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_seen = at;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("alice", "hi", MessageType::Text);
        assert_eq!(msg.sender, "alice");
        assert!(msg.is_broadcast());
        assert!(msg.read_at.is_none());
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        assert_ne!(id1, id2);
        // v7 ids sort by creation time
        assert!(id1 < id2);
    }

    #[test]
    fn test_visibility() {
        let broadcast = Message::new("alice", "hi", MessageType::Text);
        assert!(broadcast.is_visible_to("bob"));

        let private = Message::new("alice", "psst", MessageType::Text).with_recipient("carol");
        assert!(private.is_visible_to("alice"));
        assert!(private.is_visible_to("carol"));
        assert!(!private.is_visible_to("bob"));
    }

    #[test]
    fn test_empty_recipient_is_broadcast() {
        let msg = Message::new("alice", "hi", MessageType::Text).with_recipient("");
        assert_eq!(msg.recipient, RECIPIENT_ALL);
    }

    #[test]
    fn test_mark_read_once() {
        let mut msg = Message::new("alice", "hi", MessageType::Text);
        let first = Utc::now();
        assert!(msg.mark_read(first));
        assert!(!msg.mark_read(first + chrono::Duration::seconds(5)));
        assert_eq!(msg.read_at, Some(first));
    }

    #[test]
    fn test_reaction_dedup() {
        let mut msg = Message::new("alice", "hi", MessageType::Text);
        assert!(msg.add_reaction(Reaction::new("👍", "bob")));
        assert!(!msg.add_reaction(Reaction::new("👍", "bob")));
        assert!(msg.add_reaction(Reaction::new("🎉", "bob")));
        assert!(msg.add_reaction(Reaction::new("👍", "carol")));
        assert_eq!(msg.reactions.len(), 3);
    }

    #[test]
    fn test_message_type_wire_names() {
        let json = serde_json::to_string(&MessageType::SharedItem).unwrap();
        assert_eq!(json, "\"SHARED_ITEM\"");
        let kind: MessageType = serde_json::from_str("\"CODE\"").unwrap();
        assert_eq!(kind, MessageType::Code);
    }
}
