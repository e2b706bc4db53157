//! Frame types for the Parley session protocol.
//!
//! Frames are exchanged between session channels (browser or desktop
//! clients) and the hub. Commands flow inbound, events flow outbound; both
//! share one tagged enum so a single codec serves either direction.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageType, PresenceEntry};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Join = 0x01,
    Message = 0x02,
    ShareItem = 0x03,
    MarkRead = 0x04,
    Reaction = 0x05,
    Typing = 0x06,
    Disconnect = 0x07,
    UsersUpdate = 0x08,
    SharedItemReceived = 0x09,
    MessageUpdate = 0x0A,
    BackendStatus = 0x0B,
    Ack = 0x0C,
    Error = 0x0D,
    Ping = 0x0E,
    Pong = 0x0F,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Join),
            0x02 => Ok(FrameType::Message),
            0x03 => Ok(FrameType::ShareItem),
            0x04 => Ok(FrameType::MarkRead),
            0x05 => Ok(FrameType::Reaction),
            0x06 => Ok(FrameType::Typing),
            0x07 => Ok(FrameType::Disconnect),
            0x08 => Ok(FrameType::UsersUpdate),
            0x09 => Ok(FrameType::SharedItemReceived),
            0x0A => Ok(FrameType::MessageUpdate),
            0x0B => Ok(FrameType::BackendStatus),
            0x0C => Ok(FrameType::Ack),
            0x0D => Ok(FrameType::Error),
            0x0E => Ok(FrameType::Ping),
            0x0F => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Session announces its user.
    #[serde(rename = "join")]
    Join {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        team: Option<String>,
    },

    /// Inbound: send a message. Outbound: a delivered message.
    #[serde(rename = "message")]
    Message(MessageFrame),

    /// Share an application object with a user or everyone.
    #[serde(rename = "share_item")]
    ShareItem {
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
        item_type: String,
        item_data: serde_json::Value,
    },

    /// Mark messages as read.
    #[serde(rename = "mark_read")]
    MarkRead { ids: Vec<String> },

    /// A reaction, inbound as a request and outbound as a notification.
    #[serde(rename = "reaction")]
    Reaction {
        message_id: String,
        emoji: String,
        username: String,
    },

    /// Typing indicator relayed to other sessions.
    #[serde(rename = "typing")]
    Typing { username: String, active: bool },

    /// Session is leaving.
    #[serde(rename = "disconnect")]
    Disconnect {},

    /// Current online users.
    #[serde(rename = "users_update")]
    UsersUpdate { users: Vec<PresenceEntry> },

    /// A shared item addressed to this session's user.
    #[serde(rename = "shared_item_received")]
    SharedItemReceived {
        message_id: String,
        sender: String,
        recipient: String,
        item_type: String,
        item_data: serde_json::Value,
    },

    /// A message changed (read receipt or reactions).
    #[serde(rename = "message_update")]
    MessageUpdate { message: Message },

    /// Active backend or adapter state changed.
    #[serde(rename = "backend_status")]
    BackendStatus { backend: String, state: String },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack { id: u64 },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        code: u16,
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// Body of a `message` frame.
///
/// Inbound frames carry the loose send fields; outbound frames carry the
/// fully-formed [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageFrame {
    Delivered { message: Message },
    Send(SendRequest),
}

/// Fields a session supplies when sending a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Optional request ID for acknowledgment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Join { .. } => FrameType::Join,
            Frame::Message(_) => FrameType::Message,
            Frame::ShareItem { .. } => FrameType::ShareItem,
            Frame::MarkRead { .. } => FrameType::MarkRead,
            Frame::Reaction { .. } => FrameType::Reaction,
            Frame::Typing { .. } => FrameType::Typing,
            Frame::Disconnect {} => FrameType::Disconnect,
            Frame::UsersUpdate { .. } => FrameType::UsersUpdate,
            Frame::SharedItemReceived { .. } => FrameType::SharedItemReceived,
            Frame::MessageUpdate { .. } => FrameType::MessageUpdate,
            Frame::BackendStatus { .. } => FrameType::BackendStatus,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(username: impl Into<String>, team: Option<String>) -> Self {
        Frame::Join {
            username: username.into(),
            team,
        }
    }

    /// Create an inbound send frame.
    #[must_use]
    pub fn send(request: SendRequest) -> Self {
        Frame::Message(MessageFrame::Send(request))
    }

    /// Create an outbound delivered-message frame.
    #[must_use]
    pub fn delivered(message: Message) -> Self {
        Frame::Message(MessageFrame::Delivered { message })
    }

    /// Create a new UsersUpdate frame.
    #[must_use]
    pub fn users_update(users: Vec<PresenceEntry>) -> Self {
        Frame::UsersUpdate { users }
    }

    /// Create a new MessageUpdate frame.
    #[must_use]
    pub fn message_update(message: Message) -> Self {
        Frame::MessageUpdate { message }
    }

    /// Create a new BackendStatus frame.
    #[must_use]
    pub fn backend_status(backend: impl Into<String>, state: impl Into<String>) -> Self {
        Frame::BackendStatus {
            backend: backend.into(),
            state: state.into(),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type() {
        assert_eq!(Frame::join("alice", None).frame_type(), FrameType::Join);
        assert_eq!(Frame::ack(3).frame_type(), FrameType::Ack);
        assert_eq!(Frame::users_update(vec![]).frame_type(), FrameType::UsersUpdate);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x01), Ok(FrameType::Join));
        assert_eq!(FrameType::try_from(0x0F), Ok(FrameType::Pong));
        assert!(FrameType::try_from(0x10).is_err());
        assert_eq!(u8::from(FrameType::MessageUpdate), 0x0A);
    }

    #[test]
    fn test_inbound_json_send_frame() {
        let raw = r#"{"type":"message","sender":"alice","content":"hi","recipient":"bob"}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        match frame {
            Frame::Message(MessageFrame::Send(req)) => {
                assert_eq!(req.sender, "alice");
                assert_eq!(req.kind, MessageType::Text);
                assert_eq!(req.recipient.as_deref(), Some("bob"));
                assert!(req.id.is_none());
            }
            other => panic!("Expected send frame, got {:?}", other),
        }
    }

    #[test]
    fn test_outbound_delivered_frame_json() {
        let msg = Message::new("alice", "hi", MessageType::Text);
        let value = serde_json::to_value(Frame::delivered(msg.clone())).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["message"]["id"], json!(msg.id));

        let back: Frame = serde_json::from_value(value).unwrap();
        assert_eq!(back, Frame::delivered(msg));
    }

    #[test]
    fn test_share_item_frame_json() {
        let raw = json!({
            "type": "share_item",
            "sender": "alice",
            "item_type": "dashboard",
            "item_data": {"id": 12}
        });
        let frame: Frame = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            frame,
            Frame::ShareItem { ref recipient, ref item_type, .. }
                if recipient.is_none() && item_type == "dashboard"
        ));
    }
}
