//! Storage envelope for narrow message schemas.
//!
//! Some backends only persist `(id, sender, content, created_at)`. Rich
//! fields (`type`, `metadata`, `recipient`) travel inside the `content`
//! column as a versioned JSON envelope:
//!
//! ```text
//! {"_protocol":"PARLEY","v":1,"type":"CODE","content":"...","metadata":{...},"recipient":"ALL"}
//! ```
//!
//! Plain broadcast text is stored as-is so raw storage stays human-readable.
//! Decoding never fails: anything that is not a compatible envelope is
//! plain text.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageType, RECIPIENT_ALL};
use crate::version::ENVELOPE_VERSION;

/// Marker identifying an envelope.
pub const PROTOCOL_MARKER: &str = "PARLEY";

/// Rich message fields recovered from a stored `content` value.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub kind: MessageType,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub recipient: String,
}

impl DecodedPayload {
    /// Payload for a raw string that is not an envelope.
    #[must_use]
    pub fn plain(raw: &str) -> Self {
        Self {
            kind: MessageType::Text,
            content: raw.to_string(),
            metadata: None,
            recipient: RECIPIENT_ALL.to_string(),
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    #[serde(rename = "_protocol")]
    protocol: &'static str,
    v: u8,
    #[serde(rename = "type")]
    kind: MessageType,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
    recipient: &'a str,
}

#[derive(Deserialize)]
struct EnvelopeOwned {
    #[serde(rename = "_protocol")]
    protocol: String,
    v: u8,
    #[serde(rename = "type")]
    kind: MessageType,
    content: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    recipient: Option<String>,
}

/// Encode the rich fields of a message into a single `content` string.
#[must_use]
pub fn encode(msg: &Message) -> String {
    encode_parts(msg.kind, &msg.content, msg.metadata.as_ref(), &msg.recipient)
}

/// Encode loose message fields into a single `content` string.
#[must_use]
pub fn encode_parts(
    kind: MessageType,
    content: &str,
    metadata: Option<&serde_json::Value>,
    recipient: &str,
) -> String {
    let plain = kind == MessageType::Text
        && metadata.is_none()
        && recipient == RECIPIENT_ALL
        // Text that would itself decode as an envelope must be wrapped.
        && parse_envelope(content).is_none();
    if plain {
        return content.to_string();
    }

    let envelope = EnvelopeRef {
        protocol: PROTOCOL_MARKER,
        v: ENVELOPE_VERSION.major,
        kind,
        content,
        metadata,
        recipient,
    };
    // Serializing a struct of strings and a JSON value cannot fail.
    serde_json::to_string(&envelope).unwrap_or_else(|_| content.to_string())
}

/// Decode a stored `content` value.
///
/// Malformed or foreign content is demoted to plain text.
#[must_use]
pub fn decode(raw: &str) -> DecodedPayload {
    parse_envelope(raw).unwrap_or_else(|| DecodedPayload::plain(raw))
}

fn parse_envelope(raw: &str) -> Option<DecodedPayload> {
    if !raw.trim_start().starts_with('{') {
        return None;
    }
    let envelope: EnvelopeOwned = serde_json::from_str(raw).ok()?;
    if envelope.protocol != PROTOCOL_MARKER || !ENVELOPE_VERSION.accepts(envelope.v) {
        return None;
    }
    Some(DecodedPayload {
        kind: envelope.kind,
        content: envelope.content,
        metadata: envelope.metadata.filter(|m| !m.is_null()),
        recipient: envelope
            .recipient
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| RECIPIENT_ALL.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(msg: &Message) -> DecodedPayload {
        decode(&encode(msg))
    }

    fn assert_preserved(msg: &Message) {
        let decoded = roundtrip(msg);
        assert_eq!(decoded.kind, msg.kind);
        assert_eq!(decoded.content, msg.content);
        assert_eq!(decoded.metadata, msg.metadata);
        assert_eq!(decoded.recipient, msg.recipient);
    }

    #[test]
    fn test_plain_text_is_stored_raw() {
        let msg = Message::new("alice", "hello there", MessageType::Text);
        assert_eq!(encode(&msg), "hello there");
        assert_preserved(&msg);
    }

    #[test]
    fn test_rich_messages_roundtrip() {
        let messages = vec![
            Message::new("alice", "SELECT 1 FROM dual", MessageType::Code)
                .with_metadata(Some(json!({"language": "sql"}))),
            Message::new("alice", "data:image/png;base64,AAAA", MessageType::Image),
            Message::new("alice", "Shared a dashboard", MessageType::SharedItem)
                .with_metadata(Some(json!({"itemType": "dashboard", "itemData": {"id": 7}})))
                .with_recipient("bob"),
            Message::new("alice", "private text", MessageType::Text).with_recipient("bob"),
            Message::new("alice", "", MessageType::Text).with_metadata(Some(json!([1, 2, 3]))),
        ];
        for msg in &messages {
            assert!(encode(msg).contains(PROTOCOL_MARKER));
            assert_preserved(msg);
        }
    }

    #[test]
    fn test_text_that_looks_like_an_envelope_roundtrips() {
        let sneaky = r#"{"_protocol":"PARLEY","v":1,"type":"CODE","content":"x"}"#;
        let msg = Message::new("alice", sneaky, MessageType::Text);
        assert_ne!(encode(&msg), sneaky);
        assert_preserved(&msg);
    }

    #[test]
    fn test_non_conforming_strings_demote_to_text() {
        let inputs = [
            "",
            "{",
            "{not json at all",
            "{}",
            r#"{"type":"CODE","content":"no marker"}"#,
            r#"{"_protocol":"OTHER","v":1,"type":"CODE","content":"x"}"#,
            r#"{"_protocol":"PARLEY","v":9,"type":"CODE","content":"future"}"#,
            r#"{"_protocol":"PARLEY","v":1,"type":"VIDEO","content":"unknown kind"}"#,
            "[1, 2, 3]",
            "  plain with leading spaces",
            "\u{0}\u{1}binary-ish",
        ];
        for raw in inputs {
            let decoded = decode(raw);
            assert_eq!(decoded, DecodedPayload::plain(raw), "input: {raw:?}");
        }
    }

    #[test]
    fn test_missing_recipient_defaults_to_all() {
        let raw = r#"{"_protocol":"PARLEY","v":1,"type":"IMAGE","content":"img"}"#;
        let decoded = decode(raw);
        assert_eq!(decoded.kind, MessageType::Image);
        assert_eq!(decoded.recipient, RECIPIENT_ALL);
        assert!(decoded.metadata.is_none());
    }
}
