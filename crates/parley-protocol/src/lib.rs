//! # parley-protocol
//!
//! Data model and wire formats for the Parley message synchronization hub.
//!
//! This crate defines:
//!
//! - **Message** - The chat message model shared by every layer
//! - **Envelope** - Versioned wrapper that carries rich message fields through
//!   a storage schema that only has a flat `content` column
//! - **Frames** - Commands and events exchanged with session channels
//! - **Codec** - Length-prefixed MessagePack framing for session frames
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{envelope, Message, MessageType};
//!
//! let msg = Message::new("alice", "fn main() {}", MessageType::Code);
//! let raw = envelope::encode(&msg);
//! let decoded = envelope::decode(&raw);
//! assert_eq!(decoded.kind, MessageType::Code);
//! assert_eq!(decoded.content, "fn main() {}");
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;
pub mod message;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{DecodedPayload, PROTOCOL_MARKER};
pub use frames::{Frame, FrameType};
pub use message::{
    generate_message_id, Message, MessageType, PresenceEntry, Reaction, RECIPIENT_ALL,
};
pub use version::{Version, ENVELOPE_VERSION, PROTOCOL_VERSION};
