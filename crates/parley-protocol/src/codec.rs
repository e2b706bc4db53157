//! Codec for encoding and decoding session frames.
//!
//! Binary WebSocket messages carry length-prefixed MessagePack; text
//! messages carry a single JSON frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB). Inline images travel as data URLs.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON text frame error.
    #[error("JSON frame error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a frame as a binary message: a big-endian `u32` payload length
/// followed by the MessagePack payload.
///
/// # Errors
///
/// Fails if serialization fails or the payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut out = BytesMut::new();
    encode_into(frame, &mut out)?;
    Ok(out.freeze())
}

/// Append one encoded frame to `out`.
///
/// # Errors
///
/// Same as [`encode`]. `out` is untouched on failure.
pub fn encode_into(frame: &Frame, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = rmp_serde::to_vec_named(frame)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_SIZE)
        .ok_or(ProtocolError::FrameTooLarge(body.len()))?;

    out.reserve(LENGTH_PREFIX_SIZE + body.len());
    out.put_u32(len);
    out.put_slice(&body);
    Ok(())
}

/// Reads the length prefix. `Ok(Err(missing))` means the header itself is
/// short by `missing` bytes.
fn body_len(data: &[u8]) -> Result<Result<usize, usize>, ProtocolError> {
    let Some(header) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(Err(LENGTH_PREFIX_SIZE - data.len()));
    };
    let mut header = header;
    let len = header.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(Ok(len))
}

/// Decode exactly one frame from the front of `data`.
///
/// # Errors
///
/// [`ProtocolError::Incomplete`] carries how many more bytes are needed.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let len = body_len(data)?.map_err(ProtocolError::Incomplete)?;
    let end = LENGTH_PREFIX_SIZE + len;
    let body = data
        .get(LENGTH_PREFIX_SIZE..end)
        .ok_or(ProtocolError::Incomplete(end.saturating_sub(data.len())))?;
    Ok(rmp_serde::from_slice(body)?)
}

/// Pull the next complete frame off a streaming buffer.
///
/// Returns `Ok(None)` and leaves `buf` alone while the frame is still
/// partial.
///
/// # Errors
///
/// Fails on an oversized length prefix or an undecodable payload.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let len = match body_len(buf)? {
        Ok(len) if buf.len() >= LENGTH_PREFIX_SIZE + len => len,
        _ => return Ok(None),
    };
    let mut chunk = buf.split_to(LENGTH_PREFIX_SIZE + len);
    chunk.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(rmp_serde::from_slice(&chunk)?))
}

/// Encode a frame as a JSON text message.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json(frame: &Frame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a frame from a JSON text message.
///
/// # Errors
///
/// Returns an error if the text is not a valid frame.
pub fn decode_json(text: &str) -> Result<Frame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::SendRequest;
    use crate::message::{Message, MessageType, PresenceEntry};
    use serde_json::json;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::join("alice", Some("Data".to_string())),
            Frame::send(SendRequest {
                id: Some(4),
                sender: "alice".to_string(),
                content: "SELECT 1".to_string(),
                kind: MessageType::Code,
                metadata: Some(json!({"language": "sql"})),
                recipient: Some("bob".to_string()),
            }),
            Frame::delivered(Message::new("alice", "hi", MessageType::Text)),
            Frame::users_update(vec![PresenceEntry::new("alice", "Data", "s-1")]),
            Frame::MarkRead {
                ids: vec!["a".to_string(), "b".to_string()],
            },
            Frame::Disconnect {},
            Frame::ack(42),
            Frame::error(1, 1001, "Invalid frame"),
            Frame::ping(),
            Frame::pong(Some(99)),
        ]
    }

    #[test]
    fn test_binary_frames_survive_the_wire() {
        for frame in sample_frames() {
            let bytes = encode(&frame).unwrap();
            assert_eq!(decode(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn test_json_roundtrip() {
        for frame in sample_frames() {
            let text = encode_json(&frame).unwrap();
            assert_eq!(decode_json(&text).unwrap(), frame);
        }
    }

    #[test]
    fn test_truncated_frame_reports_missing_bytes() {
        let bytes = encode(&Frame::join("alice", None)).unwrap();

        assert!(matches!(
            decode(&bytes[..2]),
            Err(ProtocolError::Incomplete(2))
        ));
        let missing = bytes.len() - 5;
        assert!(matches!(
            decode(&bytes[..5]),
            Err(ProtocolError::Incomplete(n)) if n == missing
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_stream_yields_frames_in_order() {
        let join = Frame::join("alice", None);
        let read = Frame::MarkRead {
            ids: vec!["x".to_string()],
        };

        let mut stream = BytesMut::new();
        encode_into(&join, &mut stream).unwrap();
        encode_into(&read, &mut stream).unwrap();
        let full = stream.len();
        stream.truncate(full - 1);

        assert_eq!(decode_from(&mut stream).unwrap(), Some(join));
        assert_eq!(decode_from(&mut stream).unwrap(), None);
        assert!(!stream.is_empty());
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(matches!(
            decode_json("{\"type\":\"nope\"}"),
            Err(ProtocolError::Json(_))
        ));
    }
}
