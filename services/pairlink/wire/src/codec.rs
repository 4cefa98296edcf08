//! Encoding and decoding of protocol messages as JSON text frames.
//!
//! Decoding is two-phase: the frame is parsed into a generic JSON value so the
//! `type` tag can be checked against the schema before the typed conversion.
//! That keeps unknown tags distinguishable from malformed known frames.

use crate::error::WireError;
use crate::message::ProtocolMessage;
use serde_json::Value;
use tracing::trace;

/// Largest text frame accepted by the decoder (1 MiB)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Every tag the schema recognizes
pub const KNOWN_TAGS: &[&str] = &[
    "hello",
    "version_negotiate",
    "version_ack",
    "prompt",
    "start",
    "token",
    "reasoning_token",
    "end",
    "error",
    "get_model",
    "model_info",
];

/// Encode a message into a single text frame
pub fn encode(message: &ProtocolMessage) -> Result<String, WireError> {
    let text = serde_json::to_string(message).map_err(WireError::Encode)?;
    if text.len() > MAX_FRAME_LEN {
        return Err(WireError::Size(text.len()));
    }
    trace!("Encoded {} frame ({} bytes)", message.tag(), text.len());
    Ok(text)
}

/// Decode a text frame into a message
pub fn decode(frame: &str) -> Result<ProtocolMessage, WireError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(WireError::Size(frame.len()));
    }

    let value: Value = serde_json::from_str(frame).map_err(WireError::Json)?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(WireError::MissingTag)?
        .to_string();

    if !KNOWN_TAGS.contains(&tag.as_str()) {
        return Err(WireError::UnknownTag(tag));
    }

    serde_json::from_value(value).map_err(|source| WireError::Malformed { tag, source })
}
