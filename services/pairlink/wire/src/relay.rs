//! Control frames spoken between a relay transport and the rendezvous relay.
//!
//! Relay frames travel on the same newline-delimited text stream as protocol
//! messages. Their tags all start with `relay_` so the relay and the transport
//! can peel them off without touching protocol traffic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const RELAY_TAG_PREFIX: &str = "relay_";

/// Rendezvous control frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Client asks to join the room named by its pairing code
    RelayJoin {
        /// Room name (the pairing code)
        room: String,
    },
    /// The other member of the room is present
    RelayPeerJoined,
    /// The other member of the room went away
    RelayPeerLeft,
    /// The room already has two members
    RelayRoomFull,
}

/// Parse a line as a relay frame; `None` for ordinary protocol traffic
pub fn parse_relay_frame(line: &str) -> Option<RelayFrame> {
    if !line.contains(RELAY_TAG_PREFIX) {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;
    let tag = value.get("type").and_then(Value::as_str)?;
    if !tag.starts_with(RELAY_TAG_PREFIX) {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Encode a relay frame as one line of text (without the trailing newline)
pub fn encode_relay_frame(frame: &RelayFrame) -> String {
    // Unit and string-only variants cannot fail to serialize
    serde_json::to_string(frame).unwrap_or_default()
}
