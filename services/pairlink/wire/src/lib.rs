//! Wire protocol messages, JSON text framing and relay control frames for pairlink.
//!
//! This crate defines the message schema exchanged between a mobile client and
//! its paired desktop peer, together with the encoder/decoder used to move those
//! messages over any transport that carries UTF-8 text frames.
//!
//! ## Wire Format
//!
//! Every frame is a single JSON object discriminated by its `type` field:
//!
//! ```text
//! {"type":"hello","clientId":"…","impl":"pairlink-rs","version":2}
//! {"type":"prompt","id":"…","messages":[{"role":"user","content":"hi"}]}
//! {"type":"reasoning_token","id":"…","tok":"Let me think"}
//! {"type":"token","id":"…","tok":"Hello"}
//! {"type":"end","id":"…"}
//! ```
//!
//! Frames whose `type` is not part of the schema decode to
//! [`WireError::UnknownTag`]; callers log and drop them.
//!
//! Relay control frames (`relay_*`) share the same framing but are consumed by
//! the rendezvous transport and never reach the session layer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;
pub mod relay;

// Re-export main types
pub use codec::{decode, encode, KNOWN_TAGS, MAX_FRAME_LEN};
pub use error::WireError;
pub use message::{
    ChatMessage, ProtocolMessage, Role, IMPL_NAME, MIN_COMPATIBLE_VERSION, PROTOCOL_VERSION,
};
pub use relay::{encode_relay_frame, parse_relay_frame, RelayFrame};
