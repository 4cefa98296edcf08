//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame is not valid JSON
    #[error("invalid json: {0}")]
    Json(#[source] serde_json::Error),

    /// Frame has no string `type` field
    #[error("missing type tag")]
    MissingTag,

    /// Frame carries a tag outside the schema
    #[error("unknown type {0}")]
    UnknownTag(String),

    /// Known tag but the fields do not match the variant
    #[error("malformed {tag} frame: {source}")]
    Malformed {
        /// Tag of the offending frame
        tag: String,
        /// Underlying deserialization error
        #[source]
        source: serde_json::Error,
    },

    /// Message could not be serialized
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),
}

impl WireError {
    /// Tag reported by the frame, if it got far enough to have one
    pub fn tag(&self) -> Option<&str> {
        match self {
            WireError::UnknownTag(tag) => Some(tag),
            WireError::Malformed { tag, .. } => Some(tag),
            _ => None,
        }
    }
}
