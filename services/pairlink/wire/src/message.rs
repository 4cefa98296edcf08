//! Protocol message schema shared by the client and the desktop peer.

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u32 = 2;

/// Oldest peer protocol version this implementation accepts
pub const MIN_COMPATIBLE_VERSION: u32 = 1;

/// Implementation name announced in `hello`
pub const IMPL_NAME: &str = "pairlink-rs";

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// End-user turn
    User,
    /// Model turn
    Assistant,
}

/// One turn of the conversation sent with every prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who wrote the turn
    pub role: Role,
    /// Turn text
    pub content: String,
}

impl ChatMessage {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Shorthand for a user turn
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// Every message that may travel between client and peer.
///
/// Field names follow the established wire schema, which mixes camelCase
/// (`clientId`, `displayName`) with snake_case (`max_tokens`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// First frame sent by the client after peer discovery
    Hello {
        /// Per-attempt client identifier
        #[serde(rename = "clientId")]
        client_id: String,
        /// Implementation name
        #[serde(rename = "impl")]
        implementation: String,
        /// Protocol version
        version: u32,
    },
    /// Client's version range, sent right after `hello`
    VersionNegotiate {
        /// Version spoken by the client
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        /// Oldest version the client accepts
        #[serde(rename = "minCompatibleVersion")]
        min_compatible_version: u32,
    },
    /// Peer's verdict on the negotiated version
    VersionAck {
        /// Whether the peer accepts the client
        compatible: bool,
        /// Version spoken by the peer
        #[serde(rename = "protocolVersion", default)]
        protocol_version: u32,
        /// Human readable rejection reason
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Completion request carrying the whole conversation
    Prompt {
        /// Prompt identifier
        id: String,
        /// Ordered conversation
        messages: Vec<ChatMessage>,
        /// Optional generation limit
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
    },
    /// Peer started generating for a prompt
    Start {
        /// Prompt identifier
        id: String,
    },
    /// Answer token
    Token {
        /// Prompt identifier
        id: String,
        /// Token text
        tok: String,
    },
    /// Reasoning ("thinking") token
    ReasoningToken {
        /// Prompt identifier
        id: String,
        /// Token text
        tok: String,
    },
    /// Generation finished
    End {
        /// Prompt identifier
        id: String,
    },
    /// Peer-side failure, scoped to a prompt when `id` is present
    Error {
        /// Prompt identifier
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Failure description
        message: String,
    },
    /// Request for the peer's loaded model
    GetModel {
        /// Correlation identifier
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Description of the loaded model
    ModelInfo {
        /// Correlation identifier of the originating `get_model`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Display name of the model
        #[serde(rename = "displayName")]
        display_name: String,
        /// Whether the model is installed on the peer
        installed: bool,
    },
}

impl ProtocolMessage {
    /// Wire tag of this message
    pub fn tag(&self) -> &'static str {
        match self {
            ProtocolMessage::Hello { .. } => "hello",
            ProtocolMessage::VersionNegotiate { .. } => "version_negotiate",
            ProtocolMessage::VersionAck { .. } => "version_ack",
            ProtocolMessage::Prompt { .. } => "prompt",
            ProtocolMessage::Start { .. } => "start",
            ProtocolMessage::Token { .. } => "token",
            ProtocolMessage::ReasoningToken { .. } => "reasoning_token",
            ProtocolMessage::End { .. } => "end",
            ProtocolMessage::Error { .. } => "error",
            ProtocolMessage::GetModel { .. } => "get_model",
            ProtocolMessage::ModelInfo { .. } => "model_info",
        }
    }

    /// Build the `hello` frame for a client id
    pub fn hello(client_id: impl Into<String>) -> Self {
        ProtocolMessage::Hello {
            client_id: client_id.into(),
            implementation: IMPL_NAME.to_string(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Build the `version_negotiate` frame for this implementation
    pub fn version_negotiate() -> Self {
        ProtocolMessage::VersionNegotiate {
            protocol_version: PROTOCOL_VERSION,
            min_compatible_version: MIN_COMPATIBLE_VERSION,
        }
    }
}
