//! Error taxonomy surfaced by the pairing session.

use std::time::Duration;
use thiserror::Error;

/// Errors returned to callers or routed through the status publisher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The peer channel failed to start
    #[error("transport failed to start: {0}")]
    TransportInit(String),

    /// The peer explicitly rejected our protocol version
    #[error("peer rejected protocol version: {reason}")]
    HandshakeIncompatible {
        /// Reason given by the peer
        reason: String,
    },

    /// An operation needed a connected peer
    #[error("not connected to a peer")]
    NotConnected,

    /// No `end` or `error` arrived within the prompt timeout
    #[error("prompt {id} timed out after {timeout:?}")]
    PromptTimeout {
        /// Prompt identifier
        id: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The peer reported a failure for the prompt
    #[error("{0}")]
    PromptError(String),

    /// Automatic reconnection gave up
    #[error("reconnect gave up after {attempts} attempts")]
    RetryExhausted {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// The session went away while the request was in flight
    #[error("session lost while request {0} was in flight")]
    PromptLost(String),

    /// Pairing code was empty
    #[error("invalid pairing code")]
    InvalidPairingCode,

    /// A frame could not be handed to the transport
    #[error("failed to send frame: {0}")]
    Send(String),

    /// The session driver task is gone
    #[error("session driver has shut down")]
    Shutdown,
}

/// Result alias for session operations
pub type Result<T> = std::result::Result<T, BridgeError>;
