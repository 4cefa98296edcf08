//! Handshake protocol for pairing sessions.
//!
//! Immediately after the peer is discovered the client sends `hello` followed
//! by `version_negotiate`. The peer is expected to answer with `version_ack`.
//! Peers that predate version negotiation never answer, so the session arms a
//! grace timer and treats silence as compatibility once it expires.

use crate::error::Result;
use crate::transport::TransportHandle;
use pairlink_wire::ProtocolMessage;
use tracing::debug;

/// Outcome of evaluating a `version_ack`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckVerdict {
    /// Peer accepts our version
    Compatible {
        /// Version reported by the peer
        peer_version: u32,
    },
    /// Peer rejects our version
    Incompatible {
        /// Reason shown to the user
        reason: String,
    },
}

/// Handshake progress for one session attempt
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    started: bool,
    complete: bool,
    compatible: bool,
    optimistic: bool,
}

impl Handshake {
    /// Send `hello` and `version_negotiate`, in that order
    pub fn begin(&mut self, handle: &TransportHandle, client_id: &str) -> Result<()> {
        handle.send(&ProtocolMessage::hello(client_id))?;
        handle.send(&ProtocolMessage::version_negotiate())?;
        self.started = true;
        debug!("Sent hello and version_negotiate as client {}", client_id);
        Ok(())
    }

    /// Whether the opening frames were sent
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the handshake has completed
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether the peer is considered protocol compatible
    pub fn is_compatible(&self) -> bool {
        self.compatible
    }

    /// Whether completion came from the grace timer rather than an ack
    pub fn was_optimistic(&self) -> bool {
        self.optimistic
    }

    /// Mark the handshake complete
    pub fn complete(&mut self, optimistic: bool) {
        self.complete = true;
        self.compatible = true;
        self.optimistic = optimistic;
    }

    /// Forget all progress (peer lost)
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Evaluate a `version_ack` frame
pub fn evaluate_ack(compatible: bool, peer_version: u32, reason: Option<String>) -> AckVerdict {
    if compatible {
        AckVerdict::Compatible { peer_version }
    } else {
        AckVerdict::Incompatible {
            reason: reason.unwrap_or_else(|| {
                format!("peer protocol version {} is not compatible", peer_version)
            }),
        }
    }
}
