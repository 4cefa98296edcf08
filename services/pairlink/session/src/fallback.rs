//! Routing between the paired peer and on-device inference.
//!
//! On-device inference is an external collaborator: the host supplies a
//! [`LocalInference`] implementation and the router only decides where a
//! conversation goes. Both routes produce the same chunk stream shape, with
//! reasoning wrapped in the same markers.

use crate::client::RemoteClient;
use crate::error::{BridgeError, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use pairlink_wire::ChatMessage;
use std::sync::Arc;
use tracing::{debug, info};

/// Stream of text chunks from either route
pub type CompletionStream = BoxStream<'static, Result<String>>;

/// On-device model supplied by the host
pub trait LocalInference: Send + Sync {
    /// Name shown to the user
    fn name(&self) -> &str;

    /// Stream a completion for the conversation
    fn complete(&self, messages: Vec<ChatMessage>) -> CompletionStream;
}

/// Where a conversation was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The paired desktop peer
    Remote,
    /// The local model
    Local,
}

/// Sends conversations to the peer when connected, otherwise to the local model
#[derive(Clone)]
pub struct CompletionRouter {
    remote: RemoteClient,
    local: Option<Arc<dyn LocalInference>>,
}

impl CompletionRouter {
    /// Router with no local fallback
    pub fn new(remote: RemoteClient) -> Self {
        Self {
            remote,
            local: None,
        }
    }

    /// Add a local model used while the peer is unavailable
    pub fn with_local(mut self, local: Arc<dyn LocalInference>) -> Self {
        self.local = Some(local);
        self
    }

    /// Route the next conversation would take
    pub fn route(&self) -> Result<Route> {
        if self.remote.is_connected() {
            Ok(Route::Remote)
        } else if self.local.is_some() {
            Ok(Route::Local)
        } else {
            Err(BridgeError::NotConnected)
        }
    }

    /// Start a completion on the best available route
    pub async fn complete(&self, messages: Vec<ChatMessage>) -> Result<(Route, CompletionStream)> {
        if self.route()? == Route::Remote {
            match self.remote.send_prompt(messages.clone()).await {
                Ok(stream) => return Ok((Route::Remote, stream.into_stream().boxed())),
                // Peer dropped between the check and the send
                Err(BridgeError::NotConnected) if self.local.is_some() => {
                    debug!("Peer went away before the prompt was sent");
                }
                Err(e) => return Err(e),
            }
        }

        let local = self.local.as_ref().ok_or(BridgeError::NotConnected)?;
        info!("Completing locally with {}", local.name());
        Ok((Route::Local, local.complete(messages)))
    }
}

impl std::fmt::Debug for CompletionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionRouter")
            .field("remote", &self.remote.state())
            .field("local", &self.local.as_ref().map(|l| l.name().to_string()))
            .finish()
    }
}
