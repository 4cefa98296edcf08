//! Demo desktop peer and local echo model.
//!
//! The peer joins a room, answers the handshake and model queries, and streams
//! a scripted reply for every prompt: a few reasoning tokens about the
//! conversation followed by an echo of the last user message. [`EchoModel`]
//! produces the same reply through the local inference route.

use anyhow::{bail, Result};
use futures::stream::StreamExt;
use pairlink_session::{
    CompletionStream, LocalInference, PairingCode, PromptStreamState, Transport, TransportEvent,
};
use pairlink_wire::{
    decode, ChatMessage, ProtocolMessage, Role, WireError, MIN_COMPATIBLE_VERSION, PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Behaviour of the demo peer
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Pause between streamed tokens
    pub token_delay: Duration,
    /// Stay silent on `version_negotiate` (peers that predate negotiation)
    pub skip_version_ack: bool,
    /// Model name reported in `model_info`
    pub model_name: String,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            token_delay: Duration::from_millis(40),
            skip_version_ack: false,
            model_name: "echo-1".to_string(),
        }
    }
}

/// Token kinds of a scripted reply
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScriptToken {
    Reasoning(String),
    Answer(String),
}

/// Reply to a conversation: reasoning about it, then an echo of the last user turn
fn echo_script(messages: &[ChatMessage]) -> Vec<ScriptToken> {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("");

    let reasoning = format!(
        "{} messages so far, the last one has {} words. ",
        messages.len(),
        last_user.split_whitespace().count()
    );
    let answer = format!("You said: {}", last_user);

    split_keeping_spaces(&reasoning)
        .into_iter()
        .map(ScriptToken::Reasoning)
        .chain(split_keeping_spaces(&answer).into_iter().map(ScriptToken::Answer))
        .collect()
}

/// Split into word tokens, each carrying its trailing whitespace
fn split_keeping_spaces(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if !ch.is_whitespace() && current.ends_with(char::is_whitespace) {
            tokens.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Peer-side compatibility check for a client's `version_negotiate`
fn accepts(client_version: u32, client_min: u32) -> std::result::Result<(), String> {
    if client_version < MIN_COMPATIBLE_VERSION {
        return Err(format!(
            "client protocol v{} is older than the minimum v{}",
            client_version, MIN_COMPATIBLE_VERSION
        ));
    }
    if client_min > PROTOCOL_VERSION {
        return Err(format!(
            "client requires protocol v{} but this peer speaks v{}",
            client_min, PROTOCOL_VERSION
        ));
    }
    Ok(())
}

/// Serve one room until the channel closes
pub async fn run_peer(
    transport: Arc<dyn Transport>,
    code: PairingCode,
    options: PeerOptions,
) -> Result<()> {
    let mut handle = transport.open(&code).await?;
    component_info!("peer", "Waiting for a client in room {}", code);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ProtocolMessage>();

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                TransportEvent::PeerJoined => component_info!("peer", "Client joined room {}", code),
                TransportEvent::PeerLeft => component_info!("peer", "Client left room {}", code),
                TransportEvent::Closed { reason } => bail!("peer channel closed: {}", reason),
                TransportEvent::Frame(text) => {
                    let message = match decode(&text) {
                        Ok(message) => message,
                        Err(WireError::UnknownTag(tag)) => {
                            component_warn!("peer", "Ignoring unknown frame type {}", tag);
                            continue;
                        }
                        Err(e) => {
                            component_warn!("peer", "Dropping undecodable frame: {}", e);
                            continue;
                        }
                    };
                    handle_message(message, &options, &out_tx);
                }
            },

            Some(message) = out_rx.recv() => {
                if let Err(e) = handle.send(&message) {
                    component_warn!("peer", "Failed to send {} frame: {}", message.tag(), e);
                }
            }
        }
    }
}

fn handle_message(
    message: ProtocolMessage,
    options: &PeerOptions,
    out: &mpsc::UnboundedSender<ProtocolMessage>,
) {
    match message {
        ProtocolMessage::Hello {
            client_id,
            implementation,
            version,
        } => {
            component_info!("peer", "Hello from {} ({} v{})", client_id, implementation, version);
        }
        ProtocolMessage::VersionNegotiate {
            protocol_version,
            min_compatible_version,
        } => {
            if options.skip_version_ack {
                return;
            }
            let ack = match accepts(protocol_version, min_compatible_version) {
                Ok(()) => ProtocolMessage::VersionAck {
                    compatible: true,
                    protocol_version: PROTOCOL_VERSION,
                    reason: None,
                },
                Err(reason) => {
                    component_warn!("peer", "Rejecting client: {}", reason);
                    ProtocolMessage::VersionAck {
                        compatible: false,
                        protocol_version: PROTOCOL_VERSION,
                        reason: Some(reason),
                    }
                }
            };
            out.send(ack).ok();
        }
        ProtocolMessage::GetModel { id } => {
            out.send(ProtocolMessage::ModelInfo {
                id,
                display_name: options.model_name.clone(),
                installed: true,
            })
            .ok();
        }
        ProtocolMessage::Prompt { id, messages, .. } => {
            component_info!("peer", "Prompt {} with {} messages", id, messages.len());
            let out = out.clone();
            let delay = options.token_delay;
            tokio::spawn(stream_reply(id, messages, delay, out));
        }
        other => component_warn!("peer", "Unexpected {} frame from client", other.tag()),
    }
}

async fn stream_reply(
    id: String,
    messages: Vec<ChatMessage>,
    delay: Duration,
    out: mpsc::UnboundedSender<ProtocolMessage>,
) {
    if messages.is_empty() {
        out.send(ProtocolMessage::Error {
            id: Some(id),
            message: "empty conversation".to_string(),
        })
        .ok();
        return;
    }

    out.send(ProtocolMessage::Start { id: id.clone() }).ok();
    for token in echo_script(&messages) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let frame = match token {
            ScriptToken::Reasoning(tok) => ProtocolMessage::ReasoningToken { id: id.clone(), tok },
            ScriptToken::Answer(tok) => ProtocolMessage::Token { id: id.clone(), tok },
        };
        if out.send(frame).is_err() {
            return;
        }
    }
    out.send(ProtocolMessage::End { id }).ok();
}

/// Local model producing the demo peer's reply
#[derive(Debug, Default)]
pub struct EchoModel;

impl LocalInference for EchoModel {
    fn name(&self) -> &str {
        "local echo"
    }

    fn complete(&self, messages: Vec<ChatMessage>) -> CompletionStream {
        let mut state = PromptStreamState::default();
        let mut offset = 0;
        let mut chunks: Vec<pairlink_session::Result<String>> = Vec::new();

        let mut take_suffix = |state: &PromptStreamState| {
            let chunk = state.text()[offset..].to_string();
            offset = state.text().len();
            if !chunk.is_empty() {
                chunks.push(Ok(chunk));
            }
        };

        for token in echo_script(&messages) {
            match token {
                ScriptToken::Reasoning(tok) => state.push_reasoning(&tok),
                ScriptToken::Answer(tok) => state.push_answer(&tok),
            }
            take_suffix(&state);
        }
        state.finish();
        take_suffix(&state);

        futures::stream::iter(chunks).boxed()
    }
}
