//! Pairing session, reconnect backoff, prompt streaming and status fan-out.
//!
//! This crate drives one logical connection from a mobile client to a desktop
//! peer identified by a pairing code: it opens a transport channel, runs the
//! version handshake, streams prompt replies back as incremental text and
//! reconnects with exponential backoff when the peer goes away.
//!
//! ## Features
//!
//! - **Session State Machine**: single driver task owning the session, timers and transport
//! - **Handshake**: `hello` + `version_negotiate` with an optimistic grace period
//! - **Retry Scheduler**: capped exponential backoff with a live countdown
//! - **Prompt Streams**: reasoning/answer reassembly into one chunk stream
//! - **Status Publisher**: connectivity, error and retry-status subscribers
//! - **Transports**: in-process rooms and a TCP rendezvous relay
//!
//! ## Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use pairlink_session::{ClientConfig, RelayTransport, RemoteClient};
//! use pairlink_wire::ChatMessage;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> pairlink_session::Result<()> {
//! let transport = Arc::new(RelayTransport::new("127.0.0.1:7070"));
//! let client = RemoteClient::new(transport, ClientConfig::default());
//!
//! client.on_retry_status(|status| {
//!     println!("retrying: {} (attempt {})", status.retrying, status.attempt);
//! });
//!
//! client.enable_auto_retry().await?;
//! client.connect("K7Q-42").await?;
//! client.wait_until_connected(Duration::from_secs(10)).await?;
//!
//! let mut chunks = Box::pin(
//!     client
//!         .send_prompt(vec![ChatMessage::user("Why is the sky blue?")])
//!         .await?
//!         .into_stream(),
//! );
//! while let Some(chunk) = chunks.next().await {
//!     print!("{}", chunk?);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod fallback;
pub mod handshake;
pub mod relay;
pub mod retry;
pub mod session;
pub mod status;
pub mod stream;
pub mod transport;

// Re-export main types
pub use client::RemoteClient;
pub use error::{BridgeError, Result};
pub use fallback::{CompletionRouter, CompletionStream, LocalInference, Route};
pub use handshake::{evaluate_ack, AckVerdict, Handshake};
pub use relay::run_relay;
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use session::{ClientConfig, ConnectionState, ModelInfo};
pub use status::{RetryStatus, StatusPublisher};
pub use stream::{
    split_reasoning, PromptRegistry, PromptStream, PromptStreamState, Transcript, REASONING_CLOSE,
    REASONING_OPEN,
};
pub use transport::{
    connect_tcp, listen_tcp, MemoryHub, PairingCode, PeerLink, RelayTransport, Transport,
    TransportEvent, TransportHandle,
};
