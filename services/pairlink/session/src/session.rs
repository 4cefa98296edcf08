//! Core session management for remote pairing.
//!
//! A single driver task owns the current [`Session`], the retry state, every
//! timer and the transport handle. Callers talk to it through commands sent by
//! [`crate::RemoteClient`]; transport events, timers and commands are all
//! serialized through one `select!` loop, so the state machine needs no
//! locking of its own.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──peer joined──▶ AwaitingHandshake
//!      ▲                                                   │ version_ack / grace
//!      └──────────── peer lost / disconnect ◀──────── Connected
//! ```
//!
//! Timers are plain `Option`s on the driver. Clearing the option drops the
//! timer, and dropping the transport handle drops its event stream, so nothing
//! belonging to a superseded session can fire into a newer one.

use crate::error::{BridgeError, Result};
use crate::handshake::{evaluate_ack, AckVerdict, Handshake};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::status::{RetryStatus, StatusPublisher};
use crate::stream::PromptRegistry;
use crate::transport::{PairingCode, Transport, TransportEvent, TransportHandle};
use pairlink_wire::{decode, ChatMessage, ProtocolMessage, WireError};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{Instant, Interval, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for a pairing client
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How long to wait for `version_ack` before assuming compatibility
    pub handshake_grace: Duration,
    /// Overall limit for one prompt (and for model info requests)
    pub prompt_timeout: Duration,
    /// Period of retry countdown updates
    pub countdown_interval: Duration,
    /// How long a reconnect attempt waits for the peer before the next one
    pub peer_discovery_timeout: Duration,
    /// Reconnect backoff
    pub retry: RetryPolicy,
    /// Generation limit forwarded with every prompt
    pub max_tokens: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_grace: Duration::from_secs(2),
            prompt_timeout: Duration::from_secs(120),
            countdown_interval: Duration::from_secs(1),
            peer_discovery_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_tokens: None,
        }
    }
}

/// Connection lifecycle as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable peer (a retry may be pending)
    Disconnected,
    /// Transport open, waiting for a peer to appear
    Connecting,
    /// Peer present, handshake in progress
    AwaitingHandshake,
    /// Handshake complete, prompts accepted
    Connected,
}

/// Model loaded on the desktop peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    /// Display name of the model
    pub display_name: String,
    /// Whether the model is installed on the peer
    pub installed: bool,
}

/// State readable without a round trip to the driver
#[derive(Debug, Default)]
pub(crate) struct SharedInfo {
    pairing_code: RwLock<Option<PairingCode>>,
    last_model: RwLock<Option<ModelInfo>>,
}

impl SharedInfo {
    pub(crate) fn pairing_code(&self) -> Option<PairingCode> {
        self.pairing_code
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn last_model(&self) -> Option<ModelInfo> {
        self.last_model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_pairing_code(&self, code: PairingCode) {
        *self
            .pairing_code
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(code);
    }

    fn set_last_model(&self, info: ModelInfo) {
        *self.last_model.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }
}

/// Requests from the client handle to the driver
pub(crate) enum Command {
    Connect {
        code: PairingCode,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SendPrompt {
        id: String,
        messages: Vec<ChatMessage>,
        reply: oneshot::Sender<Result<Arc<Notify>>>,
    },
    SetAutoRetry {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    RequestModelInfo {
        id: String,
        reply: oneshot::Sender<Result<ModelInfo>>,
    },
    Shutdown,
}

/// The single logical connection attempt
#[derive(Debug)]
struct Session {
    code: PairingCode,
    client_id: String,
    handle: TransportHandle,
    handshake: Handshake,
}

impl Session {
    fn peer_present(&self) -> bool {
        self.handle.peer_present()
    }
}

/// Owner of all session state; runs until every client handle is dropped
pub(crate) struct SessionDriver {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    publisher: Arc<StatusPublisher>,
    registry: PromptRegistry,
    shared: Arc<SharedInfo>,

    session: Option<Session>,
    auto_retry: bool,
    retry: RetryState,
    retry_timer: Option<Pin<Box<Sleep>>>,
    countdown: Option<Interval>,
    grace_timer: Option<Pin<Box<Sleep>>>,
    discovery_timer: Option<Pin<Box<Sleep>>>,
    pending_models: HashMap<String, oneshot::Sender<Result<ModelInfo>>>,
}

impl SessionDriver {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        publisher: Arc<StatusPublisher>,
        registry: PromptRegistry,
        shared: Arc<SharedInfo>,
    ) -> Self {
        Self {
            transport,
            config,
            commands,
            state_tx,
            publisher,
            registry,
            shared,
            session: None,
            auto_retry: false,
            retry: RetryState::default(),
            retry_timer: None,
            countdown: None,
            grace_timer: None,
            discovery_timer: None,
            pending_models: HashMap::new(),
        }
    }

    /// Run the driver loop
    pub(crate) async fn run(mut self) {
        debug!("Session driver started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },

                event = next_event(&mut self.session) => {
                    self.handle_transport_event(event);
                }

                _ = wait_timer(&mut self.grace_timer) => {
                    self.grace_timer = None;
                    self.on_grace_expired();
                }

                _ = wait_timer(&mut self.retry_timer) => {
                    self.retry_timer = None;
                    self.on_retry_due().await;
                }

                _ = wait_timer(&mut self.discovery_timer) => {
                    self.discovery_timer = None;
                    self.on_discovery_expired();
                }

                _ = wait_tick(&mut self.countdown) => {
                    self.publish_countdown();
                }
            }
        }

        self.cancel_retry_timers();
        self.teardown_session("client shut down");
        debug!("Session driver stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { code, reply } => {
                let result = self.connect(code).await;
                reply.send(result).ok();
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                reply.send(()).ok();
            }
            Command::SendPrompt {
                id,
                messages,
                reply,
            } => {
                reply.send(self.send_prompt(id, messages)).ok();
            }
            Command::SetAutoRetry { enabled, reply } => {
                self.set_auto_retry(enabled);
                reply.send(()).ok();
            }
            Command::RequestModelInfo { id, reply } => self.request_model_info(id, reply),
            Command::Shutdown => {}
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    async fn connect(&mut self, code: PairingCode) -> Result<()> {
        if let Some(session) = &self.session {
            if session.code == code && session.peer_present() {
                debug!("Peer already active for {}, connect is a no-op", code);
                return Ok(());
            }
        }

        info!("Connecting with pairing code {}", code);
        self.shared.set_pairing_code(code.clone());
        self.cancel_retry_timers();
        self.retry.reset();
        if self.auto_retry {
            self.retry.arm();
        }

        match self.open_session(code).await {
            Ok(()) => Ok(()),
            Err(e) if self.retry.is_armed() => {
                warn!("Transport failed to start, scheduling retry: {}", e);
                self.schedule_retry();
                Ok(())
            }
            Err(e) => {
                error!("Transport failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn open_session(&mut self, code: PairingCode) -> Result<()> {
        self.teardown_session("superseded by a new connection");

        let client_id = Uuid::new_v4().to_string();
        self.set_state(ConnectionState::Connecting);

        match self.transport.open(&code).await {
            Ok(handle) => {
                info!("Transport open for {} as client {}", code, client_id);
                self.session = Some(Session {
                    code,
                    client_id,
                    handle,
                    handshake: Handshake::default(),
                });
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn disconnect(&mut self) {
        info!("Disconnect requested");
        self.retry.disarm();
        self.cancel_retry_timers();
        self.teardown_session("disconnected");
        self.publisher.retry_status(RetryStatus::idle(0));
    }

    fn set_auto_retry(&mut self, enabled: bool) {
        self.auto_retry = enabled;
        if enabled {
            info!("Automatic reconnect enabled");
            self.retry.arm();
        } else {
            info!("Automatic reconnect disabled");
            let was_pending = self.retry.is_pending();
            self.retry.disarm();
            self.cancel_retry_timers();
            if was_pending {
                self.publisher.retry_status(RetryStatus::idle(0));
            }
        }
    }

    fn send_prompt(&mut self, id: String, messages: Vec<ChatMessage>) -> Result<Arc<Notify>> {
        let session = self.connected_session()?;
        let notify = self.registry.register(&id);

        let prompt = ProtocolMessage::Prompt {
            id: id.clone(),
            messages,
            max_tokens: self.config.max_tokens,
        };
        if let Err(e) = session.handle.send(&prompt) {
            warn!("Failed to send prompt {}: {}", id, e);
            self.registry.remove(&id);
            return Err(e);
        }

        debug!("Prompt {} dispatched", id);
        Ok(notify)
    }

    fn request_model_info(&mut self, id: String, reply: oneshot::Sender<Result<ModelInfo>>) {
        let session = match self.connected_session() {
            Ok(session) => session,
            Err(e) => {
                reply.send(Err(e)).ok();
                return;
            }
        };

        if let Err(e) = session
            .handle
            .send(&ProtocolMessage::GetModel { id: Some(id.clone()) })
        {
            reply.send(Err(e)).ok();
            return;
        }

        // Requests whose callers gave up leave closed senders behind
        self.pending_models.retain(|_, pending| !pending.is_closed());
        self.pending_models.insert(id, reply);
    }

    fn connected_session(&self) -> Result<&Session> {
        match &self.session {
            Some(session)
                if session.handshake.is_compatible()
                    && *self.state_tx.borrow() == ConnectionState::Connected =>
            {
                Ok(session)
            }
            _ => Err(BridgeError::NotConnected),
        }
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerJoined => self.on_peer_joined(),
            TransportEvent::PeerLeft => self.on_peer_lost("peer left", false),
            TransportEvent::Closed { reason } => self.on_peer_lost(&reason, true),
            TransportEvent::Frame(text) => match decode(&text) {
                Ok(message) => self.handle_message(message),
                Err(WireError::UnknownTag(tag)) => {
                    warn!("Dropping frame with unknown type {}", tag);
                }
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            },
        }
    }

    fn on_peer_joined(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.handshake.is_complete() {
            debug!("Duplicate peer announcement ignored");
            return;
        }
        self.discovery_timer = None;

        info!("Peer discovered for {}, starting handshake", session.code);
        if let Err(e) = session.handshake.begin(&session.handle, &session.client_id) {
            warn!("Handshake could not be sent: {}", e);
            self.on_peer_lost("handshake send failed", false);
            return;
        }

        self.grace_timer = Some(Box::pin(tokio::time::sleep(self.config.handshake_grace)));
        self.set_state(ConnectionState::AwaitingHandshake);
    }

    fn on_peer_lost(&mut self, reason: &str, transport_closed: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        warn!("Peer lost on {}: {}", session.code, reason);

        session.handshake.reset();
        self.grace_timer = None;
        self.discovery_timer = None;
        if transport_closed {
            self.session = None;
        }
        self.fail_in_flight();

        let was_connected = self.set_state(ConnectionState::Disconnected) == ConnectionState::Connected;
        if was_connected {
            self.publisher.connectivity(false);
        }

        if self.retry.is_armed() {
            self.schedule_retry();
        }
    }

    fn handle_message(&mut self, message: ProtocolMessage) {
        match message {
            ProtocolMessage::VersionAck {
                compatible,
                protocol_version,
                reason,
            } => self.on_version_ack(evaluate_ack(compatible, protocol_version, reason)),

            ProtocolMessage::Start { id } => {
                if !self.registry.apply(&id, |state| state.mark_started()) {
                    debug!("start for unknown prompt {}", id);
                }
            }
            ProtocolMessage::Token { id, tok } => {
                if !self.registry.apply(&id, |state| state.push_answer(&tok)) {
                    debug!("token for unknown prompt {}", id);
                }
            }
            ProtocolMessage::ReasoningToken { id, tok } => {
                if !self.registry.apply(&id, |state| state.push_reasoning(&tok)) {
                    debug!("reasoning token for unknown prompt {}", id);
                }
            }
            ProtocolMessage::End { id } => {
                if self.registry.apply(&id, |state| state.finish()) {
                    debug!("Prompt {} finished", id);
                } else {
                    debug!("end for unknown prompt {}", id);
                }
            }
            ProtocolMessage::Error { id, message } => {
                let routed = id
                    .as_deref()
                    .map(|id| self.registry.apply(id, |state| state.fail(message.clone())))
                    .unwrap_or(false);
                if !routed {
                    error!("Peer reported error: {}", message);
                    self.publisher.error(message);
                }
            }

            ProtocolMessage::ModelInfo {
                id,
                display_name,
                installed,
            } => {
                let info = ModelInfo {
                    display_name,
                    installed,
                };
                info!("Peer model: {} (installed: {})", info.display_name, info.installed);
                self.shared.set_last_model(info.clone());
                if let Some(reply) = id.and_then(|id| self.pending_models.remove(&id)) {
                    reply.send(Ok(info)).ok();
                }
            }

            other => debug!("Ignoring {} frame from peer", other.tag()),
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    fn on_version_ack(&mut self, verdict: AckVerdict) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        match verdict {
            AckVerdict::Compatible { peer_version } => {
                if !session.handshake.is_started() {
                    debug!("version_ack (peer v{}) before any peer joined, ignored", peer_version);
                    return;
                }
                if session.handshake.is_complete() {
                    debug!("Late version_ack (peer v{}) after completion", peer_version);
                    return;
                }
                info!("Peer speaks protocol v{}", peer_version);
                self.complete_handshake(false);
            }
            AckVerdict::Incompatible { reason } => self.on_incompatible(reason),
        }
    }

    fn on_grace_expired(&mut self) {
        match self.session.as_ref() {
            Some(session) if session.handshake.is_started() && !session.handshake.is_complete() => {
                warn!(
                    "No version_ack within {:?}; assuming peer is compatible",
                    self.config.handshake_grace
                );
                self.complete_handshake(true);
            }
            _ => {}
        }
    }

    fn complete_handshake(&mut self, optimistic: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.handshake.complete(optimistic);
        self.grace_timer = None;
        if session.handshake.was_optimistic() {
            info!("Connected to peer via {} (unconfirmed protocol version)", session.code);
        } else {
            info!("Connected to peer via {}", session.code);
        }

        self.cancel_retry_timers();
        self.retry.reset();
        self.set_state(ConnectionState::Connected);
        self.publisher.connectivity(true);
        self.publisher.retry_status(RetryStatus::idle(0));
    }

    fn on_incompatible(&mut self, reason: String) {
        error!("Peer rejected protocol version: {}", reason);
        self.retry.disarm();
        self.cancel_retry_timers();
        self.teardown_session("protocol incompatible");
        self.publisher
            .error(BridgeError::HandshakeIncompatible { reason }.to_string());
    }

    // -----------------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------------

    fn schedule_retry(&mut self) {
        if self.retry.is_pending() {
            debug!("Retry already pending");
            return;
        }
        if self.session.as_ref().map_or(false, Session::peer_present) {
            debug!("Peer still present on transport, not scheduling retry");
            return;
        }
        if self.shared.pairing_code().is_none() {
            return;
        }

        let now = Instant::now();
        match self.retry.schedule(&self.config.retry, now) {
            RetryDecision::Scheduled { attempt, delay } => {
                info!("Reconnect attempt {} in {:?}", attempt, delay);
                self.retry_timer = Some(Box::pin(tokio::time::sleep_until(now + delay)));
                let period = self.config.countdown_interval;
                self.countdown = Some(tokio::time::interval_at(now + period, period));
                self.publish_countdown();
            }
            RetryDecision::Exhausted { attempts } => {
                self.cancel_retry_timers();
                let err = BridgeError::RetryExhausted { attempts };
                error!("{}", err);
                self.publisher.error(err.to_string());
                self.publisher.retry_status(RetryStatus::idle(attempts));
            }
            RetryDecision::Disarmed => {}
        }
    }

    async fn on_retry_due(&mut self) {
        self.countdown = None;
        self.retry.clear_deadline();

        if self.session.as_ref().map_or(false, Session::peer_present) {
            debug!("Peer reappeared before retry fired");
            return;
        }
        let Some(code) = self.shared.pairing_code() else {
            return;
        };

        let attempt = self.retry.attempt();
        info!("Reconnect attempt {} for {}", attempt, code);
        match self.open_session(code).await {
            Ok(()) => {
                // The attempt only counts once the handshake completes
                self.discovery_timer = Some(Box::pin(tokio::time::sleep(
                    self.config.peer_discovery_timeout,
                )));
                self.publisher.retry_status(RetryStatus::awaiting_peer(attempt));
            }
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                self.schedule_retry();
            }
        }
    }

    fn on_discovery_expired(&mut self) {
        match self.session.as_ref() {
            Some(session) if !session.handshake.is_started() && !session.peer_present() => {
                warn!(
                    "No peer joined {} within {:?} of reconnecting",
                    session.code, self.config.peer_discovery_timeout
                );
                self.schedule_retry();
            }
            _ => {}
        }
    }

    fn publish_countdown(&self) {
        let remaining = self.retry.remaining(Instant::now());
        self.publisher.retry_status(RetryStatus {
            attempt: self.retry.attempt(),
            next_retry_ms: remaining.map(|d| d.as_millis() as u64),
            retrying: remaining.is_some(),
        });
    }

    fn cancel_retry_timers(&mut self) {
        self.retry_timer = None;
        self.countdown = None;
        self.discovery_timer = None;
        self.retry.clear_deadline();
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    fn teardown_session(&mut self, reason: &str) {
        self.grace_timer = None;
        self.discovery_timer = None;
        if let Some(session) = self.session.take() {
            info!("Closing session {} ({})", session.code, reason);
        }
        self.fail_in_flight();

        if self.set_state(ConnectionState::Disconnected) == ConnectionState::Connected {
            self.publisher.connectivity(false);
        }
    }

    fn fail_in_flight(&mut self) {
        let dropped = self.registry.clear();
        if dropped > 0 {
            warn!("Dropped {} in-flight prompts", dropped);
        }
        for (id, reply) in self.pending_models.drain() {
            reply.send(Err(BridgeError::PromptLost(id))).ok();
        }
    }

    /// Move to `next`, returning the previous state
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!("Connection state {:?} -> {:?}", previous, next);
        }
        previous
    }
}

async fn next_event(session: &mut Option<Session>) -> TransportEvent {
    match session {
        Some(session) => session.handle.next_event().await,
        None => std::future::pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn wait_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
