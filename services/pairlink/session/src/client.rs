//! Host-facing handle to a pairing session.

use crate::error::{BridgeError, Result};
use crate::session::{ClientConfig, Command, ConnectionState, ModelInfo, SessionDriver, SharedInfo};
use crate::status::{RetryStatus, StatusPublisher};
use crate::stream::{PromptRegistry, PromptStream};
use crate::transport::{PairingCode, Transport};
use pairlink_wire::ChatMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

/// Cloneable handle to the session driver.
///
/// Construct one per pairing relationship and inject it where needed; clones
/// share the same session. The driver task stops when [`RemoteClient::shutdown`]
/// is called or the last clone is dropped.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    publisher: Arc<StatusPublisher>,
    registry: PromptRegistry,
    shared: Arc<SharedInfo>,
    config: ClientConfig,
}

impl RemoteClient {
    /// Spawn a session driver on the current tokio runtime
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let publisher = Arc::new(StatusPublisher::new());
        let registry = PromptRegistry::new();
        let shared = Arc::new(SharedInfo::default());

        let driver = SessionDriver::new(
            transport,
            config.clone(),
            commands_rx,
            state_tx,
            publisher.clone(),
            registry.clone(),
            shared.clone(),
        );
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            publisher,
            registry,
            shared,
            config,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| BridgeError::Shutdown)?;
        reply_rx.await.map_err(|_| BridgeError::Shutdown)
    }

    /// Open a session for `pairing_code`.
    ///
    /// Succeeds immediately when a peer is already active for the same code.
    /// Transport start failures are returned unless automatic retry is on.
    pub async fn connect(&self, pairing_code: &str) -> Result<()> {
        let code = PairingCode::new(pairing_code)?;
        self.request(|reply| Command::Connect { code, reply })
            .await?
    }

    /// Tear the session down and stop retrying; idempotent
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Send a conversation and stream the reply
    pub async fn send_prompt(&self, messages: Vec<ChatMessage>) -> Result<PromptStream> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }

        let id = Uuid::new_v4().to_string();
        let notify = self
            .request(|reply| Command::SendPrompt {
                id: id.clone(),
                messages,
                reply,
            })
            .await??;
        debug!("Streaming prompt {}", id);

        Ok(PromptStream::new(
            id,
            self.registry.clone(),
            notify,
            self.config.prompt_timeout,
        ))
    }

    /// Reconnect automatically after peer loss or transport failure
    pub async fn enable_auto_retry(&self) -> Result<()> {
        self.request(|reply| Command::SetAutoRetry {
            enabled: true,
            reply,
        })
        .await
    }

    /// Stop reconnecting; cancels any pending retry and countdown
    pub async fn disable_auto_retry(&self) -> Result<()> {
        self.request(|reply| Command::SetAutoRetry {
            enabled: false,
            reply,
        })
        .await
    }

    /// Ask the peer which model it serves
    pub async fn request_model_info(&self) -> Result<ModelInfo> {
        let id = Uuid::new_v4().to_string();
        let request = self.request(|reply| Command::RequestModelInfo {
            id: id.clone(),
            reply,
        });

        match tokio::time::timeout(self.config.prompt_timeout, request).await {
            Ok(result) => result?,
            Err(_) => Err(BridgeError::PromptTimeout {
                id,
                timeout: self.config.prompt_timeout,
            }),
        }
    }

    /// Most recent model info reported by the peer
    pub fn last_model_info(&self) -> Option<ModelInfo> {
        self.shared.last_model()
    }

    /// Replace the connectivity subscriber
    pub fn on_connectivity(&self, subscriber: impl Fn(bool) + Send + Sync + 'static) {
        self.publisher.on_connectivity(subscriber);
    }

    /// Replace the error subscriber
    pub fn on_error(&self, subscriber: impl Fn(String) + Send + Sync + 'static) {
        self.publisher.on_error(subscriber);
    }

    /// Replace the retry-status subscriber
    pub fn on_retry_status(&self, subscriber: impl Fn(RetryStatus) + Send + Sync + 'static) {
        self.publisher.on_retry_status(subscriber);
    }

    /// Drop all status subscribers
    pub fn clear_subscribers(&self) {
        self.publisher.clear();
    }

    /// Whether the handshake has completed
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Pairing code of the most recent `connect`
    pub fn current_pairing_code(&self) -> Option<PairingCode> {
        self.shared.pairing_code()
    }

    /// Wait until the session reaches `Connected`; `NotConnected` on timeout
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.watch_state();
        let wait = async {
            while *state.borrow_and_update() != ConnectionState::Connected {
                state.changed().await.map_err(|_| BridgeError::Shutdown)?;
            }
            Ok::<(), BridgeError>(())
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BridgeError::NotConnected)?
    }

    /// Stop the driver, closing any open session
    pub fn shutdown(&self) {
        self.commands.send(Command::Shutdown).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::transport::{MemoryHub, PeerLink, TransportEvent, TransportHandle};
    use async_trait::async_trait;
    use pairlink_wire::{decode, encode, ProtocolMessage, PROTOCOL_VERSION};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn code(s: &str) -> PairingCode {
        PairingCode::new(s).unwrap()
    }

    fn client_for(hub: &MemoryHub, config: ClientConfig) -> RemoteClient {
        RemoteClient::new(Arc::new(hub.clone()), config)
    }

    /// Next protocol message seen by the scripted desktop
    async fn next_message(desktop: &mut TransportHandle) -> ProtocolMessage {
        loop {
            match desktop.next_event().await {
                TransportEvent::Frame(text) => return decode(&text).unwrap(),
                TransportEvent::Closed { reason } => panic!("desktop channel closed: {}", reason),
                _ => continue,
            }
        }
    }

    /// Join as the desktop, consume the handshake and optionally ack it
    async fn join_desktop(hub: &MemoryHub, room: &str, ack: bool) -> TransportHandle {
        let mut desktop = hub.join(&code(room)).unwrap();
        assert!(matches!(next_message(&mut desktop).await, ProtocolMessage::Hello { .. }));
        assert!(matches!(
            next_message(&mut desktop).await,
            ProtocolMessage::VersionNegotiate { .. }
        ));
        if ack {
            desktop
                .send(&ProtocolMessage::VersionAck {
                    compatible: true,
                    protocol_version: PROTOCOL_VERSION,
                    reason: None,
                })
                .unwrap();
        }
        desktop
    }

    async fn connected_pair(hub: &MemoryHub, config: ClientConfig) -> (RemoteClient, TransportHandle) {
        let client = client_for(hub, config);
        client.connect("room").await.unwrap();
        let desktop = join_desktop(hub, "room", true).await;
        client
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();
        (client, desktop)
    }

    /// Sending side of a scripted channel; records every frame the client sends
    #[derive(Clone, Default)]
    struct ScriptedLink {
        sent: Arc<Mutex<Vec<String>>>,
        present: Arc<AtomicBool>,
    }

    impl ScriptedLink {
        fn sent(&self) -> Vec<ProtocolMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|frame| decode(frame).unwrap())
                .collect()
        }
    }

    impl PeerLink for ScriptedLink {
        fn send_frame(&self, frame: String) -> Result<()> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        fn peer_present(&self) -> bool {
            self.present.load(Ordering::SeqCst)
        }

        fn close(&self) {}
    }

    /// Transport handing out one channel whose events the test injects
    struct ScriptedTransport {
        channel: Mutex<Option<(ScriptedLink, mpsc::UnboundedReceiver<TransportEvent>)>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self, _code: &PairingCode) -> Result<TransportHandle> {
            let (link, events) = self
                .channel
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| BridgeError::TransportInit("scripted channel already used".into()))?;
            Ok(TransportHandle::new(Box::new(link), events))
        }
    }

    fn scripted() -> (
        ScriptedTransport,
        ScriptedLink,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let link = ScriptedLink::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport {
            channel: Mutex::new(Some((link.clone(), events_rx))),
        };
        (transport, link, events_tx)
    }

    fn frame(message: &ProtocolMessage) -> TransportEvent {
        TransportEvent::Frame(encode(message).unwrap())
    }

    fn compatible_ack() -> ProtocolMessage {
        ProtocolMessage::VersionAck {
            compatible: true,
            protocol_version: PROTOCOL_VERSION,
            reason: None,
        }
    }

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |value| sink.lock().unwrap().push(value))
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_ack_connects() {
        let hub = MemoryHub::new();
        let client = client_for(&hub, ClientConfig::default());
        let (connectivity, sink) = recorder::<bool>();
        client.on_connectivity(sink);

        client.connect(" room ").await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_eq!(client.current_pairing_code(), Some(code("room")));

        let _desktop = join_desktop(&hub, "room", true).await;
        client
            .wait_until_connected(Duration::from_millis(500))
            .await
            .unwrap();
        assert!(client.is_connected());
        assert_eq!(*connectivity.lock().unwrap(), vec![true]);

        // Same code with the peer present is a no-op
        client.connect("room").await.unwrap();
        assert!(client.is_connected());
        assert_eq!(hub.members(&code("room")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_connects_after_grace() {
        let hub = MemoryHub::new();
        let client = client_for(&hub, ClientConfig::default());
        client.connect("room").await.unwrap();

        let _desktop = join_desktop(&hub, "room", false).await;
        assert_eq!(client.state(), ConnectionState::AwaitingHandshake);

        client
            .wait_until_connected(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_prompt_requires_connection() {
        let hub = MemoryHub::new();
        let client = client_for(&hub, ClientConfig::default());
        assert_eq!(
            client.send_prompt(vec![ChatMessage::user("hi")]).await.err(),
            Some(BridgeError::NotConnected)
        );

        client.connect("room").await.unwrap();
        let mut desktop = join_desktop(&hub, "room", false).await;
        assert_eq!(
            client.send_prompt(vec![ChatMessage::user("hi")]).await.err(),
            Some(BridgeError::NotConnected)
        );

        let silence = tokio::time::timeout(Duration::from_millis(100), next_message(&mut desktop)).await;
        assert!(silence.is_err(), "no frame may reach the peer");
    }

    #[tokio::test]
    async fn test_at_most_one_handle_open() {
        let hub = MemoryHub::new();
        let client = client_for(&hub, ClientConfig::default());
        let open = |hub: &MemoryHub| hub.members(&code("a")) + hub.members(&code("b"));

        client.connect("a").await.unwrap();
        assert_eq!(open(&hub), 1);
        client.connect("b").await.unwrap();
        assert_eq!(open(&hub), 1);
        assert_eq!(hub.members(&code("b")), 1);
        client.connect("a").await.unwrap();
        assert_eq!(open(&hub), 1);
        client.disconnect().await.unwrap();
        assert_eq!(open(&hub), 0);
        client.disconnect().await.unwrap();
        assert_eq!(open(&hub), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_pairing_code_rejected() {
        let hub = MemoryHub::new();
        let client = client_for(&hub, ClientConfig::default());
        assert_eq!(client.connect("   ").await, Err(BridgeError::InvalidPairingCode));
        assert_eq!(client.current_pairing_code(), None);
    }

    #[tokio::test]
    async fn test_transport_failure_without_retry_is_returned() {
        let hub = MemoryHub::new();
        hub.fail_next_opens(1);
        let client = client_for(&hub, ClientConfig::default());
        assert!(matches!(
            client.connect("room").await,
            Err(BridgeError::TransportInit(_))
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_streams_reasoning_then_answer() {
        let hub = MemoryHub::new();
        let (client, mut desktop) = connected_pair(&hub, ClientConfig::default()).await;

        let conversation = vec![
            ChatMessage::new(pairlink_wire::Role::System, "be brief"),
            ChatMessage::user("why is the sky blue?"),
        ];
        let mut stream = client.send_prompt(conversation.clone()).await.unwrap();

        let id = match next_message(&mut desktop).await {
            ProtocolMessage::Prompt { id, messages, .. } => {
                assert_eq!(messages, conversation);
                id
            }
            other => panic!("expected prompt, got {:?}", other),
        };
        assert_eq!(id, stream.id());

        let frames = [
            ProtocolMessage::Start { id: id.clone() },
            ProtocolMessage::ReasoningToken { id: id.clone(), tok: "r1".into() },
            ProtocolMessage::ReasoningToken { id: id.clone(), tok: "r2".into() },
            ProtocolMessage::Token { id: id.clone(), tok: "a1".into() },
            ProtocolMessage::Token { id: id.clone(), tok: "a2".into() },
            ProtocolMessage::Token { id: id.clone(), tok: "a3".into() },
            ProtocolMessage::End { id: id.clone() },
        ];
        for frame in &frames {
            desktop.send(frame).unwrap();
        }

        assert_eq!(stream.collect_text().await.unwrap(), "<think>r1r2</think>a1a2a3");
        let transcript = stream.transcript().unwrap();
        assert_eq!(transcript.reasoning, "r1r2");
        assert_eq!(transcript.answer, "a1a2a3");
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_error_is_raised_verbatim() {
        let hub = MemoryHub::new();
        let (client, mut desktop) = connected_pair(&hub, ClientConfig::default()).await;
        let (errors, sink) = recorder::<String>();
        client.on_error(sink);

        let mut stream = client.send_prompt(vec![ChatMessage::user("hi")]).await.unwrap();
        let id = match next_message(&mut desktop).await {
            ProtocolMessage::Prompt { id, .. } => id,
            other => panic!("expected prompt, got {:?}", other),
        };
        desktop
            .send(&ProtocolMessage::Error {
                id: Some(id),
                message: "model not loaded".into(),
            })
            .unwrap();
        assert_eq!(
            stream.next_chunk().await,
            Some(Err(BridgeError::PromptError("model not loaded".into())))
        );

        desktop
            .send(&ProtocolMessage::Error {
                id: None,
                message: "gpu overheated".into(),
            })
            .unwrap();
        // Requests the client does not serve are ignored
        desktop.send(&ProtocolMessage::GetModel { id: None }).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*errors.lock().unwrap(), vec!["gpu overheated".to_string()]);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_timeout_keeps_session() {
        let hub = MemoryHub::new();
        let config = ClientConfig {
            prompt_timeout: Duration::from_secs(30),
            ..ClientConfig::default()
        };
        let (client, _desktop) = connected_pair(&hub, config).await;

        let mut stream = client.send_prompt(vec![ChatMessage::user("hi")]).await.unwrap();
        assert!(matches!(
            stream.next_chunk().await,
            Some(Err(BridgeError::PromptTimeout { .. }))
        ));
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_loss_fails_active_stream() {
        let hub = MemoryHub::new();
        let (client, mut desktop) = connected_pair(&hub, ClientConfig::default()).await;
        let (connectivity, sink) = recorder::<bool>();
        client.on_connectivity(sink);

        let mut stream = client.send_prompt(vec![ChatMessage::user("hi")]).await.unwrap();
        let id = match next_message(&mut desktop).await {
            ProtocolMessage::Prompt { id, .. } => id,
            other => panic!("expected prompt, got {:?}", other),
        };
        desktop.send(&ProtocolMessage::Start { id: id.clone() }).unwrap();
        desktop.send(&ProtocolMessage::Token { id, tok: "par".into() }).unwrap();
        assert_eq!(stream.next_chunk().await, Some(Ok("par".to_string())));

        drop(desktop);
        assert!(matches!(
            stream.next_chunk().await,
            Some(Err(BridgeError::PromptLost(_)))
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(*connectivity.lock().unwrap(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_fails_stream_and_is_idempotent() {
        let hub = MemoryHub::new();
        let (client, _desktop) = connected_pair(&hub, ClientConfig::default()).await;

        let mut stream = client.send_prompt(vec![ChatMessage::user("hi")]).await.unwrap();
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();

        assert!(matches!(
            stream.next_chunk().await,
            Some(Err(BridgeError::PromptLost(_)))
        ));
        assert_eq!(hub.members(&code("room")), 1);
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_retry_mid_countdown_stops_callbacks() {
        let hub = MemoryHub::new();
        let config = ClientConfig {
            retry: RetryPolicy {
                initial_delay: Duration::from_secs(10),
                ..RetryPolicy::default()
            },
            ..ClientConfig::default()
        };
        let client = client_for(&hub, config);
        client.enable_auto_retry().await.unwrap();
        client.connect("room").await.unwrap();
        let desktop = join_desktop(&hub, "room", true).await;
        client
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();

        let (statuses, sink) = recorder::<RetryStatus>();
        client.on_retry_status(sink);

        drop(desktop);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        {
            let seen = statuses.lock().unwrap();
            assert_eq!(
                seen[0],
                RetryStatus {
                    attempt: 1,
                    next_retry_ms: Some(10_000),
                    retrying: true,
                }
            );
            assert!(seen.len() >= 3, "countdown ticks expected, got {:?}", *seen);
            assert!(seen.iter().all(|s| s.retrying));
        }

        client.disable_auto_retry().await.unwrap();
        let published = {
            let seen = statuses.lock().unwrap();
            assert_eq!(*seen.last().unwrap(), RetryStatus::idle(0));
            seen.len()
        };

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(statuses.lock().unwrap().len(), published);
        // The retry never fired, so no new handle was opened
        assert_eq!(hub.members(&code("room")), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reconnects_after_peer_loss() {
        let hub = MemoryHub::new();
        let client = client_for(&hub, ClientConfig::default());
        client.enable_auto_retry().await.unwrap();
        client.connect("room").await.unwrap();
        let desktop = join_desktop(&hub, "room", true).await;
        client
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();

        drop(desktop);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        // The retry replaced the stale handle with a fresh one
        assert_eq!(hub.members(&code("room")), 1);

        let _desktop = join_desktop(&hub, "room", true).await;
        client
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_surfaced_once() {
        let hub = MemoryHub::new();
        hub.fail_next_opens(100);
        let config = ClientConfig {
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(100),
                max_attempts: 2,
                ..RetryPolicy::default()
            },
            ..ClientConfig::default()
        };
        let client = client_for(&hub, config);
        let (errors, error_sink) = recorder::<String>();
        let (statuses, status_sink) = recorder::<RetryStatus>();
        client.on_error(error_sink);
        client.on_retry_status(status_sink);

        client.enable_auto_retry().await.unwrap();
        client.connect("room").await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            *errors.lock().unwrap(),
            vec![BridgeError::RetryExhausted { attempts: 2 }.to_string()]
        );
        let published = {
            let seen = statuses.lock().unwrap();
            assert_eq!(*seen.last().unwrap(), RetryStatus::idle(2));
            assert!(seen.iter().all(|s| s.attempt <= 2));
            seen.len()
        };

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(statuses.lock().unwrap().len(), published);
        assert_eq!(hub.members(&code("room")), 0);

        // An explicit connect re-arms retry
        hub.fail_next_opens(0);
        client.connect("room").await.unwrap();
        assert_eq!(hub.members(&code("room")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_continues_until_exhausted_when_no_peer_returns() {
        let hub = MemoryHub::new();
        let config = ClientConfig {
            peer_discovery_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(100),
                max_attempts: 2,
                ..RetryPolicy::default()
            },
            ..ClientConfig::default()
        };
        let client = client_for(&hub, config);
        client.enable_auto_retry().await.unwrap();
        client.connect("room").await.unwrap();
        let desktop = join_desktop(&hub, "room", true).await;
        client
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();

        let (errors, error_sink) = recorder::<String>();
        let (statuses, status_sink) = recorder::<RetryStatus>();
        client.on_error(error_sink);
        client.on_retry_status(status_sink);

        drop(desktop);
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(
            *errors.lock().unwrap(),
            vec![BridgeError::RetryExhausted { attempts: 2 }.to_string()]
        );
        let published = {
            let seen = statuses.lock().unwrap();
            assert!(seen.contains(&RetryStatus::awaiting_peer(1)));
            assert!(seen.contains(&RetryStatus::awaiting_peer(2)));
            assert_eq!(*seen.last().unwrap(), RetryStatus::idle(2));
            seen.len()
        };
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_eq!(hub.members(&code("room")), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(statuses.lock().unwrap().len(), published);

        // The last reopened channel still accepts a late peer
        let _desktop = join_desktop(&hub, "room", true).await;
        client
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_rejoining_before_retry_reuses_channel() {
        let hub = MemoryHub::new();
        let client = client_for(&hub, ClientConfig::default());
        client.enable_auto_retry().await.unwrap();
        client.connect("room").await.unwrap();
        let desktop = join_desktop(&hub, "room", true).await;
        client
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();

        let (statuses, sink) = recorder::<RetryStatus>();
        client.on_retry_status(sink);

        drop(desktop);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(statuses.lock().unwrap().last().unwrap().retrying);

        // No ack: the retry timer fires while the peer is back and does nothing
        let _desktop = join_desktop(&hub, "room", false).await;
        client
            .wait_until_connected(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(hub.members(&code("room")), 2);

        let published = {
            let seen = statuses.lock().unwrap();
            assert_eq!(*seen.last().unwrap(), RetryStatus::idle(0));
            seen.len()
        };
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(statuses.lock().unwrap().len(), published);
        assert_eq!(hub.members(&code("room")), 2);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_frames_do_not_break_stream() {
        let (transport, link, events) = scripted();
        let client = RemoteClient::new(Arc::new(transport), ClientConfig::default());
        client.connect("room").await.unwrap();

        link.present.store(true, Ordering::SeqCst);
        events.send(TransportEvent::PeerJoined).unwrap();
        events.send(frame(&compatible_ack())).unwrap();
        client
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();

        let mut stream = client.send_prompt(vec![ChatMessage::user("hi")]).await.unwrap();
        let id = stream.id().to_string();

        events.send(frame(&ProtocolMessage::Start { id: id.clone() })).unwrap();
        events
            .send(frame(&ProtocolMessage::Token { id: id.clone(), tok: "a".into() }))
            .unwrap();
        events
            .send(TransportEvent::Frame(r#"{"type":"telemetry","gpuTemp":71}"#.into()))
            .unwrap();
        events
            .send(TransportEvent::Frame(r#"{"type":"token"}"#.into()))
            .unwrap();
        events
            .send(frame(&ProtocolMessage::Token { id: id.clone(), tok: "b".into() }))
            .unwrap();
        events.send(frame(&ProtocolMessage::End { id })).unwrap();

        assert_eq!(stream.collect_text().await.unwrap(), "ab");
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_before_peer_joined_is_ignored() {
        let (transport, link, events) = scripted();
        let client = RemoteClient::new(Arc::new(transport), ClientConfig::default());
        client.connect("room").await.unwrap();

        events.send(frame(&compatible_ack())).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert!(link.sent().is_empty(), "no hello without a peer");

        link.present.store(true, Ordering::SeqCst);
        events.send(TransportEvent::PeerJoined).unwrap();
        events.send(frame(&compatible_ack())).unwrap();
        client
            .wait_until_connected(Duration::from_secs(1))
            .await
            .unwrap();

        let sent = link.sent();
        assert!(matches!(sent[0], ProtocolMessage::Hello { .. }));
        assert!(matches!(sent[1], ProtocolMessage::VersionNegotiate { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_ack_tears_down_without_retry() {
        let hub = MemoryHub::new();
        let client = client_for(&hub, ClientConfig::default());
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        client.on_error(move |message| {
            errors_tx.send(message).ok();
        });
        client.enable_auto_retry().await.unwrap();
        client.connect("room").await.unwrap();

        let mut desktop = join_desktop(&hub, "room", false).await;
        desktop
            .send(&ProtocolMessage::VersionAck {
                compatible: false,
                protocol_version: 9,
                reason: Some("update the phone app".into()),
            })
            .unwrap();

        let message = errors_rx.recv().await.unwrap();
        assert!(message.contains("update the phone app"));
        assert_eq!(desktop.next_event().await, TransportEvent::PeerLeft);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(hub.members(&code("room")), 1, "no reconnect after incompatibility");
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_info_round_trip() {
        let hub = MemoryHub::new();
        let (client, mut desktop) = connected_pair(&hub, ClientConfig::default()).await;
        assert_eq!(client.last_model_info(), None);

        let requester = client.clone();
        let pending = tokio::spawn(async move { requester.request_model_info().await });

        let id = match next_message(&mut desktop).await {
            ProtocolMessage::GetModel { id } => id,
            other => panic!("expected get_model, got {:?}", other),
        };
        desktop
            .send(&ProtocolMessage::ModelInfo {
                id,
                display_name: "Qwen 3 8B".into(),
                installed: true,
            })
            .unwrap();

        let expected = ModelInfo {
            display_name: "Qwen 3 8B".into(),
            installed: true,
        };
        assert_eq!(pending.await.unwrap(), Ok(expected.clone()));
        assert_eq!(client.last_model_info(), Some(expected));
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let hub = MemoryHub::new();
        let client = client_for(&hub, ClientConfig::default());
        client.connect("room").await.unwrap();
        assert_eq!(hub.members(&code("room")), 1);

        client.shutdown();
        let mut state = client.watch_state();
        while state.changed().await.is_ok() {}
        assert_eq!(hub.members(&code("room")), 0);
        assert_eq!(client.connect("room").await, Err(BridgeError::Shutdown));
    }
}
