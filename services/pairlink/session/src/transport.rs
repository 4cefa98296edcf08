//! Peer channels keyed by a pairing code.
//!
//! The session only depends on the event contract defined here: a
//! [`Transport`] opens a [`TransportHandle`] bound to a [`PairingCode`], the
//! handle reports [`TransportEvent`]s and accepts outgoing text frames, and
//! dropping the handle tears the channel down.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryHub`]: in-process rendezvous rooms, for embedding and tests
//! - [`RelayTransport`]: newline-delimited frames over TCP through the
//!   rendezvous relay in [`crate::relay`]

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use pairlink_wire::{encode, encode_relay_frame, parse_relay_frame, ProtocolMessage, RelayFrame};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Opaque rendezvous room identifier supplied by the user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairingCode(String);

impl PairingCode {
    /// Validate and wrap a pairing code; surrounding whitespace is ignored
    pub fn new(code: impl Into<String>) -> Result<Self> {
        let code = code.into();
        let trimmed = code.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::InvalidPairingCode);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The code as text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events reported by an open peer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer is present in the room
    PeerJoined,
    /// The peer left the room; the channel itself stays open
    PeerLeft,
    /// A text frame from the peer
    Frame(String),
    /// The channel is gone and will deliver nothing further
    Closed {
        /// Why the channel closed
        reason: String,
    },
}

/// Sending half of an open peer channel
pub trait PeerLink: Send + Sync {
    /// Queue a text frame for the peer
    fn send_frame(&self, frame: String) -> Result<()>;
    /// Whether a peer is currently present on the channel
    fn peer_present(&self) -> bool;
    /// Tear the channel down; must be idempotent
    fn close(&self);
}

/// An open peer channel. Dropping it closes the channel.
pub struct TransportHandle {
    link: Box<dyn PeerLink>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    /// Assemble a handle from a link and its event stream
    pub fn new(link: Box<dyn PeerLink>, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self { link, events }
    }

    /// Encode and send a protocol message
    pub fn send(&self, message: &ProtocolMessage) -> Result<()> {
        let frame = encode(message).map_err(|e| BridgeError::Send(e.to_string()))?;
        trace!("Sending {} frame", message.tag());
        self.link.send_frame(frame)
    }

    /// Whether a peer is currently present
    pub fn peer_present(&self) -> bool {
        self.link.peer_present()
    }

    /// Wait for the next event; a dropped event source reads as `Closed`
    pub async fn next_event(&mut self) -> TransportEvent {
        self.events.recv().await.unwrap_or(TransportEvent::Closed {
            reason: "event stream ended".to_string(),
        })
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.link.close();
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("peer_present", &self.link.peer_present())
            .finish()
    }
}

/// Factory for peer channels
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a channel bound to the room named by `code`
    async fn open(&self, code: &PairingCode) -> Result<TransportHandle>;
}

// ---------------------------------------------------------------------------
// In-process rendezvous
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RoomMember {
    id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Debug, Default)]
struct HubState {
    rooms: HashMap<String, Vec<RoomMember>>,
    next_member: u64,
    failing_opens: u32,
}

/// In-process rendezvous where each room holds at most two members
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the room for `code`, announcing each member to the other
    pub fn join(&self, code: &PairingCode) -> Result<TransportHandle> {
        let mut state = self.lock();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(BridgeError::TransportInit(format!(
                "room {} unavailable",
                code
            )));
        }

        let id = state.next_member;
        state.next_member += 1;

        let room = state.rooms.entry(code.as_str().to_string()).or_default();
        if room.len() >= 2 {
            return Err(BridgeError::TransportInit(format!("room {} is full", code)));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Some(other) = room.first() {
            other.events.send(TransportEvent::PeerJoined).ok();
            events_tx.send(TransportEvent::PeerJoined).ok();
        }
        room.push(RoomMember {
            id,
            events: events_tx,
        });
        debug!("Member {} joined in-memory room {}", id, code);

        let link = MemoryLink {
            hub: self.clone(),
            room: code.as_str().to_string(),
            member: id,
            closed: AtomicBool::new(false),
        };
        Ok(TransportHandle::new(Box::new(link), events_rx))
    }

    /// Number of open handles in the room for `code`
    pub fn members(&self, code: &PairingCode) -> usize {
        self.lock()
            .rooms
            .get(code.as_str())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Make the next `count` opens fail with a transport error
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    fn leave(&self, room: &str, member: u64) {
        let mut state = self.lock();
        if let Some(members) = state.rooms.get_mut(room) {
            members.retain(|m| m.id != member);
            for other in members.iter() {
                other.events.send(TransportEvent::PeerLeft).ok();
            }
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
        debug!("Member {} left in-memory room {}", member, room);
    }
}

#[async_trait]
impl Transport for MemoryHub {
    async fn open(&self, code: &PairingCode) -> Result<TransportHandle> {
        self.join(code)
    }
}

struct MemoryLink {
    hub: MemoryHub,
    room: String,
    member: u64,
    closed: AtomicBool,
}

impl PeerLink for MemoryLink {
    fn send_frame(&self, frame: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Send("channel closed".to_string()));
        }
        let state = self.hub.lock();
        let other = state
            .rooms
            .get(&self.room)
            .and_then(|members| members.iter().find(|m| m.id != self.member))
            .ok_or_else(|| BridgeError::Send("no peer in room".to_string()))?;
        other
            .events
            .send(TransportEvent::Frame(frame))
            .map_err(|_| BridgeError::Send("peer went away".to_string()))
    }

    fn peer_present(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.hub
            .lock()
            .rooms
            .get(&self.room)
            .map(|members| members.iter().any(|m| m.id != self.member))
            .unwrap_or(false)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hub.leave(&self.room, self.member);
        }
    }
}

// ---------------------------------------------------------------------------
// TCP relay
// ---------------------------------------------------------------------------

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address (host names are resolved)
pub async fn connect_tcp(addr: &str) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Peer channel through the rendezvous relay over TCP
#[derive(Debug, Clone)]
pub struct RelayTransport {
    relay_addr: String,
    connect_timeout: Duration,
}

impl RelayTransport {
    /// Transport dialing the relay at `relay_addr` (`host:port`)
    pub fn new(relay_addr: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Override the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn open(&self, code: &PairingCode) -> Result<TransportHandle> {
        let stream = tokio::time::timeout(self.connect_timeout, connect_tcp(&self.relay_addr))
            .await
            .map_err(|_| {
                BridgeError::TransportInit(format!("timed out dialing relay {}", self.relay_addr))
            })?
            .map_err(|e| {
                BridgeError::TransportInit(format!("relay {} unreachable: {}", self.relay_addr, e))
            })?;
        stream.set_nodelay(true).ok();
        info!("Connected to relay {} for room {}", self.relay_addr, code);

        let (read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(AtomicBool::new(false));

        // The join line is queued first so it precedes any protocol traffic
        let join = encode_relay_frame(&RelayFrame::RelayJoin {
            room: code.as_str().to_string(),
        });
        out_tx
            .send(join)
            .map_err(|_| BridgeError::TransportInit("writer unavailable".to_string()))?;

        let writer = tokio::spawn(async move {
            while let Some(mut line) = out_rx.recv().await {
                line.push('\n');
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
        });

        let reader_peer = peer.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let event = match parse_relay_frame(&line) {
                            Some(RelayFrame::RelayPeerJoined) => {
                                reader_peer.store(true, Ordering::SeqCst);
                                TransportEvent::PeerJoined
                            }
                            Some(RelayFrame::RelayPeerLeft) => {
                                reader_peer.store(false, Ordering::SeqCst);
                                TransportEvent::PeerLeft
                            }
                            Some(RelayFrame::RelayRoomFull) => break "room is full".to_string(),
                            Some(RelayFrame::RelayJoin { .. }) => continue,
                            None => TransportEvent::Frame(line),
                        };
                        if events_tx.send(event).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break "relay closed the connection".to_string(),
                    Err(e) => break format!("relay read failed: {}", e),
                }
            };
            reader_peer.store(false, Ordering::SeqCst);
            events_tx.send(TransportEvent::Closed { reason }).ok();
        });

        let link = RelayLink {
            out_tx,
            peer,
            tasks: Mutex::new(Some((reader, writer))),
        };
        Ok(TransportHandle::new(Box::new(link), events_rx))
    }
}

struct RelayLink {
    out_tx: mpsc::UnboundedSender<String>,
    peer: Arc<AtomicBool>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl PeerLink for RelayLink {
    fn send_frame(&self, frame: String) -> Result<()> {
        self.out_tx
            .send(frame)
            .map_err(|_| BridgeError::Send("relay connection closed".to_string()))
    }

    fn peer_present(&self) -> bool {
        self.peer.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((reader, writer)) = tasks {
            // Dropping both socket halves closes the connection
            reader.abort();
            writer.abort();
            self.peer.store(false, Ordering::SeqCst);
            debug!("Relay link closed");
        }
    }
}
