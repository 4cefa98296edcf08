//! Rendezvous relay pairing two TCP members per room.
//!
//! Each connection must open with a `relay_join` line naming its room. Once
//! two members share a room, both are told `relay_peer_joined`, and every
//! further line is forwarded verbatim to the other member. When a member
//! disconnects the survivor receives `relay_peer_left` and keeps its seat.

use pairlink_wire::{encode_relay_frame, parse_relay_frame, RelayFrame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Seat {
    member: u64,
    outbound: mpsc::UnboundedSender<String>,
}

#[derive(Debug, Default)]
struct Rooms {
    rooms: HashMap<String, Vec<Seat>>,
    next_member: u64,
}

type SharedRooms = Arc<Mutex<Rooms>>;

/// Accept relay members until the listener fails
pub async fn run_relay(listener: TcpListener) -> std::io::Result<()> {
    let rooms: SharedRooms = Arc::new(Mutex::new(Rooms::default()));
    info!("Relay listening on {}", listener.local_addr()?);

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        socket.set_nodelay(true).ok();
        let rooms = rooms.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_member(socket, peer_addr, rooms).await {
                debug!("Relay member {} ended with error: {}", peer_addr, e);
            }
        });
    }
}

async fn serve_member(
    socket: TcpStream,
    peer_addr: SocketAddr,
    rooms: SharedRooms,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let room = match lines.next_line().await? {
        Some(line) => match parse_relay_frame(&line) {
            Some(RelayFrame::RelayJoin { room }) if !room.trim().is_empty() => room,
            _ => {
                warn!("Relay member {} did not open with a join", peer_addr);
                return Ok(());
            }
        },
        None => return Ok(()),
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let member = match take_seat(&rooms, &room, out_tx) {
        Some(member) => member,
        None => {
            info!("Relay room {} is full, rejecting {}", room, peer_addr);
            let mut line = encode_relay_frame(&RelayFrame::RelayRoomFull);
            line.push('\n');
            write_half.write_all(line.as_bytes()).await?;
            return Ok(());
        }
    };
    info!("Relay member {} ({}) joined room {}", member, peer_addr, room);

    let result = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if parse_relay_frame(&line).is_some() {
                        debug!("Ignoring control frame from member {}", member);
                        continue;
                    }
                    forward(&rooms, &room, member, line);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
            Some(mut line) = out_rx.recv() => {
                line.push('\n');
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    break Err(e);
                }
            }
        }
    };

    leave_seat(&rooms, &room, member);
    info!("Relay member {} left room {}", member, room);
    result
}

fn take_seat(rooms: &SharedRooms, room: &str, outbound: mpsc::UnboundedSender<String>) -> Option<u64> {
    let mut rooms = rooms.lock().unwrap_or_else(PoisonError::into_inner);
    let member = rooms.next_member;
    let seats = rooms.rooms.entry(room.to_string()).or_default();
    if seats.len() >= 2 {
        return None;
    }

    if let Some(other) = seats.first() {
        let joined = encode_relay_frame(&RelayFrame::RelayPeerJoined);
        other.outbound.send(joined.clone()).ok();
        outbound.send(joined).ok();
    }
    seats.push(Seat { member, outbound });
    rooms.next_member += 1;
    Some(member)
}

fn forward(rooms: &SharedRooms, room: &str, from: u64, line: String) {
    let rooms = rooms.lock().unwrap_or_else(PoisonError::into_inner);
    match rooms
        .rooms
        .get(room)
        .and_then(|seats| seats.iter().find(|s| s.member != from))
    {
        Some(other) => {
            other.outbound.send(line).ok();
        }
        None => debug!("Dropping line from member {}: room {} has no peer", from, room),
    }
}

fn leave_seat(rooms: &SharedRooms, room: &str, member: u64) {
    let mut rooms = rooms.lock().unwrap_or_else(PoisonError::into_inner);
    let now_empty = match rooms.rooms.get_mut(room) {
        Some(seats) => {
            seats.retain(|s| s.member != member);
            let left = encode_relay_frame(&RelayFrame::RelayPeerLeft);
            for other in seats.iter() {
                other.outbound.send(left.clone()).ok();
            }
            seats.is_empty()
        }
        None => false,
    };
    if now_empty {
        rooms.rooms.remove(room);
    }
}
