//! Signaling relays.
//!
//! A relay scopes peers into rooms and fans every frame a peer sends out to
//! every other peer in the same room. The mesh treats it as an unordered,
//! best-effort broadcast medium.
//!
//! - [`MemoryHub`] / [`MemoryRelay`]: in-process, for single-process meshes
//!   and tests (configurable handshake latency and failure)
//! - [`TcpRelay`]: client for a [`RelayServer`] (newline-delimited JSON)
//!
//! TCP handshake: the client sends a [`RelayHello`] line and the join only
//! completes once the server answers with a [`RelayAck`] line. Lines longer
//! than [`MAX_FRAME_LEN`] close the connection on either side.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ghost_protocols::WireMessage;
use ghost_replica::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Longest line a TCP relay endpoint reads, newline included.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// A joined room: frames out via `tx`, frames in via `rx`.
///
/// `rx` yielding `None` means the relay dropped the link.
#[derive(Debug)]
pub struct RelayLink {
    pub endpoint: String,
    pub tx: mpsc::UnboundedSender<WireMessage>,
    pub rx: mpsc::UnboundedReceiver<WireMessage>,
}

/// Room-scoped broadcast bootstrap.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Stable identifier (address or name).
    fn endpoint(&self) -> &str;

    /// Handshake and join `room` as `peer`.
    async fn join(&self, room: &str, peer: PeerId) -> Result<RelayLink>;
}

type RoomMembers = Vec<(PeerId, u64, mpsc::UnboundedSender<WireMessage>)>;

/// In-process relay fabric shared by any number of [`MemoryRelay`]s.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    rooms: Arc<Mutex<HashMap<String, RoomMembers>>>,
    next_seat: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay endpoint on this hub.
    pub fn relay(&self, name: impl Into<String>) -> MemoryRelay {
        MemoryRelay {
            hub: self.clone(),
            name: name.into(),
            latency: Duration::ZERO,
            failing: Arc::new(Mutex::new(false)),
        }
    }

    /// Peers currently in `room`.
    pub fn members(&self, room: &str) -> Vec<PeerId> {
        self.rooms
            .lock()
            .get(room)
            .map(|m| m.iter().map(|(p, _, _)| *p).collect())
            .unwrap_or_default()
    }

    /// Drop `peer`'s link in every room, as if its channel failed.
    pub fn sever(&self, peer: PeerId) -> bool {
        let mut rooms = self.rooms.lock();
        let mut found = false;
        for members in rooms.values_mut() {
            let before = members.len();
            members.retain(|(p, _, _)| *p != peer);
            found |= members.len() != before;
        }
        found
    }

    fn fan_out(&self, room: &str, from: PeerId, msg: &WireMessage) {
        let mut rooms = self.rooms.lock();
        if let Some(members) = rooms.get_mut(room) {
            members.retain(|(peer, _, tx)| *peer == from || tx.send(msg.clone()).is_ok());
        }
    }

    fn leave(&self, room: &str, seat: u64) {
        let mut rooms = self.rooms.lock();
        if let Some(members) = rooms.get_mut(room) {
            members.retain(|(_, s, _)| *s != seat);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }
}

/// One named endpoint on a [`MemoryHub`].
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    hub: MemoryHub,
    name: String,
    latency: Duration,
    failing: Arc<Mutex<bool>>,
}

impl MemoryRelay {
    /// Delay every handshake by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make handshakes fail (or succeed again). Shared by clones.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn join(&self, room: &str, peer: PeerId) -> Result<RelayLink> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if *self.failing.lock() {
            return Err(Error::Transport(format!("relay {} refused handshake", self.name)));
        }

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();

        let seat = self.hub.next_seat.fetch_add(1, Ordering::Relaxed);
        self.hub
            .rooms
            .lock()
            .entry(room.to_string())
            .or_default()
            .push((peer, seat, in_tx));
        debug!("{} joined room {} on {}", peer, room, self.name);

        let hub = self.hub.clone();
        let room = room.to_string();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                hub.fan_out(&room, peer, &msg);
            }
            hub.leave(&room, seat);
            debug!("{} left room {}", peer, room);
        });

        Ok(RelayLink {
            endpoint: self.name.clone(),
            tx: out_tx,
            rx: in_rx,
        })
    }
}

/// First line a client sends to a [`RelayServer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayHello {
    pub room: String,
    pub peer: PeerId,
}

/// Server reply to a [`RelayHello`], sent once the client is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayAck {
    pub room: String,
    /// Connections in the room, the new one included.
    pub members: usize,
}

/// Read one line of at most [`MAX_FRAME_LEN`] bytes into `line`.
///
/// Returns 0 at end of stream. An oversized line is an `InvalidData` error.
async fn read_frame<R>(reader: &mut R, line: &mut String) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let n = (&mut *reader).take(MAX_FRAME_LEN as u64).read_line(line).await?;
    if n == MAX_FRAME_LEN && !line.ends_with('\n') {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame exceeds {} bytes", MAX_FRAME_LEN),
        ));
    }
    Ok(n)
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Client for a TCP relay.
#[derive(Debug, Clone)]
pub struct TcpRelay {
    addr: String,
}

impl TcpRelay {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl SignalingRelay for TcpRelay {
    fn endpoint(&self) -> &str {
        &self.addr
    }

    async fn join(&self, room: &str, peer: PeerId) -> Result<RelayLink> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::Transport(format!("connect {}: {}", self.addr, e)))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let hello = RelayHello {
            room: room.to_string(),
            peer,
        };
        write_json(&mut writer, &hello).await?;

        let mut line = String::new();
        if read_frame(&mut reader, &mut line).await? == 0 {
            return Err(Error::Transport(format!("{} closed before acknowledging", self.addr)));
        }
        let ack: RelayAck = serde_json::from_str(line.trim_end())
            .map_err(|e| Error::Transport(format!("bad ack from {}: {}", self.addr, e)))?;
        if ack.room != room {
            return Err(Error::Transport(format!(
                "{} acknowledged room {:?}, asked for {:?}",
                self.addr, ack.room, room
            )));
        }
        debug!("Joined {} on {} ({} members)", room, self.addr, ack.members);

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();

        let addr = self.addr.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, &mut line).await {
                    Ok(0) => {
                        info!("Relay {} closed the link", addr);
                        break;
                    }
                    Ok(_) => match WireMessage::decode_line(&line) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping bad frame from {}: {}", addr, e),
                    },
                    Err(e) => {
                        warn!("Read error from relay {}: {}", addr, e);
                        break;
                    }
                }
            }
        });

        let addr = self.addr.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let line = match msg.encode_line() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!("Write error to relay {}: {}", addr, e);
                    break;
                }
            }
        });

        Ok(RelayLink {
            endpoint: self.addr.clone(),
            tx: out_tx,
            rx: in_rx,
        })
    }
}

#[derive(Default)]
struct ServerState {
    next_conn: u64,
    rooms: HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>,
}

/// Room-scoped fan-out server for [`TcpRelay`] clients.
///
/// Frames are forwarded as opaque lines; decoding is left to peers.
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<Mutex<ServerState>>,
}

impl RelayServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(ServerState::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        info!("Relay listening on {}", self.listener.local_addr()?);
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(state, stream).await {
                            warn!("Relay connection {} error: {}", addr, e);
                        }
                    });
                }
                Err(e) => warn!("Accept error: {}", e),
            }
        }
    }

    async fn handle_connection(state: Arc<Mutex<ServerState>>, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut line = String::new();
        if read_frame(&mut reader, &mut line).await? == 0 {
            return Ok(());
        }
        let hello: RelayHello = serde_json::from_str(line.trim_end())?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (conn, members) = {
            let mut s = state.lock();
            s.next_conn += 1;
            let conn = s.next_conn;
            let room = s.rooms.entry(hello.room.clone()).or_default();
            room.push((conn, tx));
            (conn, room.len())
        };
        let ack = RelayAck {
            room: hello.room.clone(),
            members,
        };
        if let Err(e) = write_json(&mut writer, &ack).await {
            Self::leave(&state, &hello.room, conn);
            return Err(e);
        }
        info!("{} joined relay room {}", hello.peer, hello.room);

        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match read_frame(&mut reader, &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if !line.ends_with('\n') {
                        line.push('\n');
                    }
                    let mut s = state.lock();
                    if let Some(members) = s.rooms.get_mut(&hello.room) {
                        members.retain(|(id, tx)| *id == conn || tx.send(line.clone()).is_ok());
                    }
                }
                Err(e) => {
                    debug!("Read error from {}: {}", hello.peer, e);
                    break;
                }
            }
        }

        Self::leave(&state, &hello.room, conn);
        writer_task.abort();
        info!("{} left relay room {}", hello.peer, hello.room);
        Ok(())
    }

    fn leave(state: &Mutex<ServerState>, room: &str, conn: u64) {
        let mut s = state.lock();
        if let Some(members) = s.rooms.get_mut(room) {
            members.retain(|(id, _)| *id != conn);
            if members.is_empty() {
                s.rooms.remove(room);
            }
        }
    }
}
