//! WebSocket pub/sub relay and the matching client transport.
//!
//! The relay knows nothing about documents. It keeps named channels of
//! members and forwards opaque payloads to every member except the sender:
//!
//! ```text
//! Client A ──┐                          ┌──▶ Client B
//!             ├── channel "doc-42" ─────┤
//! Client C ──┘   (tokio broadcast)      └──▶ Client C (not A)
//! ```
//!
//! Frames are bincode-encoded [`RelayFrame`]s in binary WebSocket messages.
//! A connection carries exactly one channel membership: the first frame
//! must be `Join`, answered with `Welcome`.

use super::{Channel, ChannelEvent, ConnectionStatus, Joined, Transport, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_core::ClientId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// How long a client waits for `Welcome` after sending `Join`
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side inbound event queue depth
const EVENT_CAPACITY: usize = 1024;

/// Relay wire frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// client → relay: enter `channel` as `member`
    Join { channel: String, member: ClientId },
    /// relay → client: join accepted; other members present
    Welcome { members: Vec<ClientId> },
    /// client → relay: fan out to the other members
    Publish { payload: Vec<u8> },
    /// relay → client
    Deliver { sender: ClientId, payload: Vec<u8> },
    MemberJoined(ClientId),
    MemberLeft(ClientId),
    /// client → relay: leave the channel and close
    Leave,
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(frame)
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay server
// ───────────────────────────────────────────────────────────────────

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per member before a lagging member starts losing them
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub active_channels: usize,
}

/// Encoded frame tagged with the member that caused it, so the origin's own
/// connection can skip it.
type Fanout = Arc<(ClientId, Vec<u8>)>;

struct RelayRoom {
    sender: broadcast::Sender<Fanout>,
    members: HashSet<ClientId>,
}

#[derive(Default)]
struct RelayCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_relayed: AtomicU64,
}

type RelayRooms = Arc<RwLock<HashMap<String, RelayRoom>>>;

/// The pub/sub relay.
pub struct RelayServer {
    listener: TcpListener,
    config: RelayConfig,
    rooms: RelayRooms,
    counters: Arc<RelayCounters>,
}

impl RelayServer {
    /// Bind the listening socket. Use port 0 to let the OS pick one.
    pub async fn bind(config: RelayConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self {
            listener,
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(RelayCounters::default()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever.
    pub async fn run(self) -> std::io::Result<()> {
        log::info!("Relay listening on {}", self.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let counters = self.counters.clone();
            let capacity = self.config.broadcast_capacity;

            tokio::spawn(async move {
                counters.total_connections.fetch_add(1, Ordering::Relaxed);
                counters.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) =
                    Self::handle_connection(stream, addr, rooms, counters.clone(), capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
                counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Handle for reading stats while `run` owns the server.
    pub fn stats_handle(&self) -> RelayStatsHandle {
        RelayStatsHandle {
            rooms: self.rooms.clone(),
            counters: self.counters.clone(),
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: RelayRooms,
        counters: Arc<RelayCounters>,
        capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // First frame must be Join
        let (channel, member) = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match RelayFrame::decode(&bytes)? {
                        RelayFrame::Join { channel, member } => break (channel, member),
                        other => {
                            log::warn!("Expected Join from {addr}, got {other:?}");
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            }
        };

        let (mut rx, members, room_sender) = {
            let mut rooms_w = rooms.write().await;
            let room = rooms_w.entry(channel.clone()).or_insert_with(|| RelayRoom {
                sender: broadcast::channel(capacity).0,
                members: HashSet::new(),
            });
            let members: Vec<ClientId> =
                room.members.iter().copied().filter(|m| *m != member).collect();
            room.members.insert(member);
            (room.sender.subscribe(), members, room.sender.clone())
        };

        log::info!("Member {member} joined channel '{channel}' from {addr}");

        // From here on the member is registered: every exit goes through cleanup
        let result = Self::serve_member(
            member,
            members,
            &room_sender,
            &mut rx,
            &mut ws_sender,
            &mut ws_receiver,
            &counters,
        )
        .await;

        // Cleanup: remove member, tell the others, drop empty channels
        {
            let mut rooms_w = rooms.write().await;
            if let Some(room) = rooms_w.get_mut(&channel) {
                room.members.remove(&member);
                if let Ok(left) = RelayFrame::MemberLeft(member).encode() {
                    let _ = room.sender.send(Arc::new((member, left)));
                }
                if room.members.is_empty() {
                    rooms_w.remove(&channel);
                    log::debug!("Channel '{channel}' removed (empty)");
                }
            }
        }
        log::info!("Member {member} left channel '{channel}'");

        result
    }

    /// Welcome the member, announce it, then relay until it goes away.
    async fn serve_member<S, R>(
        member: ClientId,
        members: Vec<ClientId>,
        room_sender: &broadcast::Sender<Fanout>,
        rx: &mut broadcast::Receiver<Fanout>,
        ws_sender: &mut S,
        ws_receiver: &mut R,
        counters: &RelayCounters,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        ws_sender
            .send(Message::Binary(RelayFrame::Welcome { members }.encode()?.into()))
            .await?;
        let _ = room_sender.send(Arc::new((member, RelayFrame::MemberJoined(member).encode()?)));

        Self::relay_loop(member, room_sender, rx, ws_sender, ws_receiver, counters).await
    }

    async fn relay_loop<S, R>(
        member: ClientId,
        room_sender: &broadcast::Sender<Fanout>,
        rx: &mut broadcast::Receiver<Fanout>,
        ws_sender: &mut S,
        ws_receiver: &mut R,
        counters: &RelayCounters,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match RelayFrame::decode(&bytes) {
                                Ok(RelayFrame::Publish { payload }) => {
                                    let frame = RelayFrame::Deliver { sender: member, payload }.encode()?;
                                    let _ = room_sender.send(Arc::new((member, frame)));
                                    counters.frames_relayed.fetch_add(1, Ordering::Relaxed);
                                }
                                Ok(RelayFrame::Leave) => return Ok(()),
                                Ok(other) => {
                                    log::debug!("Ignoring unexpected frame from {member}: {other:?}");
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {member}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {member}: {e}");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                fanout = rx.recv() => {
                    match fanout {
                        Ok(item) => {
                            // Don't echo back to the origin
                            if item.0 == member {
                                continue;
                            }
                            ws_sender.send(Message::Binary(item.1.clone().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Member {member} lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Read-only view of a running relay's statistics.
#[derive(Clone)]
pub struct RelayStatsHandle {
    rooms: RelayRooms,
    counters: Arc<RelayCounters>,
}

impl RelayStatsHandle {
    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            frames_relayed: self.counters.frames_relayed.load(Ordering::Relaxed),
            active_channels: self.rooms.read().await.len(),
        }
    }

    pub async fn members(&self, channel: &str) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .rooms
            .read()
            .await
            .get(channel)
            .map(|r| r.members.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

// ───────────────────────────────────────────────────────────────────
// Client transport
// ───────────────────────────────────────────────────────────────────

/// [`Transport`] that joins channels on a [`RelayServer`]. Each joined
/// channel owns one WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// `url` is the relay's WebSocket URL, e.g. `ws://127.0.0.1:9191`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn join(&self, channel: &str, member: ClientId) -> Result<Joined, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::JoinFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = RelayFrame::Join {
            channel: channel.to_string(),
            member,
        };
        ws_writer.send(Message::Binary(join.encode()?.into())).await?;

        let members = tokio::time::timeout(JOIN_TIMEOUT, async {
            while let Some(msg) = ws_reader.next().await {
                if let Message::Binary(data) = msg? {
                    let bytes: Vec<u8> = data.into();
                    if let RelayFrame::Welcome { members } = RelayFrame::decode(&bytes)? {
                        return Ok(members);
                    }
                }
            }
            Err(TransportError::ConnectionClosed)
        })
        .await
        .map_err(|_| TransportError::JoinFailed("timed out waiting for welcome".into()))??;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

        // Writer task: forward outgoing frames to the WebSocket
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: translate relay frames into channel events
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayFrame::decode(&bytes) {
                            Ok(RelayFrame::Deliver { sender, payload }) => {
                                Some(ChannelEvent::Message { sender, payload })
                            }
                            Ok(RelayFrame::MemberJoined(id)) => Some(ChannelEvent::MemberJoined(id)),
                            Ok(RelayFrame::MemberLeft(id)) => Some(ChannelEvent::MemberLeft(id)),
                            Ok(other) => {
                                log::debug!("Ignoring unexpected relay frame: {other:?}");
                                None
                            }
                            Err(e) => {
                                log::warn!("Failed to decode relay frame: {e}");
                                None
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => None,
                };

                if let Some(evt) = event {
                    if events_tx.send(evt).await.is_err() {
                        return;
                    }
                }
            }

            // Connection lost
            let _ = events_tx
                .send(ChannelEvent::Status(ConnectionStatus::Disconnected))
                .await;
        });

        log::info!("Joined relay channel '{channel}' as {member} ({} others)", members.len());

        Ok(Joined {
            channel: Box::new(WsChannel {
                name: channel.to_string(),
                outgoing: Mutex::new(Some(out_tx)),
                reader,
                writer,
            }),
            events: events_rx,
            members,
        })
    }
}

struct WsChannel {
    name: String,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsChannel {
    fn sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.outgoing.lock().ok().and_then(|o| o.clone())
    }
}

#[async_trait]
impl Channel for WsChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::NotJoined)?;
        let frame = RelayFrame::Publish { payload }.encode()?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn leave(&self) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::NotJoined)?;
        self.reader.abort();
        let result = tx
            .send(RelayFrame::Leave.encode()?)
            .await
            .map_err(|_| TransportError::ConnectionClosed);
        // Dropping the last sender lets the writer flush and close
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.take();
        }
        result
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.reader.abort();
        if let Ok(mut outgoing) = self.outgoing.lock() {
            if outgoing.take().is_none() {
                return;
            }
        }
        // Never left cleanly: the relay sees the socket close instead
        self.writer.abort();
    }
}
