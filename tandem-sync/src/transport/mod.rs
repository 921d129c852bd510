//! Realtime pub/sub channel abstraction.
//!
//! A [`Transport`] joins named channels; a joined [`Channel`] broadcasts
//! opaque payloads to every *other* member. Inbound traffic, membership
//! changes and connection loss arrive on one event stream. Nothing about
//! ordering or delivery is promised: payloads may be dropped, duplicated or
//! reordered, and the sync layer is built to cope.

pub mod hub;
pub mod ws;

use async_trait::async_trait;
use tandem_core::ClientId;
use tokio::sync::mpsc;

pub use hub::{HubStats, LocalHub};
pub use ws::{RelayConfig, RelayServer, RelayStats, RelayStatsHandle, WsTransport};

/// Connection state of a Session as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Events delivered to a channel member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    MemberJoined(ClientId),
    MemberLeft(ClientId),
    Message { sender: ClientId, payload: Vec<u8> },
    /// Transport-level connection change. `Disconnected` means the channel
    /// is gone and must be re-joined.
    Status(ConnectionStatus),
}

/// Result of a successful join.
pub struct Joined {
    pub channel: Box<dyn Channel>,
    pub events: mpsc::Receiver<ChannelEvent>,
    /// Other members present at join time
    pub members: Vec<ClientId>,
}

impl std::fmt::Debug for Joined {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Joined")
            .field("channel", &self.channel.name())
            .field("members", &self.members)
            .finish()
    }
}

/// Entry point to a pub/sub backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join `channel` as `member`.
    async fn join(&self, channel: &str, member: ClientId) -> Result<Joined, TransportError>;
}

/// One membership in a named channel. Dropping it leaves the channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Send `payload` to every other member.
    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn leave(&self) -> Result<(), TransportError>;
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    JoinFailed(String),
    SendFailed(String),
    /// Channel already left or dropped by the backend
    NotJoined,
    ConnectionClosed,
    Protocol(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JoinFailed(e) => write!(f, "Join failed: {e}"),
            Self::SendFailed(e) => write!(f, "Send failed: {e}"),
            Self::NotJoined => write!(f, "Not joined"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => TransportError::ConnectionClosed,
            other => TransportError::SendFailed(other.to_string()),
        }
    }
}
