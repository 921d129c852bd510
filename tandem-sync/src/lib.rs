//! # tandem-sync — Realtime sync provider for collaborative fields
//!
//! Binds a CRDT document to a pub/sub channel and a snapshot store, so that
//! every client editing the same field converges on the same content.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────────┐   SyncMessage    ┌────────────────┐
//!  │  Session (A)   │ ◄──────────────► │  Session (B)   │
//!  │  driver task   │   via Channel    │  driver task   │
//!  └───────┬────────┘                  └───────┬────────┘
//!          │                                   │
//!          ▼                                   ▼
//!  ┌────────────────┐                  ┌────────────────┐
//!  │ DocumentHandle │                  │ DocumentHandle │
//!  └───────┬────────┘                  └────────────────┘
//!          │ debounced, versioned
//!          ▼
//!  ┌────────────────────┐
//!  │ PersistenceGateway │  (MemoryStore / RocksStore)
//!  └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`provider`] — The Session: handshake, relay, presence, saving
//! - [`lifecycle`] — Shared Sessions with a teardown grace period
//! - [`protocol`] — Wire format of channel messages
//! - [`awareness`] — Ephemeral per-client presence
//! - [`transport`] — Channel abstraction, in-process hub, WebSocket relay
//! - [`storage`] — Snapshot stores and integrity checks
//! - [`persist`] — Save debouncing state machine
//! - [`reconnect`] — Reconnect backoff
//! - [`events`] — Host-facing event bus
//! - [`config`] — Timing configuration

pub mod awareness;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod persist;
pub mod protocol;
pub mod provider;
pub mod reconnect;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    identity_color, with_identity_color, AwarenessStore, AwarenessUpdate, Fields, COLOR_FIELD,
};
pub use config::{ConfigError, SyncConfig};
pub use events::{ErrorKind, EventBus, Listener, ListenerId, Mount, ProviderEvent};
pub use lifecycle::{SessionLease, SessionManager};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use provider::{Session, SessionBuilder, SessionStatus, SyncError, SyncPhase};
pub use storage::{
    MemoryStore, PersistenceGateway, ReplayVerifier, RocksConfig, RocksStore, SnapshotRecord,
    SnapshotVerifier, StoreError, Verdict, WriteOutcome,
};
pub use tandem_core::{ChangeOrigin, ClientId, DocumentHandle, DocumentId, YrsDocument};
pub use transport::{
    Channel, ChannelEvent, ConnectionStatus, LocalHub, RelayConfig, RelayServer, Transport,
    TransportError, WsTransport,
};
