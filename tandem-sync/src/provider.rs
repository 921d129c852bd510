//! The Session: one document, one awareness store, one channel membership.
//!
//! ```text
//!            host edits                         channel
//!                │                                 ▲ │
//!                ▼                                 │ ▼
//!         DocumentHandle ──on_change──▶ ┌─────────────────────┐
//!                ▲                      │   driver task       │──▶ PersistenceGateway
//!                └──────── apply ────── │  (one select! loop) │
//!                                       └──────────┬──────────┘
//!                                                  ▼
//!                                     status / synced / saved / error
//! ```
//!
//! Every input (host commands, document change notifications, channel
//! events, timers and save completions) is serialized through one driver
//! task, so no sync state is ever touched concurrently. Separate Sessions
//! share nothing and run independently.
//!
//! Handshake: on join the Session broadcasts its state vector (`SyncStep1`).
//! Each peer answers with the diff the Session is missing (`SyncStep2`,
//! targeted) and its own state vector (targeted `SyncStep1`), which the
//! Session answers in turn. Receiving the first `SyncStep2` completes the
//! round-trip. The same exchange re-runs on the resync interval to repair
//! anything the transport dropped.

use crate::awareness::{
    with_identity_color, AwarenessStore, AwarenessUpdate, Fields, AWARENESS_RENEW_INTERVAL,
    AWARENESS_TIMEOUT,
};
use crate::config::{ConfigError, SyncConfig};
use crate::events::{ErrorKind, EventBus, Listener, ListenerId, Mount, ProviderEvent};
use crate::persist::SaveScheduler;
use crate::protocol::{MessageType, SyncMessage};
use crate::reconnect::Backoff;
use crate::storage::{
    PersistenceGateway, ReplayVerifier, SnapshotRecord, SnapshotVerifier, StoreError, Verdict,
    WriteOutcome,
};
use crate::transport::{Channel, ChannelEvent, ConnectionStatus, Transport};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use tandem_core::{
    ChangeOrigin, ChangeSubscription, ClientId, DocError, DocumentChange, DocumentHandle,
    DocumentId,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// Write attempts made while tearing down before giving up
const TEARDOWN_SAVE_ATTEMPTS: usize = 3;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// Not in a channel yet
    Joining,
    /// State vector sent, waiting for the first reply
    Handshaking,
    Synced,
    /// Periodic re-handshake while already synced
    Resyncing,
}

/// Point-in-time view of a Session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub connection: ConnectionStatus,
    pub phase: SyncPhase,
    pub synced: bool,
    /// Other channel members
    pub peers: usize,
    pub persisted_version: u64,
    /// A change is waiting to be persisted or being persisted
    pub pending_save: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionStatus::Disconnected,
            phase: SyncPhase::Joining,
            synced: false,
            peers: 0,
            persisted_version: 0,
            pending_save: false,
        }
    }
}

/// Errors returned to the host when building or driving a Session.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    Config(ConfigError),
    Document(DocError),
    MissingTransport,
    /// The Session has already been torn down
    Closed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Invalid configuration: {e}"),
            Self::Document(e) => write!(f, "Document error: {e}"),
            Self::MissingTransport => write!(f, "No transport configured"),
            Self::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ConfigError> for SyncError {
    fn from(e: ConfigError) -> Self {
        SyncError::Config(e)
    }
}

impl From<DocError> for SyncError {
    fn from(e: DocError) -> Self {
        SyncError::Document(e)
    }
}

enum Command {
    DocumentChanged(DocumentChange),
    Presence(AwarenessUpdate),
    Attach {
        id: ListenerId,
        mount: Mount,
        listener: Listener,
    },
    Resync,
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

// ───────────────────────────────────────────────────────────────────
// Builder
// ───────────────────────────────────────────────────────────────────

/// Assembles and starts a [`Session`].
pub struct SessionBuilder {
    document_id: DocumentId,
    document: Arc<dyn DocumentHandle>,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn PersistenceGateway>>,
    verifier: Option<Arc<dyn SnapshotVerifier>>,
    config: SyncConfig,
    presence: Fields,
    listeners: Vec<(Option<Mount>, Listener)>,
}

impl SessionBuilder {
    pub fn new(document_id: DocumentId, document: Arc<dyn DocumentHandle>) -> Self {
        Self {
            document_id,
            document,
            transport: None,
            store: None,
            verifier: None,
            config: SyncConfig::default(),
            presence: Fields::new(),
            listeners: Vec::new(),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Without a store the Session never persists anything.
    pub fn store(mut self, store: Arc<dyn PersistenceGateway>) -> Self {
        self.store = Some(store);
        self
    }

    /// Snapshot check run after loading; defaults to [`ReplayVerifier`].
    pub fn verifier(mut self, verifier: Arc<dyn SnapshotVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial local presence. A `color` field is filled in from the client
    /// id when missing.
    pub fn presence(mut self, fields: Fields) -> Self {
        self.presence = fields;
        self
    }

    /// Listener registered before the Session starts, so it sees the very
    /// first events.
    pub fn listener(mut self, listener: Listener) -> Self {
        self.listeners.push((None, listener));
        self
    }

    pub fn mounted_listener(mut self, mount: Mount, listener: Listener) -> Self {
        self.listeners.push((Some(mount), listener));
        self
    }

    /// Validate, wire up and spawn the driver. Must be called inside a
    /// tokio runtime.
    pub fn spawn(self) -> Result<Arc<Session>, SyncError> {
        self.config.validate()?;
        let transport = self.transport.ok_or(SyncError::MissingTransport)?;

        let id = Uuid::new_v4();
        let client_id = self.document.client_id();
        let debounce = self.config.save_debounce;

        let events = Arc::new(EventBus::new());
        for (mount, listener) in self.listeners {
            match mount {
                Some(mount) => events.subscribe_mounted(mount, listener),
                None => events.subscribe(listener),
            };
        }

        let mut awareness = AwarenessStore::new(client_id);
        awareness.set_local(with_identity_color(self.presence, client_id));
        let awareness = Arc::new(Mutex::new(awareness));

        let status = Arc::new(RwLock::new(SessionStatus::default()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        // The observer only holds a weak sender: dropping the Session
        // closes the queue and lets the driver wind down.
        let weak = commands_tx.downgrade();
        let subscription = self.document.on_change(Box::new(move |change| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::DocumentChanged(change));
            }
        }))?;

        let verifier = match (&self.store, self.verifier) {
            (Some(_), Some(v)) => Some(v),
            (Some(_), None) => Some(Arc::new(ReplayVerifier::new()) as Arc<dyn SnapshotVerifier>),
            (None, _) => None,
        };

        let driver = Driver {
            session_id: id,
            document_id: self.document_id.clone(),
            client_id,
            document: self.document.clone(),
            awareness: awareness.clone(),
            events: events.clone(),
            status: status.clone(),
            transport,
            store: self.store,
            verifier,
            config: self.config,
            commands: commands_rx,
            _subscription: subscription,
            channel: None,
            channel_events: None,
            members: HashSet::new(),
            connection: ConnectionStatus::Disconnected,
            phase: SyncPhase::Joining,
            synced: false,
            saves: SaveScheduler::new(debounce),
            save_in_flight: None,
            flush_waiters: Vec::new(),
            snapshot_loaded: false,
            backoff: Backoff::new(),
            reconnect_at: None,
        };

        log::info!(
            "Session {id} starting for {} as client {client_id}",
            self.document_id
        );
        let handle = tokio::spawn(driver.run());

        Ok(Arc::new(Session {
            id,
            document_id: self.document_id,
            client_id,
            document: self.document,
            awareness,
            events,
            status,
            commands: commands_tx,
            driver: Mutex::new(Some(handle)),
        }))
    }
}

// ───────────────────────────────────────────────────────────────────
// Session handle
// ───────────────────────────────────────────────────────────────────

/// Host-side handle of a running Session.
pub struct Session {
    id: Uuid,
    document_id: DocumentId,
    client_id: ClientId,
    document: Arc<dyn DocumentHandle>,
    awareness: Arc<Mutex<AwarenessStore>>,
    events: Arc<EventBus>,
    status: Arc<RwLock<SessionStatus>>,
    commands: mpsc::UnboundedSender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Identity of this Session instance (not of the document).
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn document(&self) -> Arc<dyn DocumentHandle> {
        self.document.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_synced(&self) -> bool {
        self.status().synced
    }

    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        self.events.subscribe(listener)
    }

    /// Listener skipped once `mount` is unmounted.
    pub fn subscribe_mounted(&self, mount: Mount, listener: Listener) -> ListenerId {
        self.events.subscribe_mounted(mount, listener)
    }

    /// Mounted listener that is first told the current connection status
    /// (and `Synced(true)` when synced), then sees every later event. Use
    /// this when the Session may already be running.
    pub fn attach(&self, mount: Mount, listener: Listener) -> ListenerId {
        let id = self.events.allocate_id();
        let _ = self.commands.send(Command::Attach {
            id,
            mount,
            listener,
        });
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Set one local presence field (`Value::Null` clears it) and broadcast
    /// the change.
    pub fn set_presence_field(&self, key: impl Into<String>, value: Value) {
        let update = match self.awareness.lock() {
            Ok(mut store) => store.set_local_field(key, value),
            Err(_) => return,
        };
        let _ = self.commands.send(Command::Presence(update));
    }

    /// Replace the whole local presence entry, keeping the identity color
    /// when `fields` has none.
    pub fn set_presence(&self, fields: Fields) {
        let fields = with_identity_color(fields, self.client_id);
        let update = match self.awareness.lock() {
            Ok(mut store) => store.set_local(fields),
            Err(_) => return,
        };
        let _ = self.commands.send(Command::Presence(update));
    }

    /// Presence of every known client, this one included.
    pub fn awareness(&self) -> BTreeMap<ClientId, Fields> {
        self.awareness
            .lock()
            .map(|a| a.states())
            .unwrap_or_default()
    }

    /// Presence of one remote client.
    pub fn peer_presence(&self, client_id: ClientId) -> Option<Fields> {
        self.awareness
            .lock()
            .ok()
            .and_then(|a| a.peer(client_id).map(|e| e.fields.clone()))
    }

    /// Run the state-vector handshake now instead of waiting for the timer.
    pub fn request_resync(&self) {
        let _ = self.commands.send(Command::Resync);
    }

    /// Persist any pending change now and wait for the attempt to finish.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(tx))
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Real teardown: flush, leave the channel, stop every timer. Safe to
    /// call more than once.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let handle = self.driver.lock().ok().and_then(|mut d| d.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether the driver has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("document_id", &self.document_id)
            .field("client_id", &self.client_id)
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

enum SaveOutcome {
    Written(u64),
    Conflict {
        current_version: u64,
        latest: Option<SnapshotRecord>,
    },
    Failed(StoreError),
}

type SaveFuture = Pin<Box<dyn Future<Output = SaveOutcome> + Send>>;

struct Driver {
    session_id: Uuid,
    document_id: DocumentId,
    client_id: ClientId,
    document: Arc<dyn DocumentHandle>,
    awareness: Arc<Mutex<AwarenessStore>>,
    events: Arc<EventBus>,
    status: Arc<RwLock<SessionStatus>>,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn PersistenceGateway>>,
    verifier: Option<Arc<dyn SnapshotVerifier>>,
    config: SyncConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    _subscription: ChangeSubscription,

    channel: Option<Box<dyn Channel>>,
    channel_events: Option<mpsc::Receiver<ChannelEvent>>,
    members: HashSet<ClientId>,
    connection: ConnectionStatus,
    phase: SyncPhase,
    synced: bool,

    saves: SaveScheduler,
    save_in_flight: Option<SaveFuture>,
    flush_waiters: Vec<oneshot::Sender<()>>,
    snapshot_loaded: bool,

    backoff: Backoff,
    reconnect_at: Option<Instant>,
}

async fn next_event(rx: &mut Option<mpsc::Receiver<ChannelEvent>>) -> Option<ChannelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn poll_save(slot: &mut Option<SaveFuture>) -> SaveOutcome {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        self.connect().await;

        let period = self.config.resync_interval;
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renew = tokio::time::interval_at(
            Instant::now() + AWARENESS_RENEW_INTERVAL,
            AWARENESS_RENEW_INTERVAL,
        );
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let save_deadline = self.saves.deadline();
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown(reply)) => {
                            self.teardown().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            log::debug!("Session {} dropped without shutdown", self.session_id);
                            self.teardown().await;
                            return;
                        }
                    }
                }

                event = next_event(&mut self.channel_events) => {
                    match event {
                        Some(event) => self.handle_channel_event(event).await,
                        None => self.handle_disconnect("event stream closed"),
                    }
                }

                _ = resync.tick() => self.resync().await,

                _ = renew.tick() => self.renew_presence().await,

                outcome = poll_save(&mut self.save_in_flight) => {
                    self.save_in_flight = None;
                    self.finish_save(outcome);
                }

                _ = sleep_until_opt(save_deadline) => self.start_save(),

                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
            }
        }
    }

    // ─── Connection ───────────────────────────────────────────────────

    async fn connect(&mut self) {
        self.set_connection(ConnectionStatus::Connecting);
        self.phase = SyncPhase::Joining;

        if !self.snapshot_loaded {
            self.load_snapshot().await;
        }

        match self
            .transport
            .join(&self.document_id.channel, self.client_id)
            .await
        {
            Ok(joined) => {
                self.members = joined.members.iter().copied().collect();
                self.channel = Some(joined.channel);
                self.channel_events = Some(joined.events);
                self.backoff.reset();
                self.reconnect_at = None;
                log::info!(
                    "Session {} joined '{}' with {} peers",
                    self.session_id,
                    self.document_id.channel,
                    self.members.len()
                );
                self.set_connection(ConnectionStatus::Connected);

                let hello = self.awareness.lock().ok().map(|a| a.local_update());
                if let Some(update) = hello {
                    self.send_awareness(&update).await;
                }

                if self.members.is_empty() {
                    self.phase = SyncPhase::Synced;
                    self.set_synced(true);
                } else {
                    self.phase = SyncPhase::Handshaking;
                    self.send_step1(None).await;
                }
            }
            Err(e) => {
                self.report(ErrorKind::Transport, format!("join failed: {e}"));
                self.set_connection(ConnectionStatus::Disconnected);
                self.schedule_reconnect();
            }
        }
        self.publish_status();
    }

    fn handle_disconnect(&mut self, reason: &str) {
        log::warn!("Session {} lost its channel: {reason}", self.session_id);
        self.channel = None;
        self.channel_events = None;
        self.members.clear();
        if let Ok(mut awareness) = self.awareness.lock() {
            awareness.clear_remote();
        }
        self.phase = SyncPhase::Joining;
        self.set_synced(false);
        self.set_connection(ConnectionStatus::Disconnected);
        self.schedule_reconnect();
        self.publish_status();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        log::info!(
            "Session {} reconnecting in {}ms (attempt {})",
            self.session_id,
            delay.as_millis(),
            self.backoff.attempt()
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            // Membership comes only from the join list and join/leave events
            ChannelEvent::Message { sender, payload } => {
                if sender != self.client_id {
                    self.handle_message(sender, &payload).await;
                }
            }
            ChannelEvent::MemberJoined(id) => {
                if id != self.client_id && self.members.insert(id) {
                    log::debug!("Client {id} joined '{}'", self.document_id.channel);
                    // Greet the newcomer with our presence
                    let hello = self.awareness.lock().ok().map(|a| a.local_update());
                    if let Some(update) = hello {
                        self.send_awareness(&update).await;
                    }
                }
            }
            ChannelEvent::MemberLeft(id) => {
                self.members.remove(&id);
                let evicted = self
                    .awareness
                    .lock()
                    .map(|mut a| a.remove(id))
                    .unwrap_or(false);
                log::debug!("Client {id} left (presence evicted: {evicted})");
                if self.members.is_empty() && self.channel.is_some() {
                    // Nobody left to answer the handshake
                    self.phase = SyncPhase::Synced;
                    self.set_synced(true);
                }
            }
            ChannelEvent::Status(ConnectionStatus::Disconnected) => {
                self.handle_disconnect("transport disconnected");
            }
            ChannelEvent::Status(_) => {}
        }
        self.publish_status();
    }

    async fn handle_message(&mut self, sender: ClientId, payload: &[u8]) {
        let msg = match SyncMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.report(
                    ErrorKind::MalformedPayload,
                    format!("undecodable frame from {sender}: {e}"),
                );
                return;
            }
        };
        if !msg.is_for(self.client_id) {
            return;
        }

        match msg.msg_type {
            MessageType::SyncStep1 => {
                match self.document.diff_update(&msg.payload) {
                    Ok(diff) => {
                        let reply = SyncMessage::sync_step2(self.client_id, sender, diff);
                        self.send(reply).await;
                    }
                    Err(e) => {
                        self.report(
                            ErrorKind::MalformedPayload,
                            format!("bad state vector from {sender}: {e}"),
                        );
                        return;
                    }
                }
                // An opener (not a counter-request) gets our state vector back
                if msg.target.is_none() {
                    self.send_step1(Some(sender)).await;
                }
            }
            MessageType::SyncStep2 => {
                match self.document.apply(&msg.payload, ChangeOrigin::Remote) {
                    Ok(()) => {
                        log::debug!("Session {} handshake reply from {sender}", self.session_id);
                        self.phase = SyncPhase::Synced;
                        self.set_synced(true);
                    }
                    Err(e) => self.report(
                        ErrorKind::MalformedPayload,
                        format!("bad diff from {sender}: {e}"),
                    ),
                }
            }
            MessageType::Update => {
                if let Err(e) = self.document.apply(&msg.payload, ChangeOrigin::Remote) {
                    self.report(
                        ErrorKind::MalformedPayload,
                        format!("bad update from {sender}: {e}"),
                    );
                }
            }
            MessageType::Awareness => {
                if !self.members.contains(&sender) {
                    log::debug!("Ignoring presence from non-member {sender}");
                    return;
                }
                let result = AwarenessUpdate::decode(&msg.payload).and_then(|update| {
                    self.awareness
                        .lock()
                        .map_err(|_| {
                            crate::protocol::ProtocolError::DeserializationError(
                                "awareness lock poisoned".into(),
                            )
                        })?
                        .apply_update(&update, Instant::now())
                });
                if let Err(e) = result {
                    self.report(
                        ErrorKind::MalformedPayload,
                        format!("bad awareness patch from {sender}: {e}"),
                    );
                }
            }
        }
    }

    // ─── Host commands ────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::DocumentChanged(change) => match change.origin {
                ChangeOrigin::Local => {
                    if !change.update.is_empty() {
                        let msg = SyncMessage::update(self.client_id, change.update);
                        self.send(msg).await;
                    }
                    self.note_change();
                }
                ChangeOrigin::Remote => self.note_change(),
                ChangeOrigin::Snapshot => {}
            },
            Command::Presence(update) => self.send_awareness(&update).await,
            Command::Attach {
                id,
                mount,
                listener,
            } => self.attach(id, mount, listener),
            Command::Resync => self.resync().await,
            Command::Flush(reply) => {
                if self.store.is_none() || self.saves.is_settled() {
                    let _ = reply.send(());
                } else {
                    self.saves.flush_now(Instant::now());
                    self.flush_waiters.push(reply);
                }
            }
            // Handled by the run loop
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
        self.publish_status();
    }

    /// Register a late listener and catch it up. Runs on the driver, the
    /// only emitter, so nothing is missed or seen twice.
    fn attach(&mut self, id: ListenerId, mount: Mount, listener: Listener) {
        if !mount.is_mounted() {
            return;
        }
        self.events.insert(id, Some(mount), listener.clone());
        EventBus::deliver(id, &listener, &ProviderEvent::Status(self.connection));
        if self.synced {
            EventBus::deliver(id, &listener, &ProviderEvent::Synced(true));
        }
    }

    // ─── Timers ───────────────────────────────────────────────────────

    async fn resync(&mut self) {
        if self.channel.is_none() {
            return;
        }
        if self.members.is_empty() {
            self.phase = SyncPhase::Synced;
            self.set_synced(true);
            self.publish_status();
            return;
        }
        self.phase = if self.synced {
            SyncPhase::Resyncing
        } else {
            SyncPhase::Handshaking
        };
        log::debug!("Session {} resyncing", self.session_id);
        self.send_step1(None).await;
        self.publish_status();
    }

    async fn renew_presence(&mut self) {
        let (update, evicted) = match self.awareness.lock() {
            Ok(mut a) => (
                a.local_update(),
                a.evict_stale(AWARENESS_TIMEOUT, Instant::now()),
            ),
            Err(_) => return,
        };
        if !evicted.is_empty() {
            log::debug!("Evicted stale presence for {evicted:?}");
        }
        self.send_awareness(&update).await;
    }

    // ─── Persistence ──────────────────────────────────────────────────

    async fn load_snapshot(&mut self) {
        let Some(store) = self.store.clone() else {
            self.snapshot_loaded = true;
            return;
        };
        match store.read(&self.document_id).await {
            Ok(Some(record)) => {
                log::info!(
                    "Loaded snapshot v{} for {} ({} bytes)",
                    record.version,
                    self.document_id,
                    record.encoded_state.len()
                );
                self.snapshot_loaded = true;
                self.reconcile(record, Instant::now());
            }
            Ok(None) => self.snapshot_loaded = true,
            Err(StoreError::Damaged { version, reason }) => {
                self.snapshot_loaded = true;
                let version = self.saves.persisted_version().max(version);
                self.saves.set_persisted_version(version);
                self.report(
                    ErrorKind::Integrity,
                    format!("stored snapshot v{version} is unreadable: {reason}"),
                );
                self.saves.repair_now(Instant::now());
            }
            Err(e) => self.report(ErrorKind::Persistence, format!("snapshot read failed: {e}")),
        }
    }

    /// Bring a stored snapshot and the live document together.
    fn reconcile(&mut self, record: SnapshotRecord, now: Instant) {
        let version = self.saves.persisted_version().max(record.version);
        self.saves.set_persisted_version(version);

        let verdict = match &self.verifier {
            Some(v) => v.verify(&record, self.document.as_ref()),
            None => Verdict::Diverged,
        };
        log::debug!("Snapshot v{} verdict: {verdict:?}", record.version);

        match verdict {
            Verdict::Intact => {}
            Verdict::Stale => self.saves.note_change(now),
            Verdict::Diverged => {
                match self
                    .document
                    .apply(&record.encoded_state, ChangeOrigin::Snapshot)
                {
                    Ok(()) => {
                        let settled = self.verifier.as_ref().map_or(true, |v| {
                            v.verify(&record, self.document.as_ref()) == Verdict::Intact
                        });
                        if !settled {
                            self.saves.note_change(now);
                        }
                    }
                    Err(e) => {
                        self.report(ErrorKind::Integrity, format!("snapshot not applicable: {e}"));
                        self.saves.repair_now(now);
                    }
                }
            }
            Verdict::Corrupt(reason) => {
                self.report(
                    ErrorKind::Integrity,
                    format!("stored snapshot v{} is corrupt: {reason}", record.version),
                );
                self.saves.repair_now(now);
            }
        }
    }

    fn note_change(&mut self) {
        if self.store.is_some() {
            self.saves.note_change(Instant::now());
        }
    }

    fn start_save(&mut self) {
        let Some(expected) = self.saves.begin() else {
            return;
        };
        let Some(store) = self.store.clone() else {
            return;
        };
        let state = self.document.full_encode();
        let id = self.document_id.clone();
        log::debug!(
            "Saving {} ({} bytes, expecting v{expected})",
            self.document_id,
            state.len()
        );

        self.save_in_flight = Some(Box::pin(async move {
            match store.write_if_version(&id, &state, expected).await {
                Ok(WriteOutcome::Written { version }) => SaveOutcome::Written(version),
                Ok(WriteOutcome::Conflict { current_version }) => {
                    let latest = store.read(&id).await.ok().flatten();
                    SaveOutcome::Conflict {
                        current_version,
                        latest,
                    }
                }
                Err(e) => SaveOutcome::Failed(e),
            }
        }));
        self.publish_status();
    }

    fn finish_save(&mut self, outcome: SaveOutcome) {
        let now = Instant::now();
        let failed = matches!(outcome, SaveOutcome::Failed(_));

        match outcome {
            SaveOutcome::Written(version) => {
                self.saves.complete(version, now);
                log::debug!("Saved {} at v{version}", self.document_id);
                self.events.emit(&ProviderEvent::Saved(version));
            }
            SaveOutcome::Conflict {
                current_version,
                latest,
            } => {
                self.report(
                    ErrorKind::PersistenceConflict,
                    format!("snapshot already at v{current_version}; re-reading"),
                );
                let version = latest
                    .as_ref()
                    .map_or(current_version, |r| r.version.max(current_version));
                self.saves.conflict(version, now);
                if let Some(record) = latest {
                    self.reconcile(record, now);
                }
            }
            SaveOutcome::Failed(e) => {
                self.report(ErrorKind::Persistence, format!("snapshot write failed: {e}"));
                self.saves.fail(now);
            }
        }

        if !self.flush_waiters.is_empty() {
            if self.saves.is_settled() || failed {
                for waiter in self.flush_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            } else {
                self.saves.flush_now(now);
            }
        }
        self.publish_status();
    }

    async fn flush_for_teardown(&mut self) {
        if let Some(fut) = self.save_in_flight.take() {
            let outcome = fut.await;
            self.finish_save(outcome);
        }
        for _ in 0..TEARDOWN_SAVE_ATTEMPTS {
            if !self.saves.is_dirty() {
                break;
            }
            self.start_save();
            let Some(fut) = self.save_in_flight.take() else {
                break;
            };
            let outcome = fut.await;
            self.finish_save(outcome);
        }
        if self.saves.is_dirty() {
            log::error!(
                "Session {} closing with unsaved changes for {}",
                self.session_id,
                self.document_id
            );
        }
    }

    async fn teardown(&mut self) {
        log::info!("Session {} tearing down", self.session_id);
        self.flush_for_teardown().await;

        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(());
        }

        let goodbye = self.awareness.lock().ok().map(|a| a.removal_update());
        if let Some(update) = goodbye {
            self.send_awareness(&update).await;
        }

        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.leave().await {
                log::warn!("Leaving '{}' failed: {e}", self.document_id.channel);
            }
        }
        self.channel_events = None;
        self.members.clear();
        self.reconnect_at = None;
        self.set_synced(false);
        self.set_connection(ConnectionStatus::Disconnected);
        self.publish_status();
        self.events.clear();
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    async fn send(&mut self, msg: SyncMessage) {
        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", msg.msg_type);
                return;
            }
        };
        log::trace!("Session {} sending {:?}", self.session_id, msg.msg_type);
        if let Err(e) = channel.broadcast(bytes).await {
            self.report(ErrorKind::Transport, format!("broadcast failed: {e}"));
        }
    }

    async fn send_step1(&mut self, target: Option<ClientId>) {
        let sv = self.document.state_vector();
        let msg = match target {
            Some(t) => SyncMessage::sync_step1_to(self.client_id, t, sv),
            None => SyncMessage::sync_step1(self.client_id, sv),
        };
        self.send(msg).await;
    }

    async fn send_awareness(&mut self, update: &AwarenessUpdate) {
        match update.encode() {
            Ok(patch) => self.send(SyncMessage::awareness(self.client_id, patch)).await,
            Err(e) => log::error!("Failed to encode awareness patch: {e}"),
        }
    }

    // ─── Host signals ─────────────────────────────────────────────────

    fn report(&self, kind: ErrorKind, message: String) {
        log::warn!("Session {} {kind} error: {message}", self.session_id);
        self.events.emit(&ProviderEvent::Error { kind, message });
    }

    fn set_connection(&mut self, status: ConnectionStatus) {
        if self.connection != status {
            self.connection = status;
            self.events.emit(&ProviderEvent::Status(status));
        }
    }

    fn set_synced(&mut self, synced: bool) {
        if self.synced != synced {
            self.synced = synced;
            self.events.emit(&ProviderEvent::Synced(synced));
        }
    }

    fn publish_status(&self) {
        if let Ok(mut status) = self.status.write() {
            *status = SessionStatus {
                connection: self.connection,
                phase: self.phase,
                synced: self.synced,
                peers: self.members.len(),
                persisted_version: self.saves.persisted_version(),
                pending_save: !self.saves.is_settled(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transport::{Joined, LocalHub, TransportError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tandem_core::YrsDocument;

    fn doc_id() -> DocumentId {
        DocumentId::new("unit-room", "notes", "body", "1")
    }

    /// Transport whose single membership is driven by the test.
    struct ScriptedTransport {
        script: Mutex<Option<(Vec<ClientId>, mpsc::Receiver<ChannelEvent>)>>,
    }

    struct QuietChannel;

    #[async_trait]
    impl Channel for QuietChannel {
        fn name(&self) -> &str {
            "unit-room"
        }

        async fn broadcast(&self, _payload: Vec<u8>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn leave(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn join(&self, _channel: &str, _member: ClientId) -> Result<Joined, TransportError> {
            let (members, events) = self
                .script
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| TransportError::JoinFailed("script used up".into()))?;
            Ok(Joined {
                channel: Box::new(QuietChannel),
                events,
                members,
            })
        }
    }

    fn scripted(members: Vec<ClientId>) -> (Arc<ScriptedTransport>, mpsc::Sender<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let transport = ScriptedTransport {
            script: Mutex::new(Some((members, rx))),
        };
        (Arc::new(transport), tx)
    }

    fn frame(msg: SyncMessage) -> ChannelEvent {
        ChannelEvent::Message {
            sender: msg.client_id,
            payload: msg.encode().unwrap(),
        }
    }

    fn presence_frame(from: ClientId, name: &str) -> ChannelEvent {
        let mut peer = AwarenessStore::new(from);
        let patch = peer
            .set_local_field("name", serde_json::json!(name))
            .encode()
            .unwrap();
        frame(SyncMessage::awareness(from, patch))
    }

    fn recorder() -> (Arc<Mutex<Vec<ProviderEvent>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener = Arc::new(move |e: &ProviderEvent| {
            sink.lock().unwrap().push(e.clone());
        });
        (seen, listener)
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_session_is_synced_immediately() {
        let hub = LocalHub::new();
        let (seen, listener) = recorder();
        let session = SessionBuilder::new(doc_id(), Arc::new(YrsDocument::with_client_id(1)))
            .transport(Arc::new(hub.clone()))
            .config(SyncConfig::for_testing())
            .listener(listener)
            .spawn()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = session.status();
        assert_eq!(status.connection, ConnectionStatus::Connected);
        assert_eq!(status.phase, SyncPhase::Synced);
        assert!(status.synced);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ProviderEvent::Status(ConnectionStatus::Connecting),
                ProviderEvent::Status(ConnectionStatus::Connected),
                ProviderEvent::Synced(true),
            ]
        );
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_catches_up_late_listener() {
        let session = SessionBuilder::new(doc_id(), Arc::new(YrsDocument::with_client_id(1)))
            .transport(Arc::new(LocalHub::new()))
            .config(SyncConfig::for_testing())
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (seen, listener) = recorder();
        session.attach(Mount::new(), listener);
        let gone = Mount::new();
        gone.unmount();
        let (unmounted, stale) = recorder();
        session.attach(gone, stale);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ProviderEvent::Status(ConnectionStatus::Connected),
                ProviderEvent::Synced(true),
            ]
        );
        assert!(unmounted.lock().unwrap().is_empty());
        assert_eq!(session.events.listener_count(), 1);

        session.shutdown().await;
        assert_eq!(
            seen.lock().unwrap().last(),
            Some(&ProviderEvent::Status(ConnectionStatus::Disconnected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_frames_do_not_resurrect_departed_peer() {
        let (transport, script) = scripted(Vec::new());
        let doc = Arc::new(YrsDocument::with_client_id(1));
        let session = SessionBuilder::new(doc_id(), doc.clone())
            .transport(transport)
            .config(SyncConfig::for_testing())
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        script.send(ChannelEvent::MemberJoined(7)).await.unwrap();
        script.send(presence_frame(7, "gone soon")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.status().peers, 1);
        assert!(session.peer_presence(7).is_some());

        script.send(ChannelEvent::MemberLeft(7)).await.unwrap();
        script.send(presence_frame(7, "late")).await.unwrap();
        let source = YrsDocument::with_client_id(7);
        source.push_text("late edit");
        script
            .send(frame(SyncMessage::update(7, source.full_encode())))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = session.status();
        assert_eq!(status.peers, 0);
        assert!(status.synced);
        assert_eq!(session.peer_presence(7), None);
        assert_eq!(session.awareness().len(), 1);
        // Late document updates are still merged
        assert_eq!(doc.text(), "late edit");

        // Alone again, so a resync settles immediately
        session.request_resync();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.status().phase, SyncPhase::Synced);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_peer_leaving_mid_resync_settles_phase() {
        let (transport, script) = scripted(vec![7]);
        let (seen, listener) = recorder();
        let session = SessionBuilder::new(doc_id(), Arc::new(YrsDocument::with_client_id(1)))
            .transport(transport)
            .config(SyncConfig::for_testing())
            .listener(listener)
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.status().phase, SyncPhase::Handshaking);

        let peer = YrsDocument::with_client_id(7);
        let diff = peer.diff_update(&[]).unwrap();
        script
            .send(frame(SyncMessage::sync_step2(7, 1, diff)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.status().phase, SyncPhase::Synced);

        session.request_resync();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.status().phase, SyncPhase::Resyncing);

        script.send(ChannelEvent::MemberLeft(7)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = session.status();
        assert_eq!(status.phase, SyncPhase::Synced);
        assert!(status.synced);
        let synced_events = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ProviderEvent::Synced(_)))
            .count();
        assert_eq!(synced_events, 1);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let result = SessionBuilder::new(doc_id(), Arc::new(YrsDocument::with_client_id(1)))
            .transport(Arc::new(LocalHub::new()))
            .config(SyncConfig::default().with_resync_interval(Duration::from_secs(1)))
            .spawn();
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_transport_rejected() {
        let result =
            SessionBuilder::new(doc_id(), Arc::new(YrsDocument::with_client_id(1))).spawn();
        assert!(matches!(result, Err(SyncError::MissingTransport)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let session = SessionBuilder::new(doc_id(), Arc::new(YrsDocument::with_client_id(1)))
            .transport(Arc::new(LocalHub::new()))
            .config(SyncConfig::for_testing())
            .spawn()
            .unwrap();

        session.shutdown().await;
        session.shutdown().await;
        assert!(session.is_closed());
        assert_eq!(session.flush().await, Err(SyncError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_without_changes_returns() {
        let store = Arc::new(MemoryStore::new());
        let session = SessionBuilder::new(doc_id(), Arc::new(YrsDocument::with_client_id(1)))
            .transport(Arc::new(LocalHub::new()))
            .store(store.clone())
            .config(SyncConfig::for_testing())
            .spawn()
            .unwrap();

        session.flush().await.unwrap();
        assert_eq!(store.write_attempts(), 0);
        session.shutdown().await;
    }
}
