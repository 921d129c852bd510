//! In-process pub/sub hub.
//!
//! Every member of a channel gets its own bounded queue; a broadcast is
//! fanned out to the N-1 other members with `try_send`, so a slow member
//! loses messages instead of stalling the sender (the sync layer's resync
//! recovers them). Faults can be injected to exercise recovery paths.

use super::{Channel, ChannelEvent, ConnectionStatus, Joined, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tandem_core::ClientId;
use tokio::sync::mpsc;

/// Default per-member queue depth
const DEFAULT_CAPACITY: usize = 1024;

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_channels: usize,
}

struct Member {
    token: u64,
    tx: mpsc::Sender<ChannelEvent>,
}

type Rooms = HashMap<String, HashMap<ClientId, Member>>;

struct HubInner {
    rooms: Mutex<Rooms>,
    capacity: usize,
    next_token: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    drop_next: AtomicUsize,
    fail_joins: AtomicUsize,
}

impl HubInner {
    fn notify_others(room: &HashMap<ClientId, Member>, except: ClientId, event: ChannelEvent) {
        for (id, member) in room {
            if *id != except {
                let _ = member.tx.try_send(event.clone());
            }
        }
    }

    /// Remove `member` if its membership still carries `token`.
    fn detach(&self, channel: &str, member: ClientId, token: u64) -> bool {
        let Ok(mut rooms) = self.rooms.lock() else {
            return false;
        };
        let Some(room) = rooms.get_mut(channel) else {
            return false;
        };
        if room.get(&member).map(|m| m.token) != Some(token) {
            return false;
        }
        room.remove(&member);
        Self::notify_others(room, member, ChannelEvent::MemberLeft(member));
        if room.is_empty() {
            rooms.remove(channel);
        }
        true
    }
}

/// Shared in-process transport. Clones share the same channels.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds each member's inbound queue.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                next_token: AtomicU64::new(1),
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
                drop_next: AtomicUsize::new(0),
                fail_joins: AtomicUsize::new(0),
            }),
        }
    }

    /// Silently discard the next `n` broadcasts.
    pub fn drop_messages(&self, n: usize) {
        self.inner.drop_next.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` joins fail.
    pub fn fail_joins(&self, n: usize) {
        self.inner.fail_joins.store(n, Ordering::SeqCst);
    }

    /// Cut one member off as if its connection dropped: it receives
    /// `Status(Disconnected)` and the others see it leave.
    pub fn disconnect_member(&self, channel: &str, member: ClientId) -> bool {
        let Ok(mut rooms) = self.inner.rooms.lock() else {
            return false;
        };
        let Some(room) = rooms.get_mut(channel) else {
            return false;
        };
        let Some(removed) = room.remove(&member) else {
            return false;
        };
        let _ = removed
            .tx
            .try_send(ChannelEvent::Status(ConnectionStatus::Disconnected));
        HubInner::notify_others(room, member, ChannelEvent::MemberLeft(member));
        if room.is_empty() {
            rooms.remove(channel);
        }
        log::debug!("Hub disconnected member {member} from '{channel}'");
        true
    }

    /// Current members of `channel`, sorted.
    pub fn members(&self, channel: &str) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .inner
            .rooms
            .lock()
            .ok()
            .and_then(|rooms| rooms.get(channel).map(|r| r.keys().copied().collect()))
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn member_count(&self, channel: &str) -> usize {
        self.members(channel).len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.inner.messages_dropped.load(Ordering::Relaxed),
            active_channels: self.inner.rooms.lock().map(|r| r.len()).unwrap_or(0),
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn join(&self, channel: &str, member: ClientId) -> Result<Joined, TransportError> {
        let injected = self
            .inner
            .fail_joins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::JoinFailed(format!(
                "injected failure joining '{channel}'"
            )));
        }

        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        let members = {
            let mut rooms = self
                .inner
                .rooms
                .lock()
                .map_err(|_| TransportError::JoinFailed("hub lock poisoned".into()))?;
            let room = rooms.entry(channel.to_string()).or_default();
            let members: Vec<ClientId> = room.keys().copied().filter(|id| *id != member).collect();
            HubInner::notify_others(room, member, ChannelEvent::MemberJoined(member));
            room.insert(member, Member { token, tx });
            members
        };

        log::debug!("Member {member} joined '{channel}' ({} others)", members.len());

        Ok(Joined {
            channel: Box::new(HubChannel {
                hub: self.inner.clone(),
                name: channel.to_string(),
                member,
                token,
                left: AtomicBool::new(false),
            }),
            events: rx,
            members,
        })
    }
}

struct HubChannel {
    hub: Arc<HubInner>,
    name: String,
    member: ClientId,
    token: u64,
    left: AtomicBool,
}

#[async_trait]
impl Channel for HubChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.left.load(Ordering::Acquire) {
            return Err(TransportError::NotJoined);
        }

        let hub = &self.hub;
        hub.messages_sent.fetch_add(1, Ordering::Relaxed);
        let injected = hub
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            hub.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let rooms = hub
            .rooms
            .lock()
            .map_err(|_| TransportError::SendFailed("hub lock poisoned".into()))?;
        let room = rooms.get(&self.name).ok_or(TransportError::NotJoined)?;
        if room.get(&self.member).map(|m| m.token) != Some(self.token) {
            return Err(TransportError::NotJoined);
        }

        for (id, member) in room {
            if *id == self.member {
                continue;
            }
            let event = ChannelEvent::Message {
                sender: self.member,
                payload: payload.clone(),
            };
            if member.tx.try_send(event).is_err() {
                hub.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn leave(&self) -> Result<(), TransportError> {
        if self.left.swap(true, Ordering::AcqRel) {
            return Err(TransportError::NotJoined);
        }
        self.hub.detach(&self.name, self.member, self.token);
        log::debug!("Member {} left '{}'", self.member, self.name);
        Ok(())
    }
}

impl Drop for HubChannel {
    fn drop(&mut self) {
        if !self.left.swap(true, Ordering::AcqRel) {
            self.hub.detach(&self.name, self.member, self.token);
        }
    }
}
