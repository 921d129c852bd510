//! Host-facing Session events and their delivery.
//!
//! Listeners are isolated from each other: a panicking listener is logged
//! and skipped, the rest still run, and the Session keeps going. Listeners
//! may be tied to a [`Mount`] so that a host component which believes it
//! has been torn down stops hearing from a Session that is still alive
//! during its grace window.

use crate::transport::ConnectionStatus;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Error classes reported through [`ProviderEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Join, broadcast or connection failure
    Transport,
    /// Inbound payload that could not be decoded or applied
    MalformedPayload,
    /// Snapshot read or write failed
    Persistence,
    /// Another writer persisted first
    PersistenceConflict,
    /// Stored snapshot failed verification
    Integrity,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::MalformedPayload => "malformed-payload",
            Self::Persistence => "persistence",
            Self::PersistenceConflict => "persistence-conflict",
            Self::Integrity => "integrity",
        };
        f.write_str(s)
    }
}

/// Everything a host may observe about a Session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Status(ConnectionStatus),
    /// Emitted only when the synced flag flips
    Synced(bool),
    /// Snapshot persisted at this version
    Saved(u64),
    Error { kind: ErrorKind, message: String },
}

/// Host callback.
pub type Listener = Arc<dyn Fn(&ProviderEvent) + Send + Sync + 'static>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// "Still mounted" flag shared between a host component and the listeners
/// it registered.
#[derive(Debug, Clone)]
pub struct Mount(Arc<AtomicBool>);

impl Mount {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_mounted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn unmount(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Mount {
    fn default() -> Self {
        Self::new()
    }
}

struct Registered {
    id: ListenerId,
    mount: Option<Mount>,
    listener: Listener,
}

/// Fan-out of [`ProviderEvent`]s to host listeners.
pub struct EventBus {
    listeners: Mutex<Vec<Registered>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        self.register(None, listener)
    }

    /// Register a listener that is skipped once `mount` is unmounted.
    pub fn subscribe_mounted(&self, mount: Mount, listener: Listener) -> ListenerId {
        self.register(Some(mount), listener)
    }

    fn register(&self, mount: Option<Mount>, listener: Listener) -> ListenerId {
        let id = self.allocate_id();
        self.insert(id, mount, listener);
        id
    }

    /// Reserve an id for a listener inserted later with [`EventBus::insert`].
    pub(crate) fn allocate_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert(&self, id: ListenerId, mount: Option<Mount>, listener: Listener) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Registered {
                id,
                mount,
                listener,
            });
        }
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        match self.listeners.lock() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|r| r.id != id);
                listeners.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.clear();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Deliver `event` to every mounted listener.
    ///
    /// Listeners run outside the registry lock so they may subscribe or
    /// unsubscribe from inside the callback.
    pub fn emit(&self, event: &ProviderEvent) {
        let targets: Vec<(ListenerId, Listener)> = match self.listeners.lock() {
            Ok(listeners) => listeners
                .iter()
                .filter(|r| r.mount.as_ref().map_or(true, Mount::is_mounted))
                .map(|r| (r.id, r.listener.clone()))
                .collect(),
            Err(_) => return,
        };

        for (id, listener) in targets {
            Self::deliver(id, &listener, event);
        }
    }

    /// Call one listener, containing a panic.
    pub(crate) fn deliver(id: ListenerId, listener: &Listener, event: &ProviderEvent) {
        if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            log::error!("Listener {:?} panicked while handling {:?}", id, event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<ProviderEvent>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener = Arc::new(move |e: &ProviderEvent| {
            sink.lock().unwrap().push(e.clone());
        });
        (seen, listener)
    }

    #[test]
    fn test_emit_reaches_all_listeners() {
        let bus = EventBus::new();
        let (a, la) = recorder();
        let (b, lb) = recorder();
        bus.subscribe(la);
        bus.subscribe(lb);

        bus.emit(&ProviderEvent::Saved(3));

        assert_eq!(*a.lock().unwrap(), vec![ProviderEvent::Saved(3)]);
        assert_eq!(*b.lock().unwrap(), vec![ProviderEvent::Saved(3)]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        bus.subscribe(Arc::new(|_: &ProviderEvent| panic!("host bug")));
        let (seen, listener) = recorder();
        bus.subscribe(listener);

        bus.emit(&ProviderEvent::Synced(true));
        bus.emit(&ProviderEvent::Synced(false));

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_release_profile_keeps_unwinding() {
        // Panic isolation above is a no-op once panics abort
        let manifest = include_str!("../../Cargo.toml");
        let release = manifest
            .split("[profile.release]")
            .nth(1)
            .unwrap_or_default();
        let release = release.split("\n[").next().unwrap_or_default();
        assert!(!release.contains("panic = \"abort\""));
    }

    #[test]
    fn test_unmounted_listener_skipped() {
        let bus = EventBus::new();
        let mount = Mount::new();
        let (seen, listener) = recorder();
        bus.subscribe_mounted(mount.clone(), listener);

        bus.emit(&ProviderEvent::Status(ConnectionStatus::Connected));
        mount.unmount();
        bus.emit(&ProviderEvent::Status(ConnectionStatus::Disconnected));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ProviderEvent::Status(ConnectionStatus::Connected)]
        );
        assert!(!mount.is_mounted());
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let (seen, listener) = recorder();
        let id = bus.subscribe(listener);
        assert_eq!(bus.listener_count(), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&ProviderEvent::Saved(1));

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let (bus2, slot2) = (bus.clone(), slot.clone());
        let id = bus.subscribe(Arc::new(move |_: &ProviderEvent| {
            if let Some(id) = *slot2.lock().unwrap() {
                bus2.unsubscribe(id);
            }
        }));
        *slot.lock().unwrap() = Some(id);

        bus.emit(&ProviderEvent::Saved(1));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::PersistenceConflict.to_string(), "persistence-conflict");
        assert_eq!(ErrorKind::MalformedPayload.to_string(), "malformed-payload");
    }
}
