//! Session sharing and deferred teardown.
//!
//! Hosts mount and unmount views faster than a channel can be joined and
//! left. The [`SessionManager`] keeps one Session per [`DocumentId`] and
//! hands out [`SessionLease`]s. When the last lease goes away the Session
//! is not torn down at once: a grace timer starts, and an `acquire` for the
//! same document before it fires gets the very same Session back.
//!
//! ```text
//!  acquire ──▶ leases=1 ──release──▶ leases=0 ──grace──▶ shutdown
//!                 ▲                      │
//!                 └────── acquire ───────┘   (timer cancelled)
//! ```

use crate::awareness::Fields;
use crate::config::SyncConfig;
use crate::events::{Listener, ListenerId, Mount};
use crate::provider::{Session, SessionBuilder, SyncError};
use crate::storage::{PersistenceGateway, SnapshotVerifier};
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tandem_core::{DocumentHandle, DocumentId, YrsDocument};
use tokio::task::JoinHandle;

struct Slot<D> {
    session: Arc<Session>,
    document: Arc<D>,
    leases: usize,
    /// Bumped on every acquire/release so a stale grace timer can tell it
    /// lost the race
    generation: u64,
    teardown: Option<JoinHandle<()>>,
}

struct ManagerInner<D> {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn PersistenceGateway>>,
    verifier: Option<Arc<dyn SnapshotVerifier>>,
    slots: Mutex<HashMap<DocumentId, Slot<D>>>,
}

impl<D: DocumentHandle + 'static> ManagerInner<D> {
    fn release(self: &Arc<Self>, document_id: &DocumentId) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let Some(slot) = slots.get_mut(document_id) else {
            return;
        };
        slot.leases = slot.leases.saturating_sub(1);
        if slot.leases > 0 {
            return;
        }
        slot.generation += 1;
        let generation = slot.generation;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.clone();
                let id = document_id.clone();
                let grace = self.config.grace_period;
                log::debug!("Last lease on {id} released; tearing down in {grace:?}");
                slot.teardown = Some(runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    inner.expire(&id, generation).await;
                }));
            }
            Err(_) => {
                // No runtime to wait on: dropping the last handle closes the
                // Session's command queue and its driver winds down.
                slots.remove(document_id);
            }
        }
    }

    async fn expire(&self, document_id: &DocumentId, generation: u64) {
        let session = {
            let Ok(mut slots) = self.slots.lock() else {
                return;
            };
            match slots.get(document_id) {
                Some(slot) if slot.generation == generation && slot.leases == 0 => {
                    slots.remove(document_id).map(|slot| slot.session)
                }
                _ => None,
            }
        };
        if let Some(session) = session {
            log::info!("Grace period over for {document_id}; shutting down");
            session.shutdown().await;
        }
    }
}

/// One shared Session per document, with deferred teardown.
pub struct SessionManager<D: DocumentHandle + 'static = YrsDocument> {
    inner: Arc<ManagerInner<D>>,
}

impl<D: DocumentHandle + 'static> Clone for SessionManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: DocumentHandle + 'static> SessionManager<D> {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn PersistenceGateway>>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                transport,
                store,
                verifier: None,
                slots: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Use a custom snapshot verifier for every Session this manager starts.
    pub fn with_verifier(self, verifier: Arc<dyn SnapshotVerifier>) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.verifier = Some(verifier);
                inner
            }
            Err(shared) => {
                log::warn!("Verifier ignored: manager already shared");
                return Self { inner: shared };
            }
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Get a lease on the Session for `document_id`, starting one (with a
    /// document from `make_document`) if none is alive.
    ///
    /// A Session waiting out its grace period is reused as is; `presence`
    /// then replaces its local presence unless empty.
    pub fn acquire<F>(
        &self,
        document_id: DocumentId,
        make_document: F,
        presence: Fields,
    ) -> Result<SessionLease<D>, SyncError>
    where
        F: FnOnce() -> D,
    {
        let mut slots = self.inner.slots.lock().map_err(|_| SyncError::Closed)?;

        if let Some(slot) = slots.get_mut(&document_id) {
            if let Some(timer) = slot.teardown.take() {
                timer.abort();
                log::debug!("Reusing session for {document_id} within grace period");
            }
            slot.leases += 1;
            slot.generation += 1;
            if !presence.is_empty() {
                slot.session.set_presence(presence);
            }
            return Ok(SessionLease::new(
                self.inner.clone(),
                document_id,
                slot.session.clone(),
                slot.document.clone(),
            ));
        }

        let document = Arc::new(make_document());
        let handle: Arc<dyn DocumentHandle> = document.clone();
        let mut builder = SessionBuilder::new(document_id.clone(), handle)
            .transport(self.inner.transport.clone())
            .config(self.inner.config.clone())
            .presence(presence);
        if let Some(store) = &self.inner.store {
            builder = builder.store(store.clone());
        }
        if let Some(verifier) = &self.inner.verifier {
            builder = builder.verifier(verifier.clone());
        }
        let session = builder.spawn()?;

        slots.insert(
            document_id.clone(),
            Slot {
                session: session.clone(),
                document: document.clone(),
                leases: 1,
                generation: 0,
                teardown: None,
            },
        );
        Ok(SessionLease::new(
            self.inner.clone(),
            document_id,
            session,
            document,
        ))
    }

    /// Live Session for `document_id`, including one in its grace period.
    pub fn session(&self, document_id: &DocumentId) -> Option<Arc<Session>> {
        self.inner
            .slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(document_id).map(|s| s.session.clone()))
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Tear down every Session now, leases or not.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Slot<D>> = match self.inner.slots.lock() {
            Ok(mut slots) => slots.drain().map(|(_, slot)| slot).collect(),
            Err(_) => return,
        };
        for mut slot in drained {
            if let Some(timer) = slot.teardown.take() {
                timer.abort();
            }
            slot.session.shutdown().await;
        }
    }
}

/// A host's claim on a shared Session.
///
/// Listeners registered through the lease are tied to it: once the lease is
/// released they are never invoked again, even for events already queued.
pub struct SessionLease<D: DocumentHandle + 'static = YrsDocument> {
    manager: Arc<ManagerInner<D>>,
    document_id: DocumentId,
    session: Arc<Session>,
    document: Arc<D>,
    mount: Mount,
    listeners: Mutex<Vec<ListenerId>>,
}

impl<D: DocumentHandle + 'static> SessionLease<D> {
    fn new(
        manager: Arc<ManagerInner<D>>,
        document_id: DocumentId,
        session: Arc<Session>,
        document: Arc<D>,
    ) -> Self {
        Self {
            manager,
            document_id,
            session,
            document,
            mount: Mount::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn document(&self) -> &Arc<D> {
        &self.document
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Subscribe for as long as this lease is held. The listener is first
    /// told the Session's current status, so a lease taken while the
    /// Session connects (or long after) still sees `Connected`.
    pub fn on_event(&self, listener: Listener) -> ListenerId {
        let id = self.session.attach(self.mount.clone(), listener);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(id);
        }
        id
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_mounted()
    }

    /// Give the lease back. Same as dropping it.
    pub fn release(self) {}
}

impl<D: DocumentHandle + 'static> Drop for SessionLease<D> {
    fn drop(&mut self) {
        self.mount.unmount();
        if let Ok(mut listeners) = self.listeners.lock() {
            for id in listeners.drain(..) {
                self.session.unsubscribe(id);
            }
        }
        self.manager.release(&self.document_id);
    }
}

impl<D: DocumentHandle + 'static> std::fmt::Debug for SessionLease<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("document_id", &self.document_id)
            .field("session", &self.session.id())
            .field("mounted", &self.mount.is_mounted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalHub;
    use std::time::Duration;

    fn doc_id() -> DocumentId {
        DocumentId::new("lease-room", "notes", "body", "7")
    }

    fn manager(hub: &LocalHub) -> SessionManager {
        SessionManager::new(SyncConfig::for_testing(), Arc::new(hub.clone()), None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_leases_share_session() {
        let hub = LocalHub::new();
        let manager = manager(&hub);

        let a = manager
            .acquire(doc_id(), || YrsDocument::with_client_id(1), Fields::new())
            .unwrap();
        let b = manager
            .acquire(doc_id(), || YrsDocument::with_client_id(2), Fields::new())
            .unwrap();

        assert_eq!(a.session().id(), b.session().id());
        assert!(Arc::ptr_eq(a.document(), b.document()));
        assert_eq!(manager.active_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_within_grace_reuses() {
        let hub = LocalHub::new();
        let manager = manager(&hub);

        let first = manager
            .acquire(doc_id(), || YrsDocument::with_client_id(1), Fields::new())
            .unwrap();
        let id = first.session().id();
        first.release();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = manager
            .acquire(doc_id(), || YrsDocument::with_client_id(9), Fields::new())
            .unwrap();
        assert_eq!(second.session().id(), id);
        assert_eq!(second.session().client_id(), 1);

        // The cancelled timer must not fire later
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.active_sessions(), 1);
        assert!(!second.session().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_tears_down() {
        let hub = LocalHub::new();
        let manager = manager(&hub);

        let lease = manager
            .acquire(doc_id(), || YrsDocument::with_client_id(1), Fields::new())
            .unwrap();
        let session = lease.session().clone();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.member_count("lease-room"), 1);

        drop(lease);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(manager.active_sessions(), 0);
        assert!(session.is_closed());
        assert_eq!(hub.member_count("lease-room"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_lease_listener_not_invoked() {
        let hub = LocalHub::new();
        let manager = manager(&hub);

        let keeper = manager
            .acquire(doc_id(), || YrsDocument::with_client_id(1), Fields::new())
            .unwrap();
        let lease = manager
            .acquire(doc_id(), || YrsDocument::with_client_id(1), Fields::new())
            .unwrap();

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        lease.on_event(Arc::new(move |_: &crate::events::ProviderEvent| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let before = calls.load(std::sync::atomic::Ordering::SeqCst);

        lease.release();
        hub.disconnect_member("lease-room", 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), before);
        assert!(keeper.is_mounted());
    }
}
