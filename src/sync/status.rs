//! Sync status store
//!
//! Process-wide map from entity id to its current [`SyncStatus`]. External
//! consumers only read and subscribe; the queue, engine and resolver are the
//! only writers, which is why every mutating method is crate-private.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::watch;

use super::types::{SyncProgress, SyncStatus};

type Listener = Arc<dyn Fn(&str, Option<SyncStatus>) + Send + Sync>;

/// Subscribable status map shared by every sync component
#[derive(Clone)]
pub struct SyncStatusStore {
    inner: Arc<StatusStoreInner>,
}

struct StatusStoreInner {
    statuses: RwLock<HashMap<String, SyncStatus>>,
    /// Last sync error per entity (retry ceiling hit, validation rejection)
    errors: RwLock<HashMap<String, String>>,
    /// Temporary id -> server id, kept so late readers can follow a rename
    aliases: RwLock<HashMap<String, String>>,
    listeners: RwLock<HashMap<u64, Listener>>,
    next_listener: AtomicU64,
    progress: watch::Sender<Option<SyncProgress>>,
}

impl SyncStatusStore {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            inner: Arc::new(StatusStoreInner {
                statuses: RwLock::new(HashMap::new()),
                errors: RwLock::new(HashMap::new()),
                aliases: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                next_listener: AtomicU64::new(0),
                progress,
            }),
        }
    }

    // ========================================================================
    // Read Side
    // ========================================================================

    pub fn get(&self, entity_id: &str) -> Option<SyncStatus> {
        self.inner.statuses.read().get(entity_id).copied()
    }

    /// Every tracked entity and its status
    pub fn all(&self) -> HashMap<String, SyncStatus> {
        self.inner.statuses.read().clone()
    }

    /// Entities currently parked in conflict
    pub fn conflicted(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .statuses
            .read()
            .iter()
            .filter(|(_, status)| **status == SyncStatus::Conflict)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn error(&self, entity_id: &str) -> Option<String> {
        self.inner.errors.read().get(entity_id).cloned()
    }

    pub fn errors(&self) -> HashMap<String, String> {
        self.inner.errors.read().clone()
    }

    /// Server id a temporary id was renamed to, if any
    pub fn resolve_alias(&self, temp_id: &str) -> Option<String> {
        self.inner.aliases.read().get(temp_id).cloned()
    }

    /// Progress of the drain pass in flight, `None` when idle
    pub fn progress(&self) -> Option<SyncProgress> {
        *self.inner.progress.borrow()
    }

    pub fn watch_progress(&self) -> watch::Receiver<Option<SyncProgress>> {
        self.inner.progress.subscribe()
    }

    /// Register a listener called on every status change
    ///
    /// `None` means the entity is no longer tracked: its delete was confirmed
    /// or its unsent create was cancelled. A temporary id renamed to a server
    /// id is reported under the server id only; use
    /// [`resolve_alias`](Self::resolve_alias) to follow it.
    ///
    /// The listener stays registered until the returned handle is dropped or
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str, Option<SyncStatus>) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().insert(id, Arc::new(listener));
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    // ========================================================================
    // Write Side
    // ========================================================================

    pub(crate) fn set(&self, entity_id: &str, status: SyncStatus) {
        let previous = self
            .inner
            .statuses
            .write()
            .insert(entity_id.to_string(), status);

        if previous != Some(status) {
            tracing::debug!(entity_id = %entity_id, status = ?status, "Sync status changed");
            self.notify(entity_id, Some(status));
        }
    }

    /// Stop tracking an entity (confirmed delete, cancelled create)
    pub(crate) fn remove(&self, entity_id: &str) {
        let previous = self.inner.statuses.write().remove(entity_id);
        self.inner.errors.write().remove(entity_id);
        if previous.is_some() {
            self.notify(entity_id, None);
        }
    }

    /// Move an entity's status from its temporary id to its server id
    pub(crate) fn rename(&self, temp_id: &str, server_id: &str, status: SyncStatus) {
        {
            let mut statuses = self.inner.statuses.write();
            statuses.remove(temp_id);
            statuses.insert(server_id.to_string(), status);
        }
        {
            let mut errors = self.inner.errors.write();
            if let Some(error) = errors.remove(temp_id) {
                errors.insert(server_id.to_string(), error);
            }
        }
        self.inner
            .aliases
            .write()
            .insert(temp_id.to_string(), server_id.to_string());

        self.notify(server_id, Some(status));
    }

    pub(crate) fn set_error(&self, entity_id: &str, error: impl Into<String>) {
        self.inner
            .errors
            .write()
            .insert(entity_id.to_string(), error.into());
    }

    pub(crate) fn clear_error(&self, entity_id: &str) {
        self.inner.errors.write().remove(entity_id);
    }

    pub(crate) fn set_progress(&self, progress: Option<SyncProgress>) {
        self.inner.progress.send_replace(progress);
    }

    fn notify(&self, entity_id: &str, status: Option<SyncStatus>) {
        // Snapshot listeners so callbacks can subscribe/unsubscribe freely
        let listeners: Vec<Listener> = self.inner.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener(entity_id, status);
        }
    }
}

impl Default for SyncStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle keeping a status listener registered
pub struct Subscription {
    id: u64,
    store: Weak<StatusStoreInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.listeners.write().remove(&self.id);
        }
    }
}
