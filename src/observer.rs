//! Downstream observers of a reactive device.
//!
//! Observers register themselves with a device and are asked to refresh after
//! every input change (push mode) or timer tick (poll mode). The set only holds
//! weak references: an observer that was dropped without unregistering is
//! pruned on the next fan-out.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Handle returned by [`ObserverSet::register`], used to unregister.
pub type ObserverId = u64;

/// A consumer of freshly computed values.
///
/// `refresh` should re-read whatever it needs from the device and publish
/// it. It must not fail: errors are handled inside the observer.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn refresh(&self);
}

/// Registered observers of one device.
pub struct ObserverSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ObserverId, Weak<dyn Observer>)>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, observer: Weak<dyn Observer>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.write().push((id, observer));
        id
    }

    /// Remove an observer. Returns false if the id was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Live observers, dropping entries whose observer no longer exists.
    pub fn live(&self) -> Vec<Arc<dyn Observer>> {
        let mut entries = self.entries.write();
        let mut live = Vec::with_capacity(entries.len());
        entries.retain(|(_, weak)| match weak.upgrade() {
            Some(observer) => {
                live.push(observer);
                true
            }
            None => false,
        });
        live
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for ObserverSet {
    fn default() -> Self {
        Self::new()
    }
}
