//! Thread-safe proxy registry with per-guid notification.
//!
//! Uses [`DashMap`] for lock-free concurrent access. Per-guid [`Notify`]
//! ensures only relevant waiters wake up, and [`ObjectStore::wait_for`]
//! registers waiters before checking to prevent lost wakeups.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::remote_object::RemoteObject;

/// Registry of local proxies by guid, mirroring the dispatcher's tree.
pub struct ObjectStore {
    objects: DashMap<Arc<str>, Arc<dyn RemoteObject>>,
    waiters: DashMap<Arc<str>, Arc<Notify>>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            waiters: DashMap::new(),
        }
    }

    /// Inserts a proxy and wakes any waiters for this guid.
    pub fn insert(&self, guid: Arc<str>, object: Arc<dyn RemoteObject>) {
        self.objects.insert(guid.clone(), object);
        if let Some((_, notify)) = self.waiters.remove(&guid) {
            notify.notify_waiters();
        }
    }

    pub fn remove(&self, guid: &str) {
        self.objects.remove(guid);
    }

    /// Synchronous lookup.
    pub fn try_get(&self, guid: &str) -> Option<Arc<dyn RemoteObject>> {
        self.objects.get(guid).map(|entry| entry.value().clone())
    }

    /// Every live guid, unordered.
    pub fn guids(&self) -> Vec<Arc<str>> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Waits for a proxy to be registered, with timeout.
    ///
    /// Registers the waiter before checking to prevent lost wakeups.
    pub async fn wait_for(&self, guid: &str, timeout: Duration) -> Result<Arc<dyn RemoteObject>> {
        let g: Arc<str> = Arc::from(guid);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notify = self
                .waiters
                .entry(g.clone())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone();
            let notified = notify.notified();

            if let Some(object) = self.objects.get(&g) {
                return Ok(object.value().clone());
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!("waiting for object: {g}")));
            }

            tokio::select! {
                biased;
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {
                    return Err(Error::Timeout(format!("waiting for object: {g}")));
                }
            }
        }
    }
}
