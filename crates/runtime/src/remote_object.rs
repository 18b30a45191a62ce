//! RemoteObject - base trait for client-side mirrors of dispatcher objects.
//!
//! Every object the dispatcher announces via `__create__` gets a local
//! proxy implementing [`RemoteObject`]. Proxies:
//! - carry the server-assigned guid and type name
//! - participate in parent-child lifecycle (disposing a parent disposes
//!   the subtree, leaves first)
//! - receive protocol events addressed to their guid
//! - issue commands through their [`Channel`]

use crate::channel::Channel;
use crate::connection::ConnectionLike;
use downcast_rs::{DowncastSync, impl_downcast};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Private module for the sealed trait pattern.
pub mod private {
    /// Marker trait that seals `RemoteObject`.
    pub trait Sealed {}
}

/// Children keyed by guid; disposal ordering is driven by the server's
/// children-first notifications, not by this map.
type ChildRegistry = HashMap<Arc<str>, Arc<dyn RemoteObject>>;

/// Why an object went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeReason {
    /// Explicitly closed, or the connection went down.
    Closed,
    /// Collected by the server to bound proxy growth.
    GarbageCollected,
}

/// A proxy's parent: another proxy, or the connection itself for the root.
pub enum Parent {
    Object(Arc<dyn RemoteObject>),
    Connection(Arc<dyn ConnectionLike>),
}

/// Base trait for all client-side protocol object proxies.
///
/// Sealed: implemented by embedding [`RemoteObjectCore`].
pub trait RemoteObject: private::Sealed + DowncastSync {
    /// Server-assigned guid of the mirrored object.
    fn guid(&self) -> &str;

    /// Protocol interface name (e.g. "Session").
    fn type_name(&self) -> &str;

    /// Parent proxy, if any.
    fn parent(&self) -> Option<Arc<dyn RemoteObject>>;

    /// The connection this proxy belongs to.
    fn connection(&self) -> Arc<dyn ConnectionLike>;

    /// Raw initializer payload from the `__create__` notification.
    fn initializer(&self) -> &Value;

    /// Command channel for this object.
    fn channel(&self) -> &Channel;

    /// Disposes this proxy and all descendants, leaves first.
    fn dispose(&self, reason: DisposeReason);

    /// Moves a child from its old parent under this object.
    fn adopt(&self, child: Arc<dyn RemoteObject>);

    /// Links a child proxy under this object.
    fn add_child(&self, guid: Arc<str>, child: Arc<dyn RemoteObject>);

    /// Unlinks a child proxy.
    fn remove_child(&self, guid: &str);

    /// Delivers a protocol event addressed to this object's guid.
    fn on_event(&self, method: &str, params: Value);

    /// True once the object has been disposed.
    fn is_disposed(&self) -> bool;

    /// True if the server garbage-collected the object.
    fn was_collected(&self) -> bool;
}

impl_downcast!(sync RemoteObject);

/// Embeddable implementation of the [`RemoteObject`] plumbing.
pub struct RemoteObjectCore {
    guid: Arc<str>,
    type_name: String,
    parent: Option<Weak<dyn RemoteObject>>,
    connection: Arc<dyn ConnectionLike>,
    children: Mutex<ChildRegistry>,
    channel: Channel,
    initializer: Value,
    disposed: AtomicBool,
    was_collected: AtomicBool,
}

impl RemoteObjectCore {
    /// Creates the base for a proxy under the given parent.
    pub fn new(parent: Parent, type_name: String, guid: Arc<str>, initializer: Value) -> Self {
        let (connection, parent_weak) = match parent {
            Parent::Object(p) => {
                let connection = p.connection();
                (connection, Some(Arc::downgrade(&p)))
            }
            Parent::Connection(c) => (c, None),
        };

        let channel = Channel::new(Arc::clone(&guid), Arc::clone(&connection));

        Self {
            guid,
            type_name,
            parent: parent_weak,
            connection,
            children: Mutex::new(HashMap::new()),
            channel,
            initializer,
            disposed: AtomicBool::new(false),
            was_collected: AtomicBool::new(false),
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn parent(&self) -> Option<Arc<dyn RemoteObject>> {
        self.parent.as_ref().and_then(|p| p.upgrade())
    }

    pub fn connection(&self) -> Arc<dyn ConnectionLike> {
        Arc::clone(&self.connection)
    }

    pub fn initializer(&self) -> &Value {
        &self.initializer
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Disposes descendants first, then detaches this object from the
    /// registry and its parent. Idempotent: a late `__dispose__` for an
    /// object torn down by a parent is a no-op.
    pub fn dispose(&self, reason: DisposeReason) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if reason == DisposeReason::GarbageCollected {
            self.was_collected.store(true, Ordering::SeqCst);
        }

        let children: Vec<_> = {
            let guard = self.children.lock();
            guard.values().cloned().collect()
        };
        for child in children {
            child.dispose(reason);
        }
        self.children.lock().clear();

        self.connection.unregister_object(&self.guid);
        if let Some(parent) = self.parent() {
            parent.remove_child(&self.guid);
        }

        tracing::debug!(guid = %self.guid, type_name = %self.type_name, ?reason, "proxy disposed");
    }

    pub fn adopt(&self, child: Arc<dyn RemoteObject>) {
        if let Some(old_parent) = child.parent() {
            old_parent.remove_child(child.guid());
        }
        self.add_child(Arc::from(child.guid()), child);
    }

    pub fn add_child(&self, guid: Arc<str>, child: Arc<dyn RemoteObject>) {
        self.children.lock().insert(guid, child);
    }

    pub fn remove_child(&self, guid: &str) {
        self.children.lock().remove(guid);
    }

    /// Current children, unordered.
    pub fn children(&self) -> Vec<Arc<dyn RemoteObject>> {
        self.children.lock().values().cloned().collect()
    }

    /// Default event sink: log and drop.
    pub fn on_event(&self, method: &str, params: Value) {
        tracing::debug!(
            guid = %self.guid,
            type_name = %self.type_name,
            method,
            ?params,
            "unhandled event"
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn was_collected(&self) -> bool {
        self.was_collected.load(Ordering::SeqCst)
    }
}
