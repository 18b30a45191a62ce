//! Sessions - named subtree roots for multiplexing.
//!
//! A session is a regular dispatcher object parked directly under the root,
//! used as the root of one logical stream when several run over a single
//! transport. Closing the session disposes its entire subtree and is the
//! only sanctioned way to tear down a multiplexed sub-connection; the
//! children-first `__dispose__` notifications report the teardown to the
//! peer.

use crate::dispatcher::DispatcherConnection;
use crate::error::Result;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handle to a session subtree on the dispatcher.
pub struct Session {
    connection: Arc<DispatcherConnection>,
    guid: Arc<str>,
    name: String,
    closed: AtomicBool,
}

impl DispatcherConnection {
    /// Opens a named session: a `type_name` object under the root whose
    /// subtree holds everything created within the session.
    pub fn open_session(
        self: &Arc<Self>,
        name: &str,
        type_name: &str,
        initializer: Value,
    ) -> Result<Session> {
        let guid = self.create_object(self.root_guid(), type_name, initializer)?;
        tracing::debug!(session = name, guid = %guid, "session opened");
        Ok(Session {
            connection: Arc::clone(self),
            guid,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        })
    }
}

impl Session {
    /// Guid of the session's root object.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Label the session was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates an object inside this session's subtree.
    pub fn create_object(
        &self,
        parent_guid: &str,
        type_name: &str,
        initializer: Value,
    ) -> Result<Arc<str>> {
        self.connection
            .create_object(parent_guid, type_name, initializer)
    }

    /// True once [`Session::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Disposes the whole session subtree, leaves first.
    ///
    /// Idempotent from this handle; a second close is a no-op rather than a
    /// double-dispose protocol error.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(session = %self.name, guid = %self.guid, "session closed");
        self.connection.dispose(&self.guid)
    }
}
