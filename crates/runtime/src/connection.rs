//! Client-side connection: request correlation and tree mirroring.
//!
//! The connection is the transport-facing peer of the dispatcher. It turns
//! local calls into request frames correlated by id, resolves responses
//! against pending calls, and replays `__create__` / `__dispose__` /
//! `__adopt__` notifications into a local proxy tree that mirrors the
//! server's object tree.
//!
//! # Message Flow
//!
//! 1. A proxy calls `send_message()` with guid, method, and params
//! 2. The connection allocates the next request id and a oneshot channel
//! 3. The request is serialized and queued to the writer task
//! 4. The caller awaits the oneshot receiver
//! 5. The message pump receives the response frame from the transport
//! 6. The response is correlated by id and settles the oneshot
//!
//! A response id with no pending call is a protocol violation and tears the
//! connection down; events for unknown guids are expected races and are
//! dropped. When the transport closes, every pending call is rejected once
//! and the whole local tree is disposed.

use crate::error::{Error, Result};
use crate::remote_object::{DisposeReason, Parent, RemoteObject, RemoteObjectCore};
use crate::transport::{Transport, TransportParts, TransportReceiver};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tiller_protocol::{
    METHOD_ADOPT, METHOD_CREATE, METHOD_DISPOSE, Message, Metadata, Request, Response,
};
use tokio::sync::{mpsc, oneshot};

mod object_store;
pub use object_store::ObjectStore;

/// The interface proxies need from a connection.
///
/// Keeps [`RemoteObjectCore`] and [`crate::channel::Channel`] independent of
/// the concrete [`Connection`] so tests can substitute their own.
pub trait ConnectionLike: Send + Sync {
    /// Sends a command and awaits the correlated response.
    fn send_message(&self, guid: &str, method: &str, params: Value)
    -> BoxFuture<'_, Result<Value>>;

    /// Registers a proxy in the registry.
    fn register_object(&self, guid: Arc<str>, object: Arc<dyn RemoteObject>);

    /// Removes a proxy from the registry.
    ///
    /// Synchronous so proxy `dispose()` can call it without a runtime.
    fn unregister_object(&self, guid: &str);

    /// Synchronous registry lookup.
    fn try_get_object(&self, guid: &str) -> Option<Arc<dyn RemoteObject>>;

    /// Waits for a guid to appear in the registry.
    ///
    /// A response may reference a guid whose `__create__` is still queued
    /// behind it; waiting bridges that gap.
    fn wait_for_object(
        &self,
        guid: &str,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Arc<dyn RemoteObject>>>;

    /// True once the transport has closed.
    fn is_closed(&self) -> bool;
}

/// Factory for instantiating local proxies from `__create__` messages.
///
/// Implemented by the layer that knows the concrete proxy types; the
/// connection itself only knows [`RemoteObject`].
pub trait ObjectFactory: Send + Sync {
    fn create_object(
        &self,
        parent: Parent,
        type_name: String,
        guid: Arc<str>,
        initializer: Value,
    ) -> BoxFuture<'_, Result<Arc<dyn RemoteObject>>>;
}

type CallbackMap = Arc<Mutex<HashMap<u32, oneshot::Sender<Result<Value>>>>>;

/// RAII guard ensuring callback cleanup when a request future is dropped.
struct CancelGuard {
    id: u32,
    callbacks: CallbackMap,
    completed: bool,
}

impl CancelGuard {
    fn new(id: u32, callbacks: CallbackMap) -> Self {
        Self {
            id,
            callbacks,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if self.callbacks.lock().remove(&self.id).is_some() {
            tracing::debug!(id = self.id, "removed callback for abandoned call");
        }
    }
}

/// Future returned by [`Connection::send_message`] with automatic
/// cancellation cleanup.
struct ResponseFuture {
    rx: oneshot::Receiver<Result<Value>>,
    guard: CancelGuard,
}

impl Future for ResponseFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.guard.complete();
                Poll::Ready(result.map_err(|_| Error::ConnectionClosed).and_then(|r| r))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Client connection over a framed transport.
pub struct Connection {
    /// Monotonic request id counter.
    last_id: AtomicU32,
    /// Pending calls keyed by request id.
    callbacks: CallbackMap,
    /// Queue to the writer task.
    outbound_tx: mpsc::UnboundedSender<Value>,
    /// Transport sender (taken by run() to start the writer task).
    transport_sender: Mutex<Option<Box<dyn Transport>>>,
    /// Transport receiver (taken by run() to start the reader task).
    transport_receiver: Mutex<Option<Box<dyn TransportReceiver>>>,
    /// Decoded incoming messages (taken by run()).
    message_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    /// Outbound queue receiver (taken by run()).
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    /// Local proxy registry mirroring the dispatcher's tree.
    objects: ObjectStore,
    /// Factory for `__create__` instantiation (set before run()).
    factory: Mutex<Option<Arc<dyn ObjectFactory>>>,
    /// Set once, when the transport closes or a protocol violation occurs.
    closed: AtomicBool,
}

/// The implicit session root every top-level object hangs off.
struct RootObject {
    core: RemoteObjectCore,
}

impl crate::remote_object::private::Sealed for RootObject {}

impl RemoteObject for RootObject {
    fn guid(&self) -> &str {
        self.core.guid()
    }
    fn type_name(&self) -> &str {
        self.core.type_name()
    }
    fn parent(&self) -> Option<Arc<dyn RemoteObject>> {
        self.core.parent()
    }
    fn connection(&self) -> Arc<dyn ConnectionLike> {
        self.core.connection()
    }
    fn initializer(&self) -> &Value {
        self.core.initializer()
    }
    fn channel(&self) -> &crate::channel::Channel {
        self.core.channel()
    }
    fn dispose(&self, reason: DisposeReason) {
        self.core.dispose(reason);
    }
    fn adopt(&self, child: Arc<dyn RemoteObject>) {
        self.core.adopt(child);
    }
    fn add_child(&self, guid: Arc<str>, child: Arc<dyn RemoteObject>) {
        self.core.add_child(guid, child);
    }
    fn remove_child(&self, guid: &str) {
        self.core.remove_child(guid);
    }
    fn on_event(&self, method: &str, params: Value) {
        self.core.on_event(method, params);
    }
    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
    fn was_collected(&self) -> bool {
        self.core.was_collected()
    }
}

impl Connection {
    /// Creates a connection over the given transport parts.
    pub fn new(parts: TransportParts) -> Self {
        let TransportParts {
            sender,
            receiver,
            message_rx,
        } = parts;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            last_id: AtomicU32::new(0),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            outbound_tx,
            transport_sender: Mutex::new(Some(sender)),
            transport_receiver: Mutex::new(Some(receiver)),
            message_rx: Mutex::new(Some(message_rx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            objects: ObjectStore::new(),
            factory: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the proxy factory. Must happen before `run()` for `__create__`
    /// messages to resolve.
    pub fn set_factory(&self, factory: Arc<dyn ObjectFactory>) {
        *self.factory.lock() = Some(factory);
    }

    /// Registers the root proxy (guid "") and returns it.
    ///
    /// Idempotent; `run()` calls this before pumping messages.
    pub fn ensure_root(self: &Arc<Self>) -> Arc<dyn RemoteObject> {
        if let Some(root) = self.objects.try_get("") {
            return root;
        }
        let root: Arc<dyn RemoteObject> = Arc::new(RootObject {
            core: RemoteObjectCore::new(
                Parent::Connection(Arc::clone(self) as Arc<dyn ConnectionLike>),
                "Root".to_string(),
                Arc::from(""),
                Value::Null,
            ),
        });
        self.objects.insert(Arc::from(""), Arc::clone(&root));
        root
    }

    /// Live guids in the local mirror, excluding the implicit root.
    pub fn mirrored_guids(&self) -> Vec<Arc<str>> {
        let mut guids: Vec<Arc<str>> = self
            .objects
            .guids()
            .into_iter()
            .filter(|guid| !guid.is_empty())
            .collect();
        guids.sort();
        guids
    }

    /// Sends a command and awaits the correlated response.
    ///
    /// Fails synchronously once the connection is closed; an in-flight call
    /// is rejected when the transport goes down.
    pub async fn send_message(&self, guid: &str, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(id, guid, method, "sending request");

        let (tx, rx) = oneshot::channel();
        self.callbacks.lock().insert(id, tx);
        let guard = CancelGuard::new(id, Arc::clone(&self.callbacks));

        let request = Request {
            id,
            guid: Arc::from(guid),
            method: method.to_string(),
            params,
            metadata: Metadata::now(),
        };

        let request_value = serde_json::to_value(&request)?;
        if self.outbound_tx.send(request_value).is_err() {
            return Err(Error::ConnectionClosed);
        }

        ResponseFuture { rx, guard }.await
    }

    /// Runs the message pump until the transport closes or a protocol
    /// violation occurs. Rejects all pending calls and disposes the local
    /// tree on the way out.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut transport_receiver = self
            .transport_receiver
            .lock()
            .take()
            .expect("run() can only be called once - transport receiver already taken");
        let mut transport_sender = self
            .transport_sender
            .lock()
            .take()
            .expect("run() can only be called once - transport sender already taken");
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .expect("run() can only be called once - outbound receiver already taken");
        let mut message_rx = self
            .message_rx
            .lock()
            .take()
            .expect("run() can only be called once - message receiver already taken");

        self.ensure_root();

        let reader_handle = tokio::spawn(async move {
            if let Err(e) = transport_receiver.run().await {
                tracing::error!(error = %e, "transport read error");
            }
        });

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = transport_sender.send(message).await {
                    tracing::error!(error = %e, "transport write error");
                    break;
                }
            }
        });

        let mut pump_result = Ok(());
        while let Some(message_value) = message_rx.recv().await {
            match serde_json::from_value::<Message>(message_value) {
                Ok(message) => {
                    if let Err(e) = self.dispatch_internal(message).await {
                        tracing::error!(error = %e, "protocol violation, closing connection");
                        pump_result = Err(e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to parse incoming message");
                }
            }
        }

        self.teardown();
        reader_handle.abort();
        let _ = reader_handle.await;
        writer_handle.abort();
        let _ = writer_handle.await;
        pump_result
    }

    /// Rejects every pending call exactly once and disposes the local tree.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("connection closed, tearing down local state");

        let callbacks: Vec<_> = {
            let mut guard = self.callbacks.lock();
            guard.drain().collect()
        };
        for (id, tx) in callbacks {
            tracing::debug!(id, "rejecting pending call on close");
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        // Root disposal tears down the tree leaves-first; sweep whatever is
        // left in case an object never got linked under the root.
        if let Some(root) = self.objects.try_get("") {
            root.dispose(DisposeReason::Closed);
        }
        for guid in self.objects.guids() {
            if let Some(object) = self.objects.try_get(&guid) {
                object.dispose(DisposeReason::Closed);
            }
            self.objects.remove(&guid);
        }
    }

    /// Dispatch one incoming message. Test-only public wrapper.
    #[cfg(test)]
    pub(crate) async fn dispatch(self: &Arc<Self>, message: Message) -> Result<()> {
        self.dispatch_internal(message).await
    }

    async fn dispatch_internal(self: &Arc<Self>, message: Message) -> Result<()> {
        match message {
            Message::Response(response) => self.handle_response(response),
            Message::Event(event) => match event.method.as_str() {
                METHOD_CREATE => self.handle_create(&event).await,
                METHOD_DISPOSE => self.handle_dispose(&event),
                METHOD_ADOPT => self.handle_adopt(&event),
                _ => {
                    match self.objects.try_get(&event.guid) {
                        Some(object) => object.on_event(&event.method, event.params),
                        None => {
                            // Expected race: the dispose notification and a
                            // late event may cross in flight.
                            tracing::debug!(
                                guid = %event.guid,
                                method = %event.method,
                                "event for unknown object dropped"
                            );
                        }
                    }
                    Ok(())
                }
            },
            Message::Unknown(value) => {
                tracing::debug!(?value, "unknown message shape ignored");
                Ok(())
            }
        }
    }

    fn handle_response(&self, response: Response) -> Result<()> {
        let callback = self
            .callbacks
            .lock()
            .remove(&response.id)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "cannot find request to respond: id={}",
                    response.id
                ))
            })?;

        let result = match response.error {
            Some(wrapper) => Err(Error::from_payload(wrapper.error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = callback.send(result);
        Ok(())
    }

    /// `__create__`: instantiate and link a local proxy.
    async fn handle_create(self: &Arc<Self>, event: &tiller_protocol::Event) -> Result<()> {
        let type_name = event.params["type"]
            .as_str()
            .ok_or_else(|| Error::Protocol("__create__ missing 'type'".to_string()))?
            .to_string();
        let object_guid: Arc<str> = Arc::from(
            event.params["guid"]
                .as_str()
                .ok_or_else(|| Error::Protocol("__create__ missing 'guid'".to_string()))?,
        );
        let initializer = event.params["initializer"].clone();

        tracing::debug!(
            type_name = %type_name,
            guid = %object_guid,
            parent = %event.guid,
            "creating proxy"
        );

        // Creation notifications always precede frames referencing the new
        // guid, so the parent must already be mirrored.
        let parent = self.objects.try_get(&event.guid).ok_or_else(|| {
            Error::Protocol(format!("__create__ parent not found: {}", event.guid))
        })?;

        let factory = self
            .factory
            .lock()
            .clone()
            .ok_or_else(|| Error::Protocol("object factory not set".to_string()))?;

        let object = factory
            .create_object(
                Parent::Object(Arc::clone(&parent)),
                type_name,
                Arc::clone(&object_guid),
                initializer,
            )
            .await?;

        self.objects.insert(Arc::clone(&object_guid), Arc::clone(&object));
        parent.add_child(object_guid, object);
        Ok(())
    }

    /// `__dispose__`: tear down one local proxy.
    ///
    /// The dispatcher notifies children before parents, so by the time a
    /// parent's notification arrives its children are already gone.
    fn handle_dispose(&self, event: &tiller_protocol::Event) -> Result<()> {
        let reason = match event.params.get("reason").and_then(|r| r.as_str()) {
            Some("gc") => DisposeReason::GarbageCollected,
            _ => DisposeReason::Closed,
        };
        match self.objects.try_get(&event.guid) {
            Some(object) => object.dispose(reason),
            None => {
                tracing::debug!(guid = %event.guid, "dispose for unknown object ignored");
            }
        }
        Ok(())
    }

    /// `__adopt__`: move a child under the addressed parent.
    fn handle_adopt(&self, event: &tiller_protocol::Event) -> Result<()> {
        let child_guid = event.params["guid"]
            .as_str()
            .ok_or_else(|| Error::Protocol("__adopt__ missing 'guid'".to_string()))?;

        let parent = self
            .objects
            .try_get(&event.guid)
            .ok_or_else(|| Error::Protocol(format!("adopt parent not found: {}", event.guid)))?;
        let child = self
            .objects
            .try_get(child_guid)
            .ok_or_else(|| Error::Protocol(format!("adopt child not found: {child_guid}")))?;

        parent.adopt(child);
        Ok(())
    }
}

impl ConnectionLike for Connection {
    fn send_message(
        &self,
        guid: &str,
        method: &str,
        params: Value,
    ) -> BoxFuture<'_, Result<Value>> {
        let guid = guid.to_string();
        let method = method.to_string();
        Box::pin(async move { Connection::send_message(self, &guid, &method, params).await })
    }

    fn register_object(&self, guid: Arc<str>, object: Arc<dyn RemoteObject>) {
        self.objects.insert(guid, object);
    }

    fn unregister_object(&self, guid: &str) {
        self.objects.remove(guid);
    }

    fn try_get_object(&self, guid: &str) -> Option<Arc<dyn RemoteObject>> {
        self.objects.try_get(guid)
    }

    fn wait_for_object(
        &self,
        guid: &str,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Arc<dyn RemoteObject>>> {
        let guid = guid.to_string();
        Box::pin(async move { self.objects.wait_for(&guid, timeout).await })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests;
