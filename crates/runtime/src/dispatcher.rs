//! Server-side dispatcher: the object tree and command routing.
//!
//! The dispatcher owns the authoritative tree of remote objects. Each
//! object has a process-unique guid, a parent, and an interface type whose
//! commands resolve through a [`HandlerRegistry`]. Incoming request frames
//! are routed to the addressed object's handler; results, handler failures,
//! events, and lifecycle notifications flow back as frames.
//!
//! Lifetime rules:
//! - `__create__` for a guid is always on the wire before any frame that
//!   references it
//! - disposing an object disposes its whole subtree, and `__dispose__`
//!   notifications go out children-first so the peer tears down leaves
//!   before roots
//! - events for an already-disposed guid are silently dropped; commands for
//!   one get a structured error response

use crate::error::{Error, Result};
use crate::transport::TransportParts;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tiller_protocol::{
    METHOD_ADOPT, METHOD_CREATE, METHOD_DISPOSE, ErrorPayload, ErrorWrapper, Event, Request,
    Response,
};
use tokio::sync::{mpsc, watch};

/// Context handed to every command handler invocation.
pub struct HandlerCall {
    /// The dispatcher connection, for creating children or emitting events.
    pub connection: Arc<DispatcherConnection>,
    /// Guid of the addressed object.
    pub guid: Arc<str>,
    /// Raw request parameters.
    pub params: Value,
}

/// Boxed future produced by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// A registered command handler.
pub type Handler = Arc<dyn Fn(HandlerCall) -> HandlerFuture + Send + Sync>;

/// Known commands per interface, typically built from a compiled schema's
/// catalog, used to validate registrations up front.
#[derive(Debug, Default, Clone)]
pub struct MethodCatalog {
    commands: HashMap<String, HashSet<String>>,
}

impl MethodCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from `(interface, commands)` pairs.
    pub fn from_pairs<I, S, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, C)>,
        S: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        let mut catalog = Self::new();
        for (interface, commands) in pairs {
            catalog.commands.insert(
                interface.into(),
                commands.into_iter().map(Into::into).collect(),
            );
        }
        catalog
    }

    pub fn allows(&self, interface: &str, method: &str) -> bool {
        self.commands
            .get(interface)
            .is_some_and(|methods| methods.contains(method))
    }
}

/// Handler table: interface name -> method name -> handler.
///
/// Method resolution is a plain lookup at dispatch time; validity is
/// checked once, at registration.
#[derive(Default)]
pub struct HandlerRegistry {
    catalog: Option<MethodCatalog>,
    handlers: HashMap<String, HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that rejects methods the catalog does not declare.
    pub fn with_catalog(catalog: MethodCatalog) -> Self {
        Self {
            catalog: Some(catalog),
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler for `interface.method`.
    ///
    /// Fails on duplicates, and on methods outside the catalog when one is
    /// present - a misspelled registration should not wait for the first
    /// call to surface.
    pub fn register<F, Fut>(&mut self, interface: &str, method: &str, handler: F) -> Result<()>
    where
        F: Fn(HandlerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        if let Some(catalog) = &self.catalog {
            if !catalog.allows(interface, method) {
                return Err(Error::Registration(format!(
                    "`{interface}` does not declare command `{method}`"
                )));
            }
        }
        let methods = self.handlers.entry(interface.to_string()).or_default();
        if methods.contains_key(method) {
            return Err(Error::Registration(format!(
                "duplicate handler for `{interface}.{method}`"
            )));
        }
        methods.insert(
            method.to_string(),
            Arc::new(move |call| Box::pin(handler(call)) as HandlerFuture),
        );
        Ok(())
    }

    fn get(&self, interface: &str, method: &str) -> Option<Handler> {
        self.handlers.get(interface)?.get(method).cloned()
    }
}

/// One node of the object tree.
///
/// The parent back-reference is a guid into the same arena, never a
/// pointer, so cycles are structurally impossible: children only ever point
/// at already-registered parents.
struct ObjectNode {
    type_name: String,
    parent: Option<Arc<str>>,
    /// Children in creation order.
    children: Vec<Arc<str>>,
}

/// Server half of a connection: object tree, routing, notifications.
pub struct DispatcherConnection {
    objects: Mutex<HashMap<Arc<str>, ObjectNode>>,
    registry: HandlerRegistry,
    outbound_tx: mpsc::UnboundedSender<Value>,
    transport: Mutex<Option<TransportTasks>>,
    next_seq: AtomicU64,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

/// Transport pieces held until `run()` takes them.
struct TransportTasks {
    parts: TransportParts,
    outbound_rx: mpsc::UnboundedReceiver<Value>,
}

/// Guid of the implicit root object every tree starts with.
pub const ROOT_GUID: &str = "";

impl DispatcherConnection {
    /// Creates a dispatcher over the given transport with the root object
    /// pre-registered.
    pub fn new(registry: HandlerRegistry, parts: TransportParts) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mut objects = HashMap::new();
        objects.insert(
            Arc::from(ROOT_GUID),
            ObjectNode {
                type_name: "Root".to_string(),
                parent: None,
                children: Vec::new(),
            },
        );
        Arc::new(Self {
            objects: Mutex::new(objects),
            registry,
            outbound_tx,
            transport: Mutex::new(Some(TransportTasks { parts, outbound_rx })),
            next_seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            stop_tx: watch::channel(false).0,
        })
    }

    /// Initiates shutdown: the message pump exits and the transport halves
    /// drop, which the peer observes as end-of-stream.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
    }

    /// Guid of the tree root.
    pub fn root_guid(&self) -> &'static str {
        ROOT_GUID
    }

    /// Live guids, excluding the implicit root, sorted for comparisons.
    pub fn live_guids(&self) -> Vec<Arc<str>> {
        let mut guids: Vec<Arc<str>> = self
            .objects
            .lock()
            .keys()
            .filter(|guid| !guid.is_empty())
            .cloned()
            .collect();
        guids.sort();
        guids
    }

    /// Registers a new object under `parent_guid` and announces it.
    ///
    /// The `__create__` notification is queued while the tree lock is held,
    /// so it is on the wire before any later frame can reference the guid.
    pub fn create_object(
        self: &Arc<Self>,
        parent_guid: &str,
        type_name: &str,
        initializer: Value,
    ) -> Result<Arc<str>> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let guid: Arc<str> = Arc::from(format!("{}@{seq}", type_name.to_lowercase()).as_str());

        let mut objects = self.objects.lock();
        let parent = objects
            .get_mut(parent_guid)
            .ok_or_else(|| Error::ObjectNotFound {
                guid: parent_guid.to_string(),
            })?;
        parent.children.push(Arc::clone(&guid));
        objects.insert(
            Arc::clone(&guid),
            ObjectNode {
                type_name: type_name.to_string(),
                parent: Some(Arc::from(parent_guid)),
                children: Vec::new(),
            },
        );

        tracing::debug!(guid = %guid, type_name, parent = parent_guid, "object created");
        self.send_event(Event {
            guid: Arc::from(parent_guid),
            method: METHOD_CREATE.to_string(),
            params: serde_json::json!({
                "type": type_name,
                "initializer": initializer,
                "guid": guid.as_ref(),
            }),
        });
        Ok(guid)
    }

    /// Disposes `guid` and its whole subtree.
    ///
    /// Notifications go out children-first so the peer tears down leaves
    /// before roots. Disposing an unknown guid is a loud protocol error:
    /// double-dispose is a bug, not a race to tolerate.
    pub fn dispose(&self, guid: &str) -> Result<()> {
        self.dispose_with_reason(guid, None)
    }

    /// Disposes a subtree with an explicit reason (e.g. "gc") forwarded in
    /// every notification.
    pub fn dispose_with_reason(&self, guid: &str, reason: Option<&str>) -> Result<()> {
        if guid == ROOT_GUID {
            return Err(Error::Protocol(
                "the root object cannot be disposed".to_string(),
            ));
        }

        let removed = {
            let mut objects = self.objects.lock();
            let Some(node) = objects.get(guid) else {
                return Err(Error::Protocol(format!("disposing unknown guid: {guid}")));
            };
            let parent_guid = node.parent.clone();

            // Post-order walk: children first, then the node itself.
            let mut removed = Vec::new();
            collect_subtree(&objects, guid, &mut removed);
            for g in &removed {
                objects.remove(g);
            }

            // The subtree root's parent survives; unlink it there.
            if let Some(parent) = parent_guid.and_then(|p| objects.get_mut(&p)) {
                parent.children.retain(|child| child.as_ref() != guid);
            }
            removed
        };

        let params = match reason {
            Some(reason) => serde_json::json!({ "reason": reason }),
            None => serde_json::json!({}),
        };
        for g in &removed {
            tracing::debug!(guid = %g, "object disposed");
            self.send_event(Event {
                guid: Arc::clone(g),
                method: METHOD_DISPOSE.to_string(),
                params: params.clone(),
            });
        }
        Ok(())
    }

    /// Re-parents `guid` under `new_parent_guid` and announces the move.
    pub fn adopt(&self, guid: &str, new_parent_guid: &str) -> Result<()> {
        {
            let mut objects = self.objects.lock();
            if !objects.contains_key(guid) {
                return Err(Error::ObjectNotFound {
                    guid: guid.to_string(),
                });
            }
            if !objects.contains_key(new_parent_guid) {
                return Err(Error::ObjectNotFound {
                    guid: new_parent_guid.to_string(),
                });
            }
            for node in objects.values_mut() {
                node.children.retain(|child| child.as_ref() != guid);
            }
            let new_parent = objects.get_mut(new_parent_guid).expect("checked above");
            new_parent.children.push(Arc::from(guid));
            let node = objects.get_mut(guid).expect("checked above");
            node.parent = Some(Arc::from(new_parent_guid));
        }
        self.send_event(Event {
            guid: Arc::from(new_parent_guid),
            method: METHOD_ADOPT.to_string(),
            params: serde_json::json!({ "guid": guid }),
        });
        Ok(())
    }

    /// Emits a domain event from `guid`, dropping it silently when the
    /// object is already gone - the dispose notification and a late event
    /// may legitimately cross in flight.
    pub fn emit_event(&self, guid: &str, method: &str, params: Value) -> Result<()> {
        if matches!(method, METHOD_CREATE | METHOD_DISPOSE | METHOD_ADOPT) {
            return Err(Error::Protocol(format!(
                "`{method}` is reserved for dispatcher bookkeeping"
            )));
        }
        if !self.objects.lock().contains_key(guid) {
            tracing::debug!(guid, method, "event for disposed object dropped");
            return Ok(());
        }
        self.send_event(Event {
            guid: Arc::from(guid),
            method: method.to_string(),
            params,
        });
        Ok(())
    }

    /// Nested `{guid, objects: [...]}` snapshot of a subtree, children in
    /// creation order. The shape lifetime tests compare before and after.
    pub fn scope_state(&self, guid: &str) -> Result<Value> {
        let objects = self.objects.lock();
        if !objects.contains_key(guid) {
            return Err(Error::ObjectNotFound {
                guid: guid.to_string(),
            });
        }
        fn snapshot(objects: &HashMap<Arc<str>, ObjectNode>, guid: &str) -> Value {
            let children: Vec<Value> = objects
                .get(guid)
                .map(|node| {
                    node.children
                        .iter()
                        .map(|child| snapshot(objects, child))
                        .collect()
                })
                .unwrap_or_default();
            serde_json::json!({ "guid": guid, "objects": children })
        }
        Ok(snapshot(&objects, guid))
    }

    /// Routes one request to its object's handler and responds.
    ///
    /// Unknown guids and unknown methods get structured error responses;
    /// handler failures and panics are serialized, never propagated. The
    /// unknown-guid path also covers a command racing a concurrent dispose.
    pub async fn dispatch(self: Arc<Self>, request: Request) {
        let type_name = {
            let objects = self.objects.lock();
            objects.get(&request.guid).map(|node| node.type_name.clone())
        };

        let Some(type_name) = type_name else {
            self.send_error_response(
                request.id,
                Error::ObjectNotFound {
                    guid: request.guid.to_string(),
                }
                .to_payload(),
            );
            return;
        };

        let Some(handler) = self.registry.get(&type_name, &request.method) else {
            self.send_error_response(
                request.id,
                ErrorPayload {
                    message: format!(
                        "`{type_name}` does not implement `{}`",
                        request.method
                    ),
                    name: Some("Error".to_string()),
                    stack: None,
                },
            );
            return;
        };

        tracing::debug!(id = request.id, guid = %request.guid, method = %request.method, "dispatching");
        let call = HandlerCall {
            connection: Arc::clone(&self),
            guid: Arc::clone(&request.guid),
            params: request.params,
        };

        // The handler runs in its own task so a panic is contained and
        // serialized like any other failure.
        let outcome = tokio::spawn(handler(call)).await;
        let response = match outcome {
            Ok(Ok(value)) => Response {
                id: request.id,
                result: if value.is_null() { None } else { Some(value) },
                error: None,
            },
            Ok(Err(error)) => Response {
                id: request.id,
                result: None,
                error: Some(ErrorWrapper {
                    error: error.to_payload(),
                }),
            },
            Err(join_error) => Response {
                id: request.id,
                result: None,
                error: Some(ErrorWrapper {
                    error: ErrorPayload {
                        message: format!("handler panicked: {join_error}"),
                        name: Some("InternalError".to_string()),
                        stack: None,
                    },
                }),
            },
        };
        self.send_response(response);
    }

    /// Runs the message pump until the transport closes.
    ///
    /// Each decoded request is dispatched as its own task, in receipt
    /// order, so a slow handler never blocks decoding. When the transport
    /// goes down the whole tree is dropped; the peer is gone, so no
    /// notifications are sent.
    pub async fn run(self: &Arc<Self>) {
        let TransportTasks {
            parts,
            mut outbound_rx,
        } = self
            .transport
            .lock()
            .take()
            .expect("run() can only be called once - transport already taken");

        let TransportParts {
            mut sender,
            mut receiver,
            mut message_rx,
        } = parts;

        let reader_handle = tokio::spawn(async move {
            if let Err(e) = receiver.run().await {
                tracing::error!(error = %e, "transport read error");
            }
        });

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sender.send(message).await {
                    tracing::error!(error = %e, "transport write error");
                    break;
                }
            }
        });

        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            // A stop() before the subscription above is caught here; one
            // after it wakes the select below.
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let message_value = tokio::select! {
                message = message_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = stop_rx.changed() => break,
            };
            match serde_json::from_value::<Request>(message_value.clone()) {
                Ok(request) => {
                    tokio::spawn(Arc::clone(self).dispatch(request));
                }
                Err(e) => {
                    tracing::error!(error = %e, ?message_value, "malformed request frame");
                    if let Some(id) = message_value.get("id").and_then(Value::as_u64) {
                        self.send_error_response(
                            id as u32,
                            ErrorPayload {
                                message: format!("malformed request: {e}"),
                                name: Some("Error".to_string()),
                                stack: None,
                            },
                        );
                    }
                }
            }
        }

        self.stopped.store(true, Ordering::SeqCst);
        self.objects.lock().retain(|guid, _| guid.is_empty());
        tracing::debug!("transport closed, dispatcher state dropped");

        reader_handle.abort();
        let _ = reader_handle.await;
        writer_handle.abort();
        let _ = writer_handle.await;
    }

    /// Takes the outbound frame queue directly, bypassing the transport.
    #[cfg(test)]
    pub(crate) fn take_outbound(&self) -> mpsc::UnboundedReceiver<Value> {
        self.transport
            .lock()
            .take()
            .expect("transport already taken")
            .outbound_rx
    }

    fn send_response(&self, response: Response) {
        match serde_json::to_value(&response) {
            Ok(value) => self.send_value(value),
            Err(e) => tracing::error!(error = %e, "failed to serialize response"),
        }
    }

    fn send_error_response(&self, id: u32, payload: ErrorPayload) {
        self.send_response(Response {
            id,
            result: None,
            error: Some(ErrorWrapper { error: payload }),
        });
    }

    fn send_event(&self, event: Event) {
        match serde_json::to_value(&event) {
            Ok(value) => self.send_value(value),
            Err(e) => tracing::error!(error = %e, "failed to serialize event"),
        }
    }

    fn send_value(&self, value: Value) {
        if self.outbound_tx.send(value).is_err() && !self.stopped.load(Ordering::SeqCst) {
            tracing::debug!("outbound queue closed, frame dropped");
        }
    }
}

/// Appends the subtree rooted at `guid` to `out` in post-order (children
/// before the node itself).
fn collect_subtree(
    objects: &HashMap<Arc<str>, ObjectNode>,
    guid: &str,
    out: &mut Vec<Arc<str>>,
) {
    if let Some(node) = objects.get(guid) {
        for child in &node.children {
            collect_subtree(objects, child, out);
        }
    }
    if let Some((key, _)) = objects.get_key_value(guid) {
        out.push(Arc::clone(key));
    }
}

#[cfg(test)]
mod tests;
