use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tokio::io::duplex;

use super::*;
use crate::channel::Channel;
use crate::remote_object::{DisposeReason, Parent, RemoteObject, RemoteObjectCore};
use crate::transport::PipeTransport;
use tiller_protocol::{ErrorPayload, ErrorWrapper, Event};

fn create_test_connection() -> Arc<Connection> {
    let (_near_read, near_write) = duplex(1024);
    let (far_read, _far_write) = duplex(1024);

    let (transport, message_rx) = PipeTransport::new(near_write, far_read);
    let parts = transport.into_transport_parts(message_rx);
    Arc::new(Connection::new(parts))
}

/// Proxy that records every event it receives.
struct RecordingObject {
    core: RemoteObjectCore,
    events: parking_lot::Mutex<Vec<(String, Value)>>,
}

impl crate::remote_object::private::Sealed for RecordingObject {}

impl RemoteObject for RecordingObject {
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
    fn channel(&self) -> &Channel {
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
        self.events.lock().push((method.to_string(), params));
    }
    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
    fn was_collected(&self) -> bool {
        self.core.was_collected()
    }
}

/// Factory that builds [`RecordingObject`] proxies for every type.
struct RecordingFactory;

impl ObjectFactory for RecordingFactory {
    fn create_object(
        &self,
        parent: Parent,
        type_name: String,
        guid: Arc<str>,
        initializer: Value,
    ) -> std::pin::Pin<
        Box<dyn Future<Output = Result<Arc<dyn RemoteObject>>> + Send + '_>,
    > {
        Box::pin(async move {
            Ok(Arc::new(RecordingObject {
                core: RemoteObjectCore::new(parent, type_name, guid, initializer),
                events: parking_lot::Mutex::new(Vec::new()),
            }) as Arc<dyn RemoteObject>)
        })
    }
}

fn create_event(parent: &str, type_name: &str, guid: &str) -> Message {
    Message::Event(Event {
        guid: Arc::from(parent),
        method: METHOD_CREATE.to_string(),
        params: serde_json::json!({
            "type": type_name,
            "guid": guid,
            "initializer": {},
        }),
    })
}

fn dispose_event(guid: &str) -> Message {
    Message::Event(Event {
        guid: Arc::from(guid),
        method: METHOD_DISPOSE.to_string(),
        params: serde_json::json!({}),
    })
}

#[test]
fn test_request_ids_increment_from_one() {
    let connection = create_test_connection();
    let first = connection.last_id.fetch_add(1, Ordering::SeqCst) + 1;
    let second = connection.last_id.fetch_add(1, Ordering::SeqCst) + 1;
    assert_eq!(first, 1);
    assert_eq!(second, 2);
}

#[tokio::test]
async fn test_response_resolves_pending_call() {
    let connection = create_test_connection();

    let (tx, rx) = tokio::sync::oneshot::channel();
    connection.callbacks.lock().insert(1, tx);

    let response = Message::Response(Response {
        id: 1,
        result: Some(serde_json::json!({"status": "ok"})),
        error: None,
    });
    connection.dispatch(response).await.unwrap();

    let result = rx.await.unwrap().unwrap();
    assert_eq!(result["status"], "ok");
}

#[tokio::test]
async fn test_error_response_rejects_pending_call() {
    let connection = create_test_connection();

    let (tx, rx) = tokio::sync::oneshot::channel();
    connection.callbacks.lock().insert(1, tx);

    let response = Message::Response(Response {
        id: 1,
        result: None,
        error: Some(ErrorWrapper {
            error: ErrorPayload {
                message: "target crashed".to_string(),
                name: Some("TargetClosedError".to_string()),
                stack: Some("at dispatch".to_string()),
            },
        }),
    });
    connection.dispatch(response).await.unwrap();

    let err = rx.await.unwrap().unwrap_err();
    assert!(err.is_target_closed());
    assert_eq!(err.stack_trace(), Some("at dispatch"));
}

#[tokio::test]
async fn test_unmatched_response_id_is_a_protocol_violation() {
    let connection = create_test_connection();

    let response = Message::Response(Response {
        id: 99,
        result: Some(Value::Null),
        error: None,
    });
    let err = connection.dispatch(response).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(err.to_string().contains("99"));
}

#[tokio::test]
async fn test_create_builds_and_links_proxy() {
    let connection = create_test_connection();
    connection.set_factory(Arc::new(RecordingFactory));
    connection.ensure_root();

    connection
        .dispatch(create_event("", "Session", "session@1"))
        .await
        .unwrap();

    let session = connection.try_get_object("session@1").unwrap();
    assert_eq!(session.type_name(), "Session");
    assert_eq!(session.parent().unwrap().guid(), "");
    assert_eq!(connection.mirrored_guids(), vec![Arc::from("session@1")]);
}

#[tokio::test]
async fn test_create_under_unknown_parent_is_a_protocol_violation() {
    let connection = create_test_connection();
    connection.set_factory(Arc::new(RecordingFactory));
    connection.ensure_root();

    let err = connection
        .dispatch(create_event("ghost@9", "Session", "session@1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn test_dispose_removes_proxy_from_mirror() {
    let connection = create_test_connection();
    connection.set_factory(Arc::new(RecordingFactory));
    connection.ensure_root();

    connection
        .dispatch(create_event("", "Session", "session@1"))
        .await
        .unwrap();
    connection.dispatch(dispose_event("session@1")).await.unwrap();

    assert!(connection.try_get_object("session@1").is_none());
    assert!(connection.mirrored_guids().is_empty());
}

#[tokio::test]
async fn test_dispose_for_unknown_guid_is_tolerated() {
    let connection = create_test_connection();
    connection.ensure_root();
    connection.dispatch(dispose_event("ghost@1")).await.unwrap();
}

#[tokio::test]
async fn test_gc_dispose_reason_is_recorded() {
    let connection = create_test_connection();
    connection.set_factory(Arc::new(RecordingFactory));
    connection.ensure_root();

    connection
        .dispatch(create_event("", "Handle", "handle@1"))
        .await
        .unwrap();
    let handle = connection.try_get_object("handle@1").unwrap();

    connection
        .dispatch(Message::Event(Event {
            guid: Arc::from("handle@1"),
            method: METHOD_DISPOSE.to_string(),
            params: serde_json::json!({"reason": "gc"}),
        }))
        .await
        .unwrap();

    assert!(handle.was_collected());
}

#[tokio::test]
async fn test_events_are_delivered_to_proxy_in_order() {
    let connection = create_test_connection();
    connection.set_factory(Arc::new(RecordingFactory));
    connection.ensure_root();

    connection
        .dispatch(create_event("", "Session", "session@1"))
        .await
        .unwrap();

    for i in 0..3 {
        connection
            .dispatch(Message::Event(Event {
                guid: Arc::from("session@1"),
                method: "log".to_string(),
                params: serde_json::json!({"seq": i}),
            }))
            .await
            .unwrap();
    }

    let session = connection.try_get_object("session@1").unwrap();
    let recording = session.downcast_ref::<RecordingObject>().unwrap();
    let events = recording.events.lock();
    assert_eq!(events.len(), 3);
    for (i, (method, params)) in events.iter().enumerate() {
        assert_eq!(method, "log");
        assert_eq!(params["seq"], i);
    }
}

#[tokio::test]
async fn test_event_for_unknown_guid_is_dropped() {
    let connection = create_test_connection();
    connection.ensure_root();

    connection
        .dispatch(Message::Event(Event {
            guid: Arc::from("gone@1"),
            method: "log".to_string(),
            params: Value::Null,
        }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_adopt_moves_child_between_parents() {
    let connection = create_test_connection();
    connection.set_factory(Arc::new(RecordingFactory));
    connection.ensure_root();

    connection
        .dispatch(create_event("", "Context", "context@1"))
        .await
        .unwrap();
    connection
        .dispatch(create_event("", "Context", "context@2"))
        .await
        .unwrap();
    connection
        .dispatch(create_event("context@1", "Page", "page@1"))
        .await
        .unwrap();

    connection
        .dispatch(Message::Event(Event {
            guid: Arc::from("context@2"),
            method: METHOD_ADOPT.to_string(),
            params: serde_json::json!({"guid": "page@1"}),
        }))
        .await
        .unwrap();

    let page = connection.try_get_object("page@1").unwrap();
    assert_eq!(page.parent().unwrap().guid(), "context@2");
}

#[tokio::test]
async fn test_teardown_rejects_all_pending_calls_once() {
    let connection = create_test_connection();
    connection.ensure_root();

    let mut receivers = Vec::new();
    for id in 1..=3u32 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        connection.callbacks.lock().insert(id, tx);
        receivers.push(rx);
    }

    connection.teardown();

    for rx in receivers {
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
    assert!(connection.callbacks.lock().is_empty());
    assert!(connection.is_closed());
}

#[tokio::test]
async fn test_teardown_disposes_entire_local_tree() {
    let connection = create_test_connection();
    connection.set_factory(Arc::new(RecordingFactory));
    connection.ensure_root();

    connection
        .dispatch(create_event("", "Context", "context@1"))
        .await
        .unwrap();
    connection
        .dispatch(create_event("context@1", "Page", "page@1"))
        .await
        .unwrap();
    let page = connection.try_get_object("page@1").unwrap();

    connection.teardown();

    assert!(page.is_disposed());
    assert!(connection.try_get_object("context@1").is_none());
    assert!(connection.try_get_object("page@1").is_none());
}

#[tokio::test]
async fn test_send_message_after_close_fails_synchronously() {
    let connection = create_test_connection();
    connection.ensure_root();
    connection.teardown();

    let err = connection
        .send_message("session@1", "ping", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
    assert!(connection.callbacks.lock().is_empty());
}

#[tokio::test]
async fn test_abandoned_call_cleans_up_its_callback() {
    let connection = create_test_connection();

    let future = connection.send_message("session@1", "slow", Value::Null);
    // Poll once so the callback registers, then drop the future.
    tokio::select! {
        biased;
        _ = future => panic!("no response was sent"),
        _ = std::future::ready(()) => {}
    }

    assert!(connection.callbacks.lock().is_empty());
}
