use super::*;
use crate::transport::loopback;
use serde_json::json;
use tiller_protocol::Metadata;

fn test_dispatcher(registry: HandlerRegistry) -> (Arc<DispatcherConnection>, mpsc::UnboundedReceiver<Value>) {
    let (_client, server) = loopback(256);
    let connection = DispatcherConnection::new(registry, server);
    let outbound = connection.take_outbound();
    (connection, outbound)
}

fn request(id: u32, guid: &str, method: &str, params: Value) -> Request {
    Request {
        id,
        guid: Arc::from(guid),
        method: method.to_string(),
        params,
        metadata: Metadata::now(),
    }
}

fn echo_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("Session", "echo", |call: HandlerCall| async move {
            Ok(json!({"echo": call.params}))
        })
        .unwrap();
    registry
        .register("Session", "noop", |_call: HandlerCall| async move {
            Ok(Value::Null)
        })
        .unwrap();
    registry
        .register("Session", "fail", |_call: HandlerCall| async move {
            Err(Error::Remote {
                name: "TimeoutError".to_string(),
                message: "deliberate".to_string(),
                stack: Some("at handler".to_string()),
            })
        })
        .unwrap();
    registry
        .register("Session", "panic", |_call: HandlerCall| async move {
            panic!("boom")
        })
        .unwrap();
    registry
}

#[test]
fn test_registry_rejects_duplicate_handlers() {
    let mut registry = HandlerRegistry::new();
    registry
        .register("Session", "ping", |_| async { Ok(Value::Null) })
        .unwrap();
    let err = registry
        .register("Session", "ping", |_| async { Ok(Value::Null) })
        .unwrap_err();
    assert!(matches!(err, Error::Registration(_)));
}

#[test]
fn test_registry_validates_against_catalog() {
    let catalog = MethodCatalog::from_pairs([("Session", vec!["snapshot"])]);
    let mut registry = HandlerRegistry::with_catalog(catalog);

    registry
        .register("Session", "snapshot", |_| async { Ok(Value::Null) })
        .unwrap();
    let err = registry
        .register("Session", "snapshoot", |_| async { Ok(Value::Null) })
        .unwrap_err();
    assert!(matches!(err, Error::Registration(_)));
    assert!(err.to_string().contains("snapshoot"));
}

#[test]
fn test_create_object_announces_before_anything_else() {
    let (connection, mut outbound) = test_dispatcher(HandlerRegistry::new());

    let guid = connection
        .create_object(ROOT_GUID, "Session", json!({"name": "main"}))
        .unwrap();
    assert_eq!(guid.as_ref(), "session@1");

    let frame = outbound.try_recv().unwrap();
    assert_eq!(frame["guid"], "");
    assert_eq!(frame["method"], METHOD_CREATE);
    assert_eq!(frame["params"]["type"], "Session");
    assert_eq!(frame["params"]["guid"], "session@1");
    assert_eq!(frame["params"]["initializer"]["name"], "main");
}

#[test]
fn test_guids_are_monotonic_per_process() {
    let (connection, _outbound) = test_dispatcher(HandlerRegistry::new());
    let a = connection.create_object(ROOT_GUID, "Page", json!({})).unwrap();
    let b = connection.create_object(ROOT_GUID, "Page", json!({})).unwrap();
    let c = connection.create_object(&a, "Frame", json!({})).unwrap();
    assert_eq!(a.as_ref(), "page@1");
    assert_eq!(b.as_ref(), "page@2");
    assert_eq!(c.as_ref(), "frame@3");
}

#[test]
fn test_create_under_unknown_parent_fails() {
    let (connection, _outbound) = test_dispatcher(HandlerRegistry::new());
    let err = connection
        .create_object("ghost@1", "Page", json!({}))
        .unwrap_err();
    assert!(matches!(err, Error::ObjectNotFound { .. }));
}

#[tokio::test]
async fn test_dispatch_success_with_result() {
    let (connection, mut outbound) = test_dispatcher(echo_registry());
    let guid = connection.create_object(ROOT_GUID, "Session", json!({})).unwrap();
    let _create = outbound.recv().await.unwrap();

    Arc::clone(&connection)
        .dispatch(request(1, &guid, "echo", json!({"x": 5})))
        .await;

    let frame = outbound.recv().await.unwrap();
    assert_eq!(frame["id"], 1);
    assert_eq!(frame["result"]["echo"]["x"], 5);
    assert!(frame.get("error").is_none());
}

#[tokio::test]
async fn test_dispatch_void_result_omits_result_field() {
    let (connection, mut outbound) = test_dispatcher(echo_registry());
    let guid = connection.create_object(ROOT_GUID, "Session", json!({})).unwrap();
    let _create = outbound.recv().await.unwrap();

    Arc::clone(&connection)
        .dispatch(request(1, &guid, "noop", json!({"x": 5})))
        .await;

    let frame = outbound.recv().await.unwrap();
    assert_eq!(frame, json!({"id": 1}));
}

#[tokio::test]
async fn test_dispatch_to_unknown_guid_names_it_in_the_error() {
    let (connection, mut outbound) = test_dispatcher(echo_registry());

    Arc::clone(&connection)
        .dispatch(request(7, "session@42", "echo", json!({})))
        .await;

    let frame = outbound.recv().await.unwrap();
    assert_eq!(frame["id"], 7);
    assert!(
        frame["error"]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("session@42")
    );
    assert_eq!(frame["error"]["error"]["name"], "TargetClosedError");
}

#[tokio::test]
async fn test_dispatch_unknown_method_is_a_structured_error() {
    let (connection, mut outbound) = test_dispatcher(echo_registry());
    let guid = connection.create_object(ROOT_GUID, "Session", json!({})).unwrap();
    let _create = outbound.recv().await.unwrap();

    Arc::clone(&connection)
        .dispatch(request(2, &guid, "levitate", json!({})))
        .await;

    let frame = outbound.recv().await.unwrap();
    let message = frame["error"]["error"]["message"].as_str().unwrap();
    assert!(message.contains("Session"));
    assert!(message.contains("levitate"));
}

#[tokio::test]
async fn test_handler_error_is_serialized_with_name_and_stack() {
    let (connection, mut outbound) = test_dispatcher(echo_registry());
    let guid = connection.create_object(ROOT_GUID, "Session", json!({})).unwrap();
    let _create = outbound.recv().await.unwrap();

    Arc::clone(&connection)
        .dispatch(request(3, &guid, "fail", json!({})))
        .await;

    let frame = outbound.recv().await.unwrap();
    assert_eq!(frame["error"]["error"]["message"], "deliberate");
    assert_eq!(frame["error"]["error"]["name"], "TimeoutError");
    assert_eq!(frame["error"]["error"]["stack"], "at handler");
}

#[tokio::test]
async fn test_handler_panic_becomes_an_error_response() {
    let (connection, mut outbound) = test_dispatcher(echo_registry());
    let guid = connection.create_object(ROOT_GUID, "Session", json!({})).unwrap();
    let _create = outbound.recv().await.unwrap();

    Arc::clone(&connection)
        .dispatch(request(4, &guid, "panic", json!({})))
        .await;

    let frame = outbound.recv().await.unwrap();
    assert_eq!(frame["id"], 4);
    assert_eq!(frame["error"]["error"]["name"], "InternalError");
    // The dispatcher survives the panic.
    assert_eq!(connection.live_guids().len(), 1);
}

#[test]
fn test_dispose_notifies_children_before_parent() {
    let (connection, mut outbound) = test_dispatcher(HandlerRegistry::new());
    let context = connection.create_object(ROOT_GUID, "Context", json!({})).unwrap();
    let page = connection.create_object(&context, "Page", json!({})).unwrap();
    let frame = connection.create_object(&page, "Frame", json!({})).unwrap();
    for _ in 0..3 {
        let _create = outbound.try_recv().unwrap();
    }

    connection.dispose(&context).unwrap();

    let order: Vec<String> = (0..3)
        .map(|_| {
            let message = outbound.try_recv().unwrap();
            assert_eq!(message["method"], METHOD_DISPOSE);
            message["guid"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(order, vec![frame.to_string(), page.to_string(), context.to_string()]);
    assert!(connection.live_guids().is_empty());
}

#[test]
fn test_double_dispose_is_a_loud_error() {
    let (connection, _outbound) = test_dispatcher(HandlerRegistry::new());
    let guid = connection.create_object(ROOT_GUID, "Page", json!({})).unwrap();
    connection.dispose(&guid).unwrap();
    let err = connection.dispose(&guid).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn test_root_cannot_be_disposed() {
    let (connection, _outbound) = test_dispatcher(HandlerRegistry::new());
    assert!(matches!(
        connection.dispose(ROOT_GUID),
        Err(Error::Protocol(_))
    ));
}

#[test]
fn test_scope_state_roundtrip_through_dispose() {
    let (connection, _outbound) = test_dispatcher(HandlerRegistry::new());
    let baseline = connection.scope_state(ROOT_GUID).unwrap();

    let context = connection.create_object(ROOT_GUID, "Context", json!({})).unwrap();
    let _page = connection.create_object(&context, "Page", json!({})).unwrap();

    let nested = connection.scope_state(ROOT_GUID).unwrap();
    assert_eq!(
        nested,
        json!({
            "guid": "",
            "objects": [{
                "guid": "context@1",
                "objects": [{ "guid": "page@2", "objects": [] }],
            }],
        })
    );

    connection.dispose(&context).unwrap();
    assert_eq!(connection.scope_state(ROOT_GUID).unwrap(), baseline);
}

#[test]
fn test_emit_event_for_live_object_writes_frame() {
    let (connection, mut outbound) = test_dispatcher(HandlerRegistry::new());
    let guid = connection.create_object(ROOT_GUID, "Session", json!({})).unwrap();
    let _create = outbound.try_recv().unwrap();

    connection.emit_event(&guid, "log", json!({"line": "hi"})).unwrap();
    let frame = outbound.try_recv().unwrap();
    assert_eq!(frame["guid"], guid.as_ref());
    assert_eq!(frame["method"], "log");
    assert_eq!(frame["params"]["line"], "hi");
}

#[test]
fn test_emit_event_for_disposed_object_is_dropped_silently() {
    let (connection, mut outbound) = test_dispatcher(HandlerRegistry::new());
    let guid = connection.create_object(ROOT_GUID, "Session", json!({})).unwrap();
    connection.dispose(&guid).unwrap();
    while outbound.try_recv().is_ok() {}

    connection.emit_event(&guid, "log", json!({})).unwrap();
    assert!(outbound.try_recv().is_err());
}

#[test]
fn test_emit_event_rejects_reserved_methods() {
    let (connection, _outbound) = test_dispatcher(HandlerRegistry::new());
    let guid = connection.create_object(ROOT_GUID, "Session", json!({})).unwrap();
    let err = connection.emit_event(&guid, METHOD_DISPOSE, json!({})).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[test]
fn test_adopt_reparents_and_announces() {
    let (connection, mut outbound) = test_dispatcher(HandlerRegistry::new());
    let a = connection.create_object(ROOT_GUID, "Context", json!({})).unwrap();
    let b = connection.create_object(ROOT_GUID, "Context", json!({})).unwrap();
    let page = connection.create_object(&a, "Page", json!({})).unwrap();
    for _ in 0..3 {
        let _create = outbound.try_recv().unwrap();
    }

    connection.adopt(&page, &b).unwrap();

    let frame = outbound.try_recv().unwrap();
    assert_eq!(frame["guid"], b.as_ref());
    assert_eq!(frame["method"], METHOD_ADOPT);
    assert_eq!(frame["params"]["guid"], page.as_ref());

    // Disposing the old parent no longer touches the page.
    connection.dispose(&a).unwrap();
    assert!(connection.live_guids().contains(&page));
}

#[tokio::test]
async fn test_handlers_can_create_children_and_emit() {
    let mut registry = HandlerRegistry::new();
    registry
        .register("Context", "newPage", |call: HandlerCall| async move {
            let guid = call
                .connection
                .create_object(&call.guid, "Page", json!({}))?;
            call.connection.emit_event(&guid, "ready", json!({}))?;
            Ok(json!({"page": {"guid": guid.as_ref()}}))
        })
        .unwrap();

    let (connection, mut outbound) = test_dispatcher(registry);
    let context = connection.create_object(ROOT_GUID, "Context", json!({})).unwrap();
    let _create = outbound.recv().await.unwrap();

    Arc::clone(&connection)
        .dispatch(request(1, &context, "newPage", json!({})))
        .await;

    // Creation is announced before the event and the response.
    let create = outbound.recv().await.unwrap();
    assert_eq!(create["method"], METHOD_CREATE);
    assert_eq!(create["params"]["guid"], "page@2");
    let ready = outbound.recv().await.unwrap();
    assert_eq!(ready["method"], "ready");
    let response = outbound.recv().await.unwrap();
    assert_eq!(response["result"]["page"]["guid"], "page@2");
}
