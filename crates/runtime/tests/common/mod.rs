//! Shared proxy stand-ins for integration tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tiller_runtime::{
    Channel, ConnectionLike, DisposeReason, ObjectFactory, Parent, RemoteObject, RemoteObjectCore,
    Result,
};

/// Generic proxy that records events, standing in for generated bindings.
pub struct TestObject {
    pub core: RemoteObjectCore,
    pub events: Mutex<Vec<(String, Value)>>,
}

impl tiller_runtime::remote_object::private::Sealed for TestObject {}

impl RemoteObject for TestObject {
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

/// Factory building [`TestObject`] proxies for every protocol type.
pub struct TestFactory;

impl ObjectFactory for TestFactory {
    fn create_object(
        &self,
        parent: Parent,
        type_name: String,
        guid: Arc<str>,
        initializer: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn RemoteObject>>> + Send + '_>> {
        Box::pin(async move {
            Ok(Arc::new(TestObject {
                core: RemoteObjectCore::new(parent, type_name, guid, initializer),
                events: Mutex::new(Vec::new()),
            }) as Arc<dyn RemoteObject>)
        })
    }
}
