//! Channel - the typed command surface of a remote object proxy.
//!
//! A `Channel` binds a guid to a connection and serializes method calls
//! into request frames. Generated params/result types from the schema
//! plug into [`Channel::send`] through their serde implementations.

use crate::connection::ConnectionLike;
use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Command channel for one remote object.
#[derive(Clone)]
pub struct Channel {
    guid: Arc<str>,
    connection: Arc<dyn ConnectionLike>,
}

impl Channel {
    pub fn new(guid: Arc<str>, connection: Arc<dyn ConnectionLike>) -> Self {
        Self { guid, connection }
    }

    /// Sends a command and deserializes its result.
    pub async fn send<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R> {
        let params = serde_json::to_value(params)?;
        let result = self.connection.send_message(&self.guid, method, params).await?;
        serde_json::from_value(result).map_err(Into::into)
    }

    /// Sends a command that takes no parameters.
    pub async fn send_no_params<R: DeserializeOwned>(&self, method: &str) -> Result<R> {
        self.send(method, Value::Null).await
    }

    /// Sends a command whose result is void.
    pub async fn send_no_result<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let _: Value = self.send(method, params).await?;
        Ok(())
    }

    /// The guid this channel addresses.
    pub fn guid(&self) -> &str {
        &self.guid
    }
}
