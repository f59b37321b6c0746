//! Signaling channel interface

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

/// Event delivered by the signaling server
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingEvent {
    pub name: String,
    /// First event argument (`Null` when the event carried none)
    pub payload: Value,
}

impl SignalingEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Continuation resolved with the server's acknowledgment
///
/// Dropped without a value when the transport closes first.
pub type AckReceiver = oneshot::Receiver<Value>;

/// Event transport to the coordination server
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Register interest in an event; unsubscribed events are discarded
    fn subscribe(&mut self, event: &str);

    /// Connect and return the stream of subscribed events
    ///
    /// The stream ends when the transport closes.
    async fn connect(&mut self, url: &str) -> Result<mpsc::Receiver<SignalingEvent>>;

    /// Emit an event and request an acknowledgment
    ///
    /// Fails with `TransportFailure` when not connected.
    fn emit(&self, event: &str, payload: Value) -> Result<AckReceiver>;

    /// Close the transport; calling it again is a no-op
    async fn disconnect(&mut self) -> Result<()>;
}
