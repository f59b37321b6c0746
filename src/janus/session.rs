//! Janus session and plugin handles
//!
//! `create`, `attach` and `destroy` are answered in the POST reply. Plugin
//! messages are only acknowledged there; their result arrives later on the
//! long poll and is matched back by transaction id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::transport::JanusTransport;
use crate::error::{AppError, Result};
use crate::session::SessionDescription;

/// Video room plugin package name
pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

const EVENT_QUEUE: usize = 32;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

fn transaction_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn janus_error(reply: &Value) -> AppError {
    let error = &reply["error"];
    AppError::TransportFailure(format!(
        "Janus error {}: {}",
        error["code"],
        error["reason"].as_str().unwrap_or("unknown")
    ))
}

fn expect_success(reply: &Value) -> Result<()> {
    match reply["janus"].as_str() {
        Some("success") => Ok(()),
        Some("error") => Err(janus_error(reply)),
        _ => Err(AppError::MalformedMessage(format!(
            "Unexpected Janus reply: {}",
            reply
        ))),
    }
}

fn success_id(reply: &Value) -> Result<u64> {
    expect_success(reply)?;
    reply["data"]["id"]
        .as_u64()
        .ok_or_else(|| AppError::MalformedMessage("Janus reply without data.id".into()))
}

/// Event pushed by the server that no request is waiting for
#[derive(Debug, Clone)]
pub struct JanusEvent {
    /// The `janus` field: `event`, `webrtcup`, `media`, `hangup`, ...
    pub kind: String,
    /// Plugin handle the event is about
    pub sender: Option<u64>,
    pub payload: Value,
}

impl JanusEvent {
    fn from_value(payload: Value) -> Self {
        Self {
            kind: payload["janus"].as_str().unwrap_or_default().to_string(),
            sender: payload["sender"].as_u64(),
            payload,
        }
    }

    /// Whether the server tore down the media session or the handle
    pub fn ends_session(&self) -> bool {
        matches!(self.kind.as_str(), "hangup" | "detached" | "timeout")
    }
}

/// Plugin attached to a session
#[derive(Debug, Clone)]
pub struct PluginHandle {
    pub id: u64,
    pub plugin: String,
    url: String,
}

/// Result of a plugin message
#[derive(Debug, Clone)]
pub struct PluginReply {
    /// `plugindata.data`
    pub data: Value,
    pub jsep: Option<SessionDescription>,
}

impl PluginReply {
    fn decode(reply: &Value) -> Result<Self> {
        if reply["janus"] == "error" {
            return Err(janus_error(reply));
        }

        let data = reply["plugindata"]["data"].clone();
        if let Some(error) = data.get("error") {
            return Err(AppError::TransportFailure(format!(
                "Plugin error {}: {}",
                data["error_code"],
                error.as_str().unwrap_or("unknown")
            )));
        }

        let jsep = match reply.get("jsep") {
            Some(jsep) if !jsep.is_null() => Some(
                serde_json::from_value::<SessionDescription>(jsep.clone())
                    .map_err(|e| AppError::MalformedMessage(format!("Bad jsep: {}", e)))?,
            ),
            _ => None,
        };

        Ok(Self { data, jsep })
    }
}

/// One session on a Janus server
///
/// Owns the long-poll task that keeps the session alive and delivers events.
pub struct JanusSession {
    transport: Arc<dyn JanusTransport>,
    id: u64,
    url: String,
    request_timeout: Duration,
    pending: Pending,
    /// Cancelled once polling has stopped
    closed: CancellationToken,
    poller: Option<JoinHandle<()>>,
    destroyed: bool,
}

impl JanusSession {
    /// Create a session and start long-polling it
    pub async fn create(
        transport: Arc<dyn JanusTransport>,
        root_url: &str,
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<JanusEvent>)> {
        let root_url = root_url.trim_end_matches('/');
        let reply = transport
            .post(root_url, json!({"janus": "create", "transaction": transaction_id()}))
            .await?;
        let id = success_id(&reply)?;
        let url = format!("{}/{}", root_url, id);
        info!(janus_session = id, "Janus session created");

        let pending: Pending = Arc::default();
        let closed = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let poller = tokio::spawn(run_poller(
            transport.clone(),
            url.clone(),
            pending.clone(),
            events_tx,
            closed.clone(),
        ));

        let session = Self {
            transport,
            id,
            url,
            request_timeout,
            pending,
            closed,
            poller: Some(poller),
            destroyed: false,
        };
        Ok((session, events_rx))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether events are still being received
    pub fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }

    pub async fn attach(&self, plugin: &str) -> Result<PluginHandle> {
        let reply = self
            .transport
            .post(
                &self.url,
                json!({"janus": "attach", "plugin": plugin, "transaction": transaction_id()}),
            )
            .await?;
        let id = success_id(&reply)?;
        debug!(janus_session = self.id, handle_id = id, "Attached {}", plugin);

        Ok(PluginHandle {
            id,
            plugin: plugin.to_string(),
            url: format!("{}/{}", self.url, id),
        })
    }

    /// Send a plugin message and wait for its result
    pub async fn message(
        &self,
        handle: &PluginHandle,
        body: Value,
        jsep: Option<Value>,
    ) -> Result<PluginReply> {
        if !self.is_alive() {
            return Err(AppError::TransportFailure("Janus session is closed".into()));
        }

        let transaction = transaction_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(transaction.clone(), tx);

        let mut request = json!({
            "janus": "message",
            "transaction": transaction,
            "body": body,
        });
        if let Some(jsep) = jsep {
            request["jsep"] = jsep;
        }

        let reply = match self.transport.post(&handle.url, request).await {
            Ok(reply) => reply,
            Err(e) => {
                self.pending.lock().remove(&transaction);
                return Err(e);
            }
        };

        if reply["janus"] != "ack" {
            // Synchronous plugin result or an error
            self.pending.lock().remove(&transaction);
            return PluginReply::decode(&reply);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(event)) => PluginReply::decode(&event),
            Ok(Err(_)) => Err(AppError::TransportFailure(
                "Janus session closed before the reply".into(),
            )),
            Err(_) => {
                self.pending.lock().remove(&transaction);
                Err(AppError::TransportFailure(format!(
                    "No reply from {} within {:?}",
                    handle.plugin, self.request_timeout
                )))
            }
        }
    }

    /// Stop polling and destroy the session on the server
    ///
    /// Only the first call contacts the server.
    pub async fn destroy(&mut self) -> Result<()> {
        self.stop_polling();
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        let reply = self
            .transport
            .post(&self.url, json!({"janus": "destroy", "transaction": transaction_id()}))
            .await?;
        expect_success(&reply)?;
        info!(janus_session = self.id, "Janus session destroyed");
        Ok(())
    }

    fn stop_polling(&mut self) {
        self.closed.cancel();
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.pending.lock().clear();
    }
}

impl Drop for JanusSession {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

async fn run_poller(
    transport: Arc<dyn JanusTransport>,
    url: String,
    pending: Pending,
    events: mpsc::Sender<JanusEvent>,
    closed: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = closed.cancelled() => break,
            result = transport.poll(&url) => result,
        };

        let batch = match result {
            Ok(Value::Array(batch)) => batch,
            Ok(value) => vec![value],
            Err(e) => {
                warn!("Janus long poll ended: {}", e);
                break;
            }
        };

        for message in batch {
            if message["janus"] == "keepalive" {
                trace!("Janus keepalive");
                continue;
            }

            let waiter = message["transaction"]
                .as_str()
                .and_then(|transaction| pending.lock().remove(transaction));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => {
                    if events.send(JanusEvent::from_value(message)).await.is_err() {
                        debug!("Janus event receiver dropped");
                    }
                }
            }
        }
    }

    closed.cancel();
    pending.lock().clear();
    trace!("Janus poller exited");
}
