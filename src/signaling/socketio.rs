//! Socket.IO signaling transport
//!
//! Speaks Engine.IO (revision 3 or 4) over a WebSocket and the Socket.IO
//! packet layer on top of it. Only text packets are supported.
//!
//! ```text
//! emit() --> outbound queue --> writer task --> ws
//! ws --> reader task --+--> events (subscribed only) --> channel loop
//!                      +--> ack map --> oneshot continuations
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::channel::{AckReceiver, SignalingChannel, SignalingEvent};
use crate::config::{EngineIoRevision, SignalingConfig};
use crate::error::{AppError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_NAMESPACE: &str = "/";
const EVENT_QUEUE_CAPACITY: usize = 256;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

fn transport_error(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::TransportFailure(format!("{}: {}", context, e))
}

/// Build the Engine.IO WebSocket URL for a server URL
///
/// `http` maps to `ws` and `https` to `wss`. The `/socket.io/` path is added
/// unless the URL already names one.
pub fn websocket_url(url: &str, revision: EngineIoRevision) -> Result<String> {
    let url = url.trim();
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| AppError::Config(format!("Signaling URL has no scheme: {}", url)))?;

    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(AppError::Config(format!(
                "Unsupported signaling URL scheme: {}",
                other
            )))
        }
    };

    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let (host, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };
    if host.is_empty() {
        return Err(AppError::Config(format!("Signaling URL has no host: {}", url)));
    }

    let path = path.trim_end_matches('/');
    let path = if path.ends_with("/socket.io") {
        format!("{}/", path)
    } else {
        format!("{}/socket.io/", path)
    };

    Ok(format!(
        "{}://{}{}?EIO={}&transport=websocket",
        scheme,
        host,
        path,
        revision.query_value()
    ))
}

/// Engine.IO packet
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(String),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn parse(frame: &str) -> Result<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| AppError::MalformedMessage("Empty Engine.IO frame".into()))?;
        let body = chars.as_str().to_string();

        match kind {
            '0' => Ok(EnginePacket::Open(body)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(body)),
            '3' => Ok(EnginePacket::Pong(body)),
            '4' => Ok(EnginePacket::Message(body)),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(AppError::MalformedMessage(format!(
                "Unknown Engine.IO packet type: {}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(body) => format!("0{}", body),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(body) => format!("2{}", body),
            EnginePacket::Pong(body) => format!("3{}", body),
            EnginePacket::Message(body) => format!("4{}", body),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

/// Engine.IO handshake data
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25000
}

fn default_ping_timeout() -> u64 {
    20000
}

/// Socket.IO packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
}

impl SocketPacketKind {
    fn code(&self) -> char {
        match self {
            SocketPacketKind::Connect => '0',
            SocketPacketKind::Disconnect => '1',
            SocketPacketKind::Event => '2',
            SocketPacketKind::Ack => '3',
            SocketPacketKind::ConnectError => '4',
        }
    }

    fn from_code(code: char) -> Result<Self> {
        match code {
            '0' => Ok(SocketPacketKind::Connect),
            '1' => Ok(SocketPacketKind::Disconnect),
            '2' => Ok(SocketPacketKind::Event),
            '3' => Ok(SocketPacketKind::Ack),
            '4' => Ok(SocketPacketKind::ConnectError),
            '5' | '6' => Err(AppError::MalformedMessage(
                "Binary Socket.IO packets are not supported".into(),
            )),
            other => Err(AppError::MalformedMessage(format!(
                "Unknown Socket.IO packet type: {}",
                other
            ))),
        }
    }
}

/// Socket.IO packet carried inside an Engine.IO message
#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub kind: SocketPacketKind,
    pub namespace: String,
    pub id: Option<u64>,
    pub data: Option<Value>,
}

impl SocketPacket {
    pub fn new(kind: SocketPacketKind, namespace: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            id: None,
            data: None,
        }
    }

    pub fn event(namespace: &str, id: Option<u64>, event: &str, payload: Value) -> Self {
        Self {
            kind: SocketPacketKind::Event,
            namespace: namespace.to_string(),
            id,
            data: Some(json!([event, payload])),
        }
    }

    pub fn ack(namespace: &str, id: u64, args: Value) -> Self {
        Self {
            kind: SocketPacketKind::Ack,
            namespace: namespace.to_string(),
            id: Some(id),
            data: Some(args),
        }
    }

    /// Parse the body of an Engine.IO message packet
    pub fn parse(body: &str) -> Result<Self> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| AppError::MalformedMessage("Empty Socket.IO packet".into()))?;
        let kind = SocketPacketKind::from_code(kind)?;
        let mut rest = chars.as_str();

        let mut namespace = DEFAULT_NAMESPACE.to_string();
        if rest.starts_with('/') {
            let end = rest.find(',').unwrap_or(rest.len());
            namespace = rest[..end].to_string();
            rest = rest.get(end + 1..).unwrap_or("");
        }

        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let id = if digits > 0 {
            let id = rest[..digits].parse().map_err(|e| {
                AppError::MalformedMessage(format!("Bad Socket.IO packet id: {}", e))
            })?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest).map_err(|e| {
                AppError::MalformedMessage(format!("Bad Socket.IO payload: {}", e))
            })?)
        };

        Ok(Self {
            kind,
            namespace,
            id,
            data,
        })
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.kind.code());
        if self.namespace != DEFAULT_NAMESPACE {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.id {
            out.push_str(&id.to_string());
        }
        if let Some(ref data) = self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    /// Encode as a complete Engine.IO frame
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }

    /// Event name and first argument of an EVENT packet
    fn event_parts(&self) -> Option<(String, Value)> {
        let args = self.data.as_ref()?.as_array()?;
        let name = args.first()?.as_str()?.to_string();
        let payload = args.get(1).cloned().unwrap_or(Value::Null);
        Some((name, payload))
    }
}

/// State shared by the transport tasks of one connection
struct Connection {
    namespace: String,
    outbound: mpsc::UnboundedSender<Message>,
    acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Connection {
    fn send_frame(&self, frame: String) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(AppError::TransportFailure("Signaling connection closed".into()));
        }
        trace!("ws out: {}", frame);
        self.outbound
            .send(Message::Text(frame))
            .map_err(|_| AppError::TransportFailure("Signaling writer stopped".into()))
    }

    fn emit(&self, event: &str, payload: Value) -> Result<AckReceiver> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.acks.lock().insert(id, tx);

        let frame = SocketPacket::event(&self.namespace, Some(id), event, payload).to_frame();
        if let Err(e) = self.send_frame(frame) {
            self.acks.lock().remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    fn resolve_ack(&self, id: u64, args: Option<Value>) {
        let Some(tx) = self.acks.lock().remove(&id) else {
            debug!("Ack for unknown id {}", id);
            return;
        };
        let value = match args {
            Some(Value::Array(mut args)) if !args.is_empty() => args.swap_remove(0),
            Some(Value::Array(_)) | None => Value::Null,
            Some(other) => other,
        };
        let _ = tx.send(value);
    }

    /// Mark closed and drop pending continuations
    fn shut(&self) {
        self.closed.cancel();
        self.acks.lock().clear();
    }
}

/// Socket.IO client implementing [`SignalingChannel`]
pub struct SocketIoChannel {
    revision: EngineIoRevision,
    connect_timeout: Duration,
    namespace: String,
    subscriptions: Arc<RwLock<HashSet<String>>>,
    connection: Option<Arc<Connection>>,
    writer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketIoChannel {
    pub fn new(revision: EngineIoRevision, connect_timeout: Duration) -> Self {
        Self {
            revision,
            connect_timeout,
            namespace: DEFAULT_NAMESPACE.to_string(),
            subscriptions: Arc::new(RwLock::new(HashSet::new())),
            connection: None,
            writer: None,
            tasks: Vec::new(),
        }
    }

    pub fn from_config(config: &SignalingConfig) -> Self {
        Self::new(
            config.engine_io,
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| !c.closed.is_cancelled())
    }

    /// Engine.IO open and Socket.IO namespace connect
    async fn handshake(&self, ws: &mut WsStream) -> Result<OpenInfo> {
        let mut open: Option<OpenInfo> = None;

        while let Some(frame) = ws.next().await {
            let text = match frame.map_err(|e| transport_error("Handshake failed", e))? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            match EnginePacket::parse(&text)? {
                EnginePacket::Open(body) => {
                    let info: OpenInfo = serde_json::from_str(&body)
                        .map_err(|e| transport_error("Bad Engine.IO open packet", e))?;
                    debug!(
                        sid = %info.sid,
                        ping_interval = info.ping_interval,
                        "Engine.IO session opened"
                    );
                    if self.revision == EngineIoRevision::V4 {
                        let connect = SocketPacket::new(SocketPacketKind::Connect, &self.namespace);
                        ws.send(Message::Text(connect.to_frame()))
                            .await
                            .map_err(|e| transport_error("Failed to send CONNECT", e))?;
                    }
                    open = Some(info);
                }
                EnginePacket::Ping(body) => {
                    ws.send(Message::Text(EnginePacket::Pong(body).encode()))
                        .await
                        .map_err(|e| transport_error("Failed to send pong", e))?;
                }
                EnginePacket::Message(body) => {
                    let packet = SocketPacket::parse(&body)?;
                    match packet.kind {
                        SocketPacketKind::Connect if packet.namespace == self.namespace => {
                            return open.ok_or_else(|| {
                                AppError::TransportFailure("CONNECT before Engine.IO open".into())
                            });
                        }
                        SocketPacketKind::ConnectError => {
                            return Err(AppError::TransportFailure(format!(
                                "Namespace connect refused: {}",
                                packet.data.unwrap_or(Value::Null)
                            )));
                        }
                        _ => trace!("Ignoring packet during handshake: {}", body),
                    }
                }
                EnginePacket::Close => break,
                _ => {}
            }
        }

        Err(AppError::TransportFailure(
            "Connection closed during handshake".into(),
        ))
    }
}

#[async_trait]
impl SignalingChannel for SocketIoChannel {
    fn subscribe(&mut self, event: &str) {
        self.subscriptions.write().insert(event.to_string());
    }

    async fn connect(&mut self, url: &str) -> Result<mpsc::Receiver<SignalingEvent>> {
        if self.is_connected() {
            return Err(AppError::TransportFailure("Already connected".into()));
        }

        let ws_url = websocket_url(url, self.revision)?;
        info!("Connecting to signaling server {}", ws_url);

        let connecting = async {
            let (mut ws, _) = connect_async(ws_url.as_str())
                .await
                .map_err(|e| transport_error("WebSocket connect failed", e))?;
            let open = self.handshake(&mut ws).await?;
            Ok::<_, AppError>((ws, open))
        };
        let (ws, open) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| {
                AppError::TransportFailure(format!(
                    "Connect timed out after {:?}",
                    self.connect_timeout
                ))
            })??;

        let (write, read) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let connection = Arc::new(Connection {
            namespace: self.namespace.clone(),
            outbound,
            acks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: CancellationToken::new(),
        });

        let ping_interval = Duration::from_millis(open.ping_interval);
        let idle_timeout = ping_interval + Duration::from_millis(open.ping_timeout);

        self.writer = Some(tokio::spawn(run_writer(
            write,
            outbound_rx,
            connection.closed.clone(),
        )));
        self.tasks.push(tokio::spawn(run_reader(
            read,
            connection.clone(),
            events_tx,
            self.subscriptions.clone(),
            self.revision,
            idle_timeout,
        )));
        if self.revision == EngineIoRevision::V3 {
            self.tasks
                .push(tokio::spawn(run_pinger(connection.clone(), ping_interval)));
        }

        self.connection = Some(connection);
        info!(sid = %open.sid, "Connected to signaling server");
        Ok(events_rx)
    }

    fn emit(&self, event: &str, payload: Value) -> Result<AckReceiver> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| AppError::TransportFailure("Not connected".into()))?;
        connection.emit(event, payload)
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };

        if !connection.closed.is_cancelled() {
            let goodbye = SocketPacket::new(SocketPacketKind::Disconnect, &connection.namespace);
            let _ = connection.send_frame(goodbye.to_frame());
            let _ = connection.outbound.send(Message::Close(None));
        }

        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
                debug!("Signaling writer did not drain in time");
            }
        }

        connection.shut();
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        info!("Disconnected from signaling server");
        Ok(())
    }
}

impl Drop for SocketIoChannel {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shut();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn run_writer(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = closed.cancelled() => break,
        };

        let is_close = matches!(message, Message::Close(_));
        if let Err(e) = write.send(message).await {
            debug!("Signaling write failed: {}", e);
            closed.cancel();
            break;
        }
        if is_close {
            break;
        }
    }
    trace!("Signaling writer exited");
}

async fn run_reader(
    mut read: SplitStream<WsStream>,
    connection: Arc<Connection>,
    events: mpsc::Sender<SignalingEvent>,
    subscriptions: Arc<RwLock<HashSet<String>>>,
    revision: EngineIoRevision,
    idle_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            _ = connection.closed.cancelled() => break,
            frame = tokio::time::timeout(idle_timeout, read.next()) => frame,
        };

        let text = match frame {
            Err(_) => {
                warn!("No traffic from signaling server for {:?}", idle_timeout);
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                info!("Signaling server closed the connection");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => {
                warn!("Signaling connection error: {}", e);
                break;
            }
        };
        trace!("ws in: {}", text);

        let packet = match EnginePacket::parse(&text) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping frame: {}", e);
                continue;
            }
        };

        match packet {
            EnginePacket::Ping(body) if revision == EngineIoRevision::V4 => {
                if connection.send_frame(EnginePacket::Pong(body).encode()).is_err() {
                    break;
                }
            }
            EnginePacket::Message(body) => {
                let packet = match SocketPacket::parse(&body) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("Dropping packet: {}", e);
                        continue;
                    }
                };
                if !handle_packet(&connection, packet, &events, &subscriptions).await {
                    break;
                }
            }
            EnginePacket::Close => {
                info!("Signaling server closed the session");
                break;
            }
            _ => {}
        }
    }

    connection.shut();
    trace!("Signaling reader exited");
}

/// Returns false when the connection should end
async fn handle_packet(
    connection: &Connection,
    packet: SocketPacket,
    events: &mpsc::Sender<SignalingEvent>,
    subscriptions: &RwLock<HashSet<String>>,
) -> bool {
    match packet.kind {
        SocketPacketKind::Event => {
            let Some((name, payload)) = packet.event_parts() else {
                debug!("Dropping event without a name");
                return true;
            };
            if let Some(id) = packet.id {
                let ack = SocketPacket::ack(&connection.namespace, id, json!([]));
                let _ = connection.send_frame(ack.to_frame());
            }
            if !subscriptions.read().contains(&name) {
                trace!("Unsubscribed event: {}", name);
                return true;
            }
            if events.send(SignalingEvent::new(name, payload)).await.is_err() {
                debug!("Event receiver dropped");
            }
            true
        }
        SocketPacketKind::Ack => {
            if let Some(id) = packet.id {
                connection.resolve_ack(id, packet.data);
            }
            true
        }
        SocketPacketKind::Disconnect => {
            info!("Server disconnected namespace {}", packet.namespace);
            false
        }
        SocketPacketKind::ConnectError => {
            let data = packet.data.unwrap_or(Value::Null);
            warn!("Namespace error: {}", data);
            false
        }
        SocketPacketKind::Connect => true,
    }
}

/// Revision 3 clients ping the server
async fn run_pinger(connection: Arc<Connection>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = connection.closed.cancelled() => break,
            _ = ticker.tick() => {
                if connection.send_frame(EnginePacket::Ping(String::new()).encode()).is_err() {
                    break;
                }
            }
        }
    }
}
