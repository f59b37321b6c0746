//! In-crate test doubles

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::device::DeviceLink;
use crate::error::{AppError, Result};
use crate::janus::{JanusTransport, VIDEOROOM_PLUGIN};
use crate::session::{
    DataChannelInfo, IceCandidate, NegotiatorFactory, PeerIdentity, SessionDescription,
    SessionNegotiator,
};
use crate::signaling::{AckReceiver, SignalingChannel, SignalingEvent, EASYRTC_AUTH};

pub fn sample_candidate() -> IceCandidate {
    IceCandidate::parse(
        "candidate:842163049 1 udp 1677729535 192.168.1.20 54321 typ host generation 0",
    )
    .unwrap()
    .with_mid(Some("0".into()), Some(0))
}

#[derive(Default)]
struct NegotiatorState {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    local: Mutex<Option<SessionDescription>>,
    candidates: AtomicUsize,
    closes: AtomicUsize,
}

/// Negotiator that records calls; clones share state
#[derive(Clone, Default)]
pub struct FakeNegotiator {
    state: Arc<NegotiatorState>,
}

impl FakeNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named step (`set_remote`, `create_answer`, `close`, ...) fail
    pub fn fail_on(&self, step: &str) {
        self.state.failing.lock().insert(step.to_string());
    }

    /// Make the named step take `delay` before it completes
    pub fn delay_on(&self, step: &str, delay: Duration) {
        self.state.delays.lock().insert(step.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().clone()
    }

    pub fn candidate_count(&self) -> usize {
        self.state.candidates.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    async fn step(&self, step: &str, call: String) -> Result<()> {
        self.state.calls.lock().push(call);
        let delay = self.state.delays.lock().get(step).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.failing.lock().contains(step) {
            Err(AppError::NegotiationFailure(format!("{} rejected", step)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionNegotiator for FakeNegotiator {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.step("set_remote", format!("set_remote:{}", description.sdp_type))
            .await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.step("create_answer", "create_answer".into()).await?;
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.step("create_offer", "create_offer".into()).await?;
        Ok(SessionDescription::offer("v=0 local offer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.step("set_local", format!("set_local:{}", description.sdp_type))
            .await?;
        *self.state.local.lock() = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.local.lock().clone()
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        self.step("candidate", "candidate".into()).await?;
        self.state.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<DataChannelInfo> {
        self.step("data_channel", format!("data_channel:{}", label))
            .await?;
        Ok(DataChannelInfo {
            label: label.to_string(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.step("close", "close".into()).await
    }
}

/// Factory handing out [`FakeNegotiator`]s and keeping them for inspection
#[derive(Clone, Default)]
pub struct FakeNegotiatorFactory {
    created: Arc<Mutex<Vec<FakeNegotiator>>>,
    failing_step: Option<String>,
    delayed_step: Option<(String, Duration)>,
}

impl FakeNegotiatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every negotiator created fails the named step
    pub fn failing_on(step: &str) -> Self {
        Self {
            failing_step: Some(step.to_string()),
            ..Self::default()
        }
    }

    /// Every negotiator created takes `delay` in the named step
    pub fn delaying(step: &str, delay: Duration) -> Self {
        Self {
            delayed_step: Some((step.to_string(), delay)),
            ..Self::default()
        }
    }

    pub fn negotiators(&self) -> Vec<FakeNegotiator> {
        self.created.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn total_closes(&self) -> usize {
        self.created.lock().iter().map(|n| n.close_count()).sum()
    }
}

#[async_trait]
impl NegotiatorFactory for FakeNegotiatorFactory {
    async fn create(&self, _identity: &PeerIdentity) -> Result<Box<dyn SessionNegotiator>> {
        let negotiator = FakeNegotiator::new();
        if let Some(ref step) = self.failing_step {
            negotiator.fail_on(step);
        }
        if let Some((ref step, delay)) = self.delayed_step {
            negotiator.delay_on(step, delay);
        }
        self.created.lock().push(negotiator.clone());
        Ok(Box::new(negotiator))
    }
}

/// Device link writing into memory
#[derive(Clone)]
pub struct MemoryLink {
    name: String,
    writes: Arc<Mutex<Vec<String>>>,
    fail_next: Arc<AtomicUsize>,
}

impl MemoryLink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            writes: Arc::default(),
            fail_next: Arc::default(),
        }
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    /// Fail the next `count` writes (failed writes are not recorded)
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

impl DeviceLink for MemoryLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, command: &str) -> Result<()> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::DeviceLinkFailure {
                device: self.name.clone(),
                reason: "injected write failure".into(),
            });
        }
        self.writes.lock().push(command.to_string());
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        Ok(b"ok\n".to_vec())
    }
}

#[derive(Default)]
struct SignalingState {
    subscriptions: Mutex<Vec<String>>,
    emits: Mutex<Vec<(String, Value)>>,
    events: Mutex<Option<mpsc::Sender<SignalingEvent>>>,
    /// Ack senders held back so their receivers never resolve
    withheld: Mutex<Vec<oneshot::Sender<Value>>>,
    queued: Mutex<VecDeque<SignalingEvent>>,
    auth_reply: Mutex<Option<Value>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_emits: AtomicBool,
    withhold_keepalive_acks: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

/// Scripted signaling channel; clones share state
///
/// Acks resolve immediately: `easyrtcAuth` with the configured reply (a token
/// for `L1` by default), everything else with `{"msgType": "ack"}`.
#[derive(Clone, Default)]
pub struct ScriptedSignaling {
    state: Arc<SignalingState>,
}

impl ScriptedSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Already connected, for routing tests that never call `connect`
    pub fn connected() -> Self {
        let signaling = Self::new();
        signaling.state.connected.store(true, Ordering::SeqCst);
        signaling
    }

    pub fn set_auth_reply(&self, reply: Value) {
        *self.state.auth_reply.lock() = Some(reply);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_emits(&self, fail: bool) {
        self.state.fail_emits.store(fail, Ordering::SeqCst);
    }

    /// Never acknowledge `stillAlive` pings
    pub fn withhold_keepalive_acks(&self, withhold: bool) {
        self.state
            .withhold_keepalive_acks
            .store(withhold, Ordering::SeqCst);
    }

    /// Deliver an event, or queue it until `connect`
    pub async fn push_event(&self, name: &str, payload: Value) {
        let event = SignalingEvent::new(name, payload);
        let sender = self.state.events.lock().clone();
        match sender {
            Some(sender) => {
                let _ = sender.send(event).await;
            }
            None => self.state.queued.lock().push_back(event),
        }
    }

    /// End the event stream as if the server went away
    pub fn drop_connection(&self) {
        self.state.events.lock().take();
        self.state.connected.store(false, Ordering::SeqCst);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().clone()
    }

    pub fn emits(&self) -> Vec<(String, Value)> {
        self.state.emits.lock().clone()
    }

    pub fn emits_of(&self, msg_type: &str) -> usize {
        self.state
            .emits
            .lock()
            .iter()
            .filter(|(_, payload)| payload["msgType"] == msg_type)
            .count()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Number of live clones, including this one
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.state)
    }
}

#[async_trait]
impl SignalingChannel for ScriptedSignaling {
    fn subscribe(&mut self, event: &str) {
        self.state.subscriptions.lock().push(event.to_string());
    }

    async fn connect(&mut self, _url: &str) -> Result<mpsc::Receiver<SignalingEvent>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(AppError::TransportFailure("connection refused".into()));
        }

        let (tx, rx) = mpsc::channel(64);
        for event in self.state.queued.lock().drain(..) {
            let _ = tx.try_send(event);
        }
        *self.state.events.lock() = Some(tx);
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    fn emit(&self, event: &str, payload: Value) -> Result<AckReceiver> {
        if !self.state.connected.load(Ordering::SeqCst) || self.state.fail_emits.load(Ordering::SeqCst)
        {
            return Err(AppError::TransportFailure("emit failed".into()));
        }

        let is_keepalive = payload["msgType"] == "stillAlive";
        self.state
            .emits
            .lock()
            .push((event.to_string(), payload));

        let (tx, rx) = oneshot::channel();
        if event == EASYRTC_AUTH {
            let reply = self.state.auth_reply.lock().clone().unwrap_or_else(|| {
                json!({"msgType": "token", "msgData": {"easyrtcid": "L1"}})
            });
            let _ = tx.send(reply);
        } else if is_keepalive && self.state.withhold_keepalive_acks.load(Ordering::SeqCst) {
            self.state.withheld.lock().push(tx);
        } else {
            let _ = tx.send(json!({"msgType": "ack"}));
        }
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.events.lock().take();
        self.state.withheld.lock().clear();
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct JanusState {
    requests: Mutex<Vec<(String, Value)>>,
    rejected: Mutex<HashSet<String>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
}

/// Janus server answering over in-memory queues; clones share state
///
/// Session id is 100 and the plugin handle id 200. Plugin messages are
/// acknowledged and their result is queued for the long poll; `publish`
/// results carry an SDP answer.
#[derive(Clone)]
pub struct ScriptedJanus {
    state: Arc<JanusState>,
}

impl ScriptedJanus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(JanusState {
                requests: Mutex::default(),
                rejected: Mutex::default(),
                events_tx: Mutex::new(Some(tx)),
                events_rx: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    /// Refuse a top-level request (`create`, `attach`) or a plugin request
    /// (`join`, `publish`, `leave`)
    pub fn reject(&self, request: &str) {
        self.state.rejected.lock().insert(request.to_string());
    }

    /// Queue a value for the long poll
    pub fn push_event(&self, event: Value) {
        if let Some(tx) = self.state.events_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Fail every long poll once the queue is drained
    pub fn end_polls(&self) {
        self.state.events_tx.lock().take();
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.state.requests.lock().clone()
    }

    /// Names of the requests in order: the plugin request for messages,
    /// the `janus` verb otherwise
    pub fn request_names(&self) -> Vec<String> {
        self.state
            .requests
            .lock()
            .iter()
            .map(|(_, body)| match body["janus"].as_str() {
                Some("message") => body["body"]["request"].as_str().unwrap_or_default().to_string(),
                other => other.unwrap_or_default().to_string(),
            })
            .collect()
    }

    pub fn requests_of(&self, name: &str) -> usize {
        self.request_names().iter().filter(|n| *n == name).count()
    }
}

#[async_trait]
impl JanusTransport for ScriptedJanus {
    async fn post(&self, url: &str, body: Value) -> Result<Value> {
        self.state.requests.lock().push((url.to_string(), body.clone()));
        let transaction = body["transaction"].clone();
        let verb = body["janus"].as_str().unwrap_or_default().to_string();

        if self.state.rejected.lock().contains(&verb) {
            return Ok(json!({
                "janus": "error",
                "transaction": transaction,
                "error": {"code": 403, "reason": format!("{} refused", verb)},
            }));
        }

        match verb.as_str() {
            "create" => Ok(json!({"janus": "success", "transaction": transaction, "data": {"id": 100}})),
            "attach" => Ok(json!({"janus": "success", "transaction": transaction, "data": {"id": 200}})),
            "destroy" => Ok(json!({"janus": "success", "transaction": transaction})),
            "message" => {
                let request = body["body"]["request"].as_str().unwrap_or_default().to_string();
                let rejected = self.state.rejected.lock().contains(&request);
                let data = if rejected {
                    json!({"videoroom": "event", "error_code": 426, "error": "No such room"})
                } else {
                    match request.as_str() {
                        "join" => json!({"videoroom": "joined", "room": body["body"]["room"], "id": 300}),
                        "leave" => json!({"videoroom": "event", "leaving": "ok"}),
                        _ => json!({"videoroom": "event", "configured": "ok"}),
                    }
                };

                let mut event = json!({
                    "janus": "event",
                    "session_id": 100,
                    "sender": 200,
                    "transaction": transaction,
                    "plugindata": {"plugin": VIDEOROOM_PLUGIN, "data": data},
                });
                if !rejected && body.get("jsep").is_some() {
                    event["jsep"] = json!({"type": "answer", "sdp": "v=0 janus answer"});
                }
                self.push_event(event);

                Ok(json!({"janus": "ack", "session_id": 100, "transaction": transaction}))
            }
            other => Err(AppError::TransportFailure(format!("unexpected request {}", other))),
        }
    }

    async fn poll(&self, _url: &str) -> Result<Value> {
        let mut events = self.state.events_rx.lock().await;
        events
            .recv()
            .await
            .ok_or_else(|| AppError::TransportFailure("long poll failed".into()))
    }
}
