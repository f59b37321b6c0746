//! Stream channel: one signaling connection and its session registry

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::device::DeviceController;
use crate::error::{AppError, Result};
use crate::router::{EventRouter, RouteOutcome};
use crate::session::{ConnectionRegistry, NegotiatorFactory, RtcNegotiatorFactory};
use crate::signaling::{
    message, AckReceiver, AuthResponse, SignalingChannel, SignalingEvent, SocketIoChannel,
    EASYRTC_AUTH, EASYRTC_CMD, MESSAGE_EVENT, MOVE_EVENT,
};

/// Logical stream a channel serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Video to viewers
    Camera,
    /// Text and movement commands
    Control,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Camera => "camera",
            ChannelRole::Control => "control",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings of one stream channel
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub name: String,
    pub role: ChannelRole,
    pub url: String,
    pub username: String,
    pub room: Option<String>,
    pub api_version: String,
    pub application_name: String,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub max_missed: u32,
    pub ack_timeout: Duration,
}

impl ChannelSettings {
    pub fn from_config(role: ChannelRole, config: &AppConfig) -> Self {
        let channel = match role {
            ChannelRole::Camera => &config.camera,
            ChannelRole::Control => &config.control,
        };
        Self {
            name: role.as_str().to_string(),
            role,
            url: config.signaling.url.clone(),
            username: channel.username.clone(),
            room: channel.room.clone(),
            api_version: config.signaling.api_version.clone(),
            application_name: config.signaling.application_name.clone(),
            keepalive_interval: Duration::from_secs(config.keepalive.interval_secs),
            keepalive_timeout: Duration::from_secs(config.keepalive.timeout_secs),
            max_missed: config.keepalive.max_missed,
            ack_timeout: Duration::from_secs(config.signaling.ack_timeout_secs),
        }
    }
}

/// Why a channel loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stop requested by the owner
    Cancelled,
    /// Event stream ended
    ServerClosed,
    /// Too many unacknowledged keep-alive pings
    KeepAliveLost,
    Transport(String),
    /// The channel task panicked
    Aborted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::ServerClosed => write!(f, "server closed"),
            StopReason::KeepAliveLost => write!(f, "keep-alive lost"),
            StopReason::Transport(e) => write!(f, "transport failure: {}", e),
            StopReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// Summary of a finished channel
#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub name: String,
    pub reason: StopReason,
    pub sessions_closed: usize,
    pub events_routed: u64,
}

enum AckResult {
    KeepAlive { acked: bool },
    Answer { remote_id: String, reply: Option<Value> },
}

fn await_ack(ack: AckReceiver, timeout: Duration) -> BoxFuture<'static, Option<Value>> {
    async move {
        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(reply)) => Some(reply),
            _ => None,
        }
    }
    .boxed()
}

/// One stream channel before it is started
pub struct StreamChannel {
    settings: ChannelSettings,
    signaling: Box<dyn SignalingChannel>,
    router: EventRouter,
    registry: Arc<ConnectionRegistry>,
    device: Option<DeviceController>,
}

impl StreamChannel {
    pub fn new(
        settings: ChannelSettings,
        signaling: Box<dyn SignalingChannel>,
        factory: Arc<dyn NegotiatorFactory>,
        device: Option<DeviceController>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = EventRouter::new(settings.name.clone(), registry.clone(), factory);
        Self {
            settings,
            signaling,
            router,
            registry,
            device,
        }
    }

    /// Channel over Socket.IO with WebRTC sessions
    pub fn from_config(
        role: ChannelRole,
        config: &AppConfig,
        device: Option<DeviceController>,
    ) -> Self {
        let settings = ChannelSettings::from_config(role, config);
        let signaling = Box::new(SocketIoChannel::from_config(&config.signaling));
        let factory = Arc::new(RtcNegotiatorFactory::new(
            config.webrtc.clone(),
            role,
            device.clone(),
        ));
        Self::new(settings, signaling, factory, device)
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Connect, authenticate and spawn the channel loop
    ///
    /// A failure here leaves nothing running; the transport is disconnected.
    pub async fn start(mut self) -> Result<StreamChannelHandle> {
        self.signaling.subscribe(EASYRTC_CMD);
        if self.settings.role == ChannelRole::Control {
            self.signaling.subscribe(MOVE_EVENT);
            self.signaling.subscribe(MESSAGE_EVENT);
        }

        let events = self.signaling.connect(&self.settings.url).await?;

        let local_id = match self.authenticate().await {
            Ok(local_id) => local_id,
            Err(e) => {
                if let Err(e) = self.signaling.disconnect().await {
                    debug!(channel = %self.settings.name, "Disconnect after failed auth: {}", e);
                }
                return Err(e);
            }
        };
        info!(
            channel = %self.settings.name,
            username = %self.settings.username,
            easyrtcid = %local_id,
            "Authenticated with signaling server"
        );

        let cancel = CancellationToken::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let name = self.settings.name.clone();
        let role = self.settings.role;
        let registry = self.registry.clone();
        let task = tokio::spawn(self.run(events, cancel.clone(), stop_tx));

        Ok(StreamChannelHandle::new(
            name, role, local_id, cancel, stop_rx, task, registry,
        ))
    }

    async fn authenticate(&self) -> Result<String> {
        let payload = message::authenticate(
            &self.settings.api_version,
            &self.settings.application_name,
            &self.settings.username,
            self.settings.room.as_deref(),
        );
        let ack = self.signaling.emit(EASYRTC_AUTH, payload)?;

        let reply = tokio::time::timeout(self.settings.ack_timeout, ack)
            .await
            .map_err(|_| AppError::TransportFailure("Authentication timed out".into()))?
            .map_err(|_| {
                AppError::TransportFailure("Connection closed before authentication".into())
            })?;

        Ok(AuthResponse::decode(&reply)?.easyrtcid)
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<SignalingEvent>,
        cancel: CancellationToken,
        stop_tx: watch::Sender<bool>,
    ) -> ChannelReport {
        let period = self.settings.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pending: FuturesUnordered<BoxFuture<'static, AckResult>> = FuturesUnordered::new();
        let mut missed = 0u32;
        let mut routed = 0u64;

        let reason = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break StopReason::Cancelled,

                event = events.recv() => {
                    let Some(event) = event else {
                        break StopReason::ServerClosed;
                    };
                    routed += 1;
                    match self.handle_event(event).await {
                        Ok(Some(RouteOutcome::Answered { remote_id, ack })) => {
                            let wait = await_ack(ack, self.settings.ack_timeout);
                            pending.push(
                                async move { AckResult::Answer { remote_id, reply: wait.await } }
                                    .boxed(),
                            );
                        }
                        Ok(Some(RouteOutcome::Liveness)) => missed = 0,
                        Ok(_) => {}
                        Err(e) => break StopReason::Transport(e.to_string()),
                    }
                }

                _ = keepalive.tick() => {
                    let reaped = self.registry.reap_closed();
                    if reaped > 0 {
                        debug!(channel = %self.settings.name, reaped, "Dropped closed sessions");
                    }
                    match self.signaling.emit(EASYRTC_CMD, message::still_alive()) {
                        Ok(ack) => {
                            let wait = await_ack(ack, self.settings.keepalive_timeout);
                            pending.push(
                                async move { AckResult::KeepAlive { acked: wait.await.is_some() } }
                                    .boxed(),
                            );
                        }
                        Err(e) => break StopReason::Transport(e.to_string()),
                    }
                }

                Some(result) = pending.next(), if !pending.is_empty() => match result {
                    AckResult::KeepAlive { acked: true } => missed = 0,
                    AckResult::KeepAlive { acked: false } => {
                        missed += 1;
                        warn!(
                            channel = %self.settings.name,
                            missed,
                            "Keep-alive not acknowledged"
                        );
                        if missed >= self.settings.max_missed {
                            break StopReason::KeepAliveLost;
                        }
                    }
                    AckResult::Answer { remote_id, reply: Some(reply) } => {
                        debug!(channel = %self.settings.name, remote_id = %remote_id, "Answer acknowledged: {}", reply);
                    }
                    AckResult::Answer { remote_id, reply: None } => {
                        warn!(channel = %self.settings.name, remote_id = %remote_id, "Answer not acknowledged");
                    }
                },
            }
        };

        match reason {
            StopReason::Cancelled => info!(
                channel = %self.settings.name,
                peers = ?self.registry.remote_ids(),
                "Stopping channel"
            ),
            ref other => error!(channel = %self.settings.name, "Channel ended: {}", other),
        }

        drop(pending);
        let sessions_closed = self.registry.close_all().await;
        if let Err(e) = self.signaling.disconnect().await {
            warn!(channel = %self.settings.name, "Disconnect failed: {}", e);
        }
        let _ = stop_tx.send(true);

        info!(
            channel = %self.settings.name,
            sessions_closed,
            "Channel stopped"
        );
        ChannelReport {
            name: self.settings.name.clone(),
            reason,
            sessions_closed,
            events_routed: routed,
        }
    }

    async fn handle_event(&mut self, event: SignalingEvent) -> Result<Option<RouteOutcome>> {
        match event.name.as_str() {
            EASYRTC_CMD => {
                let outcome = self
                    .router
                    .dispatch(&event.payload, self.signaling.as_ref())
                    .await?;
                Ok(Some(outcome))
            }
            MOVE_EVENT => {
                match self.device {
                    Some(ref device) => device.handle_control_value(&event.payload).await,
                    None => debug!(channel = %self.settings.name, "No device, ignoring move"),
                }
                Ok(None)
            }
            MESSAGE_EVENT => {
                info!(channel = %self.settings.name, "Message: {}", event.payload);
                Ok(None)
            }
            other => {
                debug!(channel = %self.settings.name, "Unhandled event: {}", other);
                Ok(None)
            }
        }
    }
}

/// Running stream channel
pub struct StreamChannelHandle {
    name: String,
    role: ChannelRole,
    local_id: String,
    cancel: CancellationToken,
    stop_rx: watch::Receiver<bool>,
    task: JoinHandle<ChannelReport>,
    registry: Arc<ConnectionRegistry>,
}

impl StreamChannelHandle {
    pub(super) fn new(
        name: String,
        role: ChannelRole,
        local_id: String,
        cancel: CancellationToken,
        stop_rx: watch::Receiver<bool>,
        task: JoinHandle<ChannelReport>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            name,
            role,
            local_id,
            cancel,
            stop_rx,
            task,
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Id the server assigned to this connection
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Whether teardown has completed
    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow() || self.task.is_finished()
    }

    /// Wait until the channel has torn itself down
    pub async fn stopped(&self) {
        let mut stop_rx = self.stop_rx.clone();
        // Sender dropped without signalling means the task died
        let _ = stop_rx.wait_for(|stopped| *stopped).await;
    }

    /// Cancel the loop and wait for teardown to finish
    pub async fn stop(self) -> ChannelReport {
        self.cancel.cancel();
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(channel = %self.name, "Channel task failed: {}", e);
                // The transport went down with the task: dropping a
                // SocketIoChannel shuts its connection
                let sessions_closed = self.registry.close_all().await;
                ChannelReport {
                    name: self.name,
                    reason: StopReason::Aborted,
                    sessions_closed,
                    events_routed: 0,
                }
            }
        }
    }
}
