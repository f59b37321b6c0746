//! Camera publisher for a Janus video room
//!
//! Instead of answering viewers one by one, the camera joins a video room as
//! a publisher and sends a single offer; the gateway fans the stream out.
//! Teardown follows the channel order, with the Janus session destroyed where
//! a stream channel disconnects its transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelReport, ChannelRole, StopReason, StreamChannelHandle};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::janus::{
    HttpTransport, JanusEvent, JanusSession, JanusTransport, PluginHandle, VIDEOROOM_PLUGIN,
};
use crate::session::{
    ConnectionRegistry, NegotiatorFactory, PeerIdentity, PeerSession, RtcNegotiatorFactory,
};

/// Settings of the Janus publisher
#[derive(Debug, Clone)]
pub struct JanusSettings {
    pub name: String,
    pub url: String,
    pub room: u64,
    pub display: String,
    pub request_timeout: Duration,
}

impl JanusSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            name: "camera".to_string(),
            url: config.janus.url.clone(),
            room: config.janus.room,
            display: config.janus.display.clone(),
            request_timeout: Duration::from_secs(config.janus.request_timeout_secs),
        }
    }

    /// Registry key of the single publisher session
    fn remote_id(&self) -> String {
        format!("janus-room-{}", self.room)
    }
}

/// Camera publisher before it is started
pub struct JanusPublisher {
    settings: JanusSettings,
    transport: Arc<dyn JanusTransport>,
    factory: Arc<dyn NegotiatorFactory>,
    registry: Arc<ConnectionRegistry>,
}

impl JanusPublisher {
    pub fn new(
        settings: JanusSettings,
        transport: Arc<dyn JanusTransport>,
        factory: Arc<dyn NegotiatorFactory>,
    ) -> Self {
        Self {
            settings,
            transport,
            factory,
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }

    /// Publisher over HTTP with a WebRTC camera session
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let transport = HttpTransport::new(
            Duration::from_secs(config.janus.request_timeout_secs),
            Duration::from_secs(config.janus.poll_timeout_secs),
        )?;
        let factory = RtcNegotiatorFactory::new(config.webrtc.clone(), ChannelRole::Camera, None);
        Ok(Self::new(
            JanusSettings::from_config(config),
            Arc::new(transport),
            Arc::new(factory),
        ))
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Create the Janus session, publish, and spawn the event loop
    ///
    /// On failure the partial session is closed and the Janus session
    /// destroyed before returning.
    pub async fn start(self) -> Result<StreamChannelHandle> {
        let (mut session, events) = JanusSession::create(
            self.transport.clone(),
            &self.settings.url,
            self.settings.request_timeout,
        )
        .await?;

        let plugin = match self.publish(&session).await {
            Ok(plugin) => plugin,
            Err(e) => {
                self.registry.close_all().await;
                if let Err(e) = session.destroy().await {
                    debug!(channel = %self.settings.name, "Destroy after failed publish: {}", e);
                }
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let name = self.settings.name.clone();
        let local_id = session.id().to_string();
        let registry = self.registry.clone();
        let task = tokio::spawn(self.run(session, plugin, events, cancel.clone(), stop_tx));

        Ok(StreamChannelHandle::new(
            name,
            ChannelRole::Camera,
            local_id,
            cancel,
            stop_rx,
            task,
            registry,
        ))
    }

    async fn publish(&self, session: &JanusSession) -> Result<PluginHandle> {
        let plugin = session.attach(VIDEOROOM_PLUGIN).await?;

        let joined = session
            .message(
                &plugin,
                json!({
                    "request": "join",
                    "ptype": "publisher",
                    "room": self.settings.room,
                    "display": self.settings.display,
                }),
                None,
            )
            .await?;
        info!(
            channel = %self.settings.name,
            room = self.settings.room,
            publisher_id = %joined.data["id"],
            "Joined video room"
        );

        let identity = PeerIdentity::new(self.settings.display.clone(), self.settings.remote_id());
        let negotiator = self.factory.create(&identity).await?;
        let peer = Arc::new(PeerSession::new(identity, negotiator));
        self.registry.insert(peer.clone())?;

        let offer = peer.offer(&[]).await?;
        let published = session
            .message(
                &plugin,
                json!({"request": "publish", "audio": false, "video": true}),
                Some(json!({"type": offer.sdp_type, "sdp": offer.sdp, "trickle": false})),
            )
            .await?;

        let answer = published.jsep.ok_or_else(|| {
            AppError::NegotiationFailure("Publish reply carried no answer".into())
        })?;
        peer.accept_answer(answer).await?;
        info!(
            channel = %self.settings.name,
            session_id = %peer.session_id(),
            "Publishing camera"
        );

        Ok(plugin)
    }

    async fn run(
        self,
        mut session: JanusSession,
        plugin: PluginHandle,
        mut events: mpsc::Receiver<JanusEvent>,
        cancel: CancellationToken,
        stop_tx: watch::Sender<bool>,
    ) -> ChannelReport {
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
                    if event.ends_session() {
                        break StopReason::Transport(format!("janus {}", event.kind));
                    }
                    debug!(
                        channel = %self.settings.name,
                        kind = %event.kind,
                        sender = ?event.sender,
                        "Janus event: {}", event.payload
                    );
                }
            }
        };

        match reason {
            StopReason::Cancelled => info!(channel = %self.settings.name, "Stopping publisher"),
            ref other => error!(channel = %self.settings.name, "Publisher ended: {}", other),
        }

        let sessions_closed = self.registry.close_all().await;

        if session.is_alive() {
            if let Err(e) = session.message(&plugin, json!({"request": "leave"}), None).await {
                debug!(channel = %self.settings.name, "Leave failed: {}", e);
            }
        }
        if let Err(e) = session.destroy().await {
            warn!(channel = %self.settings.name, "Failed to destroy Janus session: {}", e);
        }
        let _ = stop_tx.send(true);

        info!(channel = %self.settings.name, sessions_closed, "Publisher stopped");
        ChannelReport {
            name: self.settings.name.clone(),
            reason,
            sessions_closed,
            events_routed: routed,
        }
    }
}
