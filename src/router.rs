//! Signaling event router
//!
//! Turns decoded `easyrtcCmd` messages into registry and session actions for
//! one stream channel. Events are routed one at a time by the channel loop.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::error::{AppError, Result};
use crate::session::{
    ConnectionRegistry, IceCandidate, NegotiatorFactory, PeerIdentity, PeerSession,
    SessionDescription,
};
use crate::signaling::{message, AckReceiver, InboundMessage, SignalingChannel, EASYRTC_CMD};

/// What routing one message did
#[derive(Debug)]
pub enum RouteOutcome {
    /// New session answered; the ack resolves when the server confirms
    Answered { remote_id: String, ack: AckReceiver },
    /// Offer for a remote id that already has a live session
    DuplicateOffer { remote_id: String },
    CandidateAttached { remote_id: String },
    /// Empty candidate, unknown sender or closed session
    CandidateDropped { remote_id: String },
    /// Remote ids whose sessions were removed
    Removed(Vec<String>),
    /// Keep-alive acknowledgment
    Liveness,
    Ignored,
    /// Handled failure (already logged)
    Failed { remote_id: Option<String>, kind: &'static str },
}

/// Routes inbound messages for one stream channel
pub struct EventRouter {
    channel: String,
    registry: Arc<ConnectionRegistry>,
    factory: Arc<dyn NegotiatorFactory>,
}

impl EventRouter {
    pub fn new(
        channel: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        factory: Arc<dyn NegotiatorFactory>,
    ) -> Self {
        Self {
            channel: channel.into(),
            registry,
            factory,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Decode and route a raw `easyrtcCmd` payload
    ///
    /// Malformed payloads are logged and ignored.
    pub async fn dispatch(
        &self,
        payload: &Value,
        signaling: &dyn SignalingChannel,
    ) -> Result<RouteOutcome> {
        match InboundMessage::decode(payload) {
            Ok(msg) => self.route(msg, signaling).await,
            Err(e) => {
                warn!(channel = %self.channel, kind = e.kind(), "Dropping message: {}", e);
                Ok(RouteOutcome::Failed {
                    remote_id: None,
                    kind: e.kind(),
                })
            }
        }
    }

    /// Route one decoded message
    ///
    /// Only transport failures are returned as errors; everything else is
    /// logged and reported through the outcome.
    pub async fn route(
        &self,
        msg: InboundMessage,
        signaling: &dyn SignalingChannel,
    ) -> Result<RouteOutcome> {
        trace!(
            channel = %self.channel,
            kind = msg.kind(),
            remote_id = msg.remote_id().unwrap_or("-"),
            "Routing message"
        );
        match msg {
            InboundMessage::Offer {
                sender_id,
                local_id,
                description,
            } => {
                self.handle_offer(PeerIdentity::new(local_id, sender_id), description, signaling)
                    .await
            }
            InboundMessage::Candidate {
                sender_id,
                candidate,
            } => Ok(self.handle_candidate(sender_id, candidate).await),
            InboundMessage::RosterChange { removed } => {
                Ok(RouteOutcome::Removed(self.handle_departures(&removed).await))
            }
            InboundMessage::KeepAliveAck => Ok(RouteOutcome::Liveness),
            InboundMessage::Other { msg_type } => {
                debug!(channel = %self.channel, "Ignoring {} message", msg_type);
                Ok(RouteOutcome::Ignored)
            }
        }
    }

    async fn handle_offer(
        &self,
        identity: PeerIdentity,
        offer: SessionDescription,
        signaling: &dyn SignalingChannel,
    ) -> Result<RouteOutcome> {
        let remote_id = identity.remote_id.clone();

        if self.registry.find_live(&remote_id).is_some() {
            debug!(channel = %self.channel, remote_id = %remote_id, "Ignoring duplicate offer");
            return Ok(RouteOutcome::DuplicateOffer { remote_id });
        }

        info!(channel = %self.channel, remote_id = %remote_id, "Received a new call");

        let negotiator = match self.factory.create(&identity).await {
            Ok(negotiator) => negotiator,
            Err(e) => return Ok(self.failed(&remote_id, e)),
        };
        let session = Arc::new(PeerSession::new(identity, negotiator));

        if let Err(e) = self.registry.insert(session.clone()) {
            // Lost a race with another offer for the same remote id
            self.discard(&session).await;
            return match e {
                AppError::DuplicateKey(_) => Ok(RouteOutcome::DuplicateOffer { remote_id }),
                other => Ok(self.failed(&remote_id, other)),
            };
        }

        let answer = match session.answer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                self.discard(&session).await;
                return Ok(self.failed(&remote_id, e));
            }
        };

        match signaling.emit(EASYRTC_CMD, message::answer(&remote_id, &answer)) {
            Ok(ack) => {
                info!(
                    channel = %self.channel,
                    remote_id = %remote_id,
                    session_id = %session.session_id(),
                    "Answer sent"
                );
                Ok(RouteOutcome::Answered { remote_id, ack })
            }
            Err(e) => {
                self.discard(&session).await;
                warn!(
                    channel = %self.channel,
                    remote_id = %remote_id,
                    kind = e.kind(),
                    "Failed to send answer: {}", e
                );
                if e.is_transport() {
                    Err(e)
                } else {
                    Ok(RouteOutcome::Failed {
                        remote_id: Some(remote_id),
                        kind: e.kind(),
                    })
                }
            }
        }
    }

    async fn handle_candidate(
        &self,
        remote_id: String,
        candidate: Option<IceCandidate>,
    ) -> RouteOutcome {
        let Some(candidate) = candidate else {
            debug!(channel = %self.channel, remote_id = %remote_id, "Skipping empty candidate");
            return RouteOutcome::CandidateDropped { remote_id };
        };
        let Some(session) = self.registry.find_live(&remote_id) else {
            debug!(channel = %self.channel, remote_id = %remote_id, "Candidate for unknown peer");
            return RouteOutcome::CandidateDropped { remote_id };
        };

        match session.add_ice_candidate(candidate).await {
            Ok(true) => {
                debug!(channel = %self.channel, remote_id = %remote_id, "Candidate attached");
                RouteOutcome::CandidateAttached { remote_id }
            }
            Ok(false) => RouteOutcome::CandidateDropped { remote_id },
            Err(e) => self.failed(&remote_id, e),
        }
    }

    /// Remove and close sessions of departed clients
    async fn handle_departures(&self, departed: &[String]) -> Vec<String> {
        let mut removed = Vec::new();

        for remote_id in departed {
            let Some(session) = self.registry.remove(remote_id) else {
                continue;
            };
            info!(channel = %self.channel, remote_id = %remote_id, "Peer left, closing session");
            if let Err(e) = session.close().await {
                warn!(
                    channel = %self.channel,
                    remote_id = %remote_id,
                    kind = e.kind(),
                    "Error closing session: {}", e
                );
            }
            removed.push(remote_id.clone());
        }

        removed
    }

    /// Drop a session that never became usable
    async fn discard(&self, session: &Arc<PeerSession>) {
        self.registry.remove_if_same(session);
        if let Err(e) = session.close().await {
            debug!(remote_id = %session.remote_id(), "Error closing discarded session: {}", e);
        }
    }

    fn failed(&self, remote_id: &str, e: AppError) -> RouteOutcome {
        warn!(
            channel = %self.channel,
            remote_id = %remote_id,
            kind = e.kind(),
            "{}", e
        );
        RouteOutcome::Failed {
            remote_id: Some(remote_id.to_string()),
            kind: e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::SessionState;
    use crate::testing::{FakeNegotiatorFactory, ScriptedSignaling};
    use serde_json::json;

    const CANDIDATE: &str =
        "candidate:842163049 1 udp 1677729535 192.168.1.20 54321 typ host generation 0";

    fn router(factory: &FakeNegotiatorFactory) -> EventRouter {
        EventRouter::new(
            "camera",
            Arc::new(ConnectionRegistry::new()),
            Arc::new(factory.clone()),
        )
    }

    fn offer(remote: &str) -> Value {
        json!({
            "msgType": "offer",
            "senderEasyrtcid": remote,
            "easyrtcid": "L1",
            "msgData": {"type": "offer", "sdp": "v=0 offer"},
        })
    }

    fn candidate(remote: &str, line: &str) -> Value {
        json!({
            "msgType": "candidate",
            "senderEasyrtcid": remote,
            "msgData": {"candidate": line, "id": "0", "label": 0},
        })
    }

    fn removal(remote: &str) -> Value {
        let mut removed = serde_json::Map::new();
        removed.insert(remote.to_string(), json!({"easyrtcid": remote}));
        json!({
            "msgType": "roomData",
            "msgData": {"roomData": {"default": {"clientListDelta": {
                "removeClient": removed
            }}}},
        })
    }

    #[tokio::test]
    async fn test_full_session_scenario() {
        let factory = FakeNegotiatorFactory::delaying("create_answer", Duration::from_millis(200));
        let router = Arc::new(router(&factory));
        let signaling = ScriptedSignaling::connected();

        let dispatch = {
            let router = router.clone();
            let signaling = signaling.clone();
            tokio::spawn(async move { router.dispatch(&offer("R1"), &signaling).await })
        };

        // Registered and still negotiating while the answer is being created
        let session = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(session) = router.registry().find("R1") {
                    break session;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);
        assert!(signaling.emits().is_empty());

        let outcome = dispatch.await.unwrap().unwrap();
        let RouteOutcome::Answered { remote_id, ack } = outcome else {
            panic!("expected an answer");
        };
        assert_eq!(remote_id, "R1");
        assert_eq!(ack.await.unwrap()["msgType"], "ack");
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.identity(), &PeerIdentity::new("L1", "R1"));

        let emits = signaling.emits();
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0].0, EASYRTC_CMD);
        assert_eq!(emits[0].1["msgType"], "answer");
        assert_eq!(emits[0].1["targetEasyrtcid"], "R1");
        assert_eq!(emits[0].1["msgData"]["type"], "answer");

        let outcome = router
            .dispatch(&candidate("R1", CANDIDATE), &signaling)
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::CandidateAttached { .. }));
        assert_eq!(factory.negotiators()[0].candidate_count(), 1);

        let outcome = router.dispatch(&removal("R1"), &signaling).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Removed(ref ids) if ids == &["R1".to_string()]));
        assert!(router.registry().is_empty());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(factory.negotiators()[0].close_count(), 1);

        let outcome = router.dispatch(&removal("R1"), &signaling).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Removed(ref ids) if ids.is_empty()));
        assert_eq!(factory.negotiators()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_offer_keeps_one_session() {
        let factory = FakeNegotiatorFactory::new();
        let router = router(&factory);
        let signaling = ScriptedSignaling::connected();

        router.dispatch(&offer("R1"), &signaling).await.unwrap();
        let outcome = router.dispatch(&offer("R1"), &signaling).await.unwrap();

        assert!(matches!(outcome, RouteOutcome::DuplicateOffer { .. }));
        assert_eq!(router.registry().len(), 1);
        assert_eq!(factory.created(), 1);
        assert_eq!(signaling.emits().len(), 1);
    }

    #[tokio::test]
    async fn test_offer_after_close_replaces_session() {
        let factory = FakeNegotiatorFactory::new();
        let router = router(&factory);
        let signaling = ScriptedSignaling::connected();

        router.dispatch(&offer("R1"), &signaling).await.unwrap();
        let first = router.registry().find("R1").unwrap();
        first.close().await.unwrap();

        let outcome = router.dispatch(&offer("R1"), &signaling).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Answered { .. }));
        let second = router.registry().find("R1").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_negotiation_failure_leaves_no_orphan() {
        let factory = FakeNegotiatorFactory::failing_on("set_remote");
        let router = router(&factory);
        let signaling = ScriptedSignaling::connected();

        let outcome = router.dispatch(&offer("R1"), &signaling).await.unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::Failed { kind: "negotiation_failure", .. }
        ));
        assert!(router.registry().is_empty());
        assert_eq!(factory.negotiators()[0].close_count(), 1);
        assert!(signaling.emits().is_empty());
    }

    #[tokio::test]
    async fn test_emit_failure_is_transport_error() {
        let factory = FakeNegotiatorFactory::new();
        let router = router(&factory);
        let signaling = ScriptedSignaling::connected();
        signaling.fail_emits(true);

        let result = router.dispatch(&offer("R1"), &signaling).await;
        assert!(matches!(result, Err(AppError::TransportFailure(_))));
        assert!(router.registry().is_empty());
        assert_eq!(factory.negotiators()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_or_unknown_candidates_are_dropped() {
        let factory = FakeNegotiatorFactory::new();
        let router = router(&factory);
        let signaling = ScriptedSignaling::connected();
        router.dispatch(&offer("R1"), &signaling).await.unwrap();

        let outcome = router.dispatch(&candidate("R1", ""), &signaling).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::CandidateDropped { .. }));

        let outcome = router
            .dispatch(&candidate("R9", CANDIDATE), &signaling)
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::CandidateDropped { .. }));

        assert_eq!(factory.negotiators()[0].candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages() {
        let factory = FakeNegotiatorFactory::new();
        let router = router(&factory);
        let signaling = ScriptedSignaling::connected();

        let outcome = router
            .dispatch(&json!({"msgType": "offer", "easyrtcid": "L1"}), &signaling)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::Failed { kind: "malformed_message", .. }
        ));

        let outcome = router
            .dispatch(&json!({"msgType": "roomJoin"}), &signaling)
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Ignored));

        let outcome = router
            .dispatch(&json!({"msgType": "ack"}), &signaling)
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Liveness));

        assert!(router.registry().is_empty());
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_interleaved_offers_keep_unique_remote_ids() {
        let factory = FakeNegotiatorFactory::new();
        let router = router(&factory);
        let signaling = ScriptedSignaling::connected();

        for remote in ["R1", "R2", "R1", "R3", "R2", "R1"] {
            router.dispatch(&offer(remote), &signaling).await.unwrap();
        }

        let mut ids = router.registry().remote_ids();
        ids.sort();
        assert_eq!(ids, vec!["R1", "R2", "R3"]);
        assert_eq!(factory.created(), 3);
    }
}
