//! Peer session: one negotiated connection to one remote party

use std::fmt;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info};

use super::negotiator::{IceCandidate, SessionDescription, SessionNegotiator};
use crate::error::{AppError, Result};

/// Local/remote id pair assigned by the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub local_id: String,
    pub remote_id: String,
}

impl PeerIdentity {
    pub fn new(local_id: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local_id, self.remote_id)
    }
}

/// Peer session state
///
/// `Negotiating -> Active -> Closed`, and any state may go to `Closed`.
/// Nothing leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Active,
    Closed,
}

impl SessionState {
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// One negotiated connection to one remote party
pub struct PeerSession {
    identity: PeerIdentity,
    /// Local id used in logs
    session_id: String,
    negotiator: tokio::sync::Mutex<Box<dyn SessionNegotiator>>,
    state: watch::Sender<SessionState>,
    created_at: Instant,
}

impl PeerSession {
    pub fn new(identity: PeerIdentity, negotiator: Box<dyn SessionNegotiator>) -> Self {
        let (state, _) = watch::channel(SessionState::Negotiating);
        Self {
            identity,
            session_id: uuid::Uuid::new_v4().to_string(),
            negotiator: tokio::sync::Mutex::new(negotiator),
            state,
            created_at: Instant::now(),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn remote_id(&self) -> &str {
        &self.identity.remote_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Answer a remote offer
    ///
    /// Sets the remote description, creates and commits the local answer and
    /// returns the committed local description. The session becomes `Active`
    /// once the local description is committed.
    pub async fn answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let negotiator = self.negotiator.lock().await;
        self.ensure_live()?;

        negotiator.set_remote_description(offer).await?;
        debug!(session_id = %self.session_id, "Remote description set, creating answer");

        let answer = negotiator.create_answer().await?;
        negotiator.set_local_description(answer.clone()).await?;
        let local = negotiator.local_description().await.unwrap_or(answer);

        self.activate();
        Ok(local)
    }

    /// Start a locally initiated negotiation
    ///
    /// Creates the requested data channels before the offer so they are part
    /// of it, then commits the offer as the local description.
    pub async fn offer(&self, data_channels: &[&str]) -> Result<SessionDescription> {
        let negotiator = self.negotiator.lock().await;
        self.ensure_live()?;

        for label in data_channels {
            let channel = negotiator.create_data_channel(label).await?;
            debug!(session_id = %self.session_id, "Data channel '{}' created", channel.label);
        }

        let offer = negotiator.create_offer().await?;
        negotiator.set_local_description(offer.clone()).await?;
        Ok(negotiator.local_description().await.unwrap_or(offer))
    }

    /// Apply the remote answer to a locally initiated negotiation
    pub async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        let negotiator = self.negotiator.lock().await;
        self.ensure_live()?;
        negotiator.set_remote_description(answer).await?;
        self.activate();
        Ok(())
    }

    /// Attach a remote ICE candidate
    ///
    /// Returns `Ok(false)` without touching the negotiator when the session is
    /// already closed; late candidates after teardown are expected.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<bool> {
        let negotiator = self.negotiator.lock().await;
        if !self.is_live() {
            debug!(session_id = %self.session_id, "Ignoring candidate for closed session");
            return Ok(false);
        }
        negotiator.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Close the session
    ///
    /// Idempotent: the negotiator is closed on the first call only. Returns
    /// `Ok(true)` when this call performed the close.
    pub async fn close(&self) -> Result<bool> {
        let negotiator = self.negotiator.lock().await;
        let transitioned = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if !transitioned {
            return Ok(false);
        }

        info!(
            session_id = %self.session_id,
            remote_id = %self.identity.remote_id,
            age_secs = self.age().as_secs(),
            "Closing peer session"
        );
        negotiator.close().await?;
        Ok(true)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(AppError::NegotiationFailure(format!(
                "Session {} is closed",
                self.session_id
            )))
        }
    }

    fn activate(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Negotiating {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("identity", &self.identity)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_candidate, FakeNegotiator};

    fn session(negotiator: &FakeNegotiator) -> PeerSession {
        PeerSession::new(PeerIdentity::new("L1", "R1"), Box::new(negotiator.clone()))
    }

    #[tokio::test]
    async fn test_answer_activates_session() {
        let negotiator = FakeNegotiator::new();
        let session = session(&negotiator);
        assert_eq!(session.state(), SessionState::Negotiating);

        let answer = session
            .answer(SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();

        assert_eq!(answer.sdp_type, crate::session::SdpType::Answer);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(
            negotiator.calls(),
            vec!["set_remote:offer", "create_answer", "set_local:answer"]
        );
    }

    #[tokio::test]
    async fn test_failed_answer_stays_negotiating() {
        let negotiator = FakeNegotiator::new();
        negotiator.fail_on("create_answer");
        let session = session(&negotiator);

        let err = tokio_test::assert_err!(session.answer(SessionDescription::offer("v=0")).await);
        assert!(matches!(err, AppError::NegotiationFailure(_)));
        assert_eq!(session.state(), SessionState::Negotiating);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let negotiator = FakeNegotiator::new();
        let session = session(&negotiator);

        assert!(tokio_test::assert_ok!(session.close().await));
        assert!(!tokio_test::assert_ok!(session.close().await));
        assert_eq!(negotiator.close_count(), 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_candidate_on_closed_session_is_noop() {
        let negotiator = FakeNegotiator::new();
        let session = session(&negotiator);
        session.close().await.unwrap();

        let attached = session.add_ice_candidate(sample_candidate()).await.unwrap();
        assert!(!attached);
        assert_eq!(negotiator.candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_no_transition_out_of_closed() {
        let negotiator = FakeNegotiator::new();
        let session = session(&negotiator);
        session.close().await.unwrap();

        assert!(session.answer(SessionDescription::offer("v=0")).await.is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_offer_creates_data_channels_first() {
        let negotiator = FakeNegotiator::new();
        let session = session(&negotiator);

        let offer = session.offer(&["control"]).await.unwrap();
        assert_eq!(offer.sdp_type, crate::session::SdpType::Offer);
        assert_eq!(
            negotiator.calls(),
            vec!["data_channel:control", "create_offer", "set_local:offer"]
        );
        assert_eq!(session.state(), SessionState::Negotiating);

        session
            .accept_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }
}
