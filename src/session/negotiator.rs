//! Session negotiator interface
//!
//! A negotiator wraps one underlying real-time session (offer/answer and ICE).
//! Peer sessions own exactly one negotiator each and drive it through this
//! trait, which keeps the registry and router testable without a network.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::peer::PeerIdentity;
use crate::error::{AppError, Result};

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(SdpType::Offer),
            "answer" => Ok(SdpType::Answer),
            "pranswer" => Ok(SdpType::Pranswer),
            other => Err(AppError::MalformedMessage(format!(
                "Unsupported SDP type: {}",
                other
            ))),
        }
    }
}

/// Session description (SDP plus its type)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, sdp)
    }
}

/// ICE candidate descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute value, `candidate:...`
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Parse a candidate line as sent by browsers
    ///
    /// Accepts both `candidate:...` and the SDP attribute form `a=candidate:...`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        if !line.starts_with("candidate:") {
            return Err(AppError::MalformedMessage(format!(
                "Not an ICE candidate: {}",
                line
            )));
        }
        if line.split_whitespace().count() < 8 {
            return Err(AppError::MalformedMessage(format!(
                "Truncated ICE candidate: {}",
                line
            )));
        }
        Ok(Self {
            candidate: line.to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        })
    }

    pub fn with_mid(mut self, mid: Option<String>, index: Option<u16>) -> Self {
        self.sdp_mid = mid;
        self.sdp_mline_index = index;
        self
    }
}

/// Opaque handle to a locally created data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelInfo {
    pub label: String,
}

/// One underlying real-time session
#[async_trait]
pub trait SessionNegotiator: Send + Sync {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Committed local description, which may include gathered candidates
    async fn local_description(&self) -> Option<SessionDescription> {
        None
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<DataChannelInfo>;

    async fn close(&self) -> Result<()>;
}

/// Creates a negotiator for each new peer session
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    async fn create(&self, identity: &PeerIdentity) -> Result<Box<dyn SessionNegotiator>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_CANDIDATE: &str =
        "candidate:842163049 1 udp 1677729535 192.168.1.20 54321 typ host generation 0";

    #[test]
    fn test_parse_candidate() {
        let candidate = IceCandidate::parse(HOST_CANDIDATE).unwrap();
        assert_eq!(candidate.candidate, HOST_CANDIDATE);

        let attr = IceCandidate::parse(&format!("a={}", HOST_CANDIDATE)).unwrap();
        assert_eq!(attr.candidate, HOST_CANDIDATE);
    }

    #[test]
    fn test_parse_candidate_rejects_garbage() {
        assert!(IceCandidate::parse("").is_err());
        assert!(IceCandidate::parse("hello world").is_err());
        assert!(IceCandidate::parse("candidate:1 1 udp").is_err());
    }

    #[test]
    fn test_sdp_type_names() {
        assert_eq!("offer".parse::<SdpType>().unwrap(), SdpType::Offer);
        assert_eq!(SdpType::Answer.to_string(), "answer");
        assert!("rollback".parse::<SdpType>().is_err());
    }

    #[test]
    fn test_description_serializes_with_type_field() {
        let value = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["sdp"], "v=0");
    }
}
