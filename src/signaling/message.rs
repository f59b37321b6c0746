//! EasyRTC signaling messages
//!
//! Inbound `easyrtcCmd` payloads are decoded once into [`InboundMessage`];
//! everything downstream works with the typed variant.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::{AppError, Result};
use crate::session::{IceCandidate, SdpType, SessionDescription};

/// Server-to-client command event
pub const EASYRTC_CMD: &str = "easyrtcCmd";
/// Authentication event
pub const EASYRTC_AUTH: &str = "easyrtcAuth";
/// Movement commands for the control channel
pub const MOVE_EVENT: &str = "move";
/// Free-form text for the control channel
pub const MESSAGE_EVENT: &str = "message";

/// Decoded inbound `easyrtcCmd` payload
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Remote offer addressed to us
    Offer {
        sender_id: String,
        local_id: String,
        description: SessionDescription,
    },
    /// Remote ICE candidate; `None` for the empty end-of-candidates marker
    Candidate {
        sender_id: String,
        candidate: Option<IceCandidate>,
    },
    /// Roster delta listing clients that left
    RosterChange { removed: Vec<String> },
    /// Acknowledgment of a keep-alive ping
    KeepAliveAck,
    /// Any other command
    Other { msg_type: String },
}

impl InboundMessage {
    /// Short name used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Offer { .. } => "offer",
            InboundMessage::Candidate { .. } => "candidate",
            InboundMessage::RosterChange { .. } => "roster_change",
            InboundMessage::KeepAliveAck => "keepalive_ack",
            InboundMessage::Other { .. } => "other",
        }
    }

    /// Remote id the message is about, if any
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            InboundMessage::Offer { sender_id, .. } | InboundMessage::Candidate { sender_id, .. } => {
                Some(sender_id)
            }
            _ => None,
        }
    }

    /// Decode an `easyrtcCmd` payload
    pub fn decode(payload: &Value) -> Result<Self> {
        let envelope: Envelope = serde_json::from_value(payload.clone())
            .map_err(|e| AppError::MalformedMessage(format!("Bad command envelope: {}", e)))?;

        match envelope.msg_type.as_str() {
            "offer" => decode_offer(envelope),
            "candidate" => decode_candidate(envelope),
            "roomData" => Ok(decode_room_data(&envelope)),
            "ack" | "stillAlive" => Ok(InboundMessage::KeepAliveAck),
            other => Ok(InboundMessage::Other {
                msg_type: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    msg_type: String,
    #[serde(default)]
    sender_easyrtcid: Option<String>,
    #[serde(default)]
    easyrtcid: Option<String>,
    #[serde(default)]
    target_easyrtcid: Option<String>,
    #[serde(default)]
    msg_data: Value,
}

impl Envelope {
    fn sender(&self) -> Result<String> {
        self.sender_easyrtcid
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AppError::MalformedMessage(format!("{} without senderEasyrtcid", self.msg_type))
            })
    }
}

#[derive(Debug, Deserialize)]
struct OfferData {
    #[serde(rename = "type")]
    sdp_type: String,
    sdp: String,
}

#[derive(Debug, Deserialize)]
struct CandidateData {
    #[serde(default)]
    candidate: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    label: Option<Value>,
}

fn decode_offer(envelope: Envelope) -> Result<InboundMessage> {
    let sender_id = envelope.sender()?;
    let local_id = envelope
        .easyrtcid
        .clone()
        .or_else(|| envelope.target_easyrtcid.clone())
        .ok_or_else(|| AppError::MalformedMessage("offer without local easyrtcid".into()))?;

    let data: OfferData = serde_json::from_value(envelope.msg_data)
        .map_err(|e| AppError::MalformedMessage(format!("Bad offer data: {}", e)))?;
    let sdp_type: SdpType = data.sdp_type.parse()?;
    if sdp_type != SdpType::Offer {
        return Err(AppError::MalformedMessage(format!(
            "offer carries a {} description",
            sdp_type
        )));
    }

    Ok(InboundMessage::Offer {
        sender_id,
        local_id,
        description: SessionDescription::new(sdp_type, data.sdp),
    })
}

fn decode_candidate(envelope: Envelope) -> Result<InboundMessage> {
    let sender_id = envelope.sender()?;
    let data: CandidateData = serde_json::from_value(envelope.msg_data)
        .map_err(|e| AppError::MalformedMessage(format!("Bad candidate data: {}", e)))?;

    if data.candidate.trim().is_empty() {
        return Ok(InboundMessage::Candidate {
            sender_id,
            candidate: None,
        });
    }

    // Browsers send the m-line index as a number, some clients as a string
    let index = match data.label {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    let candidate = IceCandidate::parse(&data.candidate)?.with_mid(data.id, index);

    Ok(InboundMessage::Candidate {
        sender_id,
        candidate: Some(candidate),
    })
}

/// Collect departing client ids from every room's `removeClient` delta
fn decode_room_data(envelope: &Envelope) -> InboundMessage {
    let mut removed = Vec::new();

    let rooms = envelope
        .msg_data
        .get("roomData")
        .and_then(Value::as_object);
    for room in rooms.into_iter().flat_map(Map::values) {
        let departures = room
            .pointer("/clientListDelta/removeClient")
            .and_then(Value::as_object);
        for (key, client) in departures.into_iter().flatten() {
            let id = client
                .get("easyrtcid")
                .and_then(Value::as_str)
                .unwrap_or(key.as_str());
            if !removed.iter().any(|r| r == id) {
                removed.push(id.to_string());
            }
        }
    }

    if removed.is_empty() {
        InboundMessage::Other {
            msg_type: "roomData".to_string(),
        }
    } else {
        InboundMessage::RosterChange { removed }
    }
}

/// `easyrtcAuth` payload
pub fn authenticate(
    api_version: &str,
    application_name: &str,
    username: &str,
    room: Option<&str>,
) -> Value {
    let mut msg_data = json!({
        "apiVersion": api_version,
        "applicationName": application_name,
        "username": username,
    });
    if let Some(room) = room {
        let mut rooms = Map::new();
        rooms.insert(room.to_string(), json!({ "roomName": room }));
        msg_data["roomJoin"] = Value::Object(rooms);
    }
    json!({
        "msgType": "authenticate",
        "msgData": msg_data,
    })
}

/// `answer` command addressed to `target`
pub fn answer(target: &str, description: &SessionDescription) -> Value {
    json!({
        "msgType": "answer",
        "targetEasyrtcid": target,
        "msgData": {
            "type": description.sdp_type.as_str(),
            "sdp": description.sdp,
        },
    })
}

/// Keep-alive ping
pub fn still_alive() -> Value {
    json!({ "msgType": "stillAlive" })
}

/// Outcome of an `easyrtcAuth` acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    /// Id the server assigned to this connection
    pub easyrtcid: String,
}

impl AuthResponse {
    pub fn decode(ack: &Value) -> Result<Self> {
        let msg_type = ack.get("msgType").and_then(Value::as_str).unwrap_or("");
        match msg_type {
            "token" => {
                let easyrtcid = ack
                    .pointer("/msgData/easyrtcid")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AppError::MalformedMessage("token without msgData.easyrtcid".into())
                    })?;
                Ok(Self {
                    easyrtcid: easyrtcid.to_string(),
                })
            }
            "error" => {
                let reason = ack
                    .pointer("/msgData/errorText")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                Err(AppError::TransportFailure(format!(
                    "Authentication rejected: {}",
                    reason
                )))
            }
            other => Err(AppError::MalformedMessage(format!(
                "Unexpected authentication reply: {}",
                other
            ))),
        }
    }
}
