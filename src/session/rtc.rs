//! WebRTC-backed session negotiator

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::negotiator::{
    DataChannelInfo, IceCandidate, NegotiatorFactory, SdpType, SessionDescription,
    SessionNegotiator,
};
use super::peer::PeerIdentity;
use crate::config::WebRtcConfig;
use crate::device::DeviceController;
use crate::error::{AppError, Result};
use crate::supervisor::ChannelRole;

/// Upper bound on waiting for ICE gathering before answering
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(3);

const H264_CLOCK_RATE: u32 = 90000;
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

fn negotiation_error(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::NegotiationFailure(format!("{}: {}", context, e))
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
    };
    result.map_err(|e| negotiation_error("Invalid SDP", e))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        other => {
            return Err(AppError::NegotiationFailure(format!(
                "Unexpected local SDP type: {}",
                other
            )))
        }
    };
    Ok(SessionDescription::new(sdp_type, description.sdp))
}

/// H.264 sample track attached to camera sessions
pub fn camera_track(config: &WebRtcConfig) -> Arc<TrackLocalStaticSample> {
    let capability = RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate: H264_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: H264_FMTP.to_string(),
        rtcp_feedback: vec![],
    };
    Arc::new(TrackLocalStaticSample::new(
        capability,
        config.track_id.clone(),
        config.stream_id.clone(),
    ))
}

/// Negotiator over one `RTCPeerConnection`
pub struct RtcNegotiator {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl SessionNegotiator for RtcNegotiator {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| negotiation_error("Failed to set remote description", e))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| negotiation_error("Failed to create answer", e))?;
        from_rtc_description(answer)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| negotiation_error("Failed to create offer", e))?;
        from_rtc_description(offer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        let mut gathering = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| negotiation_error("Failed to set local description", e))?;

        // Peers expect candidates inside the SDP; there is no trickle back
        if tokio::time::timeout(ICE_GATHER_TIMEOUT, gathering.recv())
            .await
            .is_err()
        {
            warn!("ICE gathering did not complete in {:?}", ICE_GATHER_TIMEOUT);
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        from_rtc_description(description).ok()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| negotiation_error("Failed to add ICE candidate", e))
    }

    async fn create_data_channel(&self, label: &str) -> Result<DataChannelInfo> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| negotiation_error("Failed to create data channel", e))?;

        Ok(DataChannelInfo {
            label: dc.label().to_string(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| negotiation_error("Failed to close peer connection", e))
    }
}

/// Builds WebRTC negotiators for one stream channel
pub struct RtcNegotiatorFactory {
    config: WebRtcConfig,
    role: ChannelRole,
    device: Option<DeviceController>,
}

impl RtcNegotiatorFactory {
    pub fn new(config: WebRtcConfig, role: ChannelRole, device: Option<DeviceController>) -> Self {
        Self {
            config,
            role,
            device,
        }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| negotiation_error("Failed to register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| negotiation_error("Failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| negotiation_error("Failed to create peer connection", e))?;

        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl NegotiatorFactory for RtcNegotiatorFactory {
    async fn create(&self, identity: &PeerIdentity) -> Result<Box<dyn SessionNegotiator>> {
        let pc = self.new_peer_connection().await?;

        let remote_id = identity.remote_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let remote_id = remote_id.clone();
            Box::pin(async move {
                info!(remote_id = %remote_id, "Peer connection state: {}", s);
            })
        }));

        if self.role == ChannelRole::Camera && self.config.video_track {
            let track = camera_track(&self.config);
            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| negotiation_error("Failed to add video track", e))?;
            debug!(remote_id = %identity.remote_id, "Video track added");
        }

        if self.role == ChannelRole::Control {
            let device = self.device.clone();
            let remote_id = identity.remote_id.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let device = device.clone();
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    info!(remote_id = %remote_id, "Data channel opened: {}", dc.label());
                    dc.on_message(Box::new(move |msg: DataChannelMessage| {
                        let device = device.clone();
                        Box::pin(async move {
                            let text = String::from_utf8_lossy(&msg.data).to_string();
                            debug!("Control message: {}", text);
                            match device {
                                Some(device) => device.handle_control_text(&text).await,
                                None => debug!("No device attached, control message dropped"),
                            }
                        })
                    }));
                })
            }));
        }

        Ok(Box::new(RtcNegotiator { pc }))
    }
}
