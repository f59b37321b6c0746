use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling server settings
    pub signaling: SignalingConfig,
    /// Liveness ping settings
    pub keepalive: KeepAliveConfig,
    /// Camera stream channel
    pub camera: ChannelConfig,
    /// Text/control stream channel
    pub control: ChannelConfig,
    /// Janus video-room publishing for the camera
    pub janus: JanusConfig,
    /// WebRTC settings
    pub webrtc: WebRtcConfig,
    /// Microcontroller serial link
    pub device: DeviceConfig,
    /// Logging output
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            keepalive: KeepAliveConfig::default(),
            camera: ChannelConfig::camera(),
            control: ChannelConfig::control(),
            janus: JanusConfig::default(),
            webrtc: WebRtcConfig::default(),
            device: DeviceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.signaling.url.trim().is_empty() {
            return Err(AppError::Config("signaling.url must not be empty".into()));
        }
        if self.keepalive.interval_secs == 0 {
            return Err(AppError::Config(
                "keepalive.interval_secs must be greater than zero".into(),
            ));
        }
        if self.keepalive.max_missed == 0 {
            return Err(AppError::Config(
                "keepalive.max_missed must be greater than zero".into(),
            ));
        }
        for (name, channel) in [("camera", &self.camera), ("control", &self.control)] {
            if channel.enabled && channel.username.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "{}.username must not be empty",
                    name
                )));
            }
        }
        if self.janus.enabled {
            if self.janus.url.trim().is_empty() {
                return Err(AppError::Config(
                    "janus.url must be set when janus is enabled".into(),
                ));
            }
            if self.janus.display.trim().is_empty() {
                return Err(AppError::Config("janus.display must not be empty".into()));
            }
            if self.janus.request_timeout_secs == 0 || self.janus.poll_timeout_secs == 0 {
                return Err(AppError::Config(
                    "janus timeouts must be greater than zero".into(),
                ));
            }
        }
        if self.device.enabled && self.device.port.trim().is_empty() {
            return Err(AppError::Config(
                "device.port must be set when the device is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Engine.IO protocol revision spoken by the signaling server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineIoRevision {
    /// Socket.IO 1.x/2.x servers (client sends pings)
    V3,
    /// Socket.IO 3.x/4.x servers (server sends pings)
    V4,
}

impl EngineIoRevision {
    pub fn query_value(&self) -> &'static str {
        match self {
            Self::V3 => "3",
            Self::V4 => "4",
        }
    }
}

impl Default for EngineIoRevision {
    fn default() -> Self {
        Self::V4
    }
}

/// Signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Server URL (http, https, ws or wss)
    pub url: String,
    /// EasyRTC API version announced during authentication
    pub api_version: String,
    /// EasyRTC application name
    pub application_name: String,
    /// Engine.IO protocol revision
    pub engine_io: EngineIoRevision,
    /// Transport connect timeout
    pub connect_timeout_secs: u64,
    /// Timeout applied to every emit acknowledgment
    pub ack_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "http://10.0.0.5:8082".to_string(),
            api_version: "1.1.1-beta".to_string(),
            application_name: "Client-Line".to_string(),
            engine_io: EngineIoRevision::default(),
            connect_timeout_secs: 10,
            ack_timeout_secs: 10,
        }
    }
}

/// Liveness ping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Seconds between `stillAlive` messages
    pub interval_secs: u64,
    /// Seconds to wait for each ping acknowledgment
    pub timeout_secs: u64,
    /// Consecutive unacknowledged pings before the channel is torn down
    pub max_missed: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 20,
            timeout_secs: 10,
            max_missed: 3,
        }
    }
}

/// Per-stream channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Start this channel
    pub enabled: bool,
    /// Username announced to the signaling server
    pub username: String,
    /// Room to join during authentication (server default room if unset)
    pub room: Option<String>,
}

impl ChannelConfig {
    pub fn camera() -> Self {
        Self {
            enabled: true,
            username: "bot1".to_string(),
            room: None,
        }
    }

    pub fn control() -> Self {
        Self {
            enabled: true,
            username: "listener".to_string(),
            room: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            username: String::new(),
            room: None,
        }
    }
}

/// Janus video-room configuration
///
/// When enabled the camera publishes into a Janus room instead of answering
/// EasyRTC offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JanusConfig {
    pub enabled: bool,
    /// Janus HTTP API endpoint
    pub url: String,
    /// Video room to join
    pub room: u64,
    /// Publisher display name
    pub display: String,
    /// Timeout for requests and their plugin replies
    pub request_timeout_secs: u64,
    /// Upper bound on one long-poll request (the server answers with a
    /// keepalive after 30 seconds)
    pub poll_timeout_secs: u64,
}

impl Default for JanusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://10.0.0.5:8088/janus".to_string(),
            room: 1234,
            display: "bot1".to_string(),
            request_timeout_secs: 10,
            poll_timeout_secs: 60,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN servers
    pub turn_servers: Vec<TurnServer>,
    /// Attach a video track to camera sessions
    pub video_track: bool,
    /// Video track id
    pub track_id: String,
    /// Media stream id
    pub stream_id: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough on the robot's LAN
            stun_servers: vec![],
            turn_servers: vec![],
            video_track: true,
            track_id: "video0".to_string(),
            stream_id: "robot-camera".to_string(),
        }
    }
}

/// Microcontroller serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Open the serial link at startup
    pub enabled: bool,
    /// Serial port path
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Response read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Delay after opening the port (the board resets on open)
    pub settle_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 38400,
            read_timeout_ms: 15,
            settle_ms: 2000,
        }
    }
}

/// Logging output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write logs to this file
    pub file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.camera.username, "bot1");
        assert_eq!(config.control.username, "listener");
        assert_eq!(config.keepalive.interval_secs, 20);
        assert_eq!(config.device.baud_rate, 38400);
    }

    #[test]
    fn test_validate_rejects_empty_url() {
        let mut config = AppConfig::default();
        config.signaling.url = "  ".to_string();
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_device_without_port() {
        let mut config = AppConfig::default();
        config.device.enabled = true;
        config.device.port = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_janus_section() {
        let mut config = AppConfig::default();
        config.janus.url = String::new();
        assert!(config.validate().is_ok());

        config.janus.enabled = true;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        config.janus.url = "http://janus:8088/janus".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.janus.room, 1234);
    }

    #[test]
    fn test_disabled_channel_may_have_empty_username() {
        let mut config = AppConfig::default();
        config.control.enabled = false;
        config.control.username = String::new();
        assert!(config.validate().is_ok());
    }
}
