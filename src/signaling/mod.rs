//! Signaling: transport to the EasyRTC server and its message formats

pub mod channel;
pub mod message;
pub mod socketio;

pub use channel::{AckReceiver, SignalingChannel, SignalingEvent};
pub use message::{
    AuthResponse, InboundMessage, EASYRTC_AUTH, EASYRTC_CMD, MESSAGE_EVENT, MOVE_EVENT,
};
pub use socketio::SocketIoChannel;
