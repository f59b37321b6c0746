//! robot-client - remote-control robot client
//!
//! Streams a camera to viewers and relays movement commands to a
//! microcontroller. Sessions are negotiated through an EasyRTC signaling
//! server over Socket.IO; each logical stream (camera, control) runs as its
//! own channel with its own connection and session registry. The camera can
//! instead publish into a Janus video room.

pub mod config;
pub mod device;
pub mod error;
pub mod janus;
pub mod router;
pub mod session;
pub mod signaling;
pub mod supervisor;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AppError, Result};
