//! Peer sessions and the per-channel connection registry
//!
//! ```text
//! NegotiatorFactory --create--> SessionNegotiator
//!                                      |
//!                               PeerSession (identity, state)
//!                                      |
//!                            ConnectionRegistry (by remote id)
//! ```

pub mod negotiator;
pub mod peer;
pub mod registry;
pub mod rtc;

pub use negotiator::{
    DataChannelInfo, IceCandidate, NegotiatorFactory, SdpType, SessionDescription,
    SessionNegotiator,
};
pub use peer::{PeerIdentity, PeerSession, SessionState};
pub use registry::ConnectionRegistry;
pub use rtc::{RtcNegotiator, RtcNegotiatorFactory};
