//! Janus gateway client
//!
//! HTTP REST flavour of the Janus API: a session is created on the server,
//! plugins are attached to it, and events come back through a long poll.
//!
//! ```text
//! POST /janus            create   -> session id
//! POST /janus/<sid>      attach   -> handle id
//! POST /janus/<sid>/<h>  message  -> ack, result later on the poll
//! GET  /janus/<sid>      long poll (keepalive after 30 s)
//! POST /janus/<sid>      destroy
//! ```

mod session;
mod transport;

pub use session::{
    JanusEvent, JanusSession, PluginHandle, PluginReply, VIDEOROOM_PLUGIN,
};
pub use transport::{HttpTransport, JanusTransport};
