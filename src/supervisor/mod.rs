//! Lifecycle supervisor
//!
//! Each logical stream runs as an independent channel task that owns its
//! signaling connection and registry. Shutdown of one channel is strictly
//! ordered:
//!
//! ```text
//! cancel -> loop exits (no in-flight event) -> close + remove sessions
//!        -> disconnect signaling -> stop flag set -> task joined
//! ```
//!
//! Channels are stopped concurrently. A Janus publisher follows the same
//! order, destroying its Janus session in place of the signaling disconnect.

pub mod channel;
pub mod publisher;

pub use channel::{
    ChannelReport, ChannelRole, ChannelSettings, StopReason, StreamChannel, StreamChannelHandle,
};
pub use publisher::{JanusPublisher, JanusSettings};

use futures::future::join_all;
use tracing::info;

use crate::error::Result;

/// Owns the running stream channels
#[derive(Default)]
pub struct LifecycleSupervisor {
    channels: Vec<StreamChannelHandle>,
}

impl LifecycleSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a channel and take ownership of it
    pub async fn start(&mut self, channel: StreamChannel) -> Result<()> {
        let handle = channel.start().await?;
        self.track(handle);
        Ok(())
    }

    /// Start a Janus publisher and take ownership of it
    pub async fn start_publisher(&mut self, publisher: JanusPublisher) -> Result<()> {
        let handle = publisher.start().await?;
        self.track(handle);
        Ok(())
    }

    fn track(&mut self, handle: StreamChannelHandle) {
        info!(
            channel = %handle.name(),
            role = %handle.role(),
            local_id = %handle.local_id(),
            "Stream channel started"
        );
        self.channels.push(handle);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[StreamChannelHandle] {
        &self.channels
    }

    /// Wait until every channel has stopped on its own
    pub async fn all_stopped(&self) {
        join_all(self.channels.iter().map(|c| c.stopped())).await;
    }

    /// Stop every channel and wait for all teardowns
    pub async fn shutdown(self) -> Vec<ChannelReport> {
        info!("Stopping {} stream channel(s)", self.channels.len());
        let reports = join_all(self.channels.into_iter().map(|c| c.stop())).await;
        for report in &reports {
            info!(
                channel = %report.name,
                reason = %report.reason,
                sessions_closed = report.sessions_closed,
                events = report.events_routed,
                "Channel report"
            );
        }
        reports
    }
}
