//! Microcontroller control
//!
//! The serial link is a process-wide resource with no framing of its own, so
//! every write goes through one worker task that owns the link:
//!
//! ```text
//! move event ----+
//!                +--> DeviceController queue --> worker --> DeviceLink (serial)
//! data channel --+                                 write, then read one line
//! ```

pub mod command;
pub mod link;

pub use command::{parse_command_groups, parse_control_text, parse_control_value, DeviceCommand};
pub use link::{DeviceLink, SerialLink};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::DeviceConfig;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

const DEVICE_QUEUE_CAPACITY: usize = 64;
const DEVICE_SEND_TIMEOUT_MS: u64 = 30;
const FAILURE_LOG_INTERVAL_SECS: u64 = 5;

/// Counters kept by the device worker
#[derive(Debug, Default)]
pub struct DeviceStats {
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl DeviceStats {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Commands dropped because the queue stayed full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Inner {
    device: String,
    cancel: CancellationToken,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stats: Arc<DeviceStats>,
}

/// Cloneable handle to the single device writer
#[derive(Clone)]
pub struct DeviceController {
    tx: mpsc::Sender<DeviceCommand>,
    inner: Arc<Inner>,
}

impl DeviceController {
    /// Start the writer task over an already opened link
    pub fn start(link: Box<dyn DeviceLink>) -> Self {
        let (tx, rx) = mpsc::channel(DEVICE_QUEUE_CAPACITY);
        let device = link.name().to_string();
        let cancel = CancellationToken::new();
        let stats = Arc::new(DeviceStats::default());

        let handle = tokio::spawn(run_worker(
            Arc::new(Mutex::new(link)),
            rx,
            cancel.clone(),
            stats.clone(),
        ));

        info!("Device controller started for {}", device);

        Self {
            tx,
            inner: Arc::new(Inner {
                device,
                cancel,
                worker: tokio::sync::Mutex::new(Some(handle)),
                stats,
            }),
        }
    }

    /// Open the serial port described by `config` and start the writer
    pub async fn open_serial(config: &DeviceConfig) -> Result<Self> {
        let config = config.clone();
        let link = tokio::task::spawn_blocking(move || SerialLink::open(&config))
            .await
            .map_err(|e| AppError::Internal(format!("Serial open task failed: {}", e)))??;
        Ok(Self::start(Box::new(link)))
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.inner.stats
    }

    /// Queue one command
    ///
    /// Waits briefly when the queue is full, then drops the command.
    pub async fn submit(&self, command: DeviceCommand) -> Result<()> {
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(command)) => {
                let sent = tokio::time::timeout(
                    Duration::from_millis(DEVICE_SEND_TIMEOUT_MS),
                    self.tx.send(command),
                )
                .await;
                match sent {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(self.closed_error()),
                    Err(_) => {
                        self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("Device queue full, dropping command");
                        Ok(())
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed_error()),
        }
    }

    /// Queue commands in order
    pub async fn submit_all(&self, commands: Vec<DeviceCommand>) -> Result<()> {
        for command in commands {
            self.submit(command).await?;
        }
        Ok(())
    }

    /// Parse and queue a control payload (JSON groups or framed text)
    ///
    /// Malformed payloads are logged and dropped.
    pub async fn handle_control_value(&self, payload: &Value) {
        match parse_control_value(payload) {
            Ok(commands) => self.queue_parsed(commands).await,
            Err(e) => warn!("Dropping control payload: {}", e),
        }
    }

    /// Parse and queue control text received on a data channel
    pub async fn handle_control_text(&self, text: &str) {
        match parse_control_text(text) {
            Ok(commands) => self.queue_parsed(commands).await,
            Err(e) => warn!("Dropping control message: {}", e),
        }
    }

    async fn queue_parsed(&self, commands: Vec<DeviceCommand>) {
        trace!("Queueing {} device command(s)", commands.len());
        if let Err(e) = self.submit_all(commands).await {
            warn!("Failed to queue device commands: {}", e);
        }
    }

    /// Stop the writer and release the link
    ///
    /// Commands still queued are discarded.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.worker.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Device worker ended abnormally: {}", e);
            }
            info!(
                device = %self.inner.device,
                written = self.inner.stats.written(),
                failed = self.inner.stats.failed(),
                "Device controller stopped"
            );
        }
    }

    fn closed_error(&self) -> AppError {
        AppError::DeviceLinkFailure {
            device: self.inner.device.clone(),
            reason: "device controller stopped".to_string(),
        }
    }
}

async fn run_worker(
    link: Arc<Mutex<Box<dyn DeviceLink>>>,
    mut rx: mpsc::Receiver<DeviceCommand>,
    cancel: CancellationToken,
    stats: Arc<DeviceStats>,
) {
    let throttler = LogThrottler::with_secs(FAILURE_LOG_INTERVAL_SECS);

    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let frame = command.encode();
        let link = link.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut link = link.lock();
            link.write(&frame)?;
            link.read()
        })
        .await;

        match result {
            Ok(Ok(response)) => {
                stats.written.fetch_add(1, Ordering::Relaxed);
                throttler.clear("device_failure");
                if response.is_empty() {
                    trace!("{} sent, no response", command);
                } else {
                    debug!(
                        "{} sent, response: {}",
                        command,
                        String::from_utf8_lossy(&response).trim_end()
                    );
                }
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = throttler.check("device_failure") {
                    warn!(
                        kind = e.kind(),
                        suppressed, "Dropping device command {}: {}", command, e
                    );
                }
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Device write task failed: {}", e);
            }
        }
    }

    debug!("Device worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryLink;
    use serde_json::json;

    async fn wait_for_writes(link: &MemoryLink, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while link.writes().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device writes did not arrive");
    }

    #[tokio::test]
    async fn test_command_written_verbatim() {
        let link = MemoryLink::new("mem0");
        let controller = DeviceController::start(Box::new(link.clone()));

        controller
            .submit("<M 255 255>".parse().unwrap())
            .await
            .unwrap();
        wait_for_writes(&link, 1).await;

        assert_eq!(link.writes(), vec!["<M 255 255>".to_string()]);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_groups_written_in_order() {
        let link = MemoryLink::new("mem0");
        let controller = DeviceController::start(Box::new(link.clone()));

        controller
            .handle_control_value(&json!({"M": ["255", "255"], "L1": ["255"], "L2": ["0"]}))
            .await;
        wait_for_writes(&link, 3).await;

        assert_eq!(link.writes(), vec!["<M 255 255>", "<L1 255>", "<L2 0>"]);
        assert_eq!(controller.stats().written(), 3);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_worker() {
        let link = MemoryLink::new("mem0");
        link.fail_next_writes(1);
        let controller = DeviceController::start(Box::new(link.clone()));

        controller.handle_control_text("<M 1 1>").await;
        controller.handle_control_text("<M 2 2>").await;
        wait_for_writes(&link, 1).await;

        assert_eq!(link.writes(), vec!["<M 2 2>"]);
        assert_eq!(controller.stats().failed(), 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let link = MemoryLink::new("mem0");
        let controller = DeviceController::start(Box::new(link.clone()));

        controller.handle_control_value(&json!([1, 2, 3])).await;
        controller.handle_control_text("<M 3 3>").await;
        wait_for_writes(&link, 1).await;

        assert_eq!(link.writes(), vec!["<M 3 3>"]);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let link = MemoryLink::new("mem0");
        let controller = DeviceController::start(Box::new(link));
        controller.shutdown().await;

        let result = controller.submit("<M 0 0>".parse().unwrap()).await;
        assert!(matches!(result, Err(AppError::DeviceLinkFailure { .. })));
    }
}
