//! Serial link to the microcontroller

use std::io::{Read, Write};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::error::{AppError, Result};

/// Longest response line accepted from the board
const MAX_RESPONSE_LEN: usize = 256;

/// Blocking byte link to the microcontroller
///
/// Implementations are driven from a single writer task, one command at a
/// time, so they need no internal locking.
pub trait DeviceLink: Send {
    /// Human-readable device name (port path)
    fn name(&self) -> &str;

    /// Write one framed command verbatim
    fn write(&mut self, command: &str) -> Result<()>;

    /// Read one response line; empty when nothing arrived before the timeout
    fn read(&mut self) -> Result<Vec<u8>>;
}

/// Serial port backed [`DeviceLink`]
pub struct SerialLink {
    port_path: String,
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    /// Open the serial port and wait for the board to come out of reset
    ///
    /// Blocking; call from `spawn_blocking`.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open()
            .map_err(|e| serial_error(&config.port, e))?;

        info!(
            "Serial link opened: {} @ {} baud",
            config.port, config.baud_rate
        );

        // Opening the port toggles DTR, which resets most boards
        if config.settle_ms > 0 {
            debug!("Waiting {} ms for the board to reset", config.settle_ms);
            std::thread::sleep(Duration::from_millis(config.settle_ms));
        }

        Ok(Self {
            port_path: config.port.clone(),
            port,
        })
    }

    fn link_error(&self, reason: impl Into<String>) -> AppError {
        AppError::DeviceLinkFailure {
            device: self.port_path.clone(),
            reason: reason.into(),
        }
    }
}

fn serial_error(port: &str, e: serialport::Error) -> AppError {
    let reason = match e.kind() {
        serialport::ErrorKind::NoDevice => format!("port not found: {}", e),
        serialport::ErrorKind::InvalidInput => format!("invalid port settings: {}", e),
        serialport::ErrorKind::Io(_) => format!("io error: {}", e),
        serialport::ErrorKind::Unknown => e.to_string(),
    };
    AppError::DeviceLinkFailure {
        device: port.to_string(),
        reason,
    }
}

impl DeviceLink for SerialLink {
    fn name(&self) -> &str {
        &self.port_path
    }

    fn write(&mut self, command: &str) -> Result<()> {
        if !command.is_ascii() {
            return Err(self.link_error(format!("non-ASCII command: {:?}", command)));
        }
        self.port
            .write_all(command.as_bytes())
            .and_then(|_| self.port.flush())
            .map_err(|e| self.link_error(format!("write failed: {}", e)))
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        while line.len() < MAX_RESPONSE_LEN {
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(self.link_error(format!("read failed: {}", e))),
            }
        }

        Ok(line)
    }
}
