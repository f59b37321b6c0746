//! Log throttling for repeating failures
//!
//! A disconnected serial device fails every command; without throttling each
//! queued command would produce its own warning.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened_at: Instant,
    suppressed: u64,
}

/// Limits how often a message with the same key is logged
pub struct LogThrottler {
    windows: Mutex<HashMap<String, Window>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `Some(suppressed)` when the message should be logged now,
    /// carrying the number of occurrences swallowed since the last log line.
    /// Returns `None` when the message is throttled.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        match windows.get_mut(key) {
            Some(window) if now.duration_since(window.opened_at) < self.interval => {
                window.suppressed += 1;
                None
            }
            Some(window) => {
                let suppressed = window.suppressed;
                *window = Window {
                    opened_at: now,
                    suppressed: 0,
                };
                Some(suppressed)
            }
            None => {
                windows.insert(
                    key.to_string(),
                    Window {
                        opened_at: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Convenience wrapper over [`check`](Self::check)
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget a key once its condition recovered, so the next failure logs immediately
    pub fn clear(&self, key: &str) {
        self.windows.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}
