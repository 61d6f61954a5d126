//! Monotonic stopwatch and unique id generation.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::net::local_ip;

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Elapsed-time measurement with a wall-clock anchor.
///
/// Elapsed time is taken from the monotonic clock so it cannot run
/// backwards; the wall-clock anchor is what gets displayed and merged
/// across nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stopwatch {
    monotonic_start: Option<Instant>,
    wall_start_ms: Option<u64>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.monotonic_start = Some(Instant::now());
        self.wall_start_ms = Some(epoch_ms());
    }

    /// Wall-clock start in milliseconds since the epoch; `None` before
    /// the watch is started.
    pub fn start_time(&self) -> Option<u64> {
        self.wall_start_ms
    }

    /// Elapsed milliseconds on the monotonic clock; 0 before start.
    pub fn elapsed_ms(&self) -> u64 {
        self.monotonic_start
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Unique id of the form `<ip>-<namespace>-<uuid4>`.
pub fn uid(namespace: &str) -> String {
    format!("{}-{}-{}", local_ip(), namespace, Uuid::new_v4())
}
