//! Wall-clock frame pacing for hub-originated streams.
//!
//! Chime and TTS playout emit frame N at `start + N x 20 ms` regardless of
//! when frame N-1 was dispatched, so scheduling jitter never accumulates
//! into drift over a long stream.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::protocol::FRAME_DURATION_MS;

/// Paces a stream of 20 ms frames against the wall clock.
pub struct FramePacer {
    start: Instant,
    frame: Duration,
    index: u64,
}

impl FramePacer {
    /// Starts the clock now; the first `tick` returns immediately.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            start,
            frame: Duration::from_millis(FRAME_DURATION_MS as u64),
            index: 0,
        }
    }

    /// Waits until frame `index` is due, then returns its index.
    pub async fn tick(&mut self) -> u64 {
        let due = self.start + self.frame * self.index as u32;
        sleep_until(due).await;
        let index = self.index;
        self.index += 1;
        index
    }

    /// Frames emitted so far.
    pub fn emitted(&self) -> u64 {
        self.index
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new()
    }
}
