//! Diagnostic audio capture ring.
//!
//! A fixed-capacity ring of recent frames tapped from the RX path (after
//! parse, before routing) and every TX direction including chime playout.
//! The ring has its own lock so diagnostics can never stall the hot path,
//! and readers take snapshots rather than holding the lock while
//! serializing.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use crate::packet::DeviceId;
use crate::protocol::CAPTURE_BUFFER_FRAMES;
use crate::utils::now_millis;

/// Which side of the hub a captured frame was seen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rx" => Some(Self::Rx),
            "tx" => Some(Self::Tx),
            _ => None,
        }
    }
}

/// One captured frame.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedFrame {
    pub direction: Direction,
    pub device_id: DeviceId,
    pub sequence: u32,
    pub timestamp_ms: u64,
    /// Opus payload length; the payload itself is hex-encoded on fetch.
    pub len: usize,
    #[serde(serialize_with = "hex_payload")]
    pub payload: Bytes,
}

fn hex_payload<S: serde::Serializer>(payload: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    let mut out = String::with_capacity(payload.len() * 2);
    for b in payload.iter() {
        out.push_str(&format!("{:02x}", b));
    }
    s.serialize_str(&out)
}

/// Filter for [`AudioCaptureBuffer::fetch`]. Unset fields match everything.
#[derive(Debug, Default, Clone)]
pub struct CaptureFilter {
    pub direction: Option<Direction>,
    pub device_id: Option<DeviceId>,
    pub since_ms: Option<u64>,
    pub limit: Option<usize>,
}

struct Inner {
    frames: VecDeque<CapturedFrame>,
    enabled: bool,
}

/// Thread-safe capture ring with snapshot-reader semantics.
pub struct AudioCaptureBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for AudioCaptureBuffer {
    fn default() -> Self {
        Self::new(CAPTURE_BUFFER_FRAMES)
    }
}

impl AudioCaptureBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::new(),
                enabled: false,
            }),
            capacity,
        }
    }

    /// Enables capture. Idempotent: a second `start` without an
    /// intervening `stop` changes nothing.
    pub fn start(&self) {
        self.inner.lock().enabled = true;
    }

    /// Disables capture. Already-captured frames are retained.
    pub fn stop(&self) {
        self.inner.lock().enabled = false;
    }

    /// Drops all captured frames. Does not change the enabled flag.
    pub fn clear(&self) {
        self.inner.lock().frames.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records a frame if capture is enabled; oldest frame drops on overflow.
    pub fn record(&self, direction: Direction, device_id: DeviceId, sequence: u32, payload: Bytes) {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return;
        }
        if inner.frames.len() >= self.capacity {
            inner.frames.pop_front();
        }
        inner.frames.push_back(CapturedFrame {
            direction,
            device_id,
            sequence,
            timestamp_ms: now_millis(),
            len: payload.len(),
            payload,
        });
    }

    /// Returns a filtered snapshot of the ring, oldest first.
    pub fn fetch(&self, filter: &CaptureFilter) -> Vec<CapturedFrame> {
        let inner = self.inner.lock();
        let mut out: Vec<CapturedFrame> = inner
            .frames
            .iter()
            .filter(|f| filter.direction.map_or(true, |d| f.direction == d))
            .filter(|f| filter.device_id.map_or(true, |id| f.device_id == id))
            .filter(|f| filter.since_ms.map_or(true, |t| f.timestamp_ms >= t))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }
}
