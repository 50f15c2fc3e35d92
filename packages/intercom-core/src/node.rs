//! Node audio plane: the embedded-side receive/play contract.
//!
//! This module mirrors what the satellite firmware does with the hub's
//! streams so both ends interoperate bit-exactly: a 15-deep receive queue
//! that drops the oldest frame on overflow, a play task that decodes
//! (with PLC and FEC recovery) and writes one frame per bounded I2S
//! write, a 2-frame pre-fill on enable, a silence flush before disable,
//! and chime detection that suppresses the local fallback beep.
//!
//! The I2S hardware sits behind [`I2sWriter`]; implementations bound
//! `write_frame` at one frame time (20 ms) and report a timeout instead
//! of retrying forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::{silence_frame, AudioDecoder};
use crate::error::IntercomResult;
use crate::packet::{AudioFrame, DeviceId};
use crate::protocol::{CHIME_FALLBACK_TIMEOUT_MS, IDLE_RECLAIM_MS, NODE_PREFILL_FRAMES, NODE_RX_QUEUE_DEPTH};

// ─────────────────────────────────────────────────────────────────────────────
// Receive Queue
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded frame queue between the receive task and the play task.
/// Overflow drops the *oldest* frame and counts it.
pub struct FrameQueue {
    inner: Mutex<VecDeque<AudioFrame>>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(NODE_RX_QUEUE_DEPTH)
    }
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity,
        }
    }

    /// Pushes a frame, dropping the oldest when full.
    pub fn push(&self, frame: AudioFrame) {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Waits for the next frame.
    pub async fn pop(&self) -> AudioFrame {
        loop {
            if let Some(frame) = self.inner.lock().pop_front() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// I2S Seam
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one bounded I2S write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The DMA did not accept the frame within 20 ms. Counts a stall.
    TimedOut,
}

/// The hardware boundary of the play task.
pub trait I2sWriter: Send {
    /// Enables the output path. The play task pre-fills
    /// [`NODE_PREFILL_FRAMES`] silence frames right after.
    fn enable(&mut self);

    /// Writes one 320-sample frame, bounded at one frame time.
    fn write_frame(&mut self, pcm: &[i16]) -> WriteOutcome;

    /// Disables the output path. The play task flushes one silence frame
    /// first so no residue clicks on the next enable.
    fn disable(&mut self);
}

/// Play task counters.
#[derive(Default)]
pub struct PlayerStats {
    pub frames_played: AtomicU64,
    pub stalls: AtomicU64,
    pub concealed: AtomicU64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Play Task
// ─────────────────────────────────────────────────────────────────────────────

/// Pulls frames from the queue, decodes, and feeds I2S.
pub struct NodePlayer<W: I2sWriter> {
    queue: Arc<FrameQueue>,
    writer: W,
    decoder: AudioDecoder,
    stats: Arc<PlayerStats>,
}

impl<W: I2sWriter> NodePlayer<W> {
    pub fn new(queue: Arc<FrameQueue>, writer: W) -> IntercomResult<(Self, Arc<PlayerStats>)> {
        let stats = Arc::new(PlayerStats::default());
        Ok((
            Self {
                queue,
                writer,
                decoder: AudioDecoder::new()?,
                stats: Arc::clone(&stats),
            },
            stats,
        ))
    }

    /// Runs until cancelled. A 500 ms receive gap is the idle transition:
    /// flush one silence frame, disable I2S, wait for the next stream.
    pub async fn run(mut self, cancel: CancellationToken) {
        let idle_after = Duration::from_millis(IDLE_RECLAIM_MS);
        let mut playing = false;
        let mut last_seq: Option<u32> = None;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = self.queue.pop() => Some(frame),
                _ = tokio::time::sleep(idle_after), if playing => None,
            };

            match frame {
                Some(frame) => {
                    if !playing {
                        self.writer.enable();
                        let silence = silence_frame();
                        for _ in 0..NODE_PREFILL_FRAMES {
                            self.writer.write_frame(&silence);
                        }
                        playing = true;
                        last_seq = None;
                    }

                    // A sequence gap means loss: the current packet's
                    // in-band FEC carries the tail of the missing frame.
                    if let Some(last) = last_seq {
                        if frame.seq > last.wrapping_add(1) && !frame.payload.is_empty() {
                            let (recovered, _) = self.decoder.decode_or_silence(&frame.payload, true);
                            self.stats.concealed.fetch_add(1, Ordering::Relaxed);
                            self.write(&recovered);
                        }
                    }
                    last_seq = Some(frame.seq);

                    let (pcm, errored) = self.decoder.decode_or_silence(&frame.payload, false);
                    if frame.payload.is_empty() || errored {
                        self.stats.concealed.fetch_add(1, Ordering::Relaxed);
                    }
                    self.write(&pcm);
                }
                None => {
                    // Idle transition: flush residue, then power down.
                    self.writer.write_frame(&silence_frame());
                    self.writer.disable();
                    playing = false;
                    last_seq = None;
                }
            }
        }

        if playing {
            self.writer.write_frame(&silence_frame());
            self.writer.disable();
        }
    }

    fn write(&mut self, pcm: &[i16]) {
        match self.writer.write_frame(pcm) {
            WriteOutcome::Written => {
                self.stats.frames_played.fetch_add(1, Ordering::Relaxed);
            }
            WriteOutcome::TimedOut => {
                self.stats.stalls.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chime Detection
// ─────────────────────────────────────────────────────────────────────────────

/// Decides between the hub's chime stream and the local fallback beep.
///
/// A call notification arms the detector. A multicast stream from the
/// hub's chime device whose sequence restarts at 0 suppresses the beep;
/// if no chime frame arrives within 200 ms the node beeps locally.
pub struct ChimeDetector {
    hub_device: DeviceId,
    armed_at: Option<Instant>,
}

impl ChimeDetector {
    pub fn new(hub_device: DeviceId) -> Self {
        Self {
            hub_device,
            armed_at: None,
        }
    }

    /// Arms the fallback window on a call notification.
    pub fn on_call_notification(&mut self, now: Instant) {
        self.armed_at = Some(now);
    }

    /// Feeds a received frame. Returns true when the frame starts the
    /// hub's chime stream (the fallback beep is then suppressed).
    pub fn on_frame(&mut self, frame: &AudioFrame) -> bool {
        if frame.device == self.hub_device && frame.seq == 0 {
            let was_armed = self.armed_at.take().is_some();
            return was_armed;
        }
        false
    }

    /// True once the fallback window has elapsed with no chime stream.
    /// Disarms, so the beep plays at most once per call.
    pub fn fallback_beep_due(&mut self, now: Instant) -> bool {
        match self.armed_at {
            Some(armed) if now.duration_since(armed).as_millis() as u64 >= CHIME_FALLBACK_TIMEOUT_MS => {
                self.armed_at = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AudioEncoder;
    use crate::packet::Priority;
    use crate::protocol::FRAME_SAMPLES;
    use bytes::Bytes;

    fn dev(n: u8) -> DeviceId {
        DeviceId([n, 0, 0, 0, 0, 0, 0, 0])
    }

    fn opus_frame() -> Bytes {
        let mut enc = AudioEncoder::new().unwrap();
        Bytes::from(enc.encode(&[100i16; FRAME_SAMPLES]).unwrap())
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum I2sEvent {
        Enable,
        Write { silent: bool },
        Disable,
    }

    #[derive(Clone, Default)]
    struct FakeI2s {
        log: Arc<Mutex<Vec<I2sEvent>>>,
        timeout_every: Option<usize>,
        writes: usize,
    }

    impl I2sWriter for FakeI2s {
        fn enable(&mut self) {
            self.log.lock().push(I2sEvent::Enable);
        }

        fn write_frame(&mut self, pcm: &[i16]) -> WriteOutcome {
            self.writes += 1;
            self.log.lock().push(I2sEvent::Write {
                silent: pcm.iter().all(|&s| s == 0),
            });
            match self.timeout_every {
                Some(n) if self.writes % n == 0 => WriteOutcome::TimedOut,
                _ => WriteOutcome::Written,
            }
        }

        fn disable(&mut self) {
            self.log.lock().push(I2sEvent::Disable);
        }
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let queue = FrameQueue::new(3);
        for seq in 0..5 {
            queue.push(AudioFrame::silence(dev(1), seq, Priority::Normal));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        // Oldest two are gone.
        let first = futures::executor::block_on(queue.pop());
        assert_eq!(first.seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn player_prefills_plays_and_flushes_on_idle() {
        let queue = Arc::new(FrameQueue::new(NODE_RX_QUEUE_DEPTH));
        let writer = FakeI2s::default();
        let log = Arc::clone(&writer.log);
        let (player, stats) = NodePlayer::new(Arc::clone(&queue), writer).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(player.run(cancel.clone()));

        for seq in 0..3 {
            queue.push(AudioFrame::new(dev(1), seq, Priority::Normal, opus_frame()));
        }
        // Let the player drain, then cross the 500 ms idle window.
        tokio::time::sleep(Duration::from_millis(600)).await;
        cancel.cancel();
        task.await.unwrap();

        let events = log.lock().clone();
        assert_eq!(events[0], I2sEvent::Enable);
        // 2 prefill silence writes, then 3 audio frames.
        assert_eq!(events[1], I2sEvent::Write { silent: true });
        assert_eq!(events[2], I2sEvent::Write { silent: true });
        let audio_writes = events[3..6]
            .iter()
            .filter(|e| matches!(e, I2sEvent::Write { .. }))
            .count();
        assert_eq!(audio_writes, 3);
        // Idle transition: one silence flush, then disable.
        assert_eq!(events[6], I2sEvent::Write { silent: true });
        assert_eq!(events[7], I2sEvent::Disable);
        assert_eq!(stats.frames_played.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn write_timeouts_count_stalls_without_retry() {
        let queue = Arc::new(FrameQueue::new(NODE_RX_QUEUE_DEPTH));
        let writer = FakeI2s {
            timeout_every: Some(4),
            ..Default::default()
        };
        let (player, stats) = NodePlayer::new(Arc::clone(&queue), writer).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(player.run(cancel.clone()));

        // 2 prefill + 4 frames: write #4 (second audio frame) times out.
        for seq in 0..4 {
            queue.push(AudioFrame::new(dev(1), seq, Priority::Normal, opus_frame()));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(stats.stalls.load(Ordering::Relaxed), 1);
        assert_eq!(stats.frames_played.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_payloads_are_concealed() {
        let queue = Arc::new(FrameQueue::new(NODE_RX_QUEUE_DEPTH));
        let writer = FakeI2s::default();
        let (player, stats) = NodePlayer::new(Arc::clone(&queue), writer).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(player.run(cancel.clone()));

        queue.push(AudioFrame::new(dev(1), 0, Priority::Normal, opus_frame()));
        queue.push(AudioFrame::silence(dev(1), 1, Priority::Normal));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(stats.concealed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_gaps_trigger_fec_recovery() {
        let queue = Arc::new(FrameQueue::new(NODE_RX_QUEUE_DEPTH));
        let writer = FakeI2s::default();
        let (player, stats) = NodePlayer::new(Arc::clone(&queue), writer).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(player.run(cancel.clone()));

        queue.push(AudioFrame::new(dev(1), 0, Priority::Normal, opus_frame()));
        // Frame 1 lost; frame 2 carries FEC for it.
        queue.push(AudioFrame::new(dev(1), 2, Priority::Normal, opus_frame()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(stats.concealed.load(Ordering::Relaxed), 1);
        // 2 real frames + 1 recovered.
        assert_eq!(stats.frames_played.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn chime_stream_suppresses_the_fallback_beep() {
        let hub = dev(0xf0);
        let mut detector = ChimeDetector::new(hub);
        let now = Instant::now();
        detector.on_call_notification(now);

        // Chime arrives 50 ms later with a restarted sequence.
        let chime_start = AudioFrame::new(hub, 0, Priority::Normal, opus_frame());
        assert!(detector.on_frame(&chime_start));
        // Window disarmed: no beep later.
        assert!(!detector.fallback_beep_due(now + Duration::from_millis(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_chime_plays_the_local_beep_once() {
        let hub = dev(0xf0);
        let mut detector = ChimeDetector::new(hub);
        let now = Instant::now();
        detector.on_call_notification(now);

        assert!(!detector.fallback_beep_due(now + Duration::from_millis(150)));
        assert!(detector.fallback_beep_due(now + Duration::from_millis(200)));
        // Only once.
        assert!(!detector.fallback_beep_due(now + Duration::from_millis(400)));
    }

    #[tokio::test(start_paused = true)]
    async fn other_senders_never_suppress_the_beep() {
        let hub = dev(0xf0);
        let mut detector = ChimeDetector::new(hub);
        let now = Instant::now();
        detector.on_call_notification(now);

        let other = AudioFrame::new(dev(1), 0, Priority::Normal, opus_frame());
        assert!(!detector.on_frame(&other));
        assert!(detector.fallback_beep_due(now + Duration::from_millis(250)));
    }
}
