//! Channel arbiter: the state machine that owns "who is speaking".
//!
//! First-to-talk with priority preemption. A single mutex guards the
//! channel state and totally orders admit/end events; a relaxed atomic
//! mirrors the busy bit so `is_channel_busy()`-style predicates can read
//! without the lock. Do-not-disturb blocks Normal and High regardless of
//! channel state; Emergency bypasses it.
//!
//! Admission, preemption, and release are announced on a broadcast
//! channel. The router drops frames from preempted senders and emits
//! trail-out silence on release; the web PTT server turns the same events
//! into client state pushes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{IntercomError, IntercomResult};
use crate::packet::{DeviceId, Priority};
use crate::protocol::{ARBITER_EVENT_CAPACITY, IDLE_RECLAIM_MS};

// ─────────────────────────────────────────────────────────────────────────────
// Speaker Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Where an admitted stream comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A satellite node, identified by its hardware device id.
    EmbeddedNode(DeviceId),
    /// A browser client, packetized under a hub-owned device id.
    WebClient { client_id: String, device: DeviceId },
    /// Synthesized speech injected by the TTS bridge.
    Tts { device: DeviceId },
    /// A chime prelude streamed by the hub itself.
    Chime { device: DeviceId },
}

impl Origin {
    /// The device id this origin's frames carry on the wire.
    pub fn device(&self) -> DeviceId {
        match self {
            Self::EmbeddedNode(d) => *d,
            Self::WebClient { device, .. } => *device,
            Self::Tts { device } => *device,
            Self::Chime { device } => *device,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmbeddedNode(d) => write!(f, "node {}", d),
            Self::WebClient { client_id, .. } => write!(f, "web client {}", client_id),
            Self::Tts { .. } => write!(f, "tts"),
            Self::Chime { .. } => write!(f, "chime"),
        }
    }
}

/// Routing destination of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomTarget {
    /// Every room: multicast plus all web clients.
    All,
    /// A single room by name.
    Room(String),
}

impl RoomTarget {
    /// Parses a target string. "all" and "all rooms" (any case) mean
    /// every room; anything else is a room name, lowercased.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("all") || trimmed.eq_ignore_ascii_case("all rooms") {
            Self::All
        } else {
            Self::Room(trimmed.to_ascii_lowercase())
        }
    }
}

impl fmt::Display for RoomTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Room(r) => write!(f, "{}", r),
        }
    }
}

/// An admitted source of frames.
#[derive(Debug, Clone)]
pub struct Speaker {
    pub origin: Origin,
    pub priority: Priority,
    pub target: RoomTarget,
    pub started_at: Instant,
    pub last_frame_at: Instant,
}

/// Channel state guarded by the arbiter's mutex.
#[derive(Debug)]
enum ChannelState {
    Idle,
    Busy(Speaker),
}

/// Why a speaker left the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Explicit end-of-stream.
    Explicit,
    /// 500 ms without a frame.
    Timeout,
    /// A higher-priority admission took the channel.
    Preempted,
    /// Hub shutdown.
    Shutdown,
}

/// Arbiter lifecycle events, broadcast to the router and the web server.
#[derive(Debug, Clone)]
pub enum ArbiterEvent {
    Admitted {
        origin: Origin,
        priority: Priority,
        target: RoomTarget,
    },
    Released {
        origin: Origin,
        priority: Priority,
        target: RoomTarget,
        reason: ReleaseReason,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Arbiter
// ─────────────────────────────────────────────────────────────────────────────

/// The single-speaker channel arbiter.
pub struct ChannelArbiter {
    state: Mutex<ChannelState>,
    /// Lock-free mirror of the Busy bit for snapshot predicates.
    busy: AtomicBool,
    dnd: AtomicBool,
    events: broadcast::Sender<ArbiterEvent>,
    reclaim_after: Duration,
}

impl Default for ChannelArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelArbiter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(ARBITER_EVENT_CAPACITY);
        Self {
            state: Mutex::new(ChannelState::Idle),
            busy: AtomicBool::new(false),
            dnd: AtomicBool::new(false),
            events,
            reclaim_after: Duration::from_millis(IDLE_RECLAIM_MS),
        }
    }

    /// Subscribes to admission/release events.
    pub fn subscribe(&self) -> broadcast::Receiver<ArbiterEvent> {
        self.events.subscribe()
    }

    /// Requests the channel for a new speaker.
    ///
    /// Idle admits. Busy admits only strictly higher priority, releasing
    /// the preempted speaker (which is notified through the event stream
    /// and must stop sending). DND rejects everything below Emergency
    /// regardless of channel state. Concurrent same-priority requests on
    /// Idle tie-break by lock order: first in wins.
    pub fn try_admit(
        &self,
        origin: Origin,
        priority: Priority,
        target: RoomTarget,
        now: Instant,
    ) -> IntercomResult<()> {
        if self.dnd.load(Ordering::Relaxed) && priority != Priority::Emergency {
            log::debug!("[Arbiter] DND rejected {} ({})", origin, priority.name());
            return Err(IntercomError::ArbiterDnd);
        }

        let mut state = self.state.lock();
        match &*state {
            ChannelState::Idle => {}
            ChannelState::Busy(current) => {
                if priority <= current.priority {
                    log::debug!(
                        "[Arbiter] Rejected {} ({}): channel held by {} ({})",
                        origin,
                        priority.name(),
                        current.origin,
                        current.priority.name()
                    );
                    return Err(IntercomError::ArbiterBusy(current.origin.to_string()));
                }
                log::info!(
                    "[Arbiter] {} ({}) preempts {} ({})",
                    origin,
                    priority.name(),
                    current.origin,
                    current.priority.name()
                );
                let _ = self.events.send(ArbiterEvent::Released {
                    origin: current.origin.clone(),
                    priority: current.priority,
                    target: current.target.clone(),
                    reason: ReleaseReason::Preempted,
                });
            }
        }

        log::info!(
            "[Arbiter] Admitted {} ({}) -> {}",
            origin,
            priority.name(),
            target
        );
        let speaker = Speaker {
            origin: origin.clone(),
            priority,
            target: target.clone(),
            started_at: now,
            last_frame_at: now,
        };
        *state = ChannelState::Busy(speaker);
        self.busy.store(true, Ordering::Relaxed);
        let _ = self.events.send(ArbiterEvent::Admitted {
            origin,
            priority,
            target,
        });
        Ok(())
    }

    /// Refreshes the active speaker's last-frame timestamp.
    ///
    /// Returns true when `device` is the active speaker; frames from any
    /// other device must be dropped by the caller.
    pub fn heartbeat(&self, device: DeviceId, now: Instant) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            ChannelState::Busy(speaker) if speaker.origin.device() == device => {
                speaker.last_frame_at = now;
                true
            }
            _ => false,
        }
    }

    /// Explicit release. Returns the outgoing speaker for trail-out.
    pub fn end(&self, device: DeviceId) -> Option<Speaker> {
        self.release_if(ReleaseReason::Explicit, |s| s.origin.device() == device)
    }

    /// Reclaims the channel after the idle window. Returns the reclaimed
    /// speaker for trail-out, or None when nothing timed out.
    pub fn reclaim_idle(&self, now: Instant) -> Option<Speaker> {
        let window = self.reclaim_after;
        self.release_if(ReleaseReason::Timeout, |s| {
            now.duration_since(s.last_frame_at) >= window
        })
    }

    /// Releases unconditionally at shutdown.
    pub fn release_for_shutdown(&self) -> Option<Speaker> {
        self.release_if(ReleaseReason::Shutdown, |_| true)
    }

    fn release_if(
        &self,
        reason: ReleaseReason,
        predicate: impl FnOnce(&Speaker) -> bool,
    ) -> Option<Speaker> {
        let mut state = self.state.lock();
        let ChannelState::Busy(speaker) = &*state else {
            return None;
        };
        if !predicate(speaker) {
            return None;
        }
        let speaker = speaker.clone();
        *state = ChannelState::Idle;
        self.busy.store(false, Ordering::Relaxed);
        log::info!(
            "[Arbiter] Released {} ({:?})",
            speaker.origin,
            reason
        );
        let _ = self.events.send(ArbiterEvent::Released {
            origin: speaker.origin.clone(),
            priority: speaker.priority,
            target: speaker.target.clone(),
            reason,
        });
        Some(speaker)
    }

    /// Lock-free Busy snapshot. Advisory only: admission still serializes
    /// through `try_admit`.
    pub fn channel_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    /// Snapshot of the active speaker, if any.
    pub fn active(&self) -> Option<(Origin, Priority, RoomTarget)> {
        match &*self.state.lock() {
            ChannelState::Busy(s) => Some((s.origin.clone(), s.priority, s.target.clone())),
            ChannelState::Idle => None,
        }
    }

    pub fn set_dnd(&self, on: bool) {
        log::info!("[Arbiter] DND {}", if on { "on" } else { "off" });
        self.dnd.store(on, Ordering::Relaxed);
    }

    pub fn dnd(&self) -> bool {
        self.dnd.load(Ordering::Relaxed)
    }
}
