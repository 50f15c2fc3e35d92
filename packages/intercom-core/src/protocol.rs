//! Fixed protocol constants that should NOT be changed.
//!
//! These values are pinned by the wire protocol shared with the embedded
//! nodes and by the Opus configuration both ends decode against. Changing
//! them breaks interoperability with deployed firmware.

use std::net::Ipv4Addr;

// ─────────────────────────────────────────────────────────────────────────────
// Audio Parameters (bit-exact across hub, nodes, and web clients)
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rate for every PCM surface (Hz). Opus wideband.
pub const SAMPLE_RATE: u32 = 16_000;

/// Channel count. The intercom is mono end to end.
pub const CHANNELS: u16 = 1;

/// Frame duration (ms). Every Opus frame and every I2S write is one frame.
pub const FRAME_DURATION_MS: u32 = 20;

/// Samples per frame: 16 kHz x 20 ms.
pub const FRAME_SAMPLES: usize = 320;

/// Bytes per PCM frame (16-bit samples).
pub const FRAME_PCM_BYTES: usize = FRAME_SAMPLES * 2;

/// Opus encoder bitrate (bits/s). VBR target.
pub const OPUS_BITRATE: i32 = 32_000;

/// Opus encoder complexity (0-10).
pub const OPUS_COMPLEXITY: i32 = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Protocol (UDP audio)
// ─────────────────────────────────────────────────────────────────────────────

/// Packet header: 8B device id + 4B sequence (big-endian) + 1B priority.
pub const PACKET_HEADER_LEN: usize = 13;

/// Hard cap on a UDP audio packet. Parse must tolerate any length up to this.
pub const MAX_PACKET_SIZE: usize = 256;

/// Largest Opus payload that fits under [`MAX_PACKET_SIZE`].
pub const MAX_OPUS_PAYLOAD: usize = MAX_PACKET_SIZE - PACKET_HEADER_LEN;

/// Organization-local multicast group the fleet listens on.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 100);

/// UDP port for both multicast and unicast audio.
pub const DEFAULT_MULTICAST_PORT: u16 = 5005;

/// Multicast TTL. The intercom never crosses a router.
pub const MULTICAST_TTL: u32 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Channel Arbitration
// ─────────────────────────────────────────────────────────────────────────────

/// Silence window after which the arbiter reclaims the channel (ms).
/// Resets on every received frame.
pub const IDLE_RECLAIM_MS: u64 = 500;

/// Tick interval of the reclaim task (ms).
pub const RECLAIM_TICK_MS: u64 = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Web PTT Server
// ─────────────────────────────────────────────────────────────────────────────

/// Default port of the HTTP + WebSocket surface.
pub const DEFAULT_WS_PORT: u16 = 8099;

/// Protocol identifier sent in the server hello.
pub const WS_PROTOCOL: &str = "intercom/1";

/// Per-client outbound queue depth. A slow browser drops frames here
/// instead of back-pressuring the router.
pub const WS_CLIENT_QUEUE: usize = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Chime Store
// ─────────────────────────────────────────────────────────────────────────────

/// Upload size cap for chime WAVs (bytes).
pub const MAX_CHIME_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// The one chime that always exists and cannot be deleted.
pub const RESERVED_CHIME: &str = "doorbell";

// ─────────────────────────────────────────────────────────────────────────────
// Diagnostics
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of the audio capture ring (frames). ~40 s at 20 ms/frame.
pub const CAPTURE_BUFFER_FRAMES: usize = 2000;

// ─────────────────────────────────────────────────────────────────────────────
// Node Audio Plane
// ─────────────────────────────────────────────────────────────────────────────

/// Depth of the node-side receive queue. Overflow drops the oldest frame.
pub const NODE_RX_QUEUE_DEPTH: usize = 15;

/// Bounded I2S write timeout (ms). One frame; exceeding counts a stall.
pub const I2S_WRITE_TIMEOUT_MS: u64 = 20;

/// DMA descriptors pre-filled before playback starts (~40 ms latency).
pub const NODE_PREFILL_FRAMES: usize = 2;

/// How long a node waits for chime frames after a call notification
/// before it plays the local fallback beep (ms).
pub const CHIME_FALLBACK_TIMEOUT_MS: u64 = 200;

// ─────────────────────────────────────────────────────────────────────────────
// Control Plane (MQTT)
// ─────────────────────────────────────────────────────────────────────────────

/// Topic prefix for all intercom traffic.
pub const MQTT_PREFIX: &str = "intercom";

/// Retained node announcements: `intercom/discovery/<device_id>`.
pub const TOPIC_DISCOVERY: &str = "intercom/discovery";

/// Retained online/offline with LWT: `intercom/availability/<device_id>`.
pub const TOPIC_AVAILABILITY: &str = "intercom/availability";

/// Call notifications.
pub const TOPIC_CALL: &str = "intercom/call";

/// Home Assistant discovery prefix.
pub const HA_DISCOVERY_PREFIX: &str = "homeassistant";

/// Capacity of the arbiter event broadcast channel.
pub const ARBITER_EVENT_CAPACITY: usize = 64;

/// Longest a room name may be (bytes).
pub const MAX_ROOM_LEN: usize = 31;
