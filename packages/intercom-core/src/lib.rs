//! Intercom Core - the LAN push-to-talk intercom hub.
//!
//! This crate provides the real-time audio routing core of the hub
//! together with the node-side audio plane it must interoperate with
//! bit-exactly: Opus frames arrive from embedded nodes over multicast
//! UDP, browser PTT over WebSocket, and synthesized speech over TCP; a
//! single-speaker channel arbiter admits one of them with priority
//! preemption and do-not-disturb; the router fans the stream back out to
//! the same three sink families, streaming a chime prelude with
//! wall-clock pacing in front of every call notification.
//!
//! # Architecture
//!
//! - [`codec`]: Opus encode/decode at 16 kHz mono, 20 ms frames
//! - [`packet`]: the 13-byte header wire framing
//! - [`transport`]: multicast/unicast UDP with loop suppression
//! - [`stats`]: per-sender sequence accounting and hub TX counters
//! - [`chime`]: the on-disk WAV library pre-encoded at startup
//! - [`arbiter`]: the single-speaker channel state machine
//! - [`router`]: speaker-to-sinks fan-out
//! - [`clients`]: the web PTT client arena
//! - [`api`]: HTTP diagnostics surface and the WebSocket PTT endpoint
//! - [`mqtt`]: discovery, availability, calls, HA advertisement
//! - [`tts`]: queued synthesis injected as a synthetic speaker
//! - [`capture`]: the diagnostic frame ring
//! - [`node`]: the embedded-side receive/play contract
//! - [`bootstrap`]: the composition root
//! - [`error`]: centralized error types

#![warn(clippy::all)]

pub mod api;
pub mod arbiter;
pub mod bootstrap;
pub mod capture;
pub mod chime;
pub mod clients;
pub mod codec;
pub mod error;
pub mod mqtt;
pub mod node;
pub mod packet;
pub mod protocol;
pub mod router;
pub mod schedule;
pub mod state;
pub mod stats;
pub mod transport;
pub mod tts;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError};
pub use arbiter::{ArbiterEvent, ChannelArbiter, Origin, RoomTarget, Speaker};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use capture::{AudioCaptureBuffer, CaptureFilter, Direction};
pub use chime::{Chime, ChimeStore};
pub use clients::{WebClientRegistry, WsClientState};
pub use codec::{AudioDecoder, AudioEncoder};
pub use error::{ErrorCode, IntercomError, IntercomResult};
pub use packet::{AudioFrame, DeviceId, Priority};
pub use router::SessionRouter;
pub use state::{Config, MobileDevice, Node, NodeRegistry};
pub use stats::SequenceTracker;
pub use tts::TtsBridge;
pub use utils::now_millis;
