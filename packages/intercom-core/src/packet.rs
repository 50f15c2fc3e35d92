//! Audio packet framing: the 13-byte header plus Opus payload.
//!
//! Wire layout (big-endian where multi-byte):
//!
//! ```text
//! 0        8            12        13
//! | device | sequence   | priority | opus payload ... |
//! |  8 B   | u32 BE 4 B |   u8     | 0..=243 B        |
//! ```
//!
//! There is no checksum; UDP's is relied upon. Unknown priority bytes are
//! clamped to Normal and reported so the receive path can count them -
//! a frame is never dropped for an unrecognized priority.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{IntercomError, IntercomResult};
use crate::protocol::{MAX_PACKET_SIZE, PACKET_HEADER_LEN};

// ─────────────────────────────────────────────────────────────────────────────
// Device Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque 8-byte device identifier, printable as hex.
///
/// Nodes derive theirs from the hardware MAC at manufacture; the hub mints
/// ids for web clients and synthetic speakers under its own prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub [u8; 8]);

impl DeviceId {
    /// Builds a node id from a 6-byte MAC, zero-padded to 8 bytes.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut id = [0u8; 8];
        id[..6].copy_from_slice(&mac);
        Self(id)
    }

    /// Parses the 16-hex-digit form produced by `Display`.
    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut id = [0u8; 8];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(id))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 16 hex digits"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Priority
// ─────────────────────────────────────────────────────────────────────────────

/// Speaker priority. `Ord` so preemption is a plain `incoming > current`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    /// Default push-to-talk.
    #[default]
    Normal = 0,
    /// Preempts Normal.
    High = 1,
    /// Preempts everything, overrides mute, bypasses do-not-disturb.
    Emergency = 2,
}

impl Priority {
    /// Decodes a wire byte. Unknown values clamp to Normal; the second
    /// tuple element is true when a clamp happened so the caller can count.
    pub fn from_wire(byte: u8) -> (Self, bool) {
        match byte {
            0 => (Self::Normal, false),
            1 => (Self::High, false),
            2 => (Self::Emergency, false),
            _ => (Self::Normal, true),
        }
    }

    /// Parses the lowercase name used in JSON payloads.
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "emergency" => Some(Self::Emergency),
            _ => None,
        }
    }

    /// Lowercase name used in JSON payloads.
    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Emergency => "emergency",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Audio Frame
// ─────────────────────────────────────────────────────────────────────────────

/// One framed audio packet: header fields plus the Opus payload.
///
/// An empty payload is meaningful: it marks packet loss to the decoder
/// (PLC) and is also how trail-out silence is signalled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub device: DeviceId,
    pub seq: u32,
    pub priority: Priority,
    pub payload: Bytes,
}

/// Parse result: the frame plus whether the priority byte was clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    pub frame: AudioFrame,
    pub priority_clamped: bool,
}

impl AudioFrame {
    pub fn new(device: DeviceId, seq: u32, priority: Priority, payload: Bytes) -> Self {
        Self {
            device,
            seq,
            priority,
            payload,
        }
    }

    /// A payload-less frame at the given priority (trail-out / PLC marker).
    pub fn silence(device: DeviceId, seq: u32, priority: Priority) -> Self {
        Self::new(device, seq, priority, Bytes::new())
    }

    /// Serializes into the 13-byte header + payload wire form.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + self.payload.len());
        buf.put_slice(&self.device.0);
        buf.put_u32(self.seq);
        buf.put_u8(self.priority as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a received datagram.
    ///
    /// Rejects anything shorter than the header or longer than
    /// [`MAX_PACKET_SIZE`] with `MalformedPacket`. Any payload length in
    /// between is accepted, including zero.
    pub fn parse(buf: &[u8]) -> IntercomResult<ParsedPacket> {
        if buf.len() < PACKET_HEADER_LEN {
            return Err(IntercomError::MalformedPacket(format!(
                "{} bytes, need at least {}",
                buf.len(),
                PACKET_HEADER_LEN
            )));
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(IntercomError::MalformedPacket(format!(
                "{} bytes exceeds cap of {}",
                buf.len(),
                MAX_PACKET_SIZE
            )));
        }

        let mut device = [0u8; 8];
        device.copy_from_slice(&buf[..8]);
        let seq = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let (priority, priority_clamped) = Priority::from_wire(buf[12]);

        Ok(ParsedPacket {
            frame: AudioFrame {
                device: DeviceId(device),
                seq,
                priority,
                payload: Bytes::copy_from_slice(&buf[PACKET_HEADER_LEN..]),
            },
            priority_clamped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_OPUS_PAYLOAD;

    fn test_device() -> DeviceId {
        DeviceId([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x01, 0x02])
    }

    #[test]
    fn round_trips_through_the_wire_form() {
        let frame = AudioFrame::new(
            test_device(),
            0xdead_beef,
            Priority::High,
            Bytes::from_static(&[0x78, 0x01, 0x02, 0x03]),
        );
        let parsed = AudioFrame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.frame, frame);
        assert!(!parsed.priority_clamped);
    }

    #[test]
    fn round_trips_an_empty_payload() {
        let frame = AudioFrame::silence(test_device(), 7, Priority::Normal);
        let wire = frame.serialize();
        assert_eq!(wire.len(), PACKET_HEADER_LEN);
        assert_eq!(AudioFrame::parse(&wire).unwrap().frame, frame);
    }

    #[test]
    fn sequence_is_big_endian_on_the_wire() {
        let frame = AudioFrame::silence(test_device(), 0x0102_0304, Priority::Normal);
        let wire = frame.serialize();
        assert_eq!(&wire[8..12], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn rejects_short_and_oversized_packets() {
        assert!(AudioFrame::parse(&[0u8; PACKET_HEADER_LEN - 1]).is_err());
        assert!(AudioFrame::parse(&[0u8; MAX_PACKET_SIZE + 1]).is_err());
        // Exactly at both bounds is fine.
        assert!(AudioFrame::parse(&[0u8; PACKET_HEADER_LEN]).is_ok());
        assert!(AudioFrame::parse(&[0u8; MAX_PACKET_SIZE]).is_ok());
    }

    #[test]
    fn unknown_priority_clamps_to_normal_without_dropping() {
        let mut wire = AudioFrame::new(
            test_device(),
            1,
            Priority::Normal,
            Bytes::from_static(&[1, 2, 3]),
        )
        .serialize()
        .to_vec();
        wire[12] = 0x7f;
        let parsed = AudioFrame::parse(&wire).unwrap();
        assert_eq!(parsed.frame.priority, Priority::Normal);
        assert!(parsed.priority_clamped);
        assert_eq!(parsed.frame.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn max_payload_fits_exactly() {
        let frame = AudioFrame::new(
            test_device(),
            1,
            Priority::Emergency,
            Bytes::from(vec![0u8; MAX_OPUS_PAYLOAD]),
        );
        assert_eq!(frame.serialize().len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn device_id_hex_round_trip() {
        let id = test_device();
        assert_eq!(id.to_string(), "aabbccddeeff0102");
        assert_eq!(DeviceId::parse_hex("aabbccddeeff0102"), Some(id));
        assert_eq!(DeviceId::parse_hex("aabbcc"), None);
        assert_eq!(DeviceId::parse_hex("zzbbccddeeff0102"), None);
    }

    #[test]
    fn priority_orders_for_preemption() {
        assert!(Priority::Emergency > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert_eq!(Priority::parse_name("emergency"), Some(Priority::Emergency));
        assert_eq!(Priority::parse_name("loud"), None);
    }
}
