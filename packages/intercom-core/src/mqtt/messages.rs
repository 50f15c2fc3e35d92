//! Control-plane message types.
//!
//! Incoming MQTT payloads parse into the tagged [`ControlMessage`] variant
//! for their topic; unknown topics and malformed payloads are logged and
//! ignored, never crashed on. Outgoing publishes travel through
//! [`MqttPublish`] so producers (router, web server) stay decoupled from
//! the MQTT client itself.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::packet::{DeviceId, Priority};
use crate::protocol::{TOPIC_AVAILABILITY, TOPIC_CALL, TOPIC_DISCOVERY};
use crate::state::Node;

/// An outgoing MQTT publish, queued toward the control-plane task.
///
/// Publishing is fire-and-forget: failure is logged by the MQTT loop and
/// never propagated to the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttPublish {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl MqttPublish {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }
}

/// Retained node announcement on `intercom/discovery/<device_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryAnnouncement {
    pub device_id: DeviceId,
    pub room: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Call notification on `intercom/call`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallNotification {
    pub from: String,
    pub to_room: String,
    pub priority: Priority,
    /// Active chime name streamed ahead of the call.
    pub chime: String,
    /// `"hub"` for hub-originated messages; dropped on receipt to prevent
    /// self-echo.
    pub source: String,
}

impl CallNotification {
    pub fn is_hub_echo(&self) -> bool {
        self.source == "hub"
    }
}

/// Parsed incoming control-plane message.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    Discovery(Node),
    Availability { device_id: DeviceId, online: bool },
    Call(CallNotification),
}

impl ControlMessage {
    /// Parses a topic + payload pair into a known message type.
    ///
    /// Returns `None` for unknown topics, unparseable device ids, and
    /// malformed payloads; callers log and move on.
    pub fn parse(topic: &str, payload: &[u8]) -> Option<Self> {
        if let Some(id) = topic.strip_prefix(TOPIC_DISCOVERY).and_then(strip_slash) {
            let device_id = DeviceId::parse_hex(id)?;
            // An empty retained payload clears the announcement.
            if payload.is_empty() {
                return None;
            }
            let ann: DiscoveryAnnouncement = serde_json::from_slice(payload).ok()?;
            if ann.device_id != device_id {
                log::warn!(
                    "[Control] Discovery topic id {} != payload id {}",
                    device_id,
                    ann.device_id
                );
                return None;
            }
            return Some(Self::Discovery(Node {
                device_id: ann.device_id,
                room: ann.room.to_ascii_lowercase(),
                ip: ann.ip,
                online: true,
                capabilities: ann.capabilities,
            }));
        }

        if let Some(id) = topic.strip_prefix(TOPIC_AVAILABILITY).and_then(strip_slash) {
            let device_id = DeviceId::parse_hex(id)?;
            let online = match payload {
                b"online" => true,
                b"offline" => false,
                other => {
                    log::warn!(
                        "[Control] Unknown availability payload: {:?}",
                        String::from_utf8_lossy(other)
                    );
                    return None;
                }
            };
            return Some(Self::Availability { device_id, online });
        }

        if topic == TOPIC_CALL {
            let call: CallNotification = serde_json::from_slice(payload).ok()?;
            return Some(Self::Call(call));
        }

        None
    }
}

fn strip_slash(s: &str) -> Option<&str> {
    s.strip_prefix('/')
}
