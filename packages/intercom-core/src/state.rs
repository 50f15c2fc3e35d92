//! Core application state types.
//!
//! Provides configuration ([`Config`], [`MobileDevice`]) and the runtime
//! node registry ([`NodeRegistry`]) fed by MQTT discovery.

use std::net::{IpAddr, Ipv4Addr};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::packet::DeviceId;
use crate::protocol::{DEFAULT_MULTICAST_GROUP, DEFAULT_MULTICAST_PORT, DEFAULT_WS_PORT};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// A mobile device that receives push notifications on All-Rooms calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MobileDevice {
    pub name: String,
    /// Home Assistant notify service name (e.g. `mobile_app_pixel`).
    pub notify_service: String,
}

/// Configuration for the intercom hub.
///
/// Loaded from `/data/config.json`; MQTT credentials are required, the
/// rest has defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // MQTT broker
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_password: String,

    /// Name the hub announces itself under.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    // Audio transport
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,
    /// Host LAN interface for multicast TX/RX. Must be set explicitly in
    /// container environments where auto-detection sees the wrong netns.
    #[serde(default)]
    pub multicast_interface: Option<Ipv4Addr>,

    // TTS
    #[serde(default = "default_piper_host")]
    pub piper_host: String,
    #[serde(default = "default_piper_port")]
    pub piper_port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub mobile_devices: Vec<MobileDevice>,

    /// HTTP/WebSocket port.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// When set, API routes other than `/api/status` require it as a
    /// bearer token; when unset, `/api/status` stays unauthenticated.
    #[serde(default)]
    pub admin_password: Option<String>,

    /// Directory for persisted state (chimes, active chime name).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_device_name() -> String {
    "intercom-hub".to_string()
}
fn default_multicast_group() -> Ipv4Addr {
    DEFAULT_MULTICAST_GROUP
}
fn default_multicast_port() -> u16 {
    DEFAULT_MULTICAST_PORT
}
fn default_piper_host() -> String {
    "127.0.0.1".to_string()
}
fn default_piper_port() -> u16 {
    10200
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_ws_port() -> u16 {
    DEFAULT_WS_PORT
}
fn default_data_dir() -> String {
    "/data".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: String::new(),
            mqtt_port: default_mqtt_port(),
            mqtt_user: String::new(),
            mqtt_password: String::new(),
            device_name: default_device_name(),
            multicast_group: default_multicast_group(),
            multicast_port: DEFAULT_MULTICAST_PORT,
            multicast_interface: None,
            piper_host: default_piper_host(),
            piper_port: default_piper_port(),
            log_level: default_log_level(),
            mobile_devices: Vec::new(),
            ws_port: default_ws_port(),
            admin_password: None,
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Validates required settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.mqtt_host.is_empty() {
            return Err("mqtt_host is required".to_string());
        }
        if self.mqtt_user.is_empty() {
            return Err("mqtt_user is required".to_string());
        }
        if self.mqtt_password.is_empty() {
            return Err("mqtt_password is required".to_string());
        }
        if !self.multicast_group.is_multicast() {
            return Err(format!(
                "multicast_group {} is not a multicast address",
                self.multicast_group
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node Registry
// ─────────────────────────────────────────────────────────────────────────────

/// A satellite node discovered over MQTT.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub device_id: DeviceId,
    pub room: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Process-wide set of discovered nodes.
///
/// Eventually consistent: discovery and availability messages may lag the
/// fleet by seconds. The arbiter and router always read the latest
/// snapshot at admission/routing time.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<DeviceId, Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a node from a discovery announcement.
    pub fn upsert(&self, node: Node) {
        log::debug!(
            "[Nodes] Registered {} in room '{}' at {}",
            node.device_id,
            node.room,
            node.ip
        );
        self.nodes.insert(node.device_id, node);
    }

    /// Applies an availability transition. Unknown devices are ignored
    /// until their retained discovery message arrives.
    pub fn set_online(&self, device_id: DeviceId, online: bool) {
        if let Some(mut node) = self.nodes.get_mut(&device_id) {
            if node.online != online {
                log::info!(
                    "[Nodes] {} ({}) is now {}",
                    device_id,
                    node.room,
                    if online { "online" } else { "offline" }
                );
            }
            node.online = online;
        }
    }

    pub fn remove(&self, device_id: DeviceId) {
        self.nodes.remove(&device_id);
    }

    pub fn get(&self, device_id: DeviceId) -> Option<Node> {
        self.nodes.get(&device_id).map(|n| n.clone())
    }

    /// Online nodes whose room matches.
    pub fn in_room(&self, room: &str) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|n| n.online && n.room == room)
            .map(|n| n.clone())
            .collect()
    }

    /// All online nodes.
    pub fn online(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|n| n.online)
            .map(|n| n.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot of every known node.
    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.iter().map(|n| n.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8, room: &str, online: bool) -> Node {
        Node {
            device_id: DeviceId([n, 0, 0, 0, 0, 0, 0, 0]),
            room: room.to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, n)),
            online,
            capabilities: vec![],
        }
    }

    #[test]
    fn config_requires_mqtt_credentials() {
        let mut config = Config::default();
        assert!(config.validate().is_err());
        config.mqtt_host = "broker.local".into();
        config.mqtt_user = "hub".into();
        config.mqtt_password = "secret".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_non_multicast_group() {
        let config = Config {
            mqtt_host: "broker".into(),
            mqtt_user: "u".into(),
            mqtt_password: "p".into(),
            multicast_group: Ipv4Addr::new(192, 168, 1, 1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_parses_with_defaults() {
        let json = r#"{"mqtt_host":"b","mqtt_user":"u","mqtt_password":"p"}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.multicast_group, DEFAULT_MULTICAST_GROUP);
        assert_eq!(config.multicast_port, 5005);
        assert_eq!(config.ws_port, 8099);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn room_lookup_sees_only_online_nodes() {
        let registry = NodeRegistry::new();
        registry.upsert(node(1, "kitchen", true));
        registry.upsert(node(2, "kitchen", false));
        registry.upsert(node(3, "garage", true));
        assert_eq!(registry.in_room("kitchen").len(), 1);
        assert_eq!(registry.online().len(), 2);
    }

    #[test]
    fn availability_updates_known_nodes_only() {
        let registry = NodeRegistry::new();
        registry.upsert(node(1, "kitchen", true));
        registry.set_online(DeviceId([1, 0, 0, 0, 0, 0, 0, 0]), false);
        assert!(!registry.get(DeviceId([1, 0, 0, 0, 0, 0, 0, 0])).unwrap().online);
        // Unknown device: no panic, no insert.
        registry.set_online(DeviceId([9, 0, 0, 0, 0, 0, 0, 0]), true);
        assert_eq!(registry.len(), 1);
    }
}
