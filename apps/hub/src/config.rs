//! Hub configuration.
//!
//! Loads `/data/config.json` (the add-on's persisted layout) and applies
//! environment variable overrides on top.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use intercom_core::Config;

/// Loads configuration from a JSON file, then applies environment overrides.
///
/// A missing file yields the defaults so `--mqtt-*` environment overrides
/// alone can bring the hub up.
pub fn load(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        log::warn!(
            "Config file {} not found, starting from defaults",
            path.display()
        );
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Applies `INTERCOM_*` environment overrides to the configuration.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("INTERCOM_MQTT_HOST") {
        config.mqtt_host = val;
    }
    if let Ok(val) = std::env::var("INTERCOM_MQTT_PORT") {
        if let Ok(port) = val.parse() {
            config.mqtt_port = port;
        }
    }
    if let Ok(val) = std::env::var("INTERCOM_MQTT_USER") {
        config.mqtt_user = val;
    }
    if let Ok(val) = std::env::var("INTERCOM_MQTT_PASSWORD") {
        config.mqtt_password = val;
    }
    if let Ok(val) = std::env::var("INTERCOM_MULTICAST_INTERFACE") {
        if let Ok(iface) = val.parse::<Ipv4Addr>() {
            config.multicast_interface = Some(iface);
        }
    }
    if let Ok(val) = std::env::var("INTERCOM_WS_PORT") {
        if let Ok(port) = val.parse() {
            config.ws_port = port;
        }
    }
}
