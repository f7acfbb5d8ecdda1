//! Bridge configuration: an optional YAML file, then `TASMOTA_*` env vars.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::firmware::VariantTable;
use crate::topic::DEFAULT_DISCOVERY_PREFIX;

pub const DEFAULT_CONFIG_PATH: &str = "tasmota-bridge.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "tasmota-bridge".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Time allowed between the upgrade command (or the last progress
    /// report) and the next signal from the device
    pub timeout_secs: u64,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub debounce_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { debounce_ms: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub discovery_prefix: String,
    /// Capacity of the model event channel
    pub event_capacity: usize,
    pub upgrade: UpgradeConfig,
    pub poll: PollConfig,
    pub firmware: VariantTable,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            discovery_prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
            event_capacity: 4096,
            upgrade: UpgradeConfig::default(),
            poll: PollConfig::default(),
            firmware: VariantTable::default(),
        }
    }
}

impl BridgeConfig {
    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade.timeout_secs)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.poll.debounce_ms)
    }

    /// Apply `TASMOTA_*` overrides. `lookup` is `std::env::var` in the binary.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(host) = lookup("TASMOTA_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("TASMOTA_MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .with_context(|| format!("TASMOTA_MQTT_PORT: invalid port '{}'", port))?;
        }
        if let Some(username) = lookup("TASMOTA_MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("TASMOTA_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(prefix) = lookup("TASMOTA_DISCOVERY_PREFIX") {
            self.discovery_prefix = prefix;
        }
        if let Some(secs) = lookup("TASMOTA_UPGRADE_TIMEOUT_SECS") {
            self.upgrade.timeout_secs = secs
                .parse()
                .with_context(|| format!("TASMOTA_UPGRADE_TIMEOUT_SECS: invalid value '{}'", secs))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.event_capacity > 0, "event_capacity must be at least 1");
        anyhow::ensure!(self.upgrade.timeout_secs > 0, "upgrade.timeout_secs must be at least 1");
        Ok(())
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<BridgeConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: BridgeConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid {}", path.display()))?;
    Ok(config)
}

/// Config for the binary: `TASMOTA_BRIDGE_CONFIG` or `tasmota-bridge.yaml`
/// when present, defaults otherwise, then env overrides.
pub fn from_env() -> anyhow::Result<BridgeConfig> {
    let explicit = std::env::var("TASMOTA_BRIDGE_CONFIG").ok().map(PathBuf::from);
    let mut config = match explicit {
        Some(path) => load_config(&path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => load_config(Path::new(DEFAULT_CONFIG_PATH))?,
        None => BridgeConfig::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}
