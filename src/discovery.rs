//! Tasmota discovery (`<discovery_prefix>/<MAC>/config|sensors`)
//!
//! Retained config messages create, replace and remove devices. The sensor
//! inventory is cached per MAC and folded into the device whenever either
//! message changes. Empty payload = removal.

use std::sync::Arc;

use dashmap::DashMap;

use crate::commands::Command;
use crate::component::ComponentKey;
use crate::error::{BridgeError, Result};
use crate::firmware::VariantTable;
use crate::model::{Device, DeviceModel, Metrics, ModelEvent};
use crate::payload::{DiscoveryPayload, SensorDiscoveryPayload};
use crate::topic::{DiscoveryKind, TopicCodec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Created,
    Updated {
        added: Vec<ComponentKey>,
        removed: Vec<ComponentKey>,
    },
    Removed,
    /// Sensor inventory stored for a device not seen yet
    Cached,
    /// Removal of an unknown device
    Unchanged,
}

/// What the caller must do after a discovery message was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    pub mac: String,
    pub transition: Transition,
    pub subscribe: Vec<String>,
    pub unsubscribe: Vec<String>,
    pub polls: Vec<Command>,
}

impl DiscoveryOutcome {
    fn unchanged(mac: &str, transition: Transition) -> Self {
        Self {
            mac: mac.to_string(),
            transition,
            subscribe: Vec::new(),
            unsubscribe: Vec::new(),
            polls: Vec::new(),
        }
    }
}

pub struct DiscoveryListener {
    model: Arc<DeviceModel>,
    codec: TopicCodec,
    firmware: Arc<VariantTable>,
    /// Last valid config per MAC
    configs: DashMap<String, DiscoveryPayload>,
    /// Last sensor inventory per MAC
    sensors: DashMap<String, SensorDiscoveryPayload>,
}

impl DiscoveryListener {
    pub fn new(model: Arc<DeviceModel>, codec: TopicCodec, firmware: Arc<VariantTable>) -> Self {
        Self {
            model,
            codec,
            firmware,
            configs: DashMap::new(),
            sensors: DashMap::new(),
        }
    }

    pub fn codec(&self) -> &TopicCodec {
        &self.codec
    }

    /// Both discovery topics of a device, for purging retained messages.
    pub fn discovery_topics(&self, mac: &str) -> [String; 2] {
        [
            self.codec.discovery_topic(mac, DiscoveryKind::Config),
            self.codec.discovery_topic(mac, DiscoveryKind::Sensors),
        ]
    }

    /// Apply one discovery message. Must be called from the MAC's worker.
    pub fn process(&self, topic: &str, payload: &[u8]) -> Result<DiscoveryOutcome> {
        let parsed = self.codec.decode(topic).inspect_err(|_| {
            Metrics::count(&self.model.metrics.malformed_topics);
        })?;
        let Some(kind) = parsed.discovery_kind() else {
            Metrics::count(&self.model.metrics.malformed_topics);
            return Err(BridgeError::malformed_topic(topic, "not a discovery topic"));
        };
        let mac = crate::topic::normalize_mac(&parsed.device);

        let outcome = match kind {
            DiscoveryKind::Config => self.process_config(topic, &mac, payload),
            DiscoveryKind::Sensors => self.process_sensors(topic, &mac, payload),
        };
        match &outcome {
            Ok(_) => Metrics::count(&self.model.metrics.discovery_applied),
            Err(e) => {
                Metrics::count(&self.model.metrics.malformed_payloads);
                tracing::warn!("Discovery: ignoring {}: {}", topic, e);
            }
        }
        outcome
    }

    // ── Private helpers ──────────────────────────────────

    fn process_config(&self, topic: &str, mac: &str, payload: &[u8]) -> Result<DiscoveryOutcome> {
        if is_removal(payload) {
            self.configs.remove(mac);
            return Ok(self.remove_device(mac));
        }

        let config = DiscoveryPayload::parse(topic, mac, payload)?;
        self.configs.insert(mac.to_string(), config);
        self.rebuild(mac)
    }

    fn process_sensors(&self, topic: &str, mac: &str, payload: &[u8]) -> Result<DiscoveryOutcome> {
        let removal = is_removal(payload);
        if removal {
            self.sensors.remove(mac);
        } else {
            let inventory = SensorDiscoveryPayload::parse(topic, payload)?;
            self.sensors.insert(mac.to_string(), inventory);
        }

        if !self.configs.contains_key(mac) {
            let transition = if removal {
                Transition::Unchanged
            } else {
                Transition::Cached
            };
            return Ok(DiscoveryOutcome::unchanged(mac, transition));
        }
        self.rebuild(mac)
    }

    /// Build the device from the cached messages and swap it into the model.
    fn rebuild(&self, mac: &str) -> Result<DiscoveryOutcome> {
        let Some(config) = self.configs.get(mac).map(|c| c.value().clone()) else {
            return Ok(DiscoveryOutcome::unchanged(mac, Transition::Unchanged));
        };
        let sensors = self.sensors.get(mac).map(|s| s.value().clone());
        let mut device = Device::from_discovery(&config, sensors.as_ref(), &self.firmware);

        let (transition, polls) = match self.model.device(mac) {
            Some(previous) => {
                let (added, removed) = device.carry_over(&previous);
                let polls = added_polls(&device, &added);
                (Transition::Updated { added, removed }, polls)
            }
            None => {
                let polls = device.polls();
                (Transition::Created, polls)
            }
        };

        let component_count = device.components.len();
        let name = device.name.clone();
        let delta = self.model.upsert(device);

        match &transition {
            Transition::Created => {
                tracing::info!(
                    "Discovery: {} ({}) with {} components",
                    mac,
                    name,
                    component_count
                );
                self.model.emit(ModelEvent::DeviceCreated { mac: mac.to_string() });
            }
            Transition::Updated { added, removed } => {
                tracing::debug!(
                    "Discovery: {} updated, {} added, {} removed",
                    mac,
                    added.len(),
                    removed.len()
                );
                self.model.emit(ModelEvent::DeviceUpdated {
                    mac: mac.to_string(),
                    added: added.clone(),
                    removed: removed.clone(),
                });
            }
            _ => {}
        }

        Ok(DiscoveryOutcome {
            mac: mac.to_string(),
            transition,
            subscribe: delta.subscribe,
            unsubscribe: delta.unsubscribe,
            polls,
        })
    }

    fn remove_device(&self, mac: &str) -> DiscoveryOutcome {
        let Some((device, delta)) = self.model.remove(mac) else {
            return DiscoveryOutcome::unchanged(mac, Transition::Unchanged);
        };
        tracing::info!("Discovery: {} ({}) removed", mac, device.name);
        self.model.emit(ModelEvent::DeviceRemoved { mac: mac.to_string() });

        DiscoveryOutcome {
            mac: mac.to_string(),
            transition: Transition::Removed,
            subscribe: delta.subscribe,
            unsubscribe: delta.unsubscribe,
            polls: Vec::new(),
        }
    }
}

fn added_polls(device: &Device, added: &[ComponentKey]) -> Vec<Command> {
    let mut polls: Vec<Command> = Vec::new();
    for key in added {
        let poll = device.component(key).and_then(|c| c.addressing.poll.clone());
        if let Some(poll) = poll {
            if !polls.contains(&poll) {
                polls.push(poll);
            }
        }
    }
    polls
}

/// An empty, blank or `null` payload withdraws a discovery message.
fn is_removal(payload: &[u8]) -> bool {
    matches!(std::str::from_utf8(payload).map(str::trim), Ok("" | "null"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;
    use crate::payload::fixtures::plug_config;
    use crate::topic::DEFAULT_DISCOVERY_PREFIX;
    use serde_json::{json, Value};

    const CONFIG_TOPIC: &str = "tasmota/discovery/A4CF12AB34CD/config";
    const SENSORS_TOPIC: &str = "tasmota/discovery/A4CF12AB34CD/sensors";

    fn make_listener() -> DiscoveryListener {
        DiscoveryListener::new(
            Arc::new(DeviceModel::new(64)),
            TopicCodec::new(DEFAULT_DISCOVERY_PREFIX),
            Arc::new(VariantTable::default()),
        )
    }

    fn config_bytes(overrides: Value) -> Vec<u8> {
        let mut config = plug_config();
        if let (Value::Object(base), Value::Object(extra)) = (&mut config, overrides) {
            for (k, v) in extra {
                base.insert(k, v);
            }
        }
        serde_json::to_vec(&config).unwrap()
    }

    fn sensor_bytes() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "sn": {"Time": "2024-01-01T00:00:00", "AM2301": {"Temperature": 21.5, "Humidity": 40}, "TempUnit": "C"},
            "ver": 1
        }))
        .unwrap()
    }

    #[test]
    fn test_create_device() {
        let listener = make_listener();
        let mut rx = listener.model.subscribe();

        let outcome = listener.process(CONFIG_TOPIC, &config_bytes(json!({}))).unwrap();
        assert_eq!(outcome.transition, Transition::Created);
        assert!(outcome.subscribe.contains(&"tele/kitchen/LWT".to_string()));
        assert!(outcome
            .polls
            .contains(&Command::new("cmnd/kitchen/STATUS".into(), "2")));

        assert_eq!(listener.model.device_count(), 1);
        assert!(matches!(rx.try_recv(), Ok(ModelEvent::DeviceCreated { .. })));
    }

    #[test]
    fn test_update_keeps_state_of_unchanged_components() {
        let listener = make_listener();
        listener
            .process(CONFIG_TOPIC, &config_bytes(json!({"rl": [1, 1, 0, 0]})))
            .unwrap();
        let key = ComponentKey::slot(ComponentKind::Relay, 1);
        listener.model.update("A4CF12AB34CD", |d| {
            d.component_mut(&key).unwrap().state.value =
                crate::component::StateValue::Relay { power: Some(true) };
        });

        let outcome = listener
            .process(CONFIG_TOPIC, &config_bytes(json!({"rl": [1, 1, 1, 0]})))
            .unwrap();
        assert_eq!(
            outcome.transition,
            Transition::Updated {
                added: vec![ComponentKey::slot(ComponentKind::Relay, 3)],
                removed: vec![],
            }
        );
        assert_eq!(outcome.subscribe, vec!["stat/kitchen/POWER3".to_string()]);

        let device = listener.model.device("A4CF12AB34CD").unwrap();
        assert_eq!(
            device.component(&key).unwrap().state.value,
            crate::component::StateValue::Relay { power: Some(true) }
        );
    }

    #[test]
    fn test_remove_device() {
        let listener = make_listener();
        listener.process(CONFIG_TOPIC, &config_bytes(json!({}))).unwrap();

        let outcome = listener.process(CONFIG_TOPIC, b"").unwrap();
        assert_eq!(outcome.transition, Transition::Removed);
        assert!(outcome.unsubscribe.contains(&"stat/kitchen/RESULT".to_string()));
        assert_eq!(listener.model.device_count(), 0);

        // removing again is a no-op
        let outcome = listener.process(CONFIG_TOPIC, b"").unwrap();
        assert_eq!(outcome.transition, Transition::Unchanged);
    }

    #[test]
    fn test_null_or_blank_payload_removes_device() {
        for payload in [&b"null"[..], &b"  "[..], &b" null\n"[..]] {
            let listener = make_listener();
            listener.process(CONFIG_TOPIC, &config_bytes(json!({}))).unwrap();
            listener.process(SENSORS_TOPIC, &sensor_bytes()).unwrap();

            let outcome = listener.process(SENSORS_TOPIC, payload).unwrap();
            assert!(matches!(outcome.transition, Transition::Updated { .. }));

            let outcome = listener.process(CONFIG_TOPIC, payload).unwrap();
            assert_eq!(outcome.transition, Transition::Removed);
            assert_eq!(listener.model.device_count(), 0);
            assert_eq!(Metrics::get(&listener.model.metrics.malformed_payloads), 0);
        }
    }

    #[test]
    fn test_malformed_payload_ignored() {
        let listener = make_listener();
        listener.process(CONFIG_TOPIC, &config_bytes(json!({}))).unwrap();

        assert!(listener.process(CONFIG_TOPIC, b"{not json").is_err());
        assert!(listener
            .process(CONFIG_TOPIC, &config_bytes(json!({"mac": "000000000000"})))
            .is_err());
        assert!(listener.process(CONFIG_TOPIC, &config_bytes(json!({"ver": 2}))).is_err());

        assert_eq!(listener.model.device_count(), 1);
        assert_eq!(Metrics::get(&listener.model.metrics.malformed_payloads), 3);
    }

    #[test]
    fn test_malformed_topic() {
        let listener = make_listener();
        let err = listener
            .process("tasmota/discovery/nope/config", &config_bytes(json!({})))
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedTopic { .. }));
        assert_eq!(Metrics::get(&listener.model.metrics.malformed_topics), 1);
    }

    #[test]
    fn test_sensors_before_and_after_config() {
        let listener = make_listener();
        let outcome = listener.process(SENSORS_TOPIC, &sensor_bytes()).unwrap();
        assert_eq!(outcome.transition, Transition::Cached);
        assert_eq!(listener.model.device_count(), 0);

        listener.process(CONFIG_TOPIC, &config_bytes(json!({}))).unwrap();
        let sensor = ComponentKey::named(ComponentKind::Sensor, "AM2301");
        let device = listener.model.device("A4CF12AB34CD").unwrap();
        assert!(device.component(&sensor).is_some());
        assert!(device
            .component(&ComponentKey::named(ComponentKind::Sensor, "Time"))
            .is_none());

        let outcome = listener.process(SENSORS_TOPIC, b"").unwrap();
        assert_eq!(
            outcome.transition,
            Transition::Updated {
                added: vec![],
                removed: vec![sensor.clone()],
            }
        );
        assert!(outcome.unsubscribe.contains(&"tele/kitchen/SENSOR".to_string()));
        let device = listener.model.device("A4CF12AB34CD").unwrap();
        assert!(device.component(&sensor).is_none());
    }

    #[test]
    fn test_discovery_topics() {
        let listener = make_listener();
        assert_eq!(
            listener.discovery_topics("A4CF12AB34CD"),
            [CONFIG_TOPIC.to_string(), SENSORS_TOPIC.to_string()]
        );
    }
}
