//! Device model
//!
//! Devices are immutable snapshots in a `DashMap` keyed by MAC. The routing
//! table maps each state topic to the components it feeds, and every change
//! is broadcast as a [`ModelEvent`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::commands::Command;
use crate::component::{Component, ComponentIndex, ComponentKey, ComponentKind, StateTexts, TriggerEvent};
use crate::entities::build_components;
use crate::firmware::{FirmwareStatus, UpdateVerdict, VariantTable};
use crate::payload::{DiscoveryPayload, SensorDiscoveryPayload};
use crate::topic::{DeviceAddressing, FullTopic, Prefixes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Online,
    Offline,
    Unknown,
}

/// One Tasmota device, keyed by MAC. Stored as an immutable snapshot;
/// every change goes through [`DeviceModel`] and produces a new one.
#[derive(Debug, Clone)]
pub struct Device {
    pub mac: String,
    pub name: String,
    pub hostname: String,
    pub model: String,
    pub ip: String,
    pub firmware: Option<FirmwareStatus>,
    pub addressing: DeviceAddressing,
    pub online_payload: String,
    pub offline_payload: String,
    pub texts: StateTexts,
    pub deep_sleep: bool,
    pub options: BTreeMap<String, i64>,
    pub components: BTreeMap<ComponentKey, Component>,
    pub availability: Availability,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn from_discovery(
        config: &DiscoveryPayload,
        sensors: Option<&SensorDiscoveryPayload>,
        firmware_table: &VariantTable,
    ) -> Self {
        let mac = crate::topic::normalize_mac(&config.mac);
        let addressing = DeviceAddressing {
            full_topic: FullTopic::new(&config.full_topic).with_identity(&config.hostname, &mac),
            topic: config.topic.clone(),
            prefixes: Prefixes::from_list(&config.prefixes).unwrap_or_default(),
        };
        let components = build_components(config, &addressing, sensors)
            .into_iter()
            .map(|c| (c.key.clone(), c))
            .collect();
        let firmware = (!config.sw_version.is_empty()).then(|| firmware_table.classify(&config.sw_version));

        Self {
            mac,
            name: config.device_name.clone(),
            hostname: config.hostname.clone(),
            model: config.model.clone(),
            ip: config.ip.clone(),
            firmware,
            addressing,
            online_payload: config.online.clone(),
            offline_payload: config.offline.clone(),
            texts: StateTexts::from_list(&config.state).unwrap_or_default(),
            deep_sleep: config.deep_sleep != 0,
            options: config.options.clone(),
            components,
            availability: Availability::Unknown,
            last_seen: None,
        }
    }

    pub fn component(&self, key: &ComponentKey) -> Option<&Component> {
        self.components.get(key)
    }

    pub fn component_mut(&mut self, key: &ComponentKey) -> Option<&mut Component> {
        self.components.get_mut(key)
    }

    pub fn verdict(&self) -> Option<UpdateVerdict> {
        self.firmware.as_ref().map(|f| f.verdict)
    }

    pub fn version(&self) -> Option<&str> {
        self.firmware.as_ref().map(|f| f.build.raw.as_str())
    }

    /// Component state of an offline device is stale. Deep-sleep devices
    /// are offline between wake-ups, so their state stays current.
    pub fn is_stale(&self) -> bool {
        self.availability == Availability::Offline && !self.deep_sleep
    }

    /// Adopt the runtime state of `previous`: component state for components
    /// whose shape did not change, availability and last-seen. Returns the
    /// keys added and removed relative to `previous`.
    pub fn carry_over(&mut self, previous: &Device) -> (Vec<ComponentKey>, Vec<ComponentKey>) {
        let mut added = Vec::new();
        for (key, component) in self.components.iter_mut() {
            match previous.components.get(key) {
                Some(old) if old.same_shape(component) => component.state = old.state.clone(),
                _ => added.push(key.clone()),
            }
        }
        let removed = previous
            .components
            .iter()
            .filter(|(key, old)| match self.components.get(*key) {
                Some(new) => !new.same_shape(old),
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect();

        self.availability = previous.availability;
        self.last_seen = previous.last_seen;
        (added, removed)
    }

    /// Every topic this device publishes on, and what it carries.
    pub fn routes(&self) -> Vec<(String, RouteTarget)> {
        let mut routes = vec![
            (self.addressing.lwt(), RouteTarget::Availability),
            (self.addressing.status(2), RouteTarget::Firmware),
            (self.addressing.result(), RouteTarget::Upgrade),
        ];
        for component in self.components.values() {
            for source in &component.addressing.sources {
                routes.push((
                    source.topic.clone(),
                    RouteTarget::Component {
                        key: component.key.clone(),
                        root: source.root.clone(),
                    },
                ));
            }
        }
        routes
    }

    /// Requests that make the device report its whole state.
    pub fn polls(&self) -> Vec<Command> {
        let mut polls: Vec<Command> = Vec::new();
        let extra = [1u8, 5, 2]
            .into_iter()
            .map(|n| Command::new(self.addressing.command("STATUS"), n.to_string()));
        let component_polls = self.components.values().filter_map(|c| c.addressing.poll.clone());
        for poll in component_polls.chain(extra) {
            if !polls.contains(&poll) {
                polls.push(poll);
            }
        }
        polls
    }
}

/// Where a message on a routed topic is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// LWT online/offline
    Availability,
    Component { key: ComponentKey, root: Vec<String> },
    /// `StatusFWR.Version` of STATUS2
    Firmware,
    /// `Upgrade` key of RESULT
    Upgrade,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub mac: String,
    pub target: RouteTarget,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    DeviceCreated {
        mac: String,
    },
    DeviceUpdated {
        mac: String,
        added: Vec<ComponentKey>,
        removed: Vec<ComponentKey>,
    },
    DeviceRemoved {
        mac: String,
    },
    AvailabilityChanged {
        mac: String,
        availability: Availability,
    },
    StateChanged {
        mac: String,
        key: ComponentKey,
        state: Value,
    },
    Triggered {
        mac: String,
        key: ComponentKey,
        event: TriggerEvent,
    },
    FirmwareReported {
        mac: String,
        status: FirmwareStatus,
    },
}

/// Topics that gained their first route or lost their last one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicDelta {
    pub subscribe: Vec<String>,
    pub unsubscribe: Vec<String>,
}

/// Counters for message handling
pub struct Metrics {
    pub messages: AtomicU64,
    pub discovery_applied: AtomicU64,
    pub state_applied: AtomicU64,
    pub soft_misses: AtomicU64,
    pub malformed_topics: AtomicU64,
    pub malformed_payloads: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            discovery_applied: AtomicU64::new(0),
            state_applied: AtomicU64::new(0),
            soft_misses: AtomicU64::new(0),
            malformed_topics: AtomicU64::new(0),
            malformed_payloads: AtomicU64::new(0),
        }
    }

    pub fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// All known devices and the topic routing table derived from them.
///
/// Readers get `Arc<Device>` snapshots. Writers are the per-device workers,
/// one per MAC, so each device has a single writer.
pub struct DeviceModel {
    devices: DashMap<String, Arc<Device>>,
    routes: DashMap<String, Vec<Route>>,
    event_tx: broadcast::Sender<ModelEvent>,
    pub metrics: Metrics,
}

impl DeviceModel {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            devices: DashMap::new(),
            routes: DashMap::new(),
            event_tx,
            metrics: Metrics::new(),
        }
    }

    pub fn device(&self, mac: &str) -> Option<Arc<Device>> {
        self.devices.get(mac).map(|entry| entry.value().clone())
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn component(&self, mac: &str, kind: ComponentKind, index: ComponentIndex) -> Option<Component> {
        let device = self.device(mac)?;
        device.component(&ComponentKey { kind, index }).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.event_tx.subscribe()
    }

    pub fn routes_for(&self, topic: &str) -> Vec<Route> {
        self.routes
            .get(topic)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Devices with at least one route on `topic`.
    pub fn macs_for_topic(&self, topic: &str) -> Vec<String> {
        let mut macs: Vec<String> = self.routes_for(topic).into_iter().map(|r| r.mac).collect();
        macs.sort();
        macs.dedup();
        macs
    }

    /// Every topic with at least one route.
    pub fn routed_topics(&self) -> Vec<String> {
        self.routes.iter().map(|entry| entry.key().clone()).collect()
    }

    // ── Writers (per-device workers only) ───────────────

    /// Insert or replace a device and re-route its topics.
    pub(crate) fn upsert(&self, device: Device) -> TopicDelta {
        let mac = device.mac.clone();
        let old_routes = self.devices.get(&mac).map(|d| d.routes()).unwrap_or_default();
        let new_routes = device.routes();
        let delta = self.reroute(&mac, &old_routes, &new_routes);
        self.devices.insert(mac, Arc::new(device));
        delta
    }

    pub(crate) fn remove(&self, mac: &str) -> Option<(Arc<Device>, TopicDelta)> {
        let (_, device) = self.devices.remove(mac)?;
        let delta = self.reroute(mac, &device.routes(), &[]);
        Some((device, delta))
    }

    /// Clone-modify-replace. `f` must not call back into the model.
    pub(crate) fn update<R>(&self, mac: &str, f: impl FnOnce(&mut Device) -> R) -> Option<R> {
        let mut entry = self.devices.get_mut(mac)?;
        let mut device = Device::clone(entry.value());
        let result = f(&mut device);
        *entry.value_mut() = Arc::new(device);
        Some(result)
    }

    pub(crate) fn emit(&self, event: ModelEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    // ── Private helpers ──────────────────────────────────

    fn reroute(&self, mac: &str, old: &[(String, RouteTarget)], new: &[(String, RouteTarget)]) -> TopicDelta {
        let topics: BTreeSet<&String> = old.iter().chain(new.iter()).map(|(t, _)| t).collect();
        let had: BTreeSet<String> = topics
            .iter()
            .filter(|t| self.routes.contains_key(t.as_str()))
            .map(|t| t.to_string())
            .collect();

        for (topic, _) in old {
            let emptied = match self.routes.get_mut(topic) {
                Some(mut routes) => {
                    routes.retain(|r| r.mac != mac);
                    routes.is_empty()
                }
                None => false,
            };
            if emptied {
                self.routes.remove_if(topic, |_, routes| routes.is_empty());
            }
        }
        for (topic, target) in new {
            self.routes.entry(topic.clone()).or_default().push(Route {
                mac: mac.to_string(),
                target: target.clone(),
            });
        }

        let mut delta = TopicDelta::default();
        for topic in topics {
            let has = self.routes.contains_key(topic.as_str());
            match (had.contains(topic), has) {
                (false, true) => delta.subscribe.push(topic.clone()),
                (true, false) => delta.unsubscribe.push(topic.clone()),
                _ => {}
            }
        }
        delta
    }
}

/// Devices built from the plug fixture, shared by several modules' tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::payload::fixtures::plug_config;

    pub fn make_config(overrides: Value) -> DiscoveryPayload {
        let mut config = plug_config();
        if let (Value::Object(base), Value::Object(extra)) = (&mut config, overrides) {
            for (k, v) in extra {
                base.insert(k, v);
            }
        }
        serde_json::from_value(config).unwrap()
    }

    pub fn make_device(overrides: Value) -> Device {
        Device::from_discovery(&make_config(overrides), None, &VariantTable::default())
    }
}
