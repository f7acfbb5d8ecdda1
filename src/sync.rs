//! Applies state and telemetry messages to the device model.
//!
//! A message is looked up in the routing table by exact topic. Each route
//! names a component and the JSON path under which that component's values
//! live; only recognized subkeys present in the message are applied, so
//! partial updates never clear earlier values.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::commands::Command;
use crate::component::{Capability, Component, ComponentKey, StateTexts, TriggerEvent};
use crate::error::{BridgeError, Result};
use crate::firmware::{FirmwareStatus, VariantTable};
use crate::model::{Availability, Device, DeviceModel, Metrics, ModelEvent, RouteTarget};
use crate::payload::{value_by_path, Payload};

/// Upgrade progress reported in `RESULT` (`{"Upgrade":"..."}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeSignal {
    Progress(String),
    Succeeded(String),
    Failed(String),
}

impl UpgradeSignal {
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("successful") {
            Self::Succeeded(message.to_string())
        } else if ["failed", "error", "abort"].iter().any(|w| lower.contains(w)) {
            Self::Failed(message.to_string())
        } else {
            Self::Progress(message.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    pub changed: Vec<ComponentKey>,
    pub availability: Option<Availability>,
    /// Polls to publish, set when the device just came online
    pub polls: Vec<Command>,
    pub firmware: Option<FirmwareStatus>,
    pub upgrade: Option<UpgradeSignal>,
}

pub struct StateSynchronizer {
    model: Arc<DeviceModel>,
    firmware: Arc<VariantTable>,
}

impl StateSynchronizer {
    pub fn new(model: Arc<DeviceModel>, firmware: Arc<VariantTable>) -> Self {
        Self { model, firmware }
    }

    /// Apply one message for `mac`. Must be called from the MAC's worker.
    pub fn apply(&self, mac: &str, topic: &str, payload: &[u8]) -> Result<SyncOutcome> {
        let metrics = &self.model.metrics;
        Metrics::count(&metrics.messages);

        if self.model.device(mac).is_none() {
            Metrics::count(&metrics.soft_misses);
            tracing::debug!("Sync: {} for unknown device {}", topic, mac);
            return Err(BridgeError::UnknownDevice(mac.to_string()));
        }
        let targets: Vec<RouteTarget> = self
            .model
            .routes_for(topic)
            .into_iter()
            .filter(|r| r.mac == mac)
            .map(|r| r.target)
            .collect();
        if targets.is_empty() {
            Metrics::count(&metrics.soft_misses);
            tracing::debug!("Sync: no route for {} on {}", topic, mac);
            return Err(BridgeError::UnknownComponent {
                mac: mac.to_string(),
                component: topic.to_string(),
            });
        }

        let payload = Payload::parse(topic, payload).inspect_err(|_| {
            Metrics::count(&metrics.malformed_payloads);
        })?;

        let applied = self.model.update(mac, |device| {
            let mut outcome = SyncOutcome::default();
            let mut events = Vec::new();
            device.last_seen = Some(Utc::now());
            for target in &targets {
                self.apply_target(device, target, &payload, &mut outcome, &mut events);
            }
            (outcome, events)
        });
        let Some((outcome, events)) = applied else {
            Metrics::count(&metrics.soft_misses);
            return Err(BridgeError::UnknownDevice(mac.to_string()));
        };

        if !outcome.changed.is_empty() {
            Metrics::count(&metrics.state_applied);
        }
        for event in events {
            self.model.emit(event);
        }
        Ok(outcome)
    }

    // ── Private helpers ──────────────────────────────────

    fn apply_target(
        &self,
        device: &mut Device,
        target: &RouteTarget,
        payload: &Payload,
        outcome: &mut SyncOutcome,
        events: &mut Vec<ModelEvent>,
    ) {
        match target {
            RouteTarget::Availability => apply_availability(device, payload, outcome, events),
            RouteTarget::Firmware => {
                let version = payload
                    .as_object()
                    .and_then(|o| o.get("StatusFWR"))
                    .and_then(|fwr| fwr.get("Version"))
                    .and_then(Value::as_str);
                if let Some(version) = version {
                    let status = self.firmware.classify(version);
                    if device.firmware.as_ref() != Some(&status) {
                        tracing::info!("Sync: {} reports firmware {} ({})", device.mac, version, status.verdict);
                        device.firmware = Some(status.clone());
                        events.push(ModelEvent::FirmwareReported {
                            mac: device.mac.clone(),
                            status: status.clone(),
                        });
                    }
                    outcome.firmware = Some(status);
                }
            }
            RouteTarget::Upgrade => {
                let message = payload
                    .as_object()
                    .and_then(|o| o.get("Upgrade"))
                    .and_then(Value::as_str);
                if let Some(message) = message {
                    outcome.upgrade = Some(UpgradeSignal::from_message(message));
                }
            }
            RouteTarget::Component { key, root } => {
                let texts = device.texts.clone();
                let mac = device.mac.clone();
                let Some(component) = device.component_mut(key) else {
                    return;
                };
                let (changed, triggered) = apply_component(component, root, payload, &texts);
                if let Some(event) = triggered {
                    tracing::debug!("Sync: {} {} triggered {}", mac, key, event.event);
                    events.push(ModelEvent::Triggered {
                        mac: mac.clone(),
                        key: key.clone(),
                        event,
                    });
                }
                if changed && !outcome.changed.contains(key) {
                    outcome.changed.push(key.clone());
                    events.push(ModelEvent::StateChanged {
                        mac,
                        key: key.clone(),
                        state: component.state.snapshot(),
                    });
                }
            }
        }
    }
}

fn apply_availability(device: &mut Device, payload: &Payload, outcome: &mut SyncOutcome, events: &mut Vec<ModelEvent>) {
    let text = match payload {
        Payload::Scalar(Value::String(s)) => s.as_str(),
        _ => return,
    };
    let availability = if text == device.online_payload {
        Availability::Online
    } else if text == device.offline_payload {
        Availability::Offline
    } else {
        tracing::debug!("Sync: {} unexpected LWT '{}'", device.mac, text);
        return;
    };
    if device.availability == availability {
        return;
    }

    tracing::info!("Sync: {} is {:?}", device.mac, availability);
    device.availability = availability;
    outcome.availability = Some(availability);
    if availability == Availability::Online {
        outcome.polls = device.polls();
    }
    events.push(ModelEvent::AvailabilityChanged {
        mac: device.mac.clone(),
        availability,
    });
}

/// Returns whether state changed and the trigger event fired, if any.
fn apply_component(
    component: &mut Component,
    root: &[String],
    payload: &Payload,
    texts: &StateTexts,
) -> (bool, Option<TriggerEvent>) {
    let mut changed = false;
    let mut triggered = None;

    let node = match payload {
        Payload::Scalar(value) => {
            if !root.is_empty() {
                return (false, None);
            }
            let Some(attribute) = component.capabilities.scalar else {
                return (false, None);
            };
            let capability = Capability {
                path: Vec::new(),
                attribute,
            };
            let applied = component.apply(&capability, value, texts);
            return (applied.changed, applied.triggered);
        }
        Payload::Object(map) => {
            let object = Value::Object(map.clone());
            match value_by_path(&object, root) {
                Some(node) => node.clone(),
                None => return (false, None),
            }
        }
    };

    let capabilities = component.capabilities.entries.clone();
    for capability in &capabilities {
        if let Some(value) = value_by_path(&node, &capability.path) {
            let applied = component.apply(capability, value, texts);
            changed |= applied.changed;
            if applied.triggered.is_some() {
                triggered = applied.triggered;
            }
        }
    }
    if let Value::Object(fields) = &node {
        for (key, value) in fields {
            changed |= component.keep_unknown(key, value);
        }
    }
    if changed {
        component.state.updated_at = Some(Utc::now());
    }
    (changed, triggered)
}
