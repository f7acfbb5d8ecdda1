//! Addressable parts of a device: relays, lights, switches, shutters, the
//! iFan fan, sensors, status values and triggers.
//!
//! A component's addressing, capabilities and static info are fixed when it
//! is created from discovery. Only [`ComponentState`] changes afterwards.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::commands::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Relay,
    Light,
    BinarySensor,
    Shutter,
    Fan,
    Sensor,
    Status,
    Trigger,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Relay => "relay",
            Self::Light => "light",
            Self::BinarySensor => "binary_sensor",
            Self::Shutter => "shutter",
            Self::Fan => "fan",
            Self::Sensor => "sensor",
            Self::Status => "status",
            Self::Trigger => "trigger",
        };
        f.write_str(s)
    }
}

/// Relay, switch, button and shutter numbers are 1-based slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum ComponentIndex {
    Slot(u8),
    Named(String),
}

impl fmt::Display for ComponentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slot(n) => write!(f, "{}", n),
            Self::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ComponentKey {
    pub kind: ComponentKind,
    pub index: ComponentIndex,
}

impl ComponentKey {
    pub fn slot(kind: ComponentKind, n: u8) -> Self {
        Self {
            kind,
            index: ComponentIndex::Slot(n),
        }
    }

    pub fn named(kind: ComponentKind, name: &str) -> Self {
        Self {
            kind,
            index: ComponentIndex::Named(name.to_string()),
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.index)
    }
}

/// A topic carrying this component's state, and where in the JSON payload
/// the component's values live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSource {
    pub topic: String,
    pub root: Vec<String>,
}

impl StateSource {
    pub fn new(topic: String, root: &[&str]) -> Self {
        Self {
            topic,
            root: root.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentAddressing {
    /// Topic of the primary command (`POWER1`, `FanSpeed`, ...)
    pub command: Option<String>,
    pub sources: Vec<StateSource>,
    /// Request that makes the device report this component's state
    pub poll: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusField {
    Rssi,
    Signal,
    LinkCount,
    MqttCount,
    Battery,
    LastRestart,
    Ssid,
    RestartReason,
    IpAddress,
}

/// What a recognized subkey means to its component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Power,
    Dimmer,
    ColorTemp,
    Color,
    White,
    Switch,
    TriggerAction,
    ShutterPosition,
    ShutterDirection,
    ShutterTilt,
    FanSpeed,
    Reading,
    LastReset,
    Status(StatusField),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capability {
    /// Path relative to the source root
    pub path: Vec<String>,
    pub attribute: Attribute,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub entries: Vec<Capability>,
    /// Attribute set by a bare (non-JSON) payload
    pub scalar: Option<Attribute>,
    /// Keep unrecognized subkeys in [`ComponentState::extra`]
    pub accept_unknown: bool,
}

impl Capabilities {
    pub fn with(mut self, path: &[&str], attribute: Attribute) -> Self {
        self.entries.push(Capability {
            path: path.iter().map(|s| s.to_string()).collect(),
            attribute,
        });
        self
    }

    pub fn scalar(mut self, attribute: Attribute) -> Self {
        self.scalar = Some(attribute);
        self
    }

    pub fn accept_unknown(mut self) -> Self {
        self.accept_unknown = true;
        self
    }

    /// Top-level subkeys this component understands.
    pub fn recognizes(&self, key: &str) -> bool {
        self.entries
            .iter()
            .any(|c| c.path.first().is_some_and(|p| p == key))
    }
}

/// ON/OFF/TOGGLE/HOLD texts configured on the device (`state` in discovery).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTexts {
    pub off: String,
    pub on: String,
    pub toggle: String,
    pub hold: String,
}

impl Default for StateTexts {
    fn default() -> Self {
        Self {
            off: "OFF".to_string(),
            on: "ON".to_string(),
            toggle: "TOGGLE".to_string(),
            hold: "HOLD".to_string(),
        }
    }
}

impl StateTexts {
    pub fn from_list(state: &[String]) -> Option<Self> {
        match state {
            [off, on, toggle, hold] => Some(Self {
                off: off.clone(),
                on: on.clone(),
                toggle: toggle.clone(),
                hold: hold.clone(),
            }),
            _ => None,
        }
    }

    pub fn parse(&self, s: &str) -> Option<bool> {
        if s == self.on {
            Some(true)
        } else if s == self.off {
            Some(false)
        } else {
            None
        }
    }

    pub fn text(&self, on: bool) -> &str {
        if on {
            &self.on
        } else {
            &self.off
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    None,
    ButtonShortPress,
    ButtonDoublePress,
    ButtonTriplePress,
    ButtonQuadruplePress,
    ButtonQuintuplePress,
    ButtonLongPress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Switch,
    Button,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerEvent {
    /// Action text reported by the device
    pub event: String,
    pub trigger_type: TriggerType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LightInfo {
    pub dimmer_key: Option<String>,
    pub color: bool,
    pub color_temp: bool,
    pub white: bool,
    pub min_mireds: u16,
    pub max_mireds: u16,
}

/// Static, kind-specific facts learned at discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentInfo {
    Plain,
    Light(LightInfo),
    Switch {
        switch_name: String,
        off_delay: Option<u32>,
    },
    Shutter {
        inverted: bool,
        tilt_min: i32,
        tilt_max: i32,
        tilt_duration: i32,
    },
    Sensor {
        units: BTreeMap<String, Option<String>>,
        discovered: BTreeMap<String, Value>,
    },
    Trigger {
        source: TriggerSource,
        events: Vec<TriggerEvent>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LightState {
    pub power: Option<bool>,
    pub dimmer: Option<u8>,
    pub color_temp: Option<u16>,
    pub color: Option<String>,
    pub white: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutterState {
    pub position: Option<u8>,
    pub direction: Option<i8>,
    pub tilt: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateValue {
    Relay { power: Option<bool> },
    Light(LightState),
    BinarySensor { on: Option<bool> },
    Shutter(ShutterState),
    Fan { speed: Option<u8> },
    Sensor {
        readings: BTreeMap<String, Value>,
        last_reset: Option<String>,
    },
    Status { fields: BTreeMap<StatusField, Value> },
    Trigger { last_event: Option<String> },
}

impl StateValue {
    pub fn empty(kind: ComponentKind) -> Self {
        match kind {
            ComponentKind::Relay => Self::Relay { power: None },
            ComponentKind::Light => Self::Light(LightState::default()),
            ComponentKind::BinarySensor => Self::BinarySensor { on: None },
            ComponentKind::Shutter => Self::Shutter(ShutterState::default()),
            ComponentKind::Fan => Self::Fan { speed: None },
            ComponentKind::Sensor => Self::Sensor {
                readings: BTreeMap::new(),
                last_reset: None,
            },
            ComponentKind::Status => Self::Status {
                fields: BTreeMap::new(),
            },
            ComponentKind::Trigger => Self::Trigger { last_event: None },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentState {
    pub value: StateValue,
    /// Unrecognized subkeys, kept verbatim
    pub extra: Map<String, Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ComponentState {
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            value: StateValue::empty(kind),
            extra: Map::new(),
            updated_at: None,
        }
    }

    /// Typed fields merged with `extra`, for display and export.
    pub fn snapshot(&self) -> Value {
        let mut out = match serde_json::to_value(&self.value) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (k, v) in &self.extra {
            out.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(out)
    }
}

/// What applying one value did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    pub changed: bool,
    pub triggered: Option<TriggerEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Component {
    pub key: ComponentKey,
    pub name: String,
    pub addressing: ComponentAddressing,
    pub capabilities: Capabilities,
    pub info: ComponentInfo,
    pub state: ComponentState,
}

impl Component {
    pub fn new(
        key: ComponentKey,
        name: String,
        addressing: ComponentAddressing,
        capabilities: Capabilities,
        info: ComponentInfo,
    ) -> Self {
        let state = ComponentState::new(key.kind);
        Self {
            key,
            name,
            addressing,
            capabilities,
            info,
            state,
        }
    }

    /// Same component as far as discovery is concerned: everything but state.
    pub fn same_shape(&self, other: &Component) -> bool {
        self.key == other.key
            && self.name == other.name
            && self.addressing == other.addressing
            && self.capabilities == other.capabilities
            && self.info == other.info
    }

    /// Apply one recognized value.
    pub fn apply(&mut self, capability: &Capability, value: &Value, texts: &StateTexts) -> Applied {
        let mut applied = Applied::default();
        let info = &self.info;

        match (&mut self.state.value, capability.attribute) {
            (StateValue::Relay { power }, Attribute::Power) => {
                applied.changed = set(power, as_text(value).and_then(|s| texts.parse(s)));
            }
            (StateValue::Light(light), attribute) => {
                applied.changed = match attribute {
                    Attribute::Power => set(&mut light.power, as_text(value).and_then(|s| texts.parse(s))),
                    Attribute::Dimmer => set(&mut light.dimmer, as_percent(value)),
                    Attribute::ColorTemp => set(
                        &mut light.color_temp,
                        value.as_u64().and_then(|v| u16::try_from(v).ok()),
                    ),
                    Attribute::Color => set(&mut light.color, value.as_str().map(String::from)),
                    Attribute::White => set(&mut light.white, as_percent(value)),
                    _ => false,
                };
            }
            (StateValue::BinarySensor { on }, Attribute::Switch) => {
                applied.changed = set(on, as_text(value).and_then(|s| texts.parse(s)));
            }
            (StateValue::Shutter(shutter), attribute) => {
                let ComponentInfo::Shutter {
                    inverted,
                    tilt_min,
                    tilt_max,
                    ..
                } = *info
                else {
                    return applied;
                };
                applied.changed = match attribute {
                    Attribute::ShutterPosition => {
                        let position = value.as_i64().map(|p| {
                            let p = p.clamp(0, 100);
                            if inverted {
                                100 - p
                            } else {
                                p
                            }
                        });
                        set(&mut shutter.position, position.map(|p| p as u8))
                    }
                    Attribute::ShutterDirection => {
                        let direction = value.as_i64().map(|d| {
                            let d = d.signum() as i8;
                            if inverted {
                                -d
                            } else {
                                d
                            }
                        });
                        set(&mut shutter.direction, direction)
                    }
                    Attribute::ShutterTilt => {
                        let range = tilt_max - tilt_min;
                        let tilt = value.as_f64().filter(|_| range != 0).map(|t| {
                            let scaled = (t - tilt_min as f64) * 100.0 / range as f64;
                            scaled.round().clamp(0.0, 100.0) as u8
                        });
                        set(&mut shutter.tilt, tilt)
                    }
                    _ => false,
                };
            }
            (StateValue::Fan { speed }, Attribute::FanSpeed) => {
                let value = value.as_u64().filter(|s| *s <= 3).map(|s| s as u8);
                if value.is_none() {
                    tracing::debug!("{}: ignoring fan speed outside 0..=3", self.key);
                }
                applied.changed = set(speed, value);
            }
            (StateValue::Sensor { readings, .. }, Attribute::Reading) => {
                let name = capability.path.join(" ");
                if readings.get(&name) != Some(value) {
                    readings.insert(name, value.clone());
                    applied.changed = true;
                }
            }
            (StateValue::Sensor { last_reset, .. }, Attribute::LastReset) => {
                applied.changed = set(last_reset, value.as_str().map(String::from));
            }
            (StateValue::Status { fields }, Attribute::Status(field)) => {
                let value = match field {
                    StatusField::LastRestart => match value.as_i64().and_then(last_restart) {
                        Some(at) => Value::String(at.to_rfc3339()),
                        None => {
                            tracing::debug!("{}: ignoring uptime {}", self.key, value);
                            return applied;
                        }
                    },
                    _ => value.clone(),
                };
                if fields.get(&field) != Some(&value) {
                    fields.insert(field, value);
                    applied.changed = true;
                }
            }
            (StateValue::Trigger { last_event }, Attribute::TriggerAction) => {
                let Some(action) = as_text(value) else {
                    return applied;
                };
                if let ComponentInfo::Trigger { events, .. } = info {
                    applied.triggered = events
                        .iter()
                        .find(|e| e.event == action && e.trigger_type != TriggerType::None)
                        .cloned();
                }
                if applied.triggered.is_some() {
                    *last_event = Some(action.to_string());
                    applied.changed = true;
                }
            }
            _ => {}
        }

        if applied.changed {
            self.state.updated_at = Some(Utc::now());
        }
        applied
    }

    /// Store an unrecognized top-level subkey. Returns false when this
    /// component does not keep unknown keys.
    pub fn keep_unknown(&mut self, key: &str, value: &Value) -> bool {
        if !self.capabilities.accept_unknown || self.capabilities.recognizes(key) {
            return false;
        }
        if self.state.extra.get(key) == Some(value) {
            return false;
        }
        self.state.extra.insert(key.to_string(), value.clone());
        true
    }
}

// ── Private helpers ──────────────────────────────────

fn set<T: PartialEq>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(v) if slot.as_ref() != Some(&v) => {
            *slot = Some(v);
            true
        }
        _ => false,
    }
}

fn as_text(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim)
}

fn as_percent(value: &Value) -> Option<u8> {
    value.as_u64().filter(|v| *v <= 100).map(|v| v as u8)
}

fn last_restart(uptime_secs: i64) -> Option<DateTime<Utc>> {
    Utc::now().checked_sub_signed(Duration::try_seconds(uptime_secs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_relay() -> Component {
        Component::new(
            ComponentKey::slot(ComponentKind::Relay, 1),
            "Plug".into(),
            ComponentAddressing {
                command: Some("cmnd/plug/POWER1".into()),
                sources: vec![],
                poll: None,
            },
            Capabilities::default()
                .with(&["POWER1"], Attribute::Power)
                .scalar(Attribute::Power),
            ComponentInfo::Plain,
        )
    }

    fn make_shutter(inverted: bool) -> Component {
        Component::new(
            ComponentKey::slot(ComponentKind::Shutter, 1),
            "Blind".into(),
            ComponentAddressing {
                command: None,
                sources: vec![],
                poll: None,
            },
            Capabilities::default()
                .with(&["Position"], Attribute::ShutterPosition)
                .with(&["Direction"], Attribute::ShutterDirection)
                .with(&["Tilt"], Attribute::ShutterTilt),
            ComponentInfo::Shutter {
                inverted,
                tilt_min: -90,
                tilt_max: 90,
                tilt_duration: 5,
            },
        )
    }

    fn capability(component: &Component, idx: usize) -> Capability {
        component.capabilities.entries[idx].clone()
    }

    #[test]
    fn test_relay_power_texts() {
        let mut relay = make_relay();
        let cap = capability(&relay, 0);
        let texts = StateTexts::default();

        assert!(relay.apply(&cap, &json!("ON"), &texts).changed);
        assert_eq!(relay.state.value, StateValue::Relay { power: Some(true) });
        assert!(!relay.apply(&cap, &json!("ON"), &texts).changed);
        assert!(!relay.apply(&cap, &json!("bogus"), &texts).changed);
        assert_eq!(relay.state.value, StateValue::Relay { power: Some(true) });
    }

    #[test]
    fn test_custom_state_texts() {
        let texts = StateTexts::from_list(&["AUS".into(), "AN".into(), "UM".into(), "HALT".into()]).unwrap();
        let mut relay = make_relay();
        let cap = capability(&relay, 0);
        relay.apply(&cap, &json!("AN"), &texts);
        assert_eq!(relay.state.value, StateValue::Relay { power: Some(true) });
        assert_eq!(texts.text(false), "AUS");
    }

    #[test]
    fn test_shutter_inversion_and_tilt() {
        let mut shutter = make_shutter(true);
        let texts = StateTexts::default();
        shutter.apply(&capability(&shutter, 0), &json!(30), &texts);
        shutter.apply(&capability(&shutter, 1), &json!(1), &texts);
        shutter.apply(&capability(&shutter, 2), &json!(0), &texts);

        assert_eq!(
            shutter.state.value,
            StateValue::Shutter(ShutterState {
                position: Some(70),
                direction: Some(-1),
                tilt: Some(50),
            })
        );
    }

    #[test]
    fn test_keep_unknown() {
        let mut sensor = Component::new(
            ComponentKey::named(ComponentKind::Sensor, "AM2301"),
            "AM2301".into(),
            ComponentAddressing {
                command: None,
                sources: vec![],
                poll: None,
            },
            Capabilities::default()
                .with(&["Temperature"], Attribute::Reading)
                .accept_unknown(),
            ComponentInfo::Plain,
        );
        assert!(sensor.keep_unknown("DewPoint", &json!(12.1)));
        assert!(!sensor.keep_unknown("Temperature", &json!(20.0)));
        assert_eq!(sensor.state.snapshot()["DewPoint"], json!(12.1));

        let mut relay = make_relay();
        assert!(!relay.keep_unknown("Heap", &json!(25)));
    }

    #[test]
    fn test_same_shape_ignores_state() {
        let mut a = make_relay();
        let b = make_relay();
        let cap = capability(&a, 0);
        a.apply(&cap, &json!("ON"), &StateTexts::default());
        assert!(a.same_shape(&b));

        let c = make_shutter(false);
        assert!(!a.same_shape(&c));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(ComponentKey::slot(ComponentKind::Relay, 2).to_string(), "relay 2");
        assert_eq!(
            ComponentKey::named(ComponentKind::Sensor, "ENERGY").to_string(),
            "sensor ENERGY"
        );
    }
}
