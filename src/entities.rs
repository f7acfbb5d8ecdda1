//! Builds a device's components from its discovery messages.
//!
//! Relays (`rl`) become relays, lights or shutter pairs; `if` adds the iFan
//! fan; switch modes (`swc`) and MQTT buttons (`btn` with SetOption73) add
//! binary sensors and triggers; every device gets a status component; the
//! `sensors` inventory adds one sensor component per sensor object.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::commands::Command;
use crate::component::{
    Attribute, Capabilities, Component, ComponentAddressing, ComponentInfo, ComponentKey,
    ComponentKind, LightInfo, StateSource, StateTexts, StatusField, TriggerEvent, TriggerSource, TriggerType,
};
use crate::payload::{DiscoveryPayload, SensorDiscoveryPayload};
use crate::topic::DeviceAddressing;

pub const RELAY_NONE: u8 = 0;
pub const RELAY_RELAY: u8 = 1;
pub const RELAY_LIGHT: u8 = 2;
pub const RELAY_SHUTTER: u8 = 3;

pub const MAX_SHUTTERS: usize = 4;

const OPTION_BUTTON_SWAP: &str = "11";
const OPTION_BUTTON_SINGLE: &str = "13";
const OPTION_HASS_LIGHT: &str = "30";
const OPTION_PWM_MULTI_CHANNELS: &str = "68";
const OPTION_MQTT_BUTTONS: &str = "73";
const OPTION_REDUCED_CT_RANGE: &str = "82";

const LIGHT_SUBTYPE_SINGLE: u8 = 1;
const LIGHT_SUBTYPE_COLDWARM: u8 = 2;
const LIGHT_SUBTYPE_RGB: u8 = 3;
const LIGHT_SUBTYPE_RGBW: u8 = 4;
const LIGHT_SUBTYPE_RGBCW: u8 = 5;

const SWITCHMODE_PUSHON: i8 = 13;
const SWITCHMODE_PUSHON_INV: i8 = 14;

/// Sensors that never become components.
const IGNORED_SENSORS: &[&str] = &["PN532", "RDM6300", "Time"];

/// Per switch mode: binary sensor?, off delay, TOGGLE trigger, HOLD trigger.
struct SwitchMode {
    binary_sensor: bool,
    off_delay: Option<u32>,
    toggle: TriggerType,
    hold: TriggerType,
}

const fn mode(binary_sensor: bool, off_delay: Option<u32>, toggle: TriggerType, hold: TriggerType) -> SwitchMode {
    SwitchMode {
        binary_sensor,
        off_delay,
        toggle,
        hold,
    }
}

use TriggerType::{ButtonDoublePress as DOUBLE, ButtonLongPress as LONG, ButtonShortPress as SHORT, None as NONE};

/// Indexed by switch mode 0..=16.
const SWITCHMODES: [SwitchMode; 17] = [
    mode(false, None, SHORT, NONE),     // 0 toggle
    mode(true, None, NONE, NONE),       // 1 follow
    mode(true, None, NONE, NONE),       // 2 follow inverted
    mode(true, None, SHORT, NONE),      // 3 pushbutton
    mode(true, None, SHORT, NONE),      // 4 pushbutton inverted
    mode(true, None, SHORT, LONG),      // 5 pushbutton hold
    mode(true, None, SHORT, LONG),      // 6 pushbutton hold inverted
    mode(false, None, SHORT, NONE),     // 7 pushbutton toggle
    mode(false, None, SHORT, DOUBLE),   // 8 toggle multi
    mode(true, None, NONE, DOUBLE),     // 9 follow multi
    mode(true, None, NONE, DOUBLE),     // 10 follow multi inverted
    mode(false, None, SHORT, NONE),     // 11 push hold multi
    mode(false, None, SHORT, NONE),     // 12 push hold multi inverted
    mode(true, Some(1), NONE, NONE),    // 13 push on (PIR)
    mode(true, Some(1), NONE, NONE),    // 14 push on inverted
    mode(true, None, NONE, NONE),       // 15 push ignore
    mode(true, None, NONE, NONE),       // 16 push ignore inverted
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ButtonMode {
    None,
    Normal,
    Swap,
    Single,
}

const BUTTON_EVENTS: [&str; 6] = ["SINGLE", "DOUBLE", "TRIPLE", "QUAD", "PENTA", "HOLD"];

fn button_triggers(mode: ButtonMode) -> [TriggerType; 6] {
    use TriggerType::*;
    match mode {
        ButtonMode::None => [None; 6],
        ButtonMode::Normal => [
            ButtonShortPress,
            ButtonDoublePress,
            ButtonTriplePress,
            ButtonQuadruplePress,
            ButtonQuintuplePress,
            ButtonLongPress,
        ],
        ButtonMode::Swap => [
            ButtonDoublePress,
            ButtonShortPress,
            ButtonTriplePress,
            ButtonQuadruplePress,
            ButtonQuintuplePress,
            ButtonLongPress,
        ],
        ButtonMode::Single => [ButtonShortPress, None, None, None, None, None],
    }
}

/// All components declared by a config message and optional sensor inventory.
pub fn build_components(
    config: &DiscoveryPayload,
    addressing: &DeviceAddressing,
    sensors: Option<&SensorDiscoveryPayload>,
) -> Vec<Component> {
    let mut components = Vec::new();
    components.extend(relay_components(config, addressing));
    components.extend(shutter_components(config, addressing));
    components.extend(fan_component(config, addressing));
    components.extend(switch_components(config, addressing));
    components.extend(button_components(config, addressing));
    components.push(status_component(config, addressing));
    if let Some(sensors) = sensors {
        components.extend(sensor_components(sensors, addressing));
    }
    components
}

// ── Relays and lights ────────────────────────────────

fn relay_components(config: &DiscoveryPayload, addressing: &DeviceAddressing) -> Vec<Component> {
    let force_light = config.option(OPTION_HASS_LIGHT) == 1;
    let ifan = config.ifan != 0;
    let mut relays = config.relays.clone();
    if ifan && relays.first() == Some(&RELAY_LIGHT) {
        // iFan light is a plain on/off light
        relays[0] = RELAY_RELAY;
    }
    let single_relay = relays.iter().filter(|r| **r != RELAY_NONE).count() == 1;

    let mut components = Vec::new();
    for (idx, relay) in relays.iter().enumerate() {
        let Ok(slot) = u8::try_from(idx + 1) else {
            break;
        };
        let (kind, light) = match *relay {
            RELAY_RELAY if force_light || (ifan && idx == 0) => (ComponentKind::Light, Some(on_off_light(config))),
            RELAY_RELAY => (ComponentKind::Relay, None),
            RELAY_LIGHT => (ComponentKind::Light, Some(light_info(config, idx))),
            _ => continue,
        };

        let power_key = format!("POWER{}", slot);
        let mut capabilities = Capabilities::default()
            .with(&[power_key.as_str()], Attribute::Power)
            .scalar(Attribute::Power);
        if slot == 1 {
            capabilities = capabilities.with(&["POWER"], Attribute::Power);
        }
        if let Some(info) = &light {
            if let Some(key) = &info.dimmer_key {
                capabilities = capabilities.with(&[key.as_str()], Attribute::Dimmer);
            }
            if info.color_temp {
                capabilities = capabilities.with(&["CT"], Attribute::ColorTemp);
            }
            if info.color {
                capabilities = capabilities.with(&["Color"], Attribute::Color);
            }
            if info.white {
                capabilities = capabilities.with(&["White"], Attribute::White);
            }
        }

        let mut sources = vec![
            StateSource::new(addressing.result(), &[]),
            StateSource::new(addressing.telemetry("STATE"), &[]),
            StateSource::new(addressing.power(slot, false), &[]),
        ];
        if slot == 1 && single_relay {
            sources.push(StateSource::new(addressing.power(1, true), &[]));
        }

        components.push(Component::new(
            ComponentKey::slot(kind, slot),
            config.friendly_name(idx),
            ComponentAddressing {
                command: Some(addressing.command(&power_key)),
                sources,
                poll: Some(Command::new(addressing.command("STATE"), "")),
            },
            capabilities,
            light.map_or(ComponentInfo::Plain, ComponentInfo::Light),
        ));
    }
    components
}

fn mireds(config: &DiscoveryPayload) -> (u16, u16) {
    if config.option(OPTION_REDUCED_CT_RANGE) == 1 {
        (200, 380)
    } else {
        (153, 500)
    }
}

fn on_off_light(config: &DiscoveryPayload) -> LightInfo {
    let (min_mireds, max_mireds) = mireds(config);
    LightInfo {
        dimmer_key: None,
        color: false,
        color_temp: false,
        white: false,
        min_mireds,
        max_mireds,
    }
}

fn light_info(config: &DiscoveryPayload, idx: usize) -> LightInfo {
    let subtype = config.light_subtype;
    let mut info = on_off_light(config);

    if config.option(OPTION_PWM_MULTI_CHANNELS) == 1 {
        // one dimmable light per PWM channel
        info.dimmer_key = Some(format!("Channel{}", idx + 1));
    } else if config.link_rgb_ct == 0 && subtype >= LIGHT_SUBTYPE_RGBW {
        // split into an RGB light and a white/CT light
        let first = config
            .relays
            .iter()
            .position(|r| *r == RELAY_LIGHT)
            .unwrap_or(idx);
        match idx.checked_sub(first) {
            Some(0) => {
                info.dimmer_key = Some("Dimmer1".to_string());
                info.color = true;
            }
            Some(1) => {
                info.dimmer_key = Some("Dimmer2".to_string());
                info.color_temp = subtype == LIGHT_SUBTYPE_RGBCW;
            }
            _ => {}
        }
    } else if subtype >= LIGHT_SUBTYPE_SINGLE {
        info.dimmer_key = Some("Dimmer".to_string());
        info.color_temp = matches!(subtype, LIGHT_SUBTYPE_COLDWARM | LIGHT_SUBTYPE_RGBCW);
        info.color = subtype >= LIGHT_SUBTYPE_RGB;
        info.white = subtype == LIGHT_SUBTYPE_RGBW;
    }
    info
}

// ── Shutters ─────────────────────────────────────────

/// First relay index of each shutter; pairs of consecutive shutter relays.
pub fn shutter_pairs(relays: &[u8]) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut idx = 0;
    while idx < relays.len() {
        if relays[idx] == RELAY_SHUTTER {
            if relays.get(idx + 1) != Some(&RELAY_SHUTTER) {
                tracing::warn!(
                    "Discovery: invalid shutter configuration, relay {} is shutter but {} is not",
                    idx + 1,
                    idx + 2
                );
                return Vec::new();
            }
            starts.push(idx);
            idx += 2;
            continue;
        }
        idx += 1;
    }
    starts.truncate(MAX_SHUTTERS);
    starts
}

fn shutter_components(config: &DiscoveryPayload, addressing: &DeviceAddressing) -> Vec<Component> {
    shutter_pairs(&config.relays)
        .iter()
        .enumerate()
        .zip(1..=u8::MAX)
        .map(|((idx, _), n)| {
            let shutter = format!("Shutter{}", n);
            let options = config.shutter_options.get(idx).copied().unwrap_or(0);
            let tilt = config.shutter_tilt.get(idx).cloned().unwrap_or_default();
            let tilt_at = |i: usize| tilt.get(i).copied().unwrap_or(0);

            Component::new(
                ComponentKey::slot(ComponentKind::Shutter, n),
                format!("{} shutter {}", config.device_name, n),
                ComponentAddressing {
                    command: Some(addressing.command(&format!("ShutterPosition{}", n))),
                    sources: vec![
                        StateSource::new(addressing.result(), &[shutter.as_str()]),
                        StateSource::new(addressing.telemetry("SENSOR"), &[shutter.as_str()]),
                        StateSource::new(addressing.status(10), &["StatusSNS", shutter.as_str()]),
                    ],
                    poll: Some(Command::new(addressing.command("STATUS"), "10")),
                },
                Capabilities::default()
                    .with(&["Position"], Attribute::ShutterPosition)
                    .with(&["Direction"], Attribute::ShutterDirection)
                    .with(&["Tilt"], Attribute::ShutterTilt),
                ComponentInfo::Shutter {
                    inverted: options & 1 == 1,
                    tilt_min: tilt_at(0),
                    tilt_max: tilt_at(1),
                    tilt_duration: tilt_at(2),
                },
            )
        })
        .collect()
}

// ── iFan ─────────────────────────────────────────────

fn fan_component(config: &DiscoveryPayload, addressing: &DeviceAddressing) -> Option<Component> {
    if config.ifan == 0 {
        return None;
    }
    Some(Component::new(
        ComponentKey::named(ComponentKind::Fan, "ifan"),
        config.device_name.clone(),
        ComponentAddressing {
            command: Some(addressing.command("FanSpeed")),
            sources: vec![
                StateSource::new(addressing.result(), &[]),
                StateSource::new(addressing.telemetry("STATE"), &[]),
            ],
            poll: Some(Command::new(addressing.command("STATE"), "")),
        },
        Capabilities::default().with(&["FanSpeed"], Attribute::FanSpeed),
        ComponentInfo::Plain,
    ))
}

// ── Switches and buttons ─────────────────────────────

fn switch_components(config: &DiscoveryPayload, addressing: &DeviceAddressing) -> Vec<Component> {
    let texts = StateTexts::from_list(&config.state).unwrap_or_default();
    let mut components = Vec::new();

    for (idx, switchmode) in config.switches.iter().enumerate() {
        if *switchmode < 0 {
            continue;
        }
        let Some(mode) = SWITCHMODES.get(*switchmode as usize) else {
            tracing::warn!("Discovery: unknown switch mode {} for switch {}", switchmode, idx + 1);
            continue;
        };
        let Ok(n) = u8::try_from(idx + 1) else {
            break;
        };
        let switch_name = config.switch_name(idx);

        if mode.binary_sensor {
            let polled = !matches!(*switchmode, SWITCHMODE_PUSHON | SWITCHMODE_PUSHON_INV);
            let mut sources = vec![StateSource::new(addressing.result(), &[switch_name.as_str()])];
            if polled {
                sources.push(StateSource::new(addressing.telemetry("SENSOR"), &[]));
                sources.push(StateSource::new(addressing.status(10), &["StatusSNS"]));
            }
            components.push(Component::new(
                ComponentKey::slot(ComponentKind::BinarySensor, n),
                switch_name.clone(),
                ComponentAddressing {
                    command: None,
                    sources,
                    poll: polled.then(|| Command::new(addressing.command("STATUS"), "10")),
                },
                Capabilities::default()
                    .with(&["Action"], Attribute::Switch)
                    .with(&[switch_name.as_str()], Attribute::Switch),
                ComponentInfo::Switch {
                    switch_name: switch_name.clone(),
                    off_delay: mode.off_delay,
                },
            ));
        }

        let events = vec![
            TriggerEvent {
                event: texts.toggle.clone(),
                trigger_type: mode.toggle,
            },
            TriggerEvent {
                event: texts.hold.clone(),
                trigger_type: mode.hold,
            },
        ];
        if let Some(trigger) = trigger_component(
            addressing,
            &format!("switch_{}", n),
            &switch_name,
            TriggerSource::Switch,
            events,
        ) {
            components.push(trigger);
        }
    }
    components
}

fn button_components(config: &DiscoveryPayload, addressing: &DeviceAddressing) -> Vec<Component> {
    let mqtt_buttons = config.option(OPTION_MQTT_BUTTONS) != 0;
    let mut components = Vec::new();

    for (idx, enabled) in config.buttons.iter().enumerate() {
        let mode = if !mqtt_buttons || *enabled == 0 {
            ButtonMode::None
        } else if config.option(OPTION_BUTTON_SINGLE) != 0 {
            ButtonMode::Single
        } else if config.option(OPTION_BUTTON_SWAP) != 0 {
            ButtonMode::Swap
        } else {
            ButtonMode::Normal
        };
        let events = BUTTON_EVENTS
            .iter()
            .zip(button_triggers(mode))
            .map(|(event, trigger_type)| TriggerEvent {
                event: event.to_string(),
                trigger_type,
            })
            .collect();

        let n = idx + 1;
        if let Some(trigger) = trigger_component(
            addressing,
            &format!("button_{}", n),
            &format!("Button{}", n),
            TriggerSource::Button,
            events,
        ) {
            components.push(trigger);
        }
    }
    components
}

fn trigger_component(
    addressing: &DeviceAddressing,
    name: &str,
    root: &str,
    source: TriggerSource,
    events: Vec<TriggerEvent>,
) -> Option<Component> {
    if events.iter().all(|e| e.trigger_type == TriggerType::None) {
        return None;
    }
    Some(Component::new(
        ComponentKey::named(ComponentKind::Trigger, name),
        name.to_string(),
        ComponentAddressing {
            command: None,
            sources: vec![StateSource::new(addressing.result(), &[root])],
            poll: None,
        },
        Capabilities::default().with(&["Action"], Attribute::TriggerAction),
        ComponentInfo::Trigger { source, events },
    ))
}

// ── Device status ────────────────────────────────────

fn status_component(config: &DiscoveryPayload, addressing: &DeviceAddressing) -> Component {
    let mut capabilities = Capabilities::default()
        .with(&["Wifi", "RSSI"], Attribute::Status(StatusField::Rssi))
        .with(&["Wifi", "Signal"], Attribute::Status(StatusField::Signal))
        .with(&["Wifi", "LinkCount"], Attribute::Status(StatusField::LinkCount))
        .with(&["Wifi", "SSId"], Attribute::Status(StatusField::Ssid))
        .with(&["MqttCount"], Attribute::Status(StatusField::MqttCount))
        .with(&["UptimeSec"], Attribute::Status(StatusField::LastRestart))
        .with(&["RestartReason"], Attribute::Status(StatusField::RestartReason))
        .with(&["IPAddress"], Attribute::Status(StatusField::IpAddress));
    if config.battery != 0 {
        capabilities = capabilities.with(&["BatteryPercentage"], Attribute::Status(StatusField::Battery));
    }

    Component::new(
        ComponentKey::named(ComponentKind::Status, "status"),
        config.device_name.clone(),
        ComponentAddressing {
            command: None,
            sources: vec![
                StateSource::new(addressing.telemetry("STATE"), &[]),
                StateSource::new(addressing.status(11), &["StatusSTS"]),
                StateSource::new(addressing.status(1), &["StatusPRM"]),
                StateSource::new(addressing.status(5), &["StatusNET"]),
            ],
            poll: Some(Command::new(addressing.command("STATUS"), "11")),
        },
        capabilities,
        ComponentInfo::Plain,
    )
}

// ── Sensors ──────────────────────────────────────────

/// Units of quantities whose unit does not depend on device settings.
fn static_unit(quantity: &str) -> Option<&'static str> {
    let unit = match quantity {
        "Ambient" | "Illuminance" => "lux",
        "Battery" | "Humidity" | "Moisture" => "%",
        "CCT" => "K",
        "CF1" | "CF2.5" | "CF10" | "PM1" | "PM2.5" | "PM10" => "µg/m³",
        "CarbonDioxide" | "eCO2" => "ppm",
        "TVOC" => "ppb",
        "Red" => "R",
        "Green" => "G",
        "Blue" => "B",
        "Current" | "CurrentNeutral" => "A",
        "Distance" => "cm",
        "Energy" | "ExportActive" | "ExportTariff" | "ImportActive" | "Today" | "Total"
        | "TotalTariff" | "Yesterday" => "kWh",
        "ExportReactive" | "ImportReactive" => "kVArh",
        "Frequency" => "Hz",
        "PB0.3" | "PB0.5" | "PB1" | "PB2.5" | "PB5" | "PB10" => "ppd",
        "PhaseAngle" => "°",
        "Power" | "ActivePower" => "W",
        "ApparentPower" => "VA",
        "ReactivePower" => "VAr",
        "Proximity" => " ",
        "Voltage" => "V",
        "Weight" => "kg",
        _ => return None,
    };
    Some(unit)
}

/// Quantities reported in a unit the device announces alongside the sensors.
fn dynamic_unit(quantity: &str) -> Option<(&'static str, &'static [&'static str])> {
    const TEMPERATURE: &[&str] = &["C", "F"];
    const PRESSURE: &[&str] = &["hPa", "mmHg"];
    const SPEED: &[&str] = &["m/s", "km/h", "kn", "mph", "ft/s", "yd/s"];
    match quantity {
        "Temperature" | "DewPoint" => Some(("TempUnit", TEMPERATURE)),
        "Pressure" | "SeaPressure" => Some(("PressureUnit", PRESSURE)),
        "Speed" => Some(("SpeedUnit", SPEED)),
        _ => None,
    }
}

fn quantity(sensor: &str, sub: &str, subsub: Option<&str>) -> String {
    if matches!(sensor, "AS3935" | "LD2410") && sub == "Energy" {
        // not kWh
        return "EnergyOther".to_string();
    }
    if let Some(subsub) = subsub {
        if static_unit(subsub).is_some() || dynamic_unit(subsub).is_some() {
            return subsub.to_string();
        }
    }
    if sensor == "ANALOG" && sub.ends_with(|c: char| c.is_ascii_digit()) {
        // ADC pin suffix on ESP32
        return sub[..sub.len() - 1].to_string();
    }
    sub.to_string()
}

fn unit_for(quantity: &str, inventory: &Map<String, Value>) -> Option<String> {
    if let Some((key, supported)) = dynamic_unit(quantity) {
        let unit = inventory.get(key).and_then(|v| v.as_str());
        return match unit {
            Some(unit) if supported.contains(&unit) => Some(unit.to_string()),
            other => {
                tracing::warn!("Discovery: unknown unit {:?} for {}", other, quantity);
                other.map(String::from)
            }
        };
    }
    static_unit(quantity).map(String::from)
}

fn sensor_components(sensors: &SensorDiscoveryPayload, addressing: &DeviceAddressing) -> Vec<Component> {
    let mut components = Vec::new();

    for (name, value) in &sensors.sensors {
        let Value::Object(fields) = value else {
            continue;
        };
        if IGNORED_SENSORS.contains(&name.as_str()) {
            continue;
        }

        let mut leaves: Vec<(Vec<String>, String, Value)> = Vec::new();
        for (sub, subvalue) in fields {
            match subvalue {
                Value::Object(inner) => {
                    for (subsub, v) in inner {
                        let q = quantity(name, sub, Some(subsub));
                        leaves.push((vec![sub.clone(), subsub.clone()], q, v.clone()));
                    }
                }
                Value::Array(items) => {
                    for (i, v) in items.iter().enumerate() {
                        let q = quantity(name, sub, None);
                        leaves.push((vec![sub.clone(), i.to_string()], q, v.clone()));
                    }
                }
                v => leaves.push((vec![sub.clone()], quantity(name, sub, None), v.clone())),
            }
        }

        let mut capabilities = Capabilities::default().accept_unknown();
        let mut units = BTreeMap::new();
        let mut discovered = BTreeMap::new();
        for (path, q, v) in leaves {
            let reading = path.join(" ");
            if q == "Total" && path.len() == 1 {
                capabilities = capabilities.with(&["TotalStartTime"], Attribute::LastReset);
            }
            let refs: Vec<&str> = path.iter().map(String::as_str).collect();
            capabilities = capabilities.with(&refs, Attribute::Reading);
            units.insert(reading.clone(), unit_for(&q, &sensors.sensors));
            discovered.insert(reading, v);
        }

        components.push(Component::new(
            ComponentKey::named(ComponentKind::Sensor, name),
            name.clone(),
            ComponentAddressing {
                command: None,
                sources: vec![
                    StateSource::new(addressing.telemetry("SENSOR"), &[name.as_str()]),
                    StateSource::new(addressing.status(10), &["StatusSNS", name.as_str()]),
                ],
                poll: Some(Command::new(addressing.command("STATUS"), "10")),
            },
            capabilities,
            ComponentInfo::Sensor { units, discovered },
        ));
    }
    components
}
