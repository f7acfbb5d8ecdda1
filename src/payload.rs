//! Payload schemas: the discovery messages and the state/telemetry bodies.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};
use crate::topic::normalize_mac;

pub const DISCOVERY_VERSION: u8 = 1;

/// `<discovery_prefix>/<MAC>/config`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiscoveryPayload {
    pub ip: String,
    #[serde(rename = "dn")]
    pub device_name: String,
    #[serde(rename = "fn", default)]
    pub friendly_names: Vec<Option<String>>,
    #[serde(rename = "hn")]
    pub hostname: String,
    pub mac: String,
    #[serde(rename = "md")]
    pub model: String,
    #[serde(rename = "ty", default)]
    pub tuya: u8,
    #[serde(rename = "if", default)]
    pub ifan: u8,
    #[serde(rename = "ofln")]
    pub offline: String,
    #[serde(rename = "onln")]
    pub online: String,
    pub state: Vec<String>,
    #[serde(rename = "sw")]
    pub sw_version: String,
    #[serde(rename = "t")]
    pub topic: String,
    #[serde(rename = "ft")]
    pub full_topic: String,
    #[serde(rename = "tp")]
    pub prefixes: Vec<String>,
    #[serde(rename = "rl", default)]
    pub relays: Vec<u8>,
    #[serde(rename = "swc", default)]
    pub switches: Vec<i8>,
    #[serde(rename = "swn", default)]
    pub switch_names: Vec<Option<String>>,
    #[serde(rename = "btn", default)]
    pub buttons: Vec<u8>,
    #[serde(rename = "so", default)]
    pub options: BTreeMap<String, i64>,
    #[serde(rename = "lk", default)]
    pub link_rgb_ct: u8,
    #[serde(rename = "lt_st", default)]
    pub light_subtype: u8,
    #[serde(rename = "sho", default)]
    pub shutter_options: Vec<u8>,
    #[serde(rename = "sht", default)]
    pub shutter_tilt: Vec<Vec<i32>>,
    #[serde(rename = "bat", default)]
    pub battery: u8,
    #[serde(rename = "dslp", default)]
    pub deep_sleep: u8,
    pub ver: u8,
}

impl DiscoveryPayload {
    /// Parse and validate a config payload published for `mac`.
    pub fn parse(topic: &str, mac: &str, payload: &[u8]) -> Result<Self> {
        let parsed: Self = serde_json::from_slice(payload)
            .map_err(|e| BridgeError::malformed_payload(topic, e.to_string()))?;

        if parsed.ver != DISCOVERY_VERSION {
            return Err(BridgeError::malformed_payload(
                topic,
                format!("unsupported discovery version {}", parsed.ver),
            ));
        }
        if normalize_mac(&parsed.mac) != normalize_mac(mac) {
            return Err(BridgeError::malformed_payload(
                topic,
                format!("MAC {} does not match topic", parsed.mac),
            ));
        }
        if parsed.state.len() != 4 {
            return Err(BridgeError::malformed_payload(topic, "state must list 4 texts"));
        }
        if parsed.prefixes.len() != 3 {
            return Err(BridgeError::malformed_payload(topic, "tp must list 3 prefixes"));
        }
        if parsed.topic.is_empty() {
            return Err(BridgeError::malformed_payload(topic, "empty device topic"));
        }
        Ok(parsed)
    }

    /// SetOption value, 0 when not reported.
    pub fn option(&self, n: &str) -> i64 {
        self.options.get(n).copied().unwrap_or(0)
    }

    pub fn friendly_name(&self, idx: usize) -> String {
        match self.friendly_names.get(idx) {
            Some(Some(name)) if !name.is_empty() => name.clone(),
            _ => {
                let first = self
                    .friendly_names
                    .first()
                    .cloned()
                    .flatten()
                    .unwrap_or_else(|| self.device_name.clone());
                format!("{} {}", first, idx + 1)
            }
        }
    }

    /// `Switch<n>` unless renamed through `SwitchText`.
    pub fn switch_name(&self, idx: usize) -> String {
        match self.switch_names.get(idx) {
            Some(Some(name)) if !name.is_empty() => name.clone(),
            _ => format!("Switch{}", idx + 1),
        }
    }
}

/// `<discovery_prefix>/<MAC>/sensors`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorDiscoveryPayload {
    #[serde(rename = "sn")]
    pub sensors: Map<String, Value>,
    pub ver: u8,
}

impl SensorDiscoveryPayload {
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self> {
        let parsed: Self = serde_json::from_slice(payload)
            .map_err(|e| BridgeError::malformed_payload(topic, e.to_string()))?;
        if parsed.ver != DISCOVERY_VERSION {
            return Err(BridgeError::malformed_payload(
                topic,
                format!("unsupported discovery version {}", parsed.ver),
            ));
        }
        Ok(parsed)
    }
}

/// A state or telemetry body: a JSON object, or a bare value such as the
/// `ON` published on `stat/<topic>/POWER1`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Object(Map<String, Value>),
    Scalar(Value),
}

impl Payload {
    pub fn parse(topic: &str, bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| BridgeError::malformed_payload(topic, "invalid utf-8"))?
            .trim();

        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(Self::Object(map)),
            Ok(other) => Ok(Self::Scalar(other)),
            Err(_) if text.starts_with('{') => {
                Err(BridgeError::malformed_payload(topic, "truncated JSON object"))
            }
            Err(_) => Ok(Self::Scalar(Value::String(text.to_string()))),
        }
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            Self::Scalar(_) => None,
        }
    }
}

/// Walk objects by key and arrays by numeric index.
pub fn value_by_path<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    path.iter().try_fold(value, |node, key| {
        let key = key.as_ref();
        match node {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::plug_config;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_discovery() {
        let bytes = serde_json::to_vec(&plug_config()).unwrap();
        let parsed = DiscoveryPayload::parse("t", "A4CF12AB34CD", &bytes).unwrap();
        assert_eq!(parsed.device_name, "Kitchen Plug");
        assert_eq!(parsed.relays, vec![1, 0, 0, 0]);
        assert_eq!(parsed.option("30"), 0);
        assert_eq!(parsed.option("999"), 0);
        assert_eq!(parsed.friendly_name(0), "Kitchen");
        assert_eq!(parsed.friendly_name(1), "Kitchen 2");
        assert_eq!(parsed.switch_name(0), "Switch1");
    }

    #[test]
    fn test_parse_discovery_rejects() {
        let bytes = serde_json::to_vec(&plug_config()).unwrap();
        assert!(DiscoveryPayload::parse("t", "000000000000", &bytes).is_err());

        let mut bad = plug_config();
        bad["ver"] = json!(2);
        assert!(DiscoveryPayload::parse("t", "A4CF12AB34CD", &serde_json::to_vec(&bad).unwrap()).is_err());

        let mut bad = plug_config();
        bad["state"] = json!(["OFF", "ON"]);
        assert!(DiscoveryPayload::parse("t", "A4CF12AB34CD", &serde_json::to_vec(&bad).unwrap()).is_err());

        assert!(DiscoveryPayload::parse("t", "A4CF12AB34CD", b"{not json").is_err());
    }

    #[test]
    fn test_state_payloads() {
        assert_eq!(Payload::parse("t", b"ON").unwrap(), Payload::Scalar(json!("ON")));
        assert_eq!(Payload::parse("t", b" 42 ").unwrap(), Payload::Scalar(json!(42)));
        let obj = Payload::parse("t", br#"{"POWER1":"ON"}"#).unwrap();
        assert_eq!(obj.as_object().unwrap()["POWER1"], json!("ON"));
        assert!(Payload::parse("t", br#"{"POWER1":"#).is_err());
        assert!(Payload::parse("t", &[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_value_by_path() {
        let v = json!({"ENERGY": {"TotalTariff": [0.1, 0.2]}, "Wifi": {"RSSI": 80}});
        assert_eq!(value_by_path(&v, &["Wifi", "RSSI"]), Some(&json!(80)));
        assert_eq!(value_by_path(&v, &["ENERGY", "TotalTariff", "1"]), Some(&json!(0.2)));
        assert_eq!(value_by_path(&v, &["ENERGY", "Missing"]), None);
        let empty: [&str; 0] = [];
        assert_eq!(value_by_path(&v, &empty), Some(&v));
    }
}
