//! Topic codec for Tasmota's MQTT conventions
//!
//! Two grammars share the broker:
//! - `<discovery_prefix>/<MAC>/config` and `<discovery_prefix>/<MAC>/sensors`
//! - the device full topic, `%prefix%/%topic%/<suffix>` by default, where
//!   `%prefix%` is one of the command/stat/tele prefixes
//!
//! `%hostname%` and `%id%` (last six MAC digits) are also accepted in
//! custom full topics.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

pub const DEFAULT_DISCOVERY_PREFIX: &str = "tasmota/discovery";
pub const DEFAULT_FULL_TOPIC: &str = "%prefix%/%topic%/";

const TOKEN_PREFIX: &str = "%prefix%";
const TOKEN_TOPIC: &str = "%topic%";
const TOKEN_HOSTNAME: &str = "%hostname%";
const TOKEN_ID: &str = "%id%";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Discovery,
    Command,
    State,
    Telemetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryKind {
    Config,
    Sensors,
}

impl DiscoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Sensors => "sensors",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "config" => Some(Self::Config),
            "sensors" => Some(Self::Sensors),
            _ => None,
        }
    }
}

/// A decoded topic. For discovery topics `root` is the discovery prefix and
/// `device` the MAC; otherwise `root` is the command/stat/tele prefix and
/// `device` the `%topic%` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub class: MessageClass,
    pub root: String,
    pub device: String,
    pub suffix: String,
}

impl ParsedTopic {
    pub fn discovery_kind(&self) -> Option<DiscoveryKind> {
        if self.class != MessageClass::Discovery {
            return None;
        }
        DiscoveryKind::parse(&self.suffix)
    }
}

/// The three `%prefix%` values (`tp` in the discovery payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefixes {
    pub command: String,
    pub state: String,
    pub telemetry: String,
}

impl Default for Prefixes {
    fn default() -> Self {
        Self {
            command: "cmnd".to_string(),
            state: "stat".to_string(),
            telemetry: "tele".to_string(),
        }
    }
}

impl Prefixes {
    pub fn from_list(tp: &[String]) -> Option<Self> {
        match tp {
            [command, state, telemetry] => Some(Self {
                command: command.clone(),
                state: state.clone(),
                telemetry: telemetry.clone(),
            }),
            _ => None,
        }
    }

    pub fn get(&self, class: MessageClass) -> Option<&str> {
        match class {
            MessageClass::Command => Some(&self.command),
            MessageClass::State => Some(&self.state),
            MessageClass::Telemetry => Some(&self.telemetry),
            MessageClass::Discovery => None,
        }
    }

    pub fn class_of(&self, prefix: &str) -> Option<MessageClass> {
        if prefix == self.command {
            Some(MessageClass::Command)
        } else if prefix == self.state {
            Some(MessageClass::State)
        } else if prefix == self.telemetry {
            Some(MessageClass::Telemetry)
        } else {
            None
        }
    }
}

/// A full-topic template bound to one device's hostname and MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTopic {
    template: String,
    hostname: Option<String>,
    id: Option<String>,
}

impl Default for FullTopic {
    fn default() -> Self {
        Self::new(DEFAULT_FULL_TOPIC)
    }
}

impl FullTopic {
    /// Tasmota appends a trailing `/` when the template lacks one.
    pub fn new(template: &str) -> Self {
        let mut template = template.to_string();
        if !template.ends_with('/') {
            template.push('/');
        }
        Self {
            template,
            hostname: None,
            id: None,
        }
    }

    pub fn with_identity(mut self, hostname: &str, mac: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self.id = Some(mac_id(mac));
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn render(&self, prefix: &str, topic: &str, suffix: &str) -> String {
        let mut out = self
            .template
            .replace(TOKEN_PREFIX, prefix)
            .replace(TOKEN_TOPIC, topic);
        if let Some(hostname) = &self.hostname {
            out = out.replace(TOKEN_HOSTNAME, hostname);
        }
        if let Some(id) = &self.id {
            out = out.replace(TOKEN_ID, id);
        }
        out.push_str(suffix);
        out
    }

    /// Split a concrete topic into `(prefix, topic, suffix)`.
    ///
    /// `%prefix%` and `%topic%` must occupy whole levels. Identity tokens
    /// match their bound value, or any single level when unbound.
    pub fn split(&self, full: &str) -> Option<(String, String, String)> {
        let pattern: Vec<&str> = self.template.trim_end_matches('/').split('/').collect();
        let levels: Vec<&str> = full.split('/').collect();
        if levels.len() <= pattern.len() {
            return None;
        }

        let mut prefix = None;
        let mut topic = None;
        for (segment, level) in pattern.iter().zip(levels.iter()) {
            match *segment {
                TOKEN_PREFIX => prefix = Some(level.to_string()),
                TOKEN_TOPIC => topic = Some(level.to_string()),
                TOKEN_HOSTNAME if self.hostname.is_none() => {}
                TOKEN_ID if self.id.is_none() => {}
                literal => {
                    if literal.contains(TOKEN_PREFIX) || literal.contains(TOKEN_TOPIC) {
                        return None;
                    }
                    let mut expected = literal.to_string();
                    if let Some(hostname) = &self.hostname {
                        expected = expected.replace(TOKEN_HOSTNAME, hostname);
                    }
                    if let Some(id) = &self.id {
                        expected = expected.replace(TOKEN_ID, id);
                    }
                    if expected != *level {
                        return None;
                    }
                }
            }
        }

        let suffix = levels[pattern.len()..].join("/");
        if suffix.is_empty() || levels[..pattern.len()].iter().any(|l| l.is_empty()) {
            return None;
        }
        Some((prefix?, topic.unwrap_or_default(), suffix))
    }
}

/// Everything needed to render a device's outbound and inbound topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddressing {
    pub full_topic: FullTopic,
    pub topic: String,
    pub prefixes: Prefixes,
}

impl DeviceAddressing {
    pub fn topic_for(&self, class: MessageClass, suffix: &str) -> String {
        let prefix = self.prefixes.get(class).unwrap_or_default();
        self.full_topic.render(prefix, &self.topic, suffix)
    }

    pub fn command(&self, command: &str) -> String {
        self.topic_for(MessageClass::Command, command)
    }

    pub fn state(&self, suffix: &str) -> String {
        self.topic_for(MessageClass::State, suffix)
    }

    pub fn telemetry(&self, suffix: &str) -> String {
        self.topic_for(MessageClass::Telemetry, suffix)
    }

    pub fn lwt(&self) -> String {
        self.telemetry("LWT")
    }

    pub fn result(&self) -> String {
        self.state("RESULT")
    }

    pub fn status(&self, idx: u8) -> String {
        self.state(&format!("STATUS{}", idx))
    }

    /// The relay state topic, `POWER` for single-relay devices.
    pub fn power(&self, idx: u8, single_relay: bool) -> String {
        if single_relay && idx == 1 {
            self.state("POWER")
        } else {
            self.state(&format!("POWER{}", idx))
        }
    }

    pub fn decode(&self, topic: &str) -> Option<ParsedTopic> {
        let (prefix, device, suffix) = self.full_topic.split(topic)?;
        if device != self.topic {
            return None;
        }
        let class = self.prefixes.class_of(&prefix)?;
        Some(ParsedTopic {
            class,
            root: prefix,
            device,
            suffix,
        })
    }
}

/// Decodes and encodes topics for the default addressing scheme.
#[derive(Debug, Clone)]
pub struct TopicCodec {
    discovery_prefix: String,
    full_topic: FullTopic,
    prefixes: Prefixes,
}

impl TopicCodec {
    pub fn new(discovery_prefix: &str) -> Self {
        Self {
            discovery_prefix: discovery_prefix.trim_end_matches('/').to_string(),
            full_topic: FullTopic::default(),
            prefixes: Prefixes::default(),
        }
    }

    pub fn with_full_topic(mut self, full_topic: FullTopic, prefixes: Prefixes) -> Self {
        self.full_topic = full_topic;
        self.prefixes = prefixes;
        self
    }

    pub fn discovery_prefix(&self) -> &str {
        &self.discovery_prefix
    }

    /// Subscription filter covering every discovery topic.
    pub fn discovery_filter(&self) -> String {
        format!("{}/#", self.discovery_prefix)
    }

    pub fn discovery_topic(&self, mac: &str, kind: DiscoveryKind) -> String {
        format!("{}/{}/{}", self.discovery_prefix, mac, kind.as_str())
    }

    pub fn is_discovery_topic(&self, topic: &str) -> bool {
        topic
            .strip_prefix(&self.discovery_prefix)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn decode(&self, topic: &str) -> Result<ParsedTopic> {
        if self.is_discovery_topic(topic) {
            return self.decode_discovery(topic);
        }

        let (prefix, device, suffix) = self
            .full_topic
            .split(topic)
            .ok_or_else(|| BridgeError::malformed_topic(topic, "does not match full topic"))?;
        let class = self
            .prefixes
            .class_of(&prefix)
            .ok_or_else(|| BridgeError::malformed_topic(topic, format!("unknown prefix '{}'", prefix)))?;
        if device.is_empty() {
            return Err(BridgeError::malformed_topic(topic, "empty device topic"));
        }
        Ok(ParsedTopic {
            class,
            root: prefix,
            device,
            suffix,
        })
    }

    pub fn encode(&self, parsed: &ParsedTopic) -> String {
        match parsed.class {
            MessageClass::Discovery => {
                format!("{}/{}/{}", parsed.root, parsed.device, parsed.suffix)
            }
            _ => self
                .full_topic
                .render(&parsed.root, &parsed.device, &parsed.suffix),
        }
    }

    // ── Private helpers ──────────────────────────────────

    fn decode_discovery(&self, topic: &str) -> Result<ParsedTopic> {
        let rest = &topic[self.discovery_prefix.len() + 1..];
        let parts: Vec<&str> = rest.split('/').collect();
        let [mac, kind] = parts.as_slice() else {
            return Err(BridgeError::malformed_topic(
                topic,
                "expected <prefix>/<MAC>/<config|sensors>",
            ));
        };
        if !is_mac(mac) {
            return Err(BridgeError::malformed_topic(topic, format!("invalid MAC '{}'", mac)));
        }
        if DiscoveryKind::parse(kind).is_none() {
            return Err(BridgeError::malformed_topic(
                topic,
                format!("unknown discovery kind '{}'", kind),
            ));
        }
        Ok(ParsedTopic {
            class: MessageClass::Discovery,
            root: self.discovery_prefix.clone(),
            device: mac.to_string(),
            suffix: kind.to_string(),
        })
    }
}

/// Twelve hex digits, the way Tasmota formats MACs in discovery.
pub fn is_mac(s: &str) -> bool {
    s.len() == 12 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Upper-case a MAC and drop separators.
pub fn normalize_mac(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Value of `%id%`: the last six MAC digits.
pub fn mac_id(mac: &str) -> String {
    let mac = normalize_mac(mac);
    mac[mac.len().saturating_sub(6)..].to_string()
}

/// MQTT filter matching with `+` and `#` wildcards.
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
