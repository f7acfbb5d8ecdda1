//! Error types shared by every layer of the bridge.

use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Topic does not fit the discovery grammar or any known full topic
    #[error("malformed topic '{topic}': {reason}")]
    MalformedTopic { topic: String, reason: String },

    /// Payload could not be decoded for the topic it arrived on
    #[error("malformed payload on '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },

    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    #[error("unknown component {component} on device '{mac}'")]
    UnknownComponent { mac: String, component: String },

    #[error("device '{mac}' is not eligible for upgrade ({verdict})")]
    UpgradeIneligible { mac: String, verdict: String },

    #[error("an upgrade is already in progress for '{0}'")]
    UpgradeInProgress(String),

    #[error("upgrade of '{0}' timed out")]
    UpgradeTimedOut(String),

    #[error("upgrade of '{mac}' failed: {reason}")]
    UpgradeFailed { mac: String, reason: String },

    #[error("upgrade of '{0}' was cancelled")]
    UpgradeCancelled(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl BridgeError {
    pub fn malformed_topic(topic: &str, reason: impl Into<String>) -> Self {
        Self::MalformedTopic {
            topic: topic.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed_payload(topic: &str, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            topic: topic.to_string(),
            reason: reason.into(),
        }
    }

    /// Messages for devices or components we do not (yet) know about are
    /// dropped and counted rather than reported.
    pub fn is_soft_miss(&self) -> bool {
        matches!(self, Self::UnknownDevice(_) | Self::UnknownComponent { .. })
    }
}
