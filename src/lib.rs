//! Tasmota devices over MQTT: discovery, a live device model, state sync
//! and guarded firmware upgrades.

pub mod bridge;
pub mod commands;
pub mod component;
pub mod config;
pub mod discovery;
pub mod entities;
pub mod error;
pub mod firmware;
pub mod model;
pub mod mqtt;
pub mod payload;
pub mod sync;
pub mod topic;
pub mod transport;
pub mod upgrade;

pub use bridge::Bridge;
pub use error::{BridgeError, Result};
