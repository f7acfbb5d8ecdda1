//! Outbound commands
//!
//! Every command is a publish on `cmnd/<topic>/<Command>` (rendered through
//! the device's full topic). Builders here only produce [`Command`] values;
//! the bridge publishes them, immediately or debounced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::component::{ComponentIndex, ComponentInfo, ComponentKey, ComponentKind};
use crate::error::{BridgeError, Result};
use crate::model::Device;
use crate::transport::Transport;

/// How long identical debounced publishes are held back.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Command {
    pub topic: String,
    pub payload: String,
}

impl Command {
    pub fn new(topic: String, payload: impl Into<String>) -> Self {
        Self {
            topic,
            payload: payload.into(),
        }
    }
}

pub fn power(device: &Device, key: &ComponentKey, on: bool) -> Result<Command> {
    let n = slot(device, key, &[ComponentKind::Relay, ComponentKind::Light])?;
    Ok(Command::new(
        device.addressing.command(&format!("POWER{}", n)),
        device.texts.text(on),
    ))
}

pub fn dimmer(device: &Device, key: &ComponentKey, level: u8) -> Result<Command> {
    slot(device, key, &[ComponentKind::Light])?;
    let dimmer_key = match device.component(key).map(|c| &c.info) {
        Some(ComponentInfo::Light(info)) => info.dimmer_key.clone(),
        _ => None,
    };
    let dimmer_key = dimmer_key.ok_or_else(|| unknown(device, key))?;
    Ok(Command::new(
        device.addressing.command(&dimmer_key),
        level.min(100).to_string(),
    ))
}

pub fn color_temp(device: &Device, key: &ComponentKey, mireds: u16) -> Result<Command> {
    let supported = matches!(
        device.component(key).map(|c| &c.info),
        Some(ComponentInfo::Light(info)) if info.color_temp
    );
    if !supported {
        return Err(unknown(device, key));
    }
    Ok(Command::new(device.addressing.command("CT"), mireds.to_string()))
}

pub fn fan_speed(device: &Device, speed: u8) -> Result<Command> {
    let key = ComponentKey::named(ComponentKind::Fan, "ifan");
    if device.component(&key).is_none() {
        return Err(unknown(device, &key));
    }
    Ok(Command::new(
        device.addressing.command("FanSpeed"),
        speed.min(3).to_string(),
    ))
}

pub fn shutter_open(device: &Device, n: u8) -> Result<Command> {
    shutter_command(device, n, "ShutterOpen", String::new())
}

pub fn shutter_close(device: &Device, n: u8) -> Result<Command> {
    shutter_command(device, n, "ShutterClose", String::new())
}

pub fn shutter_stop(device: &Device, n: u8) -> Result<Command> {
    shutter_command(device, n, "ShutterStop", String::new())
}

/// `position` is 0 (closed) to 100 (open) as seen by the caller.
pub fn shutter_position(device: &Device, n: u8, position: u8) -> Result<Command> {
    let (inverted, _, _) = shutter_info(device, n)?;
    let position = position.min(100);
    let position = if inverted { 100 - position } else { position };
    shutter_command(device, n, "ShutterPosition", position.to_string())
}

/// `tilt` is 0 to 100, mapped onto the shutter's tilt range.
pub fn shutter_tilt(device: &Device, n: u8, tilt: u8) -> Result<Command> {
    let (_, tilt_min, tilt_max) = shutter_info(device, n)?;
    let range = (tilt_max - tilt_min) as f64;
    let value = (tilt_min as f64 + tilt.min(100) as f64 * range / 100.0).round() as i64;
    shutter_command(device, n, "ShutterTilt", value.to_string())
}

pub fn status(device: &Device, idx: u8) -> Command {
    Command::new(device.addressing.command("STATUS"), idx.to_string())
}

pub fn firmware_query(device: &Device) -> Command {
    status(device, 2)
}

/// `Upgrade 1` upgrades from the device's configured OTA URL; a given URL
/// is set through `OtaUrl` first.
pub fn upgrade(device: &Device, url: Option<&str>) -> Vec<Command> {
    let mut commands = Vec::new();
    if let Some(url) = url {
        commands.push(Command::new(device.addressing.command("OtaUrl"), url));
    }
    commands.push(Command::new(device.addressing.command("Upgrade"), "1"));
    commands
}

/// Several commands in one `Backlog` publish, without inter-command delay.
pub fn backlog(device: &Device, commands: &[(&str, &str)]) -> Command {
    let payload = commands
        .iter()
        .map(|(cmd, val)| format!("NoDelay;{} {}", cmd, val))
        .collect::<Vec<_>>()
        .join(";");
    Command::new(device.addressing.command("Backlog"), payload)
}

// ── Private helpers ──────────────────────────────────

fn unknown(device: &Device, key: &ComponentKey) -> BridgeError {
    BridgeError::UnknownComponent {
        mac: device.mac.clone(),
        component: key.to_string(),
    }
}

fn slot(device: &Device, key: &ComponentKey, kinds: &[ComponentKind]) -> Result<u8> {
    match (&key.index, device.component(key)) {
        (ComponentIndex::Slot(n), Some(_)) if kinds.contains(&key.kind) => Ok(*n),
        _ => Err(unknown(device, key)),
    }
}

fn shutter_info(device: &Device, n: u8) -> Result<(bool, i32, i32)> {
    let key = ComponentKey::slot(ComponentKind::Shutter, n);
    match device.component(&key).map(|c| &c.info) {
        Some(ComponentInfo::Shutter {
            inverted,
            tilt_min,
            tilt_max,
            ..
        }) => Ok((*inverted, *tilt_min, *tilt_max)),
        _ => Err(unknown(device, &key)),
    }
}

fn shutter_command(device: &Device, n: u8, command: &str, payload: String) -> Result<Command> {
    shutter_info(device, n)?;
    Ok(Command::new(
        device.addressing.command(&format!("{}{}", command, n)),
        payload,
    ))
}

/// Collapses identical publishes: each new copy restarts the window and only
/// the last one goes out.
pub struct Debouncer {
    transport: Arc<dyn Transport>,
    window: Duration,
    /// Timer per command, tagged with the generation that started it
    pending: Arc<DashMap<Command, (u64, JoinHandle<()>)>>,
    generation: AtomicU64,
}

impl Debouncer {
    pub fn new(transport: Arc<dyn Transport>, window: Duration) -> Self {
        Self {
            transport,
            window,
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, command: Command) {
        let transport = self.transport.clone();
        let pending = self.pending.clone();
        let window = self.window;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        // the shard stays locked until the new timer is recorded
        let entry = self.pending.entry(command.clone());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            settle(&pending, &command, generation);
            tracing::debug!("publish_debounced: {} {}", command.topic, command.payload);
            if let Err(e) = transport
                .publish(&command.topic, command.payload.as_bytes(), false)
                .await
            {
                tracing::warn!("Debounced publish to {} failed: {}", command.topic, e);
            }
        });

        match entry {
            Entry::Occupied(mut occupied) => {
                let (_, previous) = occupied.insert((generation, handle));
                previous.abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert((generation, handle));
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Drop the timer of `generation` unless a newer copy replaced it.
fn settle(pending: &DashMap<Command, (u64, JoinHandle<()>)>, command: &Command, generation: u64) {
    pending.remove_if(command, |_, (current, _)| *current == generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::make_device;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn shutter_device() -> Device {
        make_device(json!({
            "rl": [3, 3, 0, 0],
            "sho": [1, 0, 0, 0],
            "sht": [[-90, 90, 5], [0, 0, 0], [0, 0, 0], [0, 0, 0]],
        }))
    }

    #[test]
    fn test_power() {
        let device = make_device(json!({}));
        let cmd = power(&device, &ComponentKey::slot(ComponentKind::Relay, 1), true).unwrap();
        assert_eq!(cmd.topic, "cmnd/kitchen/POWER1");
        assert_eq!(cmd.payload, "ON");

        let err = power(&device, &ComponentKey::slot(ComponentKind::Relay, 2), true).unwrap_err();
        assert!(err.is_soft_miss());
    }

    #[test]
    fn test_shutter_commands() {
        let device = shutter_device();
        assert_eq!(shutter_open(&device, 1).unwrap().topic, "cmnd/kitchen/ShutterOpen1");
        assert_eq!(shutter_stop(&device, 1).unwrap().payload, "");

        // inverted shutter
        let cmd = shutter_position(&device, 1, 30).unwrap();
        assert_eq!(cmd.topic, "cmnd/kitchen/ShutterPosition1");
        assert_eq!(cmd.payload, "70");

        let cmd = shutter_tilt(&device, 1, 50).unwrap();
        assert_eq!(cmd.payload, "0");

        assert!(shutter_open(&device, 2).is_err());
    }

    #[test]
    fn test_upgrade_and_backlog() {
        let device = make_device(json!({}));
        let cmds = upgrade(&device, None);
        assert_eq!(cmds, vec![Command::new("cmnd/kitchen/Upgrade".into(), "1")]);

        let cmds = upgrade(&device, Some("http://ota.example/tasmota.bin.gz"));
        assert_eq!(cmds[0].topic, "cmnd/kitchen/OtaUrl");
        assert_eq!(cmds[1].topic, "cmnd/kitchen/Upgrade");

        let cmd = backlog(&device, &[("Power1", "ON"), ("Dimmer", "50")]);
        assert_eq!(cmd.topic, "cmnd/kitchen/Backlog");
        assert_eq!(cmd.payload, "NoDelay;Power1 ON;NoDelay;Dimmer 50");

        assert_eq!(firmware_query(&device), Command::new("cmnd/kitchen/STATUS".into(), "2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_duplicates() {
        let transport = Arc::new(MemoryTransport::new());
        let debouncer = Debouncer::new(transport.clone(), DEBOUNCE_WINDOW);
        let cmd = Command::new("cmnd/kitchen/STATUS".into(), "10");

        debouncer.publish(cmd.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.publish(cmd.clone());
        debouncer.publish(Command::new("cmnd/kitchen/STATUS".into(), "11"));
        assert_eq!(debouncer.pending(), 2);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let published = transport.published();
        assert_eq!(published.len(), 2);
        assert!(published.iter().filter(|m| m.payload == b"10").count() == 1);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_timer_keeps_newer_copy() {
        let transport = Arc::new(MemoryTransport::new());
        let debouncer = Debouncer::new(transport.clone(), DEBOUNCE_WINDOW);
        let cmd = Command::new("cmnd/kitchen/STATUS".into(), "10");

        debouncer.publish(cmd.clone());
        debouncer.publish(cmd.clone());
        // the first timer finishing late must not drop the second
        settle(&debouncer.pending, &cmd, 0);
        assert_eq!(debouncer.pending(), 1);

        debouncer.publish(cmd.clone());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(transport.published_to("cmnd/kitchen/STATUS"), vec!["10"]);
        assert_eq!(debouncer.pending(), 0);
    }
}
