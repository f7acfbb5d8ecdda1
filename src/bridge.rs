//! Wires the transport to discovery, state sync and upgrades.
//!
//! Every inbound message is keyed to a MAC and handed to that MAC's worker.
//! Workers run one message at a time, so everything that changes one device
//! is serialized while different devices proceed concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::commands::{self, Command, Debouncer};
use crate::config::BridgeConfig;
use crate::discovery::{DiscoveryListener, DiscoveryOutcome, Transition};
use crate::error::{BridgeError, Result};
use crate::model::{DeviceModel, Metrics};
use crate::sync::{StateSynchronizer, SyncOutcome};
use crate::topic::{normalize_mac, TopicCodec};
use crate::transport::{InboundMessage, Transport};
use crate::upgrade::{UpgradeHandle, UpgradeOrchestrator};

pub struct Bridge {
    inner: Arc<Inner>,
    dispatcher: JoinHandle<()>,
}

struct Inner {
    model: Arc<DeviceModel>,
    discovery: DiscoveryListener,
    sync: StateSynchronizer,
    upgrades: UpgradeOrchestrator,
    transport: Arc<dyn Transport>,
    debouncer: Debouncer,
    /// One worker per MAC, kept for the life of the bridge
    workers: DashMap<String, mpsc::UnboundedSender<InboundMessage>>,
}

impl Bridge {
    /// Subscribe to discovery and start dispatching.
    pub async fn start(config: &BridgeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let model = Arc::new(DeviceModel::new(config.event_capacity));
        let firmware = Arc::new(config.firmware.clone());
        let codec = TopicCodec::new(&config.discovery_prefix);
        let filter = codec.discovery_filter();
        let inbound = transport
            .take_messages()
            .ok_or_else(|| BridgeError::Transport("message feed already taken".to_string()))?;

        let inner = Arc::new(Inner {
            discovery: DiscoveryListener::new(model.clone(), codec, firmware.clone()),
            sync: StateSynchronizer::new(model.clone(), firmware),
            upgrades: UpgradeOrchestrator::new(model.clone(), transport.clone(), config.upgrade_timeout()),
            debouncer: Debouncer::new(transport.clone(), config.debounce_window()),
            model,
            transport,
            workers: DashMap::new(),
        });

        let dispatcher = tokio::spawn(dispatch_loop(inner.clone(), inbound));
        if let Err(e) = inner.transport.subscribe(&filter).await {
            dispatcher.abort();
            return Err(e);
        }
        tracing::info!("Bridge: listening for discovery on {}", filter);

        Ok(Self { inner, dispatcher })
    }

    pub fn model(&self) -> Arc<DeviceModel> {
        self.inner.model.clone()
    }

    /// Publish a command built with [`crate::commands`].
    pub async fn send(&self, command: Command) -> Result<()> {
        tracing::debug!("Bridge: {} {}", command.topic, command.payload);
        self.inner
            .transport
            .publish(&command.topic, command.payload.as_bytes(), false)
            .await
    }

    /// Ask a device for its firmware version (`STATUS 2`).
    pub async fn query_firmware(&self, mac: &str) -> Result<()> {
        let device = self
            .inner
            .model
            .device(mac)
            .ok_or_else(|| BridgeError::UnknownDevice(mac.to_string()))?;
        self.send(commands::firmware_query(&device)).await
    }

    pub async fn request_upgrade(&self, mac: &str, url: Option<&str>) -> Result<UpgradeHandle> {
        self.inner.upgrades.request(mac, url).await
    }

    pub fn cancel_upgrade(&self, mac: &str) -> bool {
        self.inner.upgrades.cancel(mac)
    }

    /// Purge the retained discovery messages of `mac`. The broker echoes
    /// the empty payloads back, which removes the device.
    pub async fn clear_discovery(&self, mac: &str) -> Result<()> {
        let mac = normalize_mac(mac);
        for topic in self.inner.discovery.discovery_topics(&mac) {
            self.inner.transport.publish(&topic, b"", true).await?;
        }
        tracing::info!("Bridge: cleared discovery for {}", mac);
        Ok(())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.dispatcher.abort();
        // closing the worker channels ends the workers
        self.inner.workers.clear();
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut inbound: mpsc::Receiver<InboundMessage>) {
    while let Some(message) = inbound.recv().await {
        inner.dispatch(message);
    }
    tracing::error!("Bridge: inbound feed closed, dispatcher stopped");
}

async fn run_worker(inner: Arc<Inner>, mac: String, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
    tracing::debug!("Bridge: worker for {} started", mac);
    while let Some(message) = rx.recv().await {
        inner.handle(&mac, message).await;
    }
}

impl Inner {
    fn dispatch(self: &Arc<Self>, message: InboundMessage) {
        let codec = self.discovery.codec();
        let macs = if codec.is_discovery_topic(&message.topic) {
            match codec.decode(&message.topic) {
                Ok(parsed) => vec![normalize_mac(&parsed.device)],
                Err(e) => {
                    Metrics::count(&self.model.metrics.malformed_topics);
                    tracing::debug!("Bridge: {}", e);
                    return;
                }
            }
        } else {
            self.model.macs_for_topic(&message.topic)
        };

        if macs.is_empty() {
            Metrics::count(&self.model.metrics.soft_misses);
            tracing::debug!("Bridge: no device for {}", message.topic);
            return;
        }
        for mac in macs {
            if self.worker(&mac).send(message.clone()).is_err() {
                tracing::warn!("Bridge: worker for {} is gone", mac);
            }
        }
    }

    fn worker(self: &Arc<Self>, mac: &str) -> mpsc::UnboundedSender<InboundMessage> {
        self.workers
            .entry(mac.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_worker(self.clone(), mac.to_string(), rx));
                tx
            })
            .clone()
    }

    async fn handle(&self, mac: &str, message: InboundMessage) {
        if self.discovery.codec().is_discovery_topic(&message.topic) {
            // errors are counted and logged by the listener
            if let Ok(outcome) = self.discovery.process(&message.topic, &message.payload) {
                self.apply_discovery(outcome).await;
            }
            return;
        }

        match self.sync.apply(mac, &message.topic, &message.payload) {
            Ok(outcome) => self.apply_sync(mac, outcome),
            Err(e) if e.is_soft_miss() => {}
            Err(e) => tracing::warn!("Bridge: {} on {}: {}", mac, message.topic, e),
        }
    }

    async fn apply_discovery(&self, outcome: DiscoveryOutcome) {
        for topic in &outcome.unsubscribe {
            if let Err(e) = self.transport.unsubscribe(topic).await {
                tracing::warn!("Bridge: unsubscribe {} failed: {}", topic, e);
            }
        }
        for topic in &outcome.subscribe {
            if let Err(e) = self.transport.subscribe(topic).await {
                tracing::warn!("Bridge: subscribe {} failed: {}", topic, e);
            }
        }
        if outcome.transition == Transition::Removed && self.upgrades.cancel(&outcome.mac) {
            tracing::info!("Bridge: {} removed, upgrade cancelled", outcome.mac);
        }
        for poll in outcome.polls {
            self.debouncer.publish(poll);
        }
    }

    fn apply_sync(&self, mac: &str, outcome: SyncOutcome) {
        for poll in outcome.polls {
            self.debouncer.publish(poll);
        }
        if let Some(status) = &outcome.firmware {
            self.upgrades.on_version(mac, &status.build.raw);
        }
        if let Some(signal) = &outcome.upgrade {
            self.upgrades.on_signal(mac, signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentIndex, ComponentKey, ComponentKind, StateValue};
    use crate::model::{Availability, ModelEvent};
    use crate::payload::fixtures::plug_config;
    use crate::transport::MemoryTransport;
    use crate::upgrade::UpgradeState;
    use std::time::Duration;

    const MAC: &str = "A4CF12AB34CD";
    const CONFIG_TOPIC: &str = "tasmota/discovery/A4CF12AB34CD/config";

    /// Let every task run until idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn make_bridge() -> (Bridge, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let config = serde_json::to_vec(&plug_config()).unwrap();
        transport.inject(CONFIG_TOPIC, &config, true).await;

        let bridge = Bridge::start(&BridgeConfig::default(), transport.clone())
            .await
            .unwrap();
        settle().await;
        (bridge, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_state_and_polls() {
        let (bridge, transport) = make_bridge().await;
        let model = bridge.model();
        assert_eq!(model.device_count(), 1);
        assert!(model.routed_topics().contains(&"tele/kitchen/LWT".to_string()));

        transport.inject("tele/kitchen/LWT", b"Online", true).await;
        transport.inject("stat/kitchen/POWER", b"ON", false).await;
        settle().await;

        assert_eq!(model.device(MAC).unwrap().availability, Availability::Online);
        let relay = model
            .component(MAC, ComponentKind::Relay, ComponentIndex::Slot(1))
            .unwrap();
        assert_eq!(relay.state.value, StateValue::Relay { power: Some(true) });

        // polls from discovery and from coming online collapse
        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut status = transport.published_to("cmnd/kitchen/STATUS");
        status.sort();
        assert_eq!(status, vec!["1", "11", "2", "5"]);
        assert_eq!(transport.published_to("cmnd/kitchen/STATE"), vec![""]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_on_different_topics_apply_in_order() {
        let (bridge, transport) = make_bridge().await;
        let model = bridge.model();

        for _ in 0..20 {
            transport.inject("stat/kitchen/POWER", b"ON", false).await;
            transport.inject("stat/kitchen/RESULT", br#"{"POWER":"OFF"}"#, false).await;
            transport.inject("tele/kitchen/LWT", b"Offline", true).await;
            transport.inject("tele/kitchen/STATE", br#"{"POWER":"ON"}"#, false).await;
            transport.inject("tele/kitchen/LWT", b"Online", true).await;
        }
        settle().await;

        let device = model.device(MAC).unwrap();
        assert_eq!(device.availability, Availability::Online);
        let relay = model
            .component(MAC, ComponentKind::Relay, ComponentIndex::Slot(1))
            .unwrap();
        assert_eq!(relay.state.value, StateValue::Relay { power: Some(true) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovery_keeps_state() {
        let (bridge, transport) = make_bridge().await;
        let model = bridge.model();
        let mut events = model.subscribe();

        transport.inject("stat/kitchen/POWER", b"ON", false).await;
        let mut config = plug_config();
        config["dn"] = "Kitchen".into();
        transport
            .inject(CONFIG_TOPIC, &serde_json::to_vec(&config).unwrap(), true)
            .await;
        settle().await;

        let device = model.device(MAC).unwrap();
        assert_eq!(device.name, "Kitchen");
        let relay = device
            .component(&ComponentKey::slot(ComponentKind::Relay, 1))
            .unwrap();
        assert_eq!(relay.state.value, StateValue::Relay { power: Some(true) });

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], ModelEvent::StateChanged { .. }));
        assert!(matches!(seen.last(), Some(ModelEvent::DeviceUpdated { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_through_device_reports() {
        let (bridge, transport) = make_bridge().await;
        let model = bridge.model();

        let mut handle = bridge.request_upgrade(MAC, None).await.unwrap();
        assert_eq!(transport.published_to("cmnd/kitchen/Upgrade"), vec!["1"]);

        transport
            .inject(
                "stat/kitchen/RESULT",
                br#"{"Upgrade":"Version 13.2.0 from http://ota"}"#,
                false,
            )
            .await;
        settle().await;
        assert!(matches!(handle.state(), UpgradeState::InProgress { .. }));

        transport
            .inject(
                "stat/kitchen/STATUS2",
                br#"{"StatusFWR":{"Version":"13.2.0(tasmota)"}}"#,
                false,
            )
            .await;
        settle().await;
        assert_eq!(handle.wait().await, Ok(()));
        assert_eq!(model.device(MAC).unwrap().version(), Some("13.2.0(tasmota)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discovery_removes_device() {
        let (bridge, transport) = make_bridge().await;
        let model = bridge.model();
        let _handle = bridge.request_upgrade(MAC, None).await.unwrap();

        bridge.clear_discovery(MAC).await.unwrap();
        settle().await;

        assert_eq!(model.device_count(), 0);
        assert!(model.routed_topics().is_empty());
        assert!(transport.retained(CONFIG_TOPIC).is_none());
        assert!(!bridge.cancel_upgrade(MAC));

        transport.inject("stat/kitchen/POWER", b"ON", false).await;
        settle().await;
        assert!(model.device(MAC).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_with_zero_event_capacity() {
        let transport = Arc::new(MemoryTransport::new());
        let config = BridgeConfig {
            event_capacity: 0,
            ..BridgeConfig::default()
        };
        let bridge = Bridge::start(&config, transport.clone()).await.unwrap();
        let config = serde_json::to_vec(&plug_config()).unwrap();
        transport.inject(CONFIG_TOPIC, &config, true).await;
        settle().await;
        assert_eq!(bridge.model().device_count(), 1);

        // the feed belongs to the first bridge
        assert!(Bridge::start(&BridgeConfig::default(), transport).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_input_is_counted() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = Bridge::start(&BridgeConfig::default(), transport.clone())
            .await
            .unwrap();
        let model = bridge.model();

        transport.inject("tasmota/discovery/nonsense", b"{}", false).await;
        transport.inject(CONFIG_TOPIC, b"{\"ip\":", false).await;
        settle().await;
        assert_eq!(Metrics::get(&model.metrics.malformed_topics), 1);
        assert_eq!(Metrics::get(&model.metrics.malformed_payloads), 1);
        assert_eq!(model.device_count(), 0);

        // the worker survives a bad message
        let config = serde_json::to_vec(&plug_config()).unwrap();
        transport.inject(CONFIG_TOPIC, &config, true).await;
        settle().await;
        assert_eq!(model.device_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_query_firmware() {
        let (bridge, transport) = make_bridge().await;
        let device = bridge.model().device(MAC).unwrap();

        let cmd = commands::power(&device, &ComponentKey::slot(ComponentKind::Relay, 1), false).unwrap();
        bridge.send(cmd).await.unwrap();
        bridge.query_firmware(MAC).await.unwrap();

        assert_eq!(transport.published_to("cmnd/kitchen/POWER1"), vec!["OFF"]);
        assert!(transport
            .published_to("cmnd/kitchen/STATUS")
            .contains(&"2".to_string()));
        assert_eq!(
            bridge.query_firmware("000000000000").await,
            Err(BridgeError::UnknownDevice("000000000000".to_string()))
        );
    }
}
