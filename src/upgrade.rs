//! Firmware upgrade sessions.
//!
//! One session per device at a time. A session is a `watch` channel whose
//! value only moves forward: once terminal, every further transition is
//! rejected, so the timeout task, progress reports and `cancel` can race
//! without coordination.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::commands;
use crate::error::{BridgeError, Result};
use crate::firmware::UpdateVerdict;
use crate::model::DeviceModel;
use crate::sync::UpgradeSignal;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Verdict at request time, `None` when no version was known
    Ineligible(Option<UpdateVerdict>),
    Cancelled,
    /// Failure reported by the device
    Device(String),
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeState {
    Requested,
    Commanded,
    InProgress { message: String },
    Succeeded,
    Failed(FailureReason),
    TimedOut,
}

impl UpgradeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::TimedOut)
    }

    fn outcome(&self, mac: &str) -> Result<()> {
        match self {
            Self::Succeeded => Ok(()),
            Self::TimedOut => Err(BridgeError::UpgradeTimedOut(mac.to_string())),
            Self::Failed(FailureReason::Cancelled) => Err(BridgeError::UpgradeCancelled(mac.to_string())),
            Self::Failed(FailureReason::Ineligible(verdict)) => Err(BridgeError::UpgradeIneligible {
                mac: mac.to_string(),
                verdict: verdict.map_or_else(|| "unknown firmware".to_string(), |v| v.to_string()),
            }),
            Self::Failed(FailureReason::Device(reason)) | Self::Failed(FailureReason::Transport(reason)) => {
                Err(BridgeError::UpgradeFailed {
                    mac: mac.to_string(),
                    reason: reason.clone(),
                })
            }
            _ => Err(BridgeError::UpgradeFailed {
                mac: mac.to_string(),
                reason: "session ended before completion".to_string(),
            }),
        }
    }
}

struct Session {
    id: Uuid,
    /// Firmware version when the upgrade was requested
    from_version: Option<String>,
    tx: watch::Sender<UpgradeState>,
}

impl Session {
    fn new(from_version: Option<String>) -> Self {
        let (tx, _) = watch::channel(UpgradeState::Requested);
        Self {
            id: Uuid::new_v4(),
            from_version,
            tx,
        }
    }

    fn state(&self) -> UpgradeState {
        self.tx.borrow().clone()
    }

    fn is_terminal(&self) -> bool {
        self.tx.borrow().is_terminal()
    }

    /// Move to `next`. False when the session already ended or is there.
    /// A progress report always notifies, repeated or not.
    fn advance(&self, next: UpgradeState) -> bool {
        self.tx.send_if_modified(|state| {
            let progress = matches!(next, UpgradeState::InProgress { .. });
            if state.is_terminal() || (*state == next && !progress) {
                return false;
            }
            *state = next;
            true
        })
    }

    fn handle(&self, mac: &str) -> UpgradeHandle {
        UpgradeHandle {
            id: self.id,
            mac: mac.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

/// Caller's view of one upgrade session.
#[derive(Debug, Clone)]
pub struct UpgradeHandle {
    id: Uuid,
    mac: String,
    rx: watch::Receiver<UpgradeState>,
}

impl UpgradeHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn state(&self) -> UpgradeState {
        self.rx.borrow().clone()
    }

    /// Wait for the session to end and map its terminal state to a result.
    pub async fn wait(&mut self) -> Result<()> {
        let ended = self
            .rx
            .wait_for(UpgradeState::is_terminal)
            .await
            .map(|state| state.clone());
        let state = match ended {
            Ok(state) => state,
            Err(_) => self.rx.borrow().clone(),
        };
        state.outcome(&self.mac)
    }
}

pub struct UpgradeOrchestrator {
    model: Arc<DeviceModel>,
    transport: Arc<dyn Transport>,
    sessions: Arc<DashMap<String, Arc<Session>>>,
    timeout: Duration,
}

impl UpgradeOrchestrator {
    pub fn new(model: Arc<DeviceModel>, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            model,
            transport,
            sessions: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Start an upgrade of `mac`, optionally from `url` instead of the
    /// device's configured OTA URL.
    pub async fn request(&self, mac: &str, url: Option<&str>) -> Result<UpgradeHandle> {
        self.ensure_idle(mac)?;
        let device = self
            .model
            .device(mac)
            .ok_or_else(|| BridgeError::UnknownDevice(mac.to_string()))?;

        let session = Arc::new(Session::new(device.version().map(String::from)));
        let handle = session.handle(mac);
        {
            let mut entry = self
                .sessions
                .entry(mac.to_string())
                .or_insert_with(|| session.clone());
            if !Arc::ptr_eq(entry.value(), &session) {
                if !entry.is_terminal() {
                    return Err(BridgeError::UpgradeInProgress(mac.to_string()));
                }
                *entry = session.clone();
            }
        }

        let verdict = device.verdict();
        if device.version().is_none() || !verdict.is_some_and(|v| v.is_eligible()) {
            tracing::info!(
                "Upgrade: refusing {} ({})",
                mac,
                verdict.map_or_else(|| "unknown firmware".to_string(), |v| v.to_string())
            );
            session.advance(UpgradeState::Failed(FailureReason::Ineligible(verdict)));
            self.finish(mac, &session);
            return Ok(handle);
        }

        for command in commands::upgrade(&device, url) {
            if session.is_terminal() {
                tracing::info!("Upgrade: {} cancelled before {} was sent", mac, command.topic);
                self.finish(mac, &session);
                return Ok(handle);
            }
            if let Err(e) = self
                .transport
                .publish(&command.topic, command.payload.as_bytes(), false)
                .await
            {
                tracing::warn!("Upgrade: publishing {} failed: {}", command.topic, e);
                session.advance(UpgradeState::Failed(FailureReason::Transport(e.to_string())));
                self.finish(mac, &session);
                return Ok(handle);
            }
        }

        if session.advance(UpgradeState::Commanded) {
            tracing::info!(
                "Upgrade: {} commanded from {} (session {})",
                mac,
                device.version().unwrap_or("?"),
                session.id
            );
            self.spawn_timeout(mac, session);
        } else {
            // cancelled while publishing
            self.finish(mac, &session);
        }
        Ok(handle)
    }

    /// Progress reported in the device's RESULT.
    pub fn on_signal(&self, mac: &str, signal: &UpgradeSignal) {
        let Some(session) = self.active(mac) else {
            tracing::debug!("Upgrade: {:?} from {} with no session", signal, mac);
            return;
        };
        let next = match signal {
            UpgradeSignal::Progress(message) => UpgradeState::InProgress {
                message: message.clone(),
            },
            UpgradeSignal::Succeeded(_) => UpgradeState::Succeeded,
            UpgradeSignal::Failed(message) => UpgradeState::Failed(FailureReason::Device(message.clone())),
        };
        self.transition(mac, &session, next);
    }

    /// A firmware version report. A version other than the one at request
    /// time means the device rebooted into new firmware.
    pub fn on_version(&self, mac: &str, version: &str) {
        let Some(session) = self.active(mac) else {
            return;
        };
        let waiting = matches!(
            session.state(),
            UpgradeState::Commanded | UpgradeState::InProgress { .. }
        );
        if waiting && session.from_version.as_deref() != Some(version) {
            self.transition(mac, &session, UpgradeState::Succeeded);
        }
    }

    /// Returns false when no session was active. Published commands are
    /// not undone.
    pub fn cancel(&self, mac: &str) -> bool {
        match self.active(mac) {
            Some(session) => self.transition(mac, &session, UpgradeState::Failed(FailureReason::Cancelled)),
            None => false,
        }
    }

    pub fn state(&self, mac: &str) -> Option<UpgradeState> {
        self.sessions.get(mac).map(|s| s.state())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| !s.is_terminal()).count()
    }

    // ── Private helpers ──────────────────────────────────

    fn ensure_idle(&self, mac: &str) -> Result<()> {
        match self.sessions.get(mac) {
            Some(session) if !session.is_terminal() => Err(BridgeError::UpgradeInProgress(mac.to_string())),
            _ => Ok(()),
        }
    }

    fn active(&self, mac: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(mac)
            .map(|s| s.value().clone())
            .filter(|s| !s.is_terminal())
    }

    fn transition(&self, mac: &str, session: &Arc<Session>, next: UpgradeState) -> bool {
        let moved = session.advance(next);
        if moved {
            tracing::info!("Upgrade: {} is {:?}", mac, session.state());
        }
        if session.is_terminal() {
            self.finish(mac, session);
        }
        moved
    }

    fn finish(&self, mac: &str, session: &Session) {
        self.sessions.remove_if(mac, |_, s| s.id == session.id);
    }

    /// Time the session out when nothing moves it for `timeout`. Each
    /// transition restarts the window.
    fn spawn_timeout(&self, mac: &str, session: Arc<Session>) {
        let sessions = self.sessions.clone();
        let timeout = self.timeout;
        let mac = mac.to_string();
        let mut rx = session.tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        if session.advance(UpgradeState::TimedOut) {
                            tracing::warn!("Upgrade: {} timed out after {}s", mac, timeout.as_secs());
                        }
                        break;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || rx.borrow_and_update().is_terminal() {
                            break;
                        }
                    }
                }
            }
            sessions.remove_if(&mac, |_, s| s.id == session.id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::VariantTable;
    use crate::model::fixtures::make_device;
    use crate::transport::{MemoryTransport, MessageStream};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    const MAC: &str = "A4CF12AB34CD";
    const TIMEOUT: Duration = Duration::from_secs(300);

    fn make_orchestrator(overrides: Value) -> (UpgradeOrchestrator, Arc<MemoryTransport>) {
        let model = Arc::new(DeviceModel::new(16));
        model.upsert(make_device(overrides));
        let transport = Arc::new(MemoryTransport::new());
        (
            UpgradeOrchestrator::new(model, transport.clone(), TIMEOUT),
            transport,
        )
    }

    /// Takes a second per publish.
    struct SlowTransport(Arc<MemoryTransport>);

    #[async_trait]
    impl Transport for SlowTransport {
        fn take_messages(&self) -> Option<MessageStream> {
            self.0.take_messages()
        }

        async fn subscribe(&self, filter: &str) -> Result<()> {
            self.0.subscribe(filter).await
        }

        async fn unsubscribe(&self, filter: &str) -> Result<()> {
            self.0.unsubscribe(filter).await
        }

        async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.0.publish(topic, payload, retain).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_succeeds() {
        let (orchestrator, transport) = make_orchestrator(json!({}));
        let mut handle = orchestrator.request(MAC, None).await.unwrap();

        assert_eq!(handle.state(), UpgradeState::Commanded);
        assert_eq!(transport.published_to("cmnd/kitchen/Upgrade"), vec!["1"]);

        orchestrator.on_signal(MAC, &UpgradeSignal::Progress("Version 13.2.0 from http://ota".into()));
        assert!(matches!(handle.state(), UpgradeState::InProgress { .. }));

        orchestrator.on_signal(MAC, &UpgradeSignal::Succeeded("Successful. Restarting".into()));
        assert!(handle.wait().await.is_ok());
        assert_eq!(orchestrator.active_sessions(), 0);
        assert!(orchestrator.state(MAC).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_with_url() {
        let (orchestrator, transport) = make_orchestrator(json!({}));
        orchestrator
            .request(MAC, Some("http://ota.local/tasmota.bin.gz"))
            .await
            .unwrap();
        let topics: Vec<String> = transport.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["cmnd/kitchen/OtaUrl", "cmnd/kitchen/Upgrade"]);
        assert_eq!(
            transport.published_to("cmnd/kitchen/OtaUrl"),
            vec!["http://ota.local/tasmota.bin.gz"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_rejected() {
        let (orchestrator, transport) = make_orchestrator(json!({}));
        let first = orchestrator.request(MAC, None).await.unwrap();

        let err = orchestrator.request(MAC, None).await.unwrap_err();
        assert_eq!(err, BridgeError::UpgradeInProgress(MAC.to_string()));
        assert_eq!(first.state(), UpgradeState::Commanded);
        assert_eq!(transport.published_to("cmnd/kitchen/Upgrade").len(), 1);

        let err = orchestrator.request("000000000000", None).await.unwrap_err();
        assert_eq!(err, BridgeError::UnknownDevice("000000000000".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ineligible_never_publishes() {
        for (sw, verdict) in [
            ("8.5.1(tasmota)", Some(UpdateVerdict::ExcludedLegacy)),
            ("12.5.0(tasmota-minimal)", Some(UpdateVerdict::ExcludedMinimal)),
            ("12.5.0(my-build)", Some(UpdateVerdict::ExcludedCustom)),
            ("", None),
        ] {
            let (orchestrator, transport) = make_orchestrator(json!({ "sw": sw }));
            let mut handle = orchestrator.request(MAC, None).await.unwrap();

            assert_eq!(
                handle.state(),
                UpgradeState::Failed(FailureReason::Ineligible(verdict)),
                "{}",
                sw
            );
            assert!(matches!(
                handle.wait().await,
                Err(BridgeError::UpgradeIneligible { .. })
            ));
            assert!(transport.published().is_empty());
            assert_eq!(orchestrator.active_sessions(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reset_by_progress() {
        let (orchestrator, _transport) = make_orchestrator(json!({}));
        let mut handle = orchestrator.request(MAC, None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(handle.state(), UpgradeState::Commanded);

        orchestrator.on_signal(MAC, &UpgradeSignal::Progress("Downloading".into()));
        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(matches!(handle.state(), UpgradeState::InProgress { .. }));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.state(), UpgradeState::TimedOut);
        assert_eq!(
            handle.wait().await,
            Err(BridgeError::UpgradeTimedOut(MAC.to_string()))
        );

        // terminal: late signals change nothing
        orchestrator.on_signal(MAC, &UpgradeSignal::Succeeded("Successful".into()));
        assert_eq!(handle.state(), UpgradeState::TimedOut);
        assert_eq!(orchestrator.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_progress_resets_timeout() {
        let (orchestrator, _transport) = make_orchestrator(json!({}));
        let handle = orchestrator.request(MAC, None).await.unwrap();

        orchestrator.on_signal(MAC, &UpgradeSignal::Progress("Downloading".into()));
        tokio::time::sleep(Duration::from_secs(250)).await;
        orchestrator.on_signal(MAC, &UpgradeSignal::Progress("Downloading".into()));

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(matches!(handle.state(), UpgradeState::InProgress { .. }));

        tokio::time::sleep(Duration::from_secs(201)).await;
        assert_eq!(handle.state(), UpgradeState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_publishing_stops_upgrade() {
        let model = Arc::new(DeviceModel::new(16));
        model.upsert(make_device(json!({})));
        let memory = Arc::new(MemoryTransport::new());
        let orchestrator = Arc::new(UpgradeOrchestrator::new(
            model,
            Arc::new(SlowTransport(memory.clone())),
            TIMEOUT,
        ));

        let requesting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.request(MAC, Some("http://ota.local/fw.bin.gz")).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(orchestrator.state(MAC), Some(UpgradeState::Requested));
        assert!(orchestrator.cancel(MAC));

        let mut handle = requesting.await.unwrap().unwrap();
        assert_eq!(
            handle.wait().await,
            Err(BridgeError::UpgradeCancelled(MAC.to_string()))
        );
        assert_eq!(memory.published_to("cmnd/kitchen/OtaUrl").len(), 1);
        assert!(memory.published_to("cmnd/kitchen/Upgrade").is_empty());
        assert_eq!(orchestrator.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_change_completes() {
        let (orchestrator, _transport) = make_orchestrator(json!({}));
        let mut handle = orchestrator.request(MAC, None).await.unwrap();

        orchestrator.on_version(MAC, "9.5.0(tasmota)");
        assert_eq!(handle.state(), UpgradeState::Commanded);

        orchestrator.on_version(MAC, "13.2.0(tasmota)");
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_failure() {
        let (orchestrator, _transport) = make_orchestrator(json!({}));
        let mut handle = orchestrator.request(MAC, None).await.unwrap();

        orchestrator.on_signal(MAC, &UpgradeSignal::Failed("Failed Not Enough Space".into()));
        let err = handle.wait().await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::UpgradeFailed {
                mac: MAC.to_string(),
                reason: "Failed Not Enough Space".to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_retry() {
        let (orchestrator, transport) = make_orchestrator(json!({}));
        let mut handle = orchestrator.request(MAC, None).await.unwrap();

        assert!(orchestrator.cancel(MAC));
        assert_eq!(handle.state(), UpgradeState::Failed(FailureReason::Cancelled));
        assert_eq!(
            handle.wait().await,
            Err(BridgeError::UpgradeCancelled(MAC.to_string()))
        );
        assert!(!orchestrator.cancel(MAC));

        // no timeout fires for a cancelled session
        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(handle.state(), UpgradeState::Failed(FailureReason::Cancelled));

        let retry = orchestrator.request(MAC, None).await.unwrap();
        assert_ne!(retry.id(), handle.id());
        assert_eq!(transport.published_to("cmnd/kitchen/Upgrade").len(), 2);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!UpgradeState::Requested.is_terminal());
        assert!(!UpgradeState::InProgress { message: "x".into() }.is_terminal());
        assert!(UpgradeState::TimedOut.is_terminal());
        assert!(UpgradeState::Failed(FailureReason::Cancelled).is_terminal());
        assert!(VariantTable::default().classify("9.5.0(tasmota)").verdict.is_eligible());
    }
}
