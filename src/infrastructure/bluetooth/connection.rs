//! BLE Connection Module
//!
//! Central-role lifecycle of the single watch link: scanning, peripheral
//! filtering, connect, pairing identity and bounded reconnection.

use crate::domain::device::{DeviceManager, KnownDevice};
use crate::domain::models::{
    AppEvent, ConnectionStatus, DeviceId, DiscoveredPeripheral, MessageSeverity, StatusMessage,
};
use crate::domain::settings::{ReconnectSettings, SettingsService};
use crate::infrastructure::bluetooth::platform::{BlePlatform, PlatformError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Bounded exponential backoff for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based), `None` once exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(
            self.base_delay
                .checked_mul(factor)
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting(DeviceId),
    Connected(DeviceId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Bluetooth adapter is not powered on")]
    AdapterUnavailable,
    #[error("{id} advertises as {name:?}, expected {expected}")]
    NameMismatch {
        id: DeviceId,
        name: Option<String>,
        expected: String,
    },
    #[error("already connecting to {0}")]
    Busy(DeviceId),
    #[error("device {0} is not known")]
    UnknownDevice(DeviceId),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Owns the connection state machine. At most one session is active at a time.
pub struct ConnectionSession {
    platform: Arc<dyn BlePlatform>,
    devices: Box<dyn DeviceManager>,
    settings: Arc<Mutex<SettingsService>>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    state: SessionState,
    adapter_powered: bool,
    pairing_new_device: bool,
    paired: Option<DeviceId>,
    expected_name: String,
    discovered: Vec<DiscoveredPeripheral>,
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ConnectionSession {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        devices: Box<dyn DeviceManager>,
        settings: Arc<Mutex<SettingsService>>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (paired, expected_name, policy) = match settings.lock() {
            Ok(s) => {
                let s = s.get();
                (
                    s.paired_device_id.clone(),
                    s.expected_device_name.clone(),
                    ReconnectPolicy::from_settings(&s.reconnect),
                )
            }
            Err(_) => {
                warn!("Settings lock poisoned, starting without a paired device");
                (
                    None,
                    crate::infrastructure::bluetooth::protocol::DEVICE_NAME.to_string(),
                    ReconnectPolicy::default(),
                )
            }
        };

        Self {
            platform,
            devices,
            settings,
            event_sender,
            state: SessionState::Idle,
            adapter_powered: false,
            pairing_new_device: false,
            paired,
            expected_name,
            discovered: Vec::new(),
            policy,
            attempts: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// True while a link to the watch is up.
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Connected(_))
    }

    pub fn connected_device(&self) -> Option<&DeviceId> {
        match &self.state {
            SessionState::Connected(id) => Some(id),
            _ => None,
        }
    }

    pub fn paired_device(&self) -> Option<&DeviceId> {
        self.paired.as_ref()
    }

    pub fn discovered(&self) -> &[DiscoveredPeripheral] {
        &self.discovered
    }

    pub fn devices(&self) -> &dyn DeviceManager {
        self.devices.as_ref()
    }

    pub fn devices_mut(&mut self) -> &mut dyn DeviceManager {
        self.devices.as_mut()
    }

    pub fn on_adapter_state(&mut self, powered_on: bool) {
        self.adapter_powered = powered_on;
        if !powered_on {
            warn!("Bluetooth adapter powered off");
            self.send_log("Bluetooth is off", MessageSeverity::Warning);
            if self.state == SessionState::Scanning {
                self.set_state(SessionState::Idle);
            }
            return;
        }

        info!("Bluetooth adapter powered on");
        if let Err(e) = self.start_scanning() {
            warn!("Could not start scanning after power on: {}", e);
        }
    }

    /// Reconnects to the paired watch, or scans when there is none to reach directly.
    pub fn start_scanning(&mut self) -> Result<(), SessionError> {
        if !self.adapter_powered {
            debug!("Adapter not powered, not scanning");
            return Err(SessionError::AdapterUnavailable);
        }
        if matches!(
            self.state,
            SessionState::Connecting(_) | SessionState::Connected(_)
        ) {
            return Ok(());
        }

        self.attempts = 0;
        self.reach_paired_or_scan()
    }

    /// Broad scan with a fresh discovered list.
    pub fn scan_for_new_devices(&mut self) -> Result<(), SessionError> {
        if !self.adapter_powered {
            return Err(SessionError::AdapterUnavailable);
        }
        self.discovered.clear();
        self.broad_scan()
    }

    pub fn stop_scanning(&mut self) -> Result<(), SessionError> {
        self.platform.stop_scan()?;
        if self.state == SessionState::Scanning {
            info!("Scan stopped");
            self.set_state(SessionState::Idle);
        }
        Ok(())
    }

    pub fn set_pairing_new_device(&mut self, enabled: bool) {
        debug!(enabled, "Pair new device mode");
        self.pairing_new_device = enabled;
    }

    pub fn on_peripheral_discovered(&mut self, peripheral: DiscoveredPeripheral) {
        if peripheral.name.as_deref() != Some(self.expected_name.as_str()) {
            trace!(id = %peripheral.id, name = ?peripheral.name, "Ignoring peripheral");
            return;
        }

        let known = self.devices.fetch_device(&peripheral.id).is_some();
        let listed = self.discovered.iter().any(|p| p.id == peripheral.id);
        if !listed && !(self.pairing_new_device && known) {
            info!(id = %peripheral.id, rssi = ?peripheral.rssi, "Discovered watch");
            self.discovered.push(peripheral.clone());
            let _ = self
                .event_sender
                .send(AppEvent::PeripheralDiscovered(peripheral.clone()));
        }

        let is_paired = self.paired.as_ref() == Some(&peripheral.id);
        let idle = matches!(self.state, SessionState::Idle | SessionState::Scanning);
        if is_paired && !self.pairing_new_device && idle {
            info!(id = %peripheral.id, "Paired watch in range, connecting");
            if let Err(e) = self.initiate(&peripheral.id) {
                warn!("Auto-connect failed: {}", e);
            }
        }
    }

    /// User intent to connect to a discovered peripheral.
    pub fn connect(&mut self, peripheral: &DiscoveredPeripheral) -> Result<(), SessionError> {
        if peripheral.name.as_deref() != Some(self.expected_name.as_str()) {
            return Err(SessionError::NameMismatch {
                id: peripheral.id.clone(),
                name: peripheral.name.clone(),
                expected: self.expected_name.clone(),
            });
        }
        self.attempts = 0;
        self.initiate(&peripheral.id)
    }

    /// Connect by identifier, resolving it from the scan results or the platform.
    pub fn connect_by_id(&mut self, id: &DeviceId) -> Result<(), SessionError> {
        let peripheral = self
            .discovered
            .iter()
            .find(|p| &p.id == id)
            .cloned()
            .or_else(|| self.platform.retrieve_peripheral(id))
            .ok_or_else(|| SessionError::UnknownDevice(id.clone()))?;
        self.connect(&peripheral)
    }

    /// Returns true when a new session started and per-connection state must be reset.
    pub fn on_connected(&mut self, id: DeviceId) -> bool {
        match &self.state {
            SessionState::Connected(current) if *current == id => {
                debug!(device = %id, "Duplicate connect notification");
                return false;
            }
            SessionState::Connected(previous) => {
                let previous = previous.clone();
                warn!(%previous, "Replacing active session");
                if let Err(e) = self.platform.cancel_connection(&previous) {
                    warn!("Failed to cancel previous connection: {}", e);
                }
            }
            _ => {}
        }

        info!(device = %id, "Connected");
        self.send_log("Connected to watch", MessageSeverity::Success);
        self.attempts = 0;
        self.pairing_new_device = false;
        self.set_state(SessionState::Connected(id.clone()));

        let name = self
            .discovered
            .iter()
            .find(|p| p.id == id)
            .and_then(|p| p.name.clone())
            .unwrap_or_else(|| self.expected_name.clone());
        self.devices.remember_device(KnownDevice::new(id.clone(), name));
        self.set_paired(Some(id.clone()));

        if let Err(e) = self.platform.discover_services(&id) {
            error!(device = %id, "Service discovery request failed: {}", e);
        }
        true
    }

    /// Returns the delay before the next attempt, if one should be made.
    pub fn on_connect_failed(&mut self, id: &DeviceId, error: &PlatformError) -> Option<Duration> {
        if self.state != SessionState::Connecting(id.clone()) {
            debug!(device = %id, "Stale connect failure");
            return None;
        }
        self.set_state(SessionState::Idle);

        if *error == PlatformError::BondRemoved {
            self.report_bond_removed();
            return None;
        }
        warn!(device = %id, "Connection failed: {}", error);
        self.schedule_retry()
    }

    /// Returns the delay before the next attempt, if one should be made.
    pub fn on_disconnected(
        &mut self,
        id: &DeviceId,
        error: Option<&PlatformError>,
    ) -> Option<Duration> {
        let ours = matches!(
            &self.state,
            SessionState::Connected(current) | SessionState::Connecting(current) if current == id
        );
        if !ours {
            trace!(device = %id, "Disconnect for inactive peripheral");
            return None;
        }
        self.set_state(SessionState::Idle);

        match error {
            None => {
                info!(device = %id, "Disconnected");
                None
            }
            Some(PlatformError::BondRemoved) => {
                self.report_bond_removed();
                None
            }
            Some(e) => {
                warn!(device = %id, "Connection lost: {}", e);
                self.send_log("Connection lost", MessageSeverity::Warning);
                if self.paired.as_ref() == Some(id) {
                    self.schedule_retry()
                } else {
                    None
                }
            }
        }
    }

    /// Next attempt of the reconnect cycle.
    pub fn reconnect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle || self.paired.is_none() {
            return Ok(());
        }
        if !self.adapter_powered {
            debug!("Adapter off, reconnect deferred to power on");
            return Ok(());
        }
        info!(attempt = self.attempts, "Reconnecting");
        self.reach_paired_or_scan()
    }

    /// A reconnect attempt that could not even be issued counts as a failed one.
    pub fn on_reconnect_error(&mut self, error: &SessionError) -> Option<Duration> {
        warn!("Reconnect attempt could not start: {}", error);
        if self.state != SessionState::Idle {
            return None;
        }
        self.schedule_retry()
    }

    /// Cancels the link or pending connect. Returns the device that was torn down.
    pub fn disconnect(&mut self) -> Result<Option<DeviceId>, SessionError> {
        match self.state.clone() {
            SessionState::Connected(id) | SessionState::Connecting(id) => {
                info!(device = %id, "Disconnecting");
                self.set_state(SessionState::Idle);
                self.platform.cancel_connection(&id)?;
                Ok(Some(id))
            }
            SessionState::Scanning => {
                self.stop_scanning()?;
                Ok(None)
            }
            SessionState::Idle => Ok(None),
        }
    }

    /// Forgets `target` (the paired device when `None`). Returns the device that was torn down.
    pub fn unpair(&mut self, target: Option<DeviceId>) -> Result<Option<DeviceId>, SessionError> {
        let Some(target) = target.or_else(|| self.paired.clone()) else {
            debug!("Nothing to unpair");
            return Ok(None);
        };
        info!(device = %target, "Unpairing");

        let current = match &self.state {
            SessionState::Connected(id) | SessionState::Connecting(id) => *id == target,
            _ => false,
        };

        self.devices.remove_device(&target);
        self.discovered.retain(|p| p.id != target);
        if self.paired.as_ref() == Some(&target) {
            let next = self.devices.fetch_all_devices().into_iter().next().map(|d| d.id);
            if let Some(next) = &next {
                info!(device = %next, "Promoting next known device");
            }
            self.set_paired(next);
        }

        if !current {
            return Ok(None);
        }
        let torn_down = self.disconnect()?;
        if let Err(e) = self.start_scanning() {
            warn!("Not scanning after unpair: {}", e);
        }
        Ok(torn_down)
    }

    /// Points the paired identifier at another known device and reconnects to it.
    pub fn switch_device(&mut self, id: DeviceId) -> Result<Option<DeviceId>, SessionError> {
        if self.devices.fetch_device(&id).is_none() {
            return Err(SessionError::UnknownDevice(id));
        }
        info!(device = %id, "Switching device");
        self.set_paired(Some(id));
        let torn_down = self.disconnect()?;
        if let Err(e) = self.start_scanning() {
            warn!("Not scanning after device switch: {}", e);
        }
        Ok(torn_down)
    }

    fn reach_paired_or_scan(&mut self) -> Result<(), SessionError> {
        if let Some(paired) = self.paired.clone().filter(|_| !self.pairing_new_device) {
            if self.platform.retrieve_peripheral(&paired).is_some() {
                info!(device = %paired, "Reconnecting to paired watch");
                return self.initiate(&paired);
            }
            debug!(device = %paired, "Paired watch not known to the platform, scanning");
        }
        self.broad_scan()
    }

    fn broad_scan(&mut self) -> Result<(), SessionError> {
        self.platform.start_scan()?;
        if matches!(self.state, SessionState::Idle | SessionState::Scanning) {
            info!("Scanning for watches");
            self.set_state(SessionState::Scanning);
        }
        Ok(())
    }

    fn initiate(&mut self, id: &DeviceId) -> Result<(), SessionError> {
        match &self.state {
            SessionState::Connecting(pending) if pending == id => return Ok(()),
            SessionState::Connecting(pending) => return Err(SessionError::Busy(pending.clone())),
            SessionState::Connected(current) if current == id => return Ok(()),
            SessionState::Connected(current) => {
                let current = current.clone();
                info!(%current, "Leaving current watch");
                self.platform.cancel_connection(&current)?;
                self.set_state(SessionState::Idle);
            }
            SessionState::Scanning => {
                if let Err(e) = self.platform.stop_scan() {
                    debug!("Stopping scan before connect failed: {}", e);
                }
            }
            SessionState::Idle => {}
        }
        if !self.adapter_powered {
            return Err(SessionError::AdapterUnavailable);
        }

        info!(device = %id, "Connecting");
        self.platform.connect(id)?;
        self.set_state(SessionState::Connecting(id.clone()));
        Ok(())
    }

    fn schedule_retry(&mut self) -> Option<Duration> {
        let paired = self.paired.clone()?;
        match self.policy.delay_for(self.attempts) {
            Some(delay) => {
                self.attempts += 1;
                info!(
                    device = %paired,
                    attempt = self.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                Some(delay)
            }
            None => {
                error!(device = %paired, attempts = self.attempts, "Giving up on reconnecting");
                let _ = self.event_sender.send(AppEvent::ReconnectGaveUp(paired));
                None
            }
        }
    }

    fn report_bond_removed(&self) {
        error!("Watch removed its pairing information");
        let _ = self.event_sender.send(AppEvent::UserError(
            "The watch forgot this pairing. Remove it from the system Bluetooth settings and pair again."
                .to_string(),
        ));
    }

    fn set_paired(&mut self, id: Option<DeviceId>) {
        if self.paired == id {
            return;
        }
        self.paired = id.clone();
        match self.settings.lock() {
            Ok(mut settings) => {
                if let Err(e) = settings.set_paired_device(id.clone()) {
                    warn!("Failed to persist paired device: {}", e);
                }
            }
            Err(_) => warn!("Settings lock poisoned, paired device not persisted"),
        }
        let _ = self.event_sender.send(AppEvent::PairedDeviceChanged(id));
    }

    fn set_state(&mut self, state: SessionState) {
        let status = match &state {
            SessionState::Idle => ConnectionStatus::Disconnected,
            SessionState::Scanning => ConnectionStatus::Scanning,
            SessionState::Connecting(_) => ConnectionStatus::Connecting,
            SessionState::Connected(_) => ConnectionStatus::Connected,
        };
        if self.state != state {
            self.state = state;
            let _ = self.event_sender.send(AppEvent::ConnectionStatus(status));
        }
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::SettingsDeviceManager;
    use crate::infrastructure::bluetooth::test_support::{peripheral, PlatformCall, RecordingPlatform};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        platform: Arc<RecordingPlatform>,
        settings: Arc<Mutex<SettingsService>>,
        events: mpsc::UnboundedReceiver<AppEvent>,
        session: ConnectionSession,
    }

    fn fixture_with(platform: RecordingPlatform, paired: Option<&str>, known: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut service = SettingsService::with_path(dir.path().join("settings.json")).unwrap();
        service.get_mut().paired_device_id = paired.map(DeviceId::new);
        for id in known {
            service
                .add_known_device(KnownDevice::new(DeviceId::new(*id), "InfiniTime"))
                .unwrap();
        }
        let settings = Arc::new(Mutex::new(service));
        let platform = Arc::new(platform);
        let (tx, events) = mpsc::unbounded_channel();
        let devices = Box::new(SettingsDeviceManager::new(settings.clone()));
        let mut session = ConnectionSession::new(platform.clone(), devices, settings.clone(), tx);
        session.adapter_powered = true;
        Fixture {
            _dir: dir,
            platform,
            settings,
            events,
            session,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingPlatform::new(), None, &[])
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn connect_and_accept(f: &mut Fixture, id: &str) {
        f.session.connect(&peripheral(id, Some("InfiniTime"))).unwrap();
        assert!(f.session.on_connected(DeviceId::new(id)));
    }

    #[test]
    fn test_policy_backoff_is_bounded_and_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_for(6), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_for(9), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_for(10), None);
    }

    #[test]
    fn test_adapter_off_is_a_no_op() {
        let mut f = fixture();
        f.session.adapter_powered = false;
        assert_eq!(
            f.session.start_scanning(),
            Err(SessionError::AdapterUnavailable)
        );
        assert!(f.platform.calls().is_empty());
        assert_eq!(f.session.state(), &SessionState::Idle);
    }

    #[test]
    fn test_power_on_starts_scanning() {
        let mut f = fixture();
        f.session.adapter_powered = false;
        f.session.on_adapter_state(true);
        assert_eq!(f.platform.take_calls(), vec![PlatformCall::StartScan]);
        assert_eq!(f.session.state(), &SessionState::Scanning);
    }

    #[test]
    fn test_paired_watch_is_reconnected_directly() {
        let platform = RecordingPlatform::with_known(vec![peripheral("w1", Some("InfiniTime"))]);
        let mut f = fixture_with(platform, Some("w1"), &["w1"]);
        f.session.start_scanning().unwrap();
        assert_eq!(
            f.platform.take_calls(),
            vec![PlatformCall::Connect(DeviceId::new("w1"))]
        );
    }

    #[test]
    fn test_unretrievable_paired_watch_falls_back_to_scan() {
        let mut f = fixture_with(RecordingPlatform::new(), Some("w1"), &["w1"]);
        f.session.start_scanning().unwrap();
        assert_eq!(f.platform.take_calls(), vec![PlatformCall::StartScan]);

        // The paired watch shows up in the scan and is connected automatically.
        f.session
            .on_peripheral_discovered(peripheral("w1", Some("InfiniTime")));
        assert_eq!(
            f.session.state(),
            &SessionState::Connecting(DeviceId::new("w1"))
        );
    }

    #[test]
    fn test_only_expected_name_is_listed_or_connected() {
        let mut f = fixture();
        f.session.start_scanning().unwrap();
        f.session.on_peripheral_discovered(peripheral("a", Some("Pinetime")));
        f.session.on_peripheral_discovered(peripheral("b", None));
        f.session.on_peripheral_discovered(peripheral("c", Some("InfiniTime")));
        f.session.on_peripheral_discovered(peripheral("c", Some("InfiniTime")));

        assert_eq!(f.session.discovered().len(), 1);
        assert_eq!(f.session.discovered()[0].id, DeviceId::new("c"));
        assert!(matches!(
            f.session.connect(&peripheral("a", Some("Pinetime"))),
            Err(SessionError::NameMismatch { .. })
        ));
        assert!(!f
            .platform
            .calls()
            .iter()
            .any(|c| matches!(c, PlatformCall::Connect(_))));
    }

    #[test]
    fn test_pairing_new_device_hides_known_watches() {
        let mut f = fixture_with(RecordingPlatform::new(), Some("old"), &["old"]);
        f.session.set_pairing_new_device(true);
        f.session.scan_for_new_devices().unwrap();
        f.session
            .on_peripheral_discovered(peripheral("old", Some("InfiniTime")));
        f.session
            .on_peripheral_discovered(peripheral("new", Some("InfiniTime")));

        let ids: Vec<_> = f.session.discovered().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
        // No auto-connect to the paired watch while pairing a new one.
        assert_eq!(f.session.state(), &SessionState::Scanning);
    }

    #[test]
    fn test_concurrent_connect_is_rejected() {
        let mut f = fixture();
        f.session
            .connect(&peripheral("a", Some("InfiniTime")))
            .unwrap();
        assert_eq!(
            f.session.connect(&peripheral("b", Some("InfiniTime"))),
            Err(SessionError::Busy(DeviceId::new("a")))
        );
        // Same target again is fine.
        f.session
            .connect(&peripheral("a", Some("InfiniTime")))
            .unwrap();
        let connects = f
            .platform
            .calls()
            .into_iter()
            .filter(|c| matches!(c, PlatformCall::Connect(_)))
            .count();
        assert_eq!(connects, 1);
    }

    #[test]
    fn test_connected_persists_pairing_and_discovers() {
        let mut f = fixture();
        connect_and_accept(&mut f, "w1");

        assert!(f.session.is_active());
        assert_eq!(
            f.settings.lock().unwrap().get().paired_device_id,
            Some(DeviceId::new("w1"))
        );
        assert!(f.session.devices().fetch_device(&DeviceId::new("w1")).is_some());
        assert!(f
            .platform
            .calls()
            .contains(&PlatformCall::DiscoverServices(DeviceId::new("w1"))));
        assert!(drain(&mut f.events)
            .iter()
            .any(|e| matches!(e, AppEvent::ConnectionStatus(ConnectionStatus::Connected))));
    }

    #[test]
    fn test_single_active_session() {
        let mut f = fixture();
        connect_and_accept(&mut f, "a");
        f.platform.take_calls();

        // A connection to another watch cancels the current link first.
        f.session.connect_by_id(&DeviceId::new("b")).unwrap_err();
        f.session
            .connect(&peripheral("b", Some("InfiniTime")))
            .unwrap();
        assert_eq!(
            f.platform.take_calls(),
            vec![
                PlatformCall::CancelConnection(DeviceId::new("a")),
                PlatformCall::Connect(DeviceId::new("b"))
            ]
        );
        assert_eq!(f.session.state(), &SessionState::Connecting(DeviceId::new("b")));
        assert!(f.session.on_connected(DeviceId::new("b")));
        assert_eq!(f.session.connected_device(), Some(&DeviceId::new("b")));

        // The late disconnect of the old link does not end the new session.
        let retry = f
            .session
            .on_disconnected(&DeviceId::new("a"), Some(&PlatformError::LinkLost));
        assert_eq!(retry, None);
        assert!(f.session.is_active());
        assert!(!f.session.on_connected(DeviceId::new("b")));
    }

    #[test]
    fn test_unexpected_disconnect_retries_until_exhausted() {
        let platform = RecordingPlatform::with_known(vec![peripheral("w1", Some("InfiniTime"))]);
        let mut f = fixture_with(platform, None, &[]);
        connect_and_accept(&mut f, "w1");
        let id = DeviceId::new("w1");

        let delay = f.session.on_disconnected(&id, Some(&PlatformError::LinkLost));
        assert_eq!(delay, Some(Duration::from_secs(1)));

        let mut delays = vec![delay.unwrap()];
        for _ in 0..20 {
            f.session.reconnect().unwrap();
            match f.session.on_connect_failed(&id, &PlatformError::LinkLost) {
                Some(d) => delays.push(d),
                None => break,
            }
        }
        assert_eq!(delays.len(), 10);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(drain(&mut f.events)
            .iter()
            .any(|e| matches!(e, AppEvent::ReconnectGaveUp(d) if d == &id)));
    }

    #[test]
    fn test_requested_disconnect_does_not_retry() {
        let mut f = fixture();
        connect_and_accept(&mut f, "w1");
        assert_eq!(f.session.disconnect().unwrap(), Some(DeviceId::new("w1")));
        assert_eq!(f.session.state(), &SessionState::Idle);
        assert_eq!(f.session.on_disconnected(&DeviceId::new("w1"), None), None);
    }

    #[test]
    fn test_bond_removed_is_a_user_error_without_retry() {
        let mut f = fixture();
        f.session
            .connect(&peripheral("w1", Some("InfiniTime")))
            .unwrap();
        let retry = f
            .session
            .on_connect_failed(&DeviceId::new("w1"), &PlatformError::BondRemoved);
        assert_eq!(retry, None);
        assert!(drain(&mut f.events)
            .iter()
            .any(|e| matches!(e, AppEvent::UserError(_))));
    }

    #[test]
    fn test_unpair_only_device_clears_pairing_and_rescans() {
        let mut f = fixture();
        connect_and_accept(&mut f, "w1");
        f.platform.take_calls();

        let torn = f.session.unpair(None).unwrap();
        assert_eq!(torn, Some(DeviceId::new("w1")));
        assert_eq!(f.session.paired_device(), None);
        assert_eq!(f.settings.lock().unwrap().get().paired_device_id, None);
        assert_eq!(
            f.platform.take_calls(),
            vec![
                PlatformCall::CancelConnection(DeviceId::new("w1")),
                PlatformCall::StartScan
            ]
        );
    }

    #[test]
    fn test_unpair_promotes_next_known_device() {
        let mut f = fixture_with(RecordingPlatform::new(), Some("a"), &["a", "b"]);
        assert_eq!(f.session.unpair(None).unwrap(), None);
        assert_eq!(f.session.paired_device(), Some(&DeviceId::new("b")));
        assert!(f.session.devices().fetch_device(&DeviceId::new("a")).is_none());
        assert!(drain(&mut f.events)
            .iter()
            .any(|e| matches!(e, AppEvent::PairedDeviceChanged(Some(id)) if id.as_str() == "b")));
    }

    #[test]
    fn test_switch_device_targets_new_watch() {
        let platform = RecordingPlatform::with_known(vec![peripheral("b", Some("InfiniTime"))]);
        let mut f = fixture_with(platform, None, &["a", "b"]);
        connect_and_accept(&mut f, "a");
        f.platform.take_calls();

        assert_eq!(
            f.session.switch_device(DeviceId::new("b")).unwrap(),
            Some(DeviceId::new("a"))
        );
        assert_eq!(
            f.platform.take_calls(),
            vec![
                PlatformCall::CancelConnection(DeviceId::new("a")),
                PlatformCall::Connect(DeviceId::new("b"))
            ]
        );
        assert_eq!(
            f.session.switch_device(DeviceId::new("zzz")),
            Err(SessionError::UnknownDevice(DeviceId::new("zzz")))
        );
    }

    #[test]
    fn test_pending_reconnect_yields_to_another_watch() {
        let platform = RecordingPlatform::with_known(vec![
            peripheral("a", Some("InfiniTime")),
            peripheral("b", Some("InfiniTime")),
            peripheral("c", Some("InfiniTime")),
        ]);
        let mut f = fixture_with(platform, Some("a"), &["a", "b"]);
        f.session.start_scanning().unwrap();
        assert_eq!(f.session.state(), &SessionState::Connecting(DeviceId::new("a")));
        f.platform.take_calls();

        // A known watch takes over through a device switch.
        assert_eq!(
            f.session.switch_device(DeviceId::new("b")).unwrap(),
            Some(DeviceId::new("a"))
        );
        assert_eq!(f.session.state(), &SessionState::Connecting(DeviceId::new("b")));

        // An unknown one is busy until the pending attempt is dropped.
        assert_eq!(
            f.session.connect_by_id(&DeviceId::new("c")),
            Err(SessionError::Busy(DeviceId::new("b")))
        );
        f.session.disconnect().unwrap();
        f.session.set_pairing_new_device(true);
        f.session.connect_by_id(&DeviceId::new("c")).unwrap();
        assert_eq!(f.session.state(), &SessionState::Connecting(DeviceId::new("c")));
    }
}
