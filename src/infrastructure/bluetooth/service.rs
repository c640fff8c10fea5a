//! Bluetooth Service Module
//!
//! Single owner of the link. Every platform callback and every caller intent is
//! handled here, one at a time: the session, the characteristic bindings, the
//! BLEFS queue and the DFU transfer have no other writer.

use crate::domain::device::{DeviceInfoField, DeviceManager, KnownDevice};
use crate::domain::firmware::{self, FirmwareImage};
use crate::domain::models::{
    AppEvent, ConnectionStatus, DeviceId, DeviceUpdate, DiscoveredPeripheral, MessageSeverity,
    StatusMessage,
};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::blefs::{BlefsError, BlefsQueue, FsRequest, FsResponse, QueueOutput};
use crate::infrastructure::bluetooth::connection::{ConnectionSession, SessionError};
use crate::infrastructure::bluetooth::dfu::{DfuError, DfuStep, DfuTarget, DfuTransfer};
use crate::infrastructure::bluetooth::dispatcher::{DispatchError, Dispatcher, Routed};
use crate::infrastructure::bluetooth::platform::{BleEvent, BlePlatform, PlatformError, WriteKind};
use crate::infrastructure::bluetooth::protocol::CharacteristicRole;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub type Reply<T> = oneshot::Sender<T>;

/// Caller intents, answered through their oneshot reply.
pub enum BluetoothCommand {
    StartScan(Reply<Result<(), SessionError>>),
    ScanForNewDevices(Reply<Result<(), SessionError>>),
    StopScan(Reply<Result<(), SessionError>>),
    SetPairingNewDevice(bool),
    Discovered(Reply<Vec<DiscoveredPeripheral>>),
    KnownDevices(Reply<Vec<KnownDevice>>),
    Connect(DeviceId, Reply<Result<(), SessionError>>),
    Disconnect(Reply<Result<(), SessionError>>),
    Unpair(Option<DeviceId>, Reply<Result<(), SessionError>>),
    SwitchDevice(DeviceId, Reply<Result<(), SessionError>>),
    Filesystem {
        request: FsRequest,
        reply: Reply<Result<FsResponse, BlefsError>>,
    },
    /// Replies once the update has completed or failed.
    StartDfu {
        image: FirmwareImage,
        reply: Reply<Result<(), DfuError>>,
    },
    Write {
        role: CharacteristicRole,
        payload: Vec<u8>,
        reply: Reply<Result<(), DispatchError>>,
    },
    IsReady(Reply<bool>),
}

pub struct BluetoothService {
    session: ConnectionSession,
    dispatcher: Dispatcher,
    blefs: BlefsQueue,
    dfu: Option<(DfuTransfer, Reply<Result<(), DfuError>>)>,
    packets_per_receipt: u8,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    ready: bool,
    reconnect_at: Option<Instant>,
}

impl BluetoothService {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        devices: Box<dyn DeviceManager>,
        settings: Arc<Mutex<SettingsService>>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (chunk_size, packets_per_receipt) = settings
            .lock()
            .map(|s| (s.get().blefs_chunk_size, s.get().dfu_packets_per_receipt))
            .unwrap_or((
                crate::infrastructure::bluetooth::blefs::DEFAULT_CHUNK_SIZE,
                crate::infrastructure::bluetooth::dfu::DEFAULT_PACKETS_PER_RECEIPT,
            ));

        Self {
            session: ConnectionSession::new(
                platform.clone(),
                devices,
                settings,
                event_sender.clone(),
            ),
            dispatcher: Dispatcher::new(platform),
            blefs: BlefsQueue::new(chunk_size),
            dfu: None,
            packets_per_receipt,
            event_sender,
            ready: false,
            reconnect_at: None,
        }
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    /// Current time resolved on an active session.
    pub fn is_ready(&self) -> bool {
        self.dispatcher.is_ready(self.session.is_active())
    }

    /// When the next reconnect attempt is due.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Event loop. Ends when either channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<BluetoothCommand>,
        mut events: mpsc::UnboundedReceiver<BleEvent>,
    ) {
        info!("Bluetooth service started");
        loop {
            let deadline = self.reconnect_at;
            let reconnect = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            // Platform callbacks already queued are handled before new intents.
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Bluetooth backend closed its event channel");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = reconnect => {
                    self.reconnect_at = None;
                    if let Err(e) = self.session.reconnect() {
                        let delay = self.session.on_reconnect_error(&e);
                        self.schedule_reconnect(delay);
                    }
                }
            }
        }

        if let Ok(Some(_)) = self.session.disconnect() {
            self.teardown();
        }
        info!("Bluetooth service stopped");
    }

    pub fn handle_event(&mut self, event: BleEvent) {
        match event {
            BleEvent::AdapterStateChanged { powered_on } => {
                if powered_on {
                    self.reconnect_at = None;
                }
                self.session.on_adapter_state(powered_on);
            }
            BleEvent::PeripheralDiscovered(peripheral) => {
                self.session.on_peripheral_discovered(peripheral);
            }
            BleEvent::Connected(id) => {
                if self.session.on_connected(id) {
                    self.reconnect_at = None;
                    self.teardown();
                }
            }
            BleEvent::ConnectFailed { id, error } => {
                let delay = self.session.on_connect_failed(&id, &error);
                self.schedule_reconnect(delay);
            }
            BleEvent::Disconnected { id, error } => {
                let was_active = self.session.connected_device() == Some(&id);
                let delay = self.session.on_disconnected(&id, error.as_ref());
                if was_active {
                    self.teardown();
                }
                self.schedule_reconnect(delay);
            }
            BleEvent::ServicesDiscovered { id, services } => match services {
                Ok(services) => self.dispatcher.on_services_discovered(&id, &services),
                Err(e) => {
                    error!(device = %id, "Service discovery failed: {}", e);
                    self.send_log("Could not read the watch's services", MessageSeverity::Error);
                }
            },
            BleEvent::CharacteristicsDiscovered {
                service,
                characteristics,
            } => {
                if !self.session.is_active() {
                    trace!(%service, "Characteristics for an inactive session");
                    return;
                }
                self.dispatcher
                    .on_characteristics_discovered(service, &characteristics);
                self.update_readiness();
            }
            BleEvent::ValueUpdated {
                characteristic,
                value,
            } => self.on_value(characteristic, &value),
            BleEvent::WriteCompleted {
                characteristic,
                result,
            } => {
                if let Err(e) = result {
                    self.on_write_failed(characteristic, e);
                }
            }
        }
    }

    pub fn handle_command(&mut self, command: BluetoothCommand) {
        match command {
            BluetoothCommand::StartScan(reply) => {
                let _ = reply.send(self.session.start_scanning());
            }
            BluetoothCommand::ScanForNewDevices(reply) => {
                let _ = reply.send(self.session.scan_for_new_devices());
            }
            BluetoothCommand::StopScan(reply) => {
                let _ = reply.send(self.session.stop_scanning());
            }
            BluetoothCommand::SetPairingNewDevice(enabled) => {
                self.session.set_pairing_new_device(enabled);
            }
            BluetoothCommand::Discovered(reply) => {
                let _ = reply.send(self.session.discovered().to_vec());
            }
            BluetoothCommand::KnownDevices(reply) => {
                let _ = reply.send(self.session.devices().fetch_all_devices());
            }
            BluetoothCommand::Connect(id, reply) => {
                self.reconnect_at = None;
                let leaving = self.session.connected_device().cloned();
                let result = self.session.connect_by_id(&id);
                // Connecting elsewhere drops the current link right away.
                if leaving.is_some() && self.session.connected_device() != leaving.as_ref() {
                    self.teardown();
                }
                let _ = reply.send(result);
            }
            BluetoothCommand::Disconnect(reply) => {
                self.reconnect_at = None;
                let result = self.session.disconnect();
                let _ = reply.send(self.after_teardown(result));
            }
            BluetoothCommand::Unpair(target, reply) => {
                let result = self.session.unpair(target);
                let _ = reply.send(self.after_teardown(result));
            }
            BluetoothCommand::SwitchDevice(id, reply) => {
                self.reconnect_at = None;
                let result = self.session.switch_device(id);
                let _ = reply.send(self.after_teardown(result));
            }
            BluetoothCommand::Filesystem { request, reply } => self.submit_fs(request, reply),
            BluetoothCommand::StartDfu { image, reply } => self.start_dfu(image, reply),
            BluetoothCommand::Write {
                role,
                payload,
                reply,
            } => {
                let result = if self.is_ready() {
                    self.dispatcher
                        .write(role, &payload, WriteKind::WithResponse)
                } else {
                    Err(DispatchError::NotReady)
                };
                let _ = reply.send(result);
            }
            BluetoothCommand::IsReady(reply) => {
                let _ = reply.send(self.is_ready());
            }
        }
    }

    fn after_teardown(
        &mut self,
        result: Result<Option<DeviceId>, SessionError>,
    ) -> Result<(), SessionError> {
        if let Ok(Some(_)) = &result {
            self.teardown();
        }
        result.map(|_| ())
    }

    /// Clears every per-connection cache; in-flight operations end with the link.
    fn teardown(&mut self) {
        self.dispatcher.reset();
        self.blefs.fail_all(BlefsError::ConnectionLost);
        if let Some((transfer, _)) = self.dfu.as_mut() {
            let step = transfer.on_disconnected();
            self.apply_dfu(step);
        }
        self.update_readiness();
    }

    fn schedule_reconnect(&mut self, delay: Option<Duration>) {
        if let Some(delay) = delay {
            self.reconnect_at = Some(Instant::now() + delay);
        }
    }

    fn update_readiness(&mut self) {
        let ready = self.is_ready();
        if ready == self.ready {
            return;
        }
        self.ready = ready;
        if ready {
            info!("Watch ready");
            let _ = self
                .event_sender
                .send(AppEvent::ConnectionStatus(ConnectionStatus::Ready));
        }
    }

    fn on_value(&mut self, characteristic: Uuid, value: &[u8]) {
        match self.dispatcher.route(characteristic, value) {
            Routed::Info(field, text) => {
                if field == DeviceInfoField::Firmware && firmware::is_recovery_mode(&text) {
                    warn!(firmware = %text, "Watch is running recovery firmware");
                    self.send_log(
                        "The watch is in recovery mode, install a firmware update",
                        MessageSeverity::Warning,
                    );
                }
                self.publish_update(DeviceUpdate::Info(field, text));
            }
            Routed::Device(update) => self.publish_update(update),
            Routed::Music(event) => {
                debug!(?event, "Music control");
                let _ = self.event_sender.send(AppEvent::MusicEvent(event));
            }
            Routed::Blefs(frame) => {
                let output = self.blefs.on_notification(&frame);
                self.apply_blefs(output);
            }
            Routed::Dfu(frame) => match self.dfu.as_mut() {
                Some((transfer, _)) => {
                    let step = transfer.on_control_point(&frame);
                    self.apply_dfu(step);
                }
                None => debug!("DFU notification without an update running"),
            },
            Routed::Ignored => {}
        }
    }

    fn publish_update(&mut self, update: DeviceUpdate) {
        if let Some(id) = self.session.connected_device().cloned() {
            self.session.devices_mut().apply_update(&id, &update);
        }
        let _ = self.event_sender.send(AppEvent::DeviceUpdate(update));
    }

    fn on_write_failed(&mut self, characteristic: Uuid, error: PlatformError) {
        match self.dispatcher.registry().role_of(&characteristic) {
            Some(CharacteristicRole::BlefsTransfer) => {
                let output = self.blefs.abort_active(BlefsError::Transport(error.to_string()));
                self.apply_blefs(output);
            }
            Some(CharacteristicRole::DfuControlPoint | CharacteristicRole::DfuPacket) => {
                if let Some((transfer, _)) = self.dfu.as_mut() {
                    let step = transfer.abort(DfuError::Transport(error.to_string()));
                    self.apply_dfu(step);
                }
            }
            role => debug!(?role, "Write failed: {}", error),
        }
    }

    fn submit_fs(&mut self, request: FsRequest, reply: Reply<Result<FsResponse, BlefsError>>) {
        if !self.is_ready() {
            let _ = reply.send(Err(BlefsError::NotReady));
            return;
        }
        if !self.dispatcher.registry().has(CharacteristicRole::BlefsTransfer) {
            let _ = reply.send(Err(BlefsError::Unsupported));
            return;
        }
        let output = self.blefs.submit(request, reply);
        self.apply_blefs(output);
    }

    fn apply_blefs(&mut self, mut output: QueueOutput) {
        loop {
            for progress in output.progress.drain(..) {
                let _ = self.event_sender.send(AppEvent::FsProgress(progress));
            }
            let Some(frame) = output.send.take() else {
                break;
            };
            match self.dispatcher.write(
                CharacteristicRole::BlefsTransfer,
                &frame,
                WriteKind::WithResponse,
            ) {
                Ok(()) => break,
                Err(e) => {
                    output = self.blefs.abort_active(BlefsError::Transport(e.to_string()));
                }
            }
        }
    }

    fn start_dfu(&mut self, image: FirmwareImage, reply: Reply<Result<(), DfuError>>) {
        if !self.is_ready() {
            let _ = reply.send(Err(DfuError::NotReady));
            return;
        }
        if self.dfu.is_some() {
            let _ = reply.send(Err(DfuError::Busy));
            return;
        }
        let registry = self.dispatcher.registry();
        if !registry.has(CharacteristicRole::DfuControlPoint)
            || !registry.has(CharacteristicRole::DfuPacket)
        {
            let _ = reply.send(Err(DfuError::Unsupported));
            return;
        }

        if let Some(version) = &image.version {
            info!(%version, "Installing firmware");
        }
        let mut transfer = match DfuTransfer::new(image, self.packets_per_receipt) {
            Ok(transfer) => transfer,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let step = transfer.start();
        self.dfu = Some((transfer, reply));
        self.apply_dfu(step);
    }

    fn apply_dfu(&mut self, step: DfuStep) {
        let mut pending = Some(step);
        while let Some(step) = pending.take() {
            for write in &step.writes {
                let role = match write.target {
                    DfuTarget::ControlPoint => CharacteristicRole::DfuControlPoint,
                    DfuTarget::Packet => CharacteristicRole::DfuPacket,
                };
                if let Err(e) = self.dispatcher.write(role, &write.value, write.kind) {
                    if let Some((transfer, _)) = self.dfu.as_mut() {
                        pending = Some(transfer.abort(DfuError::Transport(e.to_string())));
                    }
                    break;
                }
            }

            if let Some(progress) = step.progress {
                let _ = self.event_sender.send(AppEvent::DfuProgress(progress));
            }
            if let Some(outcome) = step.outcome {
                let Some((_, reply)) = self.dfu.take() else {
                    continue;
                };
                match &outcome {
                    Ok(()) => {
                        info!("Firmware update complete");
                        let _ = self.event_sender.send(AppEvent::DfuCompleted);
                    }
                    Err(e) => {
                        let _ = self.event_sender.send(AppEvent::DfuFailed(e.to_string()));
                    }
                }
                let _ = reply.send(outcome);
            }
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
    use crate::infrastructure::bluetooth::protocol::{
        BATTERY_LEVEL, BLEFS_TRANSFER, CURRENT_TIME, DFU_CONTROL_POINT, DFU_PACKET,
        FIRMWARE_REVISION,
    };
    use crate::infrastructure::bluetooth::test_support::{
        peripheral, FakeWatchFs, PlatformCall, RecordingPlatform,
    };
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        platform: Arc<RecordingPlatform>,
        events: mpsc::UnboundedReceiver<AppEvent>,
        service: BluetoothService,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsService::with_path(dir.path().join("settings.json")).unwrap();
        let settings = Arc::new(Mutex::new(settings));
        let platform = Arc::new(RecordingPlatform::new());
        let (tx, events) = mpsc::unbounded_channel();
        let devices = Box::new(SettingsDeviceManager::new(settings.clone()));
        let service = BluetoothService::new(platform.clone(), devices, settings, tx);
        Harness {
            _dir: dir,
            platform,
            events,
            service,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn connect(h: &mut Harness, characteristics: Vec<Uuid>) {
        h.service
            .handle_event(BleEvent::AdapterStateChanged { powered_on: true });
        h.service.handle_event(BleEvent::PeripheralDiscovered(peripheral(
            "w1",
            Some("InfiniTime"),
        )));
        let (tx, mut rx) = oneshot::channel();
        h.service
            .handle_command(BluetoothCommand::Connect(DeviceId::new("w1"), tx));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        h.service
            .handle_event(BleEvent::Connected(DeviceId::new("w1")));
        h.service.handle_event(BleEvent::CharacteristicsDiscovered {
            service: Uuid::nil(),
            characteristics,
        });
        h.platform.take_calls();
    }

    fn connect_ready(h: &mut Harness) {
        connect(
            h,
            vec![
                CURRENT_TIME,
                BATTERY_LEVEL,
                FIRMWARE_REVISION,
                BLEFS_TRANSFER,
                DFU_CONTROL_POINT,
                DFU_PACKET,
            ],
        );
        assert!(h.service.is_ready());
    }

    fn fs_request(
        h: &mut Harness,
        request: FsRequest,
    ) -> oneshot::Receiver<Result<FsResponse, BlefsError>> {
        let (reply, rx) = oneshot::channel();
        h.service
            .handle_command(BluetoothCommand::Filesystem { request, reply });
        rx
    }

    /// Answers BLEFS writes from the fake filesystem until the link goes quiet.
    fn pump_fs(h: &mut Harness, fs: &mut FakeWatchFs) {
        loop {
            let frames: Vec<Vec<u8>> = h
                .platform
                .take_calls()
                .into_iter()
                .filter_map(|call| match call {
                    PlatformCall::Write(uuid, value, _) if uuid == BLEFS_TRANSFER => Some(value),
                    _ => None,
                })
                .collect();
            if frames.is_empty() {
                break;
            }
            for frame in frames {
                for response in fs.handle(&frame) {
                    h.service.handle_event(BleEvent::ValueUpdated {
                        characteristic: BLEFS_TRANSFER,
                        value: response,
                    });
                }
            }
        }
    }

    fn control_point(h: &mut Harness, value: &[u8]) {
        h.service.handle_event(BleEvent::ValueUpdated {
            characteristic: DFU_CONTROL_POINT,
            value: value.to_vec(),
        });
    }

    #[test]
    fn test_ready_requires_current_time() {
        let mut h = harness();
        connect(&mut h, vec![BATTERY_LEVEL, BLEFS_TRANSFER]);
        assert!(!h.service.is_ready());

        h.service.handle_event(BleEvent::CharacteristicsDiscovered {
            service: Uuid::nil(),
            characteristics: vec![CURRENT_TIME],
        });
        assert!(h.service.is_ready());
        let ready_events = drain(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, AppEvent::ConnectionStatus(ConnectionStatus::Ready)))
            .count();
        assert_eq!(ready_events, 1);
    }

    #[test]
    fn test_filesystem_before_ready_is_rejected() {
        let mut h = harness();
        let mut rx = fs_request(
            &mut h,
            FsRequest::ListDir {
                path: "/".to_string(),
            },
        );
        assert_eq!(rx.try_recv().unwrap(), Err(BlefsError::NotReady));
        assert!(h.platform.calls().is_empty());
    }

    #[test]
    fn test_missing_blefs_characteristic_is_unsupported() {
        let mut h = harness();
        connect(&mut h, vec![CURRENT_TIME]);
        let mut rx = fs_request(
            &mut h,
            FsRequest::Delete {
                path: "/a".to_string(),
            },
        );
        assert_eq!(rx.try_recv().unwrap(), Err(BlefsError::Unsupported));
    }

    #[test]
    fn test_write_then_read_file_through_the_link() {
        let mut h = harness();
        connect_ready(&mut h);
        let mut fs = FakeWatchFs::new();
        let data: Vec<u8> = (0..450u32).map(|i| (i % 251) as u8).collect();

        let mut write = fs_request(
            &mut h,
            FsRequest::WriteFile {
                path: "/notes.txt".to_string(),
                data: data.clone(),
            },
        );
        let mut read = fs_request(
            &mut h,
            FsRequest::ReadFile {
                path: "/notes.txt".to_string(),
            },
        );
        pump_fs(&mut h, &mut fs);

        assert!(matches!(
            write.try_recv().unwrap(),
            Ok(FsResponse::Written { bytes: 450, .. })
        ));
        assert_eq!(fs.file("/notes.txt"), Some(&data));
        assert_eq!(read.try_recv().unwrap(), Ok(FsResponse::Data(data)));

        let progress: Vec<_> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                AppEvent::FsProgress(p) => Some(p),
                _ => None,
            })
            .collect();
        assert!(progress
            .iter()
            .any(|p| p.bytes_transferred == 450 && p.total_bytes == 450));
    }

    #[test]
    fn test_disconnect_fails_queued_filesystem_requests() {
        let mut h = harness();
        connect_ready(&mut h);
        let mut first = fs_request(
            &mut h,
            FsRequest::ReadFile {
                path: "/a".to_string(),
            },
        );
        let mut second = fs_request(
            &mut h,
            FsRequest::ReadFile {
                path: "/b".to_string(),
            },
        );

        h.service.handle_event(BleEvent::Disconnected {
            id: DeviceId::new("w1"),
            error: Some(PlatformError::LinkLost),
        });
        assert_eq!(first.try_recv().unwrap(), Err(BlefsError::ConnectionLost));
        assert_eq!(second.try_recv().unwrap(), Err(BlefsError::ConnectionLost));
        assert!(!h.service.is_ready());
        assert!(h.service.reconnect_deadline().is_some());
    }

    #[test]
    fn test_connecting_elsewhere_ends_the_current_link() {
        let mut h = harness();
        connect_ready(&mut h);
        h.service.handle_event(BleEvent::PeripheralDiscovered(peripheral(
            "w2",
            Some("InfiniTime"),
        )));
        let mut read = fs_request(
            &mut h,
            FsRequest::ReadFile {
                path: "/a".to_string(),
            },
        );

        let (tx, mut rx) = oneshot::channel();
        h.service
            .handle_command(BluetoothCommand::Connect(DeviceId::new("w2"), tx));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(read.try_recv().unwrap(), Err(BlefsError::ConnectionLost));
        assert!(h.service.dispatcher.registry().is_empty());
        assert!(!h.service.is_ready());

        h.service.handle_event(BleEvent::Disconnected {
            id: DeviceId::new("w1"),
            error: None,
        });
        h.service.handle_event(BleEvent::ConnectFailed {
            id: DeviceId::new("w2"),
            error: PlatformError::LinkLost,
        });
        assert!(h.service.session().connected_device().is_none());
    }

    #[test]
    fn test_failed_write_ends_transfer_with_transport_error() {
        let mut h = harness();
        connect_ready(&mut h);
        h.platform.set_fail_writes(true);
        let mut rx = fs_request(
            &mut h,
            FsRequest::MakeDir {
                path: "/fonts".to_string(),
            },
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(BlefsError::Transport(_))
        ));
    }

    #[test]
    fn test_firmware_update_completes_on_reboot() {
        let mut h = harness();
        connect_ready(&mut h);
        let image = FirmwareImage::new(vec![0x11; 14], vec![0x42; 100]);
        let (reply, mut rx) = oneshot::channel();
        h.service
            .handle_command(BluetoothCommand::StartDfu { image, reply });
        assert!(rx.try_recv().is_err());

        control_point(&mut h, &[0x10, 0x01, 0x01]);
        control_point(&mut h, &[0x10, 0x02, 0x01]);
        let image_bytes: usize = h
            .platform
            .writes_to(DFU_PACKET)
            .iter()
            .filter(|p| p.len() <= 20 && p.iter().all(|b| *b == 0x42))
            .map(Vec::len)
            .sum();
        assert_eq!(image_bytes, 100);

        control_point(&mut h, &[0x10, 0x03, 0x01]);
        control_point(&mut h, &[0x10, 0x04, 0x01]);
        assert!(h
            .platform
            .writes_to(DFU_CONTROL_POINT)
            .contains(&vec![0x05]));

        h.service.handle_event(BleEvent::Disconnected {
            id: DeviceId::new("w1"),
            error: Some(PlatformError::LinkLost),
        });
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(e, AppEvent::DfuCompleted)));
        let last = events
            .iter()
            .filter_map(|e| match e {
                AppEvent::DfuProgress(p) => Some(p.fraction),
                _ => None,
            })
            .last();
        assert_eq!(last, Some(1.0));
    }

    #[test]
    fn test_failed_activate_write_still_completes_update() {
        let mut h = harness();
        connect_ready(&mut h);
        let (reply, mut rx) = oneshot::channel();
        h.service.handle_command(BluetoothCommand::StartDfu {
            image: FirmwareImage::new(vec![0x11; 14], vec![0x42; 100]),
            reply,
        });
        control_point(&mut h, &[0x10, 0x01, 0x01]);
        control_point(&mut h, &[0x10, 0x02, 0x01]);
        control_point(&mut h, &[0x10, 0x03, 0x01]);
        control_point(&mut h, &[0x10, 0x04, 0x01]);

        h.service.handle_event(BleEvent::WriteCompleted {
            characteristic: DFU_CONTROL_POINT,
            result: Err(PlatformError::LinkLost),
        });
        h.service.handle_event(BleEvent::Disconnected {
            id: DeviceId::new("w1"),
            error: Some(PlatformError::LinkLost),
        });
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert!(!drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, AppEvent::DfuFailed(_))));
    }

    #[test]
    fn test_second_firmware_update_is_busy() {
        let mut h = harness();
        connect_ready(&mut h);
        let (first, _first_rx) = oneshot::channel();
        h.service.handle_command(BluetoothCommand::StartDfu {
            image: FirmwareImage::new(vec![1], vec![2; 40]),
            reply: first,
        });
        let (second, mut second_rx) = oneshot::channel();
        h.service.handle_command(BluetoothCommand::StartDfu {
            image: FirmwareImage::new(vec![1], vec![2; 40]),
            reply: second,
        });
        assert_eq!(second_rx.try_recv().unwrap(), Err(DfuError::Busy));
    }

    #[test]
    fn test_bootloader_rejection_is_published() {
        let mut h = harness();
        connect_ready(&mut h);
        let (reply, mut rx) = oneshot::channel();
        h.service.handle_command(BluetoothCommand::StartDfu {
            image: FirmwareImage::new(vec![1], vec![2; 40]),
            reply,
        });
        control_point(&mut h, &[0x10, 0x01, 0x06]);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(DfuError::DeviceStatus {
                opcode: 0x01,
                status: 0x06
            })
        );
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, AppEvent::DfuFailed(_))));
    }

    #[test]
    fn test_values_are_routed_to_device_updates() {
        let mut h = harness();
        connect_ready(&mut h);
        drain(&mut h.events);

        h.service.handle_event(BleEvent::ValueUpdated {
            characteristic: BATTERY_LEVEL,
            value: vec![77],
        });
        h.service.handle_event(BleEvent::ValueUpdated {
            characteristic: FIRMWARE_REVISION,
            value: b"0.1.0".to_vec(),
        });

        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, AppEvent::DeviceUpdate(DeviceUpdate::Battery(77)))));
        assert!(events.iter().any(|e| matches!(
            e,
            AppEvent::LogMessage(StatusMessage {
                severity: MessageSeverity::Warning,
                ..
            })
        )));
        let known = h.service.session().devices().fetch_device(&DeviceId::new("w1"));
        assert_eq!(known.map(|d| d.info.firmware), Some("0.1.0".to_string()));
    }

    #[test]
    fn test_feature_write_requires_ready() {
        let mut h = harness();
        let (reply, mut rx) = oneshot::channel();
        h.service.handle_command(BluetoothCommand::Write {
            role: CharacteristicRole::Notify,
            payload: vec![0],
            reply,
        });
        assert_eq!(rx.try_recv().unwrap(), Err(DispatchError::NotReady));

        connect_ready(&mut h);
        let (reply, mut rx) = oneshot::channel();
        h.service.handle_command(BluetoothCommand::Write {
            role: CharacteristicRole::Notify,
            payload: vec![0],
            reply,
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(DispatchError::NotBound(CharacteristicRole::Notify))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_after_link_loss() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = SettingsService::with_path(dir.path().join("settings.json")).unwrap();
        settings.get_mut().paired_device_id = Some(DeviceId::new("w1"));
        let settings = Arc::new(Mutex::new(settings));
        let platform = Arc::new(RecordingPlatform::with_known(vec![peripheral(
            "w1",
            Some("InfiniTime"),
        )]));
        let (app_tx, _app_rx) = mpsc::unbounded_channel();
        let devices = Box::new(SettingsDeviceManager::new(settings.clone()));
        let service = BluetoothService::new(platform.clone(), devices, settings, app_tx);

        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(service.run(commands_rx, events_rx));

        events_tx
            .send(BleEvent::AdapterStateChanged { powered_on: true })
            .unwrap();
        events_tx
            .send(BleEvent::Connected(DeviceId::new("w1")))
            .unwrap();
        events_tx
            .send(BleEvent::Disconnected {
                id: DeviceId::new("w1"),
                error: Some(PlatformError::LinkLost),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let connects = platform
            .calls()
            .into_iter()
            .filter(|c| matches!(c, PlatformCall::Connect(_)))
            .count();
        assert_eq!(connects, 2);

        drop(events_tx);
        task.await.unwrap();
    }
}
