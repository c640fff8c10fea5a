//! btleplug Backend
//!
//! [`BlePlatform`] on top of btleplug. Requests are queued to one worker task
//! that executes them in issue order, so a DFU packet never overtakes the
//! control point write before it. Outcomes come back as [`BleEvent`]s.

use crate::domain::models::{DeviceId, DiscoveredPeripheral};
use crate::infrastructure::bluetooth::platform::{BleEvent, BlePlatform, PlatformError, WriteKind};
use crate::infrastructure::bluetooth::scanner::{
    self, RequestedDisconnects, SeenMap,
};
use anyhow::Context;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Debug)]
enum Op {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Cancel(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId, Uuid),
    Read(Uuid),
    Write(Uuid, Vec<u8>, WriteKind),
    SetNotify(Uuid, bool),
}

pub struct BtleplugPlatform {
    ops: mpsc::UnboundedSender<Op>,
    seen: SeenMap,
}

impl BtleplugPlatform {
    /// Opens the first adapter and starts the worker and the adapter event pump.
    pub async fn start(events: mpsc::UnboundedSender<BleEvent>) -> anyhow::Result<Self> {
        let manager = Manager::new().await.context("Bluetooth manager unavailable")?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;
        match adapter.adapter_info().await {
            Ok(name) => info!(adapter = %name, "Using Bluetooth adapter"),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }
        let powered_on = match adapter.adapter_state().await {
            Ok(state) => scanner::is_powered(&state),
            Err(e) => {
                debug!("Adapter state unavailable: {}", e);
                true
            }
        };

        let seen: SeenMap = Arc::new(Mutex::new(HashMap::new()));
        let requested: RequestedDisconnects = Arc::new(Mutex::new(HashSet::new()));

        // Peripherals the host already knows can be reached without a scan.
        for peripheral in adapter.peripherals().await.unwrap_or_default() {
            scanner::remember(&seen, peripheral).await;
        }

        scanner::spawn_event_pump(adapter.clone(), events.clone(), seen.clone(), requested.clone())
            .await?;

        let (ops, ops_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            adapter,
            events: events.clone(),
            seen: seen.clone(),
            requested,
            connected: None,
            characteristics: HashMap::new(),
            notifications: None,
        };
        tokio::spawn(worker.run(ops_rx));

        let _ = events.send(BleEvent::AdapterStateChanged { powered_on });
        Ok(Self { ops, seen })
    }

    fn submit(&self, op: Op) -> Result<(), PlatformError> {
        self.ops.send(op).map_err(|_| PlatformError::BackendStopped)
    }
}

impl BlePlatform for BtleplugPlatform {
    fn start_scan(&self) -> Result<(), PlatformError> {
        self.submit(Op::StartScan)
    }

    fn stop_scan(&self) -> Result<(), PlatformError> {
        self.submit(Op::StopScan)
    }

    fn retrieve_peripheral(&self, id: &DeviceId) -> Option<DiscoveredPeripheral> {
        self.seen
            .lock()
            .ok()
            .and_then(|seen| seen.get(id).map(|s| s.info.clone()))
    }

    fn connect(&self, id: &DeviceId) -> Result<(), PlatformError> {
        self.submit(Op::Connect(id.clone()))
    }

    fn cancel_connection(&self, id: &DeviceId) -> Result<(), PlatformError> {
        self.submit(Op::Cancel(id.clone()))
    }

    fn discover_services(&self, id: &DeviceId) -> Result<(), PlatformError> {
        self.submit(Op::DiscoverServices(id.clone()))
    }

    fn discover_characteristics(&self, id: &DeviceId, service: Uuid) -> Result<(), PlatformError> {
        self.submit(Op::DiscoverCharacteristics(id.clone(), service))
    }

    fn read(&self, characteristic: Uuid) -> Result<(), PlatformError> {
        self.submit(Op::Read(characteristic))
    }

    fn write(
        &self,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), PlatformError> {
        self.submit(Op::Write(characteristic, value.to_vec(), kind))
    }

    fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<(), PlatformError> {
        self.submit(Op::SetNotify(characteristic, enabled))
    }
}

/// Maps btleplug failures onto the link's error taxonomy.
fn platform_error(e: btleplug::Error) -> PlatformError {
    match e {
        btleplug::Error::NotConnected => PlatformError::LinkLost,
        btleplug::Error::DeviceNotFound => PlatformError::Other("device not found".to_string()),
        other => {
            let text = other.to_string();
            let lower = text.to_ascii_lowercase();
            // Bluez and CoreBluetooth both report a dropped bond only in the message text.
            if lower.contains("authentication") || lower.contains("bond") || lower.contains("peer removed pairing") {
                PlatformError::BondRemoved
            } else {
                PlatformError::Other(text)
            }
        }
    }
}

struct Worker {
    adapter: Adapter,
    events: mpsc::UnboundedSender<BleEvent>,
    seen: SeenMap,
    requested: RequestedDisconnects,
    connected: Option<(DeviceId, Peripheral)>,
    characteristics: HashMap<Uuid, Characteristic>,
    notifications: Option<JoinHandle<()>>,
}

impl Worker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        while let Some(op) = ops.recv().await {
            trace!(?op, "Executing BLE request");
            self.execute(op).await;
        }
        info!("BLE worker stopped");
        if let Some((_, peripheral)) = self.connected.take() {
            let _ = peripheral.disconnect().await;
        }
    }

    async fn execute(&mut self, op: Op) {
        match op {
            Op::StartScan => {
                if let Err(e) = self.adapter.start_scan(ScanFilter::default()).await {
                    error!("Failed to start scan: {}", e);
                }
            }
            Op::StopScan => {
                if let Err(e) = self.adapter.stop_scan().await {
                    debug!("Failed to stop scan: {}", e);
                }
            }
            Op::Connect(id) => self.connect(id).await,
            Op::Cancel(id) => self.cancel(id).await,
            Op::DiscoverServices(id) => self.discover_services(id).await,
            Op::DiscoverCharacteristics(_, service) => self.discover_characteristics(service),
            Op::Read(uuid) => self.read(uuid).await,
            Op::Write(uuid, value, kind) => self.write(uuid, value, kind).await,
            Op::SetNotify(uuid, enabled) => self.set_notify(uuid, enabled).await,
        }
    }

    fn lookup(&self, id: &DeviceId) -> Option<Peripheral> {
        self.seen
            .lock()
            .ok()
            .and_then(|seen| seen.get(id).map(|s| s.peripheral.clone()))
    }

    async fn connect(&mut self, id: DeviceId) {
        let Some(peripheral) = self.lookup(&id) else {
            let _ = self.events.send(BleEvent::ConnectFailed {
                error: PlatformError::UnknownPeripheral(id.clone()),
                id,
            });
            return;
        };

        info!(device = %id, "Opening link");
        if let Err(e) = peripheral.connect().await {
            let _ = self.events.send(BleEvent::ConnectFailed {
                id,
                error: platform_error(e),
            });
            return;
        }

        self.characteristics.clear();
        match peripheral.notifications().await {
            Ok(mut stream) => {
                let events = self.events.clone();
                if let Some(previous) = self.notifications.take() {
                    previous.abort();
                }
                self.notifications = Some(tokio::spawn(async move {
                    while let Some(notification) = stream.next().await {
                        let event = BleEvent::ValueUpdated {
                            characteristic: notification.uuid,
                            value: notification.value,
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(e) => warn!(device = %id, "Notification stream unavailable: {}", e),
        }

        self.connected = Some((id.clone(), peripheral));
        let _ = self.events.send(BleEvent::Connected(id));
    }

    async fn cancel(&mut self, id: DeviceId) {
        let peripheral = match self.connected.take() {
            Some((current, peripheral)) if current == id => peripheral,
            other => {
                self.connected = other;
                match self.lookup(&id) {
                    Some(peripheral) => peripheral,
                    None => return,
                }
            }
        };
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
        self.characteristics.clear();

        if let Ok(mut requested) = self.requested.lock() {
            requested.insert(id.clone());
        }
        if let Err(e) = peripheral.disconnect().await {
            debug!(device = %id, "Disconnect failed: {}", e);
        }
    }

    async fn discover_services(&mut self, id: DeviceId) {
        let services = match &self.connected {
            Some((current, peripheral)) if *current == id => {
                match peripheral.discover_services().await {
                    Ok(()) => {
                        self.characteristics = peripheral
                            .characteristics()
                            .into_iter()
                            .map(|c| (c.uuid, c))
                            .collect();
                        Ok(peripheral.services().iter().map(|s| s.uuid).collect())
                    }
                    Err(e) => Err(platform_error(e)),
                }
            }
            _ => Err(PlatformError::LinkLost),
        };
        let _ = self
            .events
            .send(BleEvent::ServicesDiscovered { id, services });
    }

    /// btleplug resolves characteristics together with services.
    fn discover_characteristics(&self, service: Uuid) {
        let characteristics = self
            .characteristics
            .values()
            .filter(|c| c.service_uuid == service)
            .map(|c| c.uuid)
            .collect();
        let _ = self.events.send(BleEvent::CharacteristicsDiscovered {
            service,
            characteristics,
        });
    }

    fn target(&self, uuid: Uuid) -> Result<(Peripheral, Characteristic), PlatformError> {
        let (_, peripheral) = self.connected.as_ref().ok_or(PlatformError::LinkLost)?;
        let characteristic = self
            .characteristics
            .get(&uuid)
            .cloned()
            .ok_or(PlatformError::UnknownCharacteristic(uuid))?;
        Ok((peripheral.clone(), characteristic))
    }

    async fn read(&self, uuid: Uuid) {
        let result = match self.target(uuid) {
            Ok((peripheral, characteristic)) => {
                peripheral.read(&characteristic).await.map_err(platform_error)
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(value) => {
                let _ = self.events.send(BleEvent::ValueUpdated {
                    characteristic: uuid,
                    value,
                });
            }
            Err(e) => warn!(characteristic = %uuid, "Read failed: {}", e),
        }
    }

    async fn write(&self, uuid: Uuid, value: Vec<u8>, kind: WriteKind) {
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        let result = match self.target(uuid) {
            Ok((peripheral, characteristic)) => peripheral
                .write(&characteristic, &value, write_type)
                .await
                .map_err(platform_error),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(characteristic = %uuid, "Write failed: {}", e);
        }
        let _ = self.events.send(BleEvent::WriteCompleted {
            characteristic: uuid,
            result,
        });
    }

    async fn set_notify(&self, uuid: Uuid, enabled: bool) {
        let result = match self.target(uuid) {
            Ok((peripheral, characteristic)) if enabled => {
                peripheral.subscribe(&characteristic).await
            }
            Ok((peripheral, characteristic)) => peripheral.unsubscribe(&characteristic).await,
            Err(e) => {
                warn!(characteristic = %uuid, "Cannot change notifications: {}", e);
                return;
            }
        };
        if let Err(e) = result {
            warn!(characteristic = %uuid, enabled, "Notification change failed: {}", e);
        }
    }
}
