//! Known watches and the manager contract the link reports into.

use crate::domain::firmware;
use crate::domain::models::{DeviceId, DeviceUpdate};
use crate::domain::settings::SettingsService;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Device Information Service string fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceInfoField {
    ModelNumber,
    SerialNumber,
    Firmware,
    HardwareRevision,
    SoftwareRevision,
    Manufacturer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub model_number: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub hardware_revision: String,
    #[serde(default)]
    pub software_revision: String,
    #[serde(default)]
    pub manufacturer: String,
}

impl DeviceInfo {
    pub fn set(&mut self, field: DeviceInfoField, value: String) {
        let slot = match field {
            DeviceInfoField::ModelNumber => &mut self.model_number,
            DeviceInfoField::SerialNumber => &mut self.serial_number,
            DeviceInfoField::Firmware => &mut self.firmware,
            DeviceInfoField::HardwareRevision => &mut self.hardware_revision,
            DeviceInfoField::SoftwareRevision => &mut self.software_revision,
            DeviceInfoField::Manufacturer => &mut self.manufacturer,
        };
        *slot = value;
    }

    pub fn is_recovery_mode(&self) -> bool {
        firmware::is_recovery_mode(&self.firmware)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub id: DeviceId,
    pub name: String,
    #[serde(default)]
    pub info: DeviceInfo,
}

impl KnownDevice {
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            info: DeviceInfo::default(),
        }
    }
}

/// Last live readings; not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorSnapshot {
    pub battery: Option<u8>,
    pub heart_rate: Option<u16>,
    pub step_count: Option<u32>,
}

/// Owner of the known-device list.
///
/// The link only calls through this trait, so the store can be swapped for a test double.
pub trait DeviceManager: Send {
    fn fetch_device(&self, id: &DeviceId) -> Option<KnownDevice>;
    fn fetch_all_devices(&self) -> Vec<KnownDevice>;
    /// Records a device after a successful connection. Existing entries keep their info.
    fn remember_device(&mut self, device: KnownDevice);
    fn remove_device(&mut self, id: &DeviceId);
    fn apply_update(&mut self, id: &DeviceId, update: &DeviceUpdate);
}

/// Device manager persisting into the settings file.
pub struct SettingsDeviceManager {
    settings: Arc<Mutex<SettingsService>>,
    snapshots: HashMap<DeviceId, SensorSnapshot>,
}

impl SettingsDeviceManager {
    pub fn new(settings: Arc<Mutex<SettingsService>>) -> Self {
        Self {
            settings,
            snapshots: HashMap::new(),
        }
    }

    pub fn snapshot(&self, id: &DeviceId) -> SensorSnapshot {
        self.snapshots.get(id).copied().unwrap_or_default()
    }

    fn with_settings<T>(&self, f: impl FnOnce(&mut SettingsService) -> T) -> Option<T> {
        match self.settings.lock() {
            Ok(mut guard) => Some(f(&mut guard)),
            Err(_) => {
                warn!("Settings lock poisoned, device list unavailable");
                None
            }
        }
    }
}

impl DeviceManager for SettingsDeviceManager {
    fn fetch_device(&self, id: &DeviceId) -> Option<KnownDevice> {
        self.with_settings(|s| s.get().known_devices.iter().find(|d| &d.id == id).cloned())
            .flatten()
    }

    fn fetch_all_devices(&self) -> Vec<KnownDevice> {
        self.with_settings(|s| s.get().known_devices.clone())
            .unwrap_or_default()
    }

    fn remember_device(&mut self, device: KnownDevice) {
        let result = self.with_settings(|s| s.add_known_device(device));
        if let Some(Err(e)) = result {
            warn!("Failed to persist known device: {}", e);
        }
    }

    fn remove_device(&mut self, id: &DeviceId) {
        self.snapshots.remove(id);
        let result = self.with_settings(|s| s.remove_known_device(id));
        if let Some(Err(e)) = result {
            warn!("Failed to persist device removal: {}", e);
        }
    }

    fn apply_update(&mut self, id: &DeviceId, update: &DeviceUpdate) {
        if let DeviceUpdate::Info(field, value) = update {
            debug!(device = %id, ?field, value = %value, "Device info updated");
            let result = self.with_settings(|s| {
                let known = s.get_mut().known_devices.iter_mut().find(|d| &d.id == id);
                match known {
                    Some(device) => {
                        device.info.set(*field, value.clone());
                        s.save()
                    }
                    None => Ok(()),
                }
            });
            if let Some(Err(e)) = result {
                warn!("Failed to persist device info: {}", e);
            }
            return;
        }

        let snapshot = self.snapshots.entry(id.clone()).or_default();
        match update {
            DeviceUpdate::Battery(level) => snapshot.battery = Some(*level),
            DeviceUpdate::HeartRate(bpm) => snapshot.heart_rate = Some(*bpm),
            DeviceUpdate::StepCount(steps) => snapshot.step_count = Some(*steps),
            DeviceUpdate::Motion(_) | DeviceUpdate::Info(..) => {}
        }
    }
}
