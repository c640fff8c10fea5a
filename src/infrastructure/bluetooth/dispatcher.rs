//! Characteristic Dispatcher
//!
//! Binds discovered characteristics to roles and routes every value update to exactly
//! one handler. Nothing is broadcast: a BLEFS frame only ever reaches the BLEFS
//! protocol, a DFU response only the DFU protocol.

use crate::domain::device::DeviceInfoField;
use crate::domain::models::{DeviceId, DeviceUpdate, MusicEvent};
use crate::infrastructure::bluetooth::payloads;
use crate::infrastructure::bluetooth::platform::{BlePlatform, PlatformError, WriteKind};
use crate::infrastructure::bluetooth::protocol::CharacteristicRole;
use crate::infrastructure::bluetooth::registry::CharacteristicRegistry;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Where a value update ends up.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Info(DeviceInfoField, String),
    Device(DeviceUpdate),
    Music(MusicEvent),
    Blefs(Vec<u8>),
    Dfu(Vec<u8>),
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("watch is not ready")]
    NotReady,
    #[error("watch does not expose {0:?}")]
    NotBound(CharacteristicRole),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

pub struct Dispatcher {
    platform: Arc<dyn BlePlatform>,
    registry: CharacteristicRegistry,
}

impl Dispatcher {
    pub fn new(platform: Arc<dyn BlePlatform>) -> Self {
        Self {
            platform,
            registry: CharacteristicRegistry::new(),
        }
    }

    pub fn registry(&self) -> &CharacteristicRegistry {
        &self.registry
    }

    /// Drops every binding; called whenever a connection ends or a new one starts.
    pub fn reset(&mut self) {
        if !self.registry.is_empty() {
            debug!(bindings = self.registry.len(), "Clearing characteristic bindings");
        }
        self.registry.clear();
    }

    /// Readiness gate for every feature: current time resolved on an active session.
    pub fn is_ready(&self, session_active: bool) -> bool {
        session_active && self.registry.has(CharacteristicRole::CurrentTime)
    }

    /// Requests characteristics for every service, whatever grouping the firmware uses.
    pub fn on_services_discovered(&self, id: &DeviceId, services: &[Uuid]) {
        info!(device = %id, count = services.len(), "Services discovered");
        for service in services {
            if let Err(e) = self.platform.discover_characteristics(id, *service) {
                warn!(%service, "Characteristic discovery request failed: {}", e);
            }
        }
    }

    /// Binds roles and performs the per-role setup. Returns the roles bound by this call.
    pub fn on_characteristics_discovered(
        &mut self,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Vec<CharacteristicRole> {
        let mut bound = Vec::new();
        for uuid in characteristics {
            let Some(role) = self.registry.bind(*uuid) else {
                trace!(%service, characteristic = %uuid, "Ignoring characteristic without role");
                continue;
            };
            debug!(characteristic = %uuid, ?role, "Bound characteristic");

            if role.notifies() {
                if let Err(e) = self.platform.set_notify(*uuid, true) {
                    warn!(?role, "Could not enable notifications: {}", e);
                }
            }
            if role.read_on_discovery() {
                if let Err(e) = self.platform.read(*uuid) {
                    warn!(?role, "Initial read failed: {}", e);
                }
            }
            if role == CharacteristicRole::CurrentTime {
                if let Err(e) = self.sync_time() {
                    warn!("Failed to set watch time: {}", e);
                }
            }
            bound.push(role);
        }
        bound
    }

    /// Routes one value update by the role of its characteristic.
    pub fn route(&self, characteristic: Uuid, value: &[u8]) -> Routed {
        let Some(role) = self.registry.role_of(&characteristic) else {
            trace!(%characteristic, "Update from unbound characteristic");
            return Routed::Ignored;
        };

        let routed = match role {
            CharacteristicRole::DeviceInfo(field) => {
                Some(Routed::Info(field, payloads::decode_string(value)))
            }
            CharacteristicRole::Battery => payloads::decode_battery(value)
                .map(|level| Routed::Device(DeviceUpdate::Battery(level))),
            CharacteristicRole::HeartRate => payloads::decode_heart_rate(value)
                .map(|bpm| Routed::Device(DeviceUpdate::HeartRate(bpm))),
            CharacteristicRole::StepCount => payloads::decode_step_count(value)
                .map(|steps| Routed::Device(DeviceUpdate::StepCount(steps))),
            CharacteristicRole::Motion => payloads::decode_motion(value)
                .map(|sample| Routed::Device(DeviceUpdate::Motion(sample))),
            CharacteristicRole::MusicControl => {
                payloads::decode_music_event(value).map(Routed::Music)
            }
            CharacteristicRole::BlefsTransfer => Some(Routed::Blefs(value.to_vec())),
            CharacteristicRole::DfuControlPoint => Some(Routed::Dfu(value.to_vec())),
            _ => {
                trace!(?role, "No handler for role");
                Some(Routed::Ignored)
            }
        };

        routed.unwrap_or_else(|| {
            warn!(?role, len = value.len(), "Dropping malformed value");
            Routed::Ignored
        })
    }

    pub fn write(
        &self,
        role: CharacteristicRole,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), DispatchError> {
        let uuid = self
            .registry
            .characteristic_for(role)
            .ok_or(DispatchError::NotBound(role))?;
        self.platform.write(uuid, value, kind)?;
        Ok(())
    }

    /// Writes the host's local time to the watch.
    pub fn sync_time(&self) -> Result<(), DispatchError> {
        let now = chrono::Local::now().naive_local();
        self.write(
            CharacteristicRole::CurrentTime,
            &payloads::encode_current_time(now),
            WriteKind::WithResponse,
        )
    }
}
