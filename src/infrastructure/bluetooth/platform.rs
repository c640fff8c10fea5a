//! Host BLE Capability
//!
//! The link never talks to a Bluetooth stack directly. It issues requests through
//! [`BlePlatform`] and learns about their outcome from [`BleEvent`]s delivered on a
//! single channel, one at a time. Every request returns as soon as it is queued.

use crate::domain::models::{DeviceId, DiscoveredPeripheral};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("Bluetooth adapter is not available")]
    AdapterUnavailable,
    #[error("peripheral {0} is not known to the adapter")]
    UnknownPeripheral(DeviceId),
    #[error("characteristic {0} is not available")]
    UnknownCharacteristic(Uuid),
    #[error("the peripheral removed its pairing information")]
    BondRemoved,
    #[error("link lost")]
    LinkLost,
    #[error("Bluetooth backend stopped")]
    BackendStopped,
    #[error("{0}")]
    Other(String),
}

/// Callback traffic from the host stack.
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
    AdapterStateChanged {
        powered_on: bool,
    },
    PeripheralDiscovered(DiscoveredPeripheral),
    Connected(DeviceId),
    ConnectFailed {
        id: DeviceId,
        error: PlatformError,
    },
    /// `error` is `None` only when the disconnect was requested by us.
    Disconnected {
        id: DeviceId,
        error: Option<PlatformError>,
    },
    ServicesDiscovered {
        id: DeviceId,
        services: Result<Vec<Uuid>, PlatformError>,
    },
    CharacteristicsDiscovered {
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    /// Notification or read response.
    ValueUpdated {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteCompleted {
        characteristic: Uuid,
        result: Result<(), PlatformError>,
    },
}

/// Central-role operations the host platform provides.
///
/// Implementations must execute GATT requests in the order they were issued.
pub trait BlePlatform: Send + Sync {
    fn start_scan(&self) -> Result<(), PlatformError>;
    fn stop_scan(&self) -> Result<(), PlatformError>;
    /// A peripheral the platform already knows, without scanning.
    fn retrieve_peripheral(&self, id: &DeviceId) -> Option<DiscoveredPeripheral>;
    fn connect(&self, id: &DeviceId) -> Result<(), PlatformError>;
    fn cancel_connection(&self, id: &DeviceId) -> Result<(), PlatformError>;
    fn discover_services(&self, id: &DeviceId) -> Result<(), PlatformError>;
    fn discover_characteristics(&self, id: &DeviceId, service: Uuid) -> Result<(), PlatformError>;
    fn read(&self, characteristic: Uuid) -> Result<(), PlatformError>;
    fn write(&self, characteristic: Uuid, value: &[u8], kind: WriteKind)
        -> Result<(), PlatformError>;
    fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<(), PlatformError>;
}
