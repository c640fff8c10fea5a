//! BLE Scanner Module
//!
//! Pumps the adapter's central events into the link's event channel:
//! advertisements become discoveries, link drops become disconnects.

use crate::domain::models::{DeviceId, DiscoveredPeripheral};
use crate::infrastructure::bluetooth::platform::{BleEvent, PlatformError};
use btleplug::api::{Central, CentralEvent, CentralState, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A peripheral the adapter has reported, with its btleplug handle.
#[derive(Clone)]
pub struct SeenPeripheral {
    pub peripheral: Peripheral,
    pub info: DiscoveredPeripheral,
}

pub type SeenMap = Arc<Mutex<HashMap<DeviceId, SeenPeripheral>>>;

/// Devices we asked to disconnect; their disconnect events carry no error.
pub type RequestedDisconnects = Arc<Mutex<HashSet<DeviceId>>>;

pub fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::new(id.to_string())
}

/// Reads name and signal strength of a peripheral and records it as seen.
pub async fn remember(seen: &SeenMap, peripheral: Peripheral) -> Option<DiscoveredPeripheral> {
    let properties = match peripheral.properties().await {
        Ok(properties) => properties,
        Err(e) => {
            debug!("Could not read peripheral properties: {}", e);
            return None;
        }
    };
    let info = DiscoveredPeripheral {
        id: device_id(&peripheral.id()),
        name: properties.as_ref().and_then(|p| p.local_name.clone()),
        rssi: properties.as_ref().and_then(|p| p.rssi),
    };

    match seen.lock() {
        Ok(mut seen) => {
            seen.insert(
                info.id.clone(),
                SeenPeripheral {
                    peripheral,
                    info: info.clone(),
                },
            );
        }
        Err(_) => warn!("Peripheral cache lock poisoned"),
    }
    Some(info)
}

/// Power state of the adapter. An unknown state is assumed usable.
pub fn is_powered(state: &CentralState) -> bool {
    !matches!(state, CentralState::PoweredOff)
}

/// Spawns the task forwarding adapter events until the event channel closes.
pub async fn spawn_event_pump(
    adapter: Adapter,
    events: mpsc::UnboundedSender<BleEvent>,
    seen: SeenMap,
    requested: RequestedDisconnects,
) -> anyhow::Result<JoinHandle<()>> {
    let mut stream = adapter.events().await?;
    info!("Listening for adapter events");

    Ok(tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let forwarded = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    let Ok(peripheral) = adapter.peripheral(&id).await else {
                        trace!(?id, "Peripheral vanished before it could be read");
                        continue;
                    };
                    match remember(&seen, peripheral).await {
                        Some(info) => BleEvent::PeripheralDiscovered(info),
                        None => continue,
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let id = device_id(&id);
                    let was_requested = requested
                        .lock()
                        .map(|mut r| r.remove(&id))
                        .unwrap_or(false);
                    let error = (!was_requested).then_some(PlatformError::LinkLost);
                    debug!(device = %id, requested = was_requested, "Peripheral disconnected");
                    BleEvent::Disconnected { id, error }
                }
                CentralEvent::StateUpdate(state) => {
                    info!(?state, "Adapter state changed");
                    BleEvent::AdapterStateChanged {
                        powered_on: is_powered(&state),
                    }
                }
                other => {
                    trace!(event = ?other, "Unhandled adapter event");
                    continue;
                }
            };

            if events.send(forwarded).is_err() {
                break;
            }
        }
        info!("Adapter event stream ended");
    }))
}
