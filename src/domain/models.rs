use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::device::DeviceInfoField;

/// Stable platform identifier of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A peripheral seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl DiscoveredPeripheral {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    /// Connected and the current-time characteristic is resolved.
    Ready,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Raw accelerometer sample from the motion characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionSample {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

/// Values derived from characteristic updates, pushed to the device manager.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceUpdate {
    Battery(u8),
    HeartRate(u16),
    StepCount(u32),
    Motion(MotionSample),
    Info(DeviceInfoField, String),
}

/// Media button pressed on the watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicEvent {
    Play,
    Pause,
    Next,
    Previous,
    VolumeUp,
    VolumeDown,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOperationKind {
    ListDir,
    ReadFile,
    WriteFile,
    Delete,
    Rename,
    MakeDir,
}

impl fmt::Display for FsOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ListDir => "list-dir",
            Self::ReadFile => "read-file",
            Self::WriteFile => "write-file",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::MakeDir => "make-dir",
        };
        f.write_str(name)
    }
}

/// Progress of the filesystem operation currently on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub operation: FsOperationKind,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    pub fn new(operation: FsOperationKind) -> Self {
        Self {
            operation,
            bytes_transferred: 0,
            total_bytes: 0,
        }
    }

    /// Fraction in `[0, 1]`; an empty transfer counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.bytes_transferred == 0 { 0.0 } else { 1.0 };
        }
        self.bytes_transferred as f64 / self.total_bytes as f64
    }
}

/// Published firmware upload progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DfuProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub fraction: f64,
}

/// Everything the link publishes to the presentation layer.
#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus(ConnectionStatus),
    PeripheralDiscovered(DiscoveredPeripheral),
    PairedDeviceChanged(Option<DeviceId>),
    DeviceUpdate(DeviceUpdate),
    MusicEvent(MusicEvent),
    FsProgress(TransferProgress),
    DfuProgress(DfuProgress),
    /// Transient signal; the caller clears its firmware selection and re-checks for updates.
    DfuCompleted,
    DfuFailed(String),
    ReconnectGaveUp(DeviceId),
    /// Something the user has to act on.
    UserError(String),
    LogMessage(StatusMessage),
}
