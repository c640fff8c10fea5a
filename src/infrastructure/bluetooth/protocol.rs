//! InfiniTime GATT Protocol
//!
//! UUIDs of the characteristics the watch exposes and the role each one plays.
//! Role binding is a pure function of the UUID: the same characteristic always
//! maps to the same role, whichever service it was discovered under.

use crate::domain::device::DeviceInfoField;
use uuid::Uuid;

/// Advertised name of watches running InfiniTime.
pub const DEVICE_NAME: &str = "InfiniTime";

/// Bluetooth SIG base UUID with a 16-bit assigned number.
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

// Standard characteristics
pub const HEART_RATE_MEASUREMENT: Uuid = sig_uuid(0x2A37);
pub const BATTERY_LEVEL: Uuid = sig_uuid(0x2A19);
pub const CURRENT_TIME: Uuid = sig_uuid(0x2A2B);
pub const NEW_ALERT: Uuid = sig_uuid(0x2A46);
pub const MODEL_NUMBER: Uuid = sig_uuid(0x2A24);
pub const SERIAL_NUMBER: Uuid = sig_uuid(0x2A25);
pub const FIRMWARE_REVISION: Uuid = sig_uuid(0x2A26);
pub const HARDWARE_REVISION: Uuid = sig_uuid(0x2A27);
pub const SOFTWARE_REVISION: Uuid = sig_uuid(0x2A28);
pub const MANUFACTURER_NAME: Uuid = sig_uuid(0x2A29);

/// Adafruit file transfer characteristic ("FileTransfer" in ASCII).
pub const BLEFS_TRANSFER: Uuid = Uuid::from_u128(0xadaf0200_4669_6c65_5472_616e73666572);

// Nordic legacy DFU
pub const DFU_CONTROL_POINT: Uuid = Uuid::from_u128(0x00001531_1212_efde_1523_785feabcd123);
pub const DFU_PACKET: Uuid = Uuid::from_u128(0x00001532_1212_efde_1523_785feabcd123);

// InfiniTime custom services share the 78fc48fe-8e23-433b3a1942d0 base
pub const MUSIC_EVENT: Uuid = Uuid::from_u128(0x00000001_78fc_48fe_8e23_433b3a1942d0);
pub const MUSIC_STATUS: Uuid = Uuid::from_u128(0x00000002_78fc_48fe_8e23_433b3a1942d0);
pub const MUSIC_ARTIST: Uuid = Uuid::from_u128(0x00000003_78fc_48fe_8e23_433b3a1942d0);
pub const MUSIC_TRACK: Uuid = Uuid::from_u128(0x00000004_78fc_48fe_8e23_433b3a1942d0);
pub const MUSIC_POSITION: Uuid = Uuid::from_u128(0x00000006_78fc_48fe_8e23_433b3a1942d0);
pub const MUSIC_LENGTH: Uuid = Uuid::from_u128(0x00000007_78fc_48fe_8e23_433b3a1942d0);

pub const NAVIGATION_FLAGS: Uuid = Uuid::from_u128(0x00010001_78fc_48fe_8e23_433b3a1942d0);
pub const NAVIGATION_NARRATIVE: Uuid = Uuid::from_u128(0x00010002_78fc_48fe_8e23_433b3a1942d0);
pub const NAVIGATION_DISTANCE: Uuid = Uuid::from_u128(0x00010003_78fc_48fe_8e23_433b3a1942d0);
pub const NAVIGATION_PROGRESS: Uuid = Uuid::from_u128(0x00010004_78fc_48fe_8e23_433b3a1942d0);

pub const STEP_COUNT: Uuid = Uuid::from_u128(0x00030001_78fc_48fe_8e23_433b3a1942d0);
pub const MOTION: Uuid = Uuid::from_u128(0x00030002_78fc_48fe_8e23_433b3a1942d0);
pub const WEATHER: Uuid = Uuid::from_u128(0x00050001_78fc_48fe_8e23_433b3a1942d0);

/// Fixed path of the watch settings blob on the remote filesystem.
pub const SETTINGS_PATH: &str = "/settings.dat";

/// Semantic meaning of a discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    Battery,
    HeartRate,
    CurrentTime,
    Notify,
    Weather,
    StepCount,
    Motion,
    MusicControl,
    MusicTrack,
    MusicArtist,
    MusicStatus,
    MusicPosition,
    MusicLength,
    NavigationFlags,
    NavigationNarrative,
    NavigationDistance,
    NavigationProgress,
    BlefsTransfer,
    DfuControlPoint,
    DfuPacket,
    DeviceInfo(DeviceInfoField),
}

const ROLE_TABLE: &[(Uuid, CharacteristicRole)] = &[
    (BATTERY_LEVEL, CharacteristicRole::Battery),
    (HEART_RATE_MEASUREMENT, CharacteristicRole::HeartRate),
    (CURRENT_TIME, CharacteristicRole::CurrentTime),
    (NEW_ALERT, CharacteristicRole::Notify),
    (WEATHER, CharacteristicRole::Weather),
    (STEP_COUNT, CharacteristicRole::StepCount),
    (MOTION, CharacteristicRole::Motion),
    (MUSIC_EVENT, CharacteristicRole::MusicControl),
    (MUSIC_TRACK, CharacteristicRole::MusicTrack),
    (MUSIC_ARTIST, CharacteristicRole::MusicArtist),
    (MUSIC_STATUS, CharacteristicRole::MusicStatus),
    (MUSIC_POSITION, CharacteristicRole::MusicPosition),
    (MUSIC_LENGTH, CharacteristicRole::MusicLength),
    (NAVIGATION_FLAGS, CharacteristicRole::NavigationFlags),
    (NAVIGATION_NARRATIVE, CharacteristicRole::NavigationNarrative),
    (NAVIGATION_DISTANCE, CharacteristicRole::NavigationDistance),
    (NAVIGATION_PROGRESS, CharacteristicRole::NavigationProgress),
    (BLEFS_TRANSFER, CharacteristicRole::BlefsTransfer),
    (DFU_CONTROL_POINT, CharacteristicRole::DfuControlPoint),
    (DFU_PACKET, CharacteristicRole::DfuPacket),
    (
        MODEL_NUMBER,
        CharacteristicRole::DeviceInfo(DeviceInfoField::ModelNumber),
    ),
    (
        SERIAL_NUMBER,
        CharacteristicRole::DeviceInfo(DeviceInfoField::SerialNumber),
    ),
    (
        FIRMWARE_REVISION,
        CharacteristicRole::DeviceInfo(DeviceInfoField::Firmware),
    ),
    (
        HARDWARE_REVISION,
        CharacteristicRole::DeviceInfo(DeviceInfoField::HardwareRevision),
    ),
    (
        SOFTWARE_REVISION,
        CharacteristicRole::DeviceInfo(DeviceInfoField::SoftwareRevision),
    ),
    (
        MANUFACTURER_NAME,
        CharacteristicRole::DeviceInfo(DeviceInfoField::Manufacturer),
    ),
];

/// Role for a characteristic UUID, `None` for characteristics the link does not use.
pub fn role_for_uuid(uuid: Uuid) -> Option<CharacteristicRole> {
    ROLE_TABLE
        .iter()
        .find(|(known, _)| *known == uuid)
        .map(|(_, role)| *role)
}

impl CharacteristicRole {
    pub fn uuid(&self) -> Uuid {
        ROLE_TABLE
            .iter()
            .find(|(_, role)| role == self)
            .map(|(uuid, _)| *uuid)
            .unwrap_or_else(Uuid::nil)
    }

    /// Roles whose values arrive as notifications.
    pub fn notifies(&self) -> bool {
        matches!(
            self,
            Self::Battery
                | Self::HeartRate
                | Self::StepCount
                | Self::Motion
                | Self::MusicControl
                | Self::BlefsTransfer
                | Self::DfuControlPoint
        )
    }

    /// Roles read once right after discovery.
    pub fn read_on_discovery(&self) -> bool {
        matches!(self, Self::DeviceInfo(_) | Self::Battery | Self::StepCount)
    }
}
