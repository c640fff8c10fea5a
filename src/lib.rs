//! InfiniLink: connects to an InfiniTime watch over Bluetooth LE.
//!
//! The crate owns one BLE session, routes characteristic traffic by role, and runs the
//! watch's remote filesystem (BLEFS) and firmware update (DFU) protocols on top of it.

pub mod domain;
pub mod infrastructure;

pub use infrastructure::bluetooth::{BluetoothService, WatchClient};
