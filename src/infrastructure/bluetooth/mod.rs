//! Bluetooth Module
//!
//! BLE central link to an InfiniTime watch.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      WatchClient                         │
//! │        (cloneable handle, oneshot replies)               │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ BluetoothCommand
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   BluetoothService                       │
//! │  (single owner: session, dispatcher, BLEFS queue, DFU)   │
//! └──────┬──────────────┬──────────────┬─────────────┬──────┘
//!        │              │              │             │
//!        ▼              ▼              ▼             ▼
//! ┌────────────┐ ┌────────────┐ ┌───────────┐ ┌───────────┐
//! │ Connection │ │ Dispatcher │ │   BLEFS   │ │    DFU    │
//! │ - scanning │ │ - roles    │ │ - frames  │ │ - phases  │
//! │ - pairing  │ │ - routing  │ │ - queue   │ │ - receipts│
//! │ - retries  │ │ - writes   │ │           │ │           │
//! └─────┬──────┘ └─────┬──────┘ └───────────┘ └───────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          BlePlatform  ◄──── BleEvent channel             │
//! │        (btleplug backend, scanner event pump)            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`platform`] - Host capability trait and callback events
//! - [`backend`] - btleplug implementation of the platform
//! - [`scanner`] - Adapter event pump
//! - [`connection`] - Session lifecycle, pairing identity and reconnect policy
//! - [`protocol`] - UUIDs and characteristic roles
//! - [`registry`] - Per-connection characteristic bindings
//! - [`dispatcher`] - Routing of value updates and role writes
//! - [`payloads`] - Characteristic value codecs
//! - [`blefs`] - Remote filesystem protocol
//! - [`dfu`] - Firmware update protocol
//! - [`service`] - Event loop owning all link state
//! - [`client`] - Async handle for callers

pub mod backend;
pub mod blefs;
pub mod client;
pub mod connection;
pub mod dfu;
pub mod dispatcher;
pub mod payloads;
pub mod platform;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod service;

#[cfg(test)]
pub mod test_support;

pub use client::{ClientError, WatchClient};
pub use service::{BluetoothCommand, BluetoothService};
