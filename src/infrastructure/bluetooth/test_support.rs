//! Test doubles for the Bluetooth layer.

use crate::domain::models::{DeviceId, DiscoveredPeripheral};
use crate::infrastructure::bluetooth::blefs::frame::{self, u16_at, u32_at, FLAG_DIRECTORY, STATUS_OK};
use crate::infrastructure::bluetooth::platform::{BlePlatform, PlatformError, WriteKind};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum PlatformCall {
    StartScan,
    StopScan,
    Connect(DeviceId),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId, Uuid),
    Read(Uuid),
    Write(Uuid, Vec<u8>, WriteKind),
    SetNotify(Uuid, bool),
}

/// Records every request; never produces events on its own.
#[derive(Default)]
pub struct RecordingPlatform {
    calls: Mutex<Vec<PlatformCall>>,
    known: Mutex<Vec<DiscoveredPeripheral>>,
    fail_writes: AtomicBool,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peripherals `retrieve_peripheral` can resolve.
    pub fn with_known(peripherals: Vec<DiscoveredPeripheral>) -> Self {
        let platform = Self::default();
        *platform.known.lock().unwrap() = peripherals;
        platform
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<PlatformCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                PlatformCall::Write(uuid, value, _) if *uuid == characteristic => {
                    Some(value.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BlePlatform for RecordingPlatform {
    fn start_scan(&self) -> Result<(), PlatformError> {
        self.record(PlatformCall::StartScan);
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), PlatformError> {
        self.record(PlatformCall::StopScan);
        Ok(())
    }

    fn retrieve_peripheral(&self, id: &DeviceId) -> Option<DiscoveredPeripheral> {
        self.known
            .lock()
            .unwrap()
            .iter()
            .find(|p| &p.id == id)
            .cloned()
    }

    fn connect(&self, id: &DeviceId) -> Result<(), PlatformError> {
        self.record(PlatformCall::Connect(id.clone()));
        Ok(())
    }

    fn cancel_connection(&self, id: &DeviceId) -> Result<(), PlatformError> {
        self.record(PlatformCall::CancelConnection(id.clone()));
        Ok(())
    }

    fn discover_services(&self, id: &DeviceId) -> Result<(), PlatformError> {
        self.record(PlatformCall::DiscoverServices(id.clone()));
        Ok(())
    }

    fn discover_characteristics(&self, id: &DeviceId, service: Uuid) -> Result<(), PlatformError> {
        self.record(PlatformCall::DiscoverCharacteristics(id.clone(), service));
        Ok(())
    }

    fn read(&self, characteristic: Uuid) -> Result<(), PlatformError> {
        self.record(PlatformCall::Read(characteristic));
        Ok(())
    }

    fn write(
        &self,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), PlatformError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PlatformError::LinkLost);
        }
        self.record(PlatformCall::Write(characteristic, value.to_vec(), kind));
        Ok(())
    }

    fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<(), PlatformError> {
        self.record(PlatformCall::SetNotify(characteristic, enabled));
        Ok(())
    }
}

pub fn peripheral(id: &str, name: Option<&str>) -> DiscoveredPeripheral {
    DiscoveredPeripheral {
        id: DeviceId::new(id),
        name: name.map(str::to_string),
        rssi: Some(-60),
    }
}

const STATUS_ERROR: u8 = 0x05;
const FREE_SPACE: u32 = 100_000;

struct PendingWrite {
    path: String,
    total: u32,
    buffer: Vec<u8>,
}

/// In-memory watch filesystem answering BLEFS frames the way the firmware does.
#[derive(Default)]
pub struct FakeWatchFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    reading: Option<String>,
    writing: Option<PendingWrite>,
}

impl FakeWatchFs {
    pub fn new() -> Self {
        let mut fs = Self::default();
        fs.dirs.insert("/".to_string());
        fs
    }

    pub fn insert_file(&mut self, path: &str, data: Vec<u8>) {
        self.insert_parents(path);
        self.files.insert(path.to_string(), data);
    }

    pub fn insert_dir(&mut self, path: &str) {
        self.insert_parents(path);
        self.dirs.insert(path.to_string());
    }

    pub fn file(&self, path: &str) -> Option<&Vec<u8>> {
        self.files.get(path)
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    pub fn free_space(&self) -> u32 {
        FREE_SPACE
    }

    /// Responses to one frame written by the host.
    pub fn handle(&mut self, request: &[u8]) -> Vec<Vec<u8>> {
        match request[0] {
            frame::READ_FILE => {
                let path = path_at(request, 12, u16_at(request, 2));
                let offset = u32_at(request, 4);
                let chunk = u32_at(request, 8);
                self.reading = Some(path);
                vec![self.read_chunk(offset, chunk)]
            }
            frame::READ_PACING => {
                let offset = u32_at(request, 4);
                let chunk = u32_at(request, 8);
                vec![self.read_chunk(offset, chunk)]
            }
            frame::WRITE_FILE => {
                let path = path_at(request, 20, u16_at(request, 2));
                let total = u32_at(request, 16);
                let buffer = Vec::new();
                let done = total == 0;
                self.writing = Some(PendingWrite {
                    path: path.clone(),
                    total,
                    buffer,
                });
                if done {
                    self.commit_write();
                }
                vec![Self::write_response(STATUS_OK, 0)]
            }
            frame::WRITE_DATA => {
                let offset = u32_at(request, 4);
                let size = u32_at(request, 8) as usize;
                let data = &request[frame::WRITE_DATA_HEADER..frame::WRITE_DATA_HEADER + size];
                let Some(pending) = self.writing.as_mut() else {
                    return vec![Self::write_response(STATUS_ERROR, offset)];
                };
                pending.buffer.extend_from_slice(data);
                let received = pending.buffer.len() as u32;
                if received >= pending.total {
                    self.commit_write();
                }
                vec![Self::write_response(STATUS_OK, received)]
            }
            frame::DELETE => {
                let path = path_at(request, 4, u16_at(request, 2));
                let removed = self.files.remove(&path).is_some() || self.dirs.remove(&path);
                vec![vec![frame::DELETE_RESPONSE, status(removed)]]
            }
            frame::MAKE_DIR => {
                let path = path_at(request, 16, u16_at(request, 2));
                self.insert_dir(&path);
                let mut response = vec![frame::MAKE_DIR_RESPONSE, STATUS_OK];
                response.resize(frame::MAKE_DIR_RESPONSE_LEN, 0);
                vec![response]
            }
            frame::LIST_DIR => {
                let path = path_at(request, 4, u16_at(request, 2));
                self.list(&path)
            }
            frame::MOVE => {
                let from_len = u16_at(request, 2) as usize;
                let to_len = u16_at(request, 4);
                let from = path_at(request, 6, from_len as u16);
                let to = path_at(request, 6 + from_len + 1, to_len);
                let moved = match self.files.remove(&from) {
                    Some(data) => {
                        self.insert_file(&to, data);
                        true
                    }
                    None => false,
                };
                vec![vec![frame::MOVE_RESPONSE, status(moved)]]
            }
            other => panic!("fake watch got unknown command 0x{:02x}", other),
        }
    }

    pub fn read_response(status: u8, offset: u32, total: u32, data: &[u8]) -> Vec<u8> {
        let mut response = vec![frame::READ_RESPONSE, status, 0, 0];
        response.extend_from_slice(&offset.to_le_bytes());
        response.extend_from_slice(&total.to_le_bytes());
        response.extend_from_slice(&(data.len() as u32).to_le_bytes());
        response.extend_from_slice(data);
        response
    }

    pub fn write_response(status: u8, offset: u32) -> Vec<u8> {
        let mut response = vec![frame::WRITE_RESPONSE, status, 0, 0];
        response.extend_from_slice(&offset.to_le_bytes());
        response.extend_from_slice(&0u64.to_le_bytes());
        response.extend_from_slice(&FREE_SPACE.to_le_bytes());
        response
    }

    pub fn list_entry(entry: u32, total: u32, is_dir: bool, size: u32, name: &str) -> Vec<u8> {
        let mut response = vec![frame::LIST_DIR_RESPONSE, STATUS_OK];
        response.extend_from_slice(&(name.len() as u16).to_le_bytes());
        response.extend_from_slice(&entry.to_le_bytes());
        response.extend_from_slice(&total.to_le_bytes());
        let flags = if is_dir { FLAG_DIRECTORY } else { 0 };
        response.extend_from_slice(&flags.to_le_bytes());
        response.extend_from_slice(&0u64.to_le_bytes());
        response.extend_from_slice(&size.to_le_bytes());
        response.extend_from_slice(name.as_bytes());
        response
    }

    fn read_chunk(&self, offset: u32, chunk: u32) -> Vec<u8> {
        let Some(data) = self.reading.as_ref().and_then(|p| self.files.get(p)) else {
            return Self::read_response(STATUS_ERROR, offset, 0, &[]);
        };
        let start = (offset as usize).min(data.len());
        let end = (start + chunk as usize).min(data.len());
        Self::read_response(STATUS_OK, offset, data.len() as u32, &data[start..end])
    }

    fn commit_write(&mut self) {
        if let Some(pending) = self.writing.take() {
            self.insert_file(&pending.path, pending.buffer);
        }
    }

    fn list(&self, dir: &str) -> Vec<Vec<u8>> {
        if !self.dirs.contains(dir) {
            let mut response = vec![frame::LIST_DIR_RESPONSE, STATUS_ERROR];
            response.resize(frame::LIST_DIR_RESPONSE_HEADER, 0);
            return vec![response];
        }

        let mut children: Vec<(String, bool, u32)> = vec![
            (".".to_string(), true, 0),
            ("..".to_string(), true, 0),
        ];
        for (path, data) in &self.files {
            if parent(path) == dir {
                children.push((base_name(path), false, data.len() as u32));
            }
        }
        for path in &self.dirs {
            if path != "/" && parent(path) == dir {
                children.push((base_name(path), true, 0));
            }
        }
        children[2..].sort_by(|a, b| a.0.cmp(&b.0));

        let total = children.len() as u32;
        let mut frames: Vec<Vec<u8>> = children
            .iter()
            .enumerate()
            .map(|(i, (name, is_dir, size))| Self::list_entry(i as u32, total, *is_dir, *size, name))
            .collect();
        frames.push(Self::list_entry(total, total, false, 0, ""));
        frames
    }

    fn insert_parents(&mut self, path: &str) {
        let mut dir = parent(path);
        while dir != "/" {
            self.dirs.insert(dir.clone());
            dir = parent(&dir);
        }
    }
}

fn status(ok: bool) -> u8 {
    if ok {
        STATUS_OK
    } else {
        STATUS_ERROR
    }
}

fn path_at(request: &[u8], at: usize, len: u16) -> String {
    String::from_utf8_lossy(&request[at..at + len as usize]).into_owned()
}

fn parent(path: &str) -> String {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or_default().to_string()
}
