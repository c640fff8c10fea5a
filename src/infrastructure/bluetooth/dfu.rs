//! Firmware Update Module
//!
//! Nordic legacy DFU as the InfiniTime bootloader speaks it. The control point
//! carries opcodes and responses, the packet characteristic carries sizes, the
//! init packet and the image itself in 20-byte packets.
//!
//! ```text
//! Init          CP 01 04, PKT sizes        ◀ 10 01 01
//!               CP 02 00, PKT init, CP 02 01 ◀ 10 02 01
//! DataTransfer  CP 08 N, CP 03, N packets  ◀ 11 bytes (repeat)
//!                                          ◀ 10 03 01
//! Validate      CP 04                      ◀ 10 04 01
//! Finalize      CP 05                      ◀ link drops while the watch reboots
//! Complete
//! ```

use crate::domain::firmware::FirmwareImage;
use crate::domain::models::DfuProgress;
use crate::infrastructure::bluetooth::platform::WriteKind;
use tracing::{debug, info, trace, warn};

pub const PACKET_SIZE: usize = 20;
pub const DEFAULT_PACKETS_PER_RECEIPT: u8 = 10;

const OP_START: u8 = 0x01;
const OP_INIT: u8 = 0x02;
const OP_RECEIVE_IMAGE: u8 = 0x03;
const OP_VALIDATE: u8 = 0x04;
const OP_ACTIVATE_AND_RESET: u8 = 0x05;
const OP_PACKET_RECEIPT_REQUEST: u8 = 0x08;
const OP_RESPONSE: u8 = 0x10;
const OP_PACKET_RECEIPT: u8 = 0x11;

const IMAGE_TYPE_APPLICATION: u8 = 0x04;
const INIT_PACKET_START: u8 = 0x00;
const INIT_PACKET_END: u8 = 0x01;
const STATUS_SUCCESS: u8 = 0x01;

/// Published fraction never reaches 1.0 before the watch has rebooted.
const MAX_FRACTION_BEFORE_COMPLETE: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuPhase {
    Idle,
    Init,
    DataTransfer,
    Validate,
    Finalize,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuTarget {
    ControlPoint,
    Packet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuWrite {
    pub target: DfuTarget,
    pub value: Vec<u8>,
    pub kind: WriteKind,
}

impl DfuWrite {
    fn control(value: Vec<u8>) -> Self {
        Self {
            target: DfuTarget::ControlPoint,
            value,
            kind: WriteKind::WithResponse,
        }
    }

    fn packet(value: Vec<u8>) -> Self {
        Self {
            target: DfuTarget::Packet,
            value,
            kind: WriteKind::WithoutResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DfuError {
    #[error("firmware image is empty")]
    EmptyImage,
    #[error("firmware image of {0} bytes is too large")]
    ImageTooLarge(usize),
    #[error("watch is not ready")]
    NotReady,
    #[error("watch does not expose the DFU characteristics")]
    Unsupported,
    #[error("a firmware update is already running")]
    Busy,
    #[error("connection lost during {0:?}")]
    ConnectionLost(DfuPhase),
    #[error("bootloader rejected opcode 0x{opcode:02x} with status 0x{status:02x}")]
    DeviceStatus { opcode: u8, status: u8 },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Writes to issue, progress to publish and, when the update ended, its outcome.
#[derive(Debug, Default, PartialEq)]
pub struct DfuStep {
    pub writes: Vec<DfuWrite>,
    pub progress: Option<DfuProgress>,
    pub outcome: Option<Result<(), DfuError>>,
}

pub struct DfuTransfer {
    init_packet: Vec<u8>,
    image: Vec<u8>,
    packets_per_receipt: u8,
    phase: DfuPhase,
    awaiting: u8,
    bytes_sent: u64,
    packets_sent: u32,
    published: f64,
}

impl DfuTransfer {
    pub fn new(firmware: FirmwareImage, packets_per_receipt: u8) -> Result<Self, DfuError> {
        if firmware.image.is_empty() {
            return Err(DfuError::EmptyImage);
        }
        if u32::try_from(firmware.image.len()).is_err() {
            return Err(DfuError::ImageTooLarge(firmware.image.len()));
        }
        Ok(Self {
            init_packet: firmware.init_packet,
            image: firmware.image,
            packets_per_receipt: packets_per_receipt.max(1),
            phase: DfuPhase::Idle,
            awaiting: 0,
            bytes_sent: 0,
            packets_sent: 0,
            published: 0.0,
        })
    }

    pub fn phase(&self) -> DfuPhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, DfuPhase::Complete | DfuPhase::Failed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.image.len() as u64
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Index of the next 20-byte packet.
    pub fn packet_sequence(&self) -> u32 {
        self.packets_sent
    }

    pub fn progress(&self) -> DfuProgress {
        DfuProgress {
            bytes_sent: self.bytes_sent,
            total_bytes: self.total_bytes(),
            fraction: self.published,
        }
    }

    pub fn start(&mut self) -> DfuStep {
        if self.phase != DfuPhase::Idle {
            return DfuStep::default();
        }
        info!(bytes = self.image.len(), "Starting firmware update");
        self.phase = DfuPhase::Init;
        self.awaiting = OP_START;

        let mut sizes = Vec::with_capacity(12);
        sizes.extend_from_slice(&0u32.to_le_bytes()); // softdevice
        sizes.extend_from_slice(&0u32.to_le_bytes()); // bootloader
        sizes.extend_from_slice(&(self.image.len() as u32).to_le_bytes());

        DfuStep {
            writes: vec![
                DfuWrite::control(vec![OP_START, IMAGE_TYPE_APPLICATION]),
                DfuWrite::packet(sizes),
            ],
            progress: Some(self.progress()),
            outcome: None,
        }
    }

    /// Feeds one control point notification.
    pub fn on_control_point(&mut self, value: &[u8]) -> DfuStep {
        if matches!(self.phase, DfuPhase::Idle) || self.is_finished() {
            trace!(phase = ?self.phase, "Ignoring DFU notification");
            return DfuStep::default();
        }

        match value {
            [OP_RESPONSE, opcode, status, ..] => self.on_response(*opcode, *status),
            [OP_PACKET_RECEIPT, b0, b1, b2, b3, ..] => {
                self.on_receipt(u32::from_le_bytes([*b0, *b1, *b2, *b3]))
            }
            _ => self.fail(DfuError::ProtocolViolation(format!(
                "unexpected control point value {:02x?}",
                value
            ))),
        }
    }

    /// Link loss. Expected once the activate command was sent.
    pub fn on_disconnected(&mut self) -> DfuStep {
        match self.phase {
            DfuPhase::Finalize => {
                self.phase = DfuPhase::Complete;
                self.published = 1.0;
                info!("Watch rebooted into the new firmware");
                DfuStep {
                    writes: Vec::new(),
                    progress: Some(self.progress()),
                    outcome: Some(Ok(())),
                }
            }
            DfuPhase::Complete | DfuPhase::Failed => DfuStep::default(),
            phase => self.fail(DfuError::ConnectionLost(phase)),
        }
    }

    /// The watch resets before acking the activate command, so a transport
    /// error in Finalize counts as the reboot.
    pub fn abort(&mut self, error: DfuError) -> DfuStep {
        if self.is_finished() {
            return DfuStep::default();
        }
        if self.phase == DfuPhase::Finalize && matches!(error, DfuError::Transport(_)) {
            debug!("Activate write failed: {}", error);
            return self.on_disconnected();
        }
        self.fail(error)
    }

    fn on_response(&mut self, opcode: u8, status: u8) -> DfuStep {
        if status != STATUS_SUCCESS {
            return self.fail(DfuError::DeviceStatus { opcode, status });
        }
        if opcode != self.awaiting {
            return self.fail(DfuError::ProtocolViolation(format!(
                "response to 0x{:02x} while waiting for 0x{:02x}",
                opcode, self.awaiting
            )));
        }
        debug!(opcode, phase = ?self.phase, "DFU response");

        match opcode {
            OP_START => {
                self.awaiting = OP_INIT;
                DfuStep {
                    writes: vec![
                        DfuWrite::control(vec![OP_INIT, INIT_PACKET_START]),
                        DfuWrite::packet(self.init_packet.clone()),
                        DfuWrite::control(vec![OP_INIT, INIT_PACKET_END]),
                    ],
                    ..Default::default()
                }
            }
            OP_INIT => {
                self.phase = DfuPhase::DataTransfer;
                self.awaiting = OP_RECEIVE_IMAGE;
                let mut writes = vec![
                    DfuWrite::control(vec![OP_PACKET_RECEIPT_REQUEST, self.packets_per_receipt]),
                    DfuWrite::control(vec![OP_RECEIVE_IMAGE]),
                ];
                writes.extend(self.next_batch());
                DfuStep {
                    writes,
                    progress: self.publish(),
                    outcome: None,
                }
            }
            OP_RECEIVE_IMAGE => {
                if self.bytes_sent != self.total_bytes() {
                    return self.fail(DfuError::ProtocolViolation(format!(
                        "image accepted after {} of {} bytes",
                        self.bytes_sent,
                        self.total_bytes()
                    )));
                }
                self.phase = DfuPhase::Validate;
                self.awaiting = OP_VALIDATE;
                DfuStep {
                    writes: vec![DfuWrite::control(vec![OP_VALIDATE])],
                    ..Default::default()
                }
            }
            OP_VALIDATE => {
                self.phase = DfuPhase::Finalize;
                self.awaiting = OP_ACTIVATE_AND_RESET;
                info!("Firmware validated, activating");
                DfuStep {
                    writes: vec![DfuWrite::control(vec![OP_ACTIVATE_AND_RESET])],
                    ..Default::default()
                }
            }
            other => self.fail(DfuError::ProtocolViolation(format!(
                "unexpected response to 0x{:02x}",
                other
            ))),
        }
    }

    fn on_receipt(&mut self, bytes_received: u32) -> DfuStep {
        if self.phase != DfuPhase::DataTransfer {
            return self.fail(DfuError::ProtocolViolation(format!(
                "packet receipt during {:?}",
                self.phase
            )));
        }
        if bytes_received as u64 != self.bytes_sent {
            return self.fail(DfuError::ProtocolViolation(format!(
                "watch received {} bytes, sent {}",
                bytes_received, self.bytes_sent
            )));
        }
        trace!(bytes_received, "DFU packet receipt");

        DfuStep {
            writes: self.next_batch(),
            progress: self.publish(),
            outcome: None,
        }
    }

    fn next_batch(&mut self) -> Vec<DfuWrite> {
        let mut writes = Vec::with_capacity(self.packets_per_receipt as usize);
        for _ in 0..self.packets_per_receipt {
            let start = self.bytes_sent as usize;
            if start >= self.image.len() {
                break;
            }
            let end = (start + PACKET_SIZE).min(self.image.len());
            writes.push(DfuWrite::packet(self.image[start..end].to_vec()));
            self.bytes_sent = end as u64;
            self.packets_sent += 1;
        }
        writes
    }

    /// Progress for the bytes handed out so far, only when it moved forward.
    fn publish(&mut self) -> Option<DfuProgress> {
        let fraction = (self.bytes_sent as f64 / self.total_bytes() as f64)
            .min(MAX_FRACTION_BEFORE_COMPLETE);
        if fraction <= self.published {
            return None;
        }
        self.published = fraction;
        Some(self.progress())
    }

    fn fail(&mut self, error: DfuError) -> DfuStep {
        warn!(phase = ?self.phase, bytes_sent = self.bytes_sent, "Firmware update failed: {}", error);
        self.phase = DfuPhase::Failed;
        DfuStep {
            outcome: Some(Err(error)),
            ..Default::default()
        }
    }
}
