//! BLEFS Module
//!
//! Remote filesystem over the single file transfer characteristic.
//!
//! Every operation is a [`BlefsTransfer`]: a small state machine that turns the
//! watch's notifications into the next frame to write. [`BlefsQueue`] keeps at most
//! one transfer on the wire and starts queued requests in arrival order.
//!
//! ```text
//! Idle ──start──▶ RequestSent ──first chunk──▶ AwaitingChunks ──last chunk──▶ Complete
//!                     │                              │
//!                     └──── bad frame / status ──────┴──────────────────────▶ Failed
//! ```

pub mod frame;
pub mod upload;

use crate::domain::models::{FsOperationKind, TransferProgress};
use frame::{FrameError, Response, FLAG_DIRECTORY, STATUS_OK};
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Default payload bytes per read or write chunk.
pub const DEFAULT_CHUNK_SIZE: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsRequest {
    ListDir { path: String },
    ReadFile { path: String },
    WriteFile { path: String, data: Vec<u8> },
    Delete { path: String },
    Rename { from: String, to: String },
    MakeDir { path: String },
}

impl FsRequest {
    pub fn kind(&self) -> FsOperationKind {
        match self {
            Self::ListDir { .. } => FsOperationKind::ListDir,
            Self::ReadFile { .. } => FsOperationKind::ReadFile,
            Self::WriteFile { .. } => FsOperationKind::WriteFile,
            Self::Delete { .. } => FsOperationKind::Delete,
            Self::Rename { .. } => FsOperationKind::Rename,
            Self::MakeDir { .. } => FsOperationKind::MakeDir,
        }
    }

    fn path(&self) -> &str {
        match self {
            Self::ListDir { path }
            | Self::ReadFile { path }
            | Self::WriteFile { path, .. }
            | Self::Delete { path }
            | Self::MakeDir { path } => path,
            Self::Rename { from, .. } => from,
        }
    }

    fn response_command(&self) -> u8 {
        match self {
            Self::ListDir { .. } => frame::LIST_DIR_RESPONSE,
            Self::ReadFile { .. } => frame::READ_RESPONSE,
            Self::WriteFile { .. } => frame::WRITE_RESPONSE,
            Self::Delete { .. } => frame::DELETE_RESPONSE,
            Self::Rename { .. } => frame::MOVE_RESPONSE,
            Self::MakeDir { .. } => frame::MAKE_DIR_RESPONSE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsResponse {
    Listing(Vec<DirEntry>),
    Data(Vec<u8>),
    Written { bytes: u64, free_space: u32 },
    Done,
}

/// One record of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u32,
    /// Modification time in nanoseconds since the epoch, as the watch reports it.
    pub modified: u64,
}

/// Drops the `.` and `..` records the watch includes in every listing.
pub fn visible_entries(entries: Vec<DirEntry>) -> Vec<DirEntry> {
    entries
        .into_iter()
        .filter(|e| e.path != "." && e.path != "..")
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlefsError {
    #[error("connection lost during transfer")]
    ConnectionLost,
    #[error("watch is not ready")]
    NotReady,
    #[error("watch does not expose the file transfer characteristic")]
    Unsupported,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("watch rejected command 0x{command:02x} with status 0x{status:02x}")]
    DeviceStatus { command: u8, status: u8 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<FrameError> for BlefsError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::PathTooLong(_) => Self::InvalidRequest(e.to_string()),
            _ => Self::ProtocolViolation(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Idle,
    RequestSent,
    AwaitingChunks,
    Complete,
    Failed,
}

/// What the caller has to do after feeding the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send(Vec<u8>),
    Pending,
    Finished(Result<FsResponse, BlefsError>),
}

/// State of a single filesystem operation.
#[derive(Debug)]
pub struct BlefsTransfer {
    request: FsRequest,
    chunk_size: u32,
    phase: TransferPhase,
    progress: TransferProgress,
    /// Next expected read offset, or bytes handed to the watch so far on write.
    offset: u32,
    entries: Vec<DirEntry>,
    data: Vec<u8>,
}

impl BlefsTransfer {
    pub fn new(request: FsRequest, chunk_size: u32) -> Self {
        Self {
            progress: TransferProgress::new(request.kind()),
            request,
            chunk_size: chunk_size.max(1),
            phase: TransferPhase::Idle,
            offset: 0,
            entries: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn progress(&self) -> TransferProgress {
        self.progress
    }

    pub fn request(&self) -> &FsRequest {
        &self.request
    }

    /// Builds the opening frame.
    pub fn start(&mut self) -> Step {
        if self.phase != TransferPhase::Idle {
            return Step::Pending;
        }

        let encoded = match &self.request {
            FsRequest::ListDir { path } => frame::encode_list_dir(path),
            FsRequest::ReadFile { path } => frame::encode_read_request(path, 0, self.chunk_size),
            FsRequest::WriteFile { path, data } => match u32::try_from(data.len()) {
                Ok(total) => {
                    self.progress.total_bytes = total as u64;
                    frame::encode_write_request(path, 0, modified_now(), total)
                }
                Err(_) => {
                    return self.fail(BlefsError::InvalidRequest(format!(
                        "{} bytes do not fit a single file",
                        data.len()
                    )))
                }
            },
            FsRequest::Delete { path } => frame::encode_delete(path),
            FsRequest::Rename { from, to } => frame::encode_move(from, to),
            FsRequest::MakeDir { path } => frame::encode_make_dir(path, modified_now()),
        };

        match encoded {
            Ok(bytes) => {
                debug!(operation = %self.request.kind(), path = self.request.path(), "BLEFS request sent");
                self.phase = TransferPhase::RequestSent;
                Step::Send(bytes)
            }
            Err(e) => self.fail(e.into()),
        }
    }

    /// Feeds one notification from the transfer characteristic.
    pub fn on_frame(&mut self, bytes: &[u8]) -> Step {
        if !matches!(
            self.phase,
            TransferPhase::RequestSent | TransferPhase::AwaitingChunks
        ) {
            trace!(phase = ?self.phase, "Frame outside an active transfer");
            return Step::Pending;
        }

        let response = match Response::decode(bytes) {
            Ok(response) => response,
            Err(e) => return self.fail(e.into()),
        };

        let expected = self.request.response_command();
        if response.command() != expected {
            return self.fail(BlefsError::ProtocolViolation(format!(
                "expected response 0x{:02x}, got 0x{:02x}",
                expected,
                response.command()
            )));
        }
        if response.status() != STATUS_OK {
            return self.fail(BlefsError::DeviceStatus {
                command: response.command(),
                status: response.status(),
            });
        }

        match response {
            Response::ListEntry {
                entry_number,
                total_entries,
                flags,
                modified,
                size,
                path,
                ..
            } => self.on_list_entry(entry_number, total_entries, flags, modified, size, path),
            Response::Read {
                offset,
                total_length,
                chunk_length,
                data,
                ..
            } => self.on_read_chunk(offset, total_length, chunk_length, data),
            Response::Write {
                offset, free_space, ..
            } => self.on_write_ack(offset, free_space),
            Response::Delete { .. } | Response::Move { .. } | Response::MakeDir { .. } => {
                self.finish(FsResponse::Done)
            }
        }
    }

    /// Disconnect is the only cancellation; partial state is discarded.
    pub fn on_disconnected(&mut self) -> Step {
        match self.phase {
            TransferPhase::Complete | TransferPhase::Failed => Step::Pending,
            _ => self.fail(BlefsError::ConnectionLost),
        }
    }

    pub fn abort(&mut self, error: BlefsError) -> Step {
        match self.phase {
            TransferPhase::Complete | TransferPhase::Failed => Step::Pending,
            _ => self.fail(error),
        }
    }

    fn on_list_entry(
        &mut self,
        entry_number: u32,
        total_entries: u32,
        flags: u32,
        modified: u64,
        size: u32,
        path: String,
    ) -> Step {
        if entry_number >= total_entries {
            let entries = std::mem::take(&mut self.entries);
            return self.finish(FsResponse::Listing(entries));
        }
        if entry_number as usize != self.entries.len() {
            return self.fail(BlefsError::ProtocolViolation(format!(
                "listing entry {} arrived after {} entries",
                entry_number,
                self.entries.len()
            )));
        }

        self.phase = TransferPhase::AwaitingChunks;
        self.entries.push(DirEntry {
            path,
            is_dir: flags & FLAG_DIRECTORY != 0,
            size,
            modified,
        });
        Step::Pending
    }

    fn on_read_chunk(
        &mut self,
        offset: u32,
        total_length: u32,
        chunk_length: u32,
        mut data: Vec<u8>,
    ) -> Step {
        if offset != self.offset {
            return self.fail(BlefsError::ProtocolViolation(format!(
                "read chunk at offset {}, expected {}",
                offset, self.offset
            )));
        }
        if data.len() < chunk_length as usize {
            return self.fail(BlefsError::ProtocolViolation(format!(
                "read chunk announces {} bytes, carries {}",
                chunk_length,
                data.len()
            )));
        }
        let end = offset as u64 + chunk_length as u64;
        if end > total_length as u64 || (chunk_length == 0 && offset < total_length) {
            return self.fail(BlefsError::ProtocolViolation(format!(
                "read chunk {}+{} does not fit total {}",
                offset, chunk_length, total_length
            )));
        }

        data.truncate(chunk_length as usize);
        self.data.extend_from_slice(&data);
        self.offset = end as u32;
        self.phase = TransferPhase::AwaitingChunks;
        self.progress.total_bytes = total_length as u64;
        self.progress.bytes_transferred = end;
        trace!(offset, chunk_length, total_length, "BLEFS read chunk");

        if self.offset == total_length {
            let data = std::mem::take(&mut self.data);
            return self.finish(FsResponse::Data(data));
        }
        Step::Send(frame::encode_read_pacing(self.offset, self.chunk_size))
    }

    fn on_write_ack(&mut self, offset: u32, free_space: u32) -> Step {
        if offset != self.offset {
            return self.fail(BlefsError::ProtocolViolation(format!(
                "write acknowledged offset {}, sent {}",
                offset, self.offset
            )));
        }

        let FsRequest::WriteFile { data, .. } = &self.request else {
            return self.fail(BlefsError::ProtocolViolation(
                "write acknowledgement outside a write".to_string(),
            ));
        };
        let total = data.len() as u32;
        self.progress.bytes_transferred = offset as u64;

        if offset == total {
            return self.finish(FsResponse::Written {
                bytes: total as u64,
                free_space,
            });
        }

        let start = offset as usize;
        let end = (start + self.chunk_size as usize).min(data.len());
        let chunk = frame::encode_write_data(offset, &data[start..end]);
        trace!(offset, len = end - start, total, "BLEFS write chunk");
        self.offset = end as u32;
        self.phase = TransferPhase::AwaitingChunks;
        Step::Send(chunk)
    }

    fn finish(&mut self, response: FsResponse) -> Step {
        self.phase = TransferPhase::Complete;
        info!(operation = %self.request.kind(), path = self.request.path(), "BLEFS operation complete");
        Step::Finished(Ok(response))
    }

    fn fail(&mut self, error: BlefsError) -> Step {
        self.phase = TransferPhase::Failed;
        self.entries.clear();
        self.data.clear();
        warn!(operation = %self.request.kind(), path = self.request.path(), "BLEFS operation failed: {}", error);
        Step::Finished(Err(error))
    }
}

fn modified_now() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|ns| ns.max(0) as u64)
        .unwrap_or_default()
}

pub type FsReply = oneshot::Sender<Result<FsResponse, BlefsError>>;

/// A request waiting for the wire.
pub struct PendingRequest {
    pub request: FsRequest,
    pub reply: FsReply,
}

/// Frames to write and progress to publish after a queue operation.
#[derive(Debug, Default, PartialEq)]
pub struct QueueOutput {
    pub send: Option<Vec<u8>>,
    pub progress: Vec<TransferProgress>,
}

/// Serializes filesystem operations: one on the wire, the rest in FIFO order.
pub struct BlefsQueue {
    chunk_size: u32,
    active: Option<(BlefsTransfer, FsReply)>,
    waiting: VecDeque<PendingRequest>,
}

impl BlefsQueue {
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size,
            active: None,
            waiting: VecDeque::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Active plus waiting requests.
    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.active.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_progress(&self) -> Option<TransferProgress> {
        self.active.as_ref().map(|(transfer, _)| transfer.progress())
    }

    pub fn submit(&mut self, request: FsRequest, reply: FsReply) -> QueueOutput {
        self.waiting.push_back(PendingRequest { request, reply });
        if self.active.is_some() {
            debug!(queued = self.waiting.len(), "BLEFS request queued");
            return QueueOutput::default();
        }
        let mut output = QueueOutput::default();
        self.start_next(&mut output);
        output
    }

    pub fn on_notification(&mut self, bytes: &[u8]) -> QueueOutput {
        let mut output = QueueOutput::default();
        let Some((transfer, _)) = self.active.as_mut() else {
            warn!(len = bytes.len(), "BLEFS notification with no request in flight");
            return output;
        };

        let step = transfer.on_frame(bytes);
        output.progress.push(transfer.progress());
        self.apply(step, &mut output);
        output
    }

    /// Fails the operation on the wire, e.g. after its write was rejected.
    pub fn abort_active(&mut self, error: BlefsError) -> QueueOutput {
        let mut output = QueueOutput::default();
        if let Some((transfer, _)) = self.active.as_mut() {
            let step = transfer.abort(error);
            self.apply(step, &mut output);
        }
        output
    }

    /// Fails everything, active and queued. Used on disconnect.
    pub fn fail_all(&mut self, error: BlefsError) {
        if let Some((mut transfer, reply)) = self.active.take() {
            if let Step::Finished(result) = transfer.abort(error.clone()) {
                let _ = reply.send(result);
            }
        }
        if !self.waiting.is_empty() {
            info!(count = self.waiting.len(), "Failing queued BLEFS requests");
        }
        for pending in self.waiting.drain(..) {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }

    fn apply(&mut self, step: Step, output: &mut QueueOutput) {
        match step {
            Step::Send(bytes) => output.send = Some(bytes),
            Step::Pending => {}
            Step::Finished(result) => {
                if let Some((_, reply)) = self.active.take() {
                    let _ = reply.send(result);
                }
                self.start_next(output);
            }
        }
    }

    fn start_next(&mut self, output: &mut QueueOutput) {
        while let Some(pending) = self.waiting.pop_front() {
            if pending.reply.is_closed() {
                debug!(operation = %pending.request.kind(), "Dropping abandoned BLEFS request");
                continue;
            }

            let mut transfer = BlefsTransfer::new(pending.request, self.chunk_size);
            match transfer.start() {
                Step::Send(bytes) => {
                    output.progress.push(transfer.progress());
                    output.send = Some(bytes);
                    self.active = Some((transfer, pending.reply));
                    return;
                }
                Step::Finished(result) => {
                    let _ = pending.reply.send(result);
                }
                Step::Pending => {}
            }
        }
    }
}
