//! BLEFS Frame Codec
//!
//! Adafruit file transfer protocol as implemented by InfiniTime. All integers are
//! little-endian; paths are UTF-8 without a terminator.
//!
//! ```text
//! read        0x10 pad len:u16 offset:u32 chunk:u32 path
//! read resp   0x11 status pad:2 offset:u32 total:u32 chunk_len:u32 data
//! read pace   0x12 status pad:2 offset:u32 chunk:u32
//! write       0x20 pad len:u16 offset:u32 mtime:u64 total:u32 path
//! write resp  0x21 status pad:2 offset:u32 mtime:u64 free:u32
//! write data  0x22 status pad:2 offset:u32 size:u32 data
//! delete      0x30 pad len:u16 path
//! delete resp 0x31 status
//! mkdir       0x40 pad len:u16 pad:4 mtime:u64 path
//! mkdir resp  0x41 status pad:6 mtime:u64
//! list        0x50 pad len:u16 path
//! list resp   0x51 status len:u16 entry:u32 total:u32 flags:u32 mtime:u64 size:u32 path
//! move        0x60 pad old_len:u16 new_len:u16 old pad new
//! move resp   0x61 status
//! ```

pub const READ_FILE: u8 = 0x10;
pub const READ_RESPONSE: u8 = 0x11;
pub const READ_PACING: u8 = 0x12;
pub const WRITE_FILE: u8 = 0x20;
pub const WRITE_RESPONSE: u8 = 0x21;
pub const WRITE_DATA: u8 = 0x22;
pub const DELETE: u8 = 0x30;
pub const DELETE_RESPONSE: u8 = 0x31;
pub const MAKE_DIR: u8 = 0x40;
pub const MAKE_DIR_RESPONSE: u8 = 0x41;
pub const LIST_DIR: u8 = 0x50;
pub const LIST_DIR_RESPONSE: u8 = 0x51;
pub const MOVE: u8 = 0x60;
pub const MOVE_RESPONSE: u8 = 0x61;

pub const STATUS_OK: u8 = 0x01;

/// Directory flag in list responses.
pub const FLAG_DIRECTORY: u32 = 0x01;

pub const READ_RESPONSE_HEADER: usize = 16;
pub const WRITE_RESPONSE_LEN: usize = 20;
pub const WRITE_DATA_HEADER: usize = 12;
pub const MAKE_DIR_RESPONSE_LEN: usize = 16;
pub const LIST_DIR_RESPONSE_HEADER: usize = 28;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("frame 0x{command:02x} truncated: need {expected} bytes, got {actual}")]
    Truncated {
        command: u8,
        expected: usize,
        actual: usize,
    },
    #[error("path is {0} bytes, longer than a frame can carry")]
    PathTooLong(usize),
}

/// Responses sent by the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Read {
        status: u8,
        offset: u32,
        total_length: u32,
        chunk_length: u32,
        data: Vec<u8>,
    },
    Write {
        status: u8,
        offset: u32,
        modified: u64,
        free_space: u32,
    },
    Delete {
        status: u8,
    },
    MakeDir {
        status: u8,
        modified: u64,
    },
    ListEntry {
        status: u8,
        entry_number: u32,
        total_entries: u32,
        flags: u32,
        modified: u64,
        size: u32,
        path: String,
    },
    Move {
        status: u8,
    },
}

impl Response {
    pub fn command(&self) -> u8 {
        match self {
            Self::Read { .. } => READ_RESPONSE,
            Self::Write { .. } => WRITE_RESPONSE,
            Self::Delete { .. } => DELETE_RESPONSE,
            Self::MakeDir { .. } => MAKE_DIR_RESPONSE,
            Self::ListEntry { .. } => LIST_DIR_RESPONSE,
            Self::Move { .. } => MOVE_RESPONSE,
        }
    }

    pub fn status(&self) -> u8 {
        match self {
            Self::Read { status, .. }
            | Self::Write { status, .. }
            | Self::Delete { status }
            | Self::MakeDir { status, .. }
            | Self::ListEntry { status, .. }
            | Self::Move { status } => *status,
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let command = *frame.first().ok_or(FrameError::Empty)?;
        let need = |expected: usize| {
            if frame.len() < expected {
                Err(FrameError::Truncated {
                    command,
                    expected,
                    actual: frame.len(),
                })
            } else {
                Ok(())
            }
        };

        match command {
            READ_RESPONSE => {
                need(READ_RESPONSE_HEADER)?;
                Ok(Self::Read {
                    status: frame[1],
                    offset: u32_at(frame, 4),
                    total_length: u32_at(frame, 8),
                    chunk_length: u32_at(frame, 12),
                    data: frame[READ_RESPONSE_HEADER..].to_vec(),
                })
            }
            WRITE_RESPONSE => {
                need(WRITE_RESPONSE_LEN)?;
                Ok(Self::Write {
                    status: frame[1],
                    offset: u32_at(frame, 4),
                    modified: u64_at(frame, 8),
                    free_space: u32_at(frame, 16),
                })
            }
            DELETE_RESPONSE => {
                need(2)?;
                Ok(Self::Delete { status: frame[1] })
            }
            MAKE_DIR_RESPONSE => {
                need(MAKE_DIR_RESPONSE_LEN)?;
                Ok(Self::MakeDir {
                    status: frame[1],
                    modified: u64_at(frame, 8),
                })
            }
            LIST_DIR_RESPONSE => {
                need(LIST_DIR_RESPONSE_HEADER)?;
                let path_len = u16_at(frame, 2) as usize;
                need(LIST_DIR_RESPONSE_HEADER + path_len)?;
                let path_bytes =
                    &frame[LIST_DIR_RESPONSE_HEADER..LIST_DIR_RESPONSE_HEADER + path_len];
                Ok(Self::ListEntry {
                    status: frame[1],
                    entry_number: u32_at(frame, 4),
                    total_entries: u32_at(frame, 8),
                    flags: u32_at(frame, 12),
                    modified: u64_at(frame, 16),
                    size: u32_at(frame, 24),
                    path: String::from_utf8_lossy(path_bytes).into_owned(),
                })
            }
            MOVE_RESPONSE => {
                need(2)?;
                Ok(Self::Move { status: frame[1] })
            }
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

fn path_len(path: &str) -> Result<u16, FrameError> {
    u16::try_from(path.len()).map_err(|_| FrameError::PathTooLong(path.len()))
}

pub fn encode_read_request(path: &str, offset: u32, chunk_size: u32) -> Result<Vec<u8>, FrameError> {
    let len = path_len(path)?;
    let mut frame = Vec::with_capacity(12 + path.len());
    frame.extend_from_slice(&[READ_FILE, 0x00]);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend_from_slice(&chunk_size.to_le_bytes());
    frame.extend_from_slice(path.as_bytes());
    Ok(frame)
}

pub fn encode_read_pacing(offset: u32, chunk_size: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    frame.extend_from_slice(&[READ_PACING, STATUS_OK, 0x00, 0x00]);
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend_from_slice(&chunk_size.to_le_bytes());
    frame
}

pub fn encode_write_request(
    path: &str,
    offset: u32,
    modified: u64,
    total_size: u32,
) -> Result<Vec<u8>, FrameError> {
    let len = path_len(path)?;
    let mut frame = Vec::with_capacity(20 + path.len());
    frame.extend_from_slice(&[WRITE_FILE, 0x00]);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend_from_slice(&modified.to_le_bytes());
    frame.extend_from_slice(&total_size.to_le_bytes());
    frame.extend_from_slice(path.as_bytes());
    Ok(frame)
}

pub fn encode_write_data(offset: u32, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(WRITE_DATA_HEADER + data.len());
    frame.extend_from_slice(&[WRITE_DATA, STATUS_OK, 0x00, 0x00]);
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(data);
    frame
}

pub fn encode_delete(path: &str) -> Result<Vec<u8>, FrameError> {
    let len = path_len(path)?;
    let mut frame = Vec::with_capacity(4 + path.len());
    frame.extend_from_slice(&[DELETE, 0x00]);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(path.as_bytes());
    Ok(frame)
}

pub fn encode_make_dir(path: &str, modified: u64) -> Result<Vec<u8>, FrameError> {
    let len = path_len(path)?;
    let mut frame = Vec::with_capacity(16 + path.len());
    frame.extend_from_slice(&[MAKE_DIR, 0x00]);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&[0x00; 4]);
    frame.extend_from_slice(&modified.to_le_bytes());
    frame.extend_from_slice(path.as_bytes());
    Ok(frame)
}

pub fn encode_list_dir(path: &str) -> Result<Vec<u8>, FrameError> {
    let len = path_len(path)?;
    let mut frame = Vec::with_capacity(4 + path.len());
    frame.extend_from_slice(&[LIST_DIR, 0x00]);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(path.as_bytes());
    Ok(frame)
}

pub fn encode_move(from: &str, to: &str) -> Result<Vec<u8>, FrameError> {
    let from_len = path_len(from)?;
    let to_len = path_len(to)?;
    let mut frame = Vec::with_capacity(7 + from.len() + to.len());
    frame.extend_from_slice(&[MOVE, 0x00]);
    frame.extend_from_slice(&from_len.to_le_bytes());
    frame.extend_from_slice(&to_len.to_le_bytes());
    frame.extend_from_slice(from.as_bytes());
    frame.push(0x00);
    frame.extend_from_slice(to.as_bytes());
    Ok(frame)
}

pub(crate) fn u16_at(frame: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([frame[at], frame[at + 1]])
}

pub(crate) fn u32_at(frame: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]])
}

pub(crate) fn u64_at(frame: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&frame[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_layout() {
        let frame = encode_read_request("/a.txt", 0x0102, 200).unwrap();
        assert_eq!(&frame[..4], &[READ_FILE, 0x00, 6, 0]);
        assert_eq!(&frame[4..8], &[0x02, 0x01, 0, 0]);
        assert_eq!(&frame[8..12], &200u32.to_le_bytes());
        assert_eq!(&frame[12..], b"/a.txt");
    }

    #[test]
    fn test_write_request_layout() {
        let frame = encode_write_request("/f", 0, 7, 1000).unwrap();
        assert_eq!(frame.len(), 22);
        assert_eq!(frame[0], WRITE_FILE);
        assert_eq!(u16_at(&frame, 2), 2);
        assert_eq!(u64_at(&frame, 8), 7);
        assert_eq!(u32_at(&frame, 16), 1000);
        assert_eq!(&frame[20..], b"/f");
    }

    #[test]
    fn test_write_data_layout() {
        let frame = encode_write_data(400, &[9, 8, 7]);
        assert_eq!(&frame[..4], &[WRITE_DATA, STATUS_OK, 0, 0]);
        assert_eq!(u32_at(&frame, 4), 400);
        assert_eq!(u32_at(&frame, 8), 3);
        assert_eq!(&frame[12..], &[9, 8, 7]);
    }

    #[test]
    fn test_move_layout() {
        let frame = encode_move("/a", "/bc").unwrap();
        assert_eq!(frame, vec![MOVE, 0, 2, 0, 3, 0, b'/', b'a', 0, b'/', b'b', b'c']);
    }

    #[test]
    fn test_make_dir_layout() {
        let frame = encode_make_dir("/d", 5).unwrap();
        assert_eq!(&frame[..8], &[MAKE_DIR, 0, 2, 0, 0, 0, 0, 0]);
        assert_eq!(u64_at(&frame, 8), 5);
        assert_eq!(&frame[16..], b"/d");
    }

    #[test]
    fn test_decode_read_response() {
        let mut frame = vec![READ_RESPONSE, STATUS_OK, 0, 0];
        frame.extend_from_slice(&10u32.to_le_bytes());
        frame.extend_from_slice(&12u32.to_le_bytes());
        frame.extend_from_slice(&2u32.to_le_bytes());
        frame.extend_from_slice(&[0xAA, 0xBB]);

        assert_eq!(
            Response::decode(&frame).unwrap(),
            Response::Read {
                status: STATUS_OK,
                offset: 10,
                total_length: 12,
                chunk_length: 2,
                data: vec![0xAA, 0xBB],
            }
        );
    }

    #[test]
    fn test_decode_list_entry() {
        let mut frame = vec![LIST_DIR_RESPONSE, STATUS_OK];
        frame.extend_from_slice(&4u16.to_le_bytes());
        frame.extend_from_slice(&1u32.to_le_bytes());
        frame.extend_from_slice(&3u32.to_le_bytes());
        frame.extend_from_slice(&FLAG_DIRECTORY.to_le_bytes());
        frame.extend_from_slice(&99u64.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(b"logs");

        match Response::decode(&frame).unwrap() {
            Response::ListEntry {
                entry_number,
                total_entries,
                flags,
                path,
                ..
            } => {
                assert_eq!(entry_number, 1);
                assert_eq!(total_entries, 3);
                assert_eq!(flags, FLAG_DIRECTORY);
                assert_eq!(path, "logs");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Response::decode(&[]), Err(FrameError::Empty));
        assert_eq!(
            Response::decode(&[0x99]),
            Err(FrameError::UnknownCommand(0x99))
        );
        assert_eq!(
            Response::decode(&[WRITE_RESPONSE, STATUS_OK, 0, 0]),
            Err(FrameError::Truncated {
                command: WRITE_RESPONSE,
                expected: WRITE_RESPONSE_LEN,
                actual: 4
            })
        );

        let mut short_path = vec![LIST_DIR_RESPONSE, STATUS_OK];
        short_path.extend_from_slice(&10u16.to_le_bytes());
        short_path.resize(LIST_DIR_RESPONSE_HEADER + 2, 0);
        assert!(matches!(
            Response::decode(&short_path),
            Err(FrameError::Truncated { .. })
        ));
    }
}
