// Transport-neutral frame reader/writer traits

use std::io::Cursor;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use super::messages::CodecError;

/// Error types for bus transports
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Bus closed")]
    Closed,
}

impl BusError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            BusError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ),
            BusError::Transport(_) => true,
            _ => false,
        }
    }
}

/// One frame on the bus: packed arbitration id plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    pub arbitration_id: u32,
    pub data: Vec<u8>,
}

impl BusFrame {
    pub fn new(arbitration_id: u32, data: Vec<u8>) -> Self {
        Self {
            arbitration_id,
            data,
        }
    }

    /// Flat encoding used by byte-oriented transports: id (u32, BE) then payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; 4];
        BigEndian::write_u32(&mut out, self.arbitration_id);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        let mut cursor = Cursor::new(bytes);
        let arbitration_id = cursor.read_u32::<BigEndian>().map_err(|_| {
            BusError::InvalidFrame(format!("{} bytes is shorter than an arbitration id", bytes.len()))
        })?;
        Ok(Self::new(arbitration_id, bytes[4..].to_vec()))
    }
}

#[async_trait]
pub trait FrameWriter: Send + Sync {
    async fn write(&self, frame: &BusFrame) -> Result<(), BusError>;
}

#[async_trait]
pub trait FrameReader: Send {
    /// Next frame, or `None` once the transport is closed
    async fn read(&mut self) -> Result<Option<BusFrame>, BusError>;
}
