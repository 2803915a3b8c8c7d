// Serial transport for a USB bus adapter
//
// Packet format: [0xFF, 0xFF, Length, ArbitrationId (4, BE), Data..., Checksum]
// Length counts the arbitration id and data bytes. The checksum covers
// everything after the header.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPort;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::driver::{BusError, BusFrame, FrameReader, FrameWriter};

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Largest payload a classic frame carries
pub const MAX_DATA_LEN: usize = 64;

fn checksum(data: &[u8]) -> u8 {
    let sum: u16 = data.iter().map(|&b| b as u16).sum();
    (!sum & 0xFF) as u8
}

/// Build a packet with header and checksum
pub fn build_packet(frame: &BusFrame) -> Result<Vec<u8>, BusError> {
    if frame.data.len() > MAX_DATA_LEN {
        return Err(BusError::InvalidFrame(format!(
            "{} data bytes exceeds {}",
            frame.data.len(),
            MAX_DATA_LEN
        )));
    }
    let body = frame.to_bytes();
    let mut packet = Vec::with_capacity(body.len() + 4);
    packet.extend_from_slice(&HEADER);
    packet.push(body.len() as u8);
    packet.extend_from_slice(&body);

    let checksum_data = &packet[2..];
    packet.push(checksum(checksum_data));
    Ok(packet)
}

/// Read one packet; `Ok(None)` when the port timed out before a header arrived
fn read_packet(port: &mut dyn Read) -> Result<Option<BusFrame>, BusError> {
    let mut byte = [0u8; 1];
    // Resynchronise on the two-byte header
    let mut previous = 0u8;
    loop {
        match port.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if previous == HEADER[0] && byte[0] == HEADER[1] {
            break;
        }
        previous = byte[0];
    }

    let mut length = [0u8; 1];
    port.read_exact(&mut length)?;
    let length = length[0] as usize;
    if !(4..=4 + MAX_DATA_LEN).contains(&length) {
        return Err(BusError::InvalidFrame(format!("Invalid length byte {}", length)));
    }

    let mut body = vec![0u8; length + 1];
    port.read_exact(&mut body)?;
    let received = body[length];

    let mut summed = Vec::with_capacity(length + 1);
    summed.push(length as u8);
    summed.extend_from_slice(&body[..length]);
    if checksum(&summed) != received {
        return Err(BusError::InvalidFrame("Checksum mismatch".to_string()));
    }

    BusFrame::from_bytes(&body[..length]).map(Some)
}

pub struct SerialWriter {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

#[async_trait]
impl FrameWriter for SerialWriter {
    async fn write(&self, frame: &BusFrame) -> Result<(), BusError> {
        let packet = build_packet(frame)?;
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || {
            let mut port = port
                .lock()
                .map_err(|_| BusError::Transport("serial port lock poisoned".to_string()))?;
            port.write_all(&packet)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| BusError::Transport(e.to_string()))?
    }
}

pub struct SerialReader {
    frames: mpsc::Receiver<Result<BusFrame, BusError>>,
}

#[async_trait]
impl FrameReader for SerialReader {
    async fn read(&mut self) -> Result<Option<BusFrame>, BusError> {
        self.frames.recv().await.transpose()
    }
}

/// Open the adapter and return both halves
pub fn open(port_name: &str, baudrate: u32, timeout: Duration) -> Result<(SerialWriter, SerialReader), BusError> {
    let port = serialport::new(port_name, baudrate).timeout(timeout).open()?;
    let mut read_port = port.try_clone()?;
    info!("Opened serial bus on {} at {} baud", port_name, baudrate);

    let (tx, rx) = mpsc::channel(256);
    thread::spawn(move || {
        loop {
            let result = match read_packet(&mut read_port) {
                Ok(None) => {
                    if tx.is_closed() {
                        break;
                    }
                    continue;
                }
                Ok(Some(frame)) => Ok(frame),
                Err(BusError::InvalidFrame(reason)) => {
                    warn!("Discarding serial packet: {}", reason);
                    continue;
                }
                Err(e) if e.is_transient() => {
                    debug!("Serial read interrupted mid-packet: {}", e);
                    continue;
                }
                Err(e) => Err(e),
            };
            let fatal = result.is_err();
            if tx.blocking_send(result).is_err() || fatal {
                break;
            }
        }
        debug!("Serial reader thread exiting");
    });

    Ok((
        SerialWriter {
            port: Arc::new(Mutex::new(port)),
        },
        SerialReader { frames: rx },
    ))
}
