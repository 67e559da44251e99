use log::{error, info};
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::utils::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

/// Serial line parameters for one sensor class. Looked up from the fixed
/// profile table, never mutated at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommProfile {
    pub baud: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub timeout: Duration,
}

impl Default for CommProfile {
    fn default() -> Self {
        Self {
            baud: 9600,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_millis(1000),
        }
    }
}

/// Raw byte transport under the RTU master.
///
/// There is exactly one active line configuration at a time: `apply_profile`
/// reconfigures the physical port for the next transaction, so mixing sensor
/// classes with different profiles on one bus serializes through it.
pub trait BusTransport: Send + Sync {
    fn apply_profile(&self, profile: &CommProfile) -> Result<(), BusError>;
    fn send_frame(&self, frame: &[u8]) -> Result<(), BusError>;
    /// Receive up to `max_len` bytes, returning once the frame is complete,
    /// the line has gone quiet after a partial frame, or `timeout` elapses
    /// with nothing received (-> `Timeout`).
    fn recv_frame(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, BusError>;
}

/// Poll quantum for the blocking serial reads; also serves as the
/// inter-frame silence that terminates a short (e.g. exception) response.
const READ_QUANTUM: Duration = Duration::from_millis(50);

pub struct SerialTransport {
    port: Mutex<Box<dyn SerialPort>>,
    port_name: String,
}

impl SerialTransport {
    pub fn open(port_name: &str, profile: &CommProfile) -> Result<Self, BusError> {
        info!("🔌 Opening RS-485 port: {}", port_name);
        info!(
            "⚙️  Line config: {} baud, 8 data bits, parity {:?}, stop bits {:?}",
            profile.baud, profile.parity, profile.stop_bits
        );

        let port = serialport::new(port_name, profile.baud)
            .timeout(READ_QUANTUM)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(to_serial_stop(profile.stop_bits))
            .parity(to_serial_parity(profile.parity))
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", port_name, e);
                BusError::Connection(format!("failed to open port: {}", e))
            })?;

        Ok(Self {
            port: Mutex::new(port),
            port_name: port_name.to_string(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

fn to_serial_parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    }
}

fn to_serial_stop(stop: StopBits) -> serialport::StopBits {
    match stop {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    }
}

impl BusTransport for SerialTransport {
    fn apply_profile(&self, profile: &CommProfile) -> Result<(), BusError> {
        let mut port = self
            .port
            .lock()
            .map_err(|_| BusError::Connection("serial port lock poisoned".into()))?;
        let apply = |e: serialport::Error| {
            BusError::Connection(format!("failed to apply line profile: {}", e))
        };
        port.set_baud_rate(profile.baud).map_err(apply)?;
        port.set_parity(to_serial_parity(profile.parity)).map_err(apply)?;
        port.set_stop_bits(to_serial_stop(profile.stop_bits)).map_err(apply)?;
        Ok(())
    }

    fn send_frame(&self, frame: &[u8]) -> Result<(), BusError> {
        let mut port = self
            .port
            .lock()
            .map_err(|_| BusError::Connection("serial port lock poisoned".into()))?;
        port.write_all(frame)
            .map_err(|e| BusError::Connection(format!("write failed: {}", e)))?;
        port.flush()
            .map_err(|e| BusError::Connection(format!("flush failed: {}", e)))
    }

    fn recv_frame(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, BusError> {
        let mut port = self
            .port
            .lock()
            .map_err(|_| BusError::Connection("serial port lock poisoned".into()))?;

        let deadline = Instant::now() + timeout;
        let mut buf = Vec::with_capacity(max_len);
        let mut chunk = [0u8; 64];

        loop {
            match port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.len() >= max_len {
                        buf.truncate(max_len);
                        return Ok(buf);
                    }
                    // keep reading until the inter-frame gap
                    continue;
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    // a quiet quantum after partial data ends the frame
                    if !buf.is_empty() {
                        return Ok(buf);
                    }
                }
                Err(e) => return Err(BusError::Connection(format!("read failed: {}", e))),
            }

            if Instant::now() >= deadline {
                if buf.is_empty() {
                    return Err(BusError::Timeout);
                }
                return Ok(buf);
            }
        }
    }
}
