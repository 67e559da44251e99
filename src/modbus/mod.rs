pub mod crc;
pub mod guard;
pub mod master;
pub mod transport;

#[cfg(test)]
pub(crate) mod sim;

pub use crc::crc16_modbus;
pub use guard::{BusGuard, BusOwner, GuardSnapshot};
pub use master::{ModbusMaster, PingOutcome, RegisterRegion};
pub use transport::{BusTransport, CommProfile, Parity, SerialTransport, StopBits};
