//! RS-485/Modbus Field Data-Logging Core
//!
//! This library polls heterogeneous sensors over a shared half-duplex
//! RS-485 bus using Modbus RTU, normalizes their readings into channel
//! measurements, and persists them as dated records. One transaction owns
//! the bus at a time; per-vendor drivers know their register layouts and
//! are probed in priority order to identify unenrolled hardware.

pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod services;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use devices::{
    DriverRegistry, Measurement, MeasurementKind, Sensor, SensorDriver, SensorSubtype, SensorType,
};
pub use modbus::{BusGuard, BusTransport, CommProfile, ModbusMaster, SerialTransport};
pub use services::PollService;
pub use storage::{FileStore, RecordPayload, RecordStore};
pub use utils::error::BusError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
