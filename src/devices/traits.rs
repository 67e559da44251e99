use async_trait::async_trait;
use std::time::Duration;

use super::types::{Measurement, Sensor, SensorSubtype, SensorType};
use crate::modbus::master::ModbusMaster;
use crate::modbus::RegisterRegion;
use crate::utils::error::BusError;

/// Where a measured quantity lives on a slave. Static, driver-owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    pub address: u16,
    pub count: u16,
    pub region: RegisterRegion,
}

/// Successful identification of a device at a bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHit {
    pub sensor_type: SensorType,
    pub subtype: SensorSubtype,
    pub function_code: u8,
    pub driver_name: &'static str,
}

/// Capability set of a per-vendor/per-class device driver.
///
/// New hardware is supported by registering another implementation with the
/// [`DriverRegistry`](super::registry::DriverRegistry), not by editing a
/// central switch.
///
/// `detect` may try several register/function-code/scale combinations (its
/// own heuristic retries); `read` must not retry a settled profile;
/// retry/backoff for steady-state reads belongs to the orchestrator.
#[async_trait]
pub trait SensorDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this driver serves sensors configured with the given type.
    fn claims(&self, sensor_type: SensorType) -> bool;

    /// Heuristic identification of an unknown device at `address`.
    /// `Err(NotFound)` means "not mine", anything else is a bus problem.
    async fn detect(
        &self,
        master: &ModbusMaster,
        address: u8,
        timeout: Duration,
    ) -> Result<ProbeHit, BusError>;

    /// Read and scale the sensor's quantities into `out`; returns how many
    /// measurements were appended.
    async fn read(
        &self,
        master: &ModbusMaster,
        sensor: &Sensor,
        out: &mut Vec<Measurement>,
        timeout: Duration,
    ) -> Result<usize, BusError>;
}
