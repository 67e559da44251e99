//! Driver registry: fixed communication profiles, probe scanning and the
//! read dispatch used by the poll cycle.

use log::{info, warn};
use std::time::Duration;

use super::energy::EnergyDriver;
use super::temp_hum::TempHumDriver;
use super::traits::{ProbeHit, SensorDriver};
use super::types::{Measurement, Sensor, SensorSubtype, SensorType};
use crate::modbus::master::ModbusMaster;
use crate::modbus::transport::{CommProfile, Parity, StopBits};
use crate::utils::error::BusError;

/// Fixed line profile per sensor class. Absence means "no fixed profile,
/// use the port default".
pub fn fixed_profile_for(
    sensor_type: SensorType,
    _subtype: SensorSubtype,
) -> Option<CommProfile> {
    match sensor_type {
        SensorType::ThermoHygro | SensorType::Temperature | SensorType::Humidity => {
            Some(CommProfile {
                baud: 9600,
                parity: Parity::None,
                stop_bits: StopBits::One,
                timeout: Duration::from_millis(1000),
            })
        }
        SensorType::Energy => Some(CommProfile {
            baud: 9600,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_millis(1200),
        }),
        _ => None,
    }
}

/// A sensor that failed during a bus scan; the scan itself carries on.
#[derive(Debug)]
pub struct PollFailure {
    pub channel: u16,
    pub address: u8,
    pub error: BusError,
}

/// Outcome of one pass over a sensor list.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub produced: usize,
    pub failures: Vec<PollFailure>,
}

/// Registered drivers, iterated in fixed priority order.
pub struct DriverRegistry {
    drivers: Vec<Box<dyn SensorDriver>>,
}

impl Default for DriverRegistry {
    /// Built-in drivers; thermo-hygrometers probe first because their
    /// detection is the cheapest (a single plausible word pair).
    fn default() -> Self {
        let mut registry = Self { drivers: Vec::new() };
        registry.register(Box::new(TempHumDriver));
        registry.register(Box::new(EnergyDriver));
        registry
    }
}

impl DriverRegistry {
    pub fn register(&mut self, driver: Box<dyn SensorDriver>) {
        self.drivers.push(driver);
    }

    pub fn driver_names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// Identify an unknown device at `address` by running every driver's
    /// detection routine, short-circuiting on the first plausible match.
    /// Used during enrollment before the front-end has typed the sensor;
    /// cost grows with the number of registered drivers.
    pub async fn probe_any(
        &self,
        master: &ModbusMaster,
        address: u8,
        timeout: Duration,
    ) -> Result<ProbeHit, BusError> {
        for driver in &self.drivers {
            match driver.detect(master, address, timeout).await {
                Ok(hit) => {
                    info!(
                        "probe addr={}: {} identified type '{}' fc=0x{:02X}",
                        address,
                        hit.driver_name,
                        hit.sensor_type,
                        hit.function_code
                    );
                    return Ok(hit);
                }
                Err(BusError::NotFound) => continue,
                Err(e) => {
                    warn!("probe addr={}: driver {} aborted: {}", address, driver.name(), e);
                    continue;
                }
            }
        }
        Err(BusError::NotFound)
    }

    /// Dispatch a read to the driver claiming the sensor's type.
    /// `UnsupportedType` (no driver) is a configuration error, distinct from
    /// a communication failure.
    pub async fn read_measurements(
        &self,
        master: &ModbusMaster,
        sensor: &Sensor,
        out: &mut Vec<Measurement>,
        timeout: Duration,
    ) -> Result<usize, BusError> {
        let driver = self
            .drivers
            .iter()
            .find(|d| d.claims(sensor.sensor_type))
            .ok_or_else(|| BusError::UnsupportedType(sensor.sensor_type.label().to_string()))?;
        driver.read(master, sensor, out, timeout).await
    }

    /// Visit every sensor in list order. One sensor's failure is recorded
    /// and does not abort the rest of the scan; partial success is the
    /// common case when a field device is unplugged.
    pub async fn poll_all(
        &self,
        master: &ModbusMaster,
        sensors: &[Sensor],
        out: &mut Vec<Measurement>,
        timeout: Duration,
    ) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        for sensor in sensors {
            match self.read_measurements(master, sensor, out, timeout).await {
                Ok(n) => outcome.produced += n,
                Err(error) => {
                    warn!(
                        "poll ch={} addr={} failed: {}",
                        sensor.channel, sensor.address, error
                    );
                    outcome.failures.push(PollFailure {
                        channel: sensor.channel,
                        address: sensor.address,
                        error,
                    });
                }
            }
        }
        outcome
    }
}
