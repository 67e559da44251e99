//! Energy-meter driver (JSY-MK-333 class).
//!
//! The polling path persists per-phase RMS currents, read as a three-word
//! block at 0x0103 in hundredths of an ampere. Probing walks the meter's
//! basic electrical registers (voltage/current/power/energy) across both
//! register banks, accepting any response; these meters answer on whichever
//! bank the firmware revision wired up.

use async_trait::async_trait;
use log::{debug, info};
use std::time::Duration;

use super::traits::{ProbeHit, RegisterBlock, SensorDriver};
use super::types::{Measurement, MeasurementKind, Sensor, SensorSubtype, SensorType};
use crate::modbus::master::ModbusMaster;
use crate::modbus::RegisterRegion;
use crate::utils::error::BusError;

pub const DRIVER_NAME: &str = "energy_jsy";

/// Per-phase currents, A/B/C, scale /100 A.
const CURRENTS: RegisterBlock = RegisterBlock {
    address: 0x0103,
    count: 3,
    region: RegisterRegion::Holding,
};
const CURRENT_SCALE: f32 = 100.0;

/// Single registers the probe walks, in order: voltage, current, power,
/// energy.
const PROBE_REGS: [u16; 4] = [0x0000, 0x0001, 0x0002, 0x0003];

pub struct EnergyDriver;

impl EnergyDriver {
    /// Currents live in one block; try Holding first, then Input; firmware
    /// revisions disagree on the bank.
    async fn read_currents(
        &self,
        master: &ModbusMaster,
        address: u8,
        timeout: Duration,
    ) -> Result<[f32; 3], BusError> {
        let words = match master
            .read_registers(address, CURRENTS.region, CURRENTS.address, CURRENTS.count, timeout)
            .await
        {
            Ok(words) => words,
            Err(first) => {
                debug!("addr={} holding currents failed ({}), trying input", address, first);
                master
                    .read_registers(
                        address,
                        RegisterRegion::Input,
                        CURRENTS.address,
                        CURRENTS.count,
                        timeout,
                    )
                    .await?
            }
        };
        Ok([
            words[0] as f32 / CURRENT_SCALE,
            words[1] as f32 / CURRENT_SCALE,
            words[2] as f32 / CURRENT_SCALE,
        ])
    }
}

#[async_trait]
impl SensorDriver for EnergyDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn claims(&self, sensor_type: SensorType) -> bool {
        sensor_type == SensorType::Energy
    }

    async fn detect(
        &self,
        master: &ModbusMaster,
        address: u8,
        timeout: Duration,
    ) -> Result<ProbeHit, BusError> {
        for region in [RegisterRegion::Input, RegisterRegion::Holding] {
            for reg in PROBE_REGS {
                if master
                    .read_registers(address, region, reg, 1, timeout)
                    .await
                    .is_ok()
                {
                    return Ok(ProbeHit {
                        sensor_type: SensorType::Energy,
                        subtype: SensorSubtype::ThreePhase,
                        function_code: region.function_code(),
                        driver_name: DRIVER_NAME,
                    });
                }
            }
        }
        Err(BusError::NotFound)
    }

    async fn read(
        &self,
        master: &ModbusMaster,
        sensor: &Sensor,
        out: &mut Vec<Measurement>,
        timeout: Duration,
    ) -> Result<usize, BusError> {
        let currents = self.read_currents(master, sensor.address, timeout).await?;
        info!(
            "addr={}  I: A={:.3}  B={:.3}  C={:.3}",
            sensor.address, currents[0], currents[1], currents[2]
        );

        let phases = match sensor.subtype {
            SensorSubtype::SinglePhase => 1,
            _ => 3,
        };
        for &current in currents.iter().take(phases) {
            out.push(Measurement {
                channel: sensor.channel,
                kind: MeasurementKind::CurrentRms,
                value: current,
            });
        }
        Ok(phases)
    }
}
