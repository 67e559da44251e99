//! "Simple" thermo-hygrometer driver (XY-MD02 class).
//!
//! These meters expose a temperature/humidity word pair in signed tenths,
//! but vendor firmware disagrees on the bank and base address: most answer
//! Input registers at 0x0001, some only Holding registers at 0x0000.
//! Detection tries both layouts and accepts the first whose decoded values
//! fall in a plausible range. A device whose registers merely happen to
//! decode in range will be misidentified; that false-positive risk is
//! accepted (see DESIGN.md).

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use super::traits::{ProbeHit, RegisterBlock, SensorDriver};
use super::types::{Measurement, MeasurementKind, Sensor, SensorSubtype, SensorType};
use crate::modbus::master::ModbusMaster;
use crate::modbus::RegisterRegion;
use crate::utils::error::BusError;

pub const DRIVER_NAME: &str = "temp_hum_simple";

/// Device-address holding register (used by the enrollment tooling to
/// re-address a freshly unboxed meter).
pub const REG_DEVICE_ADDRESS: u16 = 0x0101;

/// One candidate register layout.
#[derive(Debug, Clone, Copy)]
struct ThLayout {
    block: RegisterBlock,
    scale: f32,
    signed: bool,
}

const LAYOUTS: [ThLayout; 2] = [
    ThLayout {
        block: RegisterBlock {
            address: 0x0001,
            count: 2,
            region: RegisterRegion::Input,
        },
        scale: 0.1,
        signed: true,
    },
    ThLayout {
        block: RegisterBlock {
            address: 0x0000,
            count: 2,
            region: RegisterRegion::Holding,
        },
        scale: 0.1,
        signed: true,
    },
];

fn plausible(temp_c: f32, hum_pct: f32) -> bool {
    (-60.0..=120.0).contains(&temp_c) && (0.0..=100.0).contains(&hum_pct)
}

fn scale_word(raw: u16, scale: f32, signed: bool) -> f32 {
    if signed {
        (raw as i16) as f32 * scale
    } else {
        raw as f32 * scale
    }
}

#[derive(Debug, Clone, Copy)]
struct ThReading {
    temperature_c: f32,
    humidity_pct: Option<f32>,
}

pub struct TempHumDriver;

impl TempHumDriver {
    /// Read a layout's word pair; falls back to a lone temperature word when
    /// the device rejects the two-word read (humidity is optional on some
    /// models).
    async fn read_layout(
        &self,
        master: &ModbusMaster,
        address: u8,
        layout: &ThLayout,
        timeout: Duration,
    ) -> Result<ThReading, BusError> {
        let block = &layout.block;
        match master
            .read_registers(address, block.region, block.address, block.count, timeout)
            .await
        {
            Ok(words) => Ok(ThReading {
                temperature_c: scale_word(words[0], layout.scale, layout.signed),
                humidity_pct: Some(scale_word(words[1], layout.scale, false)),
            }),
            Err(BusError::Exception(_)) | Err(BusError::InvalidResponse(_)) => {
                let words = master
                    .read_registers(address, block.region, block.address, 1, timeout)
                    .await?;
                Ok(ThReading {
                    temperature_c: scale_word(words[0], layout.scale, layout.signed),
                    humidity_pct: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Try the known layouts in order; first plausible responder wins.
    ///
    /// When no layout answers at all, the last communication error is
    /// propagated so an unplugged device surfaces as unreachable instead of
    /// "no such driver"; `NotFound` is reserved for devices that answered
    /// but out of range.
    async fn detect_layout(
        &self,
        master: &ModbusMaster,
        address: u8,
        timeout: Duration,
    ) -> Result<(ThLayout, ThReading), BusError> {
        let mut last_comm_err = None;
        for layout in &LAYOUTS {
            match self.read_layout(master, address, layout, timeout).await {
                Ok(reading)
                    if plausible(
                        reading.temperature_c,
                        reading.humidity_pct.unwrap_or(0.0),
                    ) =>
                {
                    return Ok((*layout, reading));
                }
                Ok(reading) => debug!(
                    "addr={} layout {:?} answered out of range (t={:.1})",
                    address, layout.block.region, reading.temperature_c
                ),
                Err(e) => {
                    debug!("addr={} layout {:?} failed: {}", address, layout.block.region, e);
                    // exceptions and malformed answers prove a live device
                    // that simply is not this sensor class; only silence or
                    // bus trouble counts as a communication error
                    if matches!(
                        e,
                        BusError::Timeout | BusError::BusBusy | BusError::Connection(_)
                    ) {
                        last_comm_err = Some(e);
                    }
                }
            }
        }
        Err(last_comm_err.unwrap_or(BusError::NotFound))
    }
}

#[async_trait]
impl SensorDriver for TempHumDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn claims(&self, sensor_type: SensorType) -> bool {
        matches!(
            sensor_type,
            SensorType::ThermoHygro | SensorType::Temperature | SensorType::Humidity
        )
    }

    async fn detect(
        &self,
        master: &ModbusMaster,
        address: u8,
        timeout: Duration,
    ) -> Result<ProbeHit, BusError> {
        let (layout, _) = self.detect_layout(master, address, timeout).await?;
        Ok(ProbeHit {
            sensor_type: SensorType::ThermoHygro,
            subtype: SensorSubtype::ModelVariant,
            function_code: layout.block.region.function_code(),
            driver_name: DRIVER_NAME,
        })
    }

    async fn read(
        &self,
        master: &ModbusMaster,
        sensor: &Sensor,
        out: &mut Vec<Measurement>,
        timeout: Duration,
    ) -> Result<usize, BusError> {
        let (_, reading) = self.detect_layout(master, sensor.address, timeout).await?;

        let mut wrote = 0;
        if matches!(
            sensor.sensor_type,
            SensorType::ThermoHygro | SensorType::Temperature
        ) {
            out.push(Measurement {
                channel: sensor.channel,
                kind: MeasurementKind::TemperatureC,
                value: reading.temperature_c,
            });
            wrote += 1;
        }

        let wants_humidity = matches!(
            sensor.sensor_type,
            SensorType::ThermoHygro | SensorType::Humidity
        );
        match reading.humidity_pct {
            Some(hum) if wants_humidity => {
                out.push(Measurement {
                    channel: sensor.channel,
                    kind: MeasurementKind::HumidityPct,
                    value: hum,
                });
                wrote += 1;
            }
            None if sensor.sensor_type == SensorType::Humidity => {
                return Err(BusError::InvalidResponse(
                    "device reports no humidity register".into(),
                ));
            }
            _ => {}
        }
        Ok(wrote)
    }
}
