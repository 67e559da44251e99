use clap::ArgMatches;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::devices::types::{Sensor, SensorSubtype, SensorType};
use crate::modbus::transport::{CommProfile, Parity, StopBits};
use crate::utils::error::BusError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Node identification
    pub node_uuid: String,
    pub node_name: String,

    // Connection settings
    pub serial_port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub timeout_ms: u64,

    // Polling settings
    pub poll_interval_seconds: u64,

    /// Publish humidity on `channel + 1` sub-index 1 instead of the sensor's
    /// own channel sub-index 2.
    pub humidity_next_channel: bool,

    // Storage settings
    pub records_path: String,

    // Sensor enrollment (front-end supplied labels)
    pub sensors: Vec<SensorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub channel: u16,
    pub address: u8,
    pub sensor_type: String,
    pub subtype: String,
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_uuid: Uuid::new_v4().to_string(),
            node_name: "Field Datalogger".to_string(),
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout_ms: 1000,
            poll_interval_seconds: 60,
            humidity_next_channel: false,
            records_path: "data/records.log".to_string(),
            sensors: vec![
                SensorConfig {
                    channel: 1,
                    address: 1,
                    sensor_type: "termohigrometro".to_string(),
                    subtype: "".to_string(),
                    enabled: true,
                },
                SensorConfig {
                    channel: 3,
                    address: 2,
                    sensor_type: "energia".to_string(),
                    subtype: "trifasico".to_string(),
                    enabled: true,
                },
            ],
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BusError> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BusError::NotFound
            } else {
                BusError::Config(format!("read {:?}: {}", path.as_ref(), e))
            }
        })?;
        let mut config: Config =
            toml::from_str(&content).map_err(|e| BusError::Config(format!("parse: {}", e)))?;

        // older files may predate the node identity fields
        if config.node_uuid.is_empty() {
            config.node_uuid = Uuid::new_v4().to_string();
        }
        if config.node_name.is_empty() {
            config.node_name = "Field Datalogger".to_string();
        }
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), BusError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BusError::Config(format!("create {:?}: {}", parent, e)))?;
            }
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| BusError::Config(format!("serialize: {}", e)))?;
        std::fs::write(&path, content)
            .map_err(|e| BusError::Config(format!("write {:?}: {}", path.as_ref(), e)))
    }

    /// Override connection settings from command-line arguments.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), BusError> {
        if let Some(port) = matches.get_one::<String>("port") {
            self.serial_port = port.clone();
        }
        if let Some(baud) = matches.get_one::<String>("baud") {
            self.baud_rate = baud
                .parse()
                .map_err(|e| BusError::Config(format!("invalid baud rate '{}': {}", baud, e)))?;
        }
        if let Some(interval) = matches.get_one::<String>("interval") {
            self.poll_interval_seconds = interval.parse().map_err(|e| {
                BusError::Config(format!("invalid interval '{}': {}", interval, e))
            })?;
        }
        Ok(())
    }

    /// Line profile used when a sensor class has no fixed profile.
    pub fn default_profile(&self) -> CommProfile {
        CommProfile {
            baud: self.baud_rate,
            parity: self.parity,
            stop_bits: self.stop_bits,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve the enabled enrollment entries into typed sensors. Labels the
    /// registry does not recognize stay enrolled as `Invalid` so the poll
    /// cycle can report them instead of silently skipping.
    pub fn enabled_sensors(&self) -> Vec<Sensor> {
        self.sensors
            .iter()
            .filter(|s| s.enabled)
            .map(|s| {
                let sensor_type = SensorType::from_label(&s.sensor_type);
                if sensor_type == SensorType::Invalid {
                    warn!(
                        "ch={} addr={}: unrecognized sensor type '{}'",
                        s.channel, s.address, s.sensor_type
                    );
                }
                Sensor {
                    channel: s.channel,
                    address: s.address,
                    sensor_type,
                    subtype: SensorSubtype::from_label(&s.subtype),
                }
            })
            .collect()
    }
}
