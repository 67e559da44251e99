//! Sensor classification shared between the front-end configuration and the
//! driver dispatch.
//!
//! The front-end enrolls sensors with free-form labels (Portuguese, matching
//! the field portal); keeping the string⇄enum maps in one place prevents
//! drift between how the portal names sensor classes and how dispatch keys
//! them. Mapping is case-, accent- and synonym-tolerant, and unknown labels
//! degrade to `Invalid` instead of failing.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorType {
    Invalid,
    Energy,
    ThermoHygro,
    Temperature,
    Humidity,
    Pressure,
    Flow,
    Gps,
    Light,
    Gas,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SensorSubtype {
    #[default]
    None,
    SinglePhase,
    ThreePhase,
    ModelVariant,
}

/// Lowercase and strip the accents the portal labels carry.
fn fold_label(s: &str) -> String {
    s.trim()
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' => 'a',
            'é' | 'ê' => 'e',
            'í' => 'i',
            'ó' | 'ô' | 'õ' => 'o',
            'ú' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

impl SensorType {
    /// Portal label (and synonyms) to type. Unrecognized input maps to
    /// `Invalid`, never an error.
    pub fn from_label(s: &str) -> SensorType {
        match fold_label(s).as_str() {
            "energia" | "energy" => SensorType::Energy,
            "termohigrometro" | "termo-higrometro" | "thermohygrometer" => SensorType::ThermoHygro,
            "temperatura" | "temperature" => SensorType::Temperature,
            "umidade" | "humidity" => SensorType::Humidity,
            "pressao" | "pressure" => SensorType::Pressure,
            "vazao" | "fluxo" | "flow" => SensorType::Flow,
            "gps" => SensorType::Gps,
            "luz" | "light" => SensorType::Light,
            "gas" => SensorType::Gas,
            "outro" | "outros" | "other" => SensorType::Other,
            _ => SensorType::Invalid,
        }
    }

    /// Canonical portal label.
    pub fn label(self) -> &'static str {
        match self {
            SensorType::Energy => "energia",
            SensorType::ThermoHygro => "termohigrometro",
            SensorType::Temperature => "temperatura",
            SensorType::Humidity => "umidade",
            SensorType::Pressure => "pressao",
            SensorType::Flow => "vazao",
            SensorType::Gps => "gps",
            SensorType::Light => "luz",
            SensorType::Gas => "gas",
            SensorType::Other => "outro",
            SensorType::Invalid => "",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl SensorSubtype {
    pub fn from_label(s: &str) -> SensorSubtype {
        match fold_label(s).as_str() {
            "monofasico" | "single-phase" => SensorSubtype::SinglePhase,
            "trifasico" | "three-phase" => SensorSubtype::ThreePhase,
            "xy_md02" | "xy-md02" => SensorSubtype::ModelVariant,
            _ => SensorSubtype::None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SensorSubtype::SinglePhase => "monofasico",
            SensorSubtype::ThreePhase => "trifasico",
            SensorSubtype::ModelVariant => "xy_md02",
            SensorSubtype::None => "",
        }
    }
}

/// A sensor enrolled by the front-end. Immutable during a polling cycle;
/// replaced wholesale when configuration reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sensor {
    /// Logical channel, unique per install.
    pub channel: u16,
    /// Bus address, 1..=247. Duplicate addresses on one segment are a
    /// configuration error this core does not detect.
    pub address: u8,
    pub sensor_type: SensorType,
    pub subtype: SensorSubtype,
}

/// Physical quantities the drivers produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementKind {
    TemperatureC,
    HumidityPct,
    CurrentRms,
    PowerKw,
    EnergyKwh,
    FlowLpm,
    PressureBar,
    LightLux,
    GasPpm,
    GpsLat,
    GpsLon,
}

impl MeasurementKind {
    pub fn unit(self) -> &'static str {
        match self {
            MeasurementKind::TemperatureC => "°C",
            MeasurementKind::HumidityPct => "%RH",
            MeasurementKind::CurrentRms => "A",
            MeasurementKind::PowerKw => "kW",
            MeasurementKind::EnergyKwh => "kWh",
            MeasurementKind::FlowLpm => "L/min",
            MeasurementKind::PressureBar => "bar",
            MeasurementKind::LightLux => "lx",
            MeasurementKind::GasPpm => "ppm",
            MeasurementKind::GpsLat | MeasurementKind::GpsLon => "°",
        }
    }
}

/// One reading produced by a driver; consumed immediately by the storage
/// adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub channel: u16,
    pub kind: MeasurementKind,
    pub value: f32,
}
