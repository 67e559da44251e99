pub mod energy;
pub mod registry;
pub mod temp_hum;
pub mod traits;
pub mod types;

pub use energy::EnergyDriver;
pub use registry::{fixed_profile_for, DriverRegistry, PollFailure, PollOutcome};
pub use temp_hum::TempHumDriver;
pub use traits::{ProbeHit, RegisterBlock, SensorDriver};
pub use types::{Measurement, MeasurementKind, Sensor, SensorSubtype, SensorType};
