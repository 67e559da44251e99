pub mod settings;

pub use settings::{Config, SensorConfig};
