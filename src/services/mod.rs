pub mod poll;

pub use poll::{CycleReport, FileSensorSource, PollService, SensorSource, StaticSensorSource};
