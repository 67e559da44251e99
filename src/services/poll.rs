//! Poll-and-save orchestrator.
//!
//! One cycle: load the sensor enrollment, then per sensor: apply the
//! class's fixed line profile, dispatch to its driver, map the measurements
//! to storage cells, persist. A sensor failure becomes a `Failed` sentinel
//! record on its channel and the cycle carries on; only a missing
//! configuration aborts a cycle early.

use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::devices::registry::{fixed_profile_for, DriverRegistry};
use crate::devices::types::{Measurement, MeasurementKind, Sensor};
use crate::modbus::master::ModbusMaster;
use crate::modbus::transport::{BusTransport, CommProfile};
use crate::storage::{RecordPayload, RecordStore};
use crate::utils::error::BusError;

/// Current enrollment, reloaded at the start of every cycle.
pub trait SensorSource: Send + Sync {
    fn load(&self) -> Result<Vec<Sensor>, BusError>;
}

/// Reads the enrollment from the node's TOML configuration file.
pub struct FileSensorSource {
    path: PathBuf,
}

impl FileSensorSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SensorSource for FileSensorSource {
    fn load(&self) -> Result<Vec<Sensor>, BusError> {
        Ok(Config::from_file(&self.path)?.enabled_sensors())
    }
}

/// Fixed enrollment, for one-shot runs and tests.
pub struct StaticSensorSource(pub Vec<Sensor>);

impl SensorSource for StaticSensorSource {
    fn load(&self) -> Result<Vec<Sensor>, BusError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub sensors: usize,
    pub produced: usize,
    pub saved: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// One storage cell write.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Cell {
    channel: u16,
    subindex: u8,
    value: f32,
}

pub struct PollService {
    master: Arc<ModbusMaster>,
    transport: Arc<dyn BusTransport>,
    registry: DriverRegistry,
    source: Box<dyn SensorSource>,
    store: Box<dyn RecordStore>,
    default_profile: CommProfile,
    humidity_next_channel: bool,
    poll_interval: Duration,
}

impl PollService {
    pub fn new(
        config: &Config,
        master: Arc<ModbusMaster>,
        transport: Arc<dyn BusTransport>,
        registry: DriverRegistry,
        source: Box<dyn SensorSource>,
        store: Box<dyn RecordStore>,
    ) -> Self {
        Self {
            master,
            transport,
            registry,
            source,
            store,
            default_profile: config.default_profile(),
            humidity_next_channel: config.humidity_next_channel,
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
        }
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Run one poll cycle. `Err(NotFound)` means no enrollment is available
    /// and nothing was polled; per-sensor failures never abort the cycle.
    pub async fn poll_and_save(&self, timeout: Duration) -> Result<CycleReport, BusError> {
        let sensors = self.source.load()?;
        if sensors.is_empty() {
            return Err(BusError::NotFound);
        }

        let mut report = CycleReport {
            sensors: sensors.len(),
            ..CycleReport::default()
        };

        for sensor in &sensors {
            let applied = self.apply_profile(sensor);
            let sensor_timeout = applied.unwrap_or(timeout);

            let mut measurements = Vec::new();
            let result = self
                .registry
                .read_measurements(&self.master, sensor, &mut measurements, sensor_timeout)
                .await;
            if applied.is_some() {
                self.restore_profile();
            }

            match result {
                Ok(n) => {
                    report.produced += n;
                    let (cells, dropped) =
                        assign_cells(&measurements, self.humidity_next_channel);
                    report.dropped += dropped;
                    for cell in cells {
                        report.saved +=
                            self.persist(cell.channel, cell.subindex, RecordPayload::Value(cell.value));
                    }
                }
                Err(error) => {
                    warn!(
                        "ch={} addr={} read failed: {}",
                        sensor.channel, sensor.address, error
                    );
                    report.failed += 1;
                    // keep the timeline dense: the failure is data too
                    report.saved +=
                        self.persist(sensor.channel, 0, RecordPayload::Failed(error.code()));
                }
            }
        }

        info!(
            "cycle: {} sensors, {} measurements, {} cells saved, {} failed, {} dropped",
            report.sensors, report.produced, report.saved, report.failed, report.dropped
        );
        Ok(report)
    }

    /// Continuous polling on the configured interval.
    pub async fn run(&self) {
        info!(
            "⏱️  Polling every {}s on {} driver(s)",
            self.poll_interval.as_secs(),
            self.registry.driver_names().len()
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.poll_and_save(self.default_profile.timeout).await {
                Ok(_) => {}
                Err(BusError::NotFound) => warn!("no sensors enrolled; nothing to poll"),
                Err(e) => warn!("poll cycle failed: {}", e),
            }
        }
    }

    /// Switch the line to the sensor class's fixed profile, returning its
    /// transaction timeout. `None` means no fixed profile (port default
    /// stays), or the switch failed, in which case the read proceeds on the
    /// current configuration.
    fn apply_profile(&self, sensor: &Sensor) -> Option<Duration> {
        let profile = fixed_profile_for(sensor.sensor_type, sensor.subtype)?;
        match self.transport.apply_profile(&profile) {
            Ok(()) => {
                info!(
                    "ch={} addr={} → {} baud parity={:?} stop={:?} timeout={}ms",
                    sensor.channel,
                    sensor.address,
                    profile.baud,
                    profile.parity,
                    profile.stop_bits,
                    profile.timeout.as_millis()
                );
                Some(profile.timeout)
            }
            Err(e) => {
                warn!(
                    "ch={} addr={}: failed to apply line profile: {}",
                    sensor.channel, sensor.address, e
                );
                None
            }
        }
    }

    fn restore_profile(&self) {
        if let Err(e) = self.transport.apply_profile(&self.default_profile) {
            warn!("failed to restore default line profile: {}", e);
        }
    }

    fn persist(&self, channel: u16, subindex: u8, payload: RecordPayload) -> usize {
        match self.store.save_record(channel, subindex, &payload) {
            Ok(()) => 1,
            Err(e) => {
                // storage errors are logged, never retried here
                warn!("save ch={} sub={} failed: {}", channel, subindex, e);
                0
            }
        }
    }
}

/// Map measurements to storage cells.
///
/// Temperature goes to sub-index 1 and humidity to sub-index 2 of the same
/// channel (or to `channel + 1` sub-index 1 when configured). Per-phase
/// currents take sequential sub-indices 1..3; the cap bounds the schema
/// width for a known-three-phase quantity, extras reuse 3. A lone current
/// sample writes the bare channel. Kinds with no cell mapping are dropped
/// with a warning.
fn assign_cells(
    measurements: &[Measurement],
    humidity_next_channel: bool,
) -> (Vec<Cell>, usize) {
    let mut current_totals: HashMap<u16, usize> = HashMap::new();
    for m in measurements {
        if m.kind == MeasurementKind::CurrentRms {
            *current_totals.entry(m.channel).or_default() += 1;
        }
    }

    let mut cells = Vec::with_capacity(measurements.len());
    let mut current_seq: HashMap<u16, u8> = HashMap::new();
    let mut dropped = 0;

    for m in measurements {
        let cell = match m.kind {
            MeasurementKind::TemperatureC => Some((m.channel, 1)),
            MeasurementKind::HumidityPct => {
                if humidity_next_channel {
                    Some((m.channel + 1, 1))
                } else {
                    Some((m.channel, 2))
                }
            }
            MeasurementKind::CurrentRms => {
                if current_totals[&m.channel] == 1 {
                    Some((m.channel, 0))
                } else {
                    let seq = current_seq.entry(m.channel).or_default();
                    *seq += 1;
                    Some((m.channel, (*seq).min(3)))
                }
            }
            MeasurementKind::FlowLpm
            | MeasurementKind::PressureBar
            | MeasurementKind::LightLux
            | MeasurementKind::GasPpm => Some((m.channel, 1)),
            MeasurementKind::GpsLat => Some((m.channel, 1)),
            MeasurementKind::GpsLon => Some((m.channel, 2)),
            MeasurementKind::PowerKw | MeasurementKind::EnergyKwh => None,
        };
        match cell {
            Some((channel, subindex)) => cells.push(Cell {
                channel,
                subindex,
                value: m.value,
            }),
            None => {
                warn!(
                    "no storage cell for {:?} on ch={}; dropped",
                    m.kind, m.channel
                );
                dropped += 1;
            }
        }
    }
    (cells, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::types::{SensorSubtype, SensorType};
    use crate::modbus::guard::BusGuard;
    use crate::modbus::sim::{SimBus, SimSlave};
    use crate::storage::MemoryStore;

    fn measurement(channel: u16, kind: MeasurementKind, value: f32) -> Measurement {
        Measurement {
            channel,
            kind,
            value,
        }
    }

    #[test]
    fn temperature_and_humidity_share_a_channel() {
        let ms = [
            measurement(4, MeasurementKind::TemperatureC, 25.0),
            measurement(4, MeasurementKind::HumidityPct, 45.5),
        ];
        let (cells, dropped) = assign_cells(&ms, false);
        assert_eq!(dropped, 0);
        assert_eq!(cells[0].channel, 4);
        assert_eq!(cells[0].subindex, 1);
        assert_eq!(cells[1].channel, 4);
        assert_eq!(cells[1].subindex, 2);
    }

    #[test]
    fn humidity_can_shift_to_the_next_channel() {
        let ms = [
            measurement(4, MeasurementKind::TemperatureC, 25.0),
            measurement(4, MeasurementKind::HumidityPct, 45.5),
        ];
        let (cells, _) = assign_cells(&ms, true);
        assert_eq!(cells[1].channel, 5);
        assert_eq!(cells[1].subindex, 1);
    }

    #[test]
    fn current_subindices_cap_at_three() {
        let ms: Vec<Measurement> = (0..4)
            .map(|i| measurement(3, MeasurementKind::CurrentRms, i as f32))
            .collect();
        let (cells, _) = assign_cells(&ms, false);
        let subs: Vec<u8> = cells.iter().map(|c| c.subindex).collect();
        assert_eq!(subs, vec![1, 2, 3, 3]);
    }

    #[test]
    fn lone_current_sample_writes_the_bare_channel() {
        let ms = [measurement(3, MeasurementKind::CurrentRms, 1.5)];
        let (cells, _) = assign_cells(&ms, false);
        assert_eq!(cells[0].channel, 3);
        assert_eq!(cells[0].subindex, 0);
    }

    #[test]
    fn unmapped_kinds_are_dropped_with_a_count() {
        let ms = [
            measurement(7, MeasurementKind::PowerKw, 2.0),
            measurement(7, MeasurementKind::TemperatureC, 21.0),
        ];
        let (cells, dropped) = assign_cells(&ms, false);
        assert_eq!(dropped, 1);
        assert_eq!(cells.len(), 1);
    }

    // -- full cycle --

    fn th_slave(address: u8, temp: u16, hum: u16) -> SimSlave {
        let mut slave = SimSlave::new(address);
        slave.input.insert(0x0001, temp);
        slave.input.insert(0x0002, hum);
        slave
    }

    fn service_for(bus: SimBus, sensors: Vec<Sensor>) -> (PollService, Arc<MemoryStore>) {
        let transport = Arc::new(bus);
        let guard = Arc::new(BusGuard::new());
        let master = Arc::new(ModbusMaster::new(transport.clone(), guard));
        let store = Arc::new(MemoryStore::default());
        let service = PollService::new(
            &Config::default(),
            master,
            transport,
            DriverRegistry::default(),
            Box::new(StaticSensorSource(sensors)),
            Box::new(SharedStore(store.clone())),
        );
        (service, store)
    }

    /// MemoryStore handle the service can own while the test keeps a view.
    struct SharedStore(Arc<MemoryStore>);

    impl RecordStore for SharedStore {
        fn save_record(
            &self,
            channel: u16,
            subindex: u8,
            payload: &RecordPayload,
        ) -> Result<(), BusError> {
            self.0.save_record(channel, subindex, payload)
        }
    }

    #[tokio::test]
    async fn cycle_persists_thermo_hygro_cells() {
        let sensors = vec![Sensor {
            channel: 4,
            address: 8,
            sensor_type: SensorType::ThermoHygro,
            subtype: SensorSubtype::None,
        }];
        let (service, store) =
            service_for(SimBus::with_slave(th_slave(8, 250, 455)), sensors);

        let report = service
            .poll_and_save(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(report.sensors, 1);
        assert_eq!(report.produced, 2);
        assert_eq!(report.saved, 2);
        assert_eq!(report.failed, 0);

        let records = store.snapshot();
        assert_eq!(records[0], (4, 1, "25.000".to_string()));
        assert_eq!(records[1], (4, 2, "45.500".to_string()));
    }

    #[tokio::test]
    async fn failed_sensor_writes_a_sentinel_and_cycle_continues() {
        let mut dead = th_slave(2, 200, 400);
        dead.silent = true;
        let sensors = vec![
            Sensor {
                channel: 1,
                address: 1,
                sensor_type: SensorType::ThermoHygro,
                subtype: SensorSubtype::None,
            },
            Sensor {
                channel: 2,
                address: 2,
                sensor_type: SensorType::ThermoHygro,
                subtype: SensorSubtype::None,
            },
        ];
        let (service, store) = service_for(
            SimBus::new(vec![th_slave(1, 250, 455), dead]),
            sensors,
        );

        let report = service
            .poll_and_save(Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.saved, 3);

        let records = store.snapshot();
        // the dead sensor's slot still appears in the timeline
        let sentinel = records.iter().find(|r| r.0 == 2).unwrap();
        assert_eq!(sentinel.1, 0);
        assert_eq!(sentinel.2, format!("ERR={}", BusError::Timeout.code()));
    }

    #[tokio::test]
    async fn energy_sensor_writes_phased_cells() {
        let mut meter = SimSlave::new(2);
        meter.holding.insert(0x0103, 123);
        meter.holding.insert(0x0104, 456);
        meter.holding.insert(0x0105, 789);
        let sensors = vec![Sensor {
            channel: 3,
            address: 2,
            sensor_type: SensorType::Energy,
            subtype: SensorSubtype::ThreePhase,
        }];
        let (service, store) = service_for(SimBus::with_slave(meter), sensors);

        service.poll_and_save(Duration::from_millis(100)).await.unwrap();
        let records = store.snapshot();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], (3, 1, "1.230".to_string()));
        assert_eq!(records[1], (3, 2, "4.560".to_string()));
        assert_eq!(records[2], (3, 3, "7.890".to_string()));
    }

    #[tokio::test]
    async fn empty_enrollment_aborts_with_not_found() {
        let (service, store) = service_for(SimBus::new(vec![]), vec![]);
        let err = service
            .poll_and_save(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotFound));
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn unsupported_type_is_recorded_as_data() {
        let sensors = vec![Sensor {
            channel: 6,
            address: 6,
            sensor_type: SensorType::Pressure,
            subtype: SensorSubtype::None,
        }];
        let (service, store) = service_for(SimBus::new(vec![]), sensors);

        let report = service
            .poll_and_save(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        let records = store.snapshot();
        assert_eq!(
            records[0],
            (6, 0, format!("ERR={}", BusError::UnsupportedType(String::new()).code()))
        );
    }

    #[tokio::test]
    async fn fixed_profile_is_applied_and_restored() {
        let sensors = vec![Sensor {
            channel: 4,
            address: 8,
            sensor_type: SensorType::ThermoHygro,
            subtype: SensorSubtype::None,
        }];
        let bus = SimBus::with_slave(th_slave(8, 250, 455));
        let transport = Arc::new(bus);
        let guard = Arc::new(BusGuard::new());
        let master = Arc::new(ModbusMaster::new(transport.clone(), guard));
        let config = Config::default();
        let service = PollService::new(
            &config,
            master,
            transport.clone(),
            DriverRegistry::default(),
            Box::new(StaticSensorSource(sensors)),
            Box::new(MemoryStore::default()),
        );

        service.poll_and_save(Duration::from_millis(100)).await.unwrap();

        let applied = transport.applied_profiles.lock().unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(
            applied[0],
            fixed_profile_for(SensorType::ThermoHygro, SensorSubtype::None).unwrap()
        );
        assert_eq!(applied[1], config.default_profile());
    }
}
