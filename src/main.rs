use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;

use rs485_datalogger::cli::{build_cli, handle_subcommands};
use rs485_datalogger::config::Config;
use rs485_datalogger::devices::DriverRegistry;
use rs485_datalogger::modbus::{BusGuard, ModbusMaster, SerialTransport};
use rs485_datalogger::services::{FileSensorSource, PollService, SensorSource, StaticSensorSource};
use rs485_datalogger::storage::FileStore;
use rs485_datalogger::utils::BusError;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = build_cli().get_matches();

    // init-config needs no bus at all
    if let Some(sub) = matches.subcommand_matches("init-config") {
        let path = sub
            .get_one::<String>("path")
            .expect("clap enforces the argument");
        Config::default().save_to_file(path)?;
        println!("wrote default configuration to {}", path);
        return Ok(());
    }

    let config_path = matches.get_one::<String>("config").cloned();
    let mut config = match &config_path {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(BusError::NotFound) => {
                warn!("configuration {} not found, using defaults", path);
                Config::default()
            }
            Err(e) => return Err(e.into()),
        },
        None => Config::default(),
    };
    config.apply_matches(&matches)?;

    info!("🏭 Node: {} [{}]", config.node_name, config.node_uuid);
    info!(
        "📡 {} sensor(s) enrolled, {} enabled",
        config.sensors.len(),
        config.enabled_sensors().len()
    );

    let transport = Arc::new(SerialTransport::open(
        &config.serial_port,
        &config.default_profile(),
    )?);
    let guard = Arc::new(BusGuard::new());
    let master = Arc::new(ModbusMaster::new(transport.clone(), guard));
    let registry = DriverRegistry::default();

    // with a config file the enrollment is re-read every cycle, so edits
    // land without a restart
    let source: Box<dyn SensorSource> = match &config_path {
        Some(path) => Box::new(FileSensorSource::new(path)),
        None => Box::new(StaticSensorSource(config.enabled_sensors())),
    };
    let store = Box::new(FileStore::new(&config.records_path));

    let service = PollService::new(
        &config,
        master.clone(),
        transport.clone(),
        registry,
        source,
        store,
    );

    // enrollment tooling subcommands run one action and exit
    let handled =
        handle_subcommands(&matches, &master, &service, config.transaction_timeout()).await?;
    if handled {
        return Ok(());
    }

    // default (and `run`): continuous polling until interrupted
    tokio::select! {
        _ = service.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}
