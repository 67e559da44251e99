use clap::{Arg, ArgMatches, Command};
use log::info;
use std::time::Duration;

use crate::devices::registry::DriverRegistry;
use crate::devices::temp_hum::REG_DEVICE_ADDRESS;
use crate::modbus::master::ModbusMaster;
use crate::services::PollService;
use crate::utils::error::BusError;

pub fn build_cli() -> Command {
    Command::new("rs485_datalogger")
        .about("Field data-logging node: RS-485/Modbus sensor acquisition")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Path to the node configuration file"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .value_name("DEVICE")
                .help("Serial port override (e.g. /dev/ttyUSB0)"),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .short('b')
                .value_name("RATE")
                .help("Baud rate override"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .short('i')
                .value_name("SECONDS")
                .help("Poll interval override"),
        )
        .subcommand(Command::new("run").about("Poll all enrolled sensors continuously"))
        .subcommand(Command::new("poll").about("Run a single poll-and-save cycle"))
        .subcommand(
            Command::new("ping")
                .about("Check whether a device answers at a bus address")
                .arg(Arg::new("address").required(true).value_name("ADDR")),
        )
        .subcommand(
            Command::new("probe")
                .about("Identify an untyped device by scanning the known drivers")
                .arg(Arg::new("address").required(true).value_name("ADDR")),
        )
        .subcommand(
            Command::new("set-address")
                .about("Re-address a device (writes its address holding register)")
                .arg(Arg::new("address").required(true).value_name("ADDR"))
                .arg(Arg::new("new_address").required(true).value_name("NEW")),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write a default configuration file")
                .arg(Arg::new("path").required(true).value_name("FILE")),
        )
}

fn parse_address(matches: &ArgMatches, name: &str) -> Result<u8, BusError> {
    let raw = matches
        .get_one::<String>(name)
        .ok_or_else(|| BusError::Config(format!("missing {}", name)))?;
    let addr: u8 = raw
        .parse()
        .map_err(|e| BusError::Config(format!("invalid address '{}': {}", raw, e)))?;
    if !(1..=247).contains(&addr) {
        return Err(BusError::Config(format!(
            "address {} out of the 1..=247 range",
            addr
        )));
    }
    Ok(addr)
}

/// Dispatch the enrollment-tooling subcommands. Returns `Ok(false)` when no
/// subcommand matched (the caller falls through to the default run mode).
pub async fn handle_subcommands(
    matches: &ArgMatches,
    master: &ModbusMaster,
    service: &PollService,
    timeout: Duration,
) -> Result<bool, BusError> {
    let registry: &DriverRegistry = service.registry();
    if matches.subcommand_matches("poll").is_some() {
        let report = service.poll_and_save(timeout).await?;
        println!(
            "cycle: {} sensors, {} measurements, {} cells saved, {} failed",
            report.sensors, report.produced, report.saved, report.failed
        );
        return Ok(true);
    }

    if let Some(sub) = matches.subcommand_matches("ping") {
        let address = parse_address(sub, "address")?;
        let outcome = master.ping(address, timeout).await;
        match outcome.function_code {
            Some(fc) => println!("addr={}: alive (fc=0x{:02X})", address, fc),
            None => println!("addr={}: no response", address),
        }
        return Ok(true);
    }

    if let Some(sub) = matches.subcommand_matches("probe") {
        let address = parse_address(sub, "address")?;
        match registry.probe_any(master, address, timeout).await {
            Ok(hit) => {
                println!(
                    "addr={}: {} (subtype '{}') via {} fc=0x{:02X}",
                    address,
                    hit.sensor_type,
                    hit.subtype.label(),
                    hit.driver_name,
                    hit.function_code
                );
            }
            Err(BusError::NotFound) => {
                println!("addr={}: no known driver recognized the device", address)
            }
            Err(e) => return Err(e),
        }
        return Ok(true);
    }

    if let Some(sub) = matches.subcommand_matches("set-address") {
        let address = parse_address(sub, "address")?;
        let new_address = parse_address(sub, "new_address")?;
        master
            .write_single_register(address, REG_DEVICE_ADDRESS, new_address as u16, timeout)
            .await?;
        info!("re-addressed device {} -> {}", address, new_address);
        println!("addr={}: now answering at {}", address, new_address);
        return Ok(true);
    }

    Ok(false)
}
