//! WS-3000 Weather Console CLI
//!
//! A command-line interface (CLI) application for the Ambient Weather WS-3000
//! (Misol HP-3000) console with up to 8 remote temperature/humidity sensors,
//! connected over USB.
//!
//! This tool allows users to:
//! - Read the console configuration (temperature units).
//! - Read the current temperature and humidity of all sensor channels.
//! - Set the console clock to the local time of the host.
//! - Run in a continuous daemon mode to poll the sensors and either print them
//!   to the console or publish them to an MQTT broker, optionally keeping the
//!   console clock in sync.
//!
//! The CLI leverages the `ws3000_lib` crate for protocol definitions and client operations.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::panic;
use ws3000_lib::{
    clock::{ClockSync, DEFAULT_SYNC_PERIOD, TimeSync},
    poll::PollLoop,
    safe_client::SafeClient,
    usb::UsbTransport,
};

mod commandline;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

macro_rules! print_device_configuration {
    ($device:expr) => {
        let config = $device
            .read_device_configuration()
            .with_context(|| "Cannot read device configuration")?;
        println!("Device configuration: {}", config)
    };
}

macro_rules! print_sensor_values {
    ($device:expr) => {
        let values = $device
            .read_sensor_values()
            .with_context(|| "Cannot read sensor values")?;
        println!("Sensor values: {}", values)
    };
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "WS-3000 CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Open the console; failing here is fatal, later faults are retried
    let settings = args.session_settings();
    debug!("Session settings: {settings:?}");
    let transport = UsbTransport::new().with_context(|| "Cannot create USB transport")?;
    let client = SafeClient::new(transport, settings.clone());
    client.open().with_context(|| {
        format!(
            "Cannot open WS-3000 console {:04x}:{:04x}",
            settings.vendor_id, settings.product_id
        )
    })?;

    // 3. Execute the command
    match &args.command {
        commandline::CliCommands::Daemon {
            poll_interval,
            sync_time,
            output,
        } => {
            info!(
                "Starting daemon mode: output={output:?}, interval={poll_interval:?}, sync_time={sync_time}"
            );
            let _clock_sync = if *sync_time {
                Some(
                    ClockSync::spawn(client.clone(), DEFAULT_SYNC_PERIOD)
                        .with_context(|| "Cannot start clock synchronisation")?,
                )
            } else {
                None
            };
            if let Err(err) = client.read_device_configuration() {
                warn!("Cannot read device configuration, assuming {}: {err}", client.units());
            }
            match output {
                commandline::DaemonOutput::Console => {
                    for values in PollLoop::new(client.clone(), *poll_interval) {
                        if let Ok(values) = values {
                            println!("{values}");
                        }
                    }
                }
                commandline::DaemonOutput::Mqtt { config_file } => {
                    mqtt::run_daemon(&client, poll_interval, config_file)?;
                }
            }
        }
        commandline::CliCommands::ReadConfig => {
            info!("Executing: Read Device Configuration");
            print_device_configuration!(&client);
        }
        commandline::CliCommands::Read => {
            info!("Executing: Read Sensor Values");
            // The configuration tells in which unit the temperatures are reported.
            print_device_configuration!(&client);
            print_sensor_values!(&client);
        }
        commandline::CliCommands::SyncTime => {
            info!("Executing: Sync Time");
            let time = TimeSync::now();
            client
                .sync_time_at(&time)
                .with_context(|| "Cannot set console clock")?;
            println!("Console clock set to {time}");
        }
    }

    client.close();
    Ok(())
}
