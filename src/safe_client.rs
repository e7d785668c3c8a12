//! Thread-safe client for the WS-3000 console.
//!
//! The poll loop and the clock synchronisation thread talk to the same
//! device. `SafeClient` wraps the [`Session`] in a mutex that is held for a
//! whole exchange, including retries and reconnects, so two commands never
//! interleave on the wire.
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(feature = "usb")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use ws3000_lib::{safe_client::SafeClient, session::SessionSettings, usb::UsbTransport};
//!
//! let client = SafeClient::new(UsbTransport::new()?, SessionSettings::default());
//! client.open()?;
//! let config = client.read_device_configuration()?;
//! let values = client.read_sensor_values()?;
//! println!("{config}: {values}");
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "usb"))]
//! # fn main() {}
//! ```

use crate::{
    clock::TimeSync,
    protocol::{self as proto, Command, Record, Units},
    session::{Result, Session, SessionSettings, SessionState},
    transport::Transport,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The device configuration together with the channels found active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub configuration: proto::DeviceConfiguration,
    pub active_channels: Vec<proto::Channel>,
}

impl DeviceSummary {
    pub fn units(&self) -> Units {
        self.configuration.units
    }

    pub fn sensor_count(&self) -> usize {
        self.active_channels.len()
    }
}

/// Shareable handle to one [`Session`].
#[derive(Debug)]
pub struct SafeClient<T: Transport> {
    session: Arc<Mutex<Session<T>>>,
}

impl<T: Transport> Clone for SafeClient<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
        }
    }
}

impl<T: Transport> SafeClient<T> {
    /// Creates a client with a closed session.
    pub fn new(transport: T, settings: SessionSettings) -> Self {
        Self::from_session(Session::new(transport, settings))
    }

    pub fn from_session(session: Session<T>) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session<T>> {
        // A panic mid-exchange leaves at worst a half open device, which the
        // next exchange closes and reopens.
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the device. Fails with [`crate::session::Error::DeviceNotFound`] if it is not connected.
    pub fn open(&self) -> Result<()> {
        self.lock().open()
    }

    pub fn close(&self) {
        self.lock().close()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state()
    }

    pub fn units(&self) -> Units {
        self.lock().units()
    }

    /// See [`Session::exchange`].
    pub fn exchange(&self, command: Command, payload: &[u8]) -> Result<Record> {
        self.lock().exchange(command, payload)
    }

    /// Reads the current values of all channels in the display unit.
    pub fn read_sensor_values(&self) -> Result<proto::SensorValues> {
        match self.exchange(Command::SensorValues, &[])? {
            Record::SensorValues(values) => Ok(values),
            other => mismatch(Command::SensorValues, &other),
        }
    }

    /// Reads the device configuration and remembers its display unit.
    pub fn read_device_configuration(&self) -> Result<proto::DeviceConfiguration> {
        match self.exchange(Command::DeviceConfiguration, &[])? {
            Record::DeviceConfiguration(config) => Ok(config),
            other => mismatch(Command::DeviceConfiguration, &other),
        }
    }

    /// Reads the configuration and probes which channels have a sensor attached.
    ///
    /// Both reads happen under one lock.
    pub fn discover(&self) -> Result<DeviceSummary> {
        let mut session = self.lock();
        let configuration = match session.exchange(Command::DeviceConfiguration, &[])? {
            Record::DeviceConfiguration(config) => config,
            other => mismatch(Command::DeviceConfiguration, &other),
        };
        let active_channels = match session.exchange(Command::SensorValues, &[])? {
            Record::SensorValues(values) => values.active_channels(),
            other => mismatch(Command::SensorValues, &other),
        };
        log::info!(
            "Found {} active sensor(s), units {}",
            active_channels.len(),
            configuration.units
        );
        Ok(DeviceSummary {
            configuration,
            active_channels,
        })
    }

    /// Sets the console clock to the current local time.
    pub fn sync_time(&self) -> Result<()> {
        self.sync_time_at(&TimeSync::now())
    }

    pub fn sync_time_at(&self, time: &TimeSync) -> Result<()> {
        log::debug!("sending request for {}: {time}", Command::SyncTime);
        self.lock().issue(Command::SyncTime, &time.encode())
    }
}

// `decode` always yields the record of the requested command.
fn mismatch(command: Command, record: &Record) -> ! {
    unreachable!("{command} decoded to a {} record", record.command())
}
