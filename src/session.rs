//! Lifecycle of the USB session and the request/response exchange.
//!
//! The console intermittently drops the session. A plain re-read does not
//! recover it, so [`Session::exchange`] closes and reopens the whole device
//! between attempts.
//!
//! `Session` is not synchronised; share it through
//! [`crate::safe_client::SafeClient`].

use crate::{
    protocol::{self as proto, Command, FrameLayout, Record, Units},
    transport::{Endpoints, Transport, TransportError},
};
use log::{debug, error, info, trace, warn};
use std::{fmt, io, str::FromStr, time::Duration};

pub const DEFAULT_VENDOR_ID: u16 = 0x0483;
pub const DEFAULT_PRODUCT_ID: u16 = 0x5750;
pub const DEFAULT_INTERFACE: u8 = 0;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_WAIT_BEFORE_RETRY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_TRIES: u8 = 3;

/// Errors returned by the session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to find USB device {vendor_id:04x}:{product_id:04x}")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("Opening the USB device failed while trying to {step}")]
    OpenFailed {
        step: OpenStep,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] crate::Error),

    #[error("Giving up on {command} after {attempts} attempts")]
    ExchangeExhausted {
        command: Command,
        attempts: u8,
        #[source]
        last: Box<Error>,
    },
}

/// The result type for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The step of [`Session::open`] that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStep {
    Open,
    Reset,
    DetachKernelDriver,
    SetConfiguration,
    ResolveEndpoints,
    ClaimInterface,
}

impl fmt::Display for OpenStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            OpenStep::Open => "open the device",
            OpenStep::Reset => "reset the device",
            OpenStep::DetachKernelDriver => "detach the kernel driver",
            OpenStep::SetConfiguration => "select the configuration",
            OpenStep::ResolveEndpoints => "resolve the endpoints",
            OpenStep::ClaimInterface => "claim the interface",
        };
        write!(f, "{step}")
    }
}

/// Operating system specific USB behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    /// The platform this binary was built for.
    pub const fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// Requests must be padded with zeros to a full packet.
    pub const fn pads_packets(self) -> bool {
        matches!(self, Platform::Windows)
    }

    pub const fn detaches_kernel_driver(self) -> bool {
        !matches!(self, Platform::Windows)
    }

    /// WinUSB cannot reset a device.
    pub const fn resets_device(self) -> bool {
        !matches!(self, Platform::Windows)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

impl FromStr for Platform {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "macos" => Ok(Platform::MacOs),
            "windows" => Ok(Platform::Windows),
            _ => Err(crate::Error::InvalidPlatform(s.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::MacOs => write!(f, "macos"),
            Platform::Windows => write!(f, "windows"),
        }
    }
}

/// How to find and talk to the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    /// Timeout of every single USB read or write.
    pub timeout: Duration,
    /// Delay between reopening the device and retrying a failed exchange.
    pub wait_before_retry: Duration,
    /// Attempts per exchange before giving up.
    pub max_tries: u8,
    /// Size of one USB packet read from the device.
    pub packet_size: usize,
    pub platform: Platform,
    pub layout: FrameLayout,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            interface: DEFAULT_INTERFACE,
            timeout: DEFAULT_TIMEOUT,
            wait_before_retry: DEFAULT_WAIT_BEFORE_RETRY,
            max_tries: DEFAULT_MAX_TRIES,
            packet_size: proto::DEFAULT_PACKET_SIZE,
            platform: Platform::current(),
            layout: FrameLayout::default(),
        }
    }
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Ready,
    /// The last attempt failed and the device is being reopened.
    Faulted,
    /// The last exchange used up all attempts; the device is closed.
    GivenUp,
}

/// An exclusive session with one console.
#[derive(Debug)]
pub struct Session<T: Transport> {
    transport: T,
    settings: SessionSettings,
    endpoints: Option<Endpoints>,
    state: SessionState,
    units: Units,
}

impl<T: Transport> Session<T> {
    /// Creates a closed session; the device is opened on first use or by [`open`](Self::open).
    pub fn new(transport: T, settings: SessionSettings) -> Self {
        Self {
            transport,
            settings,
            endpoints: None,
            state: SessionState::Closed,
            units: Units::default(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The display unit learned by the last device configuration read.
    pub fn units(&self) -> Units {
        self.units
    }

    pub fn is_open(&self) -> bool {
        self.endpoints.is_some()
    }

    /// Opens, resets, configures and claims the device.
    ///
    /// If a step fails after the device was found, the device is closed
    /// again before the error is returned.
    pub fn open(&mut self) -> Result<()> {
        let (vendor_id, product_id) = (self.settings.vendor_id, self.settings.product_id);
        let interface = self.settings.interface;
        info!("Opening USB device {vendor_id:04x}:{product_id:04x}");

        match self.transport.open(vendor_id, product_id) {
            Ok(()) => {}
            Err(TransportError::DeviceNotFound { .. }) => {
                error!("Unable to find USB device {vendor_id:04x}:{product_id:04x}");
                return Err(Error::DeviceNotFound {
                    vendor_id,
                    product_id,
                });
            }
            Err(source) => {
                return Err(Error::OpenFailed {
                    step: OpenStep::Open,
                    source,
                })
            }
        }

        // A reset is required if the device was left in a bad state.
        if self.settings.platform.resets_device() {
            let result = match self.transport.reset() {
                Err(TransportError::Io(err)) if err.kind() == io::ErrorKind::Unsupported => {
                    debug!("Device reset not supported: {err}");
                    Ok(())
                }
                result => result,
            };
            self.open_step(OpenStep::Reset, result)?;
        }

        if self.settings.platform.detaches_kernel_driver() {
            let result = self.transport.detach_kernel_driver(interface);
            if self.open_step(OpenStep::DetachKernelDriver, result)? {
                info!("Detached kernel driver from interface {interface}");
            }
        }

        let result = self.transport.set_configuration();
        self.open_step(OpenStep::SetConfiguration, result)?;

        let result = self.transport.endpoints(interface);
        let endpoints = self.open_step(OpenStep::ResolveEndpoints, result)?;
        debug!(
            "Interface {interface}: IN endpoint {:#04x}, OUT endpoint {:#04x}",
            endpoints.read, endpoints.write
        );

        let result = self.transport.claim_interface(interface);
        self.open_step(OpenStep::ClaimInterface, result)?;

        self.endpoints = Some(endpoints);
        self.state = SessionState::Ready;
        info!("USB device {vendor_id:04x}:{product_id:04x} ready");
        Ok(())
    }

    fn open_step<R>(
        &mut self,
        step: OpenStep,
        result: std::result::Result<R, TransportError>,
    ) -> Result<R> {
        result.map_err(|source| {
            error!("Unable to {step}: {source}");
            self.close();
            Error::OpenFailed { step, source }
        })
    }

    /// Releases the device, falling back to a reset. Never fails.
    pub fn close(&mut self) {
        if let Err(err) = self.transport.release() {
            warn!("Releasing USB device failed: {err}, resetting it instead");
            if let Err(err) = self.transport.reset() {
                debug!("Resetting USB device failed: {err}");
            }
        }
        self.endpoints = None;
        self.state = SessionState::Closed;
    }

    fn ensure_open(&mut self) -> Result<Endpoints> {
        match self.endpoints {
            Some(endpoints) => Ok(endpoints),
            None => {
                self.open()?;
                self.endpoints.ok_or(Error::Transport(TransportError::NotOpen))
            }
        }
    }

    fn write_frame(&mut self, endpoint: u8, command: Command, payload: &[u8]) -> Result<()> {
        let mut frame = proto::encode_request(command, payload);
        if self.settings.platform.pads_packets() && frame.len() < self.settings.packet_size {
            frame.resize(self.settings.packet_size, 0);
        }
        debug!(
            "write {command}: {frame:02x?} (len={}) - timeout: {:?}",
            frame.len(),
            self.settings.timeout
        );
        self.transport
            .write(endpoint, &frame, self.settings.timeout)?;
        Ok(())
    }

    /// One write, read and decode cycle without any recovery.
    fn attempt(&mut self, command: Command, payload: &[u8]) -> Result<Record> {
        let endpoints = self.ensure_open()?;
        self.write_frame(endpoints.write, command, payload)?;

        trace!("reading {} bytes", self.settings.packet_size);
        let buffer = self.transport.read(
            endpoints.read,
            self.settings.packet_size,
            self.settings.timeout,
        )?;
        debug!("read: {buffer:02x?} (len={})", buffer.len());

        let layout = self.settings.layout;
        let frame = proto::extract_frame(&buffer, self.settings.packet_size, layout)?;
        Ok(proto::decode(command, frame, self.units, layout)?)
    }

    /// Sends `command` and decodes the response.
    ///
    /// A failed attempt closes the device. While attempts remain, the request
    /// is retried after [`SessionSettings::wait_before_retry`] and the next
    /// attempt reopens the device. When all
    /// [`SessionSettings::max_tries`] attempts failed the session is left
    /// closed and [`Error::ExchangeExhausted`] is returned.
    pub fn exchange(&mut self, command: Command, payload: &[u8]) -> Result<Record> {
        let max_tries = self.settings.max_tries.max(1);
        let mut attempts = 0;
        loop {
            let err = match self.attempt(command, payload) {
                Ok(record) => {
                    if let Record::DeviceConfiguration(config) = &record {
                        if config.units != self.units {
                            info!("Display units changed to {}", config.units);
                        }
                        self.units = config.units;
                    }
                    self.state = SessionState::Ready;
                    return Ok(record);
                }
                Err(err) => err,
            };

            attempts += 1;
            warn!("Exchange {command} failed (attempt {attempts}/{max_tries}): {err}");
            self.close();

            if attempts >= max_tries {
                error!("Max retries exceeded while exchanging {command}");
                self.state = SessionState::GivenUp;
                return Err(Error::ExchangeExhausted {
                    command,
                    attempts,
                    last: Box::new(err),
                });
            }

            self.state = SessionState::Faulted;
            std::thread::sleep(self.settings.wait_before_retry);
            debug!("Reopening USB device for attempt {}", attempts + 1);
        }
    }

    /// Sends `command` without waiting for a response.
    ///
    /// Used for commands the console does not answer, such as
    /// [`Command::SyncTime`]. There is a single attempt; a failure closes the device.
    pub fn issue(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        let result = self
            .ensure_open()
            .and_then(|endpoints| self.write_frame(endpoints.write, command, payload));
        if let Err(err) = &result {
            warn!("Sending {command} failed: {err}");
            self.close();
        }
        result
    }
}
