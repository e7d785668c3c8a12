//! [`Transport`] for real hardware, built on `nusb`.
//!
//! `nusb` transfers are futures. They are driven to completion on a private
//! current-thread `tokio` runtime so the session stays blocking, with
//! `tokio::time::timeout` enforcing the per-transfer timeout. A transfer that
//! times out is cancelled when its future is dropped.

use crate::transport::{Endpoints, Transport, TransportError};
use nusb::transfer::{Direction, EndpointType, RequestBuffer};
use std::{fmt, io, thread, time::Duration};

/// Attempts to find the device again after it re-enumerated on reset.
const REENUMERATE_TRIES: u32 = 20;
const REENUMERATE_DELAY: Duration = Duration::from_millis(100);

pub struct UsbTransport {
    runtime: tokio::runtime::Runtime,
    ids: Option<(u16, u16)>,
    device: Option<nusb::Device>,
    interface: Option<nusb::Interface>,
    endpoint_types: Vec<(u8, EndpointType)>,
}

impl fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbTransport")
            .field("open", &self.device.is_some())
            .field("claimed", &self.interface.is_some())
            .field("endpoints", &self.endpoint_types)
            .finish()
    }
}

impl UsbTransport {
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        Ok(Self {
            runtime,
            ids: None,
            device: None,
            interface: None,
            endpoint_types: Vec::new(),
        })
    }

    fn device(&self) -> Result<&nusb::Device, TransportError> {
        self.device.as_ref().ok_or(TransportError::NotOpen)
    }

    fn interface(&self) -> Result<&nusb::Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::NotOpen)
    }

    fn find(vendor_id: u16, product_id: u16) -> Result<nusb::DeviceInfo, TransportError> {
        nusb::list_devices()?
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .ok_or(TransportError::DeviceNotFound {
                vendor_id,
                product_id,
            })
    }

    fn is_interrupt(&self, endpoint: u8) -> bool {
        self.endpoint_types
            .iter()
            .any(|&(address, kind)| address == endpoint && kind == EndpointType::Interrupt)
    }
}

impl Transport for UsbTransport {
    fn open(&mut self, vendor_id: u16, product_id: u16) -> Result<(), TransportError> {
        let info = Self::find(vendor_id, product_id)?;
        log::debug!("Found {info:?}");
        self.interface = None;
        self.endpoint_types.clear();
        self.device = Some(info.open()?);
        self.ids = Some((vendor_id, product_id));
        Ok(())
    }

    /// Resets the device and opens it again.
    ///
    /// A reset device re-enumerates and its old handle is unusable.
    fn reset(&mut self) -> Result<(), TransportError> {
        let (vendor_id, product_id) = self.ids.ok_or(TransportError::NotOpen)?;
        self.device()?.reset()?;
        self.interface = None;
        self.device = None;
        self.endpoint_types.clear();

        let mut tries = 0;
        let info = loop {
            tries += 1;
            match Self::find(vendor_id, product_id) {
                Ok(info) => break info,
                Err(TransportError::DeviceNotFound { .. }) if tries < REENUMERATE_TRIES => {
                    thread::sleep(REENUMERATE_DELAY)
                }
                Err(err) => return Err(err),
            }
        };
        log::trace!("Reopening {info:?} after reset");
        self.device = Some(info.open()?);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<bool, TransportError> {
        // ENODATA: no driver was bound.
        const ENODATA: i32 = 61;
        match self.device()?.detach_kernel_driver(interface) {
            Ok(()) => Ok(true),
            Err(err) if err.raw_os_error() == Some(ENODATA) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn detach_kernel_driver(&mut self, _interface: u8) -> Result<bool, TransportError> {
        self.device()?;
        Ok(false)
    }

    fn set_configuration(&mut self) -> Result<(), TransportError> {
        let device = self.device()?;
        let value = device
            .configurations()
            .next()
            .map(|config| config.configuration_value())
            .unwrap_or(1);
        if let Ok(active) = device.active_configuration() {
            if active.configuration_value() == value {
                return Ok(());
            }
        }
        Ok(device.set_configuration(value)?)
    }

    fn endpoints(&mut self, interface: u8) -> Result<Endpoints, TransportError> {
        let (read, write) = {
            let config = self
                .device()?
                .active_configuration()
                .map_err(|err| io::Error::other(err.to_string()))?;
            let alt = config
                .interface_alt_settings()
                .find(|alt| alt.interface_number() == interface && alt.alternate_setting() == 0)
                .ok_or(TransportError::InterfaceNotFound(interface))?;

            // First endpoint of each direction, like the vendor software does.
            let find = |direction: Direction, name: &'static str| {
                alt.endpoints()
                    .find(|ep| ep.direction() == direction)
                    .map(|ep| (ep.address(), ep.transfer_type()))
                    .ok_or(TransportError::EndpointNotFound {
                        interface,
                        direction: name,
                    })
            };
            (find(Direction::In, "IN")?, find(Direction::Out, "OUT")?)
        };

        self.endpoint_types = vec![read, write];
        Ok(Endpoints {
            read: read.0,
            write: write.0,
        })
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let claimed = self.device()?.claim_interface(interface)?;
        self.interface = Some(claimed);
        Ok(())
    }

    fn release(&mut self) -> Result<(), TransportError> {
        // Dropping the handles releases the interface and closes the device.
        self.interface = None;
        self.device = None;
        self.ids = None;
        self.endpoint_types.clear();
        Ok(())
    }

    fn write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let interface = self.interface()?;
        let transfer = if self.is_interrupt(endpoint) {
            interface.interrupt_out(endpoint, data.to_vec())
        } else {
            interface.bulk_out(endpoint, data.to_vec())
        };
        let completion = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, transfer).await })
            .map_err(|_| TransportError::Timeout(timeout))?;
        let written = completion.into_result().map_err(io::Error::other)?;
        Ok(written.actual_length())
    }

    fn read(
        &mut self,
        endpoint: u8,
        size: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let interface = self.interface()?;
        let request = RequestBuffer::new(size);
        let transfer = if self.is_interrupt(endpoint) {
            interface.interrupt_in(endpoint, request)
        } else {
            interface.bulk_in(endpoint, request)
        };
        let completion = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, transfer).await })
            .map_err(|_| TransportError::Timeout(timeout))?;
        Ok(completion.into_result().map_err(io::Error::other)?)
    }
}
