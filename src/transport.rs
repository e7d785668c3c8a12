//! The USB operations the session needs from the platform.
//!
//! [`Transport`] is implemented for real hardware by
//! [`crate::usb::UsbTransport`] (feature `usb`).

use std::time::Duration;

/// Errors reported by a [`Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("USB device {vendor_id:04x}:{product_id:04x} not found")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },
    #[error("USB device is not open")]
    NotOpen,
    #[error("USB interface {0} not found in active configuration")]
    InterfaceNotFound(u8),
    #[error("No {direction} endpoint on interface {interface}")]
    EndpointNotFound {
        interface: u8,
        direction: &'static str,
    },
    #[error("USB transfer timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Bulk endpoint addresses of the claimed interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub read: u8,
    pub write: u8,
}

/// Blocking access to one USB device.
///
/// Every method acts on the device found by the last successful [`open`](Transport::open)
/// and fails with [`TransportError::NotOpen`] otherwise.
pub trait Transport {
    /// Finds and opens the device with the given identifiers.
    fn open(&mut self, vendor_id: u16, product_id: u16) -> Result<(), TransportError>;

    /// Performs a USB port reset.
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Detaches a kernel driver bound to `interface`, returns `false` if none was bound.
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<bool, TransportError>;

    /// Selects the first configuration of the device.
    fn set_configuration(&mut self) -> Result<(), TransportError>;

    /// Resolves the first bulk IN and OUT endpoints of `interface`.
    fn endpoints(&mut self, interface: u8) -> Result<Endpoints, TransportError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Releases the claimed interface and closes the device.
    fn release(&mut self) -> Result<(), TransportError>;

    fn write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn read(
        &mut self,
        endpoint: u8,
        size: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    pub(crate) const IN_EP: u8 = 0x82;
    pub(crate) const OUT_EP: u8 = 0x01;

    /// Everything the session did to the mock device.
    #[derive(Debug, Default)]
    pub(crate) struct MockState {
        pub present: bool,
        pub fail_claim: bool,
        pub fail_reset: bool,
        /// `reset` fails like WinUSB does.
        pub reset_unsupported: bool,
        pub fail_release: bool,
        pub is_open: bool,
        pub opens: usize,
        pub resets: usize,
        pub detaches: usize,
        pub claims: usize,
        pub releases: usize,
        pub writes: Vec<Vec<u8>>,
        pub reads: usize,
        /// Responses handed out in order; `fallback` once drained.
        pub responses: VecDeque<Vec<u8>>,
        pub fallback: Vec<u8>,
    }

    /// Scripted in-memory device, clones share their state.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MockTransport {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub(crate) fn new(fallback: Vec<u8>) -> Self {
            let state = MockState {
                present: true,
                fallback,
                ..Default::default()
            };
            Self {
                state: Arc::new(Mutex::new(state)),
            }
        }

        pub(crate) fn push_response(&self, response: Vec<u8>) {
            self.lock().responses.push_back(response);
        }

        pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }

        fn ensure_open(state: &MockState) -> Result<(), TransportError> {
            if state.is_open {
                Ok(())
            } else {
                Err(TransportError::NotOpen)
            }
        }
    }

    impl Transport for MockTransport {
        fn open(&mut self, vendor_id: u16, product_id: u16) -> Result<(), TransportError> {
            let mut state = self.lock();
            state.opens += 1;
            if !state.present {
                return Err(TransportError::DeviceNotFound {
                    vendor_id,
                    product_id,
                });
            }
            state.is_open = true;
            Ok(())
        }

        fn reset(&mut self) -> Result<(), TransportError> {
            let mut state = self.lock();
            Self::ensure_open(&state)?;
            state.resets += 1;
            if state.reset_unsupported {
                return Err(io::Error::new(io::ErrorKind::Unsupported, "reset not supported").into());
            }
            if state.fail_reset {
                return Err(io::Error::other("reset failed").into());
            }
            Ok(())
        }

        fn detach_kernel_driver(&mut self, _interface: u8) -> Result<bool, TransportError> {
            let mut state = self.lock();
            Self::ensure_open(&state)?;
            state.detaches += 1;
            Ok(false)
        }

        fn set_configuration(&mut self) -> Result<(), TransportError> {
            Self::ensure_open(&self.lock())
        }

        fn endpoints(&mut self, _interface: u8) -> Result<Endpoints, TransportError> {
            Self::ensure_open(&self.lock())?;
            Ok(Endpoints {
                read: IN_EP,
                write: OUT_EP,
            })
        }

        fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
            let mut state = self.lock();
            Self::ensure_open(&state)?;
            state.claims += 1;
            if state.fail_claim {
                return Err(TransportError::InterfaceNotFound(interface));
            }
            Ok(())
        }

        fn release(&mut self) -> Result<(), TransportError> {
            let mut state = self.lock();
            state.releases += 1;
            if state.fail_release {
                return Err(TransportError::NotOpen);
            }
            state.is_open = false;
            Ok(())
        }

        fn write(
            &mut self,
            endpoint: u8,
            data: &[u8],
            _timeout: Duration,
        ) -> Result<usize, TransportError> {
            let mut state = self.lock();
            Self::ensure_open(&state)?;
            assert_eq!(endpoint, OUT_EP);
            state.writes.push(data.to_vec());
            Ok(data.len())
        }

        fn read(
            &mut self,
            endpoint: u8,
            size: usize,
            _timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            let mut state = self.lock();
            Self::ensure_open(&state)?;
            assert_eq!(endpoint, IN_EP);
            state.reads += 1;
            let mut response = match state.responses.pop_front() {
                Some(response) => response,
                None => state.fallback.clone(),
            };
            response.truncate(size);
            Ok(response)
        }
    }
}
