//! A library for reading the Ambient Weather WS-3000 (Misol HP-3000) console over USB.
//!
//! The console supports up to 8 remote temperature/humidity sensors, one per
//! channel. It speaks a small framed binary protocol over USB; this crate
//! implements the framing, the decoding of the live sensor values and of the
//! device configuration, setting the console clock and a session that
//! recovers from the frequent USB hiccups of the console.
//!
//! ## Layers
//!
//! 1.  [`protocol`]: stateless framing and decoding.
//! 2.  [`session::Session`]: owns the USB device, performs exchanges and
//!     reconnects on failure. [`safe_client::SafeClient`] shares one session
//!     between threads.
//! 3.  [`poll::PollLoop`] and [`clock::ClockSync`]: the periodic tasks.
//!
//! The USB access itself is abstracted by [`transport::Transport`]; the
//! `usb` feature provides an implementation based on `nusb`.
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "usb")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use ws3000_lib::{
//!     poll::PollLoop, safe_client::SafeClient, session::SessionSettings, usb::UsbTransport,
//! };
//! use std::time::Duration;
//!
//! let client = SafeClient::new(UsbTransport::new()?, SessionSettings::default());
//! client.open()?;
//! client.read_device_configuration()?;
//!
//! for values in PollLoop::new(client, Duration::from_secs(10)).take(3) {
//!     match values {
//!         Ok(values) => println!("{values}"),
//!         Err(err) => eprintln!("poll failed: {err}"),
//!     }
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "usb"))]
//! # fn main() {}
//! ```

mod error;
pub use error::{Error, FrameError};

pub mod clock;
pub mod poll;
pub mod protocol;
pub mod safe_client;
pub mod session;
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(feature = "usb")))]
#[cfg(feature = "usb")]
pub mod usb;
