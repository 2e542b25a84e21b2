//! Composite USB device stack for microcontroller firmware.
//!
//! One physical device, several logical functions: a CDC-ACM virtual
//! serial port, a HID keyboard, a HID mouse and (optionally) a
//! mass-storage endpoint pair, multiplexed over a small fixed set of
//! hardware endpoints.
//!
//! The crate owns the hard part - control-transfer dispatch and
//! endpoint I/O sequencing - and leaves register access to a [`UsbBus`]
//! implementation the firmware supplies per target. Everything above
//! that trait is portable, `no_std`, and tested on the host
//! (`cargo test`).
//!
//! ```no_run
//! # use usb_composite::{UsbComposite, CdcConfig, KeyboardConfig, MouseConfig};
//! # fn example(bus: impl usb_composite::UsbBus) -> Result<(), usb_composite::Error> {
//! let mut dev = UsbComposite::new(bus);
//! dev.add_cdc(CdcConfig::default())?;
//! dev.add_keyboard(KeyboardConfig::default())?;
//! dev.add_mouse(MouseConfig::default())?;
//! dev.attach();
//!
//! loop {
//!     dev.poll();
//!     if dev.configured() {
//!         if let Some(mut kb) = dev.keyboard() {
//!             kb.write_str("hi")?;
//!         }
//!     }
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod bus;
pub mod cdc;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod function;
pub mod hid;
pub mod msc;

pub use bus::{BusEvent, EpAddr, EpDir, EpType, UsbBus};
pub use cdc::{CdcConfig, LineCoding, Serial};
pub use control::{Recipient, RequestKind, SetupPacket};
pub use device::{DeviceState, UsbComposite};
pub use error::Error;
pub use function::{Function, FunctionSet};
pub use hid::keyboard::{Keyboard, KeyboardConfig, KeyboardReport};
pub use hid::mouse::{Mouse, MouseConfig, MouseReport};
pub use msc::{MscConfig, MscHandler, MscPipe};
