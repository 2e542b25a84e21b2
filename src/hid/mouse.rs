//! USB HID mouse function (boot protocol compatible).
//!
//! Report layout (4 bytes):
//! ```text
//! Byte 0: Button bitfield
//!         Bit 0 = Left, Bit 1 = Right, Bit 2 = Middle
//! Byte 1: X displacement (signed, -127..127)
//! Byte 2: Y displacement (signed, -127..127)
//! Byte 3: Scroll wheel  (signed, -127..127)
//! ```
//!
//! Displacements are one-shot relative deltas: every `move_by` call
//! emits exactly one report carrying its own deltas, nothing is
//! accumulated between calls. The button set is persistent state and
//! rides along in every report.

use crate::bus::{EpAddr, EpDir, UsbBus};
use crate::config;
use crate::control::{ControlPipe, SetupPacket};
use crate::descriptor::ConfigDescriptorBuf;
use crate::endpoint::Endpoints;
use crate::error::Error;

use super::{request, write_hid_function, HID_PROTOCOL_MOUSE};

/// Mouse report size in bytes.
pub const MOUSE_REPORT_SIZE: usize = 4;

pub const MOUSE_LEFT: u8 = 0x01;
pub const MOUSE_RIGHT: u8 = 0x02;
pub const MOUSE_MIDDLE: u8 = 0x04;
pub const MOUSE_ALL: u8 = MOUSE_LEFT | MOUSE_RIGHT | MOUSE_MIDDLE;

/// Standard USB HID boot-protocol mouse report.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MouseReport {
    /// Button bitfield (bit 0 = left, bit 1 = right, bit 2 = middle).
    pub buttons: u8,
    /// Relative X movement (signed).
    pub x: i8,
    /// Relative Y movement (signed).
    pub y: i8,
    /// Scroll wheel delta (signed).
    pub wheel: i8,
}

impl MouseReport {
    /// Create an idle (no movement, no buttons) report.
    pub const fn empty() -> Self {
        Self {
            buttons: 0,
            x: 0,
            y: 0,
            wheel: 0,
        }
    }

    /// Serialise into a byte slice for transmission.
    /// Returns the number of bytes written (always 4).
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        if buf.len() < MOUSE_REPORT_SIZE {
            return 0;
        }
        buf[0] = self.buttons;
        buf[1] = self.x as u8;
        buf[2] = self.y as u8;
        buf[3] = self.wheel as u8;
        MOUSE_REPORT_SIZE
    }

    /// Returns `true` when no buttons are pressed and there is no movement.
    pub fn is_idle(&self) -> bool {
        self.buttons == 0 && self.x == 0 && self.y == 0 && self.wheel == 0
    }
}

/// Interface/endpoint assignment for the mouse function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MouseConfig {
    pub interface: u8,
    /// Interrupt IN endpoint index.
    pub endpoint: u8,
}

impl Default for MouseConfig {
    fn default() -> Self {
        Self {
            interface: config::MOUSE_INTERFACE,
            endpoint: config::MOUSE_EP,
        }
    }
}

pub struct MouseState {
    pub(crate) interface: u8,
    pub(crate) endpoint: EpAddr,
    /// Currently held buttons; deltas are never stored.
    pub(crate) buttons: u8,
    pub(crate) idle: u8,
    pub(crate) protocol: u8,
}

impl MouseState {
    pub fn new(cfg: &MouseConfig) -> Self {
        Self {
            interface: cfg.interface,
            endpoint: EpAddr::new(cfg.endpoint, EpDir::In),
            buttons: 0,
            idle: 0,
            protocol: super::DEFAULT_PROTOCOL,
        }
    }

    pub(crate) fn handle_setup<B: UsbBus>(
        &mut self,
        pipe: &mut ControlPipe,
        io: &mut Endpoints<B>,
        setup: &SetupPacket,
    ) -> bool {
        match setup.request {
            request::GET_REPORT => {
                let report = MouseReport {
                    buttons: self.buttons,
                    ..MouseReport::empty()
                };
                let mut buf = [0u8; MOUSE_REPORT_SIZE];
                report.serialize(&mut buf);
                pipe.send(io.bus_mut(), &buf).is_ok()
            }
            request::GET_IDLE => pipe.send(io.bus_mut(), &[self.idle]).is_ok(),
            request::SET_IDLE => {
                self.idle = setup.value_high();
                pipe.accept(io.bus_mut()).is_ok()
            }
            request::GET_PROTOCOL => pipe.send(io.bus_mut(), &[self.protocol]).is_ok(),
            request::SET_PROTOCOL => {
                self.protocol = setup.value_low();
                pipe.accept(io.bus_mut()).is_ok()
            }
            _ => false,
        }
    }

    pub(crate) fn write_descriptors(&self, buf: &mut ConfigDescriptorBuf) -> Result<(), Error> {
        write_hid_function(
            buf,
            self.interface,
            HID_PROTOCOL_MOUSE,
            MOUSE_REPORT_DESCRIPTOR.len(),
            self.endpoint,
            config::INTERRUPT_MAX_PACKET,
            config::HID_POLL_MS,
        )
    }

    pub(crate) fn on_reset(&mut self) {
        self.buttons = 0;
        self.idle = 0;
        self.protocol = super::DEFAULT_PROTOCOL;
    }
}

/// Application handle for the mouse function.
pub struct Mouse<'a, B: UsbBus> {
    pub(crate) io: &'a mut Endpoints<B>,
    pub(crate) state: &'a mut MouseState,
}

impl<B: UsbBus> Mouse<'_, B> {
    /// Emit one relative movement report. Each call is exactly one
    /// report on the wire, whatever came before it.
    pub fn move_by(&mut self, dx: i8, dy: i8, wheel: i8) -> Result<(), Error> {
        self.send(MouseReport {
            buttons: self.state.buttons,
            x: dx,
            y: dy,
            wheel,
        })
    }

    /// Hold buttons down. Sends one zero-delta report iff the button
    /// set changed.
    pub fn press(&mut self, buttons: u8) -> Result<bool, Error> {
        let new = self.state.buttons | buttons;
        if new == self.state.buttons {
            return Ok(false);
        }
        self.state.buttons = new;
        self.send_buttons()?;
        Ok(true)
    }

    /// Release buttons; no-op if none of them were held.
    pub fn release(&mut self, buttons: u8) -> Result<bool, Error> {
        let new = self.state.buttons & !buttons;
        if new == self.state.buttons {
            return Ok(false);
        }
        self.state.buttons = new;
        self.send_buttons()?;
        Ok(true)
    }

    /// Click: press then release, two reports.
    pub fn click(&mut self, buttons: u8) -> Result<(), Error> {
        self.state.buttons |= buttons;
        self.send_buttons()?;
        self.state.buttons &= !buttons;
        self.send_buttons()
    }

    pub fn is_pressed(&self, buttons: u8) -> bool {
        self.state.buttons & buttons != 0
    }

    fn send_buttons(&mut self) -> Result<(), Error> {
        self.send(MouseReport {
            buttons: self.state.buttons,
            ..MouseReport::empty()
        })
    }

    fn send(&mut self, report: MouseReport) -> Result<(), Error> {
        let mut buf = [0u8; MOUSE_REPORT_SIZE];
        report.serialize(&mut buf);
        let n = self.io.send(self.state.endpoint, &buf)?;
        if n < MOUSE_REPORT_SIZE {
            return Err(Error::Disconnected);
        }
        Ok(())
    }
}

// USB HID report descriptor for a boot-protocol mouse

/// USB HID Report Descriptor for a standard 3-button mouse with scroll wheel.
pub const MOUSE_REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x02, // Usage (Mouse)
    0xA1, 0x01, // Collection (Application)
    0x09, 0x01, //   Usage (Pointer)
    0xA1, 0x00, //   Collection (Physical)
    //
    //   - Buttons (3 bits + 5 padding) -
    0x05, 0x09, //     Usage Page (Buttons)
    0x19, 0x01, //     Usage Minimum (Button 1)
    0x29, 0x03, //     Usage Maximum (Button 3)
    0x15, 0x00, //     Logical Minimum (0)
    0x25, 0x01, //     Logical Maximum (1)
    0x95, 0x03, //     Report Count (3)
    0x75, 0x01, //     Report Size (1)
    0x81, 0x02, //     Input (Data, Variable, Absolute)
    0x95, 0x01, //     Report Count (1)
    0x75, 0x05, //     Report Size (5)
    0x81, 0x01, //     Input (Constant) - padding
    //
    //   - X, Y displacement -
    0x05, 0x01, //     Usage Page (Generic Desktop)
    0x09, 0x30, //     Usage (X)
    0x09, 0x31, //     Usage (Y)
    0x15, 0x81, //     Logical Minimum (-127)
    0x25, 0x7F, //     Logical Maximum (127)
    0x75, 0x08, //     Report Size (8)
    0x95, 0x02, //     Report Count (2)
    0x81, 0x06, //     Input (Data, Variable, Relative)
    //
    //   - Scroll wheel -
    0x09, 0x38, //     Usage (Wheel)
    0x15, 0x81, //     Logical Minimum (-127)
    0x25, 0x7F, //     Logical Maximum (127)
    0x75, 0x08, //     Report Size (8)
    0x95, 0x01, //     Report Count (1)
    0x81, 0x06, //     Input (Data, Variable, Relative)
    //
    0xC0, //   End Collection (Physical)
    0xC0, // End Collection (Application)
];
