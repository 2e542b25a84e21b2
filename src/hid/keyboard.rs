//! USB HID keyboard function (boot protocol compatible).
//!
//! Report layout (8 bytes):
//! ```text
//! Byte 0: Modifier keys (bitfield)
//!         Bit 0 = Left Ctrl,  Bit 1 = Left Shift,
//!         Bit 2 = Left Alt,   Bit 3 = Left GUI,
//!         Bit 4 = Right Ctrl, Bit 5 = Right Shift,
//!         Bit 6 = Right Alt,  Bit 7 = Right GUI
//! Byte 1: Reserved (0x00)
//! Byte 2-7: Up to 6 simultaneous key codes (USB HID usage codes)
//! ```
//!
//! The report is the *current* pressed-key set, overwritten in place on
//! each press/release. Re-pressing a held key or releasing an idle one
//! changes nothing and sends nothing.

use crate::bus::{EpAddr, EpDir, UsbBus};
use crate::config;
use crate::control::{ControlPipe, SetupPacket};
use crate::descriptor::ConfigDescriptorBuf;
use crate::endpoint::Endpoints;
use crate::error::Error;

use super::{request, write_hid_function, HID_PROTOCOL_KEYBOARD};

/// Keyboard report size in bytes.
pub const KEYBOARD_REPORT_SIZE: usize = 8;

/// Modifier usage codes occupy 0xE0..=0xE7 and map onto the modifier
/// bitfield rather than a key slot.
const MODIFIER_FIRST: u8 = 0xE0;
const MODIFIER_LAST: u8 = 0xE7;

/// Keyboard LED bits reported by the host via SET_REPORT.
pub const LED_NUM_LOCK: u8 = 0x01;
pub const LED_CAPS_LOCK: u8 = 0x02;
pub const LED_SCROLL_LOCK: u8 = 0x04;

/// Common HID usage codes (HUT 1.11, keyboard page).
pub mod keycodes {
    pub const LEFT_CTRL: u8 = 0xE0;
    pub const LEFT_SHIFT: u8 = 0xE1;
    pub const LEFT_ALT: u8 = 0xE2;
    pub const LEFT_GUI: u8 = 0xE3;
    pub const RIGHT_CTRL: u8 = 0xE4;
    pub const RIGHT_SHIFT: u8 = 0xE5;
    pub const RIGHT_ALT: u8 = 0xE6;
    pub const RIGHT_GUI: u8 = 0xE7;

    pub const ENTER: u8 = 0x28;
    pub const ESC: u8 = 0x29;
    pub const BACKSPACE: u8 = 0x2A;
    pub const TAB: u8 = 0x2B;
    pub const SPACE: u8 = 0x2C;
    pub const CAPS_LOCK: u8 = 0x39;
    pub const F1: u8 = 0x3A;
    pub const F12: u8 = 0x45;
    pub const PRINT_SCREEN: u8 = 0x46;
    pub const SCROLL_LOCK: u8 = 0x47;
    pub const INSERT: u8 = 0x49;
    pub const HOME: u8 = 0x4A;
    pub const PAGE_UP: u8 = 0x4B;
    pub const DELETE: u8 = 0x4C;
    pub const END: u8 = 0x4D;
    pub const PAGE_DOWN: u8 = 0x4E;
    pub const RIGHT_ARROW: u8 = 0x4F;
    pub const LEFT_ARROW: u8 = 0x50;
    pub const DOWN_ARROW: u8 = 0x51;
    pub const UP_ARROW: u8 = 0x52;
    pub const NUM_LOCK: u8 = 0x53;
}

/// Standard USB HID boot-protocol keyboard report.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyboardReport {
    /// Modifier key bitfield.
    pub modifier: u8,
    /// Reserved byte (always 0x00 per HID spec).
    pub reserved: u8,
    /// Up to 6 simultaneously pressed key codes.
    pub keycodes: [u8; 6],
}

impl KeyboardReport {
    /// Create an empty (all-keys-released) report.
    pub const fn empty() -> Self {
        Self {
            modifier: 0,
            reserved: 0,
            keycodes: [0; 6],
        }
    }

    /// Serialise into a byte slice for transmission.
    /// Returns the number of bytes written (always 8).
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        if buf.len() < KEYBOARD_REPORT_SIZE {
            return 0;
        }
        buf[0] = self.modifier;
        buf[1] = self.reserved;
        buf[2..8].copy_from_slice(&self.keycodes);
        KEYBOARD_REPORT_SIZE
    }

    /// Returns `true` if no keys and no modifiers are pressed.
    pub fn is_empty(&self) -> bool {
        self.modifier == 0 && self.keycodes.iter().all(|&k| k == 0)
    }
}

// ASCII-to-keycode translation

/// One translated key: the modifier bits to hold and the usage code to
/// press.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyPress {
    pub modifier: u8,
    pub keycode: u8,
}

/// Pluggable ASCII-to-key translation. Returns `None` for characters the
/// layout cannot type.
pub type Layout = fn(u8) -> Option<KeyPress>;

/// High bit of a map entry means "hold left shift".
const SHIFT: u8 = 0x80;
const LEFT_SHIFT_BIT: u8 = 0x02;

/// US layout: printable ASCII to usage code, shift encoded in bit 7.
#[rustfmt::skip]
const US_ASCIIMAP: [u8; 128] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // NUL..BEL
    0x2A,        // BS
    0x2B,        // TAB
    0x28,        // LF
    0x00,        // VT
    0x00,        // FF
    0x00,        // CR
    0x00, 0x00,  // SO, SI
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // DLE..ETB
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // CAN..US
    0x2C,        // ' '
    0x1E | SHIFT, // !
    0x34 | SHIFT, // "
    0x20 | SHIFT, // #
    0x21 | SHIFT, // $
    0x22 | SHIFT, // %
    0x24 | SHIFT, // &
    0x34,        // '
    0x26 | SHIFT, // (
    0x27 | SHIFT, // )
    0x25 | SHIFT, // *
    0x2E | SHIFT, // +
    0x36,        // ,
    0x2D,        // -
    0x37,        // .
    0x38,        // /
    0x27,        // 0
    0x1E,        // 1
    0x1F,        // 2
    0x20,        // 3
    0x21,        // 4
    0x22,        // 5
    0x23,        // 6
    0x24,        // 7
    0x25,        // 8
    0x26,        // 9
    0x33 | SHIFT, // :
    0x33,        // ;
    0x36 | SHIFT, // <
    0x2E,        // =
    0x37 | SHIFT, // >
    0x38 | SHIFT, // ?
    0x1F | SHIFT, // @
    0x04 | SHIFT, // A
    0x05 | SHIFT, // B
    0x06 | SHIFT, // C
    0x07 | SHIFT, // D
    0x08 | SHIFT, // E
    0x09 | SHIFT, // F
    0x0A | SHIFT, // G
    0x0B | SHIFT, // H
    0x0C | SHIFT, // I
    0x0D | SHIFT, // J
    0x0E | SHIFT, // K
    0x0F | SHIFT, // L
    0x10 | SHIFT, // M
    0x11 | SHIFT, // N
    0x12 | SHIFT, // O
    0x13 | SHIFT, // P
    0x14 | SHIFT, // Q
    0x15 | SHIFT, // R
    0x16 | SHIFT, // S
    0x17 | SHIFT, // T
    0x18 | SHIFT, // U
    0x19 | SHIFT, // V
    0x1A | SHIFT, // W
    0x1B | SHIFT, // X
    0x1C | SHIFT, // Y
    0x1D | SHIFT, // Z
    0x2F,        // [
    0x31,        // backslash
    0x30,        // ]
    0x23 | SHIFT, // ^
    0x2D | SHIFT, // _
    0x35,        // `
    0x04,        // a
    0x05,        // b
    0x06,        // c
    0x07,        // d
    0x08,        // e
    0x09,        // f
    0x0A,        // g
    0x0B,        // h
    0x0C,        // i
    0x0D,        // j
    0x0E,        // k
    0x0F,        // l
    0x10,        // m
    0x11,        // n
    0x12,        // o
    0x13,        // p
    0x14,        // q
    0x15,        // r
    0x16,        // s
    0x17,        // t
    0x18,        // u
    0x19,        // v
    0x1A,        // w
    0x1B,        // x
    0x1C,        // y
    0x1D,        // z
    0x2F | SHIFT, // {
    0x31 | SHIFT, // |
    0x30 | SHIFT, // }
    0x35 | SHIFT, // ~
    0x00,        // DEL
];

/// US-English translation function.
pub fn us_layout(ascii: u8) -> Option<KeyPress> {
    let entry = *US_ASCIIMAP.get(ascii as usize)?;
    if entry == 0 {
        return None;
    }
    Some(KeyPress {
        modifier: if entry & SHIFT != 0 { LEFT_SHIFT_BIT } else { 0 },
        keycode: entry & !SHIFT,
    })
}

// Function driver state

/// Interface/endpoint assignment for the keyboard function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyboardConfig {
    pub interface: u8,
    /// Interrupt IN endpoint index.
    pub endpoint: u8,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            interface: config::KEYBOARD_INTERFACE,
            endpoint: config::KEYBOARD_EP,
        }
    }
}

pub struct KeyboardState {
    pub(crate) interface: u8,
    pub(crate) endpoint: EpAddr,
    pub(crate) report: KeyboardReport,
    pub(crate) leds: u8,
    pub(crate) idle: u8,
    pub(crate) protocol: u8,
    pub(crate) layout: Layout,
}

impl KeyboardState {
    pub fn new(cfg: &KeyboardConfig) -> Self {
        Self {
            interface: cfg.interface,
            endpoint: EpAddr::new(cfg.endpoint, EpDir::In),
            report: KeyboardReport::empty(),
            leds: 0,
            idle: 0,
            protocol: super::DEFAULT_PROTOCOL,
            layout: us_layout,
        }
    }

    /// Add a usage to the report. Returns whether the report changed;
    /// idempotent for keys that are already down.
    pub(crate) fn press_usage(&mut self, usage: u8) -> Result<bool, Error> {
        if usage == 0 {
            return Ok(false);
        }
        if (MODIFIER_FIRST..=MODIFIER_LAST).contains(&usage) {
            return Ok(self.press_modifier_bits(1 << (usage - MODIFIER_FIRST)));
        }
        if self.report.keycodes.contains(&usage) {
            return Ok(false);
        }
        match self.report.keycodes.iter_mut().find(|k| **k == 0) {
            Some(slot) => {
                *slot = usage;
                Ok(true)
            }
            None => Err(Error::CapacityExceeded),
        }
    }

    /// Remove a usage from the report. Returns whether the report
    /// changed; idempotent for keys that were not down.
    pub(crate) fn release_usage(&mut self, usage: u8) -> bool {
        if usage == 0 {
            return false;
        }
        if (MODIFIER_FIRST..=MODIFIER_LAST).contains(&usage) {
            return self.release_modifier_bits(1 << (usage - MODIFIER_FIRST));
        }
        let mut changed = false;
        for k in self.report.keycodes.iter_mut() {
            if *k == usage {
                *k = 0;
                changed = true;
            }
        }
        changed
    }

    pub(crate) fn press_modifier_bits(&mut self, bits: u8) -> bool {
        let new = self.report.modifier | bits;
        let changed = new != self.report.modifier;
        self.report.modifier = new;
        changed
    }

    pub(crate) fn release_modifier_bits(&mut self, bits: u8) -> bool {
        let new = self.report.modifier & !bits;
        let changed = new != self.report.modifier;
        self.report.modifier = new;
        changed
    }

    pub(crate) fn handle_setup<B: UsbBus>(
        &mut self,
        pipe: &mut ControlPipe,
        io: &mut Endpoints<B>,
        setup: &SetupPacket,
    ) -> bool {
        match setup.request {
            request::GET_REPORT => {
                let mut buf = [0u8; KEYBOARD_REPORT_SIZE];
                self.report.serialize(&mut buf);
                pipe.send(io.bus_mut(), &buf).is_ok()
            }
            request::SET_REPORT => {
                // Boot output report: one LED byte, possibly prefixed
                // with a report ID.
                let mut buf = [0u8; 2];
                match pipe.recv(io.bus_mut(), &mut buf) {
                    Ok(n) => {
                        if n > 0 {
                            self.leds = buf[n - 1];
                        }
                        pipe.accept(io.bus_mut()).is_ok()
                    }
                    Err(_) => false,
                }
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
            HID_PROTOCOL_KEYBOARD,
            KEYBOARD_REPORT_DESCRIPTOR.len(),
            self.endpoint,
            config::INTERRUPT_MAX_PACKET,
            config::HID_POLL_MS,
        )
    }

    pub(crate) fn on_reset(&mut self) {
        self.report = KeyboardReport::empty();
        self.idle = 0;
        self.protocol = super::DEFAULT_PROTOCOL;
    }
}

/// Application handle: borrows the keyboard state together with the
/// endpoint manager so every state change can push a report.
pub struct Keyboard<'a, B: UsbBus> {
    pub(crate) io: &'a mut Endpoints<B>,
    pub(crate) state: &'a mut KeyboardState,
}

impl<B: UsbBus> Keyboard<'_, B> {
    /// Press a raw HID usage code (modifiers 0xE0..=0xE7 included).
    /// Sends one report iff the pressed-key set changed.
    pub fn press(&mut self, usage: u8) -> Result<bool, Error> {
        let changed = self.state.press_usage(usage)?;
        if changed {
            self.send_report()?;
        }
        Ok(changed)
    }

    /// Release a raw HID usage code; no-op (and no report) if the key
    /// was not down.
    pub fn release(&mut self, usage: u8) -> Result<bool, Error> {
        let changed = self.state.release_usage(usage);
        if changed {
            self.send_report()?;
        }
        Ok(changed)
    }

    /// Release everything and send the empty report once.
    pub fn release_all(&mut self) -> Result<(), Error> {
        self.state.report = KeyboardReport::empty();
        self.send_report()
    }

    /// Type one ASCII character through the layout: press (modifier and
    /// key in a single report), then release. Returns `Ok(false)` for
    /// characters the layout cannot produce.
    pub fn write(&mut self, ascii: u8) -> Result<bool, Error> {
        let Some(kp) = (self.state.layout)(ascii) else {
            return Ok(false);
        };

        let mods_changed = self.state.press_modifier_bits(kp.modifier);
        let key_changed = match self.state.press_usage(kp.keycode) {
            Ok(changed) => changed,
            Err(e) => {
                if mods_changed {
                    self.state.release_modifier_bits(kp.modifier);
                }
                return Err(e);
            }
        };
        if mods_changed || key_changed {
            self.send_report()?;
        }

        let mut changed = self.state.release_usage(kp.keycode);
        changed |= self.state.release_modifier_bits(kp.modifier);
        if changed {
            self.send_report()?;
        }
        Ok(true)
    }

    /// Type a whole string; characters the layout cannot produce are
    /// skipped. Returns the number of characters typed.
    pub fn write_str(&mut self, s: &str) -> Result<usize, Error> {
        let mut typed = 0;
        for &b in s.as_bytes() {
            if self.write(b)? {
                typed += 1;
            }
        }
        Ok(typed)
    }

    /// LED state last written by the host (SET_REPORT output report).
    pub fn led_status(&self) -> u8 {
        self.state.leds
    }

    pub fn caps_lock_on(&self) -> bool {
        self.state.leds & LED_CAPS_LOCK != 0
    }

    pub fn num_lock_on(&self) -> bool {
        self.state.leds & LED_NUM_LOCK != 0
    }

    /// Swap the ASCII translation function (keyboard layout).
    pub fn set_layout(&mut self, layout: Layout) {
        self.state.layout = layout;
    }

    /// Current report (the pressed-key set).
    pub fn report(&self) -> &KeyboardReport {
        &self.state.report
    }

    fn send_report(&mut self) -> Result<(), Error> {
        let mut buf = [0u8; KEYBOARD_REPORT_SIZE];
        self.state.report.serialize(&mut buf);
        let n = self.io.send(self.state.endpoint, &buf)?;
        if n < KEYBOARD_REPORT_SIZE {
            return Err(Error::Disconnected);
        }
        Ok(())
    }
}

// USB HID report descriptor for a boot-protocol keyboard

/// USB HID Report Descriptor for a standard keyboard.
///
/// This descriptor tells the USB host that we are a keyboard with:
///   - 8 modifier key bits (input)
///   - 1 reserved byte
///   - 5 LED indicators (output)
///   - 6 key code bytes (input)
pub const KEYBOARD_REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // Usage Page (Generic Desktop)
    0x09, 0x06, // Usage (Keyboard)
    0xA1, 0x01, // Collection (Application)
    //
    //   - Modifier keys (8 bits) -
    0x05, 0x07, //   Usage Page (Keyboard/Keypad)
    0x19, 0xE0, //   Usage Minimum (Left Control)
    0x29, 0xE7, //   Usage Maximum (Right GUI)
    0x15, 0x00, //   Logical Minimum (0)
    0x25, 0x01, //   Logical Maximum (1)
    0x75, 0x01, //   Report Size (1)
    0x95, 0x08, //   Report Count (8)
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    //
    //   - Reserved byte -
    0x95, 0x01, //   Report Count (1)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x01, //   Input (Constant) - padding
    //
    //   - LED output (5 bits + 3 padding) -
    0x05, 0x08, //   Usage Page (LEDs)
    0x19, 0x01, //   Usage Minimum (Num Lock)
    0x29, 0x05, //   Usage Maximum (Kana)
    0x95, 0x05, //   Report Count (5)
    0x75, 0x01, //   Report Size (1)
    0x91, 0x02, //   Output (Data, Variable, Absolute)
    0x95, 0x01, //   Report Count (1)
    0x75, 0x03, //   Report Size (3)
    0x91, 0x01, //   Output (Constant) - padding
    //
    //   - Key codes (6 bytes) -
    0x05, 0x07, //   Usage Page (Keyboard/Keypad)
    0x19, 0x00, //   Usage Minimum (0)
    0x29, 0xFF, //   Usage Maximum (255)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xFF, 0x00, // Logical Maximum (255)
    0x95, 0x06, //   Report Count (6)
    0x75, 0x08, //   Report Size (8)
    0x81, 0x00, //   Input (Data, Array)
    //
    0xC0, // End Collection
];
