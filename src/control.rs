//! Control-transfer plumbing for EP0.
//!
//! A control transfer is strictly request/response: an 8-byte setup
//! packet, an optional data stage whose direction and length come from
//! `bmRequestType`/`wLength`, and a status stage. [`ControlPipe`] walks
//! that sequence for one transfer at a time; a new setup packet aborts
//! whatever was in flight and restarts the machine, which is normal
//! host behavior and must never corrupt shared buffers.
//!
//! Responses are always clipped to `min(wLength, len)` and a response
//! shorter than `wLength` that ends on a packet boundary is terminated
//! with a zero-length packet, per the USB 2.0 framing rules.

use crate::bus::{EpAddr, EpDir, UsbBus, EP0_IN, EP0_OUT};
use crate::config;
use crate::error::Error;

/// Standard bRequest codes (USB 2.0 table 9-4).
pub mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
}

/// wValue of CLEAR_FEATURE/SET_FEATURE for an endpoint halt.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
/// wValue of CLEAR_FEATURE/SET_FEATURE for device remote wakeup.
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

/// bmRequestType bits 6..5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// bmRequestType bits 4..0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

/// Parsed 8-byte setup packet. Immutable once received; the router owns
/// exactly one at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn from_bytes(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    /// Direction of the data stage (bit 7): IN means device-to-host.
    pub fn direction(&self) -> EpDir {
        if self.request_type & 0x80 != 0 {
            EpDir::In
        } else {
            EpDir::Out
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    pub fn value_low(&self) -> u8 {
        self.value as u8
    }

    pub fn value_high(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Interface number for interface-recipient requests (wIndex low byte).
    pub fn interface(&self) -> u8 {
        self.index as u8
    }

    /// Endpoint address for endpoint-recipient requests.
    pub fn endpoint(&self) -> EpAddr {
        EpAddr::from_raw(self.index as u8)
    }

    pub fn has_data_stage(&self) -> bool {
        self.length > 0
    }
}

/// Where the current control transfer stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ControlStage {
    Idle,
    Setup,
    DataIn,
    DataOut,
}

/// EP0 transfer state machine. At most one control transfer is
/// outstanding; the router calls [`begin`](ControlPipe::begin) for every
/// setup packet and finishes the transfer with exactly one of
/// `send`, `recv`+`accept`, `accept` or `reject`.
pub struct ControlPipe {
    stage: ControlStage,
    /// wLength of the transfer being serviced; the clip bound for IN data.
    length: u16,
}

impl ControlPipe {
    pub fn new() -> Self {
        Self {
            stage: ControlStage::Idle,
            length: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.stage == ControlStage::Idle
    }

    /// Accept a new setup packet. Returns true when a previous transfer
    /// was still in flight and had to be discarded (host abort).
    pub fn begin(&mut self, setup: &SetupPacket) -> bool {
        let aborted = self.stage != ControlStage::Idle;
        self.stage = ControlStage::Setup;
        self.length = setup.length;
        aborted
    }

    /// Drop any in-flight transfer (bus reset / detach).
    pub fn reset(&mut self) {
        self.stage = ControlStage::Idle;
        self.length = 0;
    }

    /// IN data stage: transmit `min(wLength, data.len())` bytes in EP0
    /// packets, ZLP-terminated when the response is short and lands on a
    /// packet boundary. The status stage (host OUT ZLP) is absorbed by
    /// the controller. Returns the byte count actually queued.
    pub fn send<B: UsbBus>(&mut self, bus: &mut B, data: &[u8]) -> Result<usize, Error> {
        self.stage = ControlStage::DataIn;
        let n = data.len().min(self.length as usize);

        for chunk in data[..n].chunks(config::EP0_MAX_PACKET) {
            wait_write_ready(bus, EP0_IN)?;
            bus.ep_write(EP0_IN, chunk);
        }
        if n < self.length as usize && n % config::EP0_MAX_PACKET == 0 {
            wait_write_ready(bus, EP0_IN)?;
            bus.ep_write(EP0_IN, &[]);
        }

        self.stage = ControlStage::Idle;
        Ok(n)
    }

    /// OUT data stage: collect up to `min(wLength, buf.len())` bytes,
    /// spinning briefly for the host's data packets. A short packet ends
    /// the stage early. The caller still owes a status stage via
    /// [`accept`](ControlPipe::accept).
    pub fn recv<B: UsbBus>(&mut self, bus: &mut B, buf: &mut [u8]) -> Result<usize, Error> {
        self.stage = ControlStage::DataOut;
        let want = (self.length as usize).min(buf.len());
        let mut got = 0;

        while got < want {
            wait_out_data(bus)?;
            let n = bus.ep_read(EP0_OUT, &mut buf[got..want]);
            got += n;
            if n < config::EP0_MAX_PACKET {
                break;
            }
        }
        Ok(got)
    }

    /// Status stage for OUT or no-data transfers: a ZLP on EP0 IN.
    pub fn accept<B: UsbBus>(&mut self, bus: &mut B) -> Result<(), Error> {
        wait_write_ready(bus, EP0_IN)?;
        bus.ep_write(EP0_IN, &[]);
        self.stage = ControlStage::Idle;
        Ok(())
    }

    /// Protocol stall: the request is not supported or could not be
    /// completed. The hardware clears the stall on the next setup packet.
    pub fn reject<B: UsbBus>(&mut self, bus: &mut B) {
        bus.ep_stall(EP0_IN);
        bus.ep_stall(EP0_OUT);
        self.stage = ControlStage::Idle;
    }
}

impl Default for ControlPipe {
    fn default() -> Self {
        Self::new()
    }
}

fn wait_write_ready<B: UsbBus>(bus: &mut B, addr: EpAddr) -> Result<(), Error> {
    let mut spins: u32 = 0;
    while !bus.ep_write_ready(addr) {
        if !bus.vbus_present() {
            return Err(Error::Disconnected);
        }
        spins += 1;
        if spins > config::SEND_SPIN_LIMIT {
            return Err(Error::Timeout);
        }
        core::hint::spin_loop();
    }
    Ok(())
}

/// Spin for the host's next EP0 OUT data packet. Bounded so a driver
/// polling for a data stage that never arrives stalls instead of
/// hanging the control path.
fn wait_out_data<B: UsbBus>(bus: &mut B) -> Result<(), Error> {
    let mut spins: u32 = 0;
    while bus.ep_read_avail(EP0_OUT) == 0 {
        if !bus.vbus_present() {
            return Err(Error::Disconnected);
        }
        spins += 1;
        if spins > config::SEND_SPIN_LIMIT {
            return Err(Error::Timeout);
        }
        core::hint::spin_loop();
    }
    Ok(())
}
