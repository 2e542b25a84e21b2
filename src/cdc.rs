//! CDC-ACM function - a virtual serial port over one interrupt
//! notification endpoint and a bulk IN/OUT pair.
//!
//! The receive side is a fixed-capacity ring. OUT packets are only
//! drained from the hardware when the ring can hold a whole packet;
//! until then the controller keeps NAKing the host, so backpressure is
//! applied at the wire and no byte is ever silently dropped.
//!
//! "Is anyone listening" is the DTR bit of SET_CONTROL_LINE_STATE:
//! writes while DTR is deasserted are discarded with a zero count
//! instead of blocking against a host that will never read.

use heapless::Deque;

use crate::bus::{EpAddr, EpDir, UsbBus};
use crate::config;
use crate::control::{ControlPipe, SetupPacket};
use crate::descriptor::{self, descriptor_type, ConfigDescriptorBuf};
use crate::endpoint::Endpoints;
use crate::error::Error;

/// CDC class request codes (CDC 1.1 section 6.2).
pub mod request {
    pub const SET_LINE_CODING: u8 = 0x20;
    pub const GET_LINE_CODING: u8 = 0x21;
    pub const SET_CONTROL_LINE_STATE: u8 = 0x22;
    pub const SEND_BREAK: u8 = 0x23;
}

/// SET_CONTROL_LINE_STATE wValue bits.
pub const LINE_STATE_DTR: u16 = 0x01;
pub const LINE_STATE_RTS: u16 = 0x02;

const CDC_COMM_CLASS: u8 = 0x02;
const CDC_ACM_SUBCLASS: u8 = 0x02;
const CDC_DATA_CLASS: u8 = 0x0A;

/// Line coding as carried by SET_LINE_CODING / GET_LINE_CODING
/// (7 bytes on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineCoding {
    /// Baud rate in bits per second.
    pub baud: u32,
    /// 0 = 1 stop bit, 1 = 1.5, 2 = 2.
    pub stop_bits: u8,
    /// 0 = none, 1 = odd, 2 = even.
    pub parity: u8,
    /// Data bits (5, 6, 7, 8 or 16).
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud: 115_200,
            stop_bits: 0,
            parity: 0,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    pub fn from_bytes(raw: &[u8; 7]) -> Self {
        Self {
            baud: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            stop_bits: raw[4],
            parity: raw[5],
            data_bits: raw[6],
        }
    }

    pub fn to_bytes(&self) -> [u8; 7] {
        let baud = self.baud.to_le_bytes();
        [
            baud[0], baud[1], baud[2], baud[3],
            self.stop_bits,
            self.parity,
            self.data_bits,
        ]
    }
}

/// Interface/endpoint assignment for the CDC function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CdcConfig {
    /// Communication (control) interface number.
    pub comm_interface: u8,
    /// Data interface number.
    pub data_interface: u8,
    /// Notification endpoint index (interrupt IN).
    pub notif_ep: u8,
    /// Data OUT endpoint index (bulk, host to device).
    pub rx_ep: u8,
    /// Data IN endpoint index (bulk, device to host).
    pub tx_ep: u8,
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self {
            comm_interface: config::CDC_COMM_INTERFACE,
            data_interface: config::CDC_DATA_INTERFACE,
            notif_ep: config::CDC_NOTIF_EP,
            rx_ep: config::CDC_RX_EP,
            tx_ep: config::CDC_TX_EP,
        }
    }
}

pub struct CdcState {
    pub(crate) comm_interface: u8,
    pub(crate) data_interface: u8,
    pub(crate) notif_ep: EpAddr,
    pub(crate) rx_ep: EpAddr,
    pub(crate) tx_ep: EpAddr,
    pub(crate) line_coding: LineCoding,
    pub(crate) line_state: u16,
    pub(crate) rx: Deque<u8, { config::CDC_RX_CAPACITY }>,
}

impl CdcState {
    pub fn new(cfg: &CdcConfig) -> Self {
        Self {
            comm_interface: cfg.comm_interface,
            data_interface: cfg.data_interface,
            notif_ep: EpAddr::new(cfg.notif_ep, EpDir::In),
            rx_ep: EpAddr::new(cfg.rx_ep, EpDir::Out),
            tx_ep: EpAddr::new(cfg.tx_ep, EpDir::In),
            line_coding: LineCoding::default(),
            line_state: 0,
            rx: Deque::new(),
        }
    }

    /// DTR asserted: the host opened the port.
    pub fn dtr(&self) -> bool {
        self.line_state & LINE_STATE_DTR != 0
    }

    pub(crate) fn handle_setup<B: UsbBus>(
        &mut self,
        pipe: &mut ControlPipe,
        io: &mut Endpoints<B>,
        setup: &SetupPacket,
    ) -> bool {
        match setup.request {
            request::SET_LINE_CODING => {
                let mut raw = [0u8; 7];
                match pipe.recv(io.bus_mut(), &mut raw) {
                    Ok(7) => {
                        self.line_coding = LineCoding::from_bytes(&raw);
                        debug!("cdc: line coding {} baud", self.line_coding.baud);
                        pipe.accept(io.bus_mut()).is_ok()
                    }
                    _ => false,
                }
            }
            request::GET_LINE_CODING => {
                pipe.send(io.bus_mut(), &self.line_coding.to_bytes()).is_ok()
            }
            request::SET_CONTROL_LINE_STATE => {
                self.line_state = setup.value;
                debug!("cdc: line state {}", self.line_state);
                pipe.accept(io.bus_mut()).is_ok()
            }
            request::SEND_BREAK => pipe.accept(io.bus_mut()).is_ok(),
            _ => false,
        }
    }

    /// Drain received OUT packets into the ring. A packet is consumed
    /// only when the ring can hold all of it; otherwise it stays in the
    /// hardware buffer and the controller NAKs the host until the
    /// application reads.
    pub(crate) fn pump<B: UsbBus>(&mut self, io: &mut Endpoints<B>) {
        loop {
            let pending = io.available(self.rx_ep);
            if pending == 0 {
                return;
            }
            let room = self.rx.capacity() - self.rx.len();
            if room < pending {
                trace!("cdc: rx ring full, leaving {} bytes on the wire", pending);
                return;
            }
            let mut packet = [0u8; config::BULK_MAX_PACKET];
            let n = io.recv(self.rx_ep, &mut packet[..pending.min(config::BULK_MAX_PACKET)]);
            if n == 0 {
                return;
            }
            for &b in &packet[..n] {
                // Room was checked above; push cannot fail.
                let _ = self.rx.push_back(b);
            }
        }
    }

    pub(crate) fn write_descriptors(&self, buf: &mut ConfigDescriptorBuf) -> Result<(), Error> {
        let notif_packet = (config::CDC_NOTIF_MAX_PACKET as u16).to_le_bytes();
        let bulk_packet = (config::BULK_MAX_PACKET as u16).to_le_bytes();

        // Interface association so composite-aware hosts bind both
        // interfaces to one port driver.
        descriptor::put(
            buf,
            &[
                8,                                      // bLength
                descriptor_type::INTERFACE_ASSOCIATION, // bDescriptorType
                self.comm_interface,                    // bFirstInterface
                2,                                      // bInterfaceCount
                CDC_COMM_CLASS,                         // bFunctionClass
                CDC_ACM_SUBCLASS,                       // bFunctionSubClass
                0,                                      // bFunctionProtocol
                0,                                      // iFunction
            ],
        )?;
        // Communication interface with the ACM functional descriptors.
        descriptor::put(
            buf,
            &[
                9, descriptor_type::INTERFACE, self.comm_interface, 0, 1,
                CDC_COMM_CLASS, CDC_ACM_SUBCLASS, 0, 0,
            ],
        )?;
        descriptor::put(
            buf,
            &[
                5, descriptor_type::CS_INTERFACE, 0x00, // Header
                0x10, 0x01,                             // bcdCDC 1.10
            ],
        )?;
        descriptor::put(
            buf,
            &[
                5, descriptor_type::CS_INTERFACE, 0x01, // Call management
                0x01,                                   // handled by device
                self.data_interface,                    // data interface
            ],
        )?;
        descriptor::put(
            buf,
            &[
                4, descriptor_type::CS_INTERFACE, 0x02, // ACM
                0x06, // line coding + serial state supported
            ],
        )?;
        descriptor::put(
            buf,
            &[
                5, descriptor_type::CS_INTERFACE, 0x06, // Union
                self.comm_interface, self.data_interface,
            ],
        )?;
        descriptor::put(
            buf,
            &[
                7, descriptor_type::ENDPOINT, self.notif_ep.raw(), 0x03,
                notif_packet[0], notif_packet[1], config::CDC_NOTIF_INTERVAL_MS,
            ],
        )?;
        // Data interface with the bulk pair.
        descriptor::put(
            buf,
            &[
                9, descriptor_type::INTERFACE, self.data_interface, 0, 2,
                CDC_DATA_CLASS, 0, 0, 0,
            ],
        )?;
        descriptor::put(
            buf,
            &[
                7, descriptor_type::ENDPOINT, self.rx_ep.raw(), 0x02,
                bulk_packet[0], bulk_packet[1], 0,
            ],
        )?;
        descriptor::put(
            buf,
            &[
                7, descriptor_type::ENDPOINT, self.tx_ep.raw(), 0x02,
                bulk_packet[0], bulk_packet[1], 0,
            ],
        )
    }

    pub(crate) fn on_reset(&mut self) {
        self.rx.clear();
        self.line_state = 0;
    }
}

/// Application handle: the byte-stream view of the CDC function.
pub struct Serial<'a, B: UsbBus> {
    pub(crate) io: &'a mut Endpoints<B>,
    pub(crate) state: &'a mut CdcState,
}

impl<B: UsbBus> Serial<'_, B> {
    /// Send bytes to the host, segmenting as needed. Blocks only while
    /// the endpoint buffer is busy. Returns the count actually queued;
    /// zero when the host has not opened the port (DTR deasserted).
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if !self.state.dtr() {
            return Ok(0);
        }
        self.io.send(self.state.tx_ep, data)
    }

    /// Terminate a transfer that ended on a packet boundary with a ZLP.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.io.flush(self.state.tx_ep)
    }

    /// Pop one received byte.
    pub fn read(&mut self) -> Option<u8> {
        self.state.rx.pop_front()
    }

    /// Look at the next received byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.state.rx.front().copied()
    }

    /// Bytes buffered in the receive ring.
    pub fn available(&self) -> usize {
        self.state.rx.len()
    }

    /// True once the host has opened the virtual COM port.
    pub fn connected(&self) -> bool {
        self.state.dtr()
    }

    pub fn line_coding(&self) -> &LineCoding {
        &self.state.line_coding
    }
}
