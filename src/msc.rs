//! Mass-storage function (Bulk-Only Transport plumbing).
//!
//! The stack owns the class control requests and the bulk endpoint
//! pair; what the blocks mean - SCSI command handling, flash access -
//! is the firmware's business. Firmware registers an [`MscHandler`]
//! and services raw bulk transfers through the [`MscPipe`] it is
//! handed on every OUT-data event.

use crate::bus::{EpAddr, EpDir, UsbBus};
use crate::config;
use crate::control::{ControlPipe, SetupPacket};
use crate::descriptor::{self, descriptor_type, ConfigDescriptorBuf};
use crate::endpoint::Endpoints;
use crate::error::Error;

/// MSC class request codes (BOT 1.0 section 3).
pub mod request {
    pub const BULK_ONLY_RESET: u8 = 0xFF;
    pub const GET_MAX_LUN: u8 = 0xFE;
}

const MSC_CLASS: u8 = 0x08;
const MSC_SUBCLASS_SCSI: u8 = 0x06;
const MSC_PROTOCOL_BOT: u8 = 0x50;

/// Raw byte-transfer view of the bulk pair, handed to the handler.
/// `read`/`available` face the OUT endpoint, `write`/`flush` the IN
/// endpoint.
pub trait MscPipe {
    /// Bytes waiting in the current OUT packet.
    fn available(&self) -> usize;

    /// Copy out and consume at most one OUT packet. Non-blocking.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Queue response data on the IN endpoint (blocking, segmented).
    fn write(&mut self, data: &[u8]) -> Result<usize, Error>;

    /// ZLP-terminate an exact-multiple response.
    fn flush(&mut self) -> Result<(), Error>;
}

/// Block-I/O capability the firmware provides.
pub trait MscHandler {
    /// Service one bulk-transfer opportunity: a command or data packet
    /// is waiting on the OUT side. Errors halt the bulk IN endpoint,
    /// which is the BOT "command failed, reset me" signal.
    fn data(&mut self, pipe: &mut dyn MscPipe) -> Result<(), Error>;

    /// Bulk-Only Mass Storage Reset from the host.
    fn reset(&mut self) {}

    /// Highest LUN index (0 for a single unit).
    fn max_lun(&self) -> u8 {
        0
    }
}

/// Interface/endpoint assignment for the MSC function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MscConfig {
    pub interface: u8,
    /// Bulk IN endpoint index.
    pub tx_ep: u8,
    /// Bulk OUT endpoint index.
    pub rx_ep: u8,
}

impl Default for MscConfig {
    fn default() -> Self {
        Self {
            interface: config::MSC_INTERFACE,
            tx_ep: config::MSC_TX_EP,
            rx_ep: config::MSC_RX_EP,
        }
    }
}

pub struct MscState {
    pub(crate) interface: u8,
    pub(crate) tx_ep: EpAddr,
    pub(crate) rx_ep: EpAddr,
    pub(crate) handler: &'static mut dyn MscHandler,
}

impl MscState {
    pub fn new(cfg: &MscConfig, handler: &'static mut dyn MscHandler) -> Self {
        Self {
            interface: cfg.interface,
            tx_ep: EpAddr::new(cfg.tx_ep, EpDir::In),
            rx_ep: EpAddr::new(cfg.rx_ep, EpDir::Out),
            handler,
        }
    }

    pub(crate) fn handle_setup<B: UsbBus>(
        &mut self,
        pipe: &mut ControlPipe,
        io: &mut Endpoints<B>,
        setup: &SetupPacket,
    ) -> bool {
        match setup.request {
            request::BULK_ONLY_RESET => {
                self.handler.reset();
                let _ = io.set_halted(self.tx_ep, false);
                let _ = io.set_halted(self.rx_ep, false);
                pipe.accept(io.bus_mut()).is_ok()
            }
            request::GET_MAX_LUN => {
                let lun = self.handler.max_lun();
                pipe.send(io.bus_mut(), &[lun]).is_ok()
            }
            _ => false,
        }
    }

    pub(crate) fn write_descriptors(&self, buf: &mut ConfigDescriptorBuf) -> Result<(), Error> {
        let bulk_packet = (config::BULK_MAX_PACKET as u16).to_le_bytes();
        descriptor::put(
            buf,
            &[
                9, descriptor_type::INTERFACE, self.interface, 0, 2,
                MSC_CLASS, MSC_SUBCLASS_SCSI, MSC_PROTOCOL_BOT, 0,
            ],
        )?;
        descriptor::put(
            buf,
            &[
                7, descriptor_type::ENDPOINT, self.tx_ep.raw(), 0x02,
                bulk_packet[0], bulk_packet[1], 0,
            ],
        )?;
        descriptor::put(
            buf,
            &[
                7, descriptor_type::ENDPOINT, self.rx_ep.raw(), 0x02,
                bulk_packet[0], bulk_packet[1], 0,
            ],
        )
    }

    pub(crate) fn on_reset(&mut self) {
        self.handler.reset();
    }
}

/// Concrete [`MscPipe`] over the endpoint manager.
pub(crate) struct BulkPipe<'a, B: UsbBus> {
    io: &'a mut Endpoints<B>,
    rx_ep: EpAddr,
    tx_ep: EpAddr,
}

impl<'a, B: UsbBus> BulkPipe<'a, B> {
    pub(crate) fn new(io: &'a mut Endpoints<B>, rx_ep: EpAddr, tx_ep: EpAddr) -> Self {
        Self { io, rx_ep, tx_ep }
    }
}

impl<B: UsbBus> MscPipe for BulkPipe<'_, B> {
    fn available(&self) -> usize {
        self.io.available(self.rx_ep)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.io.recv(self.rx_ep, buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.io.send(self.tx_ep, data)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.io.flush(self.tx_ep)
    }
}
