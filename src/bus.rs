//! Hardware capability boundary.
//!
//! The stack never touches controller registers. Firmware implements
//! [`UsbBus`] for its target (FIFO writes, pullup control, interrupt
//! flag draining) and hands it to
//! [`UsbComposite`](crate::device::UsbComposite). Everything above this
//! trait is portable and host-testable.

/// Transfer direction, seen from the host: IN moves data to the host,
/// OUT moves data to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EpDir {
    Out,
    In,
}

/// Endpoint transfer type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EpType {
    Control,
    Bulk,
    Interrupt,
}

/// Endpoint address in USB wire encoding: low nibble is the index,
/// bit 7 set means IN.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EpAddr(u8);

impl EpAddr {
    pub const fn new(index: u8, dir: EpDir) -> Self {
        match dir {
            EpDir::Out => EpAddr(index & 0x0F),
            EpDir::In => EpAddr((index & 0x0F) | 0x80),
        }
    }

    pub const fn from_raw(raw: u8) -> Self {
        EpAddr(raw & 0x8F)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> u8 {
        self.0 & 0x0F
    }

    pub const fn is_in(self) -> bool {
        self.0 & 0x80 != 0
    }

    pub const fn direction(self) -> EpDir {
        if self.is_in() {
            EpDir::In
        } else {
            EpDir::Out
        }
    }
}

/// The control endpoint, always present, both directions.
pub const EP0_OUT: EpAddr = EpAddr::new(0, EpDir::Out);
pub const EP0_IN: EpAddr = EpAddr::new(0, EpDir::In);

/// Events the controller reports to the stack. The interrupt handler
/// queues these; [`UsbComposite::poll`](crate::device::UsbComposite::poll)
/// drains them on the single execution thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    /// Host-driven bus reset; all endpoint and address state is void.
    Reset,
    /// An 8-byte setup packet arrived on EP0.
    Setup([u8; 8]),
    /// An OUT endpoint has received a data packet.
    OutData(EpAddr),
    /// Host suspended the bus.
    Suspend,
    /// Host resumed the bus.
    Resume,
}

/// Controller access the stack requires from the target.
///
/// Packet granularity: `ep_write` queues exactly one packet (already cut
/// to the endpoint's maximum packet size by the caller); `ep_read` copies
/// out and consumes at most one received packet. A packet left unread
/// keeps the hardware NAKing further OUT traffic on that endpoint, which
/// is how the upper layers apply backpressure.
pub trait UsbBus {
    /// Present the device to the host (enable the DP pullup).
    fn attach(&mut self);

    /// Drop off the bus.
    fn detach(&mut self);

    /// Apply the address assigned by SET_ADDRESS. Callers must finish
    /// the status stage at the old address first.
    fn set_address(&mut self, addr: u8);

    /// Prepare a data endpoint's hardware buffer. Called once per
    /// registered endpoint when the host selects a configuration.
    fn ep_configure(&mut self, addr: EpAddr, kind: EpType, max_packet: u16);

    /// Drain the next pending event, if any.
    fn poll(&mut self) -> Option<BusEvent>;

    /// True while bus power is present. A blocking send watches this to
    /// unwind when the cable is pulled.
    fn vbus_present(&self) -> bool;

    /// True when the endpoint can accept another packet from `ep_write`.
    fn ep_write_ready(&self, addr: EpAddr) -> bool;

    /// Queue one packet for transmission. Only valid after
    /// `ep_write_ready` returned true; an empty slice queues a ZLP.
    fn ep_write(&mut self, addr: EpAddr, data: &[u8]);

    /// Bytes waiting in the endpoint's current received packet.
    fn ep_read_avail(&self, addr: EpAddr) -> usize;

    /// Copy out and consume the current received packet, returning the
    /// number of bytes copied (at most `buf.len()`).
    fn ep_read(&mut self, addr: EpAddr, buf: &mut [u8]) -> usize;

    /// Signal a protocol stall on the endpoint.
    fn ep_stall(&mut self, addr: EpAddr);

    /// Clear a halt/stall condition (CLEAR_FEATURE ENDPOINT_HALT).
    fn ep_clear_stall(&mut self, addr: EpAddr);
}
