//! Endpoint buffer manager.
//!
//! Owns the bus handle and the table of registered data endpoints, and
//! enforces the transfer discipline the function drivers rely on:
//!
//! - `send` blocks (bounded spin) until the hardware buffer frees,
//!   segmenting payloads larger than one packet,
//! - `recv`/`available` never block,
//! - `flush` terminates an exact-multiple transfer with a ZLP,
//! - data traffic is gated on the device being configured; EP0 is not
//!   managed here and is always allowed.
//!
//! A disconnect (VBUS loss or deconfiguration) unwinds any blocked send
//! with a short byte count instead of hanging.

use heapless::Vec;

use crate::bus::{EpAddr, EpType, UsbBus};
use crate::config;
use crate::error::Error;

struct EpEntry {
    addr: EpAddr,
    kind: EpType,
    max_packet: u16,
    halted: bool,
    /// Last send ended exactly on a packet boundary; `flush` must emit
    /// a ZLP so the host sees the end of the transfer.
    pending_full: bool,
}

enum WaitOutcome {
    Ready,
    Disconnected,
    TimedOut,
}

pub struct Endpoints<B: UsbBus> {
    bus: B,
    table: Vec<EpEntry, { config::MAX_ENDPOINTS }>,
    active: bool,
}

impl<B: UsbBus> Endpoints<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            table: Vec::new(),
            active: false,
        }
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Claim an endpoint for a function driver. Each address may be
    /// registered exactly once; the partition is static for the device
    /// lifetime.
    pub fn register(&mut self, addr: EpAddr, kind: EpType, max_packet: u16) -> Result<(), Error> {
        if self.lookup(addr).is_some() {
            return Err(Error::EndpointConflict(addr.raw()));
        }
        self.table
            .push(EpEntry {
                addr,
                kind,
                max_packet,
                halted: false,
                pending_full: false,
            })
            .map_err(|_| Error::CapacityExceeded)
    }

    /// Bring all registered endpoints up on the controller and open the
    /// data path. Called when the host selects our configuration.
    pub fn activate(&mut self) {
        for e in self.table.iter() {
            self.bus.ep_configure(e.addr, e.kind, e.max_packet);
        }
        self.active = true;
    }

    /// Close the data path (SET_CONFIGURATION 0 or detach).
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Bus reset: all transfers are void, halt conditions clear, data
    /// endpoints are down until the host reconfigures us.
    pub fn on_reset(&mut self) {
        for e in self.table.iter_mut() {
            e.halted = false;
            e.pending_full = false;
        }
        self.active = false;
    }

    /// Blocking send. Spins until each packet's buffer frees, cutting
    /// `data` into max-packet chunks. Returns the bytes queued: short if
    /// the device disconnected mid-transfer, `Err(Timeout)` if the
    /// endpoint stayed wedged past the spin limit.
    pub fn send(&mut self, addr: EpAddr, data: &[u8]) -> Result<usize, Error> {
        let idx = self
            .lookup(addr)
            .ok_or(Error::UnknownEndpoint(addr.raw()))?;
        if !self.active {
            return Err(Error::Disconnected);
        }
        if self.table[idx].halted {
            return Err(Error::NotReady);
        }

        let max = self.table[idx].max_packet as usize;
        let mut written = 0;
        for chunk in data.chunks(max) {
            match self.wait_write_ready(addr) {
                WaitOutcome::Ready => {}
                WaitOutcome::Disconnected => return Ok(written),
                WaitOutcome::TimedOut => return Err(Error::Timeout),
            }
            self.bus.ep_write(addr, chunk);
            written += chunk.len();
        }

        self.table[idx].pending_full = !data.is_empty() && data.len() % max == 0;
        Ok(written)
    }

    /// Non-blocking receive: copies out and consumes at most one packet.
    pub fn recv(&mut self, addr: EpAddr, buf: &mut [u8]) -> usize {
        if self.lookup(addr).is_none() || !self.active {
            return 0;
        }
        self.bus.ep_read(addr, buf)
    }

    /// Bytes waiting on the endpoint without consuming them.
    pub fn available(&self, addr: EpAddr) -> usize {
        self.bus.ep_read_avail(addr)
    }

    /// Emit a zero-length packet if the previous send filled its last
    /// packet completely; otherwise the short packet already marked the
    /// end of the transfer and this is a no-op.
    pub fn flush(&mut self, addr: EpAddr) -> Result<(), Error> {
        let idx = self
            .lookup(addr)
            .ok_or(Error::UnknownEndpoint(addr.raw()))?;
        if !self.table[idx].pending_full {
            return Ok(());
        }
        match self.wait_write_ready(addr) {
            WaitOutcome::Ready => {
                self.bus.ep_write(addr, &[]);
                self.table[idx].pending_full = false;
                Ok(())
            }
            WaitOutcome::Disconnected => Err(Error::Disconnected),
            WaitOutcome::TimedOut => Err(Error::Timeout),
        }
    }

    pub fn set_halted(&mut self, addr: EpAddr, halted: bool) -> Result<(), Error> {
        let idx = self
            .lookup(addr)
            .ok_or(Error::UnknownEndpoint(addr.raw()))?;
        self.table[idx].halted = halted;
        if halted {
            self.bus.ep_stall(addr);
        } else {
            self.bus.ep_clear_stall(addr);
            self.table[idx].pending_full = false;
        }
        Ok(())
    }

    pub fn is_halted(&self, addr: EpAddr) -> bool {
        self.table
            .iter()
            .any(|e| e.addr == addr && e.halted)
    }

    pub fn is_registered(&self, addr: EpAddr) -> bool {
        self.lookup(addr).is_some()
    }

    fn lookup(&self, addr: EpAddr) -> Option<usize> {
        self.table.iter().position(|e| e.addr == addr)
    }

    fn wait_write_ready(&mut self, addr: EpAddr) -> WaitOutcome {
        let mut spins: u32 = 0;
        while !self.bus.ep_write_ready(addr) {
            if !self.bus.vbus_present() || !self.active {
                return WaitOutcome::Disconnected;
            }
            spins += 1;
            if spins > config::SEND_SPIN_LIMIT {
                return WaitOutcome::TimedOut;
            }
            core::hint::spin_loop();
        }
        WaitOutcome::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::MockBus;
    use crate::bus::EpDir;
    use core::cell::Cell;

    fn active_endpoints() -> Endpoints<MockBus> {
        let mut io = Endpoints::new(MockBus::new());
        io.register(EpAddr::new(3, EpDir::In), EpType::Bulk, 64).unwrap();
        io.register(EpAddr::new(2, EpDir::Out), EpType::Bulk, 64).unwrap();
        io.activate();
        io
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut io = Endpoints::new(MockBus::new());
        let ep = EpAddr::new(4, EpDir::In);
        io.register(ep, EpType::Interrupt, 8).unwrap();
        assert_eq!(
            io.register(ep, EpType::Interrupt, 8),
            Err(Error::EndpointConflict(0x84))
        );
    }

    #[test]
    fn send_segments_into_max_packet_chunks() {
        let mut io = active_endpoints();
        let ep = EpAddr::new(3, EpDir::In);
        let data = [0xAAu8; 150];
        assert_eq!(io.send(ep, &data), Ok(150));

        let packets = io.bus().packets_for(ep);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].len(), 64);
        assert_eq!(packets[1].len(), 64);
        assert_eq!(packets[2].len(), 22);
    }

    #[test]
    fn send_requires_configuration() {
        let mut io = Endpoints::new(MockBus::new());
        let ep = EpAddr::new(3, EpDir::In);
        io.register(ep, EpType::Bulk, 64).unwrap();
        assert_eq!(io.send(ep, b"hi"), Err(Error::Disconnected));
    }

    #[test]
    fn send_to_unregistered_endpoint_is_an_error() {
        let mut io = active_endpoints();
        let ep = EpAddr::new(9, EpDir::In);
        assert_eq!(io.send(ep, b"hi"), Err(Error::UnknownEndpoint(0x89)));
    }

    #[test]
    fn flush_emits_zlp_only_after_full_packet() {
        let mut io = active_endpoints();
        let ep = EpAddr::new(3, EpDir::In);

        io.send(ep, &[0u8; 64]).unwrap();
        io.flush(ep).unwrap();
        let packets = io.bus().packets_for(ep);
        assert_eq!(packets.len(), 2);
        assert!(packets[1].is_empty());

        // A short packet already terminated the transfer.
        io.send(ep, &[0u8; 10]).unwrap();
        io.flush(ep).unwrap();
        assert_eq!(io.bus().packets_for(ep).len(), 3);
    }

    #[test]
    fn vbus_loss_unblocks_spinning_send() {
        let mut io = active_endpoints();
        let ep = EpAddr::new(3, EpDir::In);
        io.bus_mut().wedged.push(ep.raw());
        io.bus_mut().vbus_drop_after = Some(Cell::new(50));

        // First packet never becomes ready; send unwinds with a short
        // count once power drops instead of hanging.
        assert_eq!(io.send(ep, &[0u8; 64]), Ok(0));
    }

    #[test]
    fn halted_endpoint_refuses_sends_until_cleared() {
        let mut io = active_endpoints();
        let ep = EpAddr::new(3, EpDir::In);
        io.set_halted(ep, true).unwrap();
        assert!(io.bus().is_stalled(ep));
        assert_eq!(io.send(ep, b"x"), Err(Error::NotReady));

        io.set_halted(ep, false).unwrap();
        assert!(!io.bus().is_stalled(ep));
        assert_eq!(io.send(ep, b"x"), Ok(1));
    }

    #[test]
    fn reset_clears_halt_and_deactivates() {
        let mut io = active_endpoints();
        let ep = EpAddr::new(3, EpDir::In);
        io.set_halted(ep, true).unwrap();
        io.on_reset();
        assert!(!io.is_halted(ep));
        assert!(!io.is_active());
    }
}
