//! Function driver registry.
//!
//! The set of logical functions is closed and known at build time, so
//! dispatch is a `match` over a tagged enum rather than a vtable. The
//! registry keeps registration order: it is the priority order for
//! control-request claiming, and the order descriptors appear in the
//! configuration. Interfaces and endpoints are claimed exclusively;
//! overlapping claims are rejected when the function is added, long
//! before the host ever sees the device.

use heapless::Vec;

use crate::bus::{EpAddr, UsbBus};
use crate::cdc::CdcState;
use crate::config;
use crate::control::{ControlPipe, SetupPacket};
use crate::descriptor::ConfigDescriptorBuf;
use crate::endpoint::Endpoints;
use crate::error::Error;
use crate::hid::keyboard::{KeyboardState, KEYBOARD_REPORT_DESCRIPTOR};
use crate::hid::mouse::{MouseState, MOUSE_REPORT_DESCRIPTOR};
use crate::msc::MscState;

/// One registered logical function.
pub enum Function {
    Cdc(CdcState),
    Keyboard(KeyboardState),
    Mouse(MouseState),
    Msc(MscState),
}

impl Function {
    pub fn owns_interface(&self, interface: u8) -> bool {
        match self {
            Function::Cdc(c) => interface == c.comm_interface || interface == c.data_interface,
            Function::Keyboard(k) => interface == k.interface,
            Function::Mouse(m) => interface == m.interface,
            Function::Msc(m) => interface == m.interface,
        }
    }

    pub fn owns_endpoint(&self, ep: EpAddr) -> bool {
        self.endpoints().contains(&ep)
    }

    pub(crate) fn interfaces(&self) -> Vec<u8, 2> {
        let mut v = Vec::new();
        match self {
            Function::Cdc(c) => {
                let _ = v.push(c.comm_interface);
                let _ = v.push(c.data_interface);
            }
            Function::Keyboard(k) => {
                let _ = v.push(k.interface);
            }
            Function::Mouse(m) => {
                let _ = v.push(m.interface);
            }
            Function::Msc(m) => {
                let _ = v.push(m.interface);
            }
        }
        v
    }

    pub(crate) fn endpoints(&self) -> Vec<EpAddr, 3> {
        let mut v = Vec::new();
        match self {
            Function::Cdc(c) => {
                let _ = v.push(c.notif_ep);
                let _ = v.push(c.rx_ep);
                let _ = v.push(c.tx_ep);
            }
            Function::Keyboard(k) => {
                let _ = v.push(k.endpoint);
            }
            Function::Mouse(m) => {
                let _ = v.push(m.endpoint);
            }
            Function::Msc(m) => {
                let _ = v.push(m.tx_ep);
                let _ = v.push(m.rx_ep);
            }
        }
        v
    }

    pub(crate) fn num_interfaces(&self) -> u8 {
        match self {
            Function::Cdc(_) => 2,
            _ => 1,
        }
    }

    /// Class-specific descriptor bytes served for an interface-recipient
    /// GET_DESCRIPTOR (HID report descriptors).
    pub(crate) fn class_descriptor(&self, descriptor: u8) -> Option<&'static [u8]> {
        use crate::descriptor::descriptor_type::HID_REPORT;
        match (self, descriptor) {
            (Function::Keyboard(_), HID_REPORT) => Some(KEYBOARD_REPORT_DESCRIPTOR),
            (Function::Mouse(_), HID_REPORT) => Some(MOUSE_REPORT_DESCRIPTOR),
            _ => None,
        }
    }

    /// Offer a claimed control request to the driver. Returns whether it
    /// completed the transfer.
    pub(crate) fn handle_setup<B: UsbBus>(
        &mut self,
        pipe: &mut ControlPipe,
        io: &mut Endpoints<B>,
        setup: &SetupPacket,
    ) -> bool {
        match self {
            Function::Cdc(c) => c.handle_setup(pipe, io, setup),
            Function::Keyboard(k) => k.handle_setup(pipe, io, setup),
            Function::Mouse(m) => m.handle_setup(pipe, io, setup),
            Function::Msc(m) => m.handle_setup(pipe, io, setup),
        }
    }

    pub(crate) fn write_descriptors(&self, buf: &mut ConfigDescriptorBuf) -> Result<(), Error> {
        match self {
            Function::Cdc(c) => c.write_descriptors(buf),
            Function::Keyboard(k) => k.write_descriptors(buf),
            Function::Mouse(m) => m.write_descriptors(buf),
            Function::Msc(m) => m.write_descriptors(buf),
        }
    }

    pub(crate) fn on_reset(&mut self) {
        match self {
            Function::Cdc(c) => c.on_reset(),
            Function::Keyboard(k) => k.on_reset(),
            Function::Mouse(m) => m.on_reset(),
            Function::Msc(m) => m.on_reset(),
        }
    }
}

/// Ordered, fixed-capacity set of registered functions.
pub struct FunctionSet {
    slots: Vec<Function, { config::MAX_FUNCTIONS }>,
}

impl FunctionSet {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Register a function. Claims are checked against every function
    /// already in the set; conflicts are build-time errors, not
    /// enumeration surprises.
    pub fn add(&mut self, f: Function) -> Result<(), Error> {
        for existing in self.slots.iter() {
            for &i in f.interfaces().iter() {
                if existing.owns_interface(i) {
                    return Err(Error::InterfaceConflict(i));
                }
            }
            for &e in f.endpoints().iter() {
                if existing.owns_endpoint(e) {
                    return Err(Error::EndpointConflict(e.raw()));
                }
            }
        }
        self.slots.push(f).map_err(|_| Error::CapacityExceeded)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.slots.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn num_interfaces(&self) -> u8 {
        self.slots.iter().map(|f| f.num_interfaces()).sum()
    }

    pub fn owns_interface(&self, interface: u8) -> bool {
        self.slots.iter().any(|f| f.owns_interface(interface))
    }

    /// First function claiming the interface, in registration order.
    pub(crate) fn by_interface_mut(&mut self, interface: u8) -> Option<&mut Function> {
        self.slots.iter_mut().find(|f| f.owns_interface(interface))
    }

    /// First function claiming the endpoint, in registration order.
    pub(crate) fn by_endpoint_mut(&mut self, ep: EpAddr) -> Option<&mut Function> {
        self.slots.iter_mut().find(|f| f.owns_endpoint(ep))
    }

    pub(crate) fn cdc_mut(&mut self) -> Option<&mut CdcState> {
        self.slots.iter_mut().find_map(|f| match f {
            Function::Cdc(c) => Some(c),
            _ => None,
        })
    }

    pub(crate) fn keyboard_mut(&mut self) -> Option<&mut KeyboardState> {
        self.slots.iter_mut().find_map(|f| match f {
            Function::Keyboard(k) => Some(k),
            _ => None,
        })
    }

    pub(crate) fn mouse_mut(&mut self) -> Option<&mut MouseState> {
        self.slots.iter_mut().find_map(|f| match f {
            Function::Mouse(m) => Some(m),
            _ => None,
        })
    }
}

impl Default for FunctionSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::{CdcConfig, CdcState};
    use crate::hid::keyboard::{KeyboardConfig, KeyboardState};
    use crate::hid::mouse::{MouseConfig, MouseState};

    fn three_functions() -> FunctionSet {
        let mut set = FunctionSet::new();
        set.add(Function::Cdc(CdcState::new(&CdcConfig::default())))
            .unwrap();
        set.add(Function::Keyboard(KeyboardState::new(
            &KeyboardConfig::default(),
        )))
        .unwrap();
        set.add(Function::Mouse(MouseState::new(&MouseConfig::default())))
            .unwrap();
        set
    }

    #[test]
    fn registration_order_is_preserved() {
        let set = three_functions();
        assert_eq!(set.len(), 3);
        assert!(matches!(set.iter().next(), Some(Function::Cdc(_))));
        assert_eq!(set.num_interfaces(), 4);
    }

    #[test]
    fn duplicate_interface_claim_is_rejected() {
        let mut set = three_functions();
        // A second keyboard on the mouse's interface number.
        let clash = KeyboardConfig {
            interface: config::MOUSE_INTERFACE,
            endpoint: 6,
        };
        assert_eq!(
            set.add(Function::Keyboard(KeyboardState::new(&clash))),
            Err(Error::InterfaceConflict(config::MOUSE_INTERFACE))
        );
    }

    #[test]
    fn duplicate_endpoint_claim_is_rejected() {
        let mut set = three_functions();
        let clash = KeyboardConfig {
            interface: 6,
            endpoint: config::MOUSE_EP,
        };
        assert_eq!(
            set.add(Function::Keyboard(KeyboardState::new(&clash))),
            Err(Error::EndpointConflict(0x80 | config::MOUSE_EP))
        );
    }

    #[test]
    fn interface_lookup_honors_cdc_pair() {
        let mut set = three_functions();
        assert!(set
            .by_interface_mut(config::CDC_COMM_INTERFACE)
            .is_some_and(|f| matches!(f, Function::Cdc(_))));
        assert!(set
            .by_interface_mut(config::CDC_DATA_INTERFACE)
            .is_some_and(|f| matches!(f, Function::Cdc(_))));
        assert!(set
            .by_interface_mut(config::KEYBOARD_INTERFACE)
            .is_some_and(|f| matches!(f, Function::Keyboard(_))));
        assert!(set.by_interface_mut(9).is_none());
    }

    #[test]
    fn endpoint_lookup_finds_the_owner() {
        let mut set = three_functions();
        let cdc_rx = EpAddr::new(config::CDC_RX_EP, crate::bus::EpDir::Out);
        assert!(set
            .by_endpoint_mut(cdc_rx)
            .is_some_and(|f| matches!(f, Function::Cdc(_))));
    }
}
