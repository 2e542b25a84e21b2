//! The composite device context.
//!
//! [`UsbComposite`] ties the pieces together: the endpoint manager, the
//! EP0 pipe, and the ordered function registry. Firmware builds it once
//! at startup, registers its functions while detached, then calls
//! [`poll`](UsbComposite::poll) from its main loop (or the USB
//! interrupt's bottom half) to drain controller events.
//!
//! Routing policy for setup packets, in order:
//! 1. standard device-level requests are handled here,
//! 2. interface-recipient descriptor reads go to the owning function,
//! 3. anything else is offered to the function claiming the interface
//!    or endpoint, in registration order,
//! 4. unclaimed or half-finished requests stall EP0.
//!
//! No outcome is fatal: every path ends with the control machine back
//! at idle, ready for the next setup packet.

use crate::bus::{BusEvent, EpAddr, EpType, UsbBus};
use crate::cdc::{CdcConfig, CdcState, Serial};
use crate::config;
use crate::control::{
    request as std_request, ControlPipe, Recipient, RequestKind, SetupPacket,
    FEATURE_DEVICE_REMOTE_WAKEUP, FEATURE_ENDPOINT_HALT,
};
use crate::descriptor::{self, descriptor_type};
use crate::endpoint::Endpoints;
use crate::error::Error;
use crate::function::{Function, FunctionSet};
use crate::hid::keyboard::{Keyboard, KeyboardConfig, KeyboardState};
use crate::hid::mouse::{Mouse, MouseConfig, MouseState};
use crate::msc::{BulkPipe, MscConfig, MscHandler, MscState};

/// Where the device stands with the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    /// Not presented on the bus.
    Detached,
    /// On the bus, enumerating or addressed, no configuration selected.
    /// Only EP0 traffic is possible.
    Attached,
    /// Host selected our configuration; data endpoints are live.
    Configured,
}

pub struct UsbComposite<B: UsbBus> {
    io: Endpoints<B>,
    control: ControlPipe,
    functions: FunctionSet,
    state: DeviceState,
    suspended: bool,
}

impl<B: UsbBus> UsbComposite<B> {
    pub fn new(bus: B) -> Self {
        Self {
            io: Endpoints::new(bus),
            control: ControlPipe::new(),
            functions: FunctionSet::new(),
            state: DeviceState::Detached,
            suspended: false,
        }
    }

    // Registration - only while detached; the set is fixed for the
    // device lifetime after that.

    pub fn add_cdc(&mut self, cfg: CdcConfig) -> Result<(), Error> {
        self.ensure_detached()?;
        let state = CdcState::new(&cfg);
        let (notif, rx, tx) = (state.notif_ep, state.rx_ep, state.tx_ep);
        self.functions.add(Function::Cdc(state))?;
        self.io.register(
            notif,
            EpType::Interrupt,
            config::CDC_NOTIF_MAX_PACKET as u16,
        )?;
        self.io.register(rx, EpType::Bulk, config::BULK_MAX_PACKET as u16)?;
        self.io.register(tx, EpType::Bulk, config::BULK_MAX_PACKET as u16)?;
        Ok(())
    }

    pub fn add_keyboard(&mut self, cfg: KeyboardConfig) -> Result<(), Error> {
        self.ensure_detached()?;
        let state = KeyboardState::new(&cfg);
        let ep = state.endpoint;
        self.functions.add(Function::Keyboard(state))?;
        self.io
            .register(ep, EpType::Interrupt, config::INTERRUPT_MAX_PACKET as u16)
    }

    pub fn add_mouse(&mut self, cfg: MouseConfig) -> Result<(), Error> {
        self.ensure_detached()?;
        let state = MouseState::new(&cfg);
        let ep = state.endpoint;
        self.functions.add(Function::Mouse(state))?;
        self.io
            .register(ep, EpType::Interrupt, config::INTERRUPT_MAX_PACKET as u16)
    }

    pub fn add_msc(
        &mut self,
        cfg: MscConfig,
        handler: &'static mut dyn MscHandler,
    ) -> Result<(), Error> {
        self.ensure_detached()?;
        let state = MscState::new(&cfg, handler);
        let (tx, rx) = (state.tx_ep, state.rx_ep);
        self.functions.add(Function::Msc(state))?;
        self.io.register(tx, EpType::Bulk, config::BULK_MAX_PACKET as u16)?;
        self.io.register(rx, EpType::Bulk, config::BULK_MAX_PACKET as u16)?;
        Ok(())
    }

    fn ensure_detached(&self) -> Result<(), Error> {
        if self.state == DeviceState::Detached {
            Ok(())
        } else {
            Err(Error::AlreadyAttached)
        }
    }

    // Lifecycle

    /// Present the device to the host.
    pub fn attach(&mut self) {
        self.io.bus_mut().attach();
        self.state = DeviceState::Attached;
        debug!("usb: attached");
    }

    /// Drop off the bus. Any blocked send unwinds with a short count.
    pub fn detach(&mut self) {
        self.io.deactivate();
        self.io.bus_mut().detach();
        self.control.reset();
        for f in self.functions.iter_mut() {
            f.on_reset();
        }
        self.state = DeviceState::Detached;
        debug!("usb: detached");
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn configured(&self) -> bool {
        self.state == DeviceState::Configured
    }

    pub fn suspended(&self) -> bool {
        self.suspended
    }

    pub fn functions(&self) -> &FunctionSet {
        &self.functions
    }

    pub fn bus(&self) -> &B {
        self.io.bus()
    }

    pub fn bus_mut(&mut self) -> &mut B {
        self.io.bus_mut()
    }

    // Application handles

    /// The virtual serial port, if a CDC function is registered.
    pub fn serial(&mut self) -> Option<Serial<'_, B>> {
        let Self { io, functions, .. } = self;
        functions.cdc_mut().map(move |state| Serial { io, state })
    }

    /// The keyboard, if registered.
    pub fn keyboard(&mut self) -> Option<Keyboard<'_, B>> {
        let Self { io, functions, .. } = self;
        functions
            .keyboard_mut()
            .map(move |state| Keyboard { io, state })
    }

    /// The mouse, if registered.
    pub fn mouse(&mut self) -> Option<Mouse<'_, B>> {
        let Self { io, functions, .. } = self;
        functions.mouse_mut().map(move |state| Mouse { io, state })
    }

    // Event handling

    /// Drain and service every pending controller event. Call from the
    /// main loop or the USB interrupt's bottom half; control requests
    /// are processed one at a time, never concurrently.
    pub fn poll(&mut self) {
        loop {
            let Some(event) = self.io.bus_mut().poll() else {
                return;
            };
            match event {
                BusEvent::Reset => self.handle_reset(),
                BusEvent::Setup(raw) => self.handle_setup(raw),
                BusEvent::OutData(ep) => self.handle_out(ep),
                BusEvent::Suspend => {
                    debug!("usb: suspended");
                    self.suspended = true;
                }
                BusEvent::Resume => {
                    debug!("usb: resumed");
                    self.suspended = false;
                }
            }
        }
    }

    fn handle_reset(&mut self) {
        debug!("usb: bus reset");
        self.control.reset();
        self.io.on_reset();
        for f in self.functions.iter_mut() {
            f.on_reset();
        }
        self.io.bus_mut().set_address(0);
        if self.state != DeviceState::Detached {
            self.state = DeviceState::Attached;
        }
        self.suspended = false;
    }

    fn handle_setup(&mut self, raw: [u8; 8]) {
        let setup = SetupPacket::from_bytes(&raw);
        if self.control.begin(&setup) {
            warn!("usb: setup aborted an in-flight control transfer");
        }
        trace!(
            "usb: setup req={} value={} index={} len={}",
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );

        let handled = match setup.kind() {
            RequestKind::Standard => self.handle_standard(&setup),
            RequestKind::Class | RequestKind::Vendor => self.dispatch_to_function(&setup),
            RequestKind::Reserved => false,
        };

        // Unclaimed, or claimed but left unfinished: stall and return
        // the machine to idle.
        if !handled || !self.control.is_idle() {
            self.control.reject(self.io.bus_mut());
        }
    }

    fn handle_standard(&mut self, setup: &SetupPacket) -> bool {
        match setup.request {
            std_request::GET_STATUS => self.get_status(setup),
            std_request::CLEAR_FEATURE => self.handle_feature(setup, false),
            std_request::SET_FEATURE => self.handle_feature(setup, true),
            std_request::SET_ADDRESS => {
                if setup.recipient() != Recipient::Device {
                    return false;
                }
                let addr = setup.value_low() & 0x7F;
                if self.control.accept(self.io.bus_mut()).is_err() {
                    return false;
                }
                // The status stage ran at the old address; switch now.
                self.io.bus_mut().set_address(addr);
                debug!("usb: address {}", addr);
                true
            }
            std_request::GET_DESCRIPTOR => self.get_descriptor(setup),
            std_request::GET_CONFIGURATION => {
                let value = if self.state == DeviceState::Configured {
                    config::CONFIG_VALUE
                } else {
                    0
                };
                self.control.send(self.io.bus_mut(), &[value]).is_ok()
            }
            std_request::SET_CONFIGURATION => {
                if setup.recipient() != Recipient::Device {
                    return false;
                }
                match setup.value_low() {
                    0 => {
                        self.io.deactivate();
                        if self.state == DeviceState::Configured {
                            self.state = DeviceState::Attached;
                        }
                        self.control.accept(self.io.bus_mut()).is_ok()
                    }
                    v if v == config::CONFIG_VALUE => {
                        self.io.activate();
                        self.state = DeviceState::Configured;
                        debug!("usb: configured");
                        self.control.accept(self.io.bus_mut()).is_ok()
                    }
                    _ => false,
                }
            }
            std_request::GET_INTERFACE => {
                if self.functions.owns_interface(setup.interface()) {
                    // Alternate settings are not used.
                    self.control.send(self.io.bus_mut(), &[0]).is_ok()
                } else {
                    false
                }
            }
            std_request::SET_INTERFACE => {
                self.functions.owns_interface(setup.interface())
                    && setup.value == 0
                    && self.control.accept(self.io.bus_mut()).is_ok()
            }
            _ => false,
        }
    }

    fn get_status(&mut self, setup: &SetupPacket) -> bool {
        let status: [u8; 2] = match setup.recipient() {
            Recipient::Device => [config::USB_SELF_POWERED as u8, 0],
            Recipient::Interface => {
                if !self.functions.owns_interface(setup.interface()) {
                    return false;
                }
                [0, 0]
            }
            Recipient::Endpoint => {
                let ep = setup.endpoint();
                if ep.index() != 0 && !self.io.is_registered(ep) {
                    return false;
                }
                [self.io.is_halted(ep) as u8, 0]
            }
            _ => return false,
        };
        self.control.send(self.io.bus_mut(), &status).is_ok()
    }

    fn handle_feature(&mut self, setup: &SetupPacket, set: bool) -> bool {
        match (setup.recipient(), setup.value) {
            (Recipient::Endpoint, FEATURE_ENDPOINT_HALT) => {
                let ep = setup.endpoint();
                if ep.index() == 0 || self.io.set_halted(ep, set).is_err() {
                    return false;
                }
                self.control.accept(self.io.bus_mut()).is_ok()
            }
            (Recipient::Device, FEATURE_DEVICE_REMOTE_WAKEUP) => {
                // Accepted but not acted on; we never wake the host.
                self.control.accept(self.io.bus_mut()).is_ok()
            }
            _ => false,
        }
    }

    fn get_descriptor(&mut self, setup: &SetupPacket) -> bool {
        match setup.value_high() {
            descriptor_type::DEVICE => {
                let d = descriptor::device_descriptor();
                self.control.send(self.io.bus_mut(), &d).is_ok()
            }
            descriptor_type::CONFIGURATION => {
                match descriptor::configuration_descriptor(&self.functions) {
                    Ok(buf) => self.control.send(self.io.bus_mut(), &buf).is_ok(),
                    Err(_) => false,
                }
            }
            descriptor_type::STRING => match descriptor::string_descriptor(setup.value_low()) {
                Some(s) => self.control.send(self.io.bus_mut(), &s).is_ok(),
                None => false,
            },
            // Per-interface descriptors (HID report tables) belong to
            // the owning function.
            other if setup.recipient() == Recipient::Interface => {
                let Self { io, control, functions, .. } = self;
                match functions
                    .by_interface_mut(setup.interface())
                    .and_then(|f| f.class_descriptor(other))
                {
                    Some(bytes) => control.send(io.bus_mut(), bytes).is_ok(),
                    None => false,
                }
            }
            // Includes DEVICE_QUALIFIER: we are full speed only.
            _ => false,
        }
    }

    /// Offer a class/vendor request to the claiming function,
    /// registration order deciding ties.
    fn dispatch_to_function(&mut self, setup: &SetupPacket) -> bool {
        let Self { io, control, functions, .. } = self;
        let owner = match setup.recipient() {
            Recipient::Interface => functions.by_interface_mut(setup.interface()),
            Recipient::Endpoint => functions.by_endpoint_mut(setup.endpoint()),
            _ => None,
        };
        match owner {
            Some(f) => f.handle_setup(control, io, setup),
            None => false,
        }
    }

    /// Bulk/interrupt OUT activity outside any control transfer.
    fn handle_out(&mut self, ep: EpAddr) {
        let Self { io, functions, .. } = self;
        let Some(owner) = functions.by_endpoint_mut(ep) else {
            trace!("usb: out data on unclaimed endpoint {}", ep.raw());
            return;
        };
        match owner {
            Function::Cdc(c) => c.pump(io),
            Function::Msc(m) => {
                let result = {
                    let mut pipe = BulkPipe::new(&mut *io, m.rx_ep, m.tx_ep);
                    m.handler.data(&mut pipe)
                };
                if result.is_err() {
                    warn!("msc: handler failed, halting bulk IN");
                    let _ = io.set_halted(m.tx_ep, true);
                }
            }
            // HID functions are IN-only.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::MockBus;
    use crate::bus::{EpDir, EP0_IN, EP0_OUT};
    use crate::cdc::{request as cdc_request, LINE_STATE_DTR, LINE_STATE_RTS};
    use crate::hid::request as hid_request;
    use crate::msc::{request as msc_request, MscPipe};

    fn setup_bytes(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
        let v = value.to_le_bytes();
        let i = index.to_le_bytes();
        let l = length.to_le_bytes();
        [request_type, request, v[0], v[1], i[0], i[1], l[0], l[1]]
    }

    /// CDC + keyboard + mouse on the default map, attached.
    fn device() -> UsbComposite<MockBus> {
        let mut dev = UsbComposite::new(MockBus::new());
        dev.add_cdc(CdcConfig::default()).unwrap();
        dev.add_keyboard(KeyboardConfig::default()).unwrap();
        dev.add_mouse(MouseConfig::default()).unwrap();
        dev.attach();
        dev
    }

    fn configure(dev: &mut UsbComposite<MockBus>) {
        let raw = setup_bytes(0x00, std_request::SET_CONFIGURATION, 1, 0, 0);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert!(dev.configured());
        // Discard the enumeration traffic so tests see only their own.
        dev.bus_mut().written.clear();
    }

    #[test]
    fn config_descriptor_clipped_to_wlength() {
        let mut dev = device();
        let expected = descriptor::configuration_descriptor(dev.functions()).unwrap();

        let raw = setup_bytes(0x80, std_request::GET_DESCRIPTOR, 0x0200, 0, 9);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();

        let sent = dev.bus().bytes_for(EP0_IN);
        assert_eq!(sent.len(), 9);
        assert_eq!(&sent[..], &expected[..9]);
        assert!(!dev.bus().is_stalled(EP0_IN));
    }

    #[test]
    fn config_descriptor_totals_are_consistent() {
        let mut dev = device();
        let raw = setup_bytes(0x80, std_request::GET_DESCRIPTOR, 0x0200, 0, 0xFFFF);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();

        let sent = dev.bus().bytes_for(EP0_IN);
        assert_eq!(
            u16::from_le_bytes([sent[2], sent[3]]) as usize,
            sent.len()
        );
        // CDC claims two interfaces, keyboard and mouse one each.
        assert_eq!(sent[4], 4);
        assert_eq!(sent[5], config::CONFIG_VALUE);
    }

    #[test]
    fn device_descriptor_round_trip() {
        let mut dev = device();
        let raw = setup_bytes(0x80, std_request::GET_DESCRIPTOR, 0x0100, 0, 18);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert_eq!(
            dev.bus().bytes_for(EP0_IN),
            descriptor::device_descriptor().to_vec()
        );
    }

    #[test]
    fn hid_report_descriptor_served_per_interface() {
        let mut dev = device();
        let raw = setup_bytes(
            0x81,
            std_request::GET_DESCRIPTOR,
            0x2200,
            config::KEYBOARD_INTERFACE as u16,
            0x100,
        );
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert_eq!(
            dev.bus().bytes_for(EP0_IN),
            crate::hid::keyboard::KEYBOARD_REPORT_DESCRIPTOR.to_vec()
        );
    }

    #[test]
    fn set_address_applies_after_status_stage() {
        let mut dev = device();
        let raw = setup_bytes(0x00, std_request::SET_ADDRESS, 5, 0, 0);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert_eq!(dev.bus().address, 5);
        // Status ZLP went out.
        let packets = dev.bus().packets_for(EP0_IN);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_empty());
    }

    #[test]
    fn set_configuration_brings_data_endpoints_up() {
        let mut dev = device();
        assert!(!dev.configured());
        configure(&mut dev);
        // 3 CDC endpoints + keyboard + mouse.
        assert_eq!(dev.bus().configured_eps.len(), 5);

        // Configuration 0 returns to the addressed state.
        let raw = setup_bytes(0x00, std_request::SET_CONFIGURATION, 0, 0, 0);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert_eq!(dev.state(), DeviceState::Attached);
    }

    #[test]
    fn unclaimed_request_stalls_ep0() {
        let mut dev = device();
        // Vendor request nobody owns.
        let raw = setup_bytes(0xC0, 0x42, 0, 0, 4);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert!(dev.bus().is_stalled(EP0_IN));

        // The stall is not sticky: the next request is serviced.
        let raw = setup_bytes(0x80, std_request::GET_STATUS, 0, 0, 2);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert_eq!(dev.bus().bytes_for(EP0_IN), vec![0, 0]);
    }

    #[test]
    fn endpoint_halt_feature_cycle() {
        let mut dev = device();
        configure(&mut dev);
        let tx = 0x80 | config::CDC_TX_EP;

        let raw = setup_bytes(0x02, std_request::SET_FEATURE, 0, tx as u16, 0);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();

        let raw = setup_bytes(0x82, std_request::GET_STATUS, 0, tx as u16, 2);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        // Status ZLP for SET_FEATURE, then the halted status word.
        assert_eq!(dev.bus().bytes_for(EP0_IN), vec![1, 0]);

        dev.bus_mut().written.clear();
        let raw = setup_bytes(0x02, std_request::CLEAR_FEATURE, 0, tx as u16, 0);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        let raw2 = setup_bytes(0x82, std_request::GET_STATUS, 0, tx as u16, 2);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw2));
        dev.poll();
        assert_eq!(dev.bus().bytes_for(EP0_IN), vec![0, 0]);
    }

    #[test]
    fn keyboard_press_and_release_all_send_two_reports() {
        let mut dev = device();
        configure(&mut dev);
        let kb_ep = EpAddr::new(config::KEYBOARD_EP, EpDir::In);

        {
            let mut kb = dev.keyboard().unwrap();
            assert_eq!(kb.press(0x04), Ok(true));
            // Idempotent re-press: no new report.
            assert_eq!(kb.press(0x04), Ok(false));
            kb.release_all().unwrap();
        }

        let packets = dev.bus().packets_for(kb_ep);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], vec![0, 0, 0x04, 0, 0, 0, 0, 0]);
        assert_eq!(packets[1], vec![0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn keyboard_release_without_press_sends_nothing() {
        let mut dev = device();
        configure(&mut dev);
        let kb_ep = EpAddr::new(config::KEYBOARD_EP, EpDir::In);
        let mut kb = dev.keyboard().unwrap();
        assert_eq!(kb.release(0x04), Ok(false));
        assert!(dev.bus().packets_for(kb_ep).is_empty());
    }

    #[test]
    fn keyboard_write_types_press_then_release() {
        let mut dev = device();
        configure(&mut dev);
        let kb_ep = EpAddr::new(config::KEYBOARD_EP, EpDir::In);

        assert_eq!(dev.keyboard().unwrap().write(b'A'), Ok(true));

        let packets = dev.bus().packets_for(kb_ep);
        assert_eq!(packets.len(), 2);
        // Shift + 'a' in one report, then everything released.
        assert_eq!(packets[0], vec![0x02, 0, 0x04, 0, 0, 0, 0, 0]);
        assert_eq!(packets[1], vec![0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn keyboard_led_state_via_set_report() {
        let mut dev = device();
        configure(&mut dev);
        dev.bus_mut().host_out(EP0_OUT, &[0x02]); // caps lock on
        let raw = setup_bytes(
            0x21,
            hid_request::SET_REPORT,
            0x0200,
            config::KEYBOARD_INTERFACE as u16,
            1,
        );
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();

        let kb = dev.keyboard().unwrap();
        assert!(kb.caps_lock_on());
        assert!(!kb.num_lock_on());
        assert_eq!(kb.led_status(), 0x02);
    }

    #[test]
    fn mouse_moves_are_one_shot_reports() {
        let mut dev = device();
        configure(&mut dev);
        let mouse_ep = EpAddr::new(config::MOUSE_EP, EpDir::In);

        {
            let mut mouse = dev.mouse().unwrap();
            mouse.move_by(1, 0, 0).unwrap();
            mouse.move_by(0, 1, 0).unwrap();
        }

        // Two independent reports, deltas never accumulated.
        let packets = dev.bus().packets_for(mouse_ep);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], vec![0, 1, 0, 0]);
        assert_eq!(packets[1], vec![0, 0, 1, 0]);
    }

    #[test]
    fn mouse_click_is_press_then_release() {
        let mut dev = device();
        configure(&mut dev);
        let mouse_ep = EpAddr::new(config::MOUSE_EP, EpDir::In);

        {
            let mut mouse = dev.mouse().unwrap();
            mouse.click(crate::hid::mouse::MOUSE_LEFT).unwrap();
            assert!(!mouse.is_pressed(crate::hid::mouse::MOUSE_LEFT));
        }

        let packets = dev.bus().packets_for(mouse_ep);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], vec![1, 0, 0, 0]);
        assert_eq!(packets[1], vec![0, 0, 0, 0]);
    }

    #[test]
    fn hid_reports_require_configuration() {
        let mut dev = device();
        // Attached but not configured: data endpoints are down.
        let mut kb = dev.keyboard().unwrap();
        assert_eq!(kb.press(0x04), Err(Error::Disconnected));
    }

    #[test]
    fn cdc_line_coding_round_trip() {
        let mut dev = device();
        configure(&mut dev);

        // Host sets 9600 8N1.
        dev.bus_mut()
            .host_out(EP0_OUT, &[0x80, 0x25, 0x00, 0x00, 0, 0, 8]);
        let raw = setup_bytes(
            0x21,
            cdc_request::SET_LINE_CODING,
            0,
            config::CDC_COMM_INTERFACE as u16,
            7,
        );
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert_eq!(dev.serial().unwrap().line_coding().baud, 9600);

        // And reads it back.
        dev.bus_mut().written.clear();
        let raw = setup_bytes(
            0xA1,
            cdc_request::GET_LINE_CODING,
            0,
            config::CDC_COMM_INTERFACE as u16,
            7,
        );
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert_eq!(
            dev.bus().bytes_for(EP0_IN),
            vec![0x80, 0x25, 0x00, 0x00, 0, 0, 8]
        );
    }

    fn assert_dtr(dev: &mut UsbComposite<MockBus>, asserted: bool) {
        let value = if asserted {
            LINE_STATE_DTR | LINE_STATE_RTS
        } else {
            0
        };
        let raw = setup_bytes(
            0x21,
            cdc_request::SET_CONTROL_LINE_STATE,
            value,
            config::CDC_COMM_INTERFACE as u16,
            0,
        );
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
    }

    #[test]
    fn serial_write_waits_for_dtr() {
        let mut dev = device();
        configure(&mut dev);
        let tx_ep = EpAddr::new(config::CDC_TX_EP, EpDir::In);

        // Port not open: bytes are dropped with a zero count.
        assert_eq!(dev.serial().unwrap().write(b"hello"), Ok(0));
        assert!(dev.bus().packets_for(tx_ep).is_empty());

        assert_dtr(&mut dev, true);
        assert!(dev.serial().unwrap().connected());
        assert_eq!(dev.serial().unwrap().write(b"hello"), Ok(5));
        assert_eq!(dev.bus().bytes_for(tx_ep), b"hello".to_vec());
    }

    #[test]
    fn serial_write_segments_and_flushes() {
        let mut dev = device();
        configure(&mut dev);
        assert_dtr(&mut dev, true);
        dev.bus_mut().written.clear();
        let tx_ep = EpAddr::new(config::CDC_TX_EP, EpDir::In);

        let data = [0x55u8; 128];
        let mut serial = dev.serial().unwrap();
        assert_eq!(serial.write(&data), Ok(128));
        serial.flush().unwrap();

        let packets = dev.bus().packets_for(tx_ep);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].len(), 64);
        assert_eq!(packets[1].len(), 64);
        assert!(packets[2].is_empty()); // terminating ZLP
    }

    #[test]
    fn cdc_rx_ring_applies_backpressure() {
        let mut dev = device();
        configure(&mut dev);
        let rx_ep = EpAddr::new(config::CDC_RX_EP, EpDir::Out);

        let first: Vec<u8> = (0u8..64).collect();
        let second = [0xEEu8; 64];
        dev.bus_mut().host_out(rx_ep, &first);
        dev.bus_mut().events.push_back(BusEvent::OutData(rx_ep));
        dev.poll();

        // Ring is exactly full; the second packet must stay on the wire.
        dev.bus_mut().host_out(rx_ep, &second);
        dev.bus_mut().events.push_back(BusEvent::OutData(rx_ep));
        dev.poll();
        assert_eq!(dev.serial().unwrap().available(), 64);
        assert_eq!(dev.bus().ep_read_avail(rx_ep), 64);

        // Drain the ring, then service the deferred packet: every byte
        // of both packets arrives, nothing was overwritten.
        let mut received = Vec::new();
        {
            let mut serial = dev.serial().unwrap();
            assert_eq!(serial.peek(), Some(0));
            while let Some(b) = serial.read() {
                received.push(b);
            }
        }
        dev.bus_mut().events.push_back(BusEvent::OutData(rx_ep));
        dev.poll();
        {
            let mut serial = dev.serial().unwrap();
            while let Some(b) = serial.read() {
                received.push(b);
            }
        }
        assert_eq!(received.len(), 128);
        assert_eq!(&received[..64], &first[..]);
        assert!(received[64..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn claimed_but_unfinished_request_degrades_to_stall() {
        let mut dev = device();
        configure(&mut dev);
        // SET_LINE_CODING with no data stage ever arriving: the CDC
        // driver times out polling for it and the router stalls.
        let raw = setup_bytes(
            0x21,
            cdc_request::SET_LINE_CODING,
            0,
            config::CDC_COMM_INTERFACE as u16,
            7,
        );
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert!(dev.bus().is_stalled(EP0_IN));

        // The machine is back at idle and serves the next request.
        let raw = setup_bytes(0x80, std_request::GET_CONFIGURATION, 0, 0, 1);
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert_eq!(dev.bus().bytes_for(EP0_IN), vec![config::CONFIG_VALUE]);
    }

    #[test]
    fn bus_reset_returns_to_attached_and_kills_data_traffic() {
        let mut dev = device();
        configure(&mut dev);
        assert_dtr(&mut dev, true);

        dev.bus_mut().events.push_back(BusEvent::Reset);
        dev.poll();
        assert_eq!(dev.state(), DeviceState::Attached);
        assert_eq!(dev.bus().address, 0);
        assert!(!dev.serial().unwrap().connected());
        assert_eq!(
            dev.keyboard().unwrap().press(0x04),
            Err(Error::Disconnected)
        );
    }

    #[test]
    fn registration_conflicts_surface_at_build_time() {
        let mut dev = UsbComposite::new(MockBus::new());
        dev.add_keyboard(KeyboardConfig::default()).unwrap();
        assert_eq!(
            dev.add_keyboard(KeyboardConfig::default()),
            Err(Error::InterfaceConflict(config::KEYBOARD_INTERFACE))
        );
    }

    #[test]
    fn registration_is_rejected_once_attached() {
        let mut dev = device();
        assert_eq!(
            dev.add_msc(MscConfig::default(), Box::leak(Box::new(EchoHandler))),
            Err(Error::AlreadyAttached)
        );
    }

    #[test]
    fn suspend_resume_tracking() {
        let mut dev = device();
        dev.bus_mut().events.push_back(BusEvent::Suspend);
        dev.poll();
        assert!(dev.suspended());
        dev.bus_mut().events.push_back(BusEvent::Resume);
        dev.poll();
        assert!(!dev.suspended());
    }

    // MSC

    struct EchoHandler;

    impl MscHandler for EchoHandler {
        fn data(&mut self, pipe: &mut dyn MscPipe) -> Result<(), Error> {
            let mut buf = [0u8; 64];
            let n = pipe.read(&mut buf);
            if n > 0 {
                pipe.write(&buf[..n])?;
            }
            Ok(())
        }
    }

    fn msc_device() -> UsbComposite<MockBus> {
        let mut dev = UsbComposite::new(MockBus::new());
        dev.add_cdc(CdcConfig::default()).unwrap();
        dev.add_keyboard(KeyboardConfig::default()).unwrap();
        dev.add_mouse(MouseConfig::default()).unwrap();
        dev.add_msc(MscConfig::default(), Box::leak(Box::new(EchoHandler)))
            .unwrap();
        dev.attach();
        dev
    }

    #[test]
    fn msc_get_max_lun() {
        let mut dev = msc_device();
        configure(&mut dev);
        let raw = setup_bytes(
            0xA1,
            msc_request::GET_MAX_LUN,
            0,
            config::MSC_INTERFACE as u16,
            1,
        );
        dev.bus_mut().events.push_back(BusEvent::Setup(raw));
        dev.poll();
        assert_eq!(dev.bus().bytes_for(EP0_IN), vec![0]);
    }

    #[test]
    fn msc_bulk_data_reaches_the_handler() {
        let mut dev = msc_device();
        configure(&mut dev);
        let rx_ep = EpAddr::new(config::MSC_RX_EP, EpDir::Out);
        let tx_ep = EpAddr::new(config::MSC_TX_EP, EpDir::In);

        dev.bus_mut().host_out(rx_ep, b"USBC0123");
        dev.bus_mut().events.push_back(BusEvent::OutData(rx_ep));
        dev.poll();

        assert_eq!(dev.bus().bytes_for(tx_ep), b"USBC0123".to_vec());
    }

    #[test]
    fn four_function_descriptor_counts_interfaces() {
        let dev = msc_device();
        let desc = descriptor::configuration_descriptor(dev.functions()).unwrap();
        assert_eq!(desc[4], 5); // 2 CDC + keyboard + mouse + MSC
        assert_eq!(
            u16::from_le_bytes([desc[2], desc[3]]) as usize,
            desc.len()
        );
    }
}
