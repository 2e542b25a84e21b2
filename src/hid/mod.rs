//! HID function drivers - boot-protocol keyboard and mouse.
//!
//! Each function owns one interface and one interrupt IN endpoint and
//! keeps the *current* report (pressed keys / button set) as state; a
//! report is sent on every state change, never batched or coalesced.

pub mod keyboard;
pub mod mouse;


use crate::bus::EpAddr;
use crate::descriptor::{self, descriptor_type, ConfigDescriptorBuf};
use crate::error::Error;

/// HID class request codes (HID 1.11 section 7.2).
pub mod request {
    pub const GET_REPORT: u8 = 0x01;
    pub const GET_IDLE: u8 = 0x02;
    pub const GET_PROTOCOL: u8 = 0x03;
    pub const SET_REPORT: u8 = 0x09;
    pub const SET_IDLE: u8 = 0x0A;
    pub const SET_PROTOCOL: u8 = 0x0B;
}

pub const HID_CLASS: u8 = 0x03;
pub const HID_SUBCLASS_BOOT: u8 = 0x01;
pub const HID_PROTOCOL_KEYBOARD: u8 = 0x01;
pub const HID_PROTOCOL_MOUSE: u8 = 0x02;

/// Report protocol selected by SET_PROTOCOL (1 = report, 0 = boot). Both
/// report layouts here are boot-compatible, so the value is stored and
/// echoed but does not change the encoding.
pub(crate) const DEFAULT_PROTOCOL: u8 = 1;

/// Append one HID function: interface descriptor, HID descriptor and
/// the interrupt IN endpoint.
pub(crate) fn write_hid_function(
    buf: &mut ConfigDescriptorBuf,
    interface: u8,
    protocol: u8,
    report_desc_len: usize,
    endpoint: EpAddr,
    max_packet: usize,
    interval_ms: u8,
) -> Result<(), Error> {
    let desc_len = (report_desc_len as u16).to_le_bytes();
    let packet = (max_packet as u16).to_le_bytes();
    descriptor::put(
        buf,
        &[
            9,                          // bLength
            descriptor_type::INTERFACE, // bDescriptorType
            interface,                  // bInterfaceNumber
            0,                          // bAlternateSetting
            1,                          // bNumEndpoints
            HID_CLASS,                  // bInterfaceClass
            HID_SUBCLASS_BOOT,          // bInterfaceSubClass
            protocol,                   // bInterfaceProtocol
            0,                          // iInterface
        ],
    )?;
    descriptor::put(
        buf,
        &[
            9,                          // bLength
            descriptor_type::HID,       // bDescriptorType
            0x11, 0x01,                 // bcdHID 1.11
            0,                          // bCountryCode
            1,                          // bNumDescriptors
            descriptor_type::HID_REPORT, // bDescriptorType (report)
            desc_len[0], desc_len[1],   // wDescriptorLength
        ],
    )?;
    descriptor::put(
        buf,
        &[
            7,                          // bLength
            descriptor_type::ENDPOINT,  // bDescriptorType
            endpoint.raw(),             // bEndpointAddress
            0x03,                       // bmAttributes (interrupt)
            packet[0], packet[1],       // wMaxPacketSize
            interval_ms,                // bInterval
        ],
    )
}
