//! Descriptor assembly for the composite device.
//!
//! The device presents one configuration whose descriptor is the
//! concatenation of every registered function's fragment (interfaces,
//! class descriptors, endpoints), with `wTotalLength` and
//! `bNumInterfaces` fixed up after the fact. Multi-interface functions
//! (CDC) contribute their own Interface Association Descriptor so hosts
//! group the pair correctly.

use heapless::Vec;

use crate::config;
use crate::error::Error;
use crate::function::FunctionSet;

/// bDescriptorType codes.
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const DEVICE_QUALIFIER: u8 = 6;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
    pub const HID: u8 = 0x21;
    pub const HID_REPORT: u8 = 0x22;
    pub const CS_INTERFACE: u8 = 0x24;
}

/// String descriptor indices used by the device descriptor.
pub const STRING_MANUFACTURER: u8 = 1;
pub const STRING_PRODUCT: u8 = 2;
pub const STRING_SERIAL: u8 = 3;

pub type ConfigDescriptorBuf = Vec<u8, { config::CONFIG_DESC_CAPACITY }>;
pub type StringDescriptorBuf = Vec<u8, 64>;

/// Append raw descriptor bytes, mapping overflow to a descriptor error.
pub(crate) fn put(buf: &mut ConfigDescriptorBuf, bytes: &[u8]) -> Result<(), Error> {
    buf.extend_from_slice(bytes)
        .map_err(|_| Error::DescriptorOverflow)
}

/// The 18-byte device descriptor. Composite class EF/02/01 so the host
/// walks the IADs instead of binding one driver to the whole device.
pub fn device_descriptor() -> [u8; 18] {
    let vid = config::USB_VID.to_le_bytes();
    let pid = config::USB_PID.to_le_bytes();
    [
        18,                           // bLength
        descriptor_type::DEVICE,      // bDescriptorType
        0x00, 0x02,                   // bcdUSB 2.00
        0xEF,                         // bDeviceClass (Miscellaneous)
        0x02,                         // bDeviceSubClass (Common)
        0x01,                         // bDeviceProtocol (IAD)
        config::EP0_MAX_PACKET as u8, // bMaxPacketSize0
        vid[0], vid[1],               // idVendor
        pid[0], pid[1],               // idProduct
        0x00, 0x01,                   // bcdDevice 1.00
        STRING_MANUFACTURER,          // iManufacturer
        STRING_PRODUCT,               // iProduct
        STRING_SERIAL,                // iSerialNumber
        1,                            // bNumConfigurations
    ]
}

/// Assemble the full configuration descriptor for the registered
/// function set.
pub fn configuration_descriptor(functions: &FunctionSet) -> Result<ConfigDescriptorBuf, Error> {
    let mut buf = ConfigDescriptorBuf::new();
    let attributes = 0x80 | if config::USB_SELF_POWERED { 0x40 } else { 0x00 };

    put(
        &mut buf,
        &[
            9,                                  // bLength
            descriptor_type::CONFIGURATION,     // bDescriptorType
            0, 0,                               // wTotalLength (fixed up below)
            functions.num_interfaces(),         // bNumInterfaces
            config::CONFIG_VALUE,               // bConfigurationValue
            0,                                  // iConfiguration
            attributes,                         // bmAttributes
            (config::USB_MAX_POWER_MA / 2) as u8, // bMaxPower (2 mA units)
        ],
    )?;

    for f in functions.iter() {
        f.write_descriptors(&mut buf)?;
    }

    let total = (buf.len() as u16).to_le_bytes();
    buf[2] = total[0];
    buf[3] = total[1];
    Ok(buf)
}

/// String descriptors: index 0 is the language table (US English), the
/// rest are UTF-16LE encodings of the identity strings.
pub fn string_descriptor(index: u8) -> Option<StringDescriptorBuf> {
    match index {
        0 => {
            let mut buf = StringDescriptorBuf::new();
            buf.extend_from_slice(&[4, descriptor_type::STRING, 0x09, 0x04])
                .ok()?;
            Some(buf)
        }
        STRING_MANUFACTURER => encode_string(config::USB_MANUFACTURER),
        STRING_PRODUCT => encode_string(config::USB_PRODUCT),
        STRING_SERIAL => encode_string(config::USB_SERIAL_NUMBER),
        _ => None,
    }
}

fn encode_string(s: &str) -> Option<StringDescriptorBuf> {
    let mut buf = StringDescriptorBuf::new();
    buf.push(0).ok()?;
    buf.push(descriptor_type::STRING).ok()?;
    for unit in s.encode_utf16() {
        let b = unit.to_le_bytes();
        buf.push(b[0]).ok()?;
        buf.push(b[1]).ok()?;
    }
    buf[0] = buf.len() as u8;
    Some(buf)
}
