//! Crate-wide constants and compile-time configuration.
//!
//! All identity strings, endpoint assignments, packet sizes and timing
//! parameters live here so they can be tuned in one place.

// Device identity

/// USB VID/PID - use the "pid.codes" open-source test VID.
/// Replace with your own allocated VID/PID for production.
pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0x0005;

/// USB device strings.
pub const USB_MANUFACTURER: &str = "usb-composite";
pub const USB_PRODUCT: &str = "Composite Serial + HID";
pub const USB_SERIAL_NUMBER: &str = "000001";

/// Bus-powered current draw reported in the configuration descriptor (mA).
pub const USB_MAX_POWER_MA: u16 = 100;

/// Report the device as self-powered in GET_STATUS / bmAttributes.
pub const USB_SELF_POWERED: bool = false;

/// bConfigurationValue of the single configuration.
pub const CONFIG_VALUE: u8 = 1;

// Packet sizes

/// Control endpoint (EP0) maximum packet size.
pub const EP0_MAX_PACKET: usize = 64;

/// Bulk endpoint maximum packet size (full speed).
pub const BULK_MAX_PACKET: usize = 64;

/// Interrupt endpoint maximum packet size (HID reports are 8 bytes or less).
pub const INTERRUPT_MAX_PACKET: usize = 8;

/// CDC notification endpoint maximum packet size.
pub const CDC_NOTIF_MAX_PACKET: usize = 8;

// Interface and endpoint map
//
// Interfaces are numbered in registration order; endpoint indices are
// statically partitioned, one function per endpoint, so no two drivers
// ever contend for the same hardware buffer.

pub const CDC_COMM_INTERFACE: u8 = 0;
pub const CDC_DATA_INTERFACE: u8 = 1;
pub const KEYBOARD_INTERFACE: u8 = 2;
pub const MOUSE_INTERFACE: u8 = 3;
pub const MSC_INTERFACE: u8 = 4;

/// CDC notification endpoint index (interrupt IN).
pub const CDC_NOTIF_EP: u8 = 1;
/// CDC data OUT endpoint index (bulk, host to device).
pub const CDC_RX_EP: u8 = 2;
/// CDC data IN endpoint index (bulk, device to host).
pub const CDC_TX_EP: u8 = 3;
/// Keyboard report endpoint index (interrupt IN).
pub const KEYBOARD_EP: u8 = 4;
/// Mouse report endpoint index (interrupt IN).
pub const MOUSE_EP: u8 = 5;
/// Mass-storage bulk IN endpoint index.
pub const MSC_TX_EP: u8 = 6;
/// Mass-storage bulk OUT endpoint index.
pub const MSC_RX_EP: u8 = 7;

/// HID polling interval (ms). 1 ms = 1000 Hz for lowest latency.
pub const HID_POLL_MS: u8 = 1;

/// CDC notification endpoint polling interval (ms).
pub const CDC_NOTIF_INTERVAL_MS: u8 = 16;

// Buffers and limits

/// CDC receive ring capacity in bytes. Must hold at least one full bulk
/// packet or the ring could never accept a drained packet.
pub const CDC_RX_CAPACITY: usize = 64;

/// Scratch capacity for the assembled configuration descriptor.
pub const CONFIG_DESC_CAPACITY: usize = 256;

/// Maximum number of registered function drivers.
pub const MAX_FUNCTIONS: usize = 4;

/// Endpoint table capacity (15 indices times two directions is the USB
/// ceiling; real controllers have far fewer).
pub const MAX_ENDPOINTS: usize = 16;

/// Iterations a blocking send spins on a busy endpoint before giving up.
/// Keeps a wedged endpoint from hanging the control path forever.
pub const SEND_SPIN_LIMIT: u32 = 1_000_000;
