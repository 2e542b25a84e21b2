//! Unified error type for usb-composite.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` for efficient on-target logging.

/// Top-level error type used across the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // Protocol
    /// Malformed or unclaimed control request; EP0 was stalled.
    Protocol,

    /// Endpoint busy or halted; a non-blocking operation cannot proceed.
    NotReady,

    /// Cable detached or configuration lost while a transfer was pending.
    Disconnected,

    /// A fixed-capacity buffer (key slots, rx ring, registry) is full.
    CapacityExceeded,

    /// A blocking send exceeded its spin limit on a wedged endpoint.
    Timeout,

    // Registration
    /// Two function drivers claimed the same interface number.
    InterfaceConflict(u8),

    /// An endpoint address was claimed or registered twice.
    EndpointConflict(u8),

    /// An endpoint was used without being registered first.
    UnknownEndpoint(u8),

    /// Function registration attempted while the device was attached.
    AlreadyAttached,

    // Descriptors
    /// The assembled descriptor does not fit its scratch buffer.
    DescriptorOverflow,
}
