//! USB error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// USB stall condition
    Stall,
    /// Timeout waiting for response
    Timeout,
    /// Babble detected (device sent too much data)
    Babble,
    /// Transaction error (CRC, timeout, bad PID)
    TransactionError,
    /// Missed microframe
    MissedMicroframe,
    /// Buffer overflow
    BufferOverflow,
    /// Invalid parameter
    InvalidParameter,
    /// Invalid state for operation
    InvalidState,
    /// No available resources (descriptors, pipes, timers)
    NoResources,
    /// Invalid descriptor
    InvalidDescriptor,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stall => write!(f, "USB stall"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Babble => write!(f, "Babble detected"),
            Self::TransactionError => write!(f, "Transaction error"),
            Self::MissedMicroframe => write!(f, "Missed microframe"),
            Self::BufferOverflow => write!(f, "Buffer overflow"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::NoResources => write!(f, "No resources available"),
            Self::InvalidDescriptor => write!(f, "Invalid descriptor"),
        }
    }
}
