//! EHCI hardware structures and register definitions
//!
//! Hardware-shadow types for the EHCI schedule machinery (queue heads,
//! transfer descriptors, the periodic frame list) plus register bit
//! definitions for the i.MX RT1062 USB host controller.
//!
//! Register layout references:
//! - i.MX RT1060 Reference Manual, Chapter 66.6 (USB Host Controller Registers)
//! - EHCI Specification Sections 2 (registers), 3.5 (qTD), 3.6 (QH)

pub mod controller;
pub mod periodic;
pub mod qh;
pub mod qtd;

pub use controller::{EhciRegs, GpTimer, HostController};
pub use periodic::{BandwidthAllocator, PeriodicFrameList, Reservation, PERIODIC_LIST_SIZE};
pub use qh::QueueHead;
pub use qtd::TransferDescriptor;

// Re-export the bit modules for callers that program fields directly
pub use qh::{capabilities, endpoint};
pub use qtd::token;

use bitflags::bitflags;

/// Base address for the USB1 EHCI controller on i.MX RT1062
pub const USB1_BASE: usize = 0x402E_0000;

/// Base address for the USB2 EHCI controller on i.MX RT1062
pub const USB2_BASE: usize = 0x402E_0400;

bitflags! {
    /// USB Command Register (USBCMD) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop (RS) - Bit 0
        const RUN_STOP = 1 << 0;
        /// Host Controller Reset (HCRESET) - Bit 1
        const HC_RESET = 1 << 1;
        /// Frame List Size - Bits [3:2]
        const FRAME_LIST_SIZE_MASK = 0b11 << 2;
        /// Periodic Schedule Enable (PSE) - Bit 4
        const PERIODIC_SCHEDULE_ENABLE = 1 << 4;
        /// Asynchronous Schedule Enable (ASE) - Bit 5
        const ASYNC_SCHEDULE_ENABLE = 1 << 5;
        /// Interrupt on Async Advance Doorbell (IAAD) - Bit 6
        const ASYNC_ADVANCE_DOORBELL = 1 << 6;
        /// Frame List Size extension (FS_2) - Bit 15, i.MX RT specific
        const FRAME_LIST_SIZE_2 = 1 << 15;
        /// Interrupt Threshold Control - Bits [23:16]
        const INTERRUPT_THRESHOLD_MASK = 0xFF << 16;
    }
}

bitflags! {
    /// USB Status Register (USBSTS) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// USB Interrupt (USBINT) - Bit 0, a transfer with IOC retired
        const USB_INTERRUPT = 1 << 0;
        /// USB Error Interrupt (USBERRINT) - Bit 1
        const USB_ERROR_INTERRUPT = 1 << 1;
        /// Port Change Detect (PCD) - Bit 2
        const PORT_CHANGE_DETECT = 1 << 2;
        /// Frame List Rollover (FLR) - Bit 3
        const FRAME_LIST_ROLLOVER = 1 << 3;
        /// Host System Error (HSE) - Bit 4
        const HOST_SYSTEM_ERROR = 1 << 4;
        /// Interrupt on Async Advance (IAA) - Bit 5, doorbell acknowledged
        const ASYNC_ADVANCE = 1 << 5;
        /// Host Controller Halted (HCHalted) - Bit 12
        const HC_HALTED = 1 << 12;
        /// Periodic Schedule Status (PSS) - Bit 14
        const PERIODIC_SCHEDULE_STATUS = 1 << 14;
        /// Asynchronous Schedule Status (ASS) - Bit 15
        const ASYNC_SCHEDULE_STATUS = 1 << 15;
        /// General Purpose Timer 0 Interrupt (TI0) - Bit 24, i.MX RT specific
        const TIMER0_INTERRUPT = 1 << 24;
        /// General Purpose Timer 1 Interrupt (TI1) - Bit 25, i.MX RT specific
        const TIMER1_INTERRUPT = 1 << 25;
    }
}

bitflags! {
    /// USB Interrupt Enable Register (USBINTR) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbIntr: u32 {
        /// USB Interrupt Enable - Bit 0
        const USB_INTERRUPT = 1 << 0;
        /// USB Error Interrupt Enable - Bit 1
        const USB_ERROR_INTERRUPT = 1 << 1;
        /// Port Change Interrupt Enable - Bit 2
        const PORT_CHANGE = 1 << 2;
        /// Interrupt on Async Advance Enable - Bit 5
        const ASYNC_ADVANCE = 1 << 5;
        /// General Purpose Timer 0 Interrupt Enable (TIE0) - Bit 24
        const TIMER0 = 1 << 24;
        /// General Purpose Timer 1 Interrupt Enable (TIE1) - Bit 25
        const TIMER1 = 1 << 25;
    }
}

bitflags! {
    /// Port Status and Control Register (PORTSC) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        /// Current Connect Status (CCS) - Bit 0
        const CURRENT_CONNECT_STATUS = 1 << 0;
        /// Connect Status Change (CSC) - Bit 1
        const CONNECT_STATUS_CHANGE = 1 << 1;
        /// Port Enabled/Disabled (PED) - Bit 2
        const PORT_ENABLED = 1 << 2;
        /// Port Enable/Disable Change (PEDC) - Bit 3
        const PORT_ENABLE_CHANGE = 1 << 3;
        /// Over-current Change (OCC) - Bit 5
        const OVER_CURRENT_CHANGE = 1 << 5;
        /// Port Reset (PR) - Bit 8
        const PORT_RESET = 1 << 8;
        /// Port Power (PP) - Bit 12
        const PORT_POWER = 1 << 12;
        /// Port Speed - Bits [27:26] (i.MX RT specific extension)
        const PORT_SPEED_MASK = 0b11 << 26;
        /// Port Speed value: low speed
        const PORT_SPEED_LOW = 0b01 << 26;
        /// Port Speed value: high speed
        const PORT_SPEED_HIGH = 0b10 << 26;
    }
}

impl PortSc {
    /// Decode the negotiated port speed
    pub fn speed(self) -> crate::driver::Speed {
        match (self & Self::PORT_SPEED_MASK).bits() >> 26 {
            0b01 => crate::driver::Speed::Low,
            0b10 => crate::driver::Speed::High,
            _ => crate::driver::Speed::Full,
        }
    }
}
