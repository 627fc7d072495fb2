#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! EHCI USB 2.0 host engine for i.MX RT1062 (Teensy 4.x)
//!
//! The host-side core of a USB stack: pooled schedule structures, a pipe and
//! transfer engine over the EHCI asynchronous and periodic schedules, a
//! bandwidth-admitting periodic scheduler, driver timers, and the device
//! enumeration state machine. Device-class drivers (HID, hubs, mass storage)
//! live outside this crate and plug in through [`driver::UsbDriver`].
//!
//! # Core Components
//!
//! - [`host`] - The engine: devices, pipes, transfers, interrupt servicing
//! - [`ehci`] - Hardware shadow structures and the register capability
//! - [`driver`] - The contract class drivers implement
//! - [`enumeration`] - Descriptor discovery and driver claim offering
//! - [`timer`] - One-shot driver timers over a shared countdown
//! - [`pool`] - Fixed-capacity generational object pools
//! - [`error`] - Error types
//!
//! # Usage Shape
//!
//! Construct a [`host::UsbHost`] over [`ehci::EhciRegs`] in a `static`, call
//! [`host::UsbHost::start`], register drivers, then service the controller
//! interrupt with [`host::UsbHost::on_interrupt`] and poll driver tasks from
//! the main loop.

#[cfg(feature = "defmt")]
use defmt as _;

pub mod driver;
pub mod ehci;
pub mod enumeration;
pub mod error;
pub mod host;
pub mod pool;
pub mod timer;

#[cfg(test)]
mod test_support;

pub use driver::{
    ClaimLevel, DeviceInfo, Direction, DriverId, HostOps, PipeKind, Speed, TransferEvent,
    UsbDriver,
};
pub use enumeration::{EnumerationStats, SetupPacket};
pub use error::{Result, UsbError};
pub use host::{DeviceHandle, PipeHandle, PoolStats, TransferHandle, UsbHost};
pub use timer::TimerHandle;
