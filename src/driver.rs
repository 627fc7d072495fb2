//! Device-class driver capability contract
//!
//! Class drivers (HID, hubs, mass storage, ...) live outside this crate and
//! plug in through [`UsbDriver`]. The engine calls into a driver; the driver
//! calls back into the engine through the object-safe [`HostOps`] facade it
//! receives with every callback. Drivers are registered once at start-up as
//! `&'static mut dyn UsbDriver` and never unregistered.

use crate::enumeration::SetupPacket;
use crate::error::Result;
use crate::host::{DeviceHandle, PipeHandle};
use crate::timer::TimerHandle;

/// Negotiated bus speed of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    /// 1.5 Mbps
    Low,
    /// 12 Mbps
    Full,
    /// 480 Mbps
    High,
}

/// Transfer direction, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Pipe kind, matching the endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeKind {
    /// Bidirectional control endpoint
    Control,
    /// Bulk endpoint on the asynchronous schedule
    Bulk,
    /// Interrupt endpoint on the periodic schedule
    Interrupt,
    /// Placeholder only; isochronous scheduling is not implemented and
    /// pipe creation rejects this kind
    Isochronous,
}

/// Granularity at which a device is offered to drivers during enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClaimLevel {
    /// The whole device, with the full configuration descriptor
    Device,
    /// One interface, with that interface's descriptor slice
    Interface,
}

/// Index of a registered driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DriverId(pub(crate) u8);

impl DriverId {
    /// Registry index
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Who gets told when a transfer chain completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Callback {
    /// Nobody; completion is reaped silently
    None,
    /// The enumeration state machine
    Enumeration,
    /// A registered driver
    Driver(DriverId),
}

/// Identity of an enumerated device, as parsed from its descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceInfo {
    /// Negotiated speed
    pub speed: Speed,
    /// Assigned bus address (0 while still enumerating)
    pub address: u8,
    /// idVendor
    pub vendor_id: u16,
    /// idProduct
    pub product_id: u16,
    /// bDeviceClass
    pub class: u8,
    /// bDeviceSubClass
    pub subclass: u8,
    /// bDeviceProtocol
    pub protocol: u8,
}

/// A completed transfer, delivered to the owning driver
#[derive(Debug, Clone, Copy)]
pub struct TransferEvent {
    /// Pipe the transfer ran on
    pub pipe: PipeHandle,
    /// Setup packet, for control transfers
    pub setup: Option<SetupPacket>,
    /// Caller's buffer
    pub buffer: *mut u8,
    /// Bytes requested
    pub requested: usize,
    /// Bytes actually transferred
    pub actual: usize,
    /// `Ok` or the error decoded from the descriptor's status token
    pub status: Result<()>,
}

/// Operations the engine exposes to driver callbacks
///
/// Pipe creation and transfer queueing performed from inside a callback are
/// attributed to the driver being called: its completions and timers route
/// back to the same driver.
pub trait HostOps {
    /// Create a pipe for one endpoint of `device`
    ///
    /// `interval` is in microframes for high-speed interrupt endpoints and
    /// in frames (bInterval) for full/low-speed ones; ignored otherwise.
    /// Returns `None` on pool exhaustion or failed bandwidth admission.
    fn create_pipe(
        &mut self,
        device: DeviceHandle,
        kind: PipeKind,
        endpoint: u8,
        direction: Direction,
        max_packet: u16,
        interval: u32,
    ) -> Option<PipeHandle>;

    /// Delete a pipe, cancelling its queued transfers
    fn delete_pipe(&mut self, pipe: PipeHandle);

    /// Queue a control transfer on the device's control pipe
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid and unmoved until the completion callback
    /// runs; queueing is non-blocking and the hardware reads the buffer
    /// afterwards. `buffer` may be null only when `setup.wLength` is zero.
    unsafe fn queue_control_transfer(
        &mut self,
        device: DeviceHandle,
        setup: SetupPacket,
        buffer: *mut u8,
    ) -> Result<()>;

    /// Queue a bulk or interrupt transfer
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid and unmoved until the completion callback
    /// runs.
    unsafe fn queue_data_transfer(
        &mut self,
        pipe: PipeHandle,
        buffer: *mut u8,
        length: usize,
    ) -> Result<()>;

    /// Start a one-shot timer that fires `micros` from now
    ///
    /// Requests under 100 microseconds are silently ignored (returns
    /// `None`); that floor is a hard minimum, not a rounding.
    fn timer_start(&mut self, payload: u32, micros: u32) -> Option<TimerHandle>;

    /// Cancel a pending timer
    fn timer_stop(&mut self, timer: TimerHandle);

    /// Identity of an enumerated device
    fn device_info(&self, device: DeviceHandle) -> Option<DeviceInfo>;
}

/// The contract implemented by every device-class driver
///
/// `claim` is required; the rest default to no-ops so simple drivers stay
/// small.
pub trait UsbDriver {
    /// Offer a device (or one interface of it) to this driver
    ///
    /// Called during enumeration for every unbound driver, first at
    /// [`ClaimLevel::Device`] with the full configuration descriptor, then
    /// at [`ClaimLevel::Interface`] for each unclaimed interface slice.
    /// Returning `true` binds the driver to the device until disconnect.
    /// Drivers typically create their pipes from inside this call.
    fn claim(
        &mut self,
        host: &mut dyn HostOps,
        device: DeviceHandle,
        level: ClaimLevel,
        descriptors: &[u8],
    ) -> bool;

    /// A control transfer queued by this driver completed
    fn control(&mut self, host: &mut dyn HostOps, event: &TransferEvent) {
        let _ = (host, event);
    }

    /// A data transfer on one of this driver's pipes completed
    fn transfer_complete(&mut self, host: &mut dyn HostOps, event: &TransferEvent) {
        let _ = (host, event);
    }

    /// The device this driver claimed was disconnected
    ///
    /// The engine has already deleted the device's pipes; the driver resets
    /// its own state and becomes claimable again.
    fn disconnect(&mut self, host: &mut dyn HostOps) {
        let _ = host;
    }

    /// A timer started by this driver fired
    fn timer_event(&mut self, host: &mut dyn HostOps, payload: u32) {
        let _ = (host, payload);
    }

    /// Cooperative main-line poll
    fn task(&mut self, host: &mut dyn HostOps) {
        let _ = host;
    }
}
