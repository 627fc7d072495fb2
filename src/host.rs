//! The host-controller engine
//!
//! Owns every pooled record (devices, pipes, transfers, strings, timers),
//! the asynchronous ring and periodic table, the followup lists the
//! interrupt path reaps, and the root-port state machine. All transfer
//! queueing is non-blocking: a `queue_*` call links hardware structures and
//! returns; completion arrives later through [`UsbHost::on_interrupt`].
//!
//! # Placement
//!
//! Queue heads and transfer descriptors are embedded in pooled records, so
//! the controller holds physical pointers into this struct. Construct it in
//! a `static` (or otherwise guarantee it never moves) before calling
//! [`UsbHost::start`].
//!
//! # Concurrency
//!
//! One core, one interrupt source. Structures shared between
//! [`UsbHost::on_interrupt`] and main-line calls are protected by masking
//! the controller interrupt around main-line mutation; there are no locks.

use crate::driver::{
    Callback, DeviceInfo, Direction, DriverId, HostOps, PipeKind, Speed, TransferEvent, UsbDriver,
};
use crate::ehci::qh::QueueHead;
use crate::ehci::qtd::{token, TransferDescriptor};
use crate::ehci::{
    BandwidthAllocator, GpTimer, HostController, PeriodicFrameList, PortSc, Reservation, UsbIntr,
    UsbSts, PERIODIC_LIST_SIZE,
};
use crate::enumeration::{Enumerator, SetupPacket};
use crate::error::{Result, UsbError};
use crate::pool::{Handle, Slab, SlabStats};
use crate::timer::{Reprogram, TimerHandle, TimerQueue};

/// Handle to a device record
pub type DeviceHandle = Handle<Device>;
/// Handle to a pipe record
pub type PipeHandle = Handle<Pipe>;
/// Handle to a transfer record
pub type TransferHandle = Handle<Transfer>;

/// Drivers a single device may bind (device-level claim plus interfaces)
const MAX_DRIVERS_PER_DEVICE: usize = 4;

/// Pipes that may share one periodic frame slot
const MAX_PIPES_PER_FRAME: usize = 6;

/// Root-port debounce time after connect detection
const DEBOUNCE_US: u32 = 25_000;
/// Root-port reset assertion time
const RESET_US: u32 = 50_000;
/// Post-reset recovery time before the first transfer
const RECOVERY_US: u32 = 10_000;
/// Retry period when attach is blocked by a busy enumeration
const ATTACH_RETRY_US: u32 = 100_000;

/// One attached USB device
pub struct Device {
    pub(crate) speed: Speed,
    /// Assigned bus address; 0 until SET_ADDRESS completes
    pub(crate) address: u8,
    /// Topology position: translator hub address/port, 0/0 on the root port
    pub(crate) hub_address: u8,
    pub(crate) hub_port: u8,
    pub(crate) language_id: u16,
    pub(crate) control_pipe: Option<PipeHandle>,
    /// Head of the data (non-control) pipe list
    pub(crate) first_pipe: Option<PipeHandle>,
    pub(crate) drivers: heapless::Vec<DriverId, MAX_DRIVERS_PER_DEVICE>,
    pub(crate) strings: Option<Handle<StringBuffer>>,
    /// Enumeration step counter; 15 = fully configured
    pub(crate) enum_state: u8,
    pub(crate) max_packet0: u16,
    pub(crate) vendor_id: u16,
    pub(crate) product_id: u16,
    pub(crate) class: u8,
    pub(crate) subclass: u8,
    pub(crate) protocol: u8,
    pub(crate) string_index: [u8; 3],
    pub(crate) config_value: u8,
    pub(crate) bm_attributes: u8,
    pub(crate) max_power_2ma: u8,
}

impl Device {
    pub(crate) fn new(speed: Speed, hub_address: u8, hub_port: u8) -> Self {
        Self {
            speed,
            address: 0,
            hub_address,
            hub_port,
            language_id: 0,
            control_pipe: None,
            first_pipe: None,
            drivers: heapless::Vec::new(),
            strings: None,
            enum_state: 0,
            max_packet0: match speed {
                Speed::Low => 8,
                _ => 64,
            },
            vendor_id: 0,
            product_id: 0,
            class: 0,
            subclass: 0,
            protocol: 0,
            string_index: [0; 3],
            config_value: 0,
            bm_attributes: 0,
            max_power_2ma: 0,
        }
    }
}

/// One endpoint's transfer queue
pub struct Pipe {
    /// Hardware queue head shadow; the controller dereferences this
    pub(crate) qh: QueueHead,
    pub(crate) kind: PipeKind,
    pub(crate) direction: Direction,
    pub(crate) device: DeviceHandle,
    pub(crate) max_packet: u16,
    /// Default completion callback for data transfers on this pipe
    pub(crate) callback: Callback,
    /// Periodic bandwidth charge; interrupt pipes only
    pub(crate) reservation: Option<Reservation>,
    /// The reserved inert descriptor at the tail of the active chain
    pub(crate) halt: Option<TransferHandle>,
    /// Successor in the circular asynchronous ring
    pub(crate) next_async: Option<PipeHandle>,
    /// Successor on the owning device's data pipe list
    pub(crate) next_on_device: Option<PipeHandle>,
    /// Cancelled transfers parked until the doorbell confirms reclamation
    pub(crate) deferred: Option<TransferHandle>,
}

/// One hardware bus-transaction chunk plus its soft bookkeeping
pub struct Transfer {
    /// Hardware qTD shadow; the controller dereferences this
    pub(crate) qtd: TransferDescriptor,
    pub(crate) pipe: Option<PipeHandle>,
    /// Soft mirror of the hardware next pointer
    pub(crate) next: Option<TransferHandle>,
    pub(crate) followup_next: Option<TransferHandle>,
    pub(crate) followup_prev: Option<TransferHandle>,
    pub(crate) buffer: *mut u8,
    pub(crate) length: usize,
    /// Copy of the originating setup packet; the SETUP stage DMAs this copy
    pub(crate) setup: SetupPacket,
    pub(crate) is_control: bool,
    pub(crate) is_setup_stage: bool,
    /// Only the chain tail carries the completion callback
    pub(crate) notify: bool,
    pub(crate) callback: Callback,
}

impl Transfer {
    fn new_halt() -> Self {
        Self {
            qtd: TransferDescriptor::new_halted(),
            pipe: None,
            next: None,
            followup_next: None,
            followup_prev: None,
            buffer: core::ptr::null_mut(),
            length: 0,
            setup: SetupPacket::zeroed(),
            is_control: false,
            is_setup_stage: false,
            notify: false,
            callback: Callback::None,
        }
    }

    fn new_stage(pid: u32, buffer: *mut u8, length: usize, data_toggle: bool) -> Self {
        let qtd = TransferDescriptor::new();
        qtd.token.store(
            TransferDescriptor::make_token(pid, length, data_toggle, false),
            core::sync::atomic::Ordering::Relaxed,
        );
        Self {
            qtd,
            pipe: None,
            next: None,
            followup_next: None,
            followup_prev: None,
            buffer,
            length,
            setup: SetupPacket::zeroed(),
            is_control: false,
            is_setup_stage: false,
            notify: false,
            callback: Callback::None,
        }
    }
}

/// Device string storage: manufacturer, product, serial
pub struct StringBuffer {
    pub(crate) buf: [u8; 192],
    pub(crate) used: u8,
    /// (start, len) per string: manufacturer, product, serial
    pub(crate) spans: [(u8, u8); 3],
}

impl StringBuffer {
    pub(crate) fn new() -> Self {
        Self {
            buf: [0; 192],
            used: 0,
            spans: [(0, 0); 3],
        }
    }

    /// Stored text for string slot `which` (0 = manufacturer, 1 = product,
    /// 2 = serial); empty if never fetched
    pub fn text(&self, which: usize) -> &str {
        let (start, len) = self.spans[which % 3];
        core::str::from_utf8(&self.buf[start as usize..(start + len) as usize]).unwrap_or("")
    }

    pub(crate) fn store(&mut self, which: usize, text: &[u8]) {
        let start = self.used;
        let room = self.buf.len() - start as usize;
        let len = text.len().min(room).min(u8::MAX as usize);
        self.buf[start as usize..start as usize + len].copy_from_slice(&text[..len]);
        self.used = start + len as u8;
        self.spans[which % 3] = (start, len as u8);
    }
}

/// Process-wide exclusive flag, acquired at state-machine entry and released
/// on every exit path
#[derive(Default)]
pub(crate) struct Lease {
    held: bool,
}

impl Lease {
    pub(crate) fn try_acquire(&mut self) -> bool {
        if self.held {
            false
        } else {
            self.held = true;
            true
        }
    }

    pub(crate) fn release(&mut self) {
        self.held = false;
    }

    pub(crate) fn is_held(&self) -> bool {
        self.held
    }
}

/// Root port sequencing states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum PortState {
    Disconnected,
    Debounce,
    Resetting,
    Recovery,
    Active,
}

/// Head/tail of a followup list
#[derive(Default, Clone, Copy)]
struct FollowupList {
    head: Option<TransferHandle>,
    tail: Option<TransferHandle>,
}

struct DriverSlot {
    driver: Option<&'static mut dyn UsbDriver>,
    device: Option<DeviceHandle>,
}

/// Pool utilization snapshot across all record kinds
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolStats {
    /// Device records
    pub devices: SlabStats,
    /// Pipe records
    pub pipes: SlabStats,
    /// Transfer records
    pub transfers: SlabStats,
    /// String buffers
    pub strings: SlabStats,
}

/// The USB host engine
///
/// Generic over the hardware capability `C` and the pool capacities
/// contributed at construction time. Capacities are fixed; exhaustion is
/// reported per operation, never grown around.
pub struct UsbHost<
    C: HostController,
    const DEVICES: usize = 4,
    const PIPES: usize = 12,
    const TRANSFERS: usize = 32,
    const TIMERS: usize = 8,
    const STRINGS: usize = 4,
    const DRIVERS: usize = 8,
> {
    controller: C,
    pub(crate) devices: Slab<Device, DEVICES>,
    pub(crate) pipes: Slab<Pipe, PIPES>,
    pub(crate) transfers: Slab<Transfer, TRANSFERS>,
    pub(crate) strings: Slab<StringBuffer, STRINGS>,
    timers: TimerQueue<TIMERS>,
    frame_list: PeriodicFrameList,
    periodic_frames: [heapless::Vec<PipeHandle, MAX_PIPES_PER_FRAME>; PERIODIC_LIST_SIZE],
    bandwidth: BandwidthAllocator,
    async_head: Option<PipeHandle>,
    async_count: usize,
    periodic_count: usize,
    async_followup: FollowupList,
    periodic_followup: FollowupList,
    deferred_pipes: heapless::Vec<PipeHandle, 4>,
    drivers: [DriverSlot; DRIVERS],
    driver_count: usize,
    /// Driver currently being called back; attributes pipes and timers it
    /// creates from inside the callback
    dispatching: Option<DriverId>,
    pub(crate) enumerator: Enumerator,
    pub(crate) enum_lease: Lease,
    reset_lease: Lease,
    port: PortState,
    root_device: Option<DeviceHandle>,
}

impl<
        C: HostController,
        const DEVICES: usize,
        const PIPES: usize,
        const TRANSFERS: usize,
        const TIMERS: usize,
        const STRINGS: usize,
        const DRIVERS: usize,
    > UsbHost<C, DEVICES, PIPES, TRANSFERS, TIMERS, STRINGS, DRIVERS>
{
    /// Create an engine over `controller`
    ///
    /// The controller should already be reset and running (see
    /// [`crate::ehci::EhciRegs::reset_and_run`]).
    pub fn new(controller: C) -> Self {
        Self {
            controller,
            devices: Slab::new(),
            pipes: Slab::new(),
            transfers: Slab::new(),
            strings: Slab::new(),
            timers: TimerQueue::new(),
            frame_list: PeriodicFrameList::new(),
            periodic_frames: [const { heapless::Vec::new() }; PERIODIC_LIST_SIZE],
            bandwidth: BandwidthAllocator::new(),
            async_head: None,
            async_count: 0,
            periodic_count: 0,
            async_followup: FollowupList::default(),
            periodic_followup: FollowupList::default(),
            deferred_pipes: heapless::Vec::new(),
            drivers: [const {
                DriverSlot {
                    driver: None,
                    device: None,
                }
            }; DRIVERS],
            driver_count: 0,
            dispatching: None,
            enumerator: Enumerator::new(),
            enum_lease: Lease::default(),
            reset_lease: Lease::default(),
            port: PortState::Disconnected,
            root_device: None,
        }
    }

    /// Program schedule bases and enable interrupts
    ///
    /// Call once, after the engine has reached its final address.
    pub fn start(&mut self) {
        self.controller.set_periodic_base(self.frame_list.base_address());
        self.controller.set_interrupt_mask(
            UsbIntr::USB_INTERRUPT
                | UsbIntr::USB_ERROR_INTERRUPT
                | UsbIntr::PORT_CHANGE
                | UsbIntr::ASYNC_ADVANCE
                | UsbIntr::TIMER0
                | UsbIntr::TIMER1,
        );
    }

    /// Contribute a class driver
    ///
    /// Returns `None` when the registry is full.
    pub fn register_driver(&mut self, driver: &'static mut dyn UsbDriver) -> Option<DriverId> {
        if self.driver_count >= DRIVERS {
            return None;
        }
        let id = DriverId(self.driver_count as u8);
        self.drivers[id.index()].driver = Some(driver);
        self.driver_count += 1;
        Some(id)
    }

    /// Borrow the hardware capability (register poking, mock inspection)
    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    /// Pool utilization snapshot
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            devices: self.devices.stats(),
            pipes: self.pipes.stats(),
            transfers: self.transfers.stats(),
            strings: self.strings.stats(),
        }
    }

    /// Identity of an enumerated device
    pub fn device_info(&self, device: DeviceHandle) -> Option<DeviceInfo> {
        let d = self.devices.get(device)?;
        Some(DeviceInfo {
            speed: d.speed,
            address: d.address,
            vendor_id: d.vendor_id,
            product_id: d.product_id,
            class: d.class,
            subclass: d.subclass,
            protocol: d.protocol,
        })
    }

    /// Stored descriptor string (0 manufacturer, 1 product, 2 serial)
    pub fn device_string(&self, device: DeviceHandle, which: usize) -> Option<&str> {
        let d = self.devices.get(device)?;
        let s = self.strings.get(d.strings?)?;
        Some(s.text(which))
    }

    /// Run every registered driver's cooperative task hook
    pub fn poll_tasks(&mut self) {
        for i in 0..self.driver_count {
            self.with_driver(DriverId(i as u8), |drv, host| drv.task(host));
        }
    }

    // ---- device attach / detach ------------------------------------------

    /// Begin hosting a newly reset, address-zero device
    ///
    /// Used by the root port sequencer and by hub drivers for downstream
    /// ports. Only one device may hold address 0: while another device is
    /// enumerating this returns `None` and the caller retries later.
    pub fn attach_device(
        &mut self,
        speed: Speed,
        hub_address: u8,
        hub_port: u8,
    ) -> Option<DeviceHandle> {
        if !self.enum_lease.try_acquire() {
            return None;
        }
        let device = match self.devices.acquire(Device::new(speed, hub_address, hub_port)) {
            Some(d) => d,
            None => {
                self.enum_lease.release();
                return None;
            }
        };
        let max_packet0 = self.devices.get(device).map(|d| d.max_packet0).unwrap_or(64);
        let control = self.create_pipe_with_callback(
            device,
            PipeKind::Control,
            0,
            Direction::In,
            max_packet0,
            0,
            Callback::Enumeration,
        );
        let control = match control {
            Some(p) => p,
            None => {
                self.devices.release(device);
                self.enum_lease.release();
                return None;
            }
        };
        if let Some(d) = self.devices.get_mut(device) {
            d.control_pipe = Some(control);
        }

        #[cfg(feature = "defmt")]
        defmt::info!("new {} device, beginning enumeration", speed);

        self.start_enumeration(device);
        Some(device)
    }

    /// Tear down a device: driver disconnects, pipes, strings, the record
    pub fn detach_device(&mut self, device: DeviceHandle) {
        if !self.devices.contains(device) {
            return;
        }

        let bound = self
            .devices
            .get(device)
            .map(|d| d.drivers.clone())
            .unwrap_or_default();
        for id in bound {
            self.with_driver(id, |drv, host| drv.disconnect(host));
            self.drivers[id.index()].device = None;
            let remaining = self.controller.timer_remaining(GpTimer::Driver);
            let action = self.timers.stop_all_for(id, remaining);
            self.apply_timer_action(action);
        }

        loop {
            let next = self.devices.get(device).and_then(|d| d.first_pipe);
            match next {
                Some(p) => self.delete_pipe(p),
                None => break,
            }
        }
        if let Some(control) = self.devices.get(device).and_then(|d| d.control_pipe) {
            self.delete_pipe(control);
        }

        if let Some(s) = self.devices.get(device).and_then(|d| d.strings) {
            self.strings.release(s);
        }

        // A device that dies mid-enumeration must not strand the lease
        if self.enumerator.device == Some(device) {
            self.enumerator.device = None;
            self.enum_lease.release();
        }
        self.devices.release(device);
    }

    // ---- pipe management --------------------------------------------------

    pub(crate) fn create_pipe_with_callback(
        &mut self,
        device: DeviceHandle,
        kind: PipeKind,
        endpoint: u8,
        direction: Direction,
        max_packet: u16,
        interval: u32,
        callback: Callback,
    ) -> Option<PipeHandle> {
        // Isochronous is a placeholder kind only
        if matches!(kind, PipeKind::Isochronous) {
            return None;
        }
        let (speed, address, hub_address, hub_port) = {
            let d = self.devices.get(device)?;
            (d.speed, d.address, d.hub_address, d.hub_port)
        };

        let reservation = if matches!(kind, PipeKind::Interrupt) {
            match self.bandwidth.allocate(speed, direction, max_packet, interval) {
                Some(r) => Some(r),
                None => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("interrupt pipe rejected: periodic bandwidth exhausted");
                    return None;
                }
            }
        } else {
            None
        };

        let halt = match self.transfers.acquire(Transfer::new_halt()) {
            Some(h) => h,
            None => {
                if let Some(r) = &reservation {
                    self.bandwidth.release(r);
                }
                return None;
            }
        };

        let pipe = Pipe {
            qh: QueueHead::new(),
            kind,
            direction,
            device,
            max_packet,
            callback,
            reservation,
            halt: Some(halt),
            next_async: None,
            next_on_device: None,
            deferred: None,
        };
        let pipe_h = match self.pipes.acquire(pipe) {
            Some(p) => p,
            None => {
                self.transfers.release(halt);
                if let Some(r) = &reservation {
                    self.bandwidth.release(r);
                }
                return None;
            }
        };

        // Program the queue head now that it has its final address
        {
            let is_control = matches!(kind, PipeKind::Control);
            let p = self.pipes.get(pipe_h)?;
            use core::sync::atomic::Ordering;
            p.qh.endpoint_chars.store(
                QueueHead::make_endpoint_chars(address, endpoint, speed, max_packet, is_control),
                Ordering::Relaxed,
            );
            p.qh
                .endpoint_caps
                .store(QueueHead::make_endpoint_caps(hub_address, hub_port, 1), Ordering::Relaxed);
            if let Some(halt_qtd) = self.transfers.get(halt) {
                p.qh.rearm(&halt_qtd.qtd);
            }
        }
        if let Some(t) = self.transfers.get_mut(halt) {
            t.pipe = Some(pipe_h);
        }

        match kind {
            PipeKind::Control | PipeKind::Bulk => self.link_async(pipe_h),
            PipeKind::Interrupt => {
                if !self.link_periodic(pipe_h) {
                    // Frame-slot chains are full even though bandwidth
                    // admission said yes; reject rather than hand back a
                    // pipe the hardware would never service
                    #[cfg(feature = "defmt")]
                    defmt::warn!("interrupt pipe rejected: frame slots full");
                    if let Some(r) = self.pipes.get(pipe_h).and_then(|p| p.reservation) {
                        self.bandwidth.release(&r);
                    }
                    self.transfers.release(halt);
                    self.pipes.release(pipe_h);
                    return None;
                }
            }
            PipeKind::Isochronous => unreachable!(),
        }

        if !matches!(kind, PipeKind::Control) {
            let old_head = self.devices.get(device).and_then(|d| d.first_pipe);
            if let Some(p) = self.pipes.get_mut(pipe_h) {
                p.next_on_device = old_head;
            }
            if let Some(d) = self.devices.get_mut(device) {
                d.first_pipe = Some(pipe_h);
            }
        }

        Some(pipe_h)
    }

    /// Splice a queue head into the circular asynchronous list
    fn link_async(&mut self, pipe_h: PipeHandle) {
        let saved = self.controller.mask_interrupts();
        match self.async_head {
            None => {
                if let Some(p) = self.pipes.get_mut(pipe_h) {
                    p.next_async = Some(pipe_h);
                    p.qh.set_head_of_list(true);
                    p.qh
                        .horizontal_link
                        .store(p.qh.link_to(), core::sync::atomic::Ordering::Release);
                }
                let addr = self.pipes.get(pipe_h).map(|p| p.qh.address()).unwrap_or(0);
                self.controller.set_async_list(addr);
                self.controller.enable_async_schedule(true);
                self.async_head = Some(pipe_h);
            }
            Some(head_h) => {
                // Insert right after the head
                let (head_next, head_link) = match self.pipes.get(head_h) {
                    Some(head) => (
                        head.next_async,
                        head.qh
                            .horizontal_link
                            .load(core::sync::atomic::Ordering::Acquire),
                    ),
                    None => (None, QueueHead::TERMINATE),
                };
                if let Some(p) = self.pipes.get_mut(pipe_h) {
                    p.next_async = head_next;
                    p.qh
                        .horizontal_link
                        .store(head_link, core::sync::atomic::Ordering::Relaxed);
                }
                let new_link = self.pipes.get(pipe_h).map(|p| p.qh.link_to()).unwrap_or(0);
                if let Some(head) = self.pipes.get_mut(head_h) {
                    head.next_async = Some(pipe_h);
                    head.qh
                        .horizontal_link
                        .store(new_link, core::sync::atomic::Ordering::Release);
                }
            }
        }
        self.async_count += 1;
        self.controller.unmask_interrupts(saved);
    }

    /// Thread an interrupt pipe into every frame slot its reservation names
    ///
    /// Returns `false` without linking anything when a needed frame slot is
    /// already at capacity; the caller unwinds the admission.
    fn link_periodic(&mut self, pipe_h: PipeHandle) -> bool {
        let reservation = match self.pipes.get(pipe_h).and_then(|p| p.reservation) {
            Some(r) => r,
            None => return false,
        };
        if let Some(p) = self.pipes.get(pipe_h) {
            p.qh.set_schedule_masks(reservation.smask(), reservation.cmask());
        }

        let saved = self.controller.mask_interrupts();
        let mut frame = reservation.offset_frame();
        while frame < PERIODIC_LIST_SIZE {
            let pipes = &self.pipes;
            let slot = &mut self.periodic_frames[frame];
            // Keep slots sorted by decreasing interval so a longer-interval
            // QH always precedes the shorter ones it shares frames with
            let pos = slot
                .iter()
                .position(|&h| {
                    pipes
                        .get(h)
                        .and_then(|p| p.reservation)
                        .map(|r| r.interval < reservation.interval)
                        .unwrap_or(true)
                })
                .unwrap_or(slot.len());
            if slot.insert(pos, pipe_h).is_err() {
                // Undo the frames already threaded; the hardware table was
                // not rebuilt yet
                for f in 0..PERIODIC_LIST_SIZE {
                    self.periodic_frames[f].retain(|&h| h != pipe_h);
                }
                self.controller.unmask_interrupts(saved);
                return false;
            }
            frame += reservation.interval_frames();
        }
        self.rebuild_periodic_links();

        if self.periodic_count == 0 {
            self.controller.enable_periodic_schedule(true);
        }
        self.periodic_count += 1;
        self.controller.unmask_interrupts(saved);
        true
    }

    /// Recompute horizontal links and frame heads from the soft frame table
    ///
    /// A QH has a single horizontal link, so pipes sharing frames must see a
    /// consistent successor in every frame; sorting by decreasing interval
    /// makes that hold for the aligned power-of-two layouts the allocator
    /// produces. A full tree-shaped periodic schedule is not attempted.
    fn rebuild_periodic_links(&mut self) {
        use core::sync::atomic::Ordering;
        for frame in 0..PERIODIC_LIST_SIZE {
            let slot = &self.periodic_frames[frame];
            match slot.first() {
                None => self.frame_list.clear_head(frame),
                Some(&first) => {
                    let addr = self.pipes.get(first).map(|p| p.qh.address()).unwrap_or(0);
                    self.frame_list.set_head(frame, addr);
                }
            }
            for i in 0..slot.len() {
                let link = match slot.get(i + 1) {
                    Some(&next) => self.pipes.get(next).map(|p| p.qh.link_to()).unwrap_or(1),
                    None => QueueHead::TERMINATE,
                };
                if let Some(p) = self.pipes.get(slot[i]) {
                    p.qh.horizontal_link.store(link, Ordering::Release);
                }
            }
        }
    }

    /// Delete a pipe, cancelling queued-but-uncompleted transfers
    ///
    /// Asynchronous pipes are parked until the Async Advance doorbell
    /// confirms the controller no longer references them; periodic pipes are
    /// unlinked from every frame slot and their bandwidth charge reversed.
    pub fn delete_pipe(&mut self, pipe_h: PipeHandle) {
        let (kind, device) = match self.pipes.get(pipe_h) {
            Some(p) => (p.kind, p.device),
            None => return,
        };
        let saved = self.controller.mask_interrupts();

        // Pull this pipe's transfers off the followup lists; they die with it
        self.quarantine_pipe_transfers(pipe_h);
        self.unlink_from_device(device, pipe_h, kind);

        match kind {
            PipeKind::Control | PipeKind::Bulk => {
                self.unlink_async(pipe_h);
                if self.async_count == 0 {
                    // Schedule fully disabled: no doorbell will ring, and the
                    // controller no longer fetches the ring
                    self.release_pipe_records(pipe_h);
                } else {
                    let _ = self.deferred_pipes.push(pipe_h);
                    self.controller.ring_async_doorbell();
                }
            }
            PipeKind::Interrupt => {
                for frame in 0..PERIODIC_LIST_SIZE {
                    self.periodic_frames[frame].retain(|&h| h != pipe_h);
                }
                self.rebuild_periodic_links();
                if let Some(r) = self.pipes.get(pipe_h).and_then(|p| p.reservation) {
                    self.bandwidth.release(&r);
                }
                self.periodic_count = self.periodic_count.saturating_sub(1);
                if self.periodic_count == 0 {
                    self.controller.enable_periodic_schedule(false);
                }
                self.release_pipe_records(pipe_h);
            }
            PipeKind::Isochronous => {}
        }
        self.controller.unmask_interrupts(saved);
    }

    fn unlink_async(&mut self, pipe_h: PipeHandle) {
        use core::sync::atomic::Ordering;
        let next = self.pipes.get(pipe_h).and_then(|p| p.next_async);
        if next == Some(pipe_h) || next.is_none() {
            // Last pipe on the ring
            self.controller.enable_async_schedule(false);
            self.async_head = None;
            self.async_count = 0;
            return;
        }

        // Find the predecessor on the soft ring
        let mut pred = pipe_h;
        loop {
            let succ = self.pipes.get(pred).and_then(|p| p.next_async);
            if succ == Some(pipe_h) || succ.is_none() {
                break;
            }
            pred = match succ {
                Some(s) => s,
                None => break,
            };
        }

        let link = self
            .pipes
            .get(pipe_h)
            .map(|p| p.qh.horizontal_link.load(Ordering::Acquire))
            .unwrap_or(QueueHead::TERMINATE);
        if let Some(p) = self.pipes.get_mut(pred) {
            p.next_async = next;
            p.qh.horizontal_link.store(link, Ordering::Release);
        }

        if self.async_head == Some(pipe_h) {
            // Hand the reclamation-head flag to the successor
            if let Some(p) = self.pipes.get(pipe_h) {
                p.qh.set_head_of_list(false);
            }
            if let Some(n) = next {
                if let Some(p) = self.pipes.get(n) {
                    p.qh.set_head_of_list(true);
                }
            }
            self.async_head = next;
        }
        self.async_count = self.async_count.saturating_sub(1);
    }

    fn unlink_from_device(&mut self, device: DeviceHandle, pipe_h: PipeHandle, kind: PipeKind) {
        if matches!(kind, PipeKind::Control) {
            if let Some(d) = self.devices.get_mut(device) {
                if d.control_pipe == Some(pipe_h) {
                    d.control_pipe = None;
                }
            }
            return;
        }
        let mut cursor = self.devices.get(device).and_then(|d| d.first_pipe);
        let mut prev: Option<PipeHandle> = None;
        while let Some(c) = cursor {
            let next = self.pipes.get(c).and_then(|p| p.next_on_device);
            if c == pipe_h {
                match prev {
                    None => {
                        if let Some(d) = self.devices.get_mut(device) {
                            d.first_pipe = next;
                        }
                    }
                    Some(p) => {
                        if let Some(pp) = self.pipes.get_mut(p) {
                            pp.next_on_device = next;
                        }
                    }
                }
                return;
            }
            prev = Some(c);
            cursor = next;
        }
    }

    /// Move the pipe's followup transfers onto its deferred chain
    fn quarantine_pipe_transfers(&mut self, pipe_h: PipeHandle) {
        for periodic in [false, true] {
            loop {
                let victim = self.find_followup(periodic, |t| t.pipe == Some(pipe_h));
                match victim {
                    Some(t_h) => {
                        self.followup_detach(periodic, t_h);
                        let old = self.pipes.get(pipe_h).and_then(|p| p.deferred);
                        if let Some(t) = self.transfers.get_mut(t_h) {
                            t.followup_next = old;
                        }
                        if let Some(p) = self.pipes.get_mut(pipe_h) {
                            p.deferred = Some(t_h);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    /// Release a cancelled pipe's records: deferred transfers, halt, pipe
    fn release_pipe_records(&mut self, pipe_h: PipeHandle) {
        let mut cursor = self.pipes.get(pipe_h).and_then(|p| p.deferred);
        while let Some(t_h) = cursor {
            cursor = self.transfers.get(t_h).and_then(|t| t.followup_next);
            self.transfers.release(t_h);
        }
        if let Some(halt) = self.pipes.get(pipe_h).and_then(|p| p.halt) {
            self.transfers.release(halt);
        }
        self.pipes.release(pipe_h);
    }

    // ---- transfer queueing -----------------------------------------------

    /// Queue a control transfer on `device`'s control pipe
    ///
    /// Builds the SETUP / optional DATA / STATUS chain with chapter-9 data
    /// toggles and appends it without disturbing in-flight work.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid and unmoved until the completion callback
    /// runs; it may be null only when `setup.wLength` is zero.
    pub(crate) unsafe fn queue_control_transfer(
        &mut self,
        device: DeviceHandle,
        setup: SetupPacket,
        buffer: *mut u8,
        callback: Callback,
    ) -> Result<()> {
        let length = setup.wLength as usize;
        // Caller-contract violation: rejected before any hardware state moves
        if length > TransferDescriptor::MAX_TRANSFER_BYTES {
            return Err(UsbError::InvalidParameter);
        }
        if length > 0 && buffer.is_null() {
            return Err(UsbError::InvalidParameter);
        }
        let pipe_h = self
            .devices
            .get(device)
            .and_then(|d| d.control_pipe)
            .ok_or(UsbError::InvalidState)?;

        let data_in = setup.bmRequestType & 0x80 != 0;

        // SETUP stage: DATA0, DMAs the embedded setup copy
        let setup_h = self
            .transfers
            .acquire(Transfer::new_stage(token::PID_SETUP, core::ptr::null_mut(), 8, false))
            .ok_or(UsbError::NoResources)?;
        if let Some(t) = self.transfers.get_mut(setup_h) {
            t.setup = setup;
            t.is_control = true;
            t.is_setup_stage = true;
            t.pipe = Some(pipe_h);
        }
        self.point_at_embedded_setup(setup_h);

        // Optional DATA stage: DATA1, direction from bmRequestType
        let data_h = if length > 0 {
            let pid = if data_in { token::PID_IN } else { token::PID_OUT };
            match self.transfers.acquire(Transfer::new_stage(pid, buffer, length, true)) {
                Some(h) => {
                    if let Some(t) = self.transfers.get_mut(h) {
                        t.setup = setup;
                        t.is_control = true;
                        t.pipe = Some(pipe_h);
                        t.qtd.set_buffer(buffer as usize as u32, length);
                    }
                    Some(h)
                }
                None => {
                    self.transfers.release(setup_h);
                    return Err(UsbError::NoResources);
                }
            }
        } else {
            None
        };

        // STATUS stage: DATA1, opposite direction, carries the callback
        let status_pid = if length > 0 && data_in {
            token::PID_OUT
        } else {
            token::PID_IN
        };
        let status_h = match self
            .transfers
            .acquire(Transfer::new_stage(status_pid, core::ptr::null_mut(), 0, true))
        {
            Some(h) => h,
            None => {
                self.transfers.release(setup_h);
                if let Some(d) = data_h {
                    self.transfers.release(d);
                }
                return Err(UsbError::NoResources);
            }
        };
        if let Some(t) = self.transfers.get_mut(status_h) {
            t.setup = setup;
            t.is_control = true;
            t.pipe = Some(pipe_h);
            t.notify = true;
            t.callback = callback;
            // The event reports the data stage's buffer
            t.buffer = buffer;
            t.length = length;
            t.qtd.token.fetch_or(token::INTERRUPT_ON_COMPLETE, core::sync::atomic::Ordering::Relaxed);
        }

        // Chain the stages
        match data_h {
            Some(d) => {
                self.chain(setup_h, d);
                self.chain(d, status_h);
            }
            None => self.chain(setup_h, status_h),
        }

        self.append_chain(pipe_h, setup_h, status_h)
    }

    /// Queue a bulk or interrupt transfer on `pipe`
    ///
    /// `length` is split into hardware-transfer-sized chunks; only the final
    /// chunk interrupts on completion and triggers the pipe's callback.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid and unmoved until the completion callback
    /// runs.
    pub unsafe fn queue_data_transfer(
        &mut self,
        pipe_h: PipeHandle,
        buffer: *mut u8,
        length: usize,
    ) -> Result<()> {
        let (kind, direction, callback) = {
            let p = self.pipes.get(pipe_h).ok_or(UsbError::InvalidState)?;
            (p.kind, p.direction, p.callback)
        };
        if !matches!(kind, PipeKind::Bulk | PipeKind::Interrupt) {
            return Err(UsbError::InvalidParameter);
        }
        if length > 0 && buffer.is_null() {
            return Err(UsbError::InvalidParameter);
        }
        let pid = match direction {
            Direction::In => token::PID_IN,
            Direction::Out => token::PID_OUT,
        };

        let mut first: Option<TransferHandle> = None;
        let mut prev: Option<TransferHandle> = None;
        let mut offset = 0usize;
        loop {
            let chunk = (length - offset).min(TransferDescriptor::MAX_TRANSFER_BYTES);
            let chunk_buf = if length == 0 {
                core::ptr::null_mut()
            } else {
                buffer.wrapping_add(offset)
            };
            let h = match self.transfers.acquire(Transfer::new_stage(pid, chunk_buf, chunk, false)) {
                Some(h) => h,
                None => {
                    // Roll the partial chain back; nothing touched hardware yet
                    let mut cursor = first;
                    while let Some(c) = cursor {
                        cursor = self.transfers.get(c).and_then(|t| t.next);
                        self.transfers.release(c);
                    }
                    return Err(UsbError::NoResources);
                }
            };
            if let Some(t) = self.transfers.get_mut(h) {
                t.pipe = Some(pipe_h);
                if !chunk_buf.is_null() {
                    t.qtd.set_buffer(chunk_buf as usize as u32, chunk);
                }
            }
            if first.is_none() {
                first = Some(h);
            }
            if let Some(p) = prev {
                self.chain(p, h);
            }
            prev = Some(h);

            offset += chunk;
            if offset >= length {
                break;
            }
        }

        let first = first.ok_or(UsbError::InvalidState)?;
        let last = prev.ok_or(UsbError::InvalidState)?;
        if let Some(t) = self.transfers.get_mut(last) {
            t.notify = true;
            t.callback = callback;
            // Report the whole operation, not the final chunk
            t.buffer = buffer;
            t.length = length;
            t.qtd.token.fetch_or(token::INTERRUPT_ON_COMPLETE, core::sync::atomic::Ordering::Relaxed);
        }

        self.append_chain(pipe_h, first, last)
    }

    /// Link `b` after `a`, hardware pointer and soft mirror together
    fn chain(&mut self, a: TransferHandle, b: TransferHandle) {
        let addr = self.transfers.get(b).map(|t| t.qtd.address()).unwrap_or(1);
        if let Some(t) = self.transfers.get_mut(a) {
            t.qtd.next.store(addr, core::sync::atomic::Ordering::Relaxed);
            t.next = Some(b);
        }
    }

    /// Re-point a SETUP stage's buffer at its own embedded setup copy
    fn point_at_embedded_setup(&mut self, t_h: TransferHandle) {
        if let Some(t) = self.transfers.get(t_h) {
            let addr = core::ptr::addr_of!(t.setup) as usize as u32;
            t.qtd.set_buffer(addr, 8);
        }
    }

    /// Append a built chain to a pipe already being serviced by hardware
    ///
    /// The pipe's reserved halt descriptor becomes the first new descriptor:
    /// its non-token fields are rewritten, the chain is linked behind it, the
    /// chain's old first record is recycled as the new tail halt, and only
    /// then is the saved token stored, atomically publishing the whole chain.
    /// The controller never observes a partially built chain.
    fn append_chain(
        &mut self,
        pipe_h: PipeHandle,
        first_h: TransferHandle,
        last_h: TransferHandle,
    ) -> Result<()> {
        use core::sync::atomic::Ordering;
        let halt_h = self
            .pipes
            .get(pipe_h)
            .and_then(|p| p.halt)
            .ok_or(UsbError::InvalidState)?;
        let periodic = self
            .pipes
            .get(pipe_h)
            .map(|p| matches!(p.kind, PipeKind::Interrupt))
            .unwrap_or(false);

        // Snapshot the chain head's hardware and soft fields
        let (first_token, first_next_hw, first_pages, first_soft) = {
            let f = self.transfers.get(first_h).ok_or(UsbError::InvalidState)?;
            let mut pages = [0u32; 5];
            for (i, p) in f.qtd.buffer_pages.iter().enumerate() {
                pages[i] = p.load(Ordering::Relaxed);
            }
            (
                f.qtd.token.load(Ordering::Relaxed),
                f.qtd.next.load(Ordering::Relaxed),
                pages,
                (f.next, f.buffer, f.length, f.setup, f.is_control, f.is_setup_stage, f.notify, f.callback),
            )
        };

        let saved = self.controller.mask_interrupts();

        // The old halt record becomes the chain head, token still halted
        if let Some(h) = self.transfers.get_mut(halt_h) {
            h.qtd.next.store(first_next_hw, Ordering::Relaxed);
            h.qtd.alt_next.store(TransferDescriptor::TERMINATE, Ordering::Relaxed);
            for (i, p) in h.qtd.buffer_pages.iter().enumerate() {
                p.store(first_pages[i], Ordering::Relaxed);
            }
            h.pipe = Some(pipe_h);
            h.next = first_soft.0;
            h.buffer = first_soft.1;
            h.length = first_soft.2;
            h.setup = first_soft.3;
            h.is_control = first_soft.4;
            h.is_setup_stage = first_soft.5;
            h.notify = first_soft.6;
            h.callback = first_soft.7;
        }
        if first_soft.5 {
            // The embedded setup copy moved with the soft fields
            self.point_at_embedded_setup(halt_h);
        }

        // Recycle the chain's first record as the new tail halt
        if let Some(f) = self.transfers.get_mut(first_h) {
            f.qtd.token.store(token::STATUS_HALTED, Ordering::Relaxed);
            f.qtd.next.store(TransferDescriptor::TERMINATE, Ordering::Relaxed);
            f.qtd.alt_next.store(TransferDescriptor::TERMINATE, Ordering::Relaxed);
            f.pipe = Some(pipe_h);
            f.next = None;
            f.buffer = core::ptr::null_mut();
            f.length = 0;
            f.is_control = false;
            f.is_setup_stage = false;
            f.notify = false;
            f.callback = Callback::None;
        }

        // Link the chain tail to the new halt
        let tail = if last_h == first_h { halt_h } else { last_h };
        self.chain(tail, first_h);
        if let Some(p) = self.pipes.get_mut(pipe_h) {
            p.halt = Some(first_h);
        }

        // Everything now on the live chain joins the followup list
        let mut cursor = Some(halt_h);
        while let Some(c) = cursor {
            if c == first_h {
                break;
            }
            let next = self.transfers.get(c).and_then(|t| t.next);
            self.followup_push(periodic, c);
            cursor = next;
        }

        // Final step: publish the saved token; the chain goes live here
        if let Some(h) = self.transfers.get(halt_h) {
            h.qtd.token.store(first_token, Ordering::Release);
        }

        self.controller.unmask_interrupts(saved);
        Ok(())
    }

    // ---- followup lists ---------------------------------------------------

    fn followup_list(&mut self, periodic: bool) -> &mut FollowupList {
        if periodic {
            &mut self.periodic_followup
        } else {
            &mut self.async_followup
        }
    }

    fn followup_push(&mut self, periodic: bool, t_h: TransferHandle) {
        let tail = self.followup_list(periodic).tail;
        if let Some(t) = self.transfers.get_mut(t_h) {
            t.followup_prev = tail;
            t.followup_next = None;
        }
        match tail {
            Some(old) => {
                if let Some(t) = self.transfers.get_mut(old) {
                    t.followup_next = Some(t_h);
                }
            }
            None => self.followup_list(periodic).head = Some(t_h),
        }
        self.followup_list(periodic).tail = Some(t_h);
    }

    fn followup_detach(&mut self, periodic: bool, t_h: TransferHandle) {
        let (prev, next) = match self.transfers.get(t_h) {
            Some(t) => (t.followup_prev, t.followup_next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(t) = self.transfers.get_mut(p) {
                    t.followup_next = next;
                }
            }
            None => self.followup_list(periodic).head = next,
        }
        match next {
            Some(n) => {
                if let Some(t) = self.transfers.get_mut(n) {
                    t.followup_prev = prev;
                }
            }
            None => self.followup_list(periodic).tail = prev,
        }
        if let Some(t) = self.transfers.get_mut(t_h) {
            t.followup_prev = None;
            t.followup_next = None;
        }
    }

    fn find_followup(
        &self,
        periodic: bool,
        mut pred: impl FnMut(&Transfer) -> bool,
    ) -> Option<TransferHandle> {
        let mut cursor = if periodic {
            self.periodic_followup.head
        } else {
            self.async_followup.head
        };
        while let Some(c) = cursor {
            let t = self.transfers.get(c)?;
            if pred(t) {
                return Some(c);
            }
            cursor = t.followup_next;
        }
        None
    }

    // ---- completion reaping ----------------------------------------------

    /// Reap retired transfers from both followup lists
    fn reap_followups(&mut self) {
        self.reap_list(false);
        self.reap_list(true);
    }

    fn reap_list(&mut self, periodic: bool) {
        let mut cursor = if periodic {
            self.periodic_followup.head
        } else {
            self.async_followup.head
        };
        while let Some(t_h) = cursor {
            let (next, active, halted) = match self.transfers.get(t_h) {
                Some(t) => (t.followup_next, t.qtd.is_active(), t.qtd.is_halted()),
                None => break,
            };
            cursor = next;
            if active || halted {
                // Halted descriptors are the error path's business
                continue;
            }
            self.followup_detach(periodic, t_h);
            self.retire(t_h);
        }
    }

    /// Detach-free one retired transfer and dispatch its callback
    fn retire(&mut self, t_h: TransferHandle) {
        let (event, callback, notify) = match self.transfers.get(t_h) {
            Some(t) => {
                let pipe = match t.pipe {
                    Some(p) => p,
                    None => {
                        self.transfers.release(t_h);
                        return;
                    }
                };
                let token_bits = t.qtd.token.load(core::sync::atomic::Ordering::Acquire);
                let remaining = t.qtd.remaining_bytes();
                let event = TransferEvent {
                    pipe,
                    setup: if t.is_control { Some(t.setup) } else { None },
                    buffer: t.buffer,
                    requested: t.length,
                    actual: t.length.saturating_sub(remaining),
                    status: decode_token_status(token_bits),
                };
                (event, t.callback, t.notify)
            }
            None => return,
        };
        self.transfers.release(t_h);
        if notify {
            self.dispatch(callback, event);
        }
    }

    fn dispatch(&mut self, callback: Callback, event: TransferEvent) {
        match callback {
            Callback::None => {}
            Callback::Enumeration => self.enumeration_transition(&event),
            Callback::Driver(id) => {
                let control = event.setup.is_some();
                self.with_driver(id, |drv, host| {
                    if control {
                        drv.control(host, &event);
                    } else {
                        drv.transfer_complete(host, &event);
                    }
                });
            }
        }
    }

    pub(crate) fn with_driver<R>(
        &mut self,
        id: DriverId,
        f: impl FnOnce(&mut dyn UsbDriver, &mut dyn HostOps) -> R,
    ) -> Option<R> {
        let driver = self.drivers.get_mut(id.index())?.driver.take()?;
        let prev = self.dispatching.replace(id);
        let result = f(driver, self);
        self.dispatching = prev;
        self.drivers[id.index()].driver = Some(driver);
        Some(result)
    }

    pub(crate) fn bind_driver(&mut self, id: DriverId, device: DeviceHandle) {
        self.drivers[id.index()].device = Some(device);
        if let Some(d) = self.devices.get_mut(device) {
            let _ = d.drivers.push(id);
        }
    }

    pub(crate) fn driver_is_bound(&self, id: DriverId) -> bool {
        self.drivers[id.index()].device.is_some()
    }

    pub(crate) fn registered_drivers(&self) -> usize {
        self.driver_count
    }

    // ---- halt recovery ----------------------------------------------------

    /// Handle a USB error interrupt: quarantine, repair, then notify
    ///
    /// Completed-but-halted descriptors are split from those merely stranded
    /// behind the halt; the pipe is rebuilt and re-enabled around the first
    /// still-pending descriptor *before* any driver callback runs, so a
    /// callback may immediately re-queue.
    fn recover_halted(&mut self) {
        for periodic in [false, true] {
            let mut halted_pipes: heapless::Vec<PipeHandle, 8> = heapless::Vec::new();
            let mut cursor = if periodic {
                self.periodic_followup.head
            } else {
                self.async_followup.head
            };
            while let Some(t_h) = cursor {
                let (next, pipe) = match self.transfers.get(t_h) {
                    Some(t) => (t.followup_next, t.pipe),
                    None => break,
                };
                cursor = next;
                if let Some(p) = pipe {
                    let pipe_halted = self
                        .pipes
                        .get(p)
                        .map(|pp| pp.qh.is_halted())
                        .unwrap_or(false);
                    if pipe_halted && !halted_pipes.contains(&p) {
                        let _ = halted_pipes.push(p);
                    }
                }
            }
            for p in halted_pipes {
                self.repair_pipe(periodic, p);
            }
        }
    }

    fn repair_pipe(&mut self, periodic: bool, pipe_h: PipeHandle) {
        // Partition this pipe's followup transfers
        let mut quarantined: heapless::Vec<TransferHandle, 8> = heapless::Vec::new();
        let mut first_pending: Option<TransferHandle> = None;
        let mut cursor = if periodic {
            self.periodic_followup.head
        } else {
            self.async_followup.head
        };
        while let Some(t_h) = cursor {
            let (next, pipe, active) = match self.transfers.get(t_h) {
                Some(t) => (t.followup_next, t.pipe, t.qtd.is_active()),
                None => break,
            };
            cursor = next;
            if pipe != Some(pipe_h) {
                continue;
            }
            if active {
                if first_pending.is_none() {
                    first_pending = Some(t_h);
                }
            } else if quarantined.push(t_h).is_err() {
                break;
            }
        }

        #[cfg(feature = "defmt")]
        defmt::warn!(
            "halted pipe: {} retired, repairing around {} pending",
            quarantined.len(),
            first_pending.is_some() as u8
        );

        // Repair first: rebuild the chain from the first still-pending
        // descriptor (or the halt marker) and clear the halt condition.
        let target = first_pending.or_else(|| self.pipes.get(pipe_h).and_then(|p| p.halt));
        if let (Some(p), Some(t)) = (self.pipes.get(pipe_h), target.and_then(|t| self.transfers.get(t))) {
            p.qh.rearm(&t.qtd);
        }

        // Only now invoke the quarantined descriptors' callbacks. If a new
        // halt lands between the rearm above and these callbacks, the next
        // error interrupt repeats the partition; that overlap window is a
        // known limitation and is left as-is.
        for t_h in quarantined {
            self.followup_detach(periodic, t_h);
            self.retire(t_h);
        }
    }

    // ---- interrupt entry point -------------------------------------------

    /// Service the host controller interrupt
    ///
    /// Decodes USBSTS once and runs, in order: halted-pipe recovery,
    /// completion reaping, doorbell-deferred reclamation, root-port changes,
    /// port sequencing (timer 0), and driver timers (timer 1).
    pub fn on_interrupt(&mut self) {
        let status = self.controller.read_and_clear_status();

        if status.contains(UsbSts::USB_ERROR_INTERRUPT) {
            self.recover_halted();
        }
        if status.intersects(UsbSts::USB_INTERRUPT | UsbSts::USB_ERROR_INTERRUPT) {
            self.reap_followups();
        }
        if status.contains(UsbSts::ASYNC_ADVANCE) {
            self.drain_deferred_pipes();
        }
        if status.contains(UsbSts::PORT_CHANGE_DETECT) {
            self.port_change();
        }
        if status.contains(UsbSts::TIMER0_INTERRUPT) {
            self.port_timer_fired();
        }
        if status.contains(UsbSts::TIMER1_INTERRUPT) {
            self.driver_timer_fired();
        }
    }

    fn drain_deferred_pipes(&mut self) {
        while let Some(pipe_h) = self.deferred_pipes.pop() {
            self.release_pipe_records(pipe_h);
        }
    }

    // ---- driver timers ----------------------------------------------------

    fn apply_timer_action(&mut self, action: Reprogram) {
        match action {
            Reprogram::Keep => {}
            Reprogram::Stop => self.controller.timer_stop(GpTimer::Driver),
            Reprogram::Start(us) => self.controller.timer_start(GpTimer::Driver, us),
        }
    }

    fn driver_timer_fired(&mut self) {
        if let Some((driver, payload, action)) = self.timers.fire() {
            self.apply_timer_action(action);
            self.with_driver(driver, |drv, host| drv.timer_event(host, payload));
        }
    }

    // ---- root port sequencing --------------------------------------------

    fn port_change(&mut self) {
        let sc = self.controller.port_status();
        if !sc.contains(PortSc::CONNECT_STATUS_CHANGE) {
            return;
        }
        if sc.contains(PortSc::CURRENT_CONNECT_STATUS) {
            if self.port == PortState::Disconnected {
                self.port = PortState::Debounce;
                self.controller.timer_start(GpTimer::Port, DEBOUNCE_US);
            }
        } else {
            #[cfg(feature = "defmt")]
            defmt::info!("root port disconnect");
            self.controller.timer_stop(GpTimer::Port);
            if self.port == PortState::Resetting || self.port == PortState::Recovery {
                self.reset_lease.release();
            }
            self.port = PortState::Disconnected;
            if let Some(d) = self.root_device.take() {
                self.detach_device(d);
            }
        }
    }

    fn port_timer_fired(&mut self) {
        match self.port {
            PortState::Debounce => {
                // Only one device may be in reset/recovery at a time
                if self.reset_lease.try_acquire() {
                    self.port = PortState::Resetting;
                    self.controller.set_port_reset(true);
                    self.controller.timer_start(GpTimer::Port, RESET_US);
                } else {
                    self.controller.timer_start(GpTimer::Port, ATTACH_RETRY_US);
                }
            }
            PortState::Resetting => {
                self.controller.set_port_reset(false);
                self.port = PortState::Recovery;
                self.controller.timer_start(GpTimer::Port, RECOVERY_US);
            }
            PortState::Recovery => {
                self.reset_lease.release();
                let speed = self.controller.port_status().speed();
                match self.attach_device(speed, 0, 0) {
                    Some(d) => {
                        self.root_device = Some(d);
                        self.port = PortState::Active;
                    }
                    None => {
                        // Enumeration busy (a hub device downstream, or pools
                        // exhausted); retry without re-resetting
                        self.controller.timer_start(GpTimer::Port, ATTACH_RETRY_US);
                    }
                }
            }
            PortState::Disconnected | PortState::Active => {}
        }
    }
}

#[cfg(test)]
impl<
        C: HostController,
        const DEVICES: usize,
        const PIPES: usize,
        const TRANSFERS: usize,
        const TIMERS: usize,
        const STRINGS: usize,
        const DRIVERS: usize,
    > UsbHost<C, DEVICES, PIPES, TRANSFERS, TIMERS, STRINGS, DRIVERS>
{
    /// Still-active transfers of `pipe`, in followup order
    pub(crate) fn test_pending_transfers(&self, pipe: PipeHandle) -> heapless::Vec<TransferHandle, 16> {
        let mut out = heapless::Vec::new();
        for periodic in [false, true] {
            let mut cursor = if periodic {
                self.periodic_followup.head
            } else {
                self.async_followup.head
            };
            while let Some(c) = cursor {
                let t = match self.transfers.get(c) {
                    Some(t) => t,
                    None => break,
                };
                if t.pipe == Some(pipe) && t.qtd.is_active() {
                    let _ = out.push(c);
                }
                cursor = t.followup_next;
            }
        }
        out
    }

    /// Simulate hardware finishing the in-flight control chain on `device`
    ///
    /// IN data stages receive `response` (written into the enumeration
    /// buffer, which is where enumeration points them); every stage's active
    /// bit clears.
    pub(crate) fn test_complete_control(&mut self, device: DeviceHandle, response: &[u8]) {
        use core::sync::atomic::Ordering;
        let pipe = match self.devices.get(device).and_then(|d| d.control_pipe) {
            Some(p) => p,
            None => return,
        };
        let stages = self.test_pending_transfers(pipe);
        for t_h in stages {
            let tok = match self.transfers.get(t_h) {
                Some(t) => t.qtd.token.load(Ordering::Relaxed),
                None => continue,
            };
            let qlen = ((tok >> token::TOTAL_BYTES_SHIFT) & token::TOTAL_BYTES_MASK) as usize;
            let mut new_tok = tok & !token::STATUS_ACTIVE;
            if tok & token::PID_MASK == token::PID_IN && qlen > 0 {
                let n = response.len().min(qlen).min(self.enumerator.buffer.len());
                self.enumerator.buffer[..n].copy_from_slice(&response[..n]);
                new_tok &= !(token::TOTAL_BYTES_MASK << token::TOTAL_BYTES_SHIFT);
                new_tok |= ((qlen - n) as u32) << token::TOTAL_BYTES_SHIFT;
            }
            if let Some(t) = self.transfers.get(t_h) {
                t.qtd.token.store(new_tok, Ordering::Release);
            }
        }
    }
}

/// Decode a retired qTD status token
fn decode_token_status(bits: u32) -> Result<()> {
    if bits & token::STATUS_HALTED != 0 {
        if bits & token::STATUS_BABBLE != 0 {
            Err(UsbError::Babble)
        } else if bits & token::STATUS_DATA_BUFFER_ERROR != 0 {
            Err(UsbError::BufferOverflow)
        } else if bits & token::STATUS_TRANSACTION_ERROR != 0 {
            Err(UsbError::TransactionError)
        } else {
            Err(UsbError::Stall)
        }
    } else if bits & token::STATUS_MISSED_MICROFRAME != 0 {
        Err(UsbError::MissedMicroframe)
    } else {
        Ok(())
    }
}

/// Cooperative-yield spin wait
///
/// Non-blocking queue calls pair with this when a caller genuinely needs a
/// result before continuing: poll a completion flag set by a callback,
/// yielding to other cooperative tasks between polls, until done or timed
/// out.
pub fn wait_until(
    mut done: impl FnMut() -> bool,
    mut yield_now: impl FnMut(),
    mut timed_out: impl FnMut() -> bool,
) -> Result<()> {
    while !done() {
        if timed_out() {
            return Err(UsbError::Timeout);
        }
        yield_now();
    }
    Ok(())
}

impl<
        C: HostController,
        const DEVICES: usize,
        const PIPES: usize,
        const TRANSFERS: usize,
        const TIMERS: usize,
        const STRINGS: usize,
        const DRIVERS: usize,
    > HostOps for UsbHost<C, DEVICES, PIPES, TRANSFERS, TIMERS, STRINGS, DRIVERS>
{
    fn create_pipe(
        &mut self,
        device: DeviceHandle,
        kind: PipeKind,
        endpoint: u8,
        direction: Direction,
        max_packet: u16,
        interval: u32,
    ) -> Option<PipeHandle> {
        let callback = match self.dispatching {
            Some(id) => Callback::Driver(id),
            None => Callback::None,
        };
        self.create_pipe_with_callback(device, kind, endpoint, direction, max_packet, interval, callback)
    }

    fn delete_pipe(&mut self, pipe: PipeHandle) {
        UsbHost::delete_pipe(self, pipe);
    }

    unsafe fn queue_control_transfer(
        &mut self,
        device: DeviceHandle,
        setup: SetupPacket,
        buffer: *mut u8,
    ) -> Result<()> {
        let callback = match self.dispatching {
            Some(id) => Callback::Driver(id),
            None => Callback::None,
        };
        unsafe { UsbHost::queue_control_transfer(self, device, setup, buffer, callback) }
    }

    unsafe fn queue_data_transfer(
        &mut self,
        pipe: PipeHandle,
        buffer: *mut u8,
        length: usize,
    ) -> Result<()> {
        unsafe { UsbHost::queue_data_transfer(self, pipe, buffer, length) }
    }

    fn timer_start(&mut self, payload: u32, micros: u32) -> Option<TimerHandle> {
        let driver = self.dispatching?;
        let remaining = self.controller.timer_remaining(GpTimer::Driver);
        let (handle, action) = self.timers.start(driver, payload, micros, remaining)?;
        self.apply_timer_action(action);
        Some(handle)
    }

    fn timer_stop(&mut self, timer: TimerHandle) {
        let remaining = self.controller.timer_remaining(GpTimer::Driver);
        let action = self.timers.stop(timer, remaining);
        self.apply_timer_action(action);
    }

    fn device_info(&self, device: DeviceHandle) -> Option<DeviceInfo> {
        UsbHost::device_info(self, device)
    }
}
