//! Shared test double for the hardware capability boundary

use crate::ehci::{GpTimer, HostController, PortSc, UsbIntr, UsbSts};

/// Recording mock of the EHCI register block
///
/// Tests raise status bits and inspect what the engine programmed. Schedule
/// addresses are held but never dereferenced.
pub(crate) struct MockController {
    pending_status: UsbSts,
    pub(crate) interrupt_mask: UsbIntr,
    pub(crate) async_list: u32,
    pub(crate) periodic_base: u32,
    pub(crate) async_enabled: bool,
    pub(crate) periodic_enabled: bool,
    pub(crate) doorbell_rings: u32,
    pub(crate) portsc: PortSc,
    pub(crate) reset_asserted: bool,
    timer_remaining: [u32; 2],
    pub(crate) frame_index: u32,
}

impl MockController {
    pub(crate) fn new() -> Self {
        Self {
            pending_status: UsbSts::empty(),
            interrupt_mask: UsbIntr::empty(),
            async_list: 0,
            periodic_base: 0,
            async_enabled: false,
            periodic_enabled: false,
            doorbell_rings: 0,
            portsc: PortSc::empty(),
            reset_asserted: false,
            timer_remaining: [0; 2],
            frame_index: 0,
        }
    }

    /// Latch status bits for the next `read_and_clear_status`
    pub(crate) fn raise(&mut self, bits: UsbSts) {
        self.pending_status |= bits;
    }

    /// Simulate a device appearing or vanishing on the root port
    pub(crate) fn set_connected(&mut self, connected: bool, speed_bits: PortSc) {
        self.portsc = PortSc::CONNECT_STATUS_CHANGE | speed_bits;
        if connected {
            self.portsc |= PortSc::CURRENT_CONNECT_STATUS;
        }
        self.raise(UsbSts::PORT_CHANGE_DETECT);
    }

    fn timer_index(timer: GpTimer) -> usize {
        match timer {
            GpTimer::Port => 0,
            GpTimer::Driver => 1,
        }
    }

    /// Countdown value a test wants `timer_remaining` to report
    pub(crate) fn set_timer_remaining(&mut self, timer: GpTimer, micros: u32) {
        self.timer_remaining[Self::timer_index(timer)] = micros;
    }

    pub(crate) fn timer_loaded(&self, timer: GpTimer) -> u32 {
        self.timer_remaining[Self::timer_index(timer)]
    }
}

impl HostController for MockController {
    fn read_and_clear_status(&mut self) -> UsbSts {
        let sts = self.pending_status;
        self.pending_status = UsbSts::empty();
        sts
    }

    fn set_interrupt_mask(&mut self, mask: UsbIntr) {
        self.interrupt_mask = mask;
    }

    fn mask_interrupts(&mut self) -> UsbIntr {
        let saved = self.interrupt_mask;
        self.interrupt_mask = UsbIntr::empty();
        saved
    }

    fn unmask_interrupts(&mut self, saved: UsbIntr) {
        self.interrupt_mask = saved;
    }

    fn set_async_list(&mut self, qh_addr: u32) {
        self.async_list = qh_addr;
    }

    fn set_periodic_base(&mut self, base: u32) {
        self.periodic_base = base;
    }

    fn enable_async_schedule(&mut self, enable: bool) {
        self.async_enabled = enable;
    }

    fn enable_periodic_schedule(&mut self, enable: bool) {
        self.periodic_enabled = enable;
    }

    fn ring_async_doorbell(&mut self) {
        self.doorbell_rings += 1;
    }

    fn port_status(&self) -> PortSc {
        self.portsc
    }

    fn set_port_reset(&mut self, assert: bool) {
        self.reset_asserted = assert;
    }

    fn timer_start(&mut self, timer: GpTimer, micros: u32) {
        self.timer_remaining[Self::timer_index(timer)] = micros;
    }

    fn timer_stop(&mut self, timer: GpTimer) {
        self.timer_remaining[Self::timer_index(timer)] = 0;
    }

    fn timer_remaining(&self, timer: GpTimer) -> u32 {
        self.timer_remaining[Self::timer_index(timer)]
    }

    fn frame_index(&self) -> u32 {
        self.frame_index
    }
}
