//! Mock hardware capability for integration tests

use imxrt_ehci_host::ehci::{GpTimer, HostController, PortSc, UsbIntr, UsbSts};

/// Register-block stand-in: records what the engine programs and hands back
/// whatever status bits a test latches. Schedule addresses are stored but
/// never dereferenced.
pub struct MockController {
    pending_status: UsbSts,
    pub interrupt_mask: UsbIntr,
    pub async_list: u32,
    pub periodic_base: u32,
    pub async_enabled: bool,
    pub periodic_enabled: bool,
    pub doorbell_rings: u32,
    pub portsc: PortSc,
    timers: [u32; 2],
}

impl MockController {
    pub fn new() -> Self {
        Self {
            pending_status: UsbSts::empty(),
            interrupt_mask: UsbIntr::empty(),
            async_list: 0,
            periodic_base: 0,
            async_enabled: false,
            periodic_enabled: false,
            doorbell_rings: 0,
            portsc: PortSc::empty(),
            timers: [0; 2],
        }
    }

    /// Latch status bits for the next interrupt service pass
    pub fn raise(&mut self, bits: UsbSts) {
        self.pending_status |= bits;
    }
}

impl HostController for MockController {
    fn read_and_clear_status(&mut self) -> UsbSts {
        core::mem::replace(&mut self.pending_status, UsbSts::empty())
    }

    fn set_interrupt_mask(&mut self, mask: UsbIntr) {
        self.interrupt_mask = mask;
    }

    fn mask_interrupts(&mut self) -> UsbIntr {
        core::mem::replace(&mut self.interrupt_mask, UsbIntr::empty())
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

    fn set_port_reset(&mut self, _assert: bool) {}

    fn timer_start(&mut self, timer: GpTimer, micros: u32) {
        self.timers[timer as usize] = micros;
    }

    fn timer_stop(&mut self, timer: GpTimer) {
        self.timers[timer as usize] = 0;
    }

    fn timer_remaining(&self, timer: GpTimer) -> u32 {
        self.timers[timer as usize]
    }

    fn frame_index(&self) -> u32 {
        0
    }
}
