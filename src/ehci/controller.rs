//! Hardware capability boundary
//!
//! [`HostController`] is the seam between the transfer engine and the
//! memory-mapped EHCI registers: everything the engine needs from hardware,
//! nothing more. [`EhciRegs`] implements it with volatile access for the
//! i.MX RT1062; tests substitute a mock.

use super::{PortSc, UsbCmd, UsbIntr, UsbSts};
use crate::error::{Result, UsbError};

/// The two general-purpose countdown timers on the i.MX RT USB controller
///
/// Timer 0 paces root-port debounce/reset sequencing; timer 1 is multiplexed
/// across driver timers by the delta queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpTimer {
    /// GPTIMER0: port state sequencing
    Port,
    /// GPTIMER1: driver timer delta queue
    Driver,
}

/// Capability interface over the EHCI register block
///
/// The engine is generic over this trait so the schedule logic can run
/// against real registers on target and a mock in host-side tests. All
/// methods are non-blocking register accesses.
pub trait HostController {
    /// Read USBSTS and clear the returned (write-one-to-clear) bits
    fn read_and_clear_status(&mut self) -> UsbSts;

    /// Program the interrupt enable mask
    fn set_interrupt_mask(&mut self, mask: UsbIntr);

    /// Disable all controller interrupts, returning the previous mask
    ///
    /// Paired with [`Self::unmask_interrupts`] to bracket main-line access
    /// to structures the interrupt path also mutates.
    fn mask_interrupts(&mut self) -> UsbIntr;

    /// Restore an interrupt mask saved by [`Self::mask_interrupts`]
    fn unmask_interrupts(&mut self, saved: UsbIntr);

    /// Program ASYNCLISTADDR with the address of a queue head
    fn set_async_list(&mut self, qh_addr: u32);

    /// Program PERIODICLISTBASE with the frame list base address
    fn set_periodic_base(&mut self, base: u32);

    /// Enable or disable the asynchronous schedule
    fn enable_async_schedule(&mut self, enable: bool);

    /// Enable or disable the periodic schedule
    fn enable_periodic_schedule(&mut self, enable: bool);

    /// Ring the Async Advance doorbell
    ///
    /// The controller raises [`UsbSts::ASYNC_ADVANCE`] once it has moved past
    /// any schedule structure unlinked before the ring; only then may that
    /// memory be reclaimed.
    fn ring_async_doorbell(&mut self);

    /// Read the root port status/control register
    fn port_status(&self) -> PortSc;

    /// Assert or deassert the root port reset signal
    fn set_port_reset(&mut self, assert: bool);

    /// Start a one-shot countdown of `micros` microseconds
    fn timer_start(&mut self, timer: GpTimer, micros: u32);

    /// Stop a countdown without firing
    fn timer_stop(&mut self, timer: GpTimer);

    /// Microseconds left on a running countdown (0 if stopped)
    fn timer_remaining(&self, timer: GpTimer) -> u32;

    /// Current microframe index (FRINDEX)
    fn frame_index(&self) -> u32;
}

// Register offsets from the controller base (RM 66.6)
const GPTIMER0LD: usize = 0x080;
const GPTIMER0CTRL: usize = 0x084;
const GPTIMER1LD: usize = 0x088;
const GPTIMER1CTRL: usize = 0x08C;
const USBCMD: usize = 0x140;
const USBSTS: usize = 0x144;
const USBINTR: usize = 0x148;
const FRINDEX: usize = 0x14C;
const PERIODICLISTBASE: usize = 0x154;
const ASYNCLISTADDR: usize = 0x158;
const PORTSC1: usize = 0x184;
const USBMODE: usize = 0x1A8;

// GPTIMERxCTRL bits (RM 66.6.8)
const GPT_RUN: u32 = 1 << 31;
const GPT_RESET: u32 = 1 << 30;
const GPT_COUNT_MASK: u32 = 0x00FF_FFFF;

/// Memory barrier around descriptor publication
///
/// The controller fetches schedule structures by DMA; writes to them must be
/// visible before the register write that hands them over.
#[inline(always)]
fn dma_barrier() {
    #[cfg(target_arch = "arm")]
    cortex_m::asm::dmb();
    #[cfg(not(target_arch = "arm"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Volatile register-block implementation of [`HostController`]
pub struct EhciRegs {
    base: usize,
}

impl EhciRegs {
    /// Wrap the controller at `base`
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to the register block at
    /// `base` and that clocks and the PHY are already up.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    #[inline(always)]
    fn read(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[inline(always)]
    fn write(&mut self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    /// Reset the controller and put it in host mode, running
    ///
    /// Performs HCRESET, waits for the bit to self-clear, selects host mode
    /// (USBMODE CM=0b11), then sets Run/Stop and port power.
    pub fn reset_and_run(&mut self) -> Result<()> {
        self.write(USBCMD, UsbCmd::HC_RESET.bits());
        let mut spins = 100_000u32;
        while self.read(USBCMD) & UsbCmd::HC_RESET.bits() != 0 {
            spins -= 1;
            if spins == 0 {
                return Err(UsbError::Timeout);
            }
        }

        self.write(USBMODE, 0x3); // host mode
        self.write(USBCMD, UsbCmd::RUN_STOP.bits() | (1 << 16)); // ITC = 1 microframe
        self.write(PORTSC1, PortSc::PORT_POWER.bits());
        Ok(())
    }

    fn timer_regs(timer: GpTimer) -> (usize, usize) {
        match timer {
            GpTimer::Port => (GPTIMER0LD, GPTIMER0CTRL),
            GpTimer::Driver => (GPTIMER1LD, GPTIMER1CTRL),
        }
    }
}

impl HostController for EhciRegs {
    fn read_and_clear_status(&mut self) -> UsbSts {
        let sts = UsbSts::from_bits_truncate(self.read(USBSTS));
        self.write(USBSTS, sts.bits());
        sts
    }

    fn set_interrupt_mask(&mut self, mask: UsbIntr) {
        self.write(USBINTR, mask.bits());
    }

    fn mask_interrupts(&mut self) -> UsbIntr {
        let saved = UsbIntr::from_bits_truncate(self.read(USBINTR));
        self.write(USBINTR, 0);
        saved
    }

    fn unmask_interrupts(&mut self, saved: UsbIntr) {
        dma_barrier();
        self.write(USBINTR, saved.bits());
    }

    fn set_async_list(&mut self, qh_addr: u32) {
        dma_barrier();
        self.write(ASYNCLISTADDR, qh_addr);
    }

    fn set_periodic_base(&mut self, base: u32) {
        dma_barrier();
        self.write(PERIODICLISTBASE, base);
    }

    fn enable_async_schedule(&mut self, enable: bool) {
        dma_barrier();
        let mut cmd = self.read(USBCMD);
        if enable {
            cmd |= UsbCmd::ASYNC_SCHEDULE_ENABLE.bits();
        } else {
            cmd &= !UsbCmd::ASYNC_SCHEDULE_ENABLE.bits();
        }
        self.write(USBCMD, cmd);
    }

    fn enable_periodic_schedule(&mut self, enable: bool) {
        dma_barrier();
        let mut cmd = self.read(USBCMD);
        if enable {
            cmd |= UsbCmd::PERIODIC_SCHEDULE_ENABLE.bits();
        } else {
            cmd &= !UsbCmd::PERIODIC_SCHEDULE_ENABLE.bits();
        }
        self.write(USBCMD, cmd);
    }

    fn ring_async_doorbell(&mut self) {
        let cmd = self.read(USBCMD);
        self.write(USBCMD, cmd | UsbCmd::ASYNC_ADVANCE_DOORBELL.bits());
    }

    fn port_status(&self) -> PortSc {
        PortSc::from_bits_truncate(self.read(PORTSC1))
    }

    fn set_port_reset(&mut self, assert: bool) {
        let mut portsc = self.read(PORTSC1);
        // Don't write the W1C change bits back by accident
        portsc &= !(PortSc::CONNECT_STATUS_CHANGE
            | PortSc::PORT_ENABLE_CHANGE
            | PortSc::OVER_CURRENT_CHANGE)
            .bits();
        if assert {
            portsc |= PortSc::PORT_RESET.bits();
        } else {
            portsc &= !PortSc::PORT_RESET.bits();
        }
        self.write(PORTSC1, portsc);
    }

    fn timer_start(&mut self, timer: GpTimer, micros: u32) {
        let (ld, ctrl) = Self::timer_regs(timer);
        self.write(ld, micros.min(GPT_COUNT_MASK));
        self.write(ctrl, GPT_RUN | GPT_RESET); // one-shot mode, reload and go
    }

    fn timer_stop(&mut self, timer: GpTimer) {
        let (_, ctrl) = Self::timer_regs(timer);
        self.write(ctrl, 0);
    }

    fn timer_remaining(&self, timer: GpTimer) -> u32 {
        let (_, ctrl) = Self::timer_regs(timer);
        let v = self.read(ctrl);
        if v & GPT_RUN == 0 {
            0
        } else {
            v & GPT_COUNT_MASK
        }
    }

    fn frame_index(&self) -> u32 {
        self.read(FRINDEX)
    }
}
