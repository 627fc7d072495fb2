//! Transfer descriptor (qTD) hardware shadow
//!
//! Based on EHCI Specification Section 3.5

use core::sync::atomic::{AtomicU32, Ordering};

/// qTD token field bit definitions
#[allow(missing_docs)]
pub mod token {
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    pub const STATUS_HALTED: u32 = 1 << 6;
    pub const STATUS_DATA_BUFFER_ERROR: u32 = 1 << 5;
    pub const STATUS_BABBLE: u32 = 1 << 4;
    pub const STATUS_TRANSACTION_ERROR: u32 = 1 << 3;
    pub const STATUS_MISSED_MICROFRAME: u32 = 1 << 2;
    pub const STATUS_SPLIT_STATE: u32 = 1 << 1;
    pub const STATUS_PING_STATE: u32 = 1 << 0;

    pub const PID_OUT: u32 = 0x0 << 8;
    pub const PID_IN: u32 = 0x1 << 8;
    pub const PID_SETUP: u32 = 0x2 << 8;
    pub const PID_MASK: u32 = 0x3 << 8;

    pub const ERROR_COUNTER_SHIFT: u32 = 10;
    pub const ERROR_COUNTER_MASK: u32 = 0x3;

    pub const CURRENT_PAGE_SHIFT: u32 = 12;
    pub const CURRENT_PAGE_MASK: u32 = 0x7;

    pub const INTERRUPT_ON_COMPLETE: u32 = 1 << 15;

    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7FFF;

    pub const DATA_TOGGLE: u32 = 1 << 31;

    /// Any of the error status bits
    pub const STATUS_ERROR_MASK: u32 = STATUS_HALTED
        | STATUS_DATA_BUFFER_ERROR
        | STATUS_BABBLE
        | STATUS_TRANSACTION_ERROR
        | STATUS_MISSED_MICROFRAME;
}

/// Transfer descriptor (qTD)
///
/// EHCI Specification Section 3.5. Hardware fields are `AtomicU32` because
/// the controller and both execution contexts (interrupt and main line) read
/// them concurrently. Must be 32-byte aligned for the controller's fetches.
#[repr(C, align(32))]
pub struct TransferDescriptor {
    /// Next qTD pointer (bits 31:5 valid, bit 0 = terminate)
    pub next: AtomicU32,

    /// Alternate next qTD pointer (short-packet path)
    pub alt_next: AtomicU32,

    /// Token: status, PID, toggle, and remaining byte count
    pub token: AtomicU32,

    /// Buffer pointer pages (up to 5 pages, 4 KiB each)
    pub buffer_pages: [AtomicU32; 5],
}

impl TransferDescriptor {
    /// Terminator bit for the next/alt-next pointers
    pub const TERMINATE: u32 = 1;

    /// Largest payload carried by a single qTD
    ///
    /// Five 4 KiB pages allow up to 20 KiB, but the maximum is held to
    /// 16 KiB so arbitrarily aligned buffers always fit the page set.
    pub const MAX_TRANSFER_BYTES: usize = 16 * 1024;

    /// Create a new inert descriptor (not active, not halted)
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(Self::TERMINATE),
            alt_next: AtomicU32::new(Self::TERMINATE),
            token: AtomicU32::new(0),
            buffer_pages: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        }
    }

    /// Create a halt descriptor: never active, parks the queue head
    pub const fn new_halted() -> Self {
        Self {
            next: AtomicU32::new(Self::TERMINATE),
            alt_next: AtomicU32::new(Self::TERMINATE),
            token: AtomicU32::new(token::STATUS_HALTED),
            buffer_pages: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        }
    }

    /// Build a token for one bus transaction chunk
    pub const fn make_token(pid: u32, len: usize, data_toggle: bool, ioc: bool) -> u32 {
        let mut t = token::STATUS_ACTIVE
            | pid
            | (3 << token::ERROR_COUNTER_SHIFT)
            | ((len as u32 & token::TOTAL_BYTES_MASK) << token::TOTAL_BYTES_SHIFT);
        if data_toggle {
            t |= token::DATA_TOGGLE;
        }
        if ioc {
            t |= token::INTERRUPT_ON_COMPLETE;
        }
        t
    }

    /// Program the buffer page pointers for `len` bytes starting at `addr`
    ///
    /// Page 0 carries the byte offset; pages 1..4 step in 4 KiB strides.
    pub fn set_buffer(&self, addr: u32, len: usize) {
        if len == 0 {
            for page in &self.buffer_pages {
                page.store(0, Ordering::Relaxed);
            }
            return;
        }
        self.buffer_pages[0].store(addr, Ordering::Relaxed);
        let mut page = addr & !0xFFF;
        for slot in self.buffer_pages.iter().skip(1) {
            page = page.wrapping_add(0x1000);
            slot.store(page, Ordering::Relaxed);
        }
    }

    /// Whether the controller still owns this descriptor
    #[inline]
    pub fn is_active(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_ACTIVE != 0
    }

    /// Whether this descriptor retired with an error
    #[inline]
    pub fn is_halted(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_HALTED != 0
    }

    /// Bytes left untransferred when the descriptor retired
    #[inline]
    pub fn remaining_bytes(&self) -> usize {
        ((self.token.load(Ordering::Acquire) >> token::TOTAL_BYTES_SHIFT)
            & token::TOTAL_BYTES_MASK) as usize
    }

    /// Physical address of this descriptor for hardware link pointers
    #[inline]
    pub fn address(&self) -> u32 {
        self as *const Self as usize as u32
    }
}

impl Default for TransferDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_fields() {
        let t = TransferDescriptor::make_token(token::PID_IN, 512, true, true);
        assert_ne!(t & token::STATUS_ACTIVE, 0);
        assert_eq!(t & token::PID_MASK, token::PID_IN);
        assert_ne!(t & token::DATA_TOGGLE, 0);
        assert_ne!(t & token::INTERRUPT_ON_COMPLETE, 0);
        assert_eq!((t >> token::TOTAL_BYTES_SHIFT) & token::TOTAL_BYTES_MASK, 512);
    }

    #[test]
    fn test_buffer_pages_follow_4k_strides() {
        let qtd = TransferDescriptor::new();
        qtd.set_buffer(0x2000_0ABC, 8192);
        assert_eq!(qtd.buffer_pages[0].load(Ordering::Relaxed), 0x2000_0ABC);
        assert_eq!(qtd.buffer_pages[1].load(Ordering::Relaxed), 0x2000_1000);
        assert_eq!(qtd.buffer_pages[2].load(Ordering::Relaxed), 0x2000_2000);
    }

    #[test]
    fn test_halted_descriptor_is_inert() {
        let qtd = TransferDescriptor::new_halted();
        assert!(!qtd.is_active());
        assert!(qtd.is_halted());
    }

    #[test]
    fn test_alignment() {
        assert_eq!(core::mem::align_of::<TransferDescriptor>(), 32);
    }
}
