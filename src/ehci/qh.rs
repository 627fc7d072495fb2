//! Queue head (QH) hardware shadow
//!
//! Based on EHCI Specification Section 3.6

use super::qtd::TransferDescriptor;
use crate::driver::Speed;
use core::sync::atomic::{AtomicU32, Ordering};

/// Endpoint characteristics field bits
#[allow(missing_docs)]
pub mod endpoint {
    pub const DEVICE_ADDRESS_SHIFT: u32 = 0;
    pub const DEVICE_ADDRESS_MASK: u32 = 0x7F;

    pub const ENDPOINT_NUMBER_SHIFT: u32 = 8;
    pub const ENDPOINT_NUMBER_MASK: u32 = 0xF;

    pub const ENDPOINT_SPEED_SHIFT: u32 = 12;
    pub const ENDPOINT_SPEED_MASK: u32 = 0x3;
    pub const SPEED_FULL: u32 = 0;
    pub const SPEED_LOW: u32 = 1;
    pub const SPEED_HIGH: u32 = 2;

    pub const DATA_TOGGLE_CONTROL: u32 = 1 << 14;
    pub const HEAD_OF_LIST: u32 = 1 << 15;

    pub const MAX_PACKET_LENGTH_SHIFT: u32 = 16;
    pub const MAX_PACKET_LENGTH_MASK: u32 = 0x7FF;

    pub const CONTROL_ENDPOINT: u32 = 1 << 27;

    pub const NAK_COUNT_RELOAD_SHIFT: u32 = 28;
    pub const NAK_COUNT_RELOAD_MASK: u32 = 0xF;
}

/// Endpoint capabilities field bits
#[allow(missing_docs)]
pub mod capabilities {
    pub const INTERRUPT_SCHEDULE_MASK_SHIFT: u32 = 0;
    pub const INTERRUPT_SCHEDULE_MASK_MASK: u32 = 0xFF;

    pub const SPLIT_COMPLETION_MASK_SHIFT: u32 = 8;
    pub const SPLIT_COMPLETION_MASK_MASK: u32 = 0xFF;

    pub const HUB_ADDRESS_SHIFT: u32 = 16;
    pub const HUB_ADDRESS_MASK: u32 = 0x7F;

    pub const PORT_NUMBER_SHIFT: u32 = 23;
    pub const PORT_NUMBER_MASK: u32 = 0x7F;

    pub const MULT_SHIFT: u32 = 30;
    pub const MULT_MASK: u32 = 0x3;
}

/// Queue head (QH)
///
/// EHCI Specification Section 3.6. One per pipe; the overlay area mirrors
/// the qTD the controller is currently executing. Must be 32-byte aligned.
#[repr(C, align(32))]
pub struct QueueHead {
    /// Horizontal link pointer to next QH (bit 0 = terminate, bits 2:1 = type)
    pub horizontal_link: AtomicU32,

    /// Endpoint characteristics
    pub endpoint_chars: AtomicU32,

    /// Endpoint capabilities (split transaction masks, multiplier)
    pub endpoint_caps: AtomicU32,

    /// Current qTD pointer (overlay area begins here)
    pub current_qtd: AtomicU32,

    /// Overlay: next qTD pointer
    pub next_qtd: AtomicU32,

    /// Overlay: alternate next qTD pointer
    pub alt_next_qtd: AtomicU32,

    /// Overlay: token (status and control)
    pub token: AtomicU32,

    /// Overlay: buffer pointer pages
    pub buffer_pages: [AtomicU32; 5],
}

impl QueueHead {
    /// Horizontal link type field value for a QH
    pub const TYPE_QH: u32 = 1 << 1;

    /// Terminator bit
    pub const TERMINATE: u32 = 1;

    /// Create a new inactive queue head
    pub const fn new() -> Self {
        Self {
            horizontal_link: AtomicU32::new(Self::TERMINATE),
            endpoint_chars: AtomicU32::new(0),
            endpoint_caps: AtomicU32::new(0),
            current_qtd: AtomicU32::new(Self::TERMINATE),
            next_qtd: AtomicU32::new(Self::TERMINATE),
            alt_next_qtd: AtomicU32::new(Self::TERMINATE),
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

    /// Build the endpoint characteristics word
    ///
    /// `is_control` sets DTC (toggle carried by each qTD token) and, for
    /// full/low-speed control endpoints behind a translator, the
    /// control-endpoint flag the controller needs for the PREAMBLE/split
    /// protocol.
    pub fn make_endpoint_chars(
        address: u8,
        endpoint: u8,
        speed: Speed,
        max_packet: u16,
        is_control: bool,
    ) -> u32 {
        let speed_bits = match speed {
            Speed::Full => endpoint::SPEED_FULL,
            Speed::Low => endpoint::SPEED_LOW,
            Speed::High => endpoint::SPEED_HIGH,
        };
        let mut chars = ((address as u32) & endpoint::DEVICE_ADDRESS_MASK)
            | (((endpoint as u32) & endpoint::ENDPOINT_NUMBER_MASK)
                << endpoint::ENDPOINT_NUMBER_SHIFT)
            | (speed_bits << endpoint::ENDPOINT_SPEED_SHIFT)
            | (((max_packet as u32) & endpoint::MAX_PACKET_LENGTH_MASK)
                << endpoint::MAX_PACKET_LENGTH_SHIFT);
        if is_control {
            chars |= endpoint::DATA_TOGGLE_CONTROL;
            if !matches!(speed, Speed::High) {
                chars |= endpoint::CONTROL_ENDPOINT;
            }
        }
        chars
    }

    /// Build the endpoint capabilities word
    ///
    /// `hub_address`/`hub_port` locate the transaction translator for
    /// full/low-speed devices reached through a high-speed hub; zero for
    /// devices on the root port. The interrupt schedule masks are filled in
    /// by the periodic scheduler once an offset is chosen.
    pub fn make_endpoint_caps(hub_address: u8, hub_port: u8, mult: u8) -> u32 {
        (((hub_address as u32) & capabilities::HUB_ADDRESS_MASK) << capabilities::HUB_ADDRESS_SHIFT)
            | (((hub_port as u32) & capabilities::PORT_NUMBER_MASK)
                << capabilities::PORT_NUMBER_SHIFT)
            | (((mult as u32) & capabilities::MULT_MASK) << capabilities::MULT_SHIFT)
    }

    /// Update the device address field after SET_ADDRESS completes
    pub fn rebind_address(&self, address: u8) {
        let mut chars = self.endpoint_chars.load(Ordering::Acquire);
        chars &= !endpoint::DEVICE_ADDRESS_MASK;
        chars |= (address as u32) & endpoint::DEVICE_ADDRESS_MASK;
        self.endpoint_chars.store(chars, Ordering::Release);
    }

    /// Update the max packet length field once the real value is known
    pub fn rebind_max_packet(&self, max_packet: u16) {
        let mut chars = self.endpoint_chars.load(Ordering::Acquire);
        chars &= !(endpoint::MAX_PACKET_LENGTH_MASK << endpoint::MAX_PACKET_LENGTH_SHIFT);
        chars |= ((max_packet as u32) & endpoint::MAX_PACKET_LENGTH_MASK)
            << endpoint::MAX_PACKET_LENGTH_SHIFT;
        self.endpoint_chars.store(chars, Ordering::Release);
    }

    /// Set or clear the head-of-reclamation-list flag (async schedule)
    pub fn set_head_of_list(&self, head: bool) {
        let mut chars = self.endpoint_chars.load(Ordering::Acquire);
        if head {
            chars |= endpoint::HEAD_OF_LIST;
        } else {
            chars &= !endpoint::HEAD_OF_LIST;
        }
        self.endpoint_chars.store(chars, Ordering::Release);
    }

    /// Program the interrupt schedule masks for a periodic pipe
    pub fn set_schedule_masks(&self, smask: u8, cmask: u8) {
        let mut caps = self.endpoint_caps.load(Ordering::Acquire);
        caps &= !(capabilities::INTERRUPT_SCHEDULE_MASK_MASK
            << capabilities::INTERRUPT_SCHEDULE_MASK_SHIFT);
        caps &= !(capabilities::SPLIT_COMPLETION_MASK_MASK
            << capabilities::SPLIT_COMPLETION_MASK_SHIFT);
        caps |= (smask as u32) << capabilities::INTERRUPT_SCHEDULE_MASK_SHIFT;
        caps |= (cmask as u32) << capabilities::SPLIT_COMPLETION_MASK_SHIFT;
        self.endpoint_caps.store(caps, Ordering::Release);
    }

    /// Point the overlay at `first` and clear any stale status
    ///
    /// Used when (re)arming a pipe: the controller fetches `next_qtd` the
    /// next time it services this QH.
    pub fn rearm(&self, first: &TransferDescriptor) {
        self.current_qtd.store(Self::TERMINATE, Ordering::Relaxed);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Relaxed);
        self.token.store(0, Ordering::Relaxed);
        self.next_qtd.store(first.address(), Ordering::Release);
    }

    /// Whether the overlay shows a halted endpoint
    #[inline]
    pub fn is_halted(&self) -> bool {
        self.token.load(Ordering::Acquire) & super::token::STATUS_HALTED != 0
    }

    /// Physical address of this queue head for hardware link pointers
    #[inline]
    pub fn address(&self) -> u32 {
        self as *const Self as usize as u32
    }

    /// Horizontal link word naming this queue head
    #[inline]
    pub fn link_to(&self) -> u32 {
        self.address() | Self::TYPE_QH
    }
}

impl Default for QueueHead {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_chars_layout() {
        let chars = QueueHead::make_endpoint_chars(5, 2, Speed::High, 512, false);
        assert_eq!(chars & endpoint::DEVICE_ADDRESS_MASK, 5);
        assert_eq!((chars >> endpoint::ENDPOINT_NUMBER_SHIFT) & endpoint::ENDPOINT_NUMBER_MASK, 2);
        assert_eq!(
            (chars >> endpoint::ENDPOINT_SPEED_SHIFT) & endpoint::ENDPOINT_SPEED_MASK,
            endpoint::SPEED_HIGH
        );
        assert_eq!(
            (chars >> endpoint::MAX_PACKET_LENGTH_SHIFT) & endpoint::MAX_PACKET_LENGTH_MASK,
            512
        );
        assert_eq!(chars & endpoint::DATA_TOGGLE_CONTROL, 0);
        assert_eq!(chars & endpoint::CONTROL_ENDPOINT, 0);
    }

    #[test]
    fn test_low_speed_control_sets_translator_flag() {
        let chars = QueueHead::make_endpoint_chars(0, 0, Speed::Low, 8, true);
        assert_ne!(chars & endpoint::DATA_TOGGLE_CONTROL, 0);
        assert_ne!(chars & endpoint::CONTROL_ENDPOINT, 0);

        let hs = QueueHead::make_endpoint_chars(0, 0, Speed::High, 64, true);
        assert_ne!(hs & endpoint::DATA_TOGGLE_CONTROL, 0);
        assert_eq!(hs & endpoint::CONTROL_ENDPOINT, 0);
    }

    #[test]
    fn test_rebind_address_preserves_other_fields() {
        let qh = QueueHead::new();
        qh.endpoint_chars.store(
            QueueHead::make_endpoint_chars(0, 0, Speed::Full, 8, true),
            Ordering::Relaxed,
        );
        qh.rebind_address(9);
        let chars = qh.endpoint_chars.load(Ordering::Relaxed);
        assert_eq!(chars & endpoint::DEVICE_ADDRESS_MASK, 9);
        assert_ne!(chars & endpoint::DATA_TOGGLE_CONTROL, 0);
        assert_eq!(
            (chars >> endpoint::MAX_PACKET_LENGTH_SHIFT) & endpoint::MAX_PACKET_LENGTH_MASK,
            8
        );
    }

    #[test]
    fn test_schedule_masks() {
        let qh = QueueHead::new();
        qh.endpoint_caps
            .store(QueueHead::make_endpoint_caps(2, 3, 1), Ordering::Relaxed);
        qh.set_schedule_masks(0x01, 0x0C);
        let caps = qh.endpoint_caps.load(Ordering::Relaxed);
        assert_eq!(caps & 0xFF, 0x01);
        assert_eq!((caps >> 8) & 0xFF, 0x0C);
        assert_eq!((caps >> capabilities::HUB_ADDRESS_SHIFT) & capabilities::HUB_ADDRESS_MASK, 2);
        assert_eq!((caps >> capabilities::PORT_NUMBER_SHIFT) & capabilities::PORT_NUMBER_MASK, 3);
    }
}
