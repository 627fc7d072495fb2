//! Device enumeration state machine
//!
//! Takes a freshly reset device at address 0 through descriptor discovery,
//! address assignment, optional string reads, configuration, and driver
//! claim offering. Strictly sequential: one control transfer (or one local
//! computation) per step, driven entirely by transfer-completion callbacks.
//!
//! The step counter on the device record tracks which transition runs when
//! the in-flight transfer completes:
//!
//! | step | completed transfer          | action |
//! |------|-----------------------------|--------|
//! | 0    | 8-byte device descriptor    | set max packet, send SET_ADDRESS |
//! | 1    | SET_ADDRESS                 | rebind pipe, request 18-byte descriptor |
//! | 2    | full device descriptor      | parse IDs, branch to strings or config |
//! | 4    | language-ID list            | pick language, fetch first string |
//! | 6/8/10 | manufacturer/product/serial | store text, fetch next |
//! | 11   | 9-byte configuration header | request the full configuration |
//! | 12   | full configuration          | parse attributes, SET_CONFIGURATION |
//! | 13   | SET_CONFIGURATION           | offer to drivers (14), then done (15) |
//!
//! Only one device may be between steps 0 and 14 at a time; the engine's
//! enumeration lease enforces that, and every exit path releases it.

use crate::driver::{Callback, ClaimLevel, DriverId, TransferEvent};
use crate::ehci::HostController;
use crate::error::{Result, UsbError};
use crate::host::{DeviceHandle, StringBuffer, UsbHost};

/// Descriptor type codes (USB 2.0 Table 9-5)
const DESC_DEVICE: u8 = 1;
const DESC_CONFIGURATION: u8 = 2;
const DESC_STRING: u8 = 3;
const DESC_INTERFACE: u8 = 4;

/// Largest configuration descriptor the enumeration buffer holds
const ENUM_BUFFER_LEN: usize = 512;

/// USB Setup packet per USB 2.0 specification
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
#[allow(non_snake_case)] // USB spec field names
pub struct SetupPacket {
    /// Request type and direction
    pub bmRequestType: u8,
    /// Specific request
    pub bRequest: u8,
    /// Request-specific value
    pub wValue: u16,
    /// Request-specific index
    pub wIndex: u16,
    /// Data transfer length
    pub wLength: u16,
}

impl SetupPacket {
    /// All-zero packet, used for inert transfer records
    pub const fn zeroed() -> Self {
        Self {
            bmRequestType: 0,
            bRequest: 0,
            wValue: 0,
            wIndex: 0,
            wLength: 0,
        }
    }

    /// Standard GET_DESCRIPTOR request
    pub const fn get_descriptor(
        desc_type: u8,
        desc_index: u8,
        language_id: u16,
        length: u16,
    ) -> Self {
        Self {
            bmRequestType: 0x80, // Device-to-host, standard, device
            bRequest: 0x06,      // GET_DESCRIPTOR
            wValue: ((desc_type as u16) << 8) | (desc_index as u16),
            wIndex: language_id,
            wLength: length,
        }
    }

    /// Standard SET_ADDRESS request
    pub const fn set_address(address: u8) -> Self {
        Self {
            bmRequestType: 0x00, // Host-to-device, standard, device
            bRequest: 0x05,      // SET_ADDRESS
            wValue: address as u16,
            wIndex: 0,
            wLength: 0,
        }
    }

    /// Standard SET_CONFIGURATION request
    pub const fn set_configuration(config_value: u8) -> Self {
        Self {
            bmRequestType: 0x00, // Host-to-device, standard, device
            bRequest: 0x09,      // SET_CONFIGURATION
            wValue: config_value as u16,
            wIndex: 0,
            wLength: 0,
        }
    }

    /// Standard CLEAR_FEATURE request for endpoint halt
    pub const fn clear_halt(endpoint: u8) -> Self {
        Self {
            bmRequestType: 0x02, // Host-to-device, standard, endpoint
            bRequest: 0x01,      // CLEAR_FEATURE
            wValue: 0,           // ENDPOINT_HALT
            wIndex: endpoint as u16,
            wLength: 0,
        }
    }
}

/// USB device descriptor (18 bytes)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceDescriptor {
    /// Descriptor length in bytes (18)
    pub b_length: u8,
    /// Descriptor type (1 = device)
    pub b_descriptor_type: u8,
    /// USB release, BCD
    pub bcd_usb: u16,
    /// Device class code
    pub b_device_class: u8,
    /// Device subclass code
    pub b_device_sub_class: u8,
    /// Device protocol code
    pub b_device_protocol: u8,
    /// Endpoint 0 max packet size
    pub b_max_packet_size0: u8,
    /// Vendor ID
    pub id_vendor: u16,
    /// Product ID
    pub id_product: u16,
    /// Device release, BCD
    pub bcd_device: u16,
    /// Manufacturer string index, 0 if none
    pub i_manufacturer: u8,
    /// Product string index, 0 if none
    pub i_product: u8,
    /// Serial number string index, 0 if none
    pub i_serial_number: u8,
    /// Number of configurations
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse from raw bytes, validating length and descriptor type
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 18 || data[0] < 18 {
            return Err(UsbError::InvalidDescriptor);
        }
        if data[1] != DESC_DEVICE {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Self) })
    }
}

/// Configuration descriptor header (9 bytes)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ConfigurationDescriptor {
    /// Header length in bytes (9)
    pub b_length: u8,
    /// Descriptor type (2 = configuration)
    pub b_descriptor_type: u8,
    /// Total length including interface and endpoint descriptors
    pub w_total_length: u16,
    /// Number of interfaces
    pub b_num_interfaces: u8,
    /// Value passed to SET_CONFIGURATION
    pub b_configuration_value: u8,
    /// Configuration string index, 0 if none
    pub i_configuration: u8,
    /// Power attributes (bus/self powered, remote wakeup)
    pub bm_attributes: u8,
    /// Max current draw in 2 mA units
    pub b_max_power: u8,
}

impl ConfigurationDescriptor {
    /// Parse from raw bytes, validating length and descriptor type
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 9 || data[1] != DESC_CONFIGURATION {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Self) })
    }
}

/// Enumeration progress counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EnumerationStats {
    /// State machine activations (initial entry plus one per completed
    /// transfer)
    pub activations: u32,
    /// Control transfers issued by the machine
    pub control_transfers: u32,
}

/// Soft state of the enumeration machine
///
/// The buffer is the DMA target for every enumeration control read; it lives
/// here so its address is stable for the engine's lifetime.
pub(crate) struct Enumerator {
    /// Device currently between steps 0 and 14
    pub(crate) device: Option<DeviceHandle>,
    pub(crate) buffer: [u8; ENUM_BUFFER_LEN],
    /// Address picked for the in-flight SET_ADDRESS
    pending_address: u8,
    /// Configuration total length learned at step 11
    config_len: usize,
    next_address: u8,
    activations: u32,
    control_transfers: u32,
}

impl Enumerator {
    pub(crate) fn new() -> Self {
        Self {
            device: None,
            buffer: [0; ENUM_BUFFER_LEN],
            pending_address: 0,
            config_len: 0,
            next_address: 1,
            activations: 0,
            control_transfers: 0,
        }
    }
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
    /// Enumeration progress counters
    pub fn enumeration_stats(&self) -> EnumerationStats {
        EnumerationStats {
            activations: self.enumerator.activations,
            control_transfers: self.enumerator.control_transfers,
        }
    }

    /// Step 0 entry: request the first 8 bytes of the device descriptor
    ///
    /// The caller (attach path) has already acquired the enumeration lease.
    pub(crate) fn start_enumeration(&mut self, device: DeviceHandle) {
        self.enumerator.activations += 1;
        self.enumerator.device = Some(device);
        self.enum_send(device, SetupPacket::get_descriptor(DESC_DEVICE, 0, 0, 8), 0);
    }

    /// Run one transition of the machine on a completed control transfer
    pub(crate) fn enumeration_transition(&mut self, event: &TransferEvent) {
        self.enumerator.activations += 1;
        let device = match self.enumerator.device {
            Some(d) => d,
            None => return,
        };
        if let Err(_e) = event.status {
            // No retry policy; log and press on with whatever arrived
            #[cfg(feature = "defmt")]
            defmt::warn!("enumeration transfer failed: {}, continuing", _e);
        }
        let step = self.devices.get(device).map(|d| d.enum_state).unwrap_or(15);

        match step {
            0 => {
                let max0 = self.enumerator.buffer[7] as u16;
                if let Some(d) = self.devices.get_mut(device) {
                    if max0 >= 8 {
                        d.max_packet0 = max0;
                    }
                }
                let max0 = self.devices.get(device).map(|d| d.max_packet0).unwrap_or(64);
                if let Some(p) = self.devices.get(device).and_then(|d| d.control_pipe) {
                    if let Some(pipe) = self.pipes.get(p) {
                        pipe.qh.rebind_max_packet(max0);
                    }
                }

                let address = self.enumerator.next_address;
                self.enumerator.pending_address = address;
                self.enumerator.next_address =
                    if address >= 127 { 1 } else { address + 1 };
                self.enum_send(device, SetupPacket::set_address(address), 1);
            }
            1 => {
                let address = self.enumerator.pending_address;
                if let Some(d) = self.devices.get_mut(device) {
                    d.address = address;
                }
                if let Some(p) = self.devices.get(device).and_then(|d| d.control_pipe) {
                    if let Some(pipe) = self.pipes.get(p) {
                        pipe.qh.rebind_address(address);
                    }
                }
                #[cfg(feature = "defmt")]
                defmt::info!("device assigned address {}", address);
                self.enum_send(device, SetupPacket::get_descriptor(DESC_DEVICE, 0, 0, 18), 2);
            }
            2 => {
                match DeviceDescriptor::from_bytes(&self.enumerator.buffer[..18]) {
                    Ok(desc) => {
                        if let Some(d) = self.devices.get_mut(device) {
                            d.vendor_id = desc.id_vendor;
                            d.product_id = desc.id_product;
                            d.class = desc.b_device_class;
                            d.subclass = desc.b_device_sub_class;
                            d.protocol = desc.b_device_protocol;
                            d.string_index =
                                [desc.i_manufacturer, desc.i_product, desc.i_serial_number];
                        }
                    }
                    Err(_) => {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("malformed device descriptor, continuing without IDs");
                    }
                }
                let has_strings = self
                    .devices
                    .get(device)
                    .map(|d| d.string_index.iter().any(|&i| i != 0))
                    .unwrap_or(false);
                if has_strings {
                    self.enum_send(
                        device,
                        SetupPacket::get_descriptor(DESC_STRING, 0, 0, 255),
                        4,
                    );
                } else {
                    self.request_configuration(device);
                }
            }
            4 => {
                if self.enumerator.buffer[1] == DESC_STRING && self.enumerator.buffer[0] >= 4 {
                    let lang =
                        u16::from_le_bytes([self.enumerator.buffer[2], self.enumerator.buffer[3]]);
                    if let Some(d) = self.devices.get_mut(device) {
                        d.language_id = lang;
                    }
                }
                self.request_next_string(device, 0);
            }
            6 => {
                self.store_string(device, 0);
                self.request_next_string(device, 1);
            }
            8 => {
                self.store_string(device, 1);
                self.request_next_string(device, 2);
            }
            10 => {
                self.store_string(device, 2);
                self.request_next_string(device, 3);
            }
            11 => {
                let total = match ConfigurationDescriptor::from_bytes(&self.enumerator.buffer[..9])
                {
                    Ok(desc) => (desc.w_total_length as usize).clamp(9, ENUM_BUFFER_LEN),
                    Err(_) => {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("malformed configuration header, reading 9 bytes only");
                        9
                    }
                };
                self.enumerator.config_len = total;
                self.enum_send(
                    device,
                    SetupPacket::get_descriptor(DESC_CONFIGURATION, 0, 0, total as u16),
                    12,
                );
            }
            12 => {
                let config_value =
                    match ConfigurationDescriptor::from_bytes(&self.enumerator.buffer[..9]) {
                        Ok(desc) => {
                            if let Some(d) = self.devices.get_mut(device) {
                                d.bm_attributes = desc.bm_attributes;
                                d.max_power_2ma = desc.b_max_power;
                                d.config_value = desc.b_configuration_value;
                            }
                            desc.b_configuration_value
                        }
                        Err(_) => 1,
                    };
                self.enum_send(device, SetupPacket::set_configuration(config_value), 13);
            }
            13 => {
                // Step 14: claim offering, then release the lease (15)
                if let Some(d) = self.devices.get_mut(device) {
                    d.enum_state = 14;
                }
                self.offer_to_drivers(device);
                if let Some(d) = self.devices.get_mut(device) {
                    d.enum_state = 15;
                }
                #[cfg(feature = "defmt")]
                defmt::info!("enumeration complete");
                self.enumerator.device = None;
                self.enum_lease.release();
            }
            _ => {}
        }
    }

    /// Issue one enumeration control transfer; `next_step` runs on completion
    fn enum_send(&mut self, device: DeviceHandle, setup: SetupPacket, next_step: u8) {
        if let Some(d) = self.devices.get_mut(device) {
            d.enum_state = next_step;
        }
        self.enumerator.control_transfers += 1;
        let buffer = if setup.wLength == 0 {
            core::ptr::null_mut()
        } else {
            self.enumerator.buffer.as_mut_ptr()
        };
        // The enumeration buffer outlives the transfer: it is owned by the
        // engine itself
        let result =
            unsafe { self.queue_control_transfer(device, setup, buffer, Callback::Enumeration) };
        if result.is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("enumeration aborted: transfer pool exhausted");
            self.enumerator.device = None;
            self.enum_lease.release();
        }
    }

    fn request_configuration(&mut self, device: DeviceHandle) {
        self.enum_send(
            device,
            SetupPacket::get_descriptor(DESC_CONFIGURATION, 0, 0, 9),
            11,
        );
    }

    /// Fetch the next non-zero-index string at or after slot `from`
    ///
    /// Slots map to (manufacturer, product, serial); past the last one the
    /// machine moves on to the configuration descriptor.
    fn request_next_string(&mut self, device: DeviceHandle, from: usize) {
        let (index, language) = match self.devices.get(device) {
            Some(d) => (d.string_index, d.language_id),
            None => return,
        };
        for slot in from..3 {
            if index[slot] != 0 {
                self.enum_send(
                    device,
                    SetupPacket::get_descriptor(DESC_STRING, index[slot], language, 255),
                    6 + 2 * slot as u8,
                );
                return;
            }
        }
        self.request_configuration(device);
    }

    /// Decode the just-fetched UTF-16LE string descriptor into slot `which`
    fn store_string(&mut self, device: DeviceHandle, which: usize) {
        let len = self.enumerator.buffer[0] as usize;
        if self.enumerator.buffer[1] != DESC_STRING || len < 2 {
            #[cfg(feature = "defmt")]
            defmt::warn!("malformed string descriptor, skipping");
            return;
        }
        let mut text = [0u8; 128];
        let mut n = 0;
        let mut i = 2;
        while i + 1 < len.min(ENUM_BUFFER_LEN) && n < text.len() {
            let unit = u16::from_le_bytes([self.enumerator.buffer[i], self.enumerator.buffer[i + 1]]);
            // Non-ASCII code points degrade to '?'
            text[n] = if unit != 0 && unit < 0x80 { unit as u8 } else { b'?' };
            n += 1;
            i += 2;
        }

        let strings = match self.devices.get(device).and_then(|d| d.strings) {
            Some(s) => Some(s),
            None => {
                let s = self.strings.acquire(StringBuffer::new());
                if let (Some(d), Some(s)) = (self.devices.get_mut(device), s) {
                    d.strings = Some(s);
                }
                s
            }
        };
        if let Some(s) = strings.and_then(|s| self.strings.get_mut(s)) {
            s.store(which, &text[..n]);
        }
    }

    /// Step 14: offer the configured device to every unbound driver
    ///
    /// First the whole device with the full configuration descriptor; if
    /// nobody takes it, each interface descriptor slice in turn. The first
    /// `claim` returning true at a given granularity binds that driver.
    fn offer_to_drivers(&mut self, device: DeviceHandle) {
        // Local copy so driver callbacks may reuse the enumeration buffer
        let len = self.enumerator.config_len.min(ENUM_BUFFER_LEN);
        let mut config = [0u8; ENUM_BUFFER_LEN];
        config[..len].copy_from_slice(&self.enumerator.buffer[..len]);

        for i in 0..self.registered_drivers() {
            let id = DriverId(i as u8);
            if self.driver_is_bound(id) {
                continue;
            }
            let claimed = self
                .with_driver(id, |drv, host| {
                    drv.claim(host, device, ClaimLevel::Device, &config[..len])
                })
                .unwrap_or(false);
            if claimed {
                self.bind_driver(id, device);
                return;
            }
        }

        // Interface granularity: each slice runs from one interface
        // descriptor to the next
        let mut offset = 0usize;
        let mut iface_start: Option<usize> = None;
        while offset + 1 < len {
            let d_len = config[offset] as usize;
            if d_len < 2 || offset + d_len > len {
                break;
            }
            if config[offset + 1] == DESC_INTERFACE {
                if let Some(start) = iface_start.take() {
                    self.offer_interface(device, &config[start..offset]);
                }
                iface_start = Some(offset);
            }
            offset += d_len;
        }
        if let Some(start) = iface_start {
            self.offer_interface(device, &config[start..offset.min(len)]);
        }
    }

    fn offer_interface(&mut self, device: DeviceHandle, descriptors: &[u8]) {
        for i in 0..self.registered_drivers() {
            let id = DriverId(i as u8);
            if self.driver_is_bound(id) {
                continue;
            }
            let claimed = self
                .with_driver(id, |drv, host| {
                    drv.claim(host, device, ClaimLevel::Interface, descriptors)
                })
                .unwrap_or(false);
            if claimed {
                self.bind_driver(id, device);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{HostOps, Speed, UsbDriver};
    use crate::ehci::UsbSts;
    use crate::test_support::MockController;
    use std::boxed::Box;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    type TestHost = UsbHost<MockController>;

    // No-strings device: vendor 0x0483, product 0x0001, one configuration
    const DEV_DESC: [u8; 18] = [
        18, 1, 0x00, 0x02, 0, 0, 0, 0x40, 0x83, 0x04, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 1,
    ];

    // Configuration header + one HID-class interface, total length 18
    const CONFIG_DESC: [u8; 18] = [
        9, 2, 18, 0, 1, 1, 0, 0x80, 50, // configuration
        9, 4, 0, 0, 1, 3, 0, 0, 0, // interface, class 3
    ];

    fn step(host: &mut TestHost, device: crate::host::DeviceHandle, response: &[u8]) {
        host.test_complete_control(device, response);
        host.controller_mut().raise(UsbSts::USB_INTERRUPT);
        host.on_interrupt();
    }

    fn run_no_string_enumeration(host: &mut TestHost, device: crate::host::DeviceHandle) {
        step(host, device, &DEV_DESC[..8]); // step 0: short descriptor
        step(host, device, &[]); // step 1: SET_ADDRESS
        step(host, device, &DEV_DESC); // step 2: full descriptor
        step(host, device, &CONFIG_DESC[..9]); // step 11: header
        step(host, device, &CONFIG_DESC); // step 12: full configuration
        step(host, device, &[]); // step 13: SET_CONFIGURATION
    }

    #[test]
    fn test_no_strings_enumerates_in_seven_activations() {
        let mut host = TestHost::new(MockController::new());
        host.start();
        let device = host.attach_device(Speed::Full, 0, 0).unwrap();

        run_no_string_enumeration(&mut host, device);

        let d = host.devices.get(device).unwrap();
        assert_eq!(d.enum_state, 15);
        assert_ne!(d.address, 0);
        assert_eq!(d.vendor_id, 0x0483);
        assert_eq!(d.product_id, 0x0001);
        assert_eq!(d.config_value, 1);
        assert_eq!(d.bm_attributes, 0x80);
        assert_eq!(d.max_power_2ma, 50);

        let stats = host.enumeration_stats();
        assert_eq!(stats.control_transfers, 6);
        assert_eq!(stats.activations, 7);
    }

    #[test]
    fn test_no_string_indices_skip_straight_to_configuration() {
        let mut host = TestHost::new(MockController::new());
        host.start();
        let device = host.attach_device(Speed::Full, 0, 0).unwrap();

        step(&mut host, device, &DEV_DESC[..8]);
        step(&mut host, device, &[]);
        // The scripted descriptor carries a zero string-index triple, so the
        // machine must land directly on the configuration-header step
        step(&mut host, device, &DEV_DESC);
        assert_eq!(host.devices.get(device).unwrap().enum_state, 11);
    }

    #[test]
    fn test_lease_released_after_enumeration() {
        let mut host = TestHost::new(MockController::new());
        host.start();
        let device = host.attach_device(Speed::Full, 0, 0).unwrap();

        // Second device blocked while the first enumerates
        assert!(host.attach_device(Speed::Full, 0, 1).is_none());

        run_no_string_enumeration(&mut host, device);
        assert!(host.attach_device(Speed::Full, 0, 1).is_some());
    }

    #[test]
    fn test_all_strings_takes_ten_control_transfers() {
        let mut host = TestHost::new(MockController::new());
        host.start();
        let device = host.attach_device(Speed::High, 0, 0).unwrap();

        let mut desc = DEV_DESC;
        desc[14] = 1; // iManufacturer
        desc[15] = 2; // iProduct
        desc[16] = 3; // iSerialNumber

        let langids = [4u8, 3, 0x09, 0x04];
        let string = [8u8, 3, b'T', 0, b'S', 0, b'T', 0];

        step(&mut host, device, &desc[..8]);
        step(&mut host, device, &[]); // SET_ADDRESS
        step(&mut host, device, &desc);
        step(&mut host, device, &langids);
        step(&mut host, device, &string); // manufacturer
        step(&mut host, device, &string); // product
        step(&mut host, device, &string); // serial
        step(&mut host, device, &CONFIG_DESC[..9]);
        step(&mut host, device, &CONFIG_DESC);
        step(&mut host, device, &[]); // SET_CONFIGURATION

        assert_eq!(host.devices.get(device).unwrap().enum_state, 15);
        assert_eq!(host.devices.get(device).unwrap().language_id, 0x0409);
        assert_eq!(host.enumeration_stats().control_transfers, 10);
        for which in 0..3 {
            assert_eq!(host.device_string(device, which), Some("TST"));
        }
    }

    struct InterfaceClassDriver {
        class: u8,
        offers: Arc<AtomicU32>,
    }

    impl UsbDriver for InterfaceClassDriver {
        fn claim(
            &mut self,
            _host: &mut dyn HostOps,
            _device: crate::host::DeviceHandle,
            level: ClaimLevel,
            descriptors: &[u8],
        ) -> bool {
            self.offers.fetch_add(1, Ordering::Relaxed);
            // Interface descriptor byte 5 is bInterfaceClass
            level == ClaimLevel::Interface && descriptors.get(5) == Some(&self.class)
        }
    }

    #[test]
    fn test_matching_driver_claims_interface() {
        let mut host = TestHost::new(MockController::new());
        host.start();

        let offers = Arc::new(AtomicU32::new(0));
        let wrong = Box::leak(Box::new(InterfaceClassDriver {
            class: 8,
            offers: offers.clone(),
        }));
        let right = Box::leak(Box::new(InterfaceClassDriver {
            class: 3,
            offers: offers.clone(),
        }));
        host.register_driver(wrong).unwrap();
        let right_id = host.register_driver(right).unwrap();

        let device = host.attach_device(Speed::Full, 0, 0).unwrap();
        run_no_string_enumeration(&mut host, device);

        let d = host.devices.get(device).unwrap();
        assert_eq!(d.drivers.len(), 1);
        assert_eq!(d.drivers[0], right_id);
        // Both drivers saw the device offer; the wrong-class one also saw
        // the interface offer
        assert!(offers.load(Ordering::Relaxed) >= 4);
    }

    #[test]
    fn test_unclaimed_device_is_left_inert() {
        let mut host = TestHost::new(MockController::new());
        host.start();
        let device = host.attach_device(Speed::Full, 0, 0).unwrap();
        run_no_string_enumeration(&mut host, device);

        let d = host.devices.get(device).unwrap();
        assert_eq!(d.enum_state, 15);
        assert!(d.drivers.is_empty());
    }
}
