//! Open-device control blocks
//!
//! A [`UsbControlBlock`] owns one opened USB device connection together
//! with its descriptor-derived info, bus/device numbers, and the table
//! of interfaces it has claimed. Blocks are created and registered by
//! the monitor (at most one per device identity) and handed to the
//! application through `on_connect`; [`UsbControlBlock::close`] is
//! idempotent and deregisters the block from its owning monitor.

use crate::error::MonitorError;
use crate::monitor::MonitorLink;
use hostusb::{
    ClaimedInterface, DeviceConnection, DeviceInfo, HostError, InterfaceInfo, UsbHost,
    device_key_name, vendor_name,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

const USB_DIR_IN: u8 = 0x80;
const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
// bmRequestType for a standard device-to-host GET request
const USB_REQ_STANDARD_DEVICE_GET: u8 = USB_DIR_IN;
const USB_DT_STRING: u8 = 0x03;

const READ_BUFFER_LEN: usize = 256 + 6;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Descriptor-derived device info: USB and device release numbers and the
/// manufacturer/product/serial strings, with static-table and hex-id
/// fallbacks when the device exposes no string descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStrings {
    /// USB specification release, e.g. "2.00"
    pub usb_version: String,
    /// Manufacturer name
    pub manufacturer: String,
    /// Product name
    pub product: String,
    /// Device release, e.g. "1.04"
    pub version: String,
    /// Serial number
    pub serial: String,
}

impl std::fmt::Display for DeviceStrings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "usb_version = {}, manufacturer = {}, product = {}, version = {}, serial = {}",
            self.usb_version, self.manufacturer, self.product, self.version, self.serial
        )
    }
}

impl DeviceStrings {
    /// Read descriptor info for a device.
    ///
    /// Platform-supplied strings are taken first. When the platform
    /// grants permission, a short-lived connection reads the raw device
    /// descriptor (bcdUSB at bytes 2-3, bcdDevice at bytes
    /// 12-13, string indexes at bytes 14-16) and resolves the string
    /// descriptors through GET_DESCRIPTOR(STRING). Missing strings fall
    /// back to the vendor-name table, then to hex-formatted ids.
    pub(crate) fn read(host: &dyn UsbHost, device: &DeviceInfo) -> DeviceStrings {
        let mut info = DeviceStrings::default();
        if let Some(manufacturer) = &device.manufacturer {
            info.manufacturer = manufacturer.clone();
        }
        if let Some(product) = &device.product {
            info.product = product.clone();
        }
        if let Some(serial) = &device.serial {
            info.serial = serial.clone();
        }
        if let Some(version) = &device.version {
            info.usb_version = version.clone();
        }

        if host.has_permission(device) {
            match host.open(device) {
                Ok(mut connection) => {
                    info.fill_from_connection(&mut *connection);
                }
                Err(e) => {
                    debug!("descriptor read for {} skipped, open failed: {}", device, e);
                }
            }
        }

        if info.manufacturer.is_empty() {
            if let Some(name) = vendor_name(device.vendor_id) {
                info.manufacturer = name.to_string();
            }
        }
        if info.manufacturer.is_empty() {
            info.manufacturer = format!("{:04x}", device.vendor_id);
        }
        if info.product.is_empty() {
            info.product = format!("{:04x}", device.product_id);
        }
        info
    }

    fn fill_from_connection(&mut self, connection: &mut dyn DeviceConnection) {
        let raw = match connection.raw_descriptors() {
            Ok(raw) if raw.len() >= 18 => raw,
            Ok(_) => {
                debug!("raw descriptors too short, skipping descriptor parse");
                return;
            }
            Err(e) => {
                debug!("raw descriptors unavailable: {}", e);
                return;
            }
        };

        if self.usb_version.is_empty() {
            self.usb_version = format!("{:x}.{:02x}", raw[3], raw[2]);
        }
        if self.version.is_empty() {
            self.version = format!("{:x}.{:02x}", raw[13], raw[12]);
        }
        if self.serial.is_empty()
            && let Some(serial) = connection.serial()
        {
            self.serial = serial;
        }

        let languages = read_language_ids(connection);
        if languages.is_empty() {
            return;
        }
        if self.manufacturer.is_empty() {
            self.manufacturer = read_string_descriptor(connection, raw[14], &languages);
        }
        if self.product.is_empty() {
            self.product = read_string_descriptor(connection, raw[15], &languages);
        }
        if self.serial.is_empty() {
            self.serial = read_string_descriptor(connection, raw[16], &languages);
        }
    }
}

/// Request the supported-language list (string descriptor index 0).
fn read_language_ids(connection: &mut dyn DeviceConnection) -> Vec<u16> {
    let mut buf = [0u8; 256];
    let read = connection.control_transfer_in(
        USB_REQ_STANDARD_DEVICE_GET,
        USB_REQ_GET_DESCRIPTOR,
        (USB_DT_STRING as u16) << 8,
        0,
        &mut buf,
        None,
    );
    match read {
        Ok(n) if n > 2 => buf[2..n]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect(),
        Ok(_) => Vec::new(),
        Err(e) => {
            debug!("language list read failed: {}", e);
            Vec::new()
        }
    }
}

/// Read one string descriptor, trying each language until a well-formed
/// non-empty result arrives. A response whose declared length or type
/// byte does not match is discarded and the next language is tried.
fn read_string_descriptor(
    connection: &mut dyn DeviceConnection,
    index: u8,
    languages: &[u16],
) -> String {
    if index == 0 {
        return String::new();
    }
    let mut buf = [0u8; 256];
    for &language in languages {
        let read = connection.control_transfer_in(
            USB_REQ_STANDARD_DEVICE_GET,
            USB_REQ_GET_DESCRIPTOR,
            ((USB_DT_STRING as u16) << 8) | index as u16,
            language,
            &mut buf,
            None,
        );
        let Ok(n) = read else { continue };
        if n > 2 && buf[0] as usize == n && buf[1] == USB_DT_STRING {
            let result: String = char::decode_utf16(
                buf[2..n]
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]])),
            )
            .filter_map(|c| c.ok())
            .collect();
            if !result.is_empty() {
                return result;
            }
        }
    }
    String::new()
}

/// Parse bus and device numbers from the last two segments of a device
/// node path, defaulting to 0 when unparseable.
fn parse_bus_device(name: &str) -> (u32, u32) {
    let segments: Vec<&str> = name.split('/').collect();
    if segments.len() < 2 {
        return (0, 0);
    }
    let bus = segments[segments.len() - 2].parse().unwrap_or(0);
    let device = segments[segments.len() - 1].parse().unwrap_or(0);
    (bus, device)
}

struct ConnectionState {
    connection: Option<Box<dyn DeviceConnection>>,
    claimed: HashMap<u8, ClaimedInterface>,
}

/// One opened USB device connection.
pub struct UsbControlBlock {
    device: DeviceInfo,
    info: DeviceStrings,
    bus_number: u32,
    device_number: u32,
    link: MonitorLink,
    state: Mutex<ConnectionState>,
    // Handle to mint the Arc carried by the deregistration message.
    self_handle: Mutex<Weak<UsbControlBlock>>,
}

impl UsbControlBlock {
    /// Open the native connection for a device and read its descriptor
    /// info. Fails with [`MonitorError::OpenFailed`] when the platform
    /// refuses the open.
    pub(crate) fn open(
        host: &dyn UsbHost,
        device: DeviceInfo,
        link: MonitorLink,
    ) -> Result<Arc<Self>, MonitorError> {
        let connection = host.open(&device).map_err(|source| {
            warn!("could not connect to device {}: {}", device, source);
            MonitorError::OpenFailed {
                device: device.to_string(),
                source,
            }
        })?;
        let (bus_number, device_number) = parse_bus_device(&device.name);
        let info = DeviceStrings::read(host, &device);
        info!(
            "name = {}, fd = {}, busnum = {}, devnum = {}, {}",
            device.name,
            connection.file_descriptor(),
            bus_number,
            device_number,
            info
        );

        let block = Arc::new(Self {
            device,
            info,
            bus_number,
            device_number,
            link,
            state: Mutex::new(ConnectionState {
                connection: Some(connection),
                claimed: HashMap::new(),
            }),
            self_handle: Mutex::new(Weak::new()),
        });
        *block.self_handle.lock().unwrap() = Arc::downgrade(&block);
        Ok(block)
    }

    /// Device identity this block was opened for.
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Device node path.
    pub fn device_name(&self) -> &str {
        &self.device.name
    }

    pub fn vendor_id(&self) -> u16 {
        self.device.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.device.product_id
    }

    pub fn device_protocol(&self) -> u8 {
        self.device.protocol
    }

    pub fn bus_number(&self) -> u32 {
        self.bus_number
    }

    pub fn device_number(&self) -> u32 {
        self.device_number
    }

    /// Descriptor-derived strings.
    pub fn strings(&self) -> &DeviceStrings {
        &self.info
    }

    /// Device release string from the descriptor.
    pub fn version(&self) -> &str {
        &self.info.version
    }

    /// Device key including the descriptor-derived serial.
    pub fn device_key_with_serial(&self) -> String {
        device_key_name(&self.device, Some(&self.info.serial), false)
    }

    /// Native file descriptor, `None` once closed.
    pub fn file_descriptor(&self) -> Option<i32> {
        self.state
            .lock()
            .unwrap()
            .connection
            .as_ref()
            .map(|c| c.file_descriptor())
    }

    /// Number of interfaces in the active configuration.
    pub fn interface_count(&self) -> usize {
        self.device.interfaces.len()
    }

    /// Descriptor record of an interface (alternate setting 0).
    pub fn interface(&self, number: u8) -> Option<&InterfaceInfo> {
        self.device
            .interfaces
            .iter()
            .find(|i| i.number == number && i.alternate_setting == 0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().connection.is_none()
    }

    /// Claim an interface, detaching a kernel driver if one holds it.
    pub fn claim_interface(&self, number: u8) -> hostusb::Result<ClaimedInterface> {
        let mut state = self.state.lock().unwrap();
        let ConnectionState { connection, claimed } = &mut *state;
        let connection = connection.as_mut().ok_or(HostError::NoDevice)?;
        let claim = connection.claim_interface(number, true)?;
        claimed.insert(number, claim);
        Ok(claim)
    }

    /// Release a claimed interface.
    pub fn release_interface(&self, number: u8) -> hostusb::Result<()> {
        let mut state = self.state.lock().unwrap();
        let ConnectionState { connection, claimed } = &mut *state;
        let connection = connection.as_mut().ok_or(HostError::NoDevice)?;
        claimed.remove(&number);
        connection.release_interface(number)
    }

    /// Claim the interface, write `data` to a bulk OUT endpoint with no
    /// timeout, and release the interface again.
    ///
    /// The claim/transfer/release sequence is not atomic with respect to
    /// other threads using the same interface; callers interleaving
    /// transfers on one interface must serialize externally.
    pub fn write_data(&self, interface: u8, endpoint: u8, data: &[u8]) -> hostusb::Result<usize> {
        self.claim_interface(interface)?;
        let result = {
            let mut state = self.state.lock().unwrap();
            let connection = state.connection.as_mut().ok_or(HostError::NoDevice)?;
            connection.bulk_transfer_out(endpoint, data, None)
        };
        if let Err(e) = &result {
            info!("write on endpoint {:#04x} got no ack: {}", endpoint, e);
        }
        if let Err(e) = self.release_interface(interface) {
            debug!("release of interface {} after write failed: {}", interface, e);
        }
        result
    }

    /// Read from a bulk IN endpoint with a 5 second timeout.
    ///
    /// Returns the bytes received; an empty vector means the device had
    /// nothing to send within the transfer.
    pub fn read_data(&self, endpoint: u8) -> hostusb::Result<Vec<u8>> {
        let mut buf = vec![0u8; READ_BUFFER_LEN];
        let result = {
            let mut state = self.state.lock().unwrap();
            let connection = state.connection.as_mut().ok_or(HostError::NoDevice)?;
            connection.bulk_transfer_in(endpoint, &mut buf, Some(READ_TIMEOUT))
        };
        match result {
            Ok(0) => {
                info!("endpoint {:#04x}: no data yet", endpoint);
                Ok(Vec::new())
            }
            Ok(n) => {
                buf.truncate(n);
                info!("endpoint {:#04x}: {} bytes", endpoint, n);
                debug!("head: {:02x?}", &buf[..buf.len().min(5)]);
                Ok(buf)
            }
            Err(e) => {
                info!("endpoint {:#04x}: unable to read: {}", endpoint, e);
                Err(e)
            }
        }
    }

    /// Close the block: release every claimed interface, close the
    /// native connection, and notify the owning monitor so it can
    /// deregister the block and deliver `on_disconnect`.
    ///
    /// Idempotent; a second call is a no-op. Safe to call after the
    /// monitor is gone, in which case the notification is skipped.
    pub fn close(&self) {
        let (mut connection, claimed) = {
            let mut state = self.state.lock().unwrap();
            let Some(connection) = state.connection.take() else {
                return;
            };
            (connection, std::mem::take(&mut state.claimed))
        };
        for (number, _) in claimed {
            if let Err(e) = connection.release_interface(number) {
                warn!("failed to release interface {}: {}", number, e);
            }
        }
        drop(connection);
        debug!("closed {}", self.device);

        if let Some(block) = self.self_handle.lock().unwrap().upgrade() {
            self.link.deregister(self.device.clone(), block);
        }
    }
}

impl PartialEq for UsbControlBlock {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device
    }
}

impl Eq for UsbControlBlock {}

impl PartialEq<DeviceInfo> for UsbControlBlock {
    fn eq(&self, other: &DeviceInfo) -> bool {
        self.device == *other
    }
}

impl std::fmt::Debug for UsbControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbControlBlock")
            .field("device", &self.device.name)
            .field("vendor_id", &self.device.vendor_id)
            .field("product_id", &self.device.product_id)
            .field("bus_number", &self.bus_number)
            .field("device_number", &self.device_number)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{Command, MonitorLink};
    use hostusb::mock::{DeviceProfile, MockHost, sample_device, sample_raw_descriptors};

    fn test_link() -> (MonitorLink, async_channel::Receiver<Command>) {
        let (tx, rx) = async_channel::unbounded();
        (MonitorLink::new(tx), rx)
    }

    fn permitted_device(host: &MockHost) -> DeviceInfo {
        let device = sample_device(1, 4, 0x1234, 0x0001);
        host.add_device(device.clone());
        host.set_permitted(&device, true);
        device
    }

    fn profiled_device(host: &MockHost) -> DeviceInfo {
        let device = sample_device(1, 4, 0x1234, 0x0001);
        let mut profile = DeviceProfile {
            raw_descriptors: sample_raw_descriptors(0x0200, 0x0104, 0x1234, 0x0001, 1, 2, 3),
            languages: vec![0x0409, 0x0407],
            serial: None,
            ..DeviceProfile::default()
        };
        profile.strings.insert((1, 0x0409), "Acme".to_string());
        profile.strings.insert((2, 0x0409), "Conference Cam".to_string());
        profile.strings.insert((3, 0x0407), "SN0042".to_string());
        host.add_device_with_profile(device.clone(), profile);
        host.set_permitted(&device, true);
        device
    }

    #[test]
    fn test_open_fails_fast_without_permission() {
        let host = MockHost::new();
        let device = sample_device(1, 4, 0x1234, 0x0001);
        host.add_device(device.clone());
        let (link, _rx) = test_link();
        let err = UsbControlBlock::open(&host, device, link).err().unwrap();
        assert!(matches!(err, MonitorError::OpenFailed { .. }));
    }

    #[test]
    fn test_descriptor_strings_via_control_transfers() {
        let host = MockHost::new();
        let device = profiled_device(&host);
        let (link, _rx) = test_link();
        let block = UsbControlBlock::open(&host, device, link).unwrap();
        let strings = block.strings();
        assert_eq!(strings.usb_version, "2.00");
        assert_eq!(strings.version, "1.04");
        assert_eq!(strings.manufacturer, "Acme");
        assert_eq!(strings.product, "Conference Cam");
        // Serial only exists for the second language; the first misses
        // and the reader retries with the next language id.
        assert_eq!(strings.serial, "SN0042");
    }

    #[test]
    fn test_string_fallbacks_without_profile() {
        let host = MockHost::new();
        let device = permitted_device(&host);
        let (link, _rx) = test_link();
        let block = UsbControlBlock::open(&host, device, link).unwrap();
        // 0x1234 is not in the vendor table; both fall back to hex ids.
        assert_eq!(block.strings().manufacturer, "1234");
        assert_eq!(block.strings().product, "0001");
    }

    #[test]
    fn test_vendor_table_fallback() {
        let host = MockHost::new();
        let device = sample_device(1, 5, 0x046d, 0x0825);
        host.add_device(device.clone());
        host.set_permitted(&device, true);
        let (link, _rx) = test_link();
        let block = UsbControlBlock::open(&host, device, link).unwrap();
        assert_eq!(block.strings().manufacturer, "Logitech");
    }

    #[test]
    fn test_bus_device_numbers() {
        assert_eq!(parse_bus_device("/dev/bus/usb/001/004"), (1, 4));
        assert_eq!(parse_bus_device("/dev/bus/usb/003/017"), (3, 17));
        assert_eq!(parse_bus_device("bogus"), (0, 0));
        assert_eq!(parse_bus_device("/dev/bus/usb/abc/xyz"), (0, 0));
    }

    #[test]
    fn test_write_data_claims_and_releases() {
        let host = MockHost::new();
        let device = permitted_device(&host);
        let (link, _rx) = test_link();
        let block = UsbControlBlock::open(&host, device.clone(), link).unwrap();

        let written = block.write_data(0, 0x01, &[0xAA, 0xBB]).unwrap();
        assert_eq!(written, 2);
        assert_eq!(host.writes(&device, 0x01), vec![vec![0xAA, 0xBB]]);
        assert_eq!(host.claim_history(&device), vec![(0, true), (0, false)]);
    }

    #[test]
    fn test_write_failure_still_releases() {
        let host = MockHost::new();
        let device = permitted_device(&host);
        host.fail_bulk_out(&device, 0x01);
        let (link, _rx) = test_link();
        let block = UsbControlBlock::open(&host, device.clone(), link).unwrap();

        assert!(block.write_data(0, 0x01, &[0x00]).is_err());
        assert_eq!(host.claim_history(&device), vec![(0, true), (0, false)]);
    }

    #[test]
    fn test_read_data_scripted_and_timeout() {
        let host = MockHost::new();
        let device = permitted_device(&host);
        host.queue_read(&device, 0x81, vec![1, 2, 3, 4, 5, 6]);
        let (link, _rx) = test_link();
        let block = UsbControlBlock::open(&host, device, link).unwrap();

        assert_eq!(block.read_data(0x81).unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(block.read_data(0x81).err(), Some(HostError::Timeout));
    }

    #[test]
    fn test_close_is_idempotent_and_deregisters_once() {
        let host = MockHost::new();
        let device = permitted_device(&host);
        let (link, rx) = test_link();
        let block = UsbControlBlock::open(&host, device.clone(), link).unwrap();
        block.claim_interface(0).unwrap();

        block.close();
        block.close();

        assert!(block.is_closed());
        assert_eq!(block.file_descriptor(), None);
        assert_eq!(host.active_connections(&device), 0);
        // Claimed interface released during close.
        assert_eq!(host.claim_history(&device), vec![(0, true), (0, false)]);
        // Exactly one deregistration message.
        assert!(matches!(rx.try_recv(), Ok(Command::Deregister { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_tolerates_missing_monitor() {
        let host = MockHost::new();
        let device = permitted_device(&host);
        let (link, rx) = test_link();
        let block = UsbControlBlock::open(&host, device, link).unwrap();
        drop(rx);
        block.close();
        assert!(block.is_closed());
    }

    #[test]
    fn test_transfers_fail_after_close() {
        let host = MockHost::new();
        let device = permitted_device(&host);
        let (link, _rx) = test_link();
        let block = UsbControlBlock::open(&host, device, link).unwrap();
        block.close();
        assert_eq!(block.read_data(0x81).err(), Some(HostError::NoDevice));
        assert_eq!(
            block.write_data(0, 0x01, &[0x00]).err(),
            Some(HostError::NoDevice)
        );
    }

    #[test]
    fn test_equality_by_device_identity() {
        let host = MockHost::new();
        let device = permitted_device(&host);
        let (link, _rx) = test_link();
        let a = UsbControlBlock::open(&host, device.clone(), link.clone()).unwrap();
        let b = UsbControlBlock::open(&host, device.clone(), link).unwrap();
        assert_eq!(*a, *b);
        assert_eq!(*a, device);

        let other = sample_device(1, 9, 0x1234, 0x0002);
        assert!(*a != other);
    }

    #[test]
    fn test_interface_lookup_and_key() {
        let host = MockHost::new();
        let device = profiled_device(&host);
        let (link, _rx) = test_link();
        let block = UsbControlBlock::open(&host, device, link).unwrap();
        assert_eq!(block.interface_count(), 1);
        assert_eq!(block.interface(0).unwrap().class, 14);
        assert!(block.interface(7).is_none());
        assert!(block.device_key_with_serial().ends_with("#SN0042"));
    }
}
