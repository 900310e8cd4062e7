//! Scriptable in-memory USB host
//!
//! [`MockHost`] implements [`UsbHost`] against a purely in-memory device
//! table so that monitor behavior can be exercised without hardware:
//! tests plug and unplug devices, grant or deny permission prompts, and
//! script per-endpoint transfer data, while the mock records opens,
//! claims, and writes for assertions.
//!
//! String descriptors are served through the standard
//! GET_DESCRIPTOR(STRING) control-transfer protocol (language list at
//! index 0, UTF-16LE payloads with the declared length and a 0x03 type
//! byte), so descriptor-parsing code sees realistic wire bytes.

use crate::error::{HostError, Result};
use crate::host::{ClaimedInterface, DeviceConnection, EventSink, HostEvent, UsbHost};
use crate::identity::{DeviceInfo, InterfaceInfo};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const DESCRIPTOR_TYPE_STRING: u8 = 0x03;

/// Descriptor data a mock device serves once opened.
#[derive(Debug, Clone, Default)]
pub struct DeviceProfile {
    /// Raw descriptor bytes, beginning with the 18-byte device descriptor
    pub raw_descriptors: Vec<u8>,
    /// Supported string-descriptor language ids
    pub languages: Vec<u16>,
    /// String descriptors keyed by (index, language id)
    pub strings: HashMap<(u8, u16), String>,
    /// Raw response overrides keyed by (index, language id), served
    /// verbatim in place of a well-formed string descriptor
    pub raw_string_overrides: HashMap<(u8, u16), Vec<u8>>,
    /// Serial as reported by the opened connection
    pub serial: Option<String>,
}

#[derive(Default)]
struct State {
    devices: Vec<DeviceInfo>,
    profiles: HashMap<String, DeviceProfile>,
    permitted: HashSet<String>,
    pending: Vec<DeviceInfo>,
    sink: Option<EventSink>,
    open_failures: HashSet<String>,
    prompt_failures: HashSet<String>,
    write_failures: HashSet<(String, u8)>,
    open_count: HashMap<String, usize>,
    active: HashMap<String, usize>,
    next_fd: i32,
    writes: HashMap<(String, u8), Vec<Vec<u8>>>,
    reads: HashMap<(String, u8), VecDeque<Vec<u8>>>,
    claim_log: HashMap<String, Vec<(u8, bool)>>,
}

/// In-memory [`UsbHost`] implementation.
#[derive(Clone)]
pub struct MockHost {
    state: Arc<Mutex<State>>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_fd: 40,
                ..State::default()
            })),
        }
    }

    /// Add a device to the table without emitting an attach event.
    pub fn add_device(&self, device: DeviceInfo) {
        self.state.lock().unwrap().devices.push(device);
    }

    /// Add a device together with its descriptor profile.
    pub fn add_device_with_profile(&self, device: DeviceInfo, profile: DeviceProfile) {
        let mut state = self.state.lock().unwrap();
        state.profiles.insert(device.name.clone(), profile);
        state.devices.push(device);
    }

    /// Plug a device in: add it and emit [`HostEvent::Attached`].
    pub fn plug(&self, device: DeviceInfo) {
        self.state.lock().unwrap().devices.push(device.clone());
        self.emit(HostEvent::Attached(device));
    }

    /// Unplug a device: remove it and emit [`HostEvent::Detached`].
    pub fn unplug(&self, device: &DeviceInfo) {
        let mut state = self.state.lock().unwrap();
        state.devices.retain(|d| d != device);
        state.permitted.remove(&device.name);
        drop(state);
        self.emit(HostEvent::Detached(device.clone()));
    }

    /// Toggle permission without emitting an event.
    pub fn set_permitted(&self, device: &DeviceInfo, permitted: bool) {
        let mut state = self.state.lock().unwrap();
        if permitted {
            state.permitted.insert(device.name.clone());
        } else {
            state.permitted.remove(&device.name);
        }
    }

    /// Resolve an outstanding prompt (or none) by granting access.
    pub fn grant(&self, device: &DeviceInfo) {
        {
            let mut state = self.state.lock().unwrap();
            state.permitted.insert(device.name.clone());
            state.pending.retain(|d| d != device);
        }
        self.emit(HostEvent::PermissionResult {
            device: device.clone(),
            granted: true,
        });
    }

    /// Resolve an outstanding prompt (or none) by denying access.
    pub fn deny(&self, device: &DeviceInfo) {
        {
            let mut state = self.state.lock().unwrap();
            state.permitted.remove(&device.name);
            state.pending.retain(|d| d != device);
        }
        self.emit(HostEvent::PermissionResult {
            device: device.clone(),
            granted: false,
        });
    }

    /// Prompts issued via [`UsbHost::request_permission`] and not yet
    /// resolved.
    pub fn pending_requests(&self) -> Vec<DeviceInfo> {
        self.state.lock().unwrap().pending.clone()
    }

    /// Make subsequent opens of a device fail.
    pub fn fail_open(&self, device: &DeviceInfo) {
        self.state
            .lock()
            .unwrap()
            .open_failures
            .insert(device.name.clone());
    }

    /// Make permission prompts for a device fail at issue time.
    pub fn fail_permission_request(&self, device: &DeviceInfo) {
        self.state
            .lock()
            .unwrap()
            .prompt_failures
            .insert(device.name.clone());
    }

    /// Make bulk OUT transfers on an endpoint fail.
    pub fn fail_bulk_out(&self, device: &DeviceInfo, endpoint: u8) {
        self.state
            .lock()
            .unwrap()
            .write_failures
            .insert((device.name.clone(), endpoint));
    }

    /// How many times a device has been opened (cumulative).
    pub fn open_count(&self, device: &DeviceInfo) -> usize {
        self.state
            .lock()
            .unwrap()
            .open_count
            .get(&device.name)
            .copied()
            .unwrap_or(0)
    }

    /// How many connections to a device are currently open.
    pub fn active_connections(&self, device: &DeviceInfo) -> usize {
        self.state
            .lock()
            .unwrap()
            .active
            .get(&device.name)
            .copied()
            .unwrap_or(0)
    }

    /// Data written to a bulk OUT endpoint, in order.
    pub fn writes(&self, device: &DeviceInfo, endpoint: u8) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .writes
            .get(&(device.name.clone(), endpoint))
            .cloned()
            .unwrap_or_default()
    }

    /// Queue data to be returned by a bulk IN endpoint.
    pub fn queue_read(&self, device: &DeviceInfo, endpoint: u8, data: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .reads
            .entry((device.name.clone(), endpoint))
            .or_default()
            .push_back(data);
    }

    /// Claim/release history of a device: `(interface, claimed)` pairs.
    pub fn claim_history(&self, device: &DeviceInfo) -> Vec<(u8, bool)> {
        self.state
            .lock()
            .unwrap()
            .claim_log
            .get(&device.name)
            .cloned()
            .unwrap_or_default()
    }

    fn emit(&self, event: HostEvent) {
        let sink = self.state.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            debug!("mock host event: {:?}", event);
            sink(event);
        }
    }
}

impl UsbHost for MockHost {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.state.lock().unwrap().devices.clone())
    }

    fn has_permission(&self, device: &DeviceInfo) -> bool {
        self.state.lock().unwrap().permitted.contains(&device.name)
    }

    fn request_permission(&self, device: &DeviceInfo) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.prompt_failures.contains(&device.name) {
            return Err(HostError::Io);
        }
        if !state.devices.iter().any(|d| d == device) {
            return Err(HostError::NotFound);
        }
        if !state.pending.iter().any(|d| d == device) {
            state.pending.push(device.clone());
        }
        Ok(())
    }

    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn DeviceConnection>> {
        let mut state = self.state.lock().unwrap();
        if !state.devices.iter().any(|d| d == device) {
            return Err(HostError::NoDevice);
        }
        if !state.permitted.contains(&device.name) {
            return Err(HostError::Access);
        }
        if state.open_failures.contains(&device.name) {
            return Err(HostError::Io);
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        *state.open_count.entry(device.name.clone()).or_default() += 1;
        *state.active.entry(device.name.clone()).or_default() += 1;
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            device: device.clone(),
            fd,
            claimed: HashSet::new(),
        }))
    }

    fn subscribe(&self, sink: EventSink) -> Result<()> {
        self.state.lock().unwrap().sink = Some(sink);
        Ok(())
    }

    fn unsubscribe(&self) {
        self.state.lock().unwrap().sink = None;
    }
}

struct MockConnection {
    state: Arc<Mutex<State>>,
    device: DeviceInfo,
    fd: i32,
    claimed: HashSet<u8>,
}

impl MockConnection {
    fn string_descriptor_bytes(profile: &DeviceProfile, index: u8, language: u16) -> Option<Vec<u8>> {
        if let Some(raw) = profile.raw_string_overrides.get(&(index, language)) {
            return Some(raw.clone());
        }
        if index == 0 {
            let mut bytes = vec![(2 + 2 * profile.languages.len()) as u8, DESCRIPTOR_TYPE_STRING];
            for lang in &profile.languages {
                bytes.extend_from_slice(&lang.to_le_bytes());
            }
            return Some(bytes);
        }
        let s = profile.strings.get(&(index, language))?;
        let utf16: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let mut bytes = vec![(2 + utf16.len()) as u8, DESCRIPTOR_TYPE_STRING];
        bytes.extend_from_slice(&utf16);
        Some(bytes)
    }
}

impl DeviceConnection for MockConnection {
    fn file_descriptor(&self) -> i32 {
        self.fd
    }

    fn raw_descriptors(&self) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .profiles
            .get(&self.device.name)
            .map(|p| p.raw_descriptors.clone())
            .unwrap_or_default())
    }

    fn serial(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .profiles
            .get(&self.device.name)
            .and_then(|p| p.serial.clone())
    }

    fn claim_interface(&mut self, number: u8, _force: bool) -> Result<ClaimedInterface> {
        let mut state = self.state.lock().unwrap();
        state
            .claim_log
            .entry(self.device.name.clone())
            .or_default()
            .push((number, true));
        self.claimed.insert(number);
        Ok(ClaimedInterface {
            number,
            alternate_setting: 0,
        })
    }

    fn release_interface(&mut self, number: u8) -> Result<()> {
        if !self.claimed.remove(&number) {
            return Err(HostError::NotFound);
        }
        let mut state = self.state.lock().unwrap();
        state
            .claim_log
            .entry(self.device.name.clone())
            .or_default()
            .push((number, false));
        Ok(())
    }

    fn control_transfer_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Option<Duration>,
    ) -> Result<usize> {
        if request_type != 0x80 || request != REQUEST_GET_DESCRIPTOR {
            return Err(HostError::InvalidParam);
        }
        if (value >> 8) as u8 != DESCRIPTOR_TYPE_STRING {
            return Err(HostError::InvalidParam);
        }
        let string_index = (value & 0xff) as u8;
        let state = self.state.lock().unwrap();
        let profile = state
            .profiles
            .get(&self.device.name)
            .ok_or(HostError::Pipe)?;
        let bytes = Self::string_descriptor_bytes(profile, string_index, index)
            .ok_or(HostError::Pipe)?;
        if bytes.len() > buf.len() {
            return Err(HostError::Overflow);
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn bulk_transfer_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state
            .write_failures
            .contains(&(self.device.name.clone(), endpoint))
        {
            return Err(HostError::Io);
        }
        state
            .writes
            .entry((self.device.name.clone(), endpoint))
            .or_default()
            .push(data.to_vec());
        Ok(data.len())
    }

    fn bulk_transfer_in(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        _timeout: Option<Duration>,
    ) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let queued = state
            .reads
            .get_mut(&(self.device.name.clone(), endpoint))
            .and_then(VecDeque::pop_front);
        match queued {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Err(HostError::Timeout),
        }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.active.get_mut(&self.device.name) {
            *active = active.saturating_sub(1);
        }
    }
}

/// A plausible device record for tests.
pub fn sample_device(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        name: format!("/dev/bus/usb/{:03}/{:03}", bus, address),
        vendor_id,
        product_id,
        class: 0xef,
        subclass: 0x02,
        protocol: 0x01,
        manufacturer: None,
        product: None,
        serial: None,
        configuration_count: 1,
        version: None,
        interfaces: vec![InterfaceInfo {
            number: 0,
            alternate_setting: 0,
            class: 14,
            subclass: 1,
            protocol: 0,
        }],
    }
}

/// An 18-byte device descriptor with the given bcdUSB/bcdDevice values
/// and string-descriptor indexes at the standard offsets.
pub fn sample_raw_descriptors(
    usb_release: u16,
    device_release: u16,
    vendor_id: u16,
    product_id: u16,
    manufacturer_index: u8,
    product_index: u8,
    serial_index: u8,
) -> Vec<u8> {
    vec![
        18,
        0x01,
        (usb_release & 0xff) as u8,
        (usb_release >> 8) as u8,
        0xef,
        0x02,
        0x01,
        64,
        (vendor_id & 0xff) as u8,
        (vendor_id >> 8) as u8,
        (product_id & 0xff) as u8,
        (product_id >> 8) as u8,
        (device_release & 0xff) as u8,
        (device_release >> 8) as u8,
        manufacturer_index,
        product_index,
        serial_index,
        1,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plug_and_grant_emit_events() {
        let host = MockHost::new();
        let events: Arc<Mutex<Vec<HostEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&events);
        host.subscribe(Arc::new(move |ev| captured.lock().unwrap().push(ev)))
            .unwrap();

        let device = sample_device(1, 4, 0x1234, 0x0001);
        host.plug(device.clone());
        host.request_permission(&device).unwrap();
        assert_eq!(host.pending_requests().len(), 1);
        host.grant(&device);
        assert!(host.pending_requests().is_empty());
        assert!(host.has_permission(&device));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], HostEvent::Attached(_)));
        assert!(matches!(
            events[1],
            HostEvent::PermissionResult { granted: true, .. }
        ));
    }

    #[test]
    fn test_open_requires_permission() {
        let host = MockHost::new();
        let device = sample_device(1, 4, 0x1234, 0x0001);
        host.add_device(device.clone());
        assert_eq!(host.open(&device).err(), Some(HostError::Access));
        host.set_permitted(&device, true);
        assert!(host.open(&device).is_ok());
        assert_eq!(host.open_count(&device), 1);
    }

    #[test]
    fn test_connection_accounting() {
        let host = MockHost::new();
        let device = sample_device(1, 4, 0x1234, 0x0001);
        host.add_device(device.clone());
        host.set_permitted(&device, true);
        let conn = host.open(&device).unwrap();
        assert_eq!(host.active_connections(&device), 1);
        drop(conn);
        assert_eq!(host.active_connections(&device), 0);
    }

    #[test]
    fn test_string_descriptor_protocol() {
        let host = MockHost::new();
        let device = sample_device(1, 4, 0x1234, 0x0001);
        let mut profile = DeviceProfile {
            raw_descriptors: sample_raw_descriptors(0x0200, 0x0104, 0x1234, 0x0001, 1, 2, 3),
            languages: vec![0x0409],
            serial: None,
            ..DeviceProfile::default()
        };
        profile.strings.insert((2, 0x0409), "Widget".to_string());
        host.add_device_with_profile(device.clone(), profile);
        host.set_permitted(&device, true);

        let mut conn = host.open(&device).unwrap();
        let mut buf = [0u8; 256];

        // Language list at index 0.
        let n = conn
            .control_transfer_in(0x80, 0x06, 0x0300, 0, &mut buf, None)
            .unwrap();
        assert_eq!(&buf[..n], &[4, 0x03, 0x09, 0x04]);

        // Product string at index 2.
        let n = conn
            .control_transfer_in(0x80, 0x06, 0x0302, 0x0409, &mut buf, None)
            .unwrap();
        assert_eq!(buf[0] as usize, n);
        assert_eq!(buf[1], 0x03);
        let decoded: String = char::decode_utf16(
            buf[2..n]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]])),
        )
        .map(|c| c.unwrap())
        .collect();
        assert_eq!(decoded, "Widget");
    }
}
