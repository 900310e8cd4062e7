//! Platform USB stack boundary
//!
//! [`UsbHost`] is the consumed interface to the operating system's USB
//! service: enumeration, permission queries and prompts, opening devices,
//! and the attach/detach/permission event stream. Implementations wrap a
//! real platform stack; tests use [`crate::mock::MockHost`].

use crate::error::Result;
use crate::identity::DeviceInfo;
use std::sync::Arc;
use std::time::Duration;

/// Event delivered by the platform, from whatever thread it uses for
/// notifications. Consumers are expected to funnel these into their own
/// single-consumer queue.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Asynchronous outcome of a permission prompt
    PermissionResult {
        /// Device the prompt was for
        device: DeviceInfo,
        /// Whether the user granted access
        granted: bool,
    },
    /// Device plugged in
    Attached(DeviceInfo),
    /// Device unplugged
    Detached(DeviceInfo),
}

/// Callback receiving [`HostEvent`]s. May be invoked from any thread.
pub type EventSink = Arc<dyn Fn(HostEvent) + Send + Sync>;

/// A claimed interface of an open device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimedInterface {
    /// Interface number
    pub number: u8,
    /// Alternate setting selected by the claim
    pub alternate_setting: u8,
}

/// The operating system's USB service.
pub trait UsbHost: Send + Sync {
    /// Enumerate currently attached devices.
    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Whether the platform currently grants access to a device.
    fn has_permission(&self, device: &DeviceInfo) -> bool;

    /// Issue a non-blocking permission prompt for a device.
    ///
    /// The grant or denial arrives later as
    /// [`HostEvent::PermissionResult`]; this call only reports whether
    /// the prompt could be issued.
    fn request_permission(&self, device: &DeviceInfo) -> Result<()>;

    /// Open a device, yielding a connection handle.
    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn DeviceConnection>>;

    /// Start delivering events to the given sink.
    fn subscribe(&self, sink: EventSink) -> Result<()>;

    /// Stop delivering events.
    fn unsubscribe(&self);
}

/// An open connection to a single device.
///
/// Dropping the box closes the native handle; transfers on a dropped
/// connection are impossible by construction.
pub trait DeviceConnection: Send {
    /// Native file descriptor of the connection.
    fn file_descriptor(&self) -> i32;

    /// Raw descriptor bytes, starting with the 18-byte device descriptor.
    fn raw_descriptors(&self) -> Result<Vec<u8>>;

    /// Serial number as reported by the connection, if any.
    fn serial(&self) -> Option<String>;

    /// Claim an interface. With `force`, an active kernel driver is
    /// detached first.
    fn claim_interface(&mut self, number: u8, force: bool) -> Result<ClaimedInterface>;

    /// Release a previously claimed interface.
    fn release_interface(&mut self, number: u8) -> Result<()>;

    /// Device-to-host control transfer. Returns the number of bytes
    /// read into `buf`. `timeout` of `None` blocks indefinitely.
    fn control_transfer_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize>;

    /// Blocking bulk OUT transfer. Returns the number of bytes written.
    fn bulk_transfer_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize>;

    /// Blocking bulk IN transfer into `buf`. Returns the number of
    /// bytes read; zero means the device had nothing to send.
    fn bulk_transfer_in(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize>;
}
