//! Connect-listener boundary
//!
//! The single listener bound at [`DeviceMonitor::init`] receives every
//! user-visible event of the subsystem. Callbacks are always delivered
//! on a monitor worker thread, never synchronously from the API call
//! that caused them, so implementations may take their own locks freely.
//!
//! [`DeviceMonitor::init`]: crate::DeviceMonitor::init

use crate::block::UsbControlBlock;
use hostusb::DeviceInfo;
use std::sync::Arc;

/// Receiver of device lifecycle events.
pub trait DeviceConnectListener: Send + Sync {
    /// A device became visible (hotplug broadcast or discovery poll).
    fn on_attach(&self, device: &DeviceInfo);

    /// A device disappeared.
    fn on_detach(&self, device: &DeviceInfo);

    /// A control block is ready for the device. `created_new` is false
    /// when an existing block was reused; `slot` distinguishes the two
    /// devices of a dual connect (0 = primary, 1 = secondary).
    fn on_connect(
        &self,
        device: &DeviceInfo,
        block: &Arc<UsbControlBlock>,
        created_new: bool,
        slot: usize,
    );

    /// A control block was closed and removed from the registry.
    fn on_disconnect(&self, device: &DeviceInfo, block: &Arc<UsbControlBlock>);

    /// A permission prompt was denied, failed to issue, or was resolved
    /// while the monitor was not watching.
    fn on_cancel(&self, device: &DeviceInfo);
}

/// Listener payloads queued to the primary worker.
#[derive(Debug, Clone)]
pub(crate) enum Notification {
    Attach(DeviceInfo),
    Detach(DeviceInfo),
    Cancel(DeviceInfo),
}
