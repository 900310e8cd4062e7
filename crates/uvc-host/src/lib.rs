//! USB device discovery, permission, and control-block lifecycle
//! manager.
//!
//! The subsystem watches a platform USB stack (the [`hostusb`] boundary)
//! for cameras and HID peripherals, mediates the platform's asynchronous
//! permission grants, and owns the registry of open device connections:
//!
//! - [`DeviceMonitor`] — discovery polling layered under hotplug
//!   events, permission requests with asynchronous outcomes, the
//!   control-block registry, and dual-device connect dispatch.
//! - [`UsbControlBlock`] — one opened device: descriptor info, claimed
//!   interfaces, bulk read/write primitives, idempotent close.
//! - [`DeviceConnectListener`] — the callback boundary toward the
//!   embedding application; everything is delivered on a monitor worker.
//! - [`CameraSession`] / [`HidSession`] — glue from an open control
//!   block to the native frame-decoder and HID-transport boundaries.

pub mod block;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod monitor;
pub mod permissions;
pub mod session;
pub mod transport;

pub use block::{DeviceStrings, UsbControlBlock};
pub use config::MonitorConfig;
pub use error::MonitorError;
pub use events::DeviceConnectListener;
pub use monitor::DeviceMonitor;
pub use permissions::{PermissionOutcome, PermissionTicket};
pub use session::{CameraSession, HidSession, usbfs_root};
pub use transport::{
    DisplayTarget, FrameDecoder, FrameSink, HidTransport, PixelFormat, PreviewConfig, SnapshotSink,
    TransportError, TransportResult,
};
