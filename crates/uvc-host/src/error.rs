//! Monitor error types

use hostusb::HostError;
use thiserror::Error;

/// Errors surfaced by [`DeviceMonitor`](crate::DeviceMonitor) and
/// [`UsbControlBlock`](crate::UsbControlBlock) operations.
///
/// Most host-boundary failures are logged and converted into listener
/// notifications rather than raised; the variants here are the
/// conditions a caller must handle directly.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The monitor has been destroyed; the operation cannot run.
    #[error("monitor already destroyed")]
    Destroyed,

    /// `init` has not been called yet.
    #[error("monitor not initialized")]
    NotInitialized,

    /// The platform does not currently grant access to the device.
    #[error("no permission to access {device}")]
    PermissionRequired { device: String },

    /// Opening the native device connection failed.
    #[error("failed to open {device}: {source}")]
    OpenFailed {
        device: String,
        #[source]
        source: HostError,
    },

    /// Passthrough host boundary error.
    #[error(transparent)]
    Host(#[from] HostError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_failed_display_names_device_and_cause() {
        let err = MonitorError::OpenFailed {
            device: "/dev/bus/usb/001/004 (1234:0001)".to_string(),
            source: HostError::Io,
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/bus/usb/001/004"));
        assert!(msg.contains("i/o error"));
    }
}
