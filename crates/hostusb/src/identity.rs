//! USB device identity records
//!
//! [`DeviceInfo`] is the immutable snapshot of a device as enumerated by
//! the platform. Two snapshots are considered the same device when they
//! describe the same usbfs node with the same vendor/product ids, which
//! makes [`DeviceInfo`] usable as a registry and permission-cache key.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// One interface of a device's active configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Interface number (bInterfaceNumber)
    pub number: u8,
    /// Alternate setting (bAlternateSetting)
    pub alternate_setting: u8,
    /// Interface class code
    pub class: u8,
    /// Interface subclass code
    pub subclass: u8,
    /// Interface protocol code
    pub protocol: u8,
}

/// Device identity as reported by the platform USB stack.
///
/// Immutable once enumerated. String fields are only present when the
/// platform could read them without opening the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device node path, e.g. `/dev/bus/usb/001/004`
    pub name: String,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device class
    pub class: u8,
    /// USB device subclass
    pub subclass: u8,
    /// USB device protocol
    pub protocol: u8,
    /// Manufacturer string (if available without opening)
    pub manufacturer: Option<String>,
    /// Product string (if available without opening)
    pub product: Option<String>,
    /// Serial number string (if available without opening)
    pub serial: Option<String>,
    /// Number of configurations
    pub configuration_count: u8,
    /// USB specification version (bcdUSB) formatted like "2.00", when
    /// the platform reports it without opening the device
    pub version: Option<String>,
    /// Interfaces of the active configuration
    pub interfaces: Vec<InterfaceInfo>,
}

impl DeviceInfo {
    /// Number of interfaces in the active configuration.
    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }
}

impl PartialEq for DeviceInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
    }
}

impl Eq for DeviceInfo {}

impl Hash for DeviceInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.vendor_id.hash(state);
        self.product_id.hash(state);
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x})",
            self.name, self.vendor_id, self.product_id
        )
    }
}

/// Well-known vendor-id names, used as a fallback when a device exposes
/// no manufacturer string descriptor.
static VENDOR_NAMES: &[(u16, &str)] = &[
    (0x03f0, "Hewlett-Packard"),
    (0x0403, "FTDI"),
    (0x0408, "Quanta Computer"),
    (0x045e, "Microsoft"),
    (0x046d, "Logitech"),
    (0x0471, "Philips"),
    (0x04a9, "Canon"),
    (0x04b4, "Cypress Semiconductor"),
    (0x04ca, "Lite-On Technology"),
    (0x04e8, "Samsung Electronics"),
    (0x04f2, "Chicony Electronics"),
    (0x04f9, "Brother Industries"),
    (0x05a9, "OmniVision Technologies"),
    (0x05ac, "Apple"),
    (0x05c8, "Cheng Uei Precision Industry"),
    (0x058f, "Alcor Micro"),
    (0x064e, "Suyin"),
    (0x0781, "SanDisk"),
    (0x093a, "Pixart Imaging"),
    (0x0a5c, "Broadcom"),
    (0x0b05, "ASUSTek Computer"),
    (0x0bda, "Realtek Semiconductor"),
    (0x0c45, "Microdia"),
    (0x1415, "Nam Tai E&E Products"),
    (0x13d3, "IMC Networks"),
    (0x174f, "Syntek"),
    (0x17ef, "Lenovo"),
    (0x18d1, "Google"),
    (0x1bcf, "Sunplus Innovation Technology"),
    (0x1d6b, "Linux Foundation"),
    (0x2109, "VIA Labs"),
    (0x2232, "Silicon Motion"),
    (0x2833, "Oculus VR"),
    (0x2bd9, "LuxVisions Innotech"),
    (0x8086, "Intel"),
    (0x8087, "Intel"),
];

/// Look up the human-readable name of a USB vendor id.
pub fn vendor_name(vendor_id: u16) -> Option<&'static str> {
    VENDOR_NAMES
        .iter()
        .find(|(id, _)| *id == vendor_id)
        .map(|(_, name)| *name)
}
