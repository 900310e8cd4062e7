//! Deterministic device keys
//!
//! Builds a stable identity string for a device from its descriptor
//! fields. The string doubles as a permission-cache key and as a
//! debug-displayable identifier; nothing outside this process depends on
//! its exact shape.

use crate::identity::DeviceInfo;
use std::hash::{Hash, Hasher};

/// Build the key name for a device.
///
/// The base key is the `#`-joined vendor/product/class/subclass/protocol
/// tuple. A non-empty `serial` argument is appended when given. With
/// `extended`, the platform-reported fields (the device's own serial
/// when a serial argument was supplied, manufacturer name, configuration
/// count, and USB version) are appended as well, which makes the key
/// distinguish otherwise identical devices.
pub fn device_key_name(device: &DeviceInfo, serial: Option<&str>, extended: bool) -> String {
    let mut key = String::new();
    key.push_str(&device.vendor_id.to_string());
    key.push('#');
    key.push_str(&device.product_id.to_string());
    key.push('#');
    key.push_str(&device.class.to_string());
    key.push('#');
    key.push_str(&device.subclass.to_string());
    key.push('#');
    key.push_str(&device.protocol.to_string());
    let supplied_serial = serial.filter(|s| !s.is_empty());
    if let Some(serial) = supplied_serial {
        key.push('#');
        key.push_str(serial);
    }
    if extended {
        key.push('#');
        if supplied_serial.is_some() {
            key.push_str(device.serial.as_deref().unwrap_or_default());
            key.push('#');
        }
        key.push_str(device.manufacturer.as_deref().unwrap_or_default());
        key.push('#');
        key.push_str(&device.configuration_count.to_string());
        key.push('#');
        if let Some(version) = &device.version {
            key.push_str(version);
            key.push('#');
        }
    }
    key
}

/// Hash of the extended key name, for compact map keys and logs.
pub fn device_key(device: &DeviceInfo) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    device_key_name(device, None, true).hash(&mut hasher);
    hasher.finish()
}
