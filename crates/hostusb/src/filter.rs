//! Declarative device filters
//!
//! A [`DeviceFilter`] is a predicate over a device identity. Every field
//! is optional; an absent field matches anything. A filter matches a
//! device when the constrained vendor/product ids agree and either the
//! device-level class/subclass/protocol triple or any interface's triple
//! satisfies the (possibly wildcarded) triple constraint.
//!
//! Filter lists are loaded from an ordered `[[usb-device]]` TOML record
//! list. Numeric fields accept integers, decimal strings, `0x`-prefixed
//! hex strings, or `@name` indirection into a [`FilterResources`] table.
//! A malformed record is skipped with a logged warning; only an
//! unparseable document aborts the load.

use crate::identity::DeviceInfo;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

/// Predicate over USB device identity.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    /// USB Vendor ID (None for unconstrained)
    pub vendor_id: Option<u16>,
    /// USB Product ID (None for unconstrained)
    pub product_id: Option<u16>,
    /// USB device or interface class (None for unconstrained)
    pub class: Option<u8>,
    /// USB device subclass (None for unconstrained)
    pub subclass: Option<u8>,
    /// USB device protocol (None for unconstrained)
    pub protocol: Option<u8>,
    /// Manufacturer name string (None for unconstrained)
    pub manufacturer: Option<String>,
    /// Product name string (None for unconstrained)
    pub product: Option<String>,
    /// Serial number string (None for unconstrained)
    pub serial: Option<String>,
    /// Invert final inclusion when building device lists
    pub exclude: bool,
}

impl DeviceFilter {
    /// A filter with every field unconstrained.
    pub fn any() -> Self {
        Self::default()
    }

    /// A concrete filter built from a device's own identity fields.
    pub fn from_device(device: &DeviceInfo, exclude: bool) -> Self {
        Self {
            vendor_id: Some(device.vendor_id),
            product_id: Some(device.product_id),
            class: Some(device.class),
            subclass: Some(device.subclass),
            protocol: Some(device.protocol),
            manufacturer: None,
            product: None,
            serial: None,
            exclude,
        }
    }

    fn triple_matches(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.class.is_none_or(|c| c == class)
            && self.subclass.is_none_or(|s| s == subclass)
            && self.protocol.is_none_or(|p| p == protocol)
    }

    /// Whether this filter matches a device.
    ///
    /// The `exclude` flag does not participate here; it only inverts
    /// inclusion when a device list is being assembled.
    pub fn matches(&self, device: &DeviceInfo) -> bool {
        if self.vendor_id.is_some_and(|v| v != device.vendor_id) {
            return false;
        }
        if self.product_id.is_some_and(|p| p != device.product_id) {
            return false;
        }
        if self.triple_matches(device.class, device.subclass, device.protocol) {
            return true;
        }
        device
            .interfaces
            .iter()
            .any(|i| self.triple_matches(i.class, i.subclass, i.protocol))
    }

    /// Whether two filters denote the same concrete device constraint.
    ///
    /// False whenever any numeric field of either side is unconstrained
    /// (a wildcard filter is never equivalent to anything, itself
    /// included, which is why this is not `PartialEq`). String fields
    /// must agree in both presence and value, and the exclude flags must
    /// agree.
    pub fn is_equivalent(&self, other: &DeviceFilter) -> bool {
        let (Some(vid), Some(pid), Some(class), Some(subclass), Some(protocol)) = (
            self.vendor_id,
            self.product_id,
            self.class,
            self.subclass,
            self.protocol,
        ) else {
            return false;
        };
        if other.vendor_id != Some(vid)
            || other.product_id != Some(pid)
            || other.class != Some(class)
            || other.subclass != Some(subclass)
            || other.protocol != Some(protocol)
        {
            return false;
        }
        self.manufacturer == other.manufacturer
            && self.product == other.product
            && self.serial == other.serial
            && self.exclude == other.exclude
    }

    /// Whether this filter denotes exactly the given device identity.
    ///
    /// Same rule as [`is_equivalent`](Self::is_equivalent) against a raw
    /// identity: every numeric field must be concrete and equal. String
    /// fields are ignored and exclude filters never match.
    pub fn is_exact_match(&self, device: &DeviceInfo) -> bool {
        !self.exclude
            && self.vendor_id == Some(device.vendor_id)
            && self.product_id == Some(device.product_id)
            && self.class == Some(device.class)
            && self.subclass == Some(device.subclass)
            && self.protocol == Some(device.protocol)
    }
}

/// Named values a filter document may reference with `@name`.
#[derive(Debug, Clone, Default)]
pub struct FilterResources {
    integers: HashMap<String, i64>,
    strings: HashMap<String, String>,
    booleans: HashMap<String, bool>,
}

impl FilterResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_integer(mut self, name: impl Into<String>, value: i64) -> Self {
        self.integers.insert(name.into(), value);
        self
    }

    pub fn with_string(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.insert(name.into(), value.into());
        self
    }

    pub fn with_boolean(mut self, name: impl Into<String>, value: bool) -> Self {
        self.booleans.insert(name.into(), value);
        self
    }

    fn integer(&self, name: &str) -> Option<i64> {
        self.integers.get(name).copied()
    }

    fn string(&self, name: &str) -> Option<&str> {
        self.strings.get(name).map(String::as_str)
    }

    fn boolean(&self, name: &str) -> Option<bool> {
        self.booleans.get(name).copied()
    }
}

/// Error loading a filter document.
#[derive(Debug, Error)]
pub enum FilterLoadError {
    #[error("invalid filter document: {0}")]
    Document(#[from] toml::de::Error),
}

impl DeviceFilter {
    /// Load an ordered filter list from a TOML document.
    ///
    /// Records live in a `[[usb-device]]` array. Legacy field aliases
    /// (`vendorId`/`venderId`, `productId`, `manufacture`, `product`,
    /// `serial`) are honored. Malformed records are skipped with a
    /// warning.
    pub fn load_list(
        text: &str,
        resources: &FilterResources,
    ) -> Result<Vec<DeviceFilter>, FilterLoadError> {
        let doc: toml::Value = toml::from_str(text)?;
        let Some(records) = doc.get("usb-device") else {
            return Ok(Vec::new());
        };
        let Some(records) = records.as_array() else {
            warn!("`usb-device` is not an array of records, ignoring filter list");
            return Ok(Vec::new());
        };

        let mut filters = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match parse_record(record, resources) {
                Ok(filter) => filters.push(filter),
                Err(reason) => {
                    warn!("skipping malformed usb-device record {}: {}", index, reason);
                }
            }
        }
        Ok(filters)
    }
}

fn parse_record(record: &toml::Value, resources: &FilterResources) -> Result<DeviceFilter, String> {
    let table = record
        .as_table()
        .ok_or_else(|| format!("expected a record table, got {}", record.type_str()))?;

    Ok(DeviceFilter {
        vendor_id: read_u16(table, &["vendor-id", "vendorId", "venderId"], resources)?,
        product_id: read_u16(table, &["product-id", "productId"], resources)?,
        class: read_u8(table, &["class"], resources)?,
        subclass: read_u8(table, &["subclass"], resources)?,
        protocol: read_u8(table, &["protocol"], resources)?,
        manufacturer: read_string(table, &["manufacturer-name", "manufacture"], resources)?,
        product: read_string(table, &["product-name", "product"], resources)?,
        serial: read_string(table, &["serial-number", "serial"], resources)?,
        exclude: read_bool(table, &["exclude"], resources)?.unwrap_or(false),
    })
}

fn first<'a>(table: &'a toml::value::Table, names: &[&str]) -> Option<&'a toml::Value> {
    names.iter().find_map(|name| table.get(*name))
}

fn read_u16(
    table: &toml::value::Table,
    names: &[&str],
    resources: &FilterResources,
) -> Result<Option<u16>, String> {
    read_integer(table, names, resources)?
        .map(|raw| {
            u16::try_from(raw).map_err(|_| format!("value {} out of range for `{}`", raw, names[0]))
        })
        .transpose()
}

fn read_u8(
    table: &toml::value::Table,
    names: &[&str],
    resources: &FilterResources,
) -> Result<Option<u8>, String> {
    read_integer(table, names, resources)?
        .map(|raw| {
            u8::try_from(raw).map_err(|_| format!("value {} out of range for `{}`", raw, names[0]))
        })
        .transpose()
}

fn read_integer(
    table: &toml::value::Table,
    names: &[&str],
    resources: &FilterResources,
) -> Result<Option<i64>, String> {
    let Some(value) = first(table, names) else {
        return Ok(None);
    };
    let raw = match value {
        toml::Value::Integer(i) => *i,
        toml::Value::String(s) => {
            if let Some(name) = s.strip_prefix('@') {
                resources
                    .integer(name)
                    .ok_or_else(|| format!("unknown integer resource `@{}`", name))?
            } else {
                parse_number(s)?
            }
        }
        other => {
            return Err(format!(
                "`{}` expects an integer or string, got {}",
                names[0],
                other.type_str()
            ));
        }
    };
    // An explicit -1 is the legacy spelling of "unconstrained".
    if raw == -1 {
        return Ok(None);
    }
    Ok(Some(raw))
}

fn read_string(
    table: &toml::value::Table,
    names: &[&str],
    resources: &FilterResources,
) -> Result<Option<String>, String> {
    let Some(value) = first(table, names) else {
        return Ok(None);
    };
    let s = value.as_str().ok_or_else(|| {
        format!("`{}` expects a string, got {}", names[0], value.type_str())
    })?;
    if let Some(name) = s.strip_prefix('@') {
        return resources
            .string(name)
            .map(|v| Some(v.to_string()))
            .ok_or_else(|| format!("unknown string resource `@{}`", name));
    }
    Ok(Some(s.to_string()))
}

fn read_bool(
    table: &toml::value::Table,
    names: &[&str],
    resources: &FilterResources,
) -> Result<Option<bool>, String> {
    let Some(value) = first(table, names) else {
        return Ok(None);
    };
    match value {
        toml::Value::Boolean(b) => Ok(Some(*b)),
        toml::Value::Integer(i) => Ok(Some(*i != 0)),
        toml::Value::String(s) => {
            if s.eq_ignore_ascii_case("true") {
                Ok(Some(true))
            } else if s.eq_ignore_ascii_case("false") {
                Ok(Some(false))
            } else if let Some(name) = s.strip_prefix('@') {
                resources
                    .boolean(name)
                    .map(Some)
                    .ok_or_else(|| format!("unknown boolean resource `@{}`", name))
            } else {
                Ok(Some(parse_number(s)? != 0))
            }
        }
        other => Err(format!(
            "`{}` expects a boolean, got {}",
            names[0],
            other.type_str()
        )),
    }
}

fn parse_number(s: &str) -> Result<i64, String> {
    let t = s.trim();
    let (digits, radix) = if t.len() > 2 && (t.starts_with("0x") || t.starts_with("0X")) {
        (&t[2..], 16)
    } else {
        (t, 10)
    };
    i64::from_str_radix(digits, radix).map_err(|_| format!("`{}` is not a number", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DeviceInfo, InterfaceInfo};

    fn camera() -> DeviceInfo {
        DeviceInfo {
            name: "/dev/bus/usb/001/004".to_string(),
            vendor_id: 0x1234,
            product_id: 0x0001,
            class: 0xef,
            subclass: 0x02,
            protocol: 0x01,
            manufacturer: None,
            product: None,
            serial: None,
            configuration_count: 1,
            version: None,
            interfaces: vec![
                InterfaceInfo {
                    number: 0,
                    alternate_setting: 0,
                    class: 14,
                    subclass: 1,
                    protocol: 0,
                },
                InterfaceInfo {
                    number: 1,
                    alternate_setting: 0,
                    class: 14,
                    subclass: 2,
                    protocol: 0,
                },
            ],
        }
    }

    #[test]
    fn test_wildcard_filter_matches_everything() {
        assert!(DeviceFilter::any().matches(&camera()));
    }

    #[test]
    fn test_filter_from_device_matches_at_device_level() {
        let device = camera();
        let filter = DeviceFilter::from_device(&device, false);
        assert!(filter.matches(&device));
        // The device-level triple matches directly, so the interface
        // walk is never needed.
        let mut bare = device.clone();
        bare.interfaces.clear();
        assert!(filter.matches(&bare));
    }

    #[test]
    fn test_interface_triple_branch() {
        let filter = DeviceFilter {
            class: Some(14),
            subclass: Some(1),
            ..DeviceFilter::default()
        };
        // Device-level triple (0xef/0x02/0x01) does not match, interface 0 does.
        assert!(filter.matches(&camera()));

        let filter = DeviceFilter {
            class: Some(3),
            ..DeviceFilter::default()
        };
        assert!(!filter.matches(&camera()));
    }

    #[test]
    fn test_vendor_product_gate() {
        let mut filter = DeviceFilter::any();
        filter.vendor_id = Some(0x9999);
        assert!(!filter.matches(&camera()));
        filter.vendor_id = Some(0x1234);
        filter.product_id = Some(0x0002);
        assert!(!filter.matches(&camera()));
    }

    #[test]
    fn test_exclude_flag_does_not_affect_matching() {
        let device = camera();
        let filter = DeviceFilter::from_device(&device, true);
        assert!(filter.matches(&device));
    }

    #[test]
    fn test_wildcard_filters_are_never_equivalent() {
        let wildcard = DeviceFilter::any();
        assert!(!wildcard.is_equivalent(&wildcard.clone()));
        assert!(!wildcard.is_exact_match(&camera()));
    }

    #[test]
    fn test_concrete_equivalence() {
        let device = camera();
        let a = DeviceFilter::from_device(&device, false);
        let b = DeviceFilter::from_device(&device, false);
        assert!(a.is_equivalent(&b));
        assert!(a.is_exact_match(&device));

        let excluded = DeviceFilter::from_device(&device, true);
        assert!(!a.is_equivalent(&excluded));
        assert!(!excluded.is_exact_match(&device));

        let mut renamed = b.clone();
        renamed.manufacturer = Some("Acme".to_string());
        assert!(!a.is_equivalent(&renamed));
    }

    #[test]
    fn test_load_list_basic() {
        let text = r#"
            [[usb-device]]
            vendor-id = "0x1234"
            product-id = 1
            class = 14

            [[usb-device]]
            vendorId = 4660
            exclude = true
        "#;
        let filters = DeviceFilter::load_list(text, &FilterResources::new()).unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].vendor_id, Some(0x1234));
        assert_eq!(filters[0].product_id, Some(1));
        assert_eq!(filters[0].class, Some(14));
        assert!(!filters[0].exclude);
        assert!(filters[1].exclude);
    }

    #[test]
    fn test_load_list_resource_indirection() {
        let resources = FilterResources::new()
            .with_integer("camera_vendor", 0x1234)
            .with_string("camera_name", "Conference Cam")
            .with_boolean("hide_hub", true);
        let text = r#"
            [[usb-device]]
            vendor-id = "@camera_vendor"
            product-name = "@camera_name"
            exclude = "@hide_hub"
        "#;
        let filters = DeviceFilter::load_list(text, &resources).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].vendor_id, Some(0x1234));
        assert_eq!(filters[0].product.as_deref(), Some("Conference Cam"));
        assert!(filters[0].exclude);
    }

    #[test]
    fn test_load_list_skips_malformed_records() {
        let text = r#"
            [[usb-device]]
            vendor-id = "not a number"

            [[usb-device]]
            vendor-id = 0x10000

            [[usb-device]]
            vendor-id = "@missing"

            [[usb-device]]
            vendor-id = 2
        "#;
        let filters = DeviceFilter::load_list(text, &FilterResources::new()).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].vendor_id, Some(2));
    }

    #[test]
    fn test_load_list_legacy_aliases_and_wildcard_sentinel() {
        let text = r#"
            [[usb-device]]
            venderId = "0xABCD"
            productId = -1
            manufacture = "Acme"
            serial = "SN1"
        "#;
        let filters = DeviceFilter::load_list(text, &FilterResources::new()).unwrap();
        assert_eq!(filters[0].vendor_id, Some(0xabcd));
        assert_eq!(filters[0].product_id, None);
        assert_eq!(filters[0].manufacturer.as_deref(), Some("Acme"));
        assert_eq!(filters[0].serial.as_deref(), Some("SN1"));
    }

    #[test]
    fn test_load_list_document_error() {
        assert!(DeviceFilter::load_list("not [ valid toml", &FilterResources::new()).is_err());
    }

    #[test]
    fn test_load_list_without_records() {
        let filters = DeviceFilter::load_list("", &FilterResources::new()).unwrap();
        assert!(filters.is_empty());
    }
}
