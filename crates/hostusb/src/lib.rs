//! Host-side USB service boundary
//!
//! This crate defines the types and traits through which the device
//! monitor talks to the platform USB stack: immutable device identity
//! records, device-key derivation, declarative device filters, the
//! [`UsbHost`]/[`DeviceConnection`] traits, and the host event stream.
//! A scriptable in-memory implementation lives in [`mock`] for tests
//! and demos.

pub mod error;
pub mod filter;
pub mod host;
pub mod identity;
pub mod key;
pub mod mock;

pub use error::{HostError, Result};
pub use filter::{DeviceFilter, FilterLoadError, FilterResources};
pub use host::{ClaimedInterface, DeviceConnection, EventSink, HostEvent, UsbHost};
pub use identity::{DeviceInfo, InterfaceInfo, vendor_name};
pub use key::{device_key, device_key_name};
