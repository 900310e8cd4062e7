//! Native frame-decoder and HID-transport boundaries
//!
//! The video and HID pipelines live in native libraries behind fixed
//! function-call boundaries. These traits describe those boundaries:
//! raw byte buffers in and out, integer device identifiers (vendor id,
//! product id, file descriptor, bus number, device address), no
//! knowledge of the monitor. Implementations wrap the real libraries;
//! tests substitute recorders.

use thiserror::Error;

/// Failure reported across a native boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The native layer returned an error code.
    #[error("native layer returned {code}")]
    Native { code: i32 },
    /// The operation could not be attempted.
    #[error("{0}")]
    Unavailable(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Opaque handle to a rendering target owned by the embedding
/// application (window, surface, texture).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTarget(pub u64);

/// Pixel format requested for decoded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Raw,
    Yuv,
    Rgb565,
    Rgbx,
    Mjpeg,
    Nv21,
}

/// Preview geometry and bandwidth settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewConfig {
    pub width: u32,
    pub height: u32,
    pub min_fps: u32,
    pub max_fps: u32,
    pub mode: u32,
    pub bandwidth: f32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            min_fps: 1,
            max_fps: 30,
            mode: 0,
            bandwidth: 1.0,
        }
    }
}

/// Callback receiving decoded frames as opaque bytes.
pub type FrameSink = Box<dyn FnMut(&[u8]) + Send>;

/// Video decoder boundary.
pub trait FrameDecoder: Send {
    /// Bind the decoder to the usbfs root the device lives under.
    fn init(&mut self, usbfs_root: &str) -> TransportResult<()>;

    /// Hand the decoder an opened device.
    fn connect(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        file_descriptor: i32,
        bus_number: u32,
        device_number: u32,
    ) -> TransportResult<()>;

    fn set_preview_size(&mut self, preview: &PreviewConfig) -> TransportResult<()>;

    fn set_display_target(&mut self, target: DisplayTarget) -> TransportResult<()>;

    fn start_preview(&mut self) -> TransportResult<()>;

    fn stop_preview(&mut self) -> TransportResult<()>;

    /// Deliver decoded frames to `sink` in the given format.
    fn set_frame_sink(&mut self, sink: FrameSink, format: PixelFormat) -> TransportResult<()>;

    /// Release the current device without tearing the decoder down.
    fn release(&mut self);

    /// Tear the decoder down; the instance is unusable afterwards.
    fn destroy(&mut self);
}

/// HID transport boundary.
pub trait HidTransport: Send {
    fn init(&mut self) -> TransportResult<()>;

    /// Start the transport on a device endpoint and return the first
    /// frame. `request_data` asks the peripheral to push report data.
    fn start(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        file_descriptor: i32,
        request_data: bool,
    ) -> TransportResult<Vec<u8>>;

    fn stop(&mut self, vendor_id: u16, product_id: u16, file_descriptor: i32)
    -> TransportResult<()>;

    /// Run the auto-framing step over a frame, returning the reframed
    /// bytes.
    fn auto_frame(&mut self, frame: &[u8], file_descriptor: i32) -> TransportResult<Vec<u8>>;

    fn exit(&mut self) -> TransportResult<()>;
}

/// Injectable sink for opaque diagnostic buffers.
///
/// The core never writes files itself; embedders that want snapshot
/// dumps provide a sink and decide where the bytes go.
pub trait SnapshotSink: Send + Sync {
    fn write(&self, label: &str, bytes: &[u8]);
}
