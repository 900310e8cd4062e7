//! Camera and HID sessions
//!
//! Sessions bridge an open [`UsbControlBlock`] to the native
//! boundaries: they derive the usbfs root from the device node path,
//! hand the native layer the connection's file descriptor and
//! bus/device numbers, and keep the small amount of bookkeeping the
//! native layer expects (the HID pair's primary/secondary descriptors).

use crate::block::UsbControlBlock;
use crate::transport::{
    DisplayTarget, FrameDecoder, FrameSink, HidTransport, PixelFormat, PreviewConfig, SnapshotSink,
    TransportError, TransportResult,
};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_USBFS: &str = "/dev/bus/usb";

/// Derive the usbfs root from a device node path: everything up to the
/// bus/device segments, or `/dev/bus/usb` when the path is too short.
pub fn usbfs_root(name: &str) -> String {
    let segments: Vec<&str> = name.split('/').collect();
    if segments.len() > 2 {
        segments[..segments.len() - 2].join("/")
    } else {
        DEFAULT_USBFS.to_string()
    }
}

/// One video preview session over a frame decoder.
pub struct CameraSession {
    decoder: Box<dyn FrameDecoder>,
    preview: PreviewConfig,
    connected: bool,
}

impl CameraSession {
    pub fn new(decoder: Box<dyn FrameDecoder>) -> Self {
        Self {
            decoder,
            preview: PreviewConfig::default(),
            connected: false,
        }
    }

    /// Bind the decoder to the control block's device.
    pub fn open(&mut self, block: &UsbControlBlock) -> TransportResult<()> {
        let fd = block
            .file_descriptor()
            .ok_or_else(|| TransportError::Unavailable("control block is closed".to_string()))?;
        let root = usbfs_root(block.device_name());
        self.decoder.init(&root)?;
        self.decoder.connect(
            block.vendor_id(),
            block.product_id(),
            fd,
            block.bus_number(),
            block.device_number(),
        )?;
        self.connected = true;
        info!(
            "camera session opened for {} via {}",
            block.device_name(),
            root
        );
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Apply preview settings; the decoder keeps them until changed.
    pub fn configure_preview(&mut self, preview: PreviewConfig) -> TransportResult<()> {
        self.preview = preview;
        self.decoder.set_preview_size(&self.preview)
    }

    pub fn set_display_target(&mut self, target: DisplayTarget) -> TransportResult<()> {
        self.decoder.set_display_target(target)
    }

    pub fn start_preview(&mut self) -> TransportResult<()> {
        self.decoder.set_preview_size(&self.preview)?;
        self.decoder.start_preview()
    }

    pub fn stop_preview(&mut self) -> TransportResult<()> {
        self.decoder.stop_preview()
    }

    pub fn set_frame_sink(&mut self, sink: FrameSink, format: PixelFormat) -> TransportResult<()> {
        self.decoder.set_frame_sink(sink, format)
    }

    /// Release the device but keep the decoder usable.
    pub fn release(&mut self) {
        self.decoder.release();
        self.connected = false;
    }

    /// Tear the decoder down.
    pub fn destroy(&mut self) {
        self.decoder.destroy();
        self.connected = false;
    }
}

/// One session over the HID transport, tracking the descriptor pair of
/// a dual-endpoint peripheral.
pub struct HidSession {
    transport: Box<dyn HidTransport>,
    sink: Option<Arc<dyn SnapshotSink>>,
    primary_fd: i32,
    secondary_fd: i32,
}

impl HidSession {
    pub fn new(transport: Box<dyn HidTransport>) -> Self {
        Self {
            transport,
            sink: None,
            primary_fd: 0,
            secondary_fd: 0,
        }
    }

    /// Also hand received frames to a snapshot sink.
    pub fn with_snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn init(&mut self) -> TransportResult<()> {
        self.transport.init()
    }

    /// Start the transport on a control block's descriptor and return
    /// the first frame. The first distinct descriptor becomes the
    /// primary, the second the secondary.
    pub fn start(&mut self, block: &UsbControlBlock, request_data: bool) -> TransportResult<Vec<u8>> {
        let fd = block
            .file_descriptor()
            .ok_or_else(|| TransportError::Unavailable("control block is closed".to_string()))?;
        if self.primary_fd == 0 {
            self.primary_fd = fd;
        } else if self.secondary_fd == 0 && fd != self.primary_fd {
            self.secondary_fd = fd;
        }
        let frame = self
            .transport
            .start(block.vendor_id(), block.product_id(), fd, request_data)?;
        info!("fd {} frame size = {}", fd, frame.len());
        if let Some(sink) = &self.sink {
            sink.write(&format!("hid-{}", fd), &frame);
        }
        Ok(frame)
    }

    /// Stop both descriptors of the pair.
    pub fn stop(&mut self, vendor_id: u16, product_id: u16) {
        for fd in [self.primary_fd, self.secondary_fd] {
            if fd != 0
                && let Err(e) = self.transport.stop(vendor_id, product_id, fd)
            {
                warn!("hid stop on fd {} failed: {}", fd, e);
            }
        }
        self.primary_fd = 0;
        self.secondary_fd = 0;
    }

    pub fn auto_frame(&mut self, frame: &[u8], file_descriptor: i32) -> TransportResult<Vec<u8>> {
        self.transport.auto_frame(frame, file_descriptor)
    }

    pub fn exit(&mut self) -> TransportResult<()> {
        self.transport.exit()
    }

    pub fn descriptor_pair(&self) -> (i32, i32) {
        (self.primary_fd, self.secondary_fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorLink;
    use hostusb::mock::{MockHost, sample_device};
    use std::sync::Mutex;

    #[test]
    fn test_usbfs_root_derivation() {
        assert_eq!(usbfs_root("/dev/bus/usb/001/004"), "/dev/bus/usb");
        assert_eq!(usbfs_root("/sys/bus/usb/devices/003/007"), "/sys/bus/usb/devices");
        assert_eq!(usbfs_root("001/004"), "/dev/bus/usb");
        assert_eq!(usbfs_root(""), "/dev/bus/usb");
    }

    #[derive(Default)]
    struct RecordingDecoder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FrameDecoder for RecordingDecoder {
        fn init(&mut self, usbfs_root: &str) -> TransportResult<()> {
            self.calls.lock().unwrap().push(format!("init {}", usbfs_root));
            Ok(())
        }

        fn connect(
            &mut self,
            vendor_id: u16,
            product_id: u16,
            file_descriptor: i32,
            bus_number: u32,
            device_number: u32,
        ) -> TransportResult<()> {
            self.calls.lock().unwrap().push(format!(
                "connect {:04x}:{:04x} fd={} bus={} dev={}",
                vendor_id, product_id, file_descriptor, bus_number, device_number
            ));
            Ok(())
        }

        fn set_preview_size(&mut self, preview: &PreviewConfig) -> TransportResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("preview {}x{}", preview.width, preview.height));
            Ok(())
        }

        fn set_display_target(&mut self, target: DisplayTarget) -> TransportResult<()> {
            self.calls.lock().unwrap().push(format!("display {}", target.0));
            Ok(())
        }

        fn start_preview(&mut self) -> TransportResult<()> {
            self.calls.lock().unwrap().push("start".to_string());
            Ok(())
        }

        fn stop_preview(&mut self) -> TransportResult<()> {
            self.calls.lock().unwrap().push("stop".to_string());
            Ok(())
        }

        fn set_frame_sink(&mut self, _sink: FrameSink, _format: PixelFormat) -> TransportResult<()> {
            self.calls.lock().unwrap().push("sink".to_string());
            Ok(())
        }

        fn release(&mut self) {
            self.calls.lock().unwrap().push("release".to_string());
        }

        fn destroy(&mut self) {
            self.calls.lock().unwrap().push("destroy".to_string());
        }
    }

    fn open_block(host: &MockHost, bus: u8, addr: u8) -> Arc<UsbControlBlock> {
        let device = sample_device(bus, addr, 0x1234, 0x0001);
        host.add_device(device.clone());
        host.set_permitted(&device, true);
        let (tx, _rx) = async_channel::unbounded();
        UsbControlBlock::open(host, device, MonitorLink::new(tx)).unwrap()
    }

    #[test]
    fn test_camera_session_drives_decoder() {
        let host = MockHost::new();
        let block = open_block(&host, 1, 4);
        let decoder = RecordingDecoder::default();
        let calls = Arc::clone(&decoder.calls);

        let mut session = CameraSession::new(Box::new(decoder));
        session.open(&block).unwrap();
        session.start_preview().unwrap();
        session.stop_preview().unwrap();
        session.release();

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0], "init /dev/bus/usb");
        assert!(calls[1].starts_with("connect 1234:0001 fd="));
        assert!(calls[1].ends_with("bus=1 dev=4"));
        // start_preview re-applies the current preview settings first.
        assert_eq!(
            &calls[2..],
            &[
                "preview 1280x720".to_string(),
                "start".to_string(),
                "stop".to_string(),
                "release".to_string()
            ]
        );
        assert!(!session.is_connected());
    }

    #[test]
    fn test_camera_session_requires_open_block() {
        let host = MockHost::new();
        let block = open_block(&host, 1, 4);
        block.close();
        let mut session = CameraSession::new(Box::new(RecordingDecoder::default()));
        assert!(session.open(&block).is_err());
    }

    #[derive(Default)]
    struct RecordingTransport {
        stops: Vec<i32>,
    }

    impl HidTransport for RecordingTransport {
        fn init(&mut self) -> TransportResult<()> {
            Ok(())
        }

        fn start(
            &mut self,
            _vendor_id: u16,
            _product_id: u16,
            file_descriptor: i32,
            _request_data: bool,
        ) -> TransportResult<Vec<u8>> {
            Ok(vec![file_descriptor as u8, 0x01, 0x02])
        }

        fn stop(
            &mut self,
            _vendor_id: u16,
            _product_id: u16,
            file_descriptor: i32,
        ) -> TransportResult<()> {
            self.stops.push(file_descriptor);
            Ok(())
        }

        fn auto_frame(&mut self, frame: &[u8], _file_descriptor: i32) -> TransportResult<Vec<u8>> {
            Ok(frame.to_vec())
        }

        fn exit(&mut self) -> TransportResult<()> {
            Ok(())
        }
    }

    struct RecordingSink {
        labels: Mutex<Vec<String>>,
    }

    impl SnapshotSink for RecordingSink {
        fn write(&self, label: &str, _bytes: &[u8]) {
            self.labels.lock().unwrap().push(label.to_string());
        }
    }

    #[test]
    fn test_hid_session_tracks_descriptor_pair() {
        let host = MockHost::new();
        let first = open_block(&host, 1, 4);
        let second = open_block(&host, 1, 5);
        let sink = Arc::new(RecordingSink {
            labels: Mutex::new(Vec::new()),
        });

        let mut session =
            HidSession::new(Box::new(RecordingTransport::default())).with_snapshot_sink(sink.clone());
        session.init().unwrap();
        session.start(&first, true).unwrap();
        session.start(&second, false).unwrap();

        let (primary, secondary) = session.descriptor_pair();
        assert_eq!(primary, first.file_descriptor().unwrap());
        assert_eq!(secondary, second.file_descriptor().unwrap());
        assert_ne!(primary, secondary);

        session.stop(0x1234, 0x0001);
        assert_eq!(session.descriptor_pair(), (0, 0));

        let labels = sink.labels.lock().unwrap();
        assert_eq!(labels.len(), 2);
        assert!(labels[0].starts_with("hid-"));
    }
}
