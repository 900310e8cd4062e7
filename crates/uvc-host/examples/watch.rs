//! Watch a scripted mock host: plug a camera, grant permission, open
//! it, and print the listener traffic.
//!
//! Run with: cargo run -p uvc-host --example watch

use hostusb::mock::{DeviceProfile, MockHost, sample_device, sample_raw_descriptors};
use hostusb::{DeviceFilter, DeviceInfo, UsbHost};
use std::sync::Arc;
use std::time::Duration;
use uvc_host::{DeviceConnectListener, DeviceMonitor, MonitorConfig, UsbControlBlock};

struct PrintListener;

impl DeviceConnectListener for PrintListener {
    fn on_attach(&self, device: &DeviceInfo) {
        println!("attach     {}", device);
    }

    fn on_detach(&self, device: &DeviceInfo) {
        println!("detach     {}", device);
    }

    fn on_connect(
        &self,
        device: &DeviceInfo,
        block: &Arc<UsbControlBlock>,
        created_new: bool,
        slot: usize,
    ) {
        println!(
            "connect    {} slot={} created={} {}",
            device,
            slot,
            created_new,
            block.strings()
        );
    }

    fn on_disconnect(&self, device: &DeviceInfo, _block: &Arc<UsbControlBlock>) {
        println!("disconnect {}", device);
    }

    fn on_cancel(&self, device: &DeviceInfo) {
        println!("cancel     {}", device);
    }
}

fn main() -> anyhow::Result<()> {
    uvc_host::logging::init("info")?;

    let host = Arc::new(MockHost::new());
    let camera = sample_device(1, 4, 0x2bd9, 0x0011);
    let mut profile = DeviceProfile {
        raw_descriptors: sample_raw_descriptors(0x0200, 0x0104, 0x2bd9, 0x0011, 1, 2, 3),
        languages: vec![0x0409],
        serial: None,
        ..DeviceProfile::default()
    };
    profile
        .strings
        .insert((2, 0x0409), "Conference Camera".to_string());
    profile.strings.insert((3, 0x0409), "SN000042".to_string());
    host.add_device_with_profile(camera.clone(), profile);

    let config = MonitorConfig {
        poll_interval_ms: 200,
        initial_poll_delay_ms: 50,
        ..MonitorConfig::default()
    };
    let monitor = DeviceMonitor::new(Arc::clone(&host) as Arc<dyn UsbHost>, config);
    monitor.init(Arc::new(PrintListener))?;
    monitor.register()?;

    let listed = monitor.list_devices(&DeviceFilter::any()).unwrap_or_default();
    println!("{} device(s) visible", listed.len());

    // Prompt, then grant from the "platform" side.
    let resolved = monitor.request_permission(&camera);
    println!("prompt resolved immediately: {}", resolved);
    let ticket = monitor.subscribe_permission(&camera);
    host.grant(&camera);
    println!("permission outcome: {:?}", ticket.wait());

    let block = monitor.open_device(&camera)?;
    println!(
        "opened {} bus={} dev={} key={}",
        block.device(),
        block.bus_number(),
        block.device_number(),
        block.device_key_with_serial()
    );

    std::thread::sleep(Duration::from_millis(600));
    host.unplug(&camera);
    std::thread::sleep(Duration::from_millis(300));

    monitor.destroy();
    Ok(())
}
