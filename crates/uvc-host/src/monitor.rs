//! Device monitor
//!
//! [`DeviceMonitor`] orchestrates discovery polling, permission
//! requests, connect/cancel/attach/detach dispatch, and the control
//! block registry. Two dedicated worker threads back it: the primary
//! worker runs the discovery poll and delivers every listener callback,
//! the secondary worker only carries the second device of a dual
//! connect so the two connects never queue behind each other.
//!
//! Host events (permission results, hotplug broadcasts) may arrive on
//! any platform thread; they are forwarded into the primary worker's
//! command queue and handled there, single-consumer, in arrival order.
//! The discovery poll is a defensive redundancy under the event-driven
//! path: hotplug broadcasts are unreliable on some platform versions.

use crate::block::UsbControlBlock;
use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::events::{DeviceConnectListener, Notification};
use crate::permissions::{PermissionCache, PermissionOutcome, PermissionTicket, PermissionWaiters};
use hostusb::{DeviceFilter, DeviceInfo, EventSink, HostEvent, UsbHost, device_key_name};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often an idle worker re-checks its queue and poll deadline.
const DISPATCH_GRANULARITY: Duration = Duration::from_millis(10);

/// Work items consumed by the monitor workers.
pub(crate) enum Command {
    /// Forwarded platform event
    Host(HostEvent),
    /// Listener notification to deliver
    Notify(Notification),
    /// Create-or-reuse a control block and report `on_connect`
    Connect { device: DeviceInfo, slot: usize },
    /// A control block finished closing
    Deregister {
        device: DeviceInfo,
        block: Arc<UsbControlBlock>,
    },
    StartPolling,
    StopPolling,
    Shutdown,
}

/// Non-owning handle from a control block back to its monitor.
///
/// Holds only a sender into the primary worker's queue; when the
/// monitor is gone the send fails and the deregistration is skipped
/// silently.
#[derive(Clone)]
pub(crate) struct MonitorLink {
    tx: async_channel::Sender<Command>,
}

impl MonitorLink {
    pub(crate) fn new(tx: async_channel::Sender<Command>) -> Self {
        Self { tx }
    }

    pub(crate) fn deregister(&self, device: DeviceInfo, block: Arc<UsbControlBlock>) {
        let _ = self.tx.send_blocking(Command::Deregister { device, block });
    }
}

struct Inner {
    host: Arc<dyn UsbHost>,
    poll_interval: Duration,
    initial_poll_delay: Duration,
    discovery_filters: Vec<DeviceFilter>,
    listener: RwLock<Option<Arc<dyn DeviceConnectListener>>>,
    registry: Mutex<HashMap<DeviceInfo, Arc<UsbControlBlock>>>,
    working_set: Mutex<Vec<DeviceInfo>>,
    permissions: PermissionCache,
    waiters: PermissionWaiters,
    destroyed: AtomicBool,
    registered: AtomicBool,
    device_count: AtomicUsize,
    primary_tx: async_channel::Sender<Command>,
    secondary_tx: async_channel::Sender<Command>,
}

/// The USB device discovery, permission, and control-block lifecycle
/// manager.
///
/// Lifecycle: construct once, `init` to bind the listener, `register`
/// to start watching, `unregister` to stop watching (open control
/// blocks stay usable), `destroy` to tear everything down. `destroy`
/// is terminal and idempotent.
pub struct DeviceMonitor {
    inner: Arc<Inner>,
    primary_rx: Mutex<Option<async_channel::Receiver<Command>>>,
    secondary_rx: Mutex<Option<async_channel::Receiver<Command>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DeviceMonitor {
    /// Create a monitor over the given host with no discovery filters.
    pub fn new(host: Arc<dyn UsbHost>, config: MonitorConfig) -> Self {
        Self::with_discovery_filters(host, config, Vec::new())
    }

    /// Create a monitor whose discovery poll only reports devices
    /// passing the given filter list (first matching filter decides;
    /// empty list reports everything).
    pub fn with_discovery_filters(
        host: Arc<dyn UsbHost>,
        config: MonitorConfig,
        discovery_filters: Vec<DeviceFilter>,
    ) -> Self {
        let (primary_tx, primary_rx) = async_channel::unbounded();
        let (secondary_tx, secondary_rx) = async_channel::unbounded();
        Self {
            inner: Arc::new(Inner {
                host,
                poll_interval: config.poll_interval(),
                initial_poll_delay: config.initial_poll_delay(),
                discovery_filters,
                listener: RwLock::new(None),
                registry: Mutex::new(HashMap::new()),
                working_set: Mutex::new(Vec::new()),
                permissions: PermissionCache::default(),
                waiters: PermissionWaiters::default(),
                destroyed: AtomicBool::new(false),
                registered: AtomicBool::new(false),
                device_count: AtomicUsize::new(0),
                primary_tx,
                secondary_tx,
            }),
            primary_rx: Mutex::new(Some(primary_rx)),
            secondary_rx: Mutex::new(Some(secondary_rx)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Bind the connect-event listener and start the worker threads.
    ///
    /// Must be called before [`register`](Self::register). Calling it
    /// again replaces the listener.
    pub fn init(&self, listener: Arc<dyn DeviceConnectListener>) -> Result<(), MonitorError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(MonitorError::Destroyed);
        }
        *self.inner.listener.write().unwrap() = Some(listener);

        let mut workers = self.workers.lock().unwrap();
        if let Some(rx) = self.primary_rx.lock().unwrap().take() {
            let inner = Arc::clone(&self.inner);
            workers.push(
                thread::Builder::new()
                    .name("usb-monitor".to_string())
                    .spawn(move || run_worker(inner, rx, true))
                    .expect("failed to spawn monitor worker"),
            );
        }
        if let Some(rx) = self.secondary_rx.lock().unwrap().take() {
            let inner = Arc::clone(&self.inner);
            workers.push(
                thread::Builder::new()
                    .name("usb-monitor-sec".to_string())
                    .spawn(move || run_worker(inner, rx, false))
                    .expect("failed to spawn monitor worker"),
            );
        }
        Ok(())
    }

    /// Start watching: subscribe to host events and start the discovery
    /// poll. Idempotent while already registered.
    pub fn register(&self) -> Result<(), MonitorError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(MonitorError::Destroyed);
        }
        if self.inner.listener.read().unwrap().is_none() {
            return Err(MonitorError::NotInitialized);
        }
        if self.inner.registered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.device_count.store(0, Ordering::SeqCst);

        let tx = self.inner.primary_tx.clone();
        let sink: EventSink = Arc::new(move |event| {
            let _ = tx.send_blocking(Command::Host(event));
        });
        if let Err(e) = self.inner.host.subscribe(sink) {
            warn!("host event subscription failed: {}", e);
        }
        self.inner.send_primary(Command::StartPolling);
        info!("monitor registered");
        Ok(())
    }

    /// Stop watching for new devices. Open control blocks are kept;
    /// active sessions continue to work.
    pub fn unregister(&self) -> Result<(), MonitorError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(MonitorError::Destroyed);
        }
        self.inner.device_count.store(0, Ordering::SeqCst);
        if self.inner.registered.swap(false, Ordering::SeqCst) {
            self.inner.host.unsubscribe();
            self.inner.send_primary(Command::StopPolling);
            info!("monitor unregistered");
        }
        Ok(())
    }

    /// Whether the monitor is currently watching.
    pub fn is_registered(&self) -> bool {
        !self.inner.destroyed.load(Ordering::SeqCst)
            && self.inner.registered.load(Ordering::SeqCst)
    }

    /// Terminal teardown: unregister, close every control block, clear
    /// the registry, and stop the workers. Runs its body at most once;
    /// later calls are no-ops.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.device_count.store(0, Ordering::SeqCst);
        if self.inner.registered.swap(false, Ordering::SeqCst) {
            self.inner.host.unsubscribe();
        }

        let blocks: Vec<Arc<UsbControlBlock>> = {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.drain().map(|(_, block)| block).collect()
        };
        // Close failures are logged inside close(); one bad entry must
        // not block the rest.
        for block in blocks {
            block.close();
        }
        self.inner.waiters.clear();

        let _ = self.inner.primary_tx.send_blocking(Command::Shutdown);
        let _ = self.inner.secondary_tx.send_blocking(Command::Shutdown);
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        info!("monitor destroyed");
    }

    /// Enumerate host-visible devices matching `filter` (and not
    /// excluded by it). Returns `None` once destroyed. Matches are also
    /// remembered in the monitor's working set.
    pub fn list_devices(&self, filter: &DeviceFilter) -> Option<Vec<DeviceInfo>> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return None;
        }
        let all = match self.inner.host.list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("device enumeration failed: {}", e);
                Vec::new()
            }
        };
        let result: Vec<DeviceInfo> = all
            .into_iter()
            .filter(|device| filter.matches(device) && !filter.exclude)
            .collect();
        self.inner
            .working_set
            .lock()
            .unwrap()
            .extend(result.iter().cloned());
        info!("device count: {}", result.len());
        Some(result)
    }

    /// Devices remembered by previous [`list_devices`](Self::list_devices)
    /// calls.
    pub fn known_devices(&self) -> Vec<DeviceInfo> {
        self.inner.working_set.lock().unwrap().clone()
    }

    /// Request OS permission for a device.
    ///
    /// Returns true when there is nothing to wait for: the monitor is
    /// not watching, permission is already granted, or the prompt could
    /// not even be issued (a cancel notification follows). Returns
    /// false when a prompt was issued; the grant or denial arrives
    /// later through the listener, or through a
    /// [`subscribe_permission`](Self::subscribe_permission) ticket.
    pub fn request_permission(&self, device: &DeviceInfo) -> bool {
        if !self.is_registered() {
            self.inner.process_cancel(device);
            return true;
        }
        if self.inner.host.has_permission(device) {
            return true;
        }
        match self.inner.host.request_permission(device) {
            Ok(()) => false,
            Err(e) => {
                warn!("permission prompt for {} failed: {}", device, e);
                self.inner.process_cancel(device);
                true
            }
        }
    }

    /// Request OS permission for several devices at once.
    ///
    /// True when every device is already permitted (or the monitor is
    /// not watching, or issuing a prompt failed — callers react to a
    /// later cancel notification rather than asserting per-device
    /// success); false when prompts went out.
    pub fn request_permission_all(&self, devices: &[DeviceInfo]) -> bool {
        if !self.is_registered() {
            return true;
        }
        let granted = devices
            .iter()
            .filter(|device| self.inner.host.has_permission(device))
            .count();
        if granted == devices.len() {
            return true;
        }
        for device in devices {
            if let Err(e) = self.inner.host.request_permission(device) {
                warn!("permission prompt for {} failed: {}", device, e);
                return true;
            }
        }
        false
    }

    /// A ticket that resolves when the platform answers a permission
    /// prompt for this device. Resolves immediately when permission is
    /// already held; resolves to `None` if the monitor is destroyed
    /// first. Pair with [`request_permission`](Self::request_permission),
    /// which issues the prompt.
    pub fn subscribe_permission(&self, device: &DeviceInfo) -> PermissionTicket {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return PermissionTicket::cancelled();
        }
        if self.inner.host.has_permission(device) {
            return PermissionTicket::resolved(PermissionOutcome::Granted);
        }
        self.inner.waiters.register(device)
    }

    /// Get the registry's control block for a device, opening a new
    /// connection when none exists.
    ///
    /// Fails with [`MonitorError::PermissionRequired`] when the
    /// platform does not currently grant access. Safe to call
    /// concurrently with the discovery poll: at most one block exists
    /// per device identity.
    pub fn open_device(&self, device: &DeviceInfo) -> Result<Arc<UsbControlBlock>, MonitorError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(MonitorError::Destroyed);
        }
        if !self.inner.check_permission(device) {
            return Err(MonitorError::PermissionRequired {
                device: device.to_string(),
            });
        }
        let (block, _) = self.inner.create_or_reuse(device)?;
        Ok(block)
    }

    /// Replace the registry entry for a device with a freshly opened
    /// connection. The previous block, if any, is closed (its
    /// `on_disconnect` still fires).
    pub fn reopen(&self, device: &DeviceInfo) -> Result<Arc<UsbControlBlock>, MonitorError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(MonitorError::Destroyed);
        }
        if !self.inner.check_permission(device) {
            return Err(MonitorError::PermissionRequired {
                device: device.to_string(),
            });
        }
        let previous = self.inner.registry.lock().unwrap().remove(device);
        if let Some(previous) = previous {
            previous.close();
        }
        let (block, _) = self.inner.create_or_reuse(device)?;
        Ok(block)
    }

    /// Connect one or two devices, delivering `on_connect` per device.
    ///
    /// The first device is handled on the primary worker, the second on
    /// the secondary worker so neither waits for the other's descriptor
    /// reads. Each create-or-reuses against the shared registry. A
    /// failed open surfaces as `on_cancel` for that device.
    pub fn connect(&self, devices: &[DeviceInfo]) -> Result<(), MonitorError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(MonitorError::Destroyed);
        }
        if self.inner.listener.read().unwrap().is_none() {
            return Err(MonitorError::NotInitialized);
        }
        for device in devices {
            self.inner.permissions.update(device, true);
        }
        let Some(first) = devices.first() else {
            return Ok(());
        };
        self.inner.send_primary(Command::Connect {
            device: first.clone(),
            slot: 0,
        });
        if let Some(second) = devices.get(1) {
            let _ = self.inner.secondary_tx.send_blocking(Command::Connect {
                device: second.clone(),
                slot: 1,
            });
        }
        if devices.len() > 2 {
            warn!(
                "connect handles two devices per call; ignoring {} extra",
                devices.len() - 2
            );
        }
        Ok(())
    }

    /// Deterministic identity key for a device (see
    /// [`hostusb::device_key_name`]).
    pub fn device_key(&self, device: &DeviceInfo, serial: Option<&str>, extended: bool) -> String {
        device_key_name(device, serial, extended)
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Inner {
    fn send_primary(&self, command: Command) {
        let _ = self.primary_tx.send_blocking(command);
    }

    fn enqueue_notify(&self, notification: Notification) {
        self.send_primary(Command::Notify(notification));
    }

    fn listener(&self) -> Option<Arc<dyn DeviceConnectListener>> {
        self.listener.read().unwrap().clone()
    }

    /// Deliver a queued notification. Dropped once destroyed.
    fn deliver(&self, notification: Notification) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let Some(listener) = self.listener() else {
            return;
        };
        match notification {
            Notification::Attach(device) => listener.on_attach(&device),
            Notification::Detach(device) => listener.on_detach(&device),
            Notification::Cancel(device) => listener.on_cancel(&device),
        }
    }

    fn process_cancel(&self, device: &DeviceInfo) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.permissions.update(device, false);
        self.waiters.resolve(device, PermissionOutcome::Denied);
        self.enqueue_notify(Notification::Cancel(device.clone()));
    }

    /// Re-query and record the platform's permission answer.
    fn check_permission(&self, device: &DeviceInfo) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        let granted = self.host.has_permission(device);
        self.permissions.update(device, granted)
    }

    fn create_or_reuse(
        &self,
        device: &DeviceInfo,
    ) -> Result<(Arc<UsbControlBlock>, bool), MonitorError> {
        let mut registry = self.registry.lock().unwrap();
        if let Some(existing) = registry.get(device) {
            return Ok((Arc::clone(existing), false));
        }
        let link = MonitorLink::new(self.primary_tx.clone());
        let block = UsbControlBlock::open(self.host.as_ref(), device.clone(), link)?;
        registry.insert(device.clone(), Arc::clone(&block));
        info!("ctrl block fd: {:?}", block.file_descriptor());
        Ok((block, true))
    }

    fn handle_connect(&self, device: DeviceInfo, slot: usize) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        match self.create_or_reuse(&device) {
            Ok((block, created_new)) => {
                if self.destroyed.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(listener) = self.listener() {
                    listener.on_connect(&device, &block, created_new, slot);
                }
            }
            Err(e) => {
                warn!("connect slot {} for {} failed: {}", slot, device, e);
                self.enqueue_notify(Notification::Cancel(device));
            }
        }
    }

    /// A block finished closing. Remove it from the registry (only if
    /// it still owns its slot; a reopened identity keeps its fresh
    /// block) and report the disconnect. Not gated on `destroyed`:
    /// teardown itself closes blocks and their close sequence must be
    /// observed.
    fn handle_deregister(&self, device: DeviceInfo, block: Arc<UsbControlBlock>) {
        {
            let mut registry = self.registry.lock().unwrap();
            let owns_slot = registry
                .get(&device)
                .is_some_and(|current| Arc::ptr_eq(current, &block));
            if owns_slot {
                registry.remove(&device);
            }
        }
        if let Some(listener) = self.listener() {
            listener.on_disconnect(&device, &block);
        }
    }

    fn handle_host_event(&self, event: HostEvent) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            HostEvent::PermissionResult { device, granted } => {
                debug!("permission result for {}: granted = {}", device, granted);
                self.permissions.update(&device, granted);
                if granted {
                    // Reserved for a caller-driven connect; the
                    // application decides when to actually open.
                    self.waiters.resolve(&device, PermissionOutcome::Granted);
                } else {
                    self.waiters.resolve(&device, PermissionOutcome::Denied);
                    self.enqueue_notify(Notification::Cancel(device));
                }
            }
            HostEvent::Attached(device) => {
                let granted = self.host.has_permission(&device);
                self.permissions.update(&device, granted);
                self.enqueue_notify(Notification::Attach(device));
            }
            HostEvent::Detached(device) => {
                let block = self.registry.lock().unwrap().remove(&device);
                if let Some(block) = block {
                    block.close();
                }
                // Treat whatever remains as new on the next poll tick.
                self.device_count.store(0, Ordering::SeqCst);
                self.enqueue_notify(Notification::Detach(device));
            }
        }
    }

    /// Devices the discovery poll reports, after the configured filter
    /// list (first matching filter decides inclusion).
    fn enumerate_for_poll(&self) -> hostusb::Result<Vec<DeviceInfo>> {
        let all = self.host.list_devices()?;
        if self.discovery_filters.is_empty() {
            return Ok(all);
        }
        Ok(all
            .into_iter()
            .filter(|device| {
                self.discovery_filters
                    .iter()
                    .find(|filter| filter.matches(device))
                    .map(|filter| !filter.exclude)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// One discovery tick: rebuild the permission cache from scratch,
    /// then dispatch an attach notification per visible device when the
    /// device count or the permitted count grew since the last tick.
    fn poll_tick(&self) {
        if self.destroyed.load(Ordering::SeqCst) || !self.registered.load(Ordering::SeqCst) {
            return;
        }
        let devices = match self.enumerate_for_poll() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("discovery poll enumeration failed: {}", e);
                return;
            }
        };
        let prior_permitted = self.permissions.len();
        self.permissions.clear();
        for device in &devices {
            if self.host.has_permission(device) {
                self.permissions.update(device, true);
                self.waiters.resolve(device, PermissionOutcome::Granted);
            }
        }
        let count = devices.len();
        if count > self.device_count.load(Ordering::SeqCst)
            || self.permissions.len() > prior_permitted
        {
            self.device_count.store(count, Ordering::SeqCst);
            for device in devices {
                self.enqueue_notify(Notification::Attach(device));
            }
        }
    }
}

/// Worker loop. The primary worker (`polls = true`) additionally runs
/// the discovery poll; pending ticks are dropped, not deferred, when
/// polling stops.
fn run_worker(inner: Arc<Inner>, rx: async_channel::Receiver<Command>, polls: bool) {
    debug!("monitor worker started (polls = {})", polls);
    let mut polling = false;
    let mut next_tick: Option<Instant> = None;
    loop {
        let mut idle = true;
        while let Ok(command) = rx.try_recv() {
            idle = false;
            match command {
                Command::Shutdown => {
                    debug!("monitor worker stopped");
                    return;
                }
                Command::StartPolling => {
                    polling = true;
                    next_tick = Some(Instant::now() + inner.initial_poll_delay);
                }
                Command::StopPolling => {
                    polling = false;
                    next_tick = None;
                }
                Command::Host(event) => inner.handle_host_event(event),
                Command::Notify(notification) => inner.deliver(notification),
                Command::Connect { device, slot } => inner.handle_connect(device, slot),
                Command::Deregister { device, block } => inner.handle_deregister(device, block),
            }
        }
        if polls
            && polling
            && let Some(due) = next_tick
            && Instant::now() >= due
        {
            inner.poll_tick();
            next_tick = Some(Instant::now() + inner.poll_interval);
            idle = false;
        }
        if idle {
            thread::sleep(DISPATCH_GRANULARITY);
        }
    }
}
