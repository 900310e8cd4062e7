//! Permission cache and asynchronous permission tickets
//!
//! The cache tracks which devices the platform has most recently
//! confirmed access to. It is authoritative only until the next
//! discovery poll, which clears and rebuilds it wholesale; between
//! polls it is adjusted by permission-result events.
//!
//! A [`PermissionTicket`] is the asynchronous counterpart to the
//! fire-and-forget permission prompt: it resolves when the platform's
//! grant or denial arrives, replacing caller-side polling loops.

use hostusb::{DeviceInfo, device_key_name};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Outcome of a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// The platform granted access.
    Granted,
    /// The platform denied access.
    Denied,
}

/// Resolves when the platform answers a permission prompt.
///
/// Returned by
/// [`DeviceMonitor::subscribe_permission`](crate::DeviceMonitor::subscribe_permission).
/// `None` outcomes mean the monitor was destroyed before an answer
/// arrived.
#[derive(Debug)]
pub struct PermissionTicket {
    rx: oneshot::Receiver<PermissionOutcome>,
}

impl PermissionTicket {
    pub(crate) fn pending(rx: oneshot::Receiver<PermissionOutcome>) -> Self {
        Self { rx }
    }

    pub(crate) fn resolved(outcome: PermissionOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }

    pub(crate) fn cancelled() -> Self {
        let (tx, rx) = oneshot::channel::<PermissionOutcome>();
        drop(tx);
        Self { rx }
    }

    /// Block the calling thread until the outcome arrives.
    pub fn wait(self) -> Option<PermissionOutcome> {
        self.rx.blocking_recv().ok()
    }

    /// Await the outcome without blocking a thread.
    pub async fn outcome(self) -> Option<PermissionOutcome> {
        self.rx.await.ok()
    }

    /// Check for an outcome without waiting.
    pub fn try_outcome(&mut self) -> Option<PermissionOutcome> {
        self.rx.try_recv().ok()
    }
}

/// Devices with currently confirmed permission, keyed by the extended
/// device key.
#[derive(Default)]
pub(crate) struct PermissionCache {
    entries: Mutex<HashMap<String, DeviceInfo>>,
}

impl PermissionCache {
    fn key(device: &DeviceInfo) -> String {
        device_key_name(device, None, true)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub(crate) fn contains(&self, device: &DeviceInfo) -> bool {
        self.entries.lock().unwrap().contains_key(&Self::key(device))
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Record the platform's latest answer for a device and echo it.
    pub(crate) fn update(&self, device: &DeviceInfo, granted: bool) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if granted {
            entries
                .entry(Self::key(device))
                .or_insert_with(|| device.clone());
        } else {
            entries.remove(&Self::key(device));
        }
        granted
    }
}

/// Outstanding permission tickets, keyed like the cache.
#[derive(Default)]
pub(crate) struct PermissionWaiters {
    waiting: Mutex<HashMap<String, Vec<oneshot::Sender<PermissionOutcome>>>>,
}

impl PermissionWaiters {
    pub(crate) fn register(&self, device: &DeviceInfo) -> PermissionTicket {
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap()
            .entry(PermissionCache::key(device))
            .or_default()
            .push(tx);
        PermissionTicket::pending(rx)
    }

    pub(crate) fn resolve(&self, device: &DeviceInfo, outcome: PermissionOutcome) {
        let senders = self
            .waiting
            .lock()
            .unwrap()
            .remove(&PermissionCache::key(device));
        for sender in senders.into_iter().flatten() {
            let _ = sender.send(outcome);
        }
    }

    /// Drop every outstanding sender; pending tickets resolve to `None`.
    pub(crate) fn clear(&self) {
        self.waiting.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostusb::mock::sample_device;

    #[test]
    fn test_cache_update_and_rebuild() {
        let cache = PermissionCache::default();
        let a = sample_device(1, 2, 0x1234, 0x0001);
        let b = sample_device(1, 3, 0x1234, 0x0002);

        assert!(cache.update(&a, true));
        assert!(cache.update(&b, true));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&a));

        // A negative probe removes only that device's entry.
        assert!(!cache.update(&a, false));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&b));

        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_waiters_resolve_all_registrations() {
        let waiters = PermissionWaiters::default();
        let device = sample_device(1, 2, 0x1234, 0x0001);
        let first = waiters.register(&device);
        let second = waiters.register(&device);
        waiters.resolve(&device, PermissionOutcome::Granted);
        assert_eq!(first.wait(), Some(PermissionOutcome::Granted));
        assert_eq!(second.wait(), Some(PermissionOutcome::Granted));
    }

    #[test]
    fn test_cleared_waiters_cancel_tickets() {
        let waiters = PermissionWaiters::default();
        let device = sample_device(1, 2, 0x1234, 0x0001);
        let ticket = waiters.register(&device);
        waiters.clear();
        assert_eq!(ticket.wait(), None);
    }

    #[test]
    fn test_resolved_and_cancelled_tickets() {
        assert_eq!(
            PermissionTicket::resolved(PermissionOutcome::Granted).wait(),
            Some(PermissionOutcome::Granted)
        );
        assert_eq!(PermissionTicket::cancelled().wait(), None);
    }

    #[test]
    fn test_try_outcome() {
        let mut ticket = PermissionTicket::resolved(PermissionOutcome::Denied);
        assert_eq!(ticket.try_outcome(), Some(PermissionOutcome::Denied));
    }
}
