//! Device services the update engine depends on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

/// Connectivity, watchdog and restart control of the running device.
pub trait Device: Send {
    /// Polled once before every manifest fetch.
    fn is_connected(&self) -> bool;

    /// Called between input chunks of long transfers.
    fn feed_watchdog(&mut self) {}

    /// Restart into whatever the boot pointer selects.
    fn restart(&mut self);

    /// Stable identifier, appended to the manifest URL when enabled.
    fn device_id(&self) -> String;
}

/// A host-side device that records restarts instead of performing them.
///
/// Clones share their counters, so a test can keep one handle and hand the
/// other to the manager.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    device_id: String,
    connected: Arc<AtomicBool>,
    watchdog_feeds: Arc<AtomicU64>,
    restarts: Arc<AtomicU64>,
}

impl SimulatedDevice {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            connected: Arc::new(AtomicBool::new(true)),
            watchdog_feeds: Arc::new(AtomicU64::new(0)),
            restarts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn watchdog_feeds(&self) -> u64 {
        self.watchdog_feeds.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new("0000000000000000")
    }
}

impl Device for SimulatedDevice {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn feed_watchdog(&mut self) {
        self.watchdog_feeds.fetch_add(1, Ordering::Relaxed);
    }

    fn restart(&mut self) {
        let count = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        if count > 1 {
            warn!(count, "Device restarted again without booting");
        }
        info!(device_id = %self.device_id, "Rebooting device");
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let device = SimulatedDevice::new("abc");
        let mut handle = device.clone();

        handle.feed_watchdog();
        handle.restart();
        device.set_connected(false);

        assert_eq!(device.watchdog_feeds(), 1);
        assert_eq!(device.restarts(), 1);
        assert!(!handle.is_connected());
        assert_eq!(handle.device_id(), "abc");
    }
}
