//! Cross-thread status flags
//!
//! Small set of boolean toggles shared between the monitor loop, the twin
//! worker and the HTTP handlers.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct StatusFlags {
    cloud_enabled: AtomicBool,
    monitoring_active: AtomicBool,
    fitbit_connected: AtomicBool,
}

impl StatusFlags {
    pub fn new() -> Self {
        Self {
            cloud_enabled: AtomicBool::new(true),
            monitoring_active: AtomicBool::new(false),
            fitbit_connected: AtomicBool::new(false),
        }
    }

    pub fn cloud_enabled(&self) -> bool {
        self.cloud_enabled.load(Ordering::Relaxed)
    }

    pub fn set_cloud_enabled(&self, value: bool) {
        self.cloud_enabled.store(value, Ordering::Relaxed);
    }

    pub fn monitoring_active(&self) -> bool {
        self.monitoring_active.load(Ordering::Relaxed)
    }

    pub fn set_monitoring_active(&self, value: bool) {
        self.monitoring_active.store(value, Ordering::Relaxed);
    }

    pub fn fitbit_connected(&self) -> bool {
        self.fitbit_connected.load(Ordering::Relaxed)
    }

    pub fn set_fitbit_connected(&self, value: bool) {
        self.fitbit_connected.store(value, Ordering::Relaxed);
    }
}

impl Default for StatusFlags {
    fn default() -> Self {
        Self::new()
    }
}
