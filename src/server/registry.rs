//! Device name → façade lookup shared by all client connections.
//!
//! Built once at startup and handed to the [`CommandServer`](super::CommandServer).
//! The only runtime mutation is swapping a device for its disconnected
//! stand-in after its connection was lost.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::device::{AsyncDevice, DeviceEvent};

/// Shared, cloneable registry of named devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<BTreeMap<String, AsyncDevice>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` under its own name, returning any device it replaced.
    pub fn insert(&self, device: AsyncDevice) -> Option<AsyncDevice> {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.name().to_string(), device)
    }

    /// Look up a device by name.
    pub fn get(&self, name: &str) -> Option<AsyncDevice> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered device names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no devices are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace `name` with a disconnected handle.
    ///
    /// Returns the previous handle so the caller can close it.
    pub fn disconnect(&self, name: &str) -> Option<AsyncDevice> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        if !devices.contains_key(name) {
            return None;
        }
        devices.insert(name.to_string(), AsyncDevice::disconnected(name))
    }

    /// React to an out-of-band device event.
    ///
    /// A lost connection tears the device down and leaves a disconnected
    /// stand-in, so clients get `2-` replies instead of errors.
    pub fn handle_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::ConnectionLost {
                device,
                reason,
                abandoned,
            } => {
                log::warn!(
                    "[Registry] {device} lost its connection ({reason}), {} call(s) abandoned",
                    abandoned.len()
                );
                if let Some(old) = self.disconnect(device) {
                    if let Err(e) = old.close() {
                        log::warn!("[Registry] failed to close {device}: {e}");
                    }
                }
            }
            DeviceEvent::Evicted { device, ids } => {
                log::debug!("[Registry] {device} evicted {} call(s)", ids.len());
            }
            DeviceEvent::Stopped { device } => {
                log::debug!("[Registry] {device} worker stopped");
            }
        }
    }

    /// Close every device, blocking until all workers have exited.
    pub fn close_all(&self) {
        let devices: Vec<AsyncDevice> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for device in devices {
            if let Err(e) = device.close() {
                log::warn!("[Registry] failed to close {}: {e}", device.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{QueueOptions, VirtualDevice};

    #[test]
    fn test_insert_get_names() {
        let registry = DeviceRegistry::new();
        registry.insert(AsyncDevice::disconnected("GAUGE"));
        registry.insert(AsyncDevice::disconnected("LASER"));

        assert_eq!(registry.names(), vec!["GAUGE", "LASER"]);
        assert!(registry.get("LASER").unwrap().is_dummy());
        assert!(registry.get("PUMP").is_none());
    }

    #[test]
    fn test_connection_lost_swaps_in_dummy() {
        let registry = DeviceRegistry::new();
        let device = AsyncDevice::spawn("LASER", VirtualDevice::new("laser"), QueueOptions::default()).unwrap();
        registry.insert(device);

        registry.handle_event(&DeviceEvent::ConnectionLost {
            device: "LASER".into(),
            reason: "cable pulled".into(),
            abandoned: vec![],
        });

        assert!(registry.get("LASER").unwrap().is_dummy());
    }

    #[test]
    fn test_disconnect_unknown_is_noop() {
        let registry = DeviceRegistry::new();
        assert!(registry.disconnect("NOPE").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_all_stops_workers() {
        let registry = DeviceRegistry::new();
        let device = AsyncDevice::spawn("LASER", VirtualDevice::new("laser"), QueueOptions::default()).unwrap();
        registry.insert(device.clone());
        registry.close_all();
        assert!(!device.is_running());
    }
}
