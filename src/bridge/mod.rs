//! The device bridge: the pipeline's seam to the outside world.
//!
//! Everything the pipeline does to a physical device (properties, file
//! pushes, shell commands, port forwards, client lists) goes through
//! [`DeviceHandle`]; device arrival and departure is observed through a
//! [`DeviceBridge`] subscription. Production uses [`adb::AdbBridge`];
//! tests and virtual pipelines use [`fake::FakeBridge`].
//!
//! Subscriptions are explicit objects: dropping a [`BridgeSubscription`]
//! unsubscribes, there is no global listener registry.

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};

use tether_types::{Device, DeviceState, derive_device_id};

use crate::config::PipelineConfig;
use crate::error::Result;

pub mod adb;
pub mod fake;

/// Device change mask: connection state changed.
pub const CHANGE_STATE: u32 = 1 << 0;
/// Device change mask: the set of device-side clients changed.
pub const CHANGE_CLIENT_LIST: u32 = 1 << 1;
/// Device change mask: a client resolved or changed its description.
pub const CHANGE_CLIENT_NAME: u32 = 1 << 2;

/// Signal published on the bridge event bus.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    DeviceConnected { serial: String },
    DeviceDisconnected { serial: String },
    DeviceChanged { serial: String, mask: u32 },
    /// The bridge service came (back) up; current devices will be
    /// re-announced by the publisher.
    BridgeRestored,
    /// The bridge service itself went away; every daemon it spawned is now
    /// unreachable.
    BridgeLost,
}

/// A device-side client process as seen by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeClient {
    pub pid: i32,
    /// `None` until the client's description has been resolved; process
    /// records are only created for resolved clients.
    pub name: Option<String>,
    pub abi: String,
}

/// Target of a port-forward rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardTarget {
    /// Plain TCP port on the device.
    Tcp(u16),
    /// Abstract-namespace socket on the device.
    AbstractSocket(String),
}

/// Handle to one bridged device.
///
/// Metadata accessors are cheap snapshots; everything that talks to the
/// device is async and fallible.
pub trait DeviceHandle: Send + Sync {
    fn serial(&self) -> &str;
    fn state(&self) -> DeviceState;
    fn feature_level(&self) -> u32;
    fn manufacturer(&self) -> String;
    fn model(&self) -> String;
    fn is_emulator(&self) -> bool;
    /// Supported ABIs, preferred first.
    fn abis(&self) -> Vec<String>;

    /// The device's per-boot identifier, when readable.
    fn boot_id(&self) -> BoxFuture<'_, Option<String>>;

    /// Read a system property; `None` when unset.
    fn get_property<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// Copy a host file onto the device.
    fn push_file<'a>(&'a self, local: &'a Path, remote: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Write a host-generated blob onto the device.
    fn push_bytes<'a>(&'a self, bytes: &'a [u8], remote: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Run a shell command and collect its full output.
    fn shell<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Run a shell command and stream its output line by line. The channel
    /// closes when the command exits.
    fn shell_lines<'a>(&'a self, command: &'a str)
    -> BoxFuture<'a, Result<mpsc::Receiver<String>>>;

    /// Create a forward rule from a local TCP port to the device.
    fn create_forward(&self, local_port: u16, target: ForwardTarget) -> BoxFuture<'_, Result<()>>;

    /// Remove a previously created forward rule.
    fn remove_forward(&self, local_port: u16) -> BoxFuture<'_, Result<()>>;

    /// Snapshot of the device-side clients.
    fn clients(&self) -> BoxFuture<'_, Result<Vec<BridgeClient>>>;
}

/// Source of devices and bridge events.
pub trait DeviceBridge: Send + Sync {
    /// Subscribe to the bridge event bus.
    fn subscribe(&self) -> BridgeSubscription;
    /// Currently known devices.
    fn devices(&self) -> Vec<Arc<dyn DeviceHandle>>;
    /// Look up a device by serial.
    fn device(&self, serial: &str) -> Option<Arc<dyn DeviceHandle>>;
}

/// Owned subscription to bridge events; dropping it unsubscribes.
pub struct BridgeSubscription {
    rx: broadcast::Receiver<BridgeEvent>,
}

impl BridgeSubscription {
    pub fn new(rx: broadcast::Receiver<BridgeEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the bridge is gone. A slow subscriber that
    /// lagged behind skips the overwritten events and keeps going.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("bridge subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Build the immutable device snapshot for a bridged device.
///
/// The numeric id hashes the boot id with the serial; when the boot id is
/// unreadable the id falls back to a random value. The unsupported reason is
/// derived from the configured feature-level range.
pub async fn device_snapshot(handle: &dyn DeviceHandle, config: &PipelineConfig) -> Device {
    let boot_id = handle.boot_id().await;
    Device {
        id: derive_device_id(boot_id.as_deref(), handle.serial()),
        serial: handle.serial().to_string(),
        feature_level: handle.feature_level(),
        manufacturer: handle.manufacturer(),
        model: handle.model(),
        is_emulator: handle.is_emulator(),
        state: handle.state(),
        unsupported_reason: config.unsupported_reason(handle.feature_level()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::FakeDevice;

    #[tokio::test]
    async fn test_snapshot_reflects_handle_metadata() {
        let config = PipelineConfig::default();
        let device = FakeDevice::new("serial-1", 30);
        let snapshot = device_snapshot(&device, &config).await;

        assert_eq!(snapshot.serial, "serial-1");
        assert_eq!(snapshot.feature_level, 30);
        assert!(snapshot.is_supported());

        // Same boot, same id.
        let again = device_snapshot(&device, &config).await;
        assert_eq!(snapshot.id, again.id);
    }

    #[tokio::test]
    async fn test_snapshot_marks_unsupported_devices() {
        let config = PipelineConfig::default();
        let device = FakeDevice::new("old", 19);
        let snapshot = device_snapshot(&device, &config).await;
        assert!(!snapshot.is_supported());
        assert!(snapshot.unsupported_reason.contains("below"));
    }
}
