use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Connection state of a device as reported by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Offline,
    Online,
    Disconnected,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::str::FromStr for DeviceState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "offline" => Ok(DeviceState::Offline),
            "online" | "device" => Ok(DeviceState::Online),
            "disconnected" => Ok(DeviceState::Disconnected),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable snapshot of a connected device.
///
/// A snapshot is recreated on every state query; nothing mutates a `Device`
/// in place. The numeric `id` is stable for the lifetime of one boot of the
/// device (see [`derive_device_id`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable numeric identity, derived from the boot id and serial.
    pub id: i64,
    /// Bridge serial number.
    pub serial: String,
    /// Numeric API capability tier used to branch behavior.
    pub feature_level: u32,
    pub manufacturer: String,
    pub model: String,
    pub is_emulator: bool,
    pub state: DeviceState,
    /// Empty when the device is supported by the pipeline; otherwise a
    /// human-readable reason most RPCs short-circuit on.
    pub unsupported_reason: String,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.state == DeviceState::Online
    }

    pub fn is_supported(&self) -> bool {
        self.unsupported_reason.is_empty()
    }
}

/// Derive the stable numeric id for a device.
///
/// When the device's boot id is readable the id is a hash of boot id plus
/// serial, so the same physical device keeps its id across queries within a
/// boot. When the boot id cannot be read (very old devices, restricted
/// shells) a random id is generated instead.
pub fn derive_device_id(boot_id: Option<&str>, serial: &str) -> i64 {
    match boot_id {
        Some(boot_id) if !boot_id.is_empty() => {
            let mut hasher = DefaultHasher::new();
            boot_id.hash(&mut hasher);
            serial.hash(&mut hasher);
            hasher.finish() as i64
        }
        _ => rand::rng().random::<i64>(),
    }
}
