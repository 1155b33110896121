use serde::{Deserialize, Serialize};

/// Lifecycle state of a device-side process tracked by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    #[default]
    Alive,
    Dead,
}

/// A process observed on a device.
///
/// Records are created when a device-side client appears with a resolved
/// description and removed when the client disappears or the daemon stream
/// terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: i32,
    /// Id of the device the process runs on.
    pub device_id: i64,
    pub name: String,
    /// Device-relative monotonic start time in nanoseconds.
    pub start_timestamp_ns: i64,
    /// CPU architecture the process runs under, e.g. "arm64-v8a".
    pub abi: String,
    pub state: ProcessState,
}

impl ProcessRecord {
    pub fn is_alive(&self) -> bool {
        self.state == ProcessState::Alive
    }
}
