use serde::{Deserialize, Serialize};

use crate::process::ProcessRecord;

/// Timestamp stamped onto "ended" events emitted because the daemon stream
/// was lost rather than because the process actually exited. `i64::MAX`
/// sorts such events after everything the device ever reported.
pub const TERMINATION_TIMESTAMP_NS: i64 = i64::MAX;

/// Kind of a pipeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Device,
    Process,
    Agent,
    Generic,
}

/// Payload carried by an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    #[default]
    None,
    ProcessStarted {
        process: ProcessRecord,
    },
    Raw(serde_json::Value),
}

/// An append-only, ordered record in the pipeline's event stream.
///
/// Events are immutable once created. Ordering is FIFO within a single
/// source; cross-source merge order is arrival order at the queue, not
/// global timestamp order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Groups related events; for process events this is the pid.
    pub group_id: i64,
    pub kind: EventKind,
    /// Device-relative monotonic nanoseconds.
    pub timestamp_ns: i64,
    /// Closes the logical event group this event belongs to.
    pub is_ended: bool,
    pub payload: EventPayload,
}

impl Event {
    /// Event announcing a newly discovered process.
    pub fn process_started(process: ProcessRecord) -> Self {
        Self {
            group_id: process.pid as i64,
            kind: EventKind::Process,
            timestamp_ns: process.start_timestamp_ns,
            is_ended: false,
            payload: EventPayload::ProcessStarted { process },
        }
    }

    /// Event closing a process group.
    pub fn process_ended(pid: i32, timestamp_ns: i64) -> Self {
        Self {
            group_id: pid as i64,
            kind: EventKind::Process,
            timestamp_ns,
            is_ended: true,
            payload: EventPayload::None,
        }
    }

    /// Host-synthesized event with an arbitrary payload.
    pub fn generic(group_id: i64, timestamp_ns: i64, payload: serde_json::Value) -> Self {
        Self {
            group_id,
            kind: EventKind::Generic,
            timestamp_ns,
            is_ended: false,
            payload: EventPayload::Raw(payload),
        }
    }
}

/// A logical run of related events sharing a group id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventGroup {
    pub group_id: i64,
    pub events: Vec<Event>,
}
