//! Wire protocol for the transport service.
//!
//! The same format is spoken on two hops: host ↔ on-device daemon (over the
//! forwarded TCP port) and consumer ↔ proxy server (over a Unix socket).
//!
//! ## Framing
//!
//! Messages are length-delimited:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: JSON-encoded message
//!
//! The length cap is configurable per channel; oversized frames are rejected
//! on both the read and write side.
//!
//! ## Calls
//!
//! A unary call is one [`RpcRequest`] answered by one `RpcFrame::Reply`. A
//! server-streaming call ([`MethodId::GetEvents`]) is answered by any number
//! of `RpcFrame::Event` frames followed by `RpcFrame::End`.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tether_types::{Device, Event, EventGroup, EventKind, ProcessRecord};

/// Identifies a method of the transport service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodId {
    GetVersion,
    GetCurrentTime,
    GetBytes,
    GetAgentStatus,
    Execute,
    GetEventGroups,
    GetDevices,
    GetProcesses,
    GetEvents,
}

impl MethodId {
    /// Every method of the transport service, in declaration order.
    pub const ALL: [MethodId; 9] = [
        MethodId::GetVersion,
        MethodId::GetCurrentTime,
        MethodId::GetBytes,
        MethodId::GetAgentStatus,
        MethodId::Execute,
        MethodId::GetEventGroups,
        MethodId::GetDevices,
        MethodId::GetProcesses,
        MethodId::GetEvents,
    ];

    pub fn shape(&self) -> CallShape {
        match self {
            MethodId::GetEvents => CallShape::ServerStreaming,
            _ => CallShape::Unary,
        }
    }
}

/// Shape of a call. Only unary calls can be forwarded generically; the
/// streaming method must be explicitly overridden by a proxy service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    Unary,
    ServerStreaming,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VersionRequest {
    pub stream_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VersionResponse {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TimeRequest {
    pub stream_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TimeResponse {
    pub timestamp_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BytesRequest {
    /// Opaque id of the payload, as referenced by an event.
    pub id: String,
    pub stream_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BytesResponse {
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentStatusRequest {
    pub pid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Unattached,
    Attached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentStatusResponse {
    pub status: AgentStatus,
}

/// Kind of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    AttachAgent,
    BeginSession,
    EndSession,
}

/// Kind-specific command parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CommandDetails {
    #[default]
    None,
    AttachAgent {
        agent_lib_file_name: String,
        agent_config_path: String,
        package_name: String,
    },
}

/// A command dispatched through `Execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Id of the device stream the command targets.
    pub stream_id: i64,
    pub pid: i32,
    pub kind: CommandKind,
    #[serde(default)]
    pub details: CommandDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecuteResponse {
    pub command_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventGroupsRequest {
    pub kind: EventKind,
    pub from_timestamp_ns: i64,
    pub to_timestamp_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventGroupsResponse {
    pub groups: Vec<EventGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessesRequest {
    pub device_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessesResponse {
    pub processes: Vec<ProcessRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DevicesResponse {
    pub devices: Vec<Device>,
}

/// A call on the transport service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum TransportCall {
    GetVersion(VersionRequest),
    GetCurrentTime(TimeRequest),
    GetBytes(BytesRequest),
    GetAgentStatus(AgentStatusRequest),
    Execute(ExecuteRequest),
    GetEventGroups(EventGroupsRequest),
    GetDevices,
    GetProcesses(ProcessesRequest),
    GetEvents,
}

impl TransportCall {
    pub fn method(&self) -> MethodId {
        match self {
            TransportCall::GetVersion(_) => MethodId::GetVersion,
            TransportCall::GetCurrentTime(_) => MethodId::GetCurrentTime,
            TransportCall::GetBytes(_) => MethodId::GetBytes,
            TransportCall::GetAgentStatus(_) => MethodId::GetAgentStatus,
            TransportCall::Execute(_) => MethodId::Execute,
            TransportCall::GetEventGroups(_) => MethodId::GetEventGroups,
            TransportCall::GetDevices => MethodId::GetDevices,
            TransportCall::GetProcesses(_) => MethodId::GetProcesses,
            TransportCall::GetEvents => MethodId::GetEvents,
        }
    }
}

/// Successful body of a unary reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "body", rename_all = "snake_case")]
pub enum TransportReply {
    Version(VersionResponse),
    Time(TimeResponse),
    Bytes(BytesResponse),
    AgentStatus(AgentStatusResponse),
    Execute(ExecuteResponse),
    EventGroups(EventGroupsResponse),
    Devices(DevicesResponse),
    Processes(ProcessesResponse),
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlates frames with the request that produced them.
    pub id: u64,
    pub call: TransportCall,
}

impl RpcRequest {
    pub fn new(id: u64, call: TransportCall) -> Self {
        Self { id, call }
    }
}

/// Server-to-client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum RpcFrame {
    /// Terminal answer to a unary call.
    Reply {
        id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<TransportReply>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// One element of a streaming response.
    Event { id: u64, event: Event },
    /// Completes a streaming response.
    End { id: u64 },
}

impl RpcFrame {
    pub fn ok(id: u64, body: TransportReply) -> Self {
        RpcFrame::Reply {
            id,
            ok: true,
            body: Some(body),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        RpcFrame::Reply {
            id,
            ok: false,
            body: None,
            error: Some(error.into()),
        }
    }
}

/// Write a length-delimited frame to an async writer.
///
/// # Errors
///
/// Returns an error if the data exceeds `max_size` or if writing fails.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
    max_size: u32,
) -> io::Result<()> {
    if data.len() > max_size as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message too large: {} bytes (max {})", data.len(), max_size),
        ));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited frame from an async reader.
///
/// # Errors
///
/// Returns an error if the connection closes mid-frame, the declared length
/// exceeds `max_size`, or reading fails. EOF before the length prefix is
/// surfaced as `UnexpectedEof`.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R, max_size: u32) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf);
    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {} bytes (max {})", len, max_size),
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Serialize and write a request.
pub async fn write_request<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    request: &RpcRequest,
    max_size: u32,
) -> io::Result<()> {
    let json = serde_json::to_vec(request)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write_frame(writer, &json, max_size).await
}

/// Read and deserialize a request.
pub async fn read_request<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: u32,
) -> io::Result<RpcRequest> {
    let data = read_frame(reader, max_size).await?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Serialize and write a response frame.
pub async fn write_response<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &RpcFrame,
    max_size: u32,
) -> io::Result<()> {
    let json =
        serde_json::to_vec(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write_frame(writer, &json, max_size).await
}

/// Read and deserialize a response frame.
pub async fn read_response<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: u32,
) -> io::Result<RpcFrame> {
    let data = read_frame(reader, max_size).await?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAX: u32 = 16 * 1024 * 1024;

    #[test]
    fn test_every_method_has_a_shape() {
        for method in MethodId::ALL {
            match method {
                MethodId::GetEvents => assert_eq!(method.shape(), CallShape::ServerStreaming),
                _ => assert_eq!(method.shape(), CallShape::Unary),
            }
        }
    }

    #[test]
    fn test_call_method_mapping() {
        assert_eq!(TransportCall::GetDevices.method(), MethodId::GetDevices);
        assert_eq!(TransportCall::GetEvents.method(), MethodId::GetEvents);
        let call = TransportCall::GetCurrentTime(TimeRequest { stream_id: 3 });
        assert_eq!(call.method(), MethodId::GetCurrentTime);
    }

    #[test]
    fn test_call_tagged_serialization() {
        let call = TransportCall::GetBytes(BytesRequest {
            id: "blob-1".to_string(),
            stream_id: 9,
        });
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains(r#""method":"get_bytes""#));
        assert!(json.contains(r#""params""#));

        let back: TransportCall = serde_json::from_str(&json).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn test_unit_call_serialization() {
        let json = serde_json::to_string(&TransportCall::GetDevices).unwrap();
        assert!(json.contains(r#""method":"get_devices""#));
        assert!(!json.contains(r#""params""#));
        let back: TransportCall = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TransportCall::GetDevices);
    }

    #[test]
    fn test_reply_frame_skips_absent_fields() {
        let frame = RpcFrame::ok(1, TransportReply::Time(TimeResponse { timestamp_ns: 5 }));
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("error"));

        let frame = RpcFrame::err(2, "boom");
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("body"));
        assert!(json.contains("boom"));
    }

    #[test]
    fn test_all_calls_roundtrip() {
        let calls = vec![
            TransportCall::GetVersion(VersionRequest { stream_id: 1 }),
            TransportCall::GetCurrentTime(TimeRequest { stream_id: 1 }),
            TransportCall::GetBytes(BytesRequest {
                id: "x".into(),
                stream_id: 1,
            }),
            TransportCall::GetAgentStatus(AgentStatusRequest { pid: 10 }),
            TransportCall::Execute(ExecuteRequest {
                command: Command {
                    stream_id: 1,
                    pid: 10,
                    kind: CommandKind::AttachAgent,
                    details: CommandDetails::AttachAgent {
                        agent_lib_file_name: "libtether_agent_arm64-v8a.so".into(),
                        agent_config_path: "/data/local/tmp/tether/agent.cfg".into(),
                        package_name: "com.example".into(),
                    },
                },
            }),
            TransportCall::GetEventGroups(EventGroupsRequest {
                kind: EventKind::Process,
                from_timestamp_ns: 0,
                to_timestamp_ns: i64::MAX,
            }),
            TransportCall::GetDevices,
            TransportCall::GetProcesses(ProcessesRequest { device_id: 1 }),
            TransportCall::GetEvents,
        ];

        for call in calls {
            let json = serde_json::to_string(&call).unwrap();
            let back: TransportCall = serde_json::from_str(&json).unwrap();
            assert_eq!(back, call);
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let data = b"hello, device!";

        let mut buf = Vec::new();
        write_frame(&mut buf, data, MAX).await.unwrap();

        assert_eq!(buf.len(), 4 + data.len());
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, data.len());

        let mut reader = Cursor::new(buf);
        let read = read_frame(&mut reader, MAX).await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_write_frame_size_limit() {
        let oversized = vec![0u8; 32];
        let mut buf = Vec::new();
        let result = write_frame(&mut buf, &oversized, 16).await;
        assert!(result.unwrap_err().to_string().contains("message too large"));
    }

    #[tokio::test]
    async fn test_read_frame_size_limit() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&64u32.to_be_bytes());
        buf.extend_from_slice(b"short");

        let mut reader = Cursor::new(buf);
        let result = read_frame(&mut reader, 16).await;
        assert!(result.unwrap_err().to_string().contains("message too large"));
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let request = RpcRequest::new(
            7,
            TransportCall::GetProcesses(ProcessesRequest { device_id: 42 }),
        );

        let mut buf = Vec::new();
        write_request(&mut buf, &request, MAX).await.unwrap();
        let mut reader = Cursor::new(buf);
        let back = read_request(&mut reader, MAX).await.unwrap();
        assert_eq!(back, request);

        let frame = RpcFrame::ok(
            7,
            TransportReply::Processes(ProcessesResponse { processes: vec![] }),
        );
        let mut buf = Vec::new();
        write_response(&mut buf, &frame, MAX).await.unwrap();
        let mut reader = Cursor::new(buf);
        let back = read_response(&mut reader, MAX).await.unwrap();
        assert_eq!(back, frame);
    }

    #[tokio::test]
    async fn test_streaming_frames_in_sequence() {
        use tether_types::Event;

        let mut buf = Vec::new();
        let event = Event::process_ended(12, 34);
        write_response(
            &mut buf,
            &RpcFrame::Event {
                id: 1,
                event: event.clone(),
            },
            MAX,
        )
        .await
        .unwrap();
        write_response(&mut buf, &RpcFrame::End { id: 1 }, MAX)
            .await
            .unwrap();

        let mut reader = Cursor::new(buf);
        match read_response(&mut reader, MAX).await.unwrap() {
            RpcFrame::Event { id, event: read } => {
                assert_eq!(id, 1);
                assert_eq!(read, event);
            }
            other => panic!("expected event frame, got {:?}", other),
        }
        assert_eq!(
            read_response(&mut reader, MAX).await.unwrap(),
            RpcFrame::End { id: 1 }
        );
    }
}
