//! Client stubs for the transport service.
//!
//! [`TransportClient`] is the host-side stub for the on-device daemon,
//! reached over the forwarded local TCP port. [`ProxyClient`] is the stub a
//! downstream consumer uses against a proxy server's Unix socket. Both speak
//! the same frame protocol; streaming calls run on a dedicated connection so
//! they never block unary traffic.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use tether_types::Event;

use crate::error::{Result, TetherError};
use crate::rpc::protocol::{
    BytesRequest, BytesResponse, Command, ExecuteRequest, ExecuteResponse, ProcessesRequest,
    ProcessesResponse, RpcFrame, RpcRequest, TimeRequest, TimeResponse, TransportCall,
    TransportReply, VersionRequest, VersionResponse, read_response, write_request,
};

/// Run one unary request/response cycle over a stream.
async fn unary<S>(stream: &mut S, id: u64, call: TransportCall, max: u32) -> Result<TransportReply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = RpcRequest::new(id, call);
    write_request(stream, &request, max)
        .await
        .map_err(|e| TetherError::Protocol(format!("failed to send request: {}", e)))?;

    let frame = read_response(stream, max)
        .await
        .map_err(|e| TetherError::Protocol(format!("failed to read response: {}", e)))?;

    match frame {
        RpcFrame::Reply {
            id: reply_id,
            ok,
            body,
            error,
        } => {
            if reply_id != id {
                return Err(TetherError::Protocol(format!(
                    "response id mismatch: expected {}, got {}",
                    id, reply_id
                )));
            }
            if ok {
                body.ok_or_else(|| TetherError::Protocol("reply without body".to_string()))
            } else {
                Err(TetherError::Daemon(
                    error.unwrap_or_else(|| "unknown error".to_string()),
                ))
            }
        }
        other => Err(TetherError::Protocol(format!(
            "expected reply frame, got {:?}",
            other
        ))),
    }
}

/// Read the next element of a streaming response.
async fn next_event<S>(stream: &mut S, id: u64, max: u32) -> Result<Option<Event>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_response(stream, max).await {
        Ok(RpcFrame::Event {
            id: frame_id,
            event,
        }) if frame_id == id => Ok(Some(event)),
        Ok(RpcFrame::End { id: frame_id }) if frame_id == id => Ok(None),
        Ok(RpcFrame::Reply { error, .. }) => Err(TetherError::Daemon(
            error.unwrap_or_else(|| "stream rejected".to_string()),
        )),
        Ok(other) => Err(TetherError::Protocol(format!(
            "unexpected stream frame: {:?}",
            other
        ))),
        // The peer closing the stream mid-call is an ordinary way for a
        // streaming call to end (device unplugged, daemon died).
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Blocking-style stub for the on-device daemon over a forwarded port.
///
/// Unary calls share one connection and are serialized; each call acquires
/// the connection for its full request/response cycle. [`Self::open_event_stream`]
/// opens its own connection.
pub struct TransportClient {
    port: u16,
    stream: tokio::sync::Mutex<TcpStream>,
    request_id: AtomicU64,
    max_message_size: u32,
}

impl TransportClient {
    /// Connect to the daemon through the forwarded local port.
    pub async fn connect(port: u16, max_message_size: u32) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            port,
            stream: tokio::sync::Mutex::new(stream),
            request_id: AtomicU64::new(1),
            max_message_size,
        })
    }

    /// Issue any unary call and return the raw reply.
    ///
    /// This is the generic passthrough the proxy's `Forward` routes use.
    pub async fn call(&self, call: TransportCall) -> Result<TransportReply> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let mut stream = self.stream.lock().await;
        unary(&mut *stream, id, call, self.max_message_size).await
    }

    pub async fn get_version(&self, stream_id: i64) -> Result<VersionResponse> {
        match self
            .call(TransportCall::GetVersion(VersionRequest { stream_id }))
            .await?
        {
            TransportReply::Version(response) => Ok(response),
            other => Err(TetherError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    pub async fn get_current_time(&self, stream_id: i64) -> Result<TimeResponse> {
        match self
            .call(TransportCall::GetCurrentTime(TimeRequest { stream_id }))
            .await?
        {
            TransportReply::Time(response) => Ok(response),
            other => Err(TetherError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    pub async fn get_bytes(&self, id: &str, stream_id: i64) -> Result<BytesResponse> {
        match self
            .call(TransportCall::GetBytes(BytesRequest {
                id: id.to_string(),
                stream_id,
            }))
            .await?
        {
            TransportReply::Bytes(response) => Ok(response),
            other => Err(TetherError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    pub async fn get_processes(&self, device_id: i64) -> Result<ProcessesResponse> {
        match self
            .call(TransportCall::GetProcesses(ProcessesRequest { device_id }))
            .await?
        {
            TransportReply::Processes(response) => Ok(response),
            other => Err(TetherError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    pub async fn execute(&self, command: Command) -> Result<ExecuteResponse> {
        match self
            .call(TransportCall::Execute(ExecuteRequest { command }))
            .await?
        {
            TransportReply::Execute(response) => Ok(response),
            other => Err(TetherError::Protocol(format!("unexpected reply {:?}", other))),
        }
    }

    /// Start the long-lived event stream on a dedicated connection.
    pub async fn open_event_stream(&self) -> Result<TransportEventStream> {
        let mut stream = TcpStream::connect(("127.0.0.1", self.port)).await?;
        stream.set_nodelay(true)?;
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        write_request(
            &mut stream,
            &RpcRequest::new(id, TransportCall::GetEvents),
            self.max_message_size,
        )
        .await
        .map_err(|e| TetherError::Protocol(format!("failed to start event stream: {}", e)))?;
        Ok(TransportEventStream {
            stream,
            id,
            max_message_size: self.max_message_size,
        })
    }
}

/// Live server-streaming `GetEvents` call against the daemon.
pub struct TransportEventStream {
    stream: TcpStream,
    id: u64,
    max_message_size: u32,
}

impl TransportEventStream {
    /// Next event, or `None` once the stream completed or the daemon went
    /// away.
    pub async fn next(&mut self) -> Result<Option<Event>> {
        next_event(&mut self.stream, self.id, self.max_message_size).await
    }
}

/// Consumer stub for a proxy server's Unix socket.
pub struct ProxyClient {
    socket_path: PathBuf,
    stream: tokio::sync::Mutex<UnixStream>,
    request_id: AtomicU64,
    max_message_size: u32,
}

impl ProxyClient {
    /// Connect to the proxy listening at `socket_path`.
    pub async fn connect(socket_path: impl AsRef<Path>, max_message_size: u32) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path).await?;
        Ok(Self {
            socket_path,
            stream: tokio::sync::Mutex::new(stream),
            request_id: AtomicU64::new(1),
            max_message_size,
        })
    }

    /// Issue any unary call and return the raw reply.
    pub async fn call(&self, call: TransportCall) -> Result<TransportReply> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let mut stream = self.stream.lock().await;
        unary(&mut *stream, id, call, self.max_message_size).await
    }

    /// Start the event stream on a dedicated connection.
    pub async fn open_event_stream(&self) -> Result<ProxyEventStream> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        write_request(
            &mut stream,
            &RpcRequest::new(id, TransportCall::GetEvents),
            self.max_message_size,
        )
        .await
        .map_err(|e| TetherError::Protocol(format!("failed to start event stream: {}", e)))?;
        Ok(ProxyEventStream {
            stream,
            id,
            max_message_size: self.max_message_size,
        })
    }
}

/// Live server-streaming `GetEvents` call against a proxy.
pub struct ProxyEventStream {
    stream: UnixStream,
    id: u64,
    max_message_size: u32,
}

impl ProxyEventStream {
    pub async fn next(&mut self) -> Result<Option<Event>> {
        next_event(&mut self.stream, self.id, self.max_message_size).await
    }
}
