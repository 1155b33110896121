//! Non-device event stream server.
//!
//! The proxy variant for virtual event sources: no daemon, no forward, just
//! host-side producers feeding a queue and a byte cache. It exposes the
//! identical `GetEvents`/`GetBytes` contract on a Unix socket, so a replay
//! source or synthetic pipeline looks exactly like a device stream to
//! downstream consumers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use tether_types::Event;

use crate::error::{Result, TetherError};
use crate::pipeline::events::{ByteCache, EventQueue, EventSink};
use crate::pipeline::proxy::{ProxyService, stream_call};
use crate::rpc::listener::{RpcConnection, RpcListener};
use crate::rpc::protocol::{
    BytesResponse, CallShape, MethodId, RpcFrame, TransportCall, TransportReply,
};

/// Event stream server backed purely by host producers.
pub struct EventStreamServer {
    name: String,
    queue: EventQueue,
    bytes: ByteCache,
    max_message_size: u32,
    stream_lock: tokio::sync::Mutex<()>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    socket_path: Mutex<Option<PathBuf>>,
    stopped: AtomicBool,
}

impl EventStreamServer {
    pub fn new(name: impl Into<String>, max_message_size: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            queue: EventQueue::new(),
            bytes: ByteCache::new(),
            max_message_size,
            stream_lock: tokio::sync::Mutex::new(()),
            server_task: Mutex::new(None),
            socket_path: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Publish one event into the stream. Returns `false` once the stream
    /// has been completed.
    pub fn publish(&self, event: Event) -> bool {
        self.queue.push(event)
    }

    /// Stash a payload for a one-shot `GetBytes` retrieval.
    pub fn write_bytes(&self, id: impl Into<String>, contents: Vec<u8>) {
        self.bytes.insert(id, contents);
    }

    /// Complete the stream: queued events still drain to the subscriber,
    /// then the response stream ends.
    pub fn complete(&self) {
        self.queue.close();
    }

    /// Serve the contract on a Unix socket at `socket_path`.
    pub async fn serve(self: &Arc<Self>, socket_path: impl AsRef<Path>) -> Result<()> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let listener = RpcListener::bind(&socket_path, self.max_message_size).await?;
        *self.socket_path.lock().unwrap() = Some(socket_path);

        let server = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(conn).await {
                                tracing::debug!("stream server connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("stream server accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        *self.server_task.lock().unwrap() = Some(task);

        tracing::info!(
            "event stream server {} listening on {:?}",
            self.name,
            self.socket_path.lock().unwrap().clone().unwrap_or_default()
        );
        Ok(())
    }

    /// Stop listening. Queued events are dropped with the server; use
    /// [`Self::complete`] first for a graceful end.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.close();
        if let Some(task) = self.server_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket_path.lock().unwrap().clone()
    }

    async fn handle_connection(self: Arc<Self>, mut conn: RpcConnection) -> Result<()> {
        while let Some(request) = conn.recv_request().await? {
            let id = request.id;
            let method = request.call.method();

            if !self.descriptor().contains(&method) {
                conn.send_frame(&RpcFrame::err(
                    id,
                    format!("unimplemented method {:?}", method),
                ))
                .await?;
                continue;
            }

            match method.shape() {
                CallShape::Unary => {
                    let frame = match self.call_unary(request.call).await {
                        Ok(body) => RpcFrame::ok(id, body),
                        Err(e) => RpcFrame::err(id, e.to_string()),
                    };
                    conn.send_frame(&frame).await?;
                }
                CallShape::ServerStreaming => {
                    let service: Arc<dyn ProxyService> = self.clone();
                    stream_call(&mut conn, id, service, request.call).await?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for EventStreamServer {
    fn drop(&mut self) {
        if let Some(task) = self.server_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl ProxyService for EventStreamServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> Vec<MethodId> {
        vec![MethodId::GetEvents, MethodId::GetBytes]
    }

    fn overrides(&self) -> Vec<MethodId> {
        vec![MethodId::GetEvents, MethodId::GetBytes]
    }

    fn call_unary(&self, call: TransportCall) -> BoxFuture<'_, Result<TransportReply>> {
        Box::pin(async move {
            match call {
                TransportCall::GetBytes(request) => {
                    // Read-once; a miss has nothing to forward to, so the
                    // default (empty) payload is the answer.
                    let contents = self.bytes.take(&request.id).unwrap_or_default();
                    Ok(TransportReply::Bytes(BytesResponse { contents }))
                }
                other => Err(TetherError::Unimplemented(other.method())),
            }
        })
    }

    fn call_streaming(&self, call: TransportCall, sink: EventSink) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match call {
                TransportCall::GetEvents => {
                    let _guard = self.stream_lock.lock().await;
                    self.queue.pump_to(sink).await;
                    Ok(())
                }
                other => Err(TetherError::Unimplemented(other.method())),
            }
        })
    }
}
