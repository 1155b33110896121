//! Host-side proxy server.
//!
//! A [`TransportProxy`] stands between downstream consumers and one
//! device's daemon channel. It exposes the daemon's full service surface on
//! a Unix socket: calls a registered service has overridden are answered on
//! the host, every other unary call is forwarded verbatim through the
//! daemon stub, and a streaming method nobody overrode is a hard failure.
//!
//! Routing is a static table built once at initialization time from each
//! service's descriptor and override set; nothing is discovered at call
//! time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tether_types::Device;

use crate::bridge::DeviceHandle;
use crate::error::{Result, TetherError};
use crate::pipeline::device_service::{CommandHandler, DeviceProxyService};
use crate::pipeline::events::EventSink;
use crate::rpc::client::TransportClient;
use crate::rpc::listener::{RpcConnection, RpcListener};
use crate::rpc::protocol::{CallShape, CommandKind, MethodId, RpcFrame, TransportCall, TransportReply};

/// A service mounted into a proxy.
///
/// The descriptor lists every method the service serves; the override set
/// is the subset it answers on the host. Non-overridden unary methods of
/// the descriptor are forwarded mechanically to the daemon.
pub trait ProxyService: Send + Sync {
    fn name(&self) -> &str;
    fn descriptor(&self) -> Vec<MethodId>;
    fn overrides(&self) -> Vec<MethodId>;

    /// Answer an overridden unary call.
    fn call_unary(&self, call: TransportCall) -> BoxFuture<'_, Result<TransportReply>>;

    /// Answer an overridden streaming call, writing elements into `sink`.
    /// The stream completes when this future resolves.
    fn call_streaming(&self, call: TransportCall, sink: EventSink) -> BoxFuture<'_, Result<()>>;

    /// Invoked when the proxy server starts listening.
    fn on_connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Invoked once when the proxy disconnects; stop pumps, flush state.
    fn on_disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// How a method is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Passed through the daemon stub unchanged.
    Forward,
    /// Answered by the service at this index.
    Override(usize),
}

/// Owns one port-forward rule; removing it is idempotent.
pub struct ForwardGuard {
    device: Arc<dyn DeviceHandle>,
    local_port: u16,
    removed: AtomicBool,
}

impl ForwardGuard {
    pub fn new(device: Arc<dyn DeviceHandle>, local_port: u16) -> Self {
        Self {
            device,
            local_port,
            removed: AtomicBool::new(false),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remove the forward rule. Failures are logged; an unplugged device
    /// already lost its forwards.
    pub async fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.device.remove_forward(self.local_port).await {
            tracing::warn!(
                "failed to remove forward for port {}: {}",
                self.local_port,
                e
            );
        }
    }
}

/// The proxy for one device over one connection lifetime.
pub struct TransportProxy {
    device: Device,
    client: Arc<TransportClient>,
    forward: ForwardGuard,
    runtime_dir: PathBuf,
    max_message_size: u32,
    device_service: Mutex<Option<Arc<DeviceProxyService>>>,
    services: Mutex<Vec<Arc<dyn ProxyService>>>,
    routes: Mutex<Option<Arc<HashMap<MethodId, Route>>>>,
    socket_path: Mutex<Option<PathBuf>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    disconnected: AtomicBool,
}

impl std::fmt::Debug for TransportProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportProxy")
            .field("device", &self.device)
            .field("runtime_dir", &self.runtime_dir)
            .field("max_message_size", &self.max_message_size)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("disconnected", &self.disconnected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl TransportProxy {
    pub fn new(
        device: Device,
        client: Arc<TransportClient>,
        forward: ForwardGuard,
        runtime_dir: PathBuf,
        max_message_size: u32,
    ) -> Self {
        Self {
            device,
            client,
            forward,
            runtime_dir,
            max_message_size,
            device_service: Mutex::new(None),
            services: Mutex::new(Vec::new()),
            routes: Mutex::new(None),
            socket_path: Mutex::new(None),
            server_task: Mutex::new(None),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Path of the Unix socket consumers connect to; set by
    /// [`Self::initialize_server`].
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket_path.lock().unwrap().clone()
    }

    /// Register a service. Only valid before the server is built.
    pub fn register_service(&self, service: Arc<dyn ProxyService>) -> Result<()> {
        if self.routes.lock().unwrap().is_some() {
            return Err(TetherError::ProxyAlreadyInitialized);
        }
        self.services.lock().unwrap().push(service);
        Ok(())
    }

    /// Register the device-facing service and remember it for command
    /// handler delegation.
    pub fn attach_device_service(&self, service: Arc<DeviceProxyService>) -> Result<()> {
        self.register_service(service.clone())?;
        *self.device_service.lock().unwrap() = Some(service);
        Ok(())
    }

    /// The device-facing service, when one is attached.
    pub fn device_service(&self) -> Option<Arc<DeviceProxyService>> {
        self.device_service.lock().unwrap().clone()
    }

    /// Register a host-side handler for an `Execute` command kind.
    pub fn register_command_handler(
        &self,
        kind: CommandKind,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<()> {
        let service = self.device_service().ok_or_else(|| {
            TetherError::Protocol("no device service attached to this proxy".to_string())
        })?;
        service.register_command_handler(kind, handler);
        Ok(())
    }

    /// Build the route table and name the server socket. Call once, after
    /// all services are registered.
    pub fn initialize_server(&self, name: &str) -> Result<()> {
        let mut routes_slot = self.routes.lock().unwrap();
        if routes_slot.is_some() {
            return Err(TetherError::ProxyAlreadyInitialized);
        }

        let services = self.services.lock().unwrap();
        let mut routes: HashMap<MethodId, Route> = HashMap::new();
        for (index, service) in services.iter().enumerate() {
            for method in service.descriptor() {
                routes.entry(method).or_insert(Route::Forward);
            }
            for method in service.overrides() {
                routes.insert(method, Route::Override(index));
            }
        }

        *routes_slot = Some(Arc::new(routes));
        *self.socket_path.lock().unwrap() =
            Some(self.runtime_dir.join(format!("{}.sock", name)));
        Ok(())
    }

    /// Start listening. Fails if [`Self::initialize_server`] has not run.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let socket_path = self
            .socket_path()
            .ok_or(TetherError::ProxyNotInitialized)?;
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(TetherError::Protocol("proxy already connected".to_string()));
        }

        let listener = RpcListener::bind(&socket_path, self.max_message_size).await?;

        let services: Vec<Arc<dyn ProxyService>> = self.services.lock().unwrap().clone();
        for service in &services {
            service.on_connect().await?;
        }

        let proxy = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        let proxy = proxy.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(proxy, conn).await {
                                tracing::debug!("proxy connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("proxy accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        *self.server_task.lock().unwrap() = Some(task);

        tracing::info!(
            "proxy for {} listening on {:?}",
            self.device.serial,
            self.socket_path().unwrap_or_default()
        );
        Ok(())
    }

    /// Stop all services, then shut the server down and remove the forward
    /// rule. Safe to call any number of times.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        let services: Vec<Arc<dyn ProxyService>> = self.services.lock().unwrap().clone();
        for service in &services {
            service.on_disconnect().await;
        }

        if let Some(task) = self.server_task.lock().unwrap().take() {
            // Dropping the listener inside the task removes the socket file.
            task.abort();
        }

        self.forward.remove().await;
        tracing::info!("proxy for {} disconnected", self.device.serial);
    }

    fn routes(&self) -> Option<Arc<HashMap<MethodId, Route>>> {
        self.routes.lock().unwrap().clone()
    }

    fn service(&self, index: usize) -> Option<Arc<dyn ProxyService>> {
        self.services.lock().unwrap().get(index).cloned()
    }
}

/// Serve one consumer connection until it hangs up.
async fn handle_connection(proxy: Arc<TransportProxy>, mut conn: RpcConnection) -> Result<()> {
    let routes = proxy
        .routes()
        .ok_or(TetherError::ProxyNotInitialized)?;

    while let Some(request) = conn.recv_request().await? {
        let id = request.id;
        let method = request.call.method();

        match routes.get(&method).copied() {
            None => {
                conn.send_frame(&RpcFrame::err(
                    id,
                    format!("unimplemented method {:?}", method),
                ))
                .await?;
            }
            Some(Route::Forward) => match method.shape() {
                CallShape::Unary => {
                    let frame = match proxy.client.call(request.call).await {
                        Ok(body) => RpcFrame::ok(id, body),
                        Err(e) => RpcFrame::err(id, e.to_string()),
                    };
                    conn.send_frame(&frame).await?;
                }
                // Streaming calls cannot be forwarded mechanically; the
                // streaming methods are always explicitly overridden.
                CallShape::ServerStreaming => {
                    conn.send_frame(&RpcFrame::err(
                        id,
                        format!("unimplemented streaming method {:?}", method),
                    ))
                    .await?;
                }
            },
            Some(Route::Override(index)) => {
                let Some(service) = proxy.service(index) else {
                    conn.send_frame(&RpcFrame::err(id, "service unavailable"))
                        .await?;
                    continue;
                };
                match method.shape() {
                    CallShape::Unary => {
                        let frame = match service.call_unary(request.call).await {
                            Ok(body) => RpcFrame::ok(id, body),
                            Err(e) => RpcFrame::err(id, e.to_string()),
                        };
                        conn.send_frame(&frame).await?;
                    }
                    CallShape::ServerStreaming => {
                        stream_call(&mut conn, id, service, request.call).await?;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Run one streaming call: the service writes into a channel, the
/// connection drains it into frames and terminates with `End`.
pub(crate) async fn stream_call(
    conn: &mut RpcConnection,
    id: u64,
    service: Arc<dyn ProxyService>,
    call: TransportCall,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let pump = tokio::spawn(async move {
        let result = service.call_streaming(call, EventSink::new(tx)).await;
        if let Err(e) = result {
            tracing::warn!("streaming call failed: {}", e);
        }
    });

    let mut consumer_alive = true;
    while let Some(event) = rx.recv().await {
        if conn.send_frame(&RpcFrame::Event { id, event }).await.is_err() {
            // Consumer went away; dropping the receiver stops the pump.
            consumer_alive = false;
            break;
        }
    }

    let _ = pump.await;
    if consumer_alive {
        conn.send_frame(&RpcFrame::End { id }).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::{FakeDaemon, FakeDevice};
    use crate::rpc::client::ProxyClient;
    use crate::rpc::protocol::{TimeRequest, VersionRequest};
    use tempfile::TempDir;

    const MAX: u32 = 16 * 1024 * 1024;

    /// Minimal service: serves the whole descriptor, overrides nothing.
    struct PassthroughOnly;

    impl ProxyService for PassthroughOnly {
        fn name(&self) -> &str {
            "passthrough"
        }

        fn descriptor(&self) -> Vec<MethodId> {
            MethodId::ALL.to_vec()
        }

        fn overrides(&self) -> Vec<MethodId> {
            Vec::new()
        }

        fn call_unary(&self, call: TransportCall) -> BoxFuture<'_, Result<TransportReply>> {
            Box::pin(async move { Err(TetherError::Unimplemented(call.method())) })
        }

        fn call_streaming(
            &self,
            call: TransportCall,
            _sink: EventSink,
        ) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move { Err(TetherError::Unimplemented(call.method())) })
        }
    }

    async fn bare_proxy() -> (Arc<TransportProxy>, FakeDaemon, TempDir) {
        let daemon = FakeDaemon::start().await.unwrap();
        let device_handle = Arc::new(FakeDevice::new("proxy-test", 30));
        device_handle.set_daemon_addr(daemon.addr());

        let client = Arc::new(
            TransportClient::connect(daemon.port(), MAX).await.unwrap(),
        );
        let runtime = TempDir::new().unwrap();
        let snapshot = crate::bridge::device_snapshot(
            device_handle.as_ref(),
            &crate::config::PipelineConfig::default(),
        )
        .await;
        let proxy = Arc::new(TransportProxy::new(
            snapshot,
            client,
            ForwardGuard::new(device_handle, 0),
            runtime.path().to_path_buf(),
            MAX,
        ));
        (proxy, daemon, runtime)
    }

    #[tokio::test]
    async fn test_connect_requires_initialization() {
        let (proxy, _daemon, _dir) = bare_proxy().await;
        proxy.register_service(Arc::new(PassthroughOnly)).unwrap();

        let err = proxy.connect().await.unwrap_err();
        assert!(matches!(err, TetherError::ProxyNotInitialized));
    }

    #[tokio::test]
    async fn test_register_after_initialize_fails() {
        let (proxy, _daemon, _dir) = bare_proxy().await;
        proxy.register_service(Arc::new(PassthroughOnly)).unwrap();
        proxy.initialize_server("proxy-test").unwrap();

        let err = proxy
            .register_service(Arc::new(PassthroughOnly))
            .unwrap_err();
        assert!(matches!(err, TetherError::ProxyAlreadyInitialized));

        let err = proxy.initialize_server("again").unwrap_err();
        assert!(matches!(err, TetherError::ProxyAlreadyInitialized));
    }

    #[tokio::test]
    async fn test_forward_route_passes_through_to_daemon() {
        let (proxy, daemon, _dir) = bare_proxy().await;
        proxy.register_service(Arc::new(PassthroughOnly)).unwrap();
        proxy.initialize_server("proxy-test").unwrap();
        proxy.connect().await.unwrap();

        let client = ProxyClient::connect(proxy.socket_path().unwrap(), MAX)
            .await
            .unwrap();
        let reply = client
            .call(TransportCall::GetVersion(VersionRequest { stream_id: 1 }))
            .await
            .unwrap();
        match reply {
            TransportReply::Version(v) => assert_eq!(v.version, "fake-daemon-1"),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(daemon.calls(), vec![MethodId::GetVersion]);

        proxy.disconnect().await;
    }

    #[tokio::test]
    async fn test_non_overridden_streaming_is_unimplemented() {
        let (proxy, _daemon, _dir) = bare_proxy().await;
        proxy.register_service(Arc::new(PassthroughOnly)).unwrap();
        proxy.initialize_server("proxy-test").unwrap();
        proxy.connect().await.unwrap();

        let client = ProxyClient::connect(proxy.socket_path().unwrap(), MAX)
            .await
            .unwrap();
        let err = client.call(TransportCall::GetEvents).await.unwrap_err();
        assert!(err.to_string().contains("unimplemented"));

        proxy.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_removes_socket() {
        let (proxy, _daemon, _dir) = bare_proxy().await;
        proxy.register_service(Arc::new(PassthroughOnly)).unwrap();
        proxy.initialize_server("proxy-test").unwrap();
        proxy.connect().await.unwrap();

        let socket = proxy.socket_path().unwrap();
        assert!(socket.exists());

        proxy.disconnect().await;
        proxy.disconnect().await;

        // Give the aborted accept task a moment to drop the listener.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_unary_override_reaches_service() {
        struct FixedTime;
        impl ProxyService for FixedTime {
            fn name(&self) -> &str {
                "fixed-time"
            }
            fn descriptor(&self) -> Vec<MethodId> {
                vec![MethodId::GetCurrentTime]
            }
            fn overrides(&self) -> Vec<MethodId> {
                vec![MethodId::GetCurrentTime]
            }
            fn call_unary(&self, _call: TransportCall) -> BoxFuture<'_, Result<TransportReply>> {
                Box::pin(async {
                    Ok(TransportReply::Time(crate::rpc::protocol::TimeResponse {
                        timestamp_ns: 1234,
                    }))
                })
            }
            fn call_streaming(
                &self,
                call: TransportCall,
                _sink: EventSink,
            ) -> BoxFuture<'_, Result<()>> {
                Box::pin(async move { Err(TetherError::Unimplemented(call.method())) })
            }
        }

        let (proxy, daemon, _dir) = bare_proxy().await;
        proxy.register_service(Arc::new(FixedTime)).unwrap();
        proxy.initialize_server("proxy-test").unwrap();
        proxy.connect().await.unwrap();

        let client = ProxyClient::connect(proxy.socket_path().unwrap(), MAX)
            .await
            .unwrap();
        let reply = client
            .call(TransportCall::GetCurrentTime(TimeRequest { stream_id: 1 }))
            .await
            .unwrap();
        assert_eq!(
            reply,
            TransportReply::Time(crate::rpc::protocol::TimeResponse { timestamp_ns: 1234 })
        );
        // Answered on the host; the daemon never saw the call.
        assert!(daemon.calls().is_empty());

        proxy.disconnect().await;
    }
}
