//! Device-facing proxy service.
//!
//! Answers the host-maintained parts of the transport surface (`GetDevices`,
//! `GetProcesses`, the byte cache, command dispatch) and forwards the rest.
//! Two background pumps feed its event queue: a reader draining the daemon's
//! event stream, and a process tracker diffing bridge client snapshots into
//! started/ended process events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use tether_types::{
    Device, Event, ProcessRecord, ProcessState, TERMINATION_TIMESTAMP_NS,
};

use crate::bridge::{
    BridgeEvent, CHANGE_CLIENT_LIST, CHANGE_CLIENT_NAME, DeviceBridge, DeviceHandle,
};
use crate::error::{Result, TetherError};
use crate::pipeline::events::{ByteCache, EventQueue, EventSink};
use crate::pipeline::proxy::ProxyService;
use crate::rpc::client::TransportClient;
use crate::rpc::protocol::{
    BytesResponse, CommandKind, DevicesResponse, ExecuteResponse, MethodId, ProcessesResponse,
    TimeResponse, TransportCall, TransportReply,
};

/// Host-side handler for one `Execute` command kind. When registered, the
/// handler produces the full response locally and the daemon is bypassed.
pub trait CommandHandler: Send + Sync {
    fn handle(
        &self,
        command: crate::rpc::protocol::Command,
    ) -> BoxFuture<'_, Result<ExecuteResponse>>;
}

struct ServiceShared {
    device: Device,
    client: Arc<TransportClient>,
    handle: Arc<dyn DeviceHandle>,
    bridge: Arc<dyn DeviceBridge>,
    queue: EventQueue,
    bytes: ByteCache,
    processes: Mutex<HashMap<i32, ProcessRecord>>,
    command_handlers: Mutex<HashMap<CommandKind, Arc<dyn CommandHandler>>>,
}

impl ServiceShared {
    /// Force-remove every tracked process, emitting one ended event each.
    fn end_all_processes(&self, timestamp_ns: i64) {
        let drained: Vec<ProcessRecord> = {
            let mut processes = self.processes.lock().unwrap();
            processes.drain().map(|(_, record)| record).collect()
        };
        for mut record in drained {
            record.state = ProcessState::Dead;
            self.queue
                .push(Event::process_ended(record.pid, timestamp_ns));
        }
    }
}

/// The proxy service for one device.
pub struct DeviceProxyService {
    shared: Arc<ServiceShared>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    tracker_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes `GetEvents` subscribers; one pump owns the queue at a
    /// time.
    stream_lock: tokio::sync::Mutex<()>,
}

impl DeviceProxyService {
    pub fn new(
        device: Device,
        client: Arc<TransportClient>,
        handle: Arc<dyn DeviceHandle>,
        bridge: Arc<dyn DeviceBridge>,
    ) -> Self {
        Self {
            shared: Arc::new(ServiceShared {
                device,
                client,
                handle,
                bridge,
                queue: EventQueue::new(),
                bytes: ByteCache::new(),
                processes: Mutex::new(HashMap::new()),
                command_handlers: Mutex::new(HashMap::new()),
            }),
            reader_task: Mutex::new(None),
            tracker_task: Mutex::new(None),
            stream_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    /// Register a host-side `Execute` handler.
    pub fn register_command_handler(&self, kind: CommandKind, handler: Arc<dyn CommandHandler>) {
        self.shared
            .command_handlers
            .lock()
            .unwrap()
            .insert(kind, handler);
    }

    /// Stash a payload for a later one-shot `GetBytes` retrieval.
    pub fn write_bytes(&self, id: impl Into<String>, contents: Vec<u8>) {
        self.shared.bytes.insert(id, contents);
    }

    /// Push a host-synthesized event into the stream.
    pub fn push_event(&self, event: Event) -> bool {
        self.shared.queue.push(event)
    }

    /// Current process records, sorted by pid.
    pub fn process_snapshot(&self) -> Vec<ProcessRecord> {
        let mut processes: Vec<ProcessRecord> = self
            .shared
            .processes
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        processes.sort_by_key(|record| record.pid);
        processes
    }

    async fn handle_unary(&self, call: TransportCall) -> Result<TransportReply> {
        let shared = &self.shared;
        match call {
            TransportCall::GetDevices => Ok(TransportReply::Devices(DevicesResponse {
                devices: vec![shared.device.clone()],
            })),

            TransportCall::GetProcesses(_) => Ok(TransportReply::Processes(ProcessesResponse {
                processes: self.process_snapshot(),
            })),

            TransportCall::GetCurrentTime(request) => {
                if shared.device.is_supported() {
                    shared
                        .client
                        .call(TransportCall::GetCurrentTime(request))
                        .await
                } else {
                    // Unsupported devices never reach the daemon; answer
                    // with the default.
                    Ok(TransportReply::Time(TimeResponse::default()))
                }
            }

            TransportCall::GetBytes(request) => {
                if let Some(contents) = shared.bytes.take(&request.id) {
                    return Ok(TransportReply::Bytes(BytesResponse { contents }));
                }
                shared.client.call(TransportCall::GetBytes(request)).await
            }

            TransportCall::Execute(request) => {
                let handler = shared
                    .command_handlers
                    .lock()
                    .unwrap()
                    .get(&request.command.kind)
                    .cloned();
                match handler {
                    Some(handler) => {
                        let response = handler.handle(request.command).await?;
                        Ok(TransportReply::Execute(response))
                    }
                    None => shared.client.call(TransportCall::Execute(request)).await,
                }
            }

            other => Err(TetherError::Unimplemented(other.method())),
        }
    }
}

impl ProxyService for DeviceProxyService {
    fn name(&self) -> &str {
        "device-transport"
    }

    fn descriptor(&self) -> Vec<MethodId> {
        MethodId::ALL.to_vec()
    }

    fn overrides(&self) -> Vec<MethodId> {
        vec![
            MethodId::GetDevices,
            MethodId::GetProcesses,
            MethodId::GetCurrentTime,
            MethodId::GetBytes,
            MethodId::Execute,
            MethodId::GetEvents,
        ]
    }

    fn call_unary(&self, call: TransportCall) -> BoxFuture<'_, Result<TransportReply>> {
        Box::pin(self.handle_unary(call))
    }

    fn call_streaming(&self, call: TransportCall, sink: EventSink) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match call {
                TransportCall::GetEvents => {
                    let _guard = self.stream_lock.lock().await;
                    self.shared.queue.pump_to(sink).await;
                    Ok(())
                }
                other => Err(TetherError::Unimplemented(other.method())),
            }
        })
    }

    fn on_connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let reader = tokio::spawn(run_event_reader(self.shared.clone()));
            *self.reader_task.lock().unwrap() = Some(reader);

            let tracker = tokio::spawn(run_process_tracker(self.shared.clone()));
            *self.tracker_task.lock().unwrap() = Some(tracker);
            Ok(())
        })
    }

    fn on_disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(task) = self.tracker_task.lock().unwrap().take() {
                task.abort();
            }
            if let Some(task) = self.reader_task.lock().unwrap().take() {
                task.abort();
            }
            // The reader may not have run its own cleanup; ending processes
            // here is a no-op when it already did.
            self.shared.end_all_processes(TERMINATION_TIMESTAMP_NS);
            self.shared.queue.close();
        })
    }
}

/// Reader pump: drain the daemon's event stream into the queue. On stream
/// termination, force-end every tracked process and signal the writer to
/// stop once the queue drains.
async fn run_event_reader(shared: Arc<ServiceShared>) {
    match shared.client.open_event_stream().await {
        Ok(mut stream) => loop {
            match stream.next().await {
                Ok(Some(event)) => {
                    shared.queue.push(event);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(
                        "event stream for {} ended: {}",
                        shared.device.serial,
                        e
                    );
                    break;
                }
            }
        },
        Err(e) => {
            tracing::warn!(
                "could not open event stream for {}: {}",
                shared.device.serial,
                e
            );
        }
    }

    shared.end_all_processes(TERMINATION_TIMESTAMP_NS);
    shared.queue.close();
}

/// Tracker pump: on client-list/name signals, diff the bridge snapshot
/// against known records and synthesize process lifecycle events.
async fn run_process_tracker(shared: Arc<ServiceShared>) {
    let mut subscription = shared.bridge.subscribe();
    sync_clients(&shared).await;

    while let Some(event) = subscription.recv().await {
        if let BridgeEvent::DeviceChanged { serial, mask } = event
            && serial == shared.device.serial
            && mask & (CHANGE_CLIENT_LIST | CHANGE_CLIENT_NAME) != 0
        {
            sync_clients(&shared).await;
        }
    }
}

async fn sync_clients(shared: &Arc<ServiceShared>) {
    let clients = match shared.handle.clients().await {
        Ok(clients) => clients,
        Err(e) => {
            tracing::warn!(
                "failed to list clients for {}: {}",
                shared.device.serial,
                e
            );
            return;
        }
    };

    // Only clients with a resolved description become process records.
    let resolved: HashMap<i32, crate::bridge::BridgeClient> = clients
        .into_iter()
        .filter(|client| client.name.is_some())
        .map(|client| (client.pid, client))
        .collect();

    let (added, removed) = {
        let known = shared.processes.lock().unwrap();
        let added: Vec<crate::bridge::BridgeClient> = resolved
            .values()
            .filter(|client| !known.contains_key(&client.pid))
            .cloned()
            .collect();
        let removed: Vec<i32> = known
            .keys()
            .filter(|pid| !resolved.contains_key(pid))
            .copied()
            .collect();
        (added, removed)
    };

    for client in added {
        // The start time is fetched once per process, at discovery.
        let start_timestamp_ns = if shared.device.is_supported() {
            shared
                .client
                .get_current_time(shared.device.id)
                .await
                .map(|time| time.timestamp_ns)
                .unwrap_or(0)
        } else {
            0
        };

        let record = ProcessRecord {
            pid: client.pid,
            device_id: shared.device.id,
            name: client.name.unwrap_or_default(),
            start_timestamp_ns,
            abi: client.abi,
            state: ProcessState::Alive,
        };
        shared
            .processes
            .lock()
            .unwrap()
            .insert(record.pid, record.clone());
        shared.queue.push(Event::process_started(record));
    }

    for pid in removed {
        let record = shared.processes.lock().unwrap().remove(&pid);
        if let Some(record) = record {
            let timestamp_ns = shared
                .queue
                .last_timestamp_ns()
                .max(record.start_timestamp_ns);
            shared.queue.push(Event::process_ended(pid, timestamp_ns));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::{FakeBridge, FakeDaemon, FakeDevice};
    use crate::bridge::{BridgeClient, device_snapshot};
    use crate::config::PipelineConfig;
    use crate::rpc::protocol::{BytesRequest, Command, CommandDetails, TimeRequest};
    use std::time::Duration;
    use tether_types::EventPayload;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const MAX: u32 = 16 * 1024 * 1024;

    struct Fixture {
        service: Arc<DeviceProxyService>,
        daemon: FakeDaemon,
        bridge: Arc<FakeBridge>,
        _device: Arc<FakeDevice>,
    }

    async fn fixture(feature_level: u32) -> Fixture {
        let daemon = FakeDaemon::start().await.unwrap();
        let device = Arc::new(FakeDevice::new("svc-test", feature_level));
        device.set_daemon_addr(daemon.addr());
        let bridge = FakeBridge::new();
        bridge.connect_device(device.clone());

        let client = Arc::new(
            crate::rpc::client::TransportClient::connect(daemon.port(), MAX)
                .await
                .unwrap(),
        );
        let snapshot =
            device_snapshot(device.as_ref(), &PipelineConfig::default()).await;
        let service = Arc::new(DeviceProxyService::new(
            snapshot,
            client,
            device.clone(),
            bridge.clone(),
        ));
        Fixture {
            service,
            daemon,
            bridge,
            _device: device,
        }
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !predicate() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_get_devices_is_synthesized() {
        let fx = fixture(30).await;
        let reply = fx
            .service
            .call_unary(TransportCall::GetDevices)
            .await
            .unwrap();
        match reply {
            TransportReply::Devices(devices) => {
                assert_eq!(devices.devices.len(), 1);
                assert_eq!(devices.devices[0].serial, "svc-test");
            }
            other => panic!("unexpected reply {:?}", other),
        }
        // Never forwarded.
        assert!(fx.daemon.calls().is_empty());
    }

    #[tokio::test]
    async fn test_get_current_time_forwarded_when_supported() {
        let fx = fixture(30).await;
        let reply = fx
            .service
            .call_unary(TransportCall::GetCurrentTime(TimeRequest { stream_id: 1 }))
            .await
            .unwrap();
        match reply {
            TransportReply::Time(time) => assert!(time.timestamp_ns > 0),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(fx.daemon.calls(), vec![MethodId::GetCurrentTime]);
    }

    #[tokio::test]
    async fn test_get_current_time_short_circuits_unsupported_device() {
        // Feature level below the supported minimum.
        let fx = fixture(19).await;
        assert!(!fx.service.device().is_supported());

        let reply = fx
            .service
            .call_unary(TransportCall::GetCurrentTime(TimeRequest { stream_id: 1 }))
            .await
            .unwrap();
        assert_eq!(reply, TransportReply::Time(TimeResponse::default()));
        // The device was never contacted.
        assert!(fx.daemon.calls().is_empty());
    }

    #[tokio::test]
    async fn test_get_bytes_prefers_cache_and_removes_entry() {
        let fx = fixture(30).await;
        fx.service.write_bytes("blob-1", vec![7, 8, 9]);

        let reply = fx
            .service
            .call_unary(TransportCall::GetBytes(BytesRequest {
                id: "blob-1".into(),
                stream_id: 1,
            }))
            .await
            .unwrap();
        assert_eq!(
            reply,
            TransportReply::Bytes(BytesResponse {
                contents: vec![7, 8, 9]
            })
        );
        assert!(fx.daemon.calls().is_empty(), "cache hit must not forward");

        // Second retrieval misses the cache and forwards to the daemon,
        // which has nothing either.
        let reply = fx
            .service
            .call_unary(TransportCall::GetBytes(BytesRequest {
                id: "blob-1".into(),
                stream_id: 1,
            }))
            .await
            .unwrap();
        assert_eq!(reply, TransportReply::Bytes(BytesResponse::default()));
        assert_eq!(fx.daemon.calls(), vec![MethodId::GetBytes]);
    }

    #[tokio::test]
    async fn test_execute_prefers_registered_handler() {
        struct Canned;
        impl CommandHandler for Canned {
            fn handle(&self, _command: Command) -> BoxFuture<'_, Result<ExecuteResponse>> {
                Box::pin(async { Ok(ExecuteResponse { command_id: 777 }) })
            }
        }

        let fx = fixture(30).await;
        fx.service
            .register_command_handler(CommandKind::AttachAgent, Arc::new(Canned));

        let command = Command {
            stream_id: 1,
            pid: 2,
            kind: CommandKind::AttachAgent,
            details: CommandDetails::None,
        };
        let reply = fx
            .service
            .call_unary(TransportCall::Execute(crate::rpc::protocol::ExecuteRequest {
                command: command.clone(),
            }))
            .await
            .unwrap();
        assert_eq!(
            reply,
            TransportReply::Execute(ExecuteResponse { command_id: 777 })
        );
        assert!(fx.daemon.executed_commands().is_empty());

        // A kind with no handler goes to the daemon.
        let other = Command {
            kind: CommandKind::BeginSession,
            ..command
        };
        fx.service
            .call_unary(TransportCall::Execute(crate::rpc::protocol::ExecuteRequest {
                command: other,
            }))
            .await
            .unwrap();
        assert_eq!(fx.daemon.executed_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_process_lifecycle_events_exactly_once() {
        let fx = fixture(30).await;
        fx.service.on_connect().await.unwrap();

        fx.bridge.change_clients(
            "svc-test",
            vec![BridgeClient {
                pid: 100,
                name: Some("com.example.app".into()),
                abi: "arm64-v8a".into(),
            }],
        );
        let service = fx.service.clone();
        wait_until(move || service.process_snapshot().len() == 1).await;

        let snapshot = fx.service.process_snapshot();
        assert_eq!(snapshot[0].pid, 100);
        assert_eq!(snapshot[0].name, "com.example.app");
        assert!(snapshot[0].start_timestamp_ns > 0);

        fx.bridge.change_clients("svc-test", vec![]);
        let service = fx.service.clone();
        wait_until(move || service.process_snapshot().is_empty()).await;

        // Drain the queue: exactly one started and one ended event, in
        // order, sharing the pid as group id.
        let (tx, mut rx) = mpsc::channel(16);
        let service = fx.service.clone();
        tokio::spawn(async move {
            service
                .call_streaming(TransportCall::GetEvents, EventSink::new(tx))
                .await
        });

        let started = rx.recv().await.unwrap();
        assert!(!started.is_ended);
        assert_eq!(started.group_id, 100);
        assert!(matches!(
            started.payload,
            EventPayload::ProcessStarted { .. }
        ));

        let ended = rx.recv().await.unwrap();
        assert!(ended.is_ended);
        assert_eq!(ended.group_id, 100);
        assert_ne!(ended.timestamp_ns, TERMINATION_TIMESTAMP_NS);

        fx.service.on_disconnect().await;
    }

    #[tokio::test]
    async fn test_unresolved_clients_are_ignored() {
        let fx = fixture(30).await;
        fx.service.on_connect().await.unwrap();

        fx.bridge.change_clients(
            "svc-test",
            vec![BridgeClient {
                pid: 5,
                name: None,
                abi: "arm64-v8a".into(),
            }],
        );
        // Give the tracker a moment; no record may appear.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.service.process_snapshot().is_empty());

        fx.service.on_disconnect().await;
    }

    #[tokio::test]
    async fn test_stream_loss_force_ends_processes_with_sentinel() {
        let fx = fixture(30).await;
        fx.service.on_connect().await.unwrap();

        fx.bridge.change_clients(
            "svc-test",
            vec![BridgeClient {
                pid: 42,
                name: Some("com.example.app".into()),
                abi: "arm64-v8a".into(),
            }],
        );
        let service = fx.service.clone();
        wait_until(move || service.process_snapshot().len() == 1).await;

        // Daemon stream terminates: all records are force-removed with the
        // terminal sentinel timestamp, then the queue closes.
        fx.daemon.end_event_stream();
        let service = fx.service.clone();
        wait_until(move || service.shared.queue.is_closed()).await;
        assert!(fx.service.process_snapshot().is_empty());

        let (tx, mut rx) = mpsc::channel(16);
        let service = fx.service.clone();
        let pump = tokio::spawn(async move {
            service
                .call_streaming(TransportCall::GetEvents, EventSink::new(tx))
                .await
        });

        let started = rx.recv().await.unwrap();
        assert!(!started.is_ended);
        let ended = rx.recv().await.unwrap();
        assert!(ended.is_ended);
        assert_eq!(ended.timestamp_ns, TERMINATION_TIMESTAMP_NS);
        assert!(rx.recv().await.is_none(), "queue completed after drain");
        pump.await.unwrap().unwrap();
    }
}
