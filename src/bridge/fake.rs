//! In-memory bridge backend.
//!
//! `FakeBridge`/`FakeDevice` script every observable behavior of a real
//! bridge: boot-property polling, file pushes, chmod rejection, daemon
//! stdout, forward rules (backed by a real TCP relay so the channel
//! establisher connects to something live), and client lists. `FakeDaemon`
//! is a TCP server speaking the transport protocol, standing in for the
//! on-device daemon behind the relay.
//!
//! This backend is first-class rather than test-only: virtual pipelines and
//! replay sources drive it the same way the test suite does.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;

use tether_types::{DeviceState, Event};

use crate::bridge::{
    BridgeClient, BridgeEvent, BridgeSubscription, CHANGE_CLIENT_LIST, CHANGE_STATE, DeviceBridge,
    DeviceHandle, ForwardTarget,
};
use crate::error::{Result, TetherError};
use crate::pipeline::launcher::{BOOT_COMPLETE_PROPERTY, BOOT_COMPLETE_VALUE};
use crate::rpc::protocol::{
    AgentStatusResponse, BytesResponse, Command, DevicesResponse, EventGroupsResponse, MethodId,
    ProcessesResponse, RpcFrame, TimeResponse, TransportCall, TransportReply, VersionResponse,
    read_request, write_response,
};

const FAKE_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// A file pushed to a fake device.
#[derive(Debug, Clone)]
pub struct PushedFile {
    pub remote: String,
    pub local: Option<PathBuf>,
    pub bytes: Option<Vec<u8>>,
}

struct ForwardRelay {
    target: ForwardTarget,
    task: JoinHandle<()>,
}

/// Scripted device handle.
pub struct FakeDevice {
    serial: String,
    feature_level: u32,
    is_emulator: bool,
    state: Mutex<DeviceState>,
    boot_id: Mutex<Option<String>>,
    /// Boot-property polls answered with "not yet" before the device
    /// reports boot completion.
    boot_polls_until_ready: AtomicU32,
    reject_symbolic_chmod: AtomicBool,
    fail_forward: AtomicBool,
    daemon_exits_after_output: AtomicBool,
    fail_next_shell: Mutex<Option<String>>,
    daemon_lines: Mutex<Vec<String>>,
    daemon_addr: Mutex<Option<SocketAddr>>,
    daemon_line_tx: Mutex<Option<mpsc::Sender<String>>>,
    shell_log: Mutex<Vec<String>>,
    chmod_log: Mutex<Vec<String>>,
    pushes: Mutex<Vec<PushedFile>>,
    forwards: Mutex<HashMap<u16, ForwardRelay>>,
    clients: Mutex<Vec<BridgeClient>>,
}

impl FakeDevice {
    pub fn new(serial: impl Into<String>, feature_level: u32) -> Self {
        let serial = serial.into();
        let boot_id = format!("boot-{}", serial);
        Self {
            serial,
            feature_level,
            is_emulator: false,
            state: Mutex::new(DeviceState::Online),
            boot_id: Mutex::new(Some(boot_id)),
            boot_polls_until_ready: AtomicU32::new(0),
            reject_symbolic_chmod: AtomicBool::new(false),
            fail_forward: AtomicBool::new(false),
            daemon_exits_after_output: AtomicBool::new(false),
            fail_next_shell: Mutex::new(None),
            daemon_lines: Mutex::new(vec!["Server listening on @TetherTransport".to_string()]),
            daemon_addr: Mutex::new(None),
            daemon_line_tx: Mutex::new(None),
            shell_log: Mutex::new(Vec::new()),
            chmod_log: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            forwards: Mutex::new(HashMap::new()),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Answer the boot-completion property with "not yet" for the first
    /// `polls` queries.
    pub fn set_boot_polls_until_ready(&self, polls: u32) {
        self.boot_polls_until_ready.store(polls, Ordering::SeqCst);
    }

    /// Make the boot id unreadable, forcing the random-id fallback.
    pub fn clear_boot_id(&self) {
        *self.boot_id.lock().unwrap() = None;
    }

    /// Reject the symbolic chmod form the way old shells do.
    pub fn set_reject_symbolic_chmod(&self, reject: bool) {
        self.reject_symbolic_chmod.store(reject, Ordering::SeqCst);
    }

    /// Reject forward creation.
    pub fn set_fail_forward(&self, fail: bool) {
        self.fail_forward.store(fail, Ordering::SeqCst);
    }

    /// Fail the next shell command with a rejected-command error.
    pub fn fail_next_shell(&self, message: impl Into<String>) {
        *self.fail_next_shell.lock().unwrap() = Some(message.into());
    }

    /// Script the daemon's stdout for the next launch.
    pub fn set_daemon_lines(&self, lines: Vec<String>) {
        *self.daemon_lines.lock().unwrap() = lines;
    }

    /// Close the daemon's stdout right after the scripted lines, as if the
    /// daemon exited instead of staying up.
    pub fn set_daemon_exits_after_output(&self, exits: bool) {
        self.daemon_exits_after_output.store(exits, Ordering::SeqCst);
    }

    /// Point forward rules at a live [`FakeDaemon`].
    pub fn set_daemon_addr(&self, addr: SocketAddr) {
        *self.daemon_addr.lock().unwrap() = Some(addr);
    }

    pub fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_clients(&self, clients: Vec<BridgeClient>) {
        *self.clients.lock().unwrap() = clients;
    }

    /// Emit a late daemon stdout line on the running launch stream.
    pub async fn push_daemon_line(&self, line: impl Into<String>) {
        let tx = self.daemon_line_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(line.into()).await;
        }
    }

    /// Close the daemon's stdout stream, as if the daemon exited.
    pub fn end_daemon_output(&self) {
        *self.daemon_line_tx.lock().unwrap() = None;
    }

    pub fn shell_log(&self) -> Vec<String> {
        self.shell_log.lock().unwrap().clone()
    }

    pub fn chmod_log(&self) -> Vec<String> {
        self.chmod_log.lock().unwrap().clone()
    }

    pub fn pushed_files(&self) -> Vec<PushedFile> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn forward_targets(&self) -> Vec<ForwardTarget> {
        self.forwards
            .lock()
            .unwrap()
            .values()
            .map(|relay| relay.target.clone())
            .collect()
    }

    fn run_shell(&self, command: &str) -> Result<String> {
        if let Some(message) = self.fail_next_shell.lock().unwrap().take() {
            return Err(TetherError::CommandRejected(message));
        }
        self.shell_log.lock().unwrap().push(command.to_string());

        if command.starts_with("chmod ") {
            self.chmod_log.lock().unwrap().push(command.to_string());
            if command.starts_with("chmod +x") && self.reject_symbolic_chmod.load(Ordering::SeqCst)
            {
                return Ok("Bad mode".to_string());
            }
            return Ok(String::new());
        }

        Ok(String::new())
    }
}

impl DeviceHandle for FakeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn state(&self) -> DeviceState {
        *self.state.lock().unwrap()
    }

    fn feature_level(&self) -> u32 {
        self.feature_level
    }

    fn manufacturer(&self) -> String {
        "FakeWorks".to_string()
    }

    fn model(&self) -> String {
        format!("fake-{}", self.feature_level)
    }

    fn is_emulator(&self) -> bool {
        self.is_emulator
    }

    fn abis(&self) -> Vec<String> {
        vec!["arm64-v8a".to_string(), "armeabi-v7a".to_string()]
    }

    fn boot_id(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move { self.boot_id.lock().unwrap().clone() })
    }

    fn get_property<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            if name == BOOT_COMPLETE_PROPERTY {
                let remaining = self.boot_polls_until_ready.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.boot_polls_until_ready.store(remaining - 1, Ordering::SeqCst);
                    return Ok(None);
                }
                return Ok(Some(BOOT_COMPLETE_VALUE.to_string()));
            }
            Ok(None)
        })
    }

    fn push_file<'a>(&'a self, local: &'a Path, remote: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.pushes.lock().unwrap().push(PushedFile {
                remote: remote.to_string(),
                local: Some(local.to_path_buf()),
                bytes: None,
            });
            Ok(())
        })
    }

    fn push_bytes<'a>(&'a self, bytes: &'a [u8], remote: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.pushes.lock().unwrap().push(PushedFile {
                remote: remote.to_string(),
                local: None,
                bytes: Some(bytes.to_vec()),
            });
            Ok(())
        })
    }

    fn shell<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { self.run_shell(command) })
    }

    fn shell_lines<'a>(
        &'a self,
        command: &'a str,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<String>>> {
        Box::pin(async move {
            if let Some(message) = self.fail_next_shell.lock().unwrap().take() {
                return Err(TetherError::CommandRejected(message));
            }
            self.shell_log.lock().unwrap().push(command.to_string());

            let (tx, rx) = mpsc::channel(64);
            let lines = self.daemon_lines.lock().unwrap().clone();
            // Hold a sender so the stream stays open after the scripted
            // lines, like a daemon that keeps running.
            if self.daemon_exits_after_output.load(Ordering::SeqCst) {
                *self.daemon_line_tx.lock().unwrap() = None;
            } else {
                *self.daemon_line_tx.lock().unwrap() = Some(tx.clone());
            }
            tokio::spawn(async move {
                for line in lines {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        })
    }

    fn create_forward(&self, local_port: u16, target: ForwardTarget) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.fail_forward.load(Ordering::SeqCst) {
                return Err(TetherError::CommandRejected("forward rejected".to_string()));
            }
            let daemon_addr = *self.daemon_addr.lock().unwrap();
            let listener = TcpListener::bind(("127.0.0.1", local_port)).await?;
            // Relay forwarded connections to the fake daemon, like the real
            // bridge relays them over USB.
            let task = tokio::spawn(async move {
                while let Ok((mut inbound, _)) = listener.accept().await {
                    let Some(addr) = daemon_addr else { continue };
                    tokio::spawn(async move {
                        if let Ok(mut outbound) = TcpStream::connect(addr).await {
                            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
                                .await;
                        }
                    });
                }
            });
            self.forwards
                .lock()
                .unwrap()
                .insert(local_port, ForwardRelay { target, task });
            Ok(())
        })
    }

    fn remove_forward(&self, local_port: u16) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(relay) = self.forwards.lock().unwrap().remove(&local_port) {
                relay.task.abort();
            }
            Ok(())
        })
    }

    fn clients(&self) -> BoxFuture<'_, Result<Vec<BridgeClient>>> {
        Box::pin(async move { Ok(self.clients.lock().unwrap().clone()) })
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        for (_, relay) in self.forwards.lock().unwrap().drain() {
            relay.task.abort();
        }
    }
}

/// Scripted bridge publishing [`BridgeEvent`]s to subscribers.
pub struct FakeBridge {
    devices: Mutex<HashMap<String, Arc<FakeDevice>>>,
    events: broadcast::Sender<BridgeEvent>,
}

impl FakeBridge {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Register a device and announce its connection.
    pub fn connect_device(&self, device: Arc<FakeDevice>) {
        let serial = device.serial().to_string();
        self.devices.lock().unwrap().insert(serial.clone(), device);
        let _ = self.events.send(BridgeEvent::DeviceConnected { serial });
    }

    /// Flip a device's state and announce the change.
    pub fn set_device_state(&self, serial: &str, state: DeviceState) {
        if let Some(device) = self.devices.lock().unwrap().get(serial) {
            device.set_state(state);
        }
        let _ = self.events.send(BridgeEvent::DeviceChanged {
            serial: serial.to_string(),
            mask: CHANGE_STATE,
        });
    }

    /// Announce a device's departure.
    pub fn disconnect_device(&self, serial: &str) {
        if let Some(device) = self.devices.lock().unwrap().get(serial) {
            device.set_state(DeviceState::Disconnected);
        }
        let _ = self.events.send(BridgeEvent::DeviceDisconnected {
            serial: serial.to_string(),
        });
    }

    /// Replace a device's client list and announce the change.
    pub fn change_clients(&self, serial: &str, clients: Vec<BridgeClient>) {
        if let Some(device) = self.devices.lock().unwrap().get(serial) {
            device.set_clients(clients);
        }
        let _ = self.events.send(BridgeEvent::DeviceChanged {
            serial: serial.to_string(),
            mask: CHANGE_CLIENT_LIST,
        });
    }

    /// Announce the loss of the bridge service itself.
    pub fn lose_bridge(&self) {
        let _ = self.events.send(BridgeEvent::BridgeLost);
    }
}

impl DeviceBridge for FakeBridge {
    fn subscribe(&self) -> BridgeSubscription {
        BridgeSubscription::new(self.events.subscribe())
    }

    fn devices(&self) -> Vec<Arc<dyn DeviceHandle>> {
        self.devices
            .lock()
            .unwrap()
            .values()
            .map(|device| device.clone() as Arc<dyn DeviceHandle>)
            .collect()
    }

    fn device(&self, serial: &str) -> Option<Arc<dyn DeviceHandle>> {
        self.devices
            .lock()
            .unwrap()
            .get(serial)
            .map(|device| device.clone() as Arc<dyn DeviceHandle>)
    }
}

#[derive(Clone)]
enum StreamMsg {
    Event(Event),
    End,
}

/// Append-only script of stream messages; readers replay it from the start
/// and wait for new entries, so nothing emitted is ever missed regardless of
/// when a subscriber attaches.
struct EventScript {
    entries: Mutex<Vec<StreamMsg>>,
    notify: Notify,
}

impl EventScript {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, msg: StreamMsg) {
        self.entries.lock().unwrap().push(msg);
        self.notify.notify_waiters();
    }

    async fn get(&self, index: usize) -> StreamMsg {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.entries.lock().unwrap().get(index) {
                return msg.clone();
            }
            notified.await;
        }
    }
}

struct FakeDaemonState {
    version: String,
    time_ns: AtomicI64,
    bytes: Mutex<HashMap<String, Vec<u8>>>,
    executed: Mutex<Vec<Command>>,
    calls: Mutex<Vec<MethodId>>,
    script: EventScript,
}

/// TCP stub standing in for the on-device daemon.
///
/// Serves the transport protocol on a loopback port: deterministic
/// monotonically increasing time, scripted events, recorded `Execute`
/// commands, and a byte store. Point a [`FakeDevice`]'s forward rules at
/// [`FakeDaemon::addr`].
pub struct FakeDaemon {
    addr: SocketAddr,
    state: Arc<FakeDaemonState>,
    accept_task: JoinHandle<()>,
}

impl FakeDaemon {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(FakeDaemonState {
            version: "fake-daemon-1".to_string(),
            time_ns: AtomicI64::new(1_000_000_000),
            bytes: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            script: EventScript::new(),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, state).await;
                });
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Append an event to the daemon's stream.
    pub fn emit(&self, event: Event) {
        self.state.script.push(StreamMsg::Event(event));
    }

    /// Complete the event stream for every present and future subscriber.
    pub fn end_event_stream(&self) {
        self.state.script.push(StreamMsg::End);
    }

    pub fn insert_bytes(&self, id: impl Into<String>, contents: Vec<u8>) {
        self.state.bytes.lock().unwrap().insert(id.into(), contents);
    }

    pub fn executed_commands(&self) -> Vec<Command> {
        self.state.executed.lock().unwrap().clone()
    }

    /// Methods called on the daemon, in order. Lets tests assert a call was
    /// short-circuited on the host and never reached the device.
    pub fn calls(&self) -> Vec<MethodId> {
        self.state.calls.lock().unwrap().clone()
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, state: Arc<FakeDaemonState>) -> Result<()> {
    loop {
        let request = match read_request(&mut stream, FAKE_MAX_MESSAGE_SIZE).await {
            Ok(request) => request,
            Err(_) => return Ok(()),
        };
        let id = request.id;
        state.calls.lock().unwrap().push(request.call.method());

        let reply = match request.call {
            TransportCall::GetEvents => {
                let mut index = 0;
                loop {
                    match state.script.get(index).await {
                        StreamMsg::Event(event) => {
                            write_response(
                                &mut stream,
                                &RpcFrame::Event { id, event },
                                FAKE_MAX_MESSAGE_SIZE,
                            )
                            .await?;
                            index += 1;
                        }
                        StreamMsg::End => {
                            write_response(
                                &mut stream,
                                &RpcFrame::End { id },
                                FAKE_MAX_MESSAGE_SIZE,
                            )
                            .await?;
                            break;
                        }
                    }
                }
                return Ok(());
            }
            TransportCall::GetVersion(_) => TransportReply::Version(VersionResponse {
                version: state.version.clone(),
            }),
            TransportCall::GetCurrentTime(_) => {
                let timestamp_ns = state.time_ns.fetch_add(1_000_000, Ordering::SeqCst) + 1_000_000;
                TransportReply::Time(TimeResponse { timestamp_ns })
            }
            TransportCall::GetBytes(request) => {
                let contents = state
                    .bytes
                    .lock()
                    .unwrap()
                    .get(&request.id)
                    .cloned()
                    .unwrap_or_default();
                TransportReply::Bytes(BytesResponse { contents })
            }
            TransportCall::GetAgentStatus(_) => {
                TransportReply::AgentStatus(AgentStatusResponse::default())
            }
            TransportCall::Execute(request) => {
                let mut executed = state.executed.lock().unwrap();
                executed.push(request.command);
                TransportReply::Execute(crate::rpc::protocol::ExecuteResponse {
                    command_id: executed.len() as i64,
                })
            }
            TransportCall::GetEventGroups(_) => {
                TransportReply::EventGroups(EventGroupsResponse::default())
            }
            TransportCall::GetDevices => TransportReply::Devices(DevicesResponse::default()),
            TransportCall::GetProcesses(_) => {
                TransportReply::Processes(ProcessesResponse::default())
            }
        };

        write_response(&mut stream, &RpcFrame::ok(id, reply), FAKE_MAX_MESSAGE_SIZE).await?;
    }
}
