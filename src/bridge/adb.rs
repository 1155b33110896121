//! Bridge backend driving the `adb` command-line tool.
//!
//! Device discovery polls `adb devices -l` and diffs the result against the
//! last snapshot, publishing connect/disconnect/state-change events on the
//! bridge bus. Per-device operations shell out to `adb -s <serial> ...`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use tether_types::DeviceState;

use crate::bridge::{
    BridgeClient, BridgeEvent, BridgeSubscription, CHANGE_CLIENT_LIST, CHANGE_STATE, DeviceBridge,
    DeviceHandle, ForwardTarget,
};
use crate::error::{Result, TetherError};

/// How often the device list is polled by default.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

static PUSH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Run an adb invocation and collect stdout, mapping failures onto the
/// transient error taxonomy.
async fn run_adb(adb: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new(adb)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(TetherError::CommandRejected(if stderr.is_empty() {
            format!("adb {} failed with {}", args.join(" "), output.status)
        } else {
            stderr
        }));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

struct AdbDeviceState {
    state: Mutex<DeviceState>,
    clients: Mutex<Vec<BridgeClient>>,
}

/// One device reached through adb.
pub struct AdbDevice {
    adb: PathBuf,
    serial: String,
    feature_level: u32,
    manufacturer: String,
    model: String,
    is_emulator: bool,
    abis: Vec<String>,
    shared: AdbDeviceState,
}

impl AdbDevice {
    /// Query device metadata and build the handle.
    async fn discover(adb: &Path, serial: &str, state: DeviceState) -> Result<Self> {
        let prop = |name: &'static str| {
            let adb = adb.to_path_buf();
            let serial = serial.to_string();
            async move {
                run_adb(&adb, &["-s", &serial, "shell", "getprop", name])
                    .await
                    .map(|out| out.trim().to_string())
                    .unwrap_or_default()
            }
        };

        let feature_level = prop("ro.build.version.sdk").await.parse().unwrap_or(1);
        let manufacturer = prop("ro.product.manufacturer").await;
        let model = prop("ro.product.model").await;
        let is_emulator = prop("ro.kernel.qemu").await == "1";
        let abis: Vec<String> = prop("ro.product.cpu.abilist")
            .await
            .split(',')
            .map(str::trim)
            .filter(|abi| !abi.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            adb: adb.to_path_buf(),
            serial: serial.to_string(),
            feature_level,
            manufacturer,
            model,
            is_emulator,
            abis,
            shared: AdbDeviceState {
                state: Mutex::new(state),
                clients: Mutex::new(Vec::new()),
            },
        })
    }

    fn set_state(&self, state: DeviceState) {
        *self.shared.state.lock().unwrap() = state;
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["-s", self.serial.as_str()];
        full.extend_from_slice(args);
        run_adb(&self.adb, &full).await
    }
}

impl DeviceHandle for AdbDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn state(&self) -> DeviceState {
        *self.shared.state.lock().unwrap()
    }

    fn feature_level(&self) -> u32 {
        self.feature_level
    }

    fn manufacturer(&self) -> String {
        self.manufacturer.clone()
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn is_emulator(&self) -> bool {
        self.is_emulator
    }

    fn abis(&self) -> Vec<String> {
        self.abis.clone()
    }

    fn boot_id(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            self.run(&["shell", "cat", "/proc/sys/kernel/random/boot_id"])
                .await
                .ok()
                .map(|out| out.trim().to_string())
                .filter(|id| !id.is_empty())
        })
    }

    fn get_property<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let out = self.run(&["shell", "getprop", name]).await?;
            let trimmed = out.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        })
    }

    fn push_file<'a>(&'a self, local: &'a Path, remote: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let local = local.to_string_lossy();
            self.run(&["push", &local, remote]).await.map(|_| ())
        })
    }

    fn push_bytes<'a>(&'a self, bytes: &'a [u8], remote: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let staged = std::env::temp_dir().join(format!(
                "tether-push-{}-{}",
                std::process::id(),
                PUSH_COUNTER.fetch_add(1, Ordering::SeqCst)
            ));
            std::fs::write(&staged, bytes)?;
            let result = self.push_file(&staged, remote).await;
            let _ = std::fs::remove_file(&staged);
            result
        })
    }

    fn shell<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { self.run(&["shell", command]).await })
    }

    fn shell_lines<'a>(
        &'a self,
        command: &'a str,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<String>>> {
        Box::pin(async move {
            let mut child = tokio::process::Command::new(&self.adb)
                .args(["-s", &self.serial, "shell", command])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| TetherError::Protocol("adb shell without stdout".to_string()))?;

            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                let _ = child.wait().await;
            });

            Ok(rx)
        })
    }

    fn create_forward(&self, local_port: u16, target: ForwardTarget) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let local = format!("tcp:{}", local_port);
            let remote = match target {
                ForwardTarget::Tcp(port) => format!("tcp:{}", port),
                ForwardTarget::AbstractSocket(name) => format!("localabstract:{}", name),
            };
            self.run(&["forward", &local, &remote]).await.map(|_| ())
        })
    }

    fn remove_forward(&self, local_port: u16) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let local = format!("tcp:{}", local_port);
            self.run(&["forward", "--remove", &local]).await.map(|_| ())
        })
    }

    fn clients(&self) -> BoxFuture<'_, Result<Vec<BridgeClient>>> {
        Box::pin(async move {
            let out = self.run(&["shell", "ps", "-A", "-o", "PID,NAME"]).await?;
            let abi = self.abis.first().cloned().unwrap_or_default();
            let clients = parse_client_list(&out, &abi);
            *self.shared.clients.lock().unwrap() = clients.clone();
            Ok(clients)
        })
    }
}

fn parse_client_list(output: &str, abi: &str) -> Vec<BridgeClient> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid: i32 = parts.next()?.parse().ok()?;
            let name = parts.next().map(str::to_string);
            Some(BridgeClient {
                pid,
                name,
                abi: abi.to_string(),
            })
        })
        .collect()
}

/// Parse one line of `adb devices -l` output into serial and state.
fn parse_device_line(line: &str) -> Option<(String, DeviceState)> {
    let mut parts = line.split_whitespace();
    let serial = parts.next()?.to_string();
    let state = parts.next()?.parse().unwrap_or(DeviceState::Offline);
    Some((serial, state))
}

struct AdbBridgeShared {
    adb: PathBuf,
    devices: Mutex<HashMap<String, Arc<AdbDevice>>>,
    events: broadcast::Sender<BridgeEvent>,
}

/// Bridge polling adb for devices.
pub struct AdbBridge {
    shared: Arc<AdbBridgeShared>,
    poll_task: JoinHandle<()>,
}

impl AdbBridge {
    /// Start polling `adb devices` at `poll_interval`.
    pub fn start(adb: impl Into<PathBuf>, poll_interval: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(AdbBridgeShared {
            adb: adb.into(),
            devices: Mutex::new(HashMap::new()),
            events,
        });

        let poll_shared = shared.clone();
        let poll_task = tokio::spawn(async move {
            let mut bridge_was_up = false;
            loop {
                match poll_once(&poll_shared, bridge_was_up).await {
                    Ok(()) => bridge_was_up = true,
                    Err(e) => {
                        if bridge_was_up {
                            tracing::warn!("adb became unavailable: {}", e);
                            let _ = poll_shared.events.send(BridgeEvent::BridgeLost);
                        }
                        bridge_was_up = false;
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        Arc::new(Self { shared, poll_task })
    }
}

/// One poll cycle: list devices, diff against the snapshot, publish events.
async fn poll_once(shared: &Arc<AdbBridgeShared>, bridge_was_up: bool) -> Result<()> {
    let out = run_adb(&shared.adb, &["devices", "-l"]).await?;
    if !bridge_was_up {
        let _ = shared.events.send(BridgeEvent::BridgeRestored);
    }

    let mut listed: HashMap<String, DeviceState> = HashMap::new();
    for line in out.lines().skip(1) {
        if let Some((serial, state)) = parse_device_line(line) {
            listed.insert(serial, state);
        }
    }

    // Departed devices.
    let departed: Vec<String> = {
        let devices = shared.devices.lock().unwrap();
        devices
            .keys()
            .filter(|serial| !listed.contains_key(*serial))
            .cloned()
            .collect()
    };
    for serial in departed {
        shared.devices.lock().unwrap().remove(&serial);
        let _ = shared
            .events
            .send(BridgeEvent::DeviceDisconnected { serial });
    }

    // New and changed devices.
    for (serial, state) in listed {
        let known = shared.devices.lock().unwrap().get(&serial).cloned();
        match known {
            None => match AdbDevice::discover(&shared.adb, &serial, state).await {
                Ok(device) => {
                    shared
                        .devices
                        .lock()
                        .unwrap()
                        .insert(serial.clone(), Arc::new(device));
                    let _ = shared.events.send(BridgeEvent::DeviceConnected { serial });
                }
                // The device can vanish between the listing and the
                // metadata queries; it will be rediscovered next cycle.
                Err(e) => tracing::warn!("failed to query device {}: {}", serial, e),
            },
            Some(device) if device.state() != state => {
                device.set_state(state);
                let _ = shared.events.send(BridgeEvent::DeviceChanged {
                    serial,
                    mask: CHANGE_STATE,
                });
            }
            Some(device) if state == DeviceState::Online => {
                // Client list poll for online devices.
                let before = device.shared.clients.lock().unwrap().clone();
                if let Ok(after) = device.clients().await
                    && before != after
                {
                    let _ = shared.events.send(BridgeEvent::DeviceChanged {
                        serial,
                        mask: CHANGE_CLIENT_LIST,
                    });
                }
            }
            Some(_) => {}
        }
    }

    Ok(())
}

impl DeviceBridge for AdbBridge {
    fn subscribe(&self) -> BridgeSubscription {
        BridgeSubscription::new(self.shared.events.subscribe())
    }

    fn devices(&self) -> Vec<Arc<dyn DeviceHandle>> {
        self.shared
            .devices
            .lock()
            .unwrap()
            .values()
            .map(|device| device.clone() as Arc<dyn DeviceHandle>)
            .collect()
    }

    fn device(&self, serial: &str) -> Option<Arc<dyn DeviceHandle>> {
        self.shared
            .devices
            .lock()
            .unwrap()
            .get(serial)
            .map(|device| device.clone() as Arc<dyn DeviceHandle>)
    }
}

impl Drop for AdbBridge {
    fn drop(&mut self) {
        self.poll_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_line() {
        let (serial, state) =
            parse_device_line("emulator-5554  device product:sdk model:sdk_gphone64 device:emu64")
                .unwrap();
        assert_eq!(serial, "emulator-5554");
        assert_eq!(state, DeviceState::Online);

        let (_, state) = parse_device_line("ABC123\toffline").unwrap();
        assert_eq!(state, DeviceState::Offline);

        assert!(parse_device_line("").is_none());
    }

    #[test]
    fn test_parse_client_list_skips_header() {
        let out = "PID NAME\n1234 com.example.app\n77 zygote64\nbad line\n";
        let clients = parse_client_list(out, "arm64-v8a");
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].pid, 1234);
        assert_eq!(clients[0].name.as_deref(), Some("com.example.app"));
        assert_eq!(clients[0].abi, "arm64-v8a");
    }
}
