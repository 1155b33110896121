//! Device registry.
//!
//! Tracks one [`DeviceContext`] per device serial and reacts to bridge
//! events: connect spawns a launch attempt, disconnect cancels it and tears
//! the proxy down, losing the bridge tears everything down. All launch and
//! teardown work for one device runs on that device's dedicated worker
//! task, so operations on a context never interleave.
//!
//! The registry is an explicitly constructed object with its own run loop
//! and shutdown; nothing here is process-global.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bridge::{BridgeEvent, CHANGE_STATE, DeviceBridge, DeviceHandle};
use crate::config::PipelineConfig;
use crate::pipeline::extension::PipelineExtension;
use crate::pipeline::launcher::DaemonLauncher;
use crate::pipeline::proxy::TransportProxy;

/// Per-device job queue depth. One running job plus a small backlog; a
/// superseded launch is cancelled before its replacement is queued, so
/// launches never pile up.
const JOB_QUEUE_DEPTH: usize = 8;

enum DeviceJob {
    Launch {
        handle: Arc<dyn DeviceHandle>,
        cancel: watch::Receiver<bool>,
    },
    Teardown,
}

struct ContextState {
    proxy: Option<Arc<TransportProxy>>,
    launch_cancel: Option<watch::Sender<bool>>,
}

/// Execution context for one device serial.
///
/// Created on the first connect signal and kept for the lifetime of the
/// registry; it persists across reconnects of the same device.
pub struct DeviceContext {
    serial: String,
    jobs: mpsc::Sender<DeviceJob>,
    state: Mutex<ContextState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceContext {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The last known proxy, if one is live.
    pub fn proxy(&self) -> Option<Arc<TransportProxy>> {
        self.state.lock().unwrap().proxy.clone()
    }

    fn has_proxy(&self) -> bool {
        self.state.lock().unwrap().proxy.is_some()
    }

    /// Cancel the in-flight launch, if any.
    fn cancel_launch(&self) {
        if let Some(cancel) = self.state.lock().unwrap().launch_cancel.take() {
            let _ = cancel.send(true);
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}

struct RegistryShared {
    bridge: Arc<dyn DeviceBridge>,
    launcher: DaemonLauncher,
    contexts: Mutex<HashMap<String, Arc<DeviceContext>>>,
}

/// Manages the interaction between bridged devices and the transport
/// pipeline: spawns the daemon on device connection, builds the proxy, and
/// tears it down again on disconnection.
pub struct DeviceRegistry {
    shared: Arc<RegistryShared>,
}

impl DeviceRegistry {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        config: PipelineConfig,
        extensions: Vec<Arc<dyn PipelineExtension>>,
        runtime_dir: PathBuf,
    ) -> Self {
        let launcher = DaemonLauncher::new(
            Arc::new(config),
            Arc::new(extensions),
            bridge.clone(),
            runtime_dir,
        );
        Self {
            shared: Arc::new(RegistryShared {
                bridge,
                launcher,
                contexts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Consume bridge events until the bridge goes away for good.
    ///
    /// Devices already known to the bridge are announced first, then the
    /// subscription is drained.
    pub async fn run(&self) {
        let mut subscription = self.shared.bridge.subscribe();
        for handle in self.shared.bridge.devices() {
            self.device_connected(handle);
        }

        while let Some(event) = subscription.recv().await {
            match event {
                BridgeEvent::DeviceConnected { serial } => {
                    if let Some(handle) = self.shared.bridge.device(&serial) {
                        self.device_connected(handle);
                    }
                }
                BridgeEvent::DeviceDisconnected { serial } => {
                    self.device_disconnected(&serial);
                }
                BridgeEvent::DeviceChanged { serial, mask } => {
                    if mask & CHANGE_STATE != 0
                        && let Some(handle) = self.shared.bridge.device(&serial)
                    {
                        self.device_state_changed(handle);
                    }
                }
                BridgeEvent::BridgeRestored => {
                    for handle in self.shared.bridge.devices() {
                        self.device_connected(handle);
                    }
                }
                BridgeEvent::BridgeLost => {
                    // Every spawned daemon went down with the bridge; the
                    // proxies must follow.
                    self.disconnect_all();
                }
            }
        }
    }

    /// Handle a device connection signal. Idempotent on the context map; a
    /// launch is only submitted when the device is online.
    pub fn device_connected(&self, handle: Arc<dyn DeviceHandle>) {
        let context = self.ensure_context(handle.serial());
        if handle.state() == tether_types::DeviceState::Online {
            self.submit_launch(&context, handle);
        }
    }

    /// Handle a state-change signal: online devices get a launch, anything
    /// else gets its proxy torn down.
    pub fn device_state_changed(&self, handle: Arc<dyn DeviceHandle>) {
        if handle.state() == tether_types::DeviceState::Online {
            let context = self.ensure_context(handle.serial());
            self.submit_launch(&context, handle);
        } else {
            self.device_disconnected(handle.serial());
        }
    }

    /// Handle a device departure: cancel the in-flight launch, then queue a
    /// teardown. Submission never blocks the event-delivery task.
    pub fn device_disconnected(&self, serial: &str) {
        let context = self.shared.contexts.lock().unwrap().get(serial).cloned();
        if let Some(context) = context {
            context.cancel_launch();
            if context.jobs.try_send(DeviceJob::Teardown).is_err() {
                tracing::warn!("teardown for {} could not be queued", serial);
            }
        }
    }

    /// Tear down every proxy (bridge lost, or shutdown).
    pub fn disconnect_all(&self) {
        let contexts: Vec<Arc<DeviceContext>> = self
            .shared
            .contexts
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for context in contexts {
            context.cancel_launch();
            if context.jobs.try_send(DeviceJob::Teardown).is_err() {
                tracing::warn!("teardown for {} could not be queued", context.serial());
            }
        }
    }

    /// The context for a serial, if one was ever created.
    pub fn context(&self, serial: &str) -> Option<Arc<DeviceContext>> {
        self.shared.contexts.lock().unwrap().get(serial).cloned()
    }

    /// The live proxy for a serial, if any.
    pub fn proxy_for(&self, serial: &str) -> Option<Arc<TransportProxy>> {
        self.context(serial).and_then(|context| context.proxy())
    }

    /// Tear everything down and wait (bounded) for the workers to finish.
    pub async fn shutdown(&self) {
        self.disconnect_all();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let all_idle = self
                .shared
                .contexts
                .lock()
                .unwrap()
                .values()
                .all(|context| !context.has_proxy());
            if all_idle || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn ensure_context(&self, serial: &str) -> Arc<DeviceContext> {
        let mut contexts = self.shared.contexts.lock().unwrap();
        if let Some(context) = contexts.get(serial) {
            return context.clone();
        }

        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_DEPTH);
        let context = Arc::new(DeviceContext {
            serial: serial.to_string(),
            jobs: jobs_tx,
            state: Mutex::new(ContextState {
                proxy: None,
                launch_cancel: None,
            }),
            worker: Mutex::new(None),
        });

        let worker = tokio::spawn(run_context_worker(
            self.shared.clone(),
            Arc::downgrade(&context),
            jobs_rx,
        ));
        *context.worker.lock().unwrap() = Some(worker);

        contexts.insert(serial.to_string(), context.clone());
        context
    }

    /// Queue a launch, superseding any launch still pending for the device.
    fn submit_launch(&self, context: &Arc<DeviceContext>, handle: Arc<dyn DeviceHandle>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut state = context.state.lock().unwrap();
            if let Some(previous) = state.launch_cancel.take() {
                let _ = previous.send(true);
            }
            state.launch_cancel = Some(cancel_tx);
        }

        let job = DeviceJob::Launch {
            handle,
            cancel: cancel_rx,
        };
        if context.jobs.try_send(job).is_err() {
            tracing::warn!("launch for {} could not be queued", context.serial());
        }
    }
}

/// Serialized job loop for one device. Launch failures are contained here:
/// transient bridge errors are logged and abandoned, unexpected ones are
/// logged as errors, and neither affects other devices.
///
/// The worker holds its context weakly; the job channel closes when the
/// registry drops the context, ending the loop.
async fn run_context_worker(
    shared: Arc<RegistryShared>,
    context: std::sync::Weak<DeviceContext>,
    mut jobs: mpsc::Receiver<DeviceJob>,
) {
    while let Some(job) = jobs.recv().await {
        let Some(context) = context.upgrade() else {
            break;
        };
        match job {
            DeviceJob::Launch { handle, cancel } => {
                if *cancel.borrow() {
                    continue;
                }
                let guard_context = context.clone();
                let result = shared
                    .launcher
                    .launch(handle, cancel, move || guard_context.has_proxy())
                    .await;
                match result {
                    Ok(Some(proxy)) => {
                        let mut state = context.state.lock().unwrap();
                        state.proxy = Some(proxy);
                        state.launch_cancel = None;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_transient() => {
                        tracing::warn!(
                            "abandoning daemon launch for {}: {}",
                            context.serial(),
                            e
                        );
                    }
                    Err(e) => {
                        tracing::error!("daemon launch for {} failed: {}", context.serial(), e);
                    }
                }
            }
            DeviceJob::Teardown => {
                let proxy = context.state.lock().unwrap().proxy.take();
                if let Some(proxy) = proxy {
                    proxy.disconnect().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::{FakeBridge, FakeDaemon, FakeDevice};
    use tempfile::TempDir;
    use tether_types::DeviceState;
    use tokio::time::timeout;

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        bridge: Arc<FakeBridge>,
        daemon: FakeDaemon,
        _dir: TempDir,
        run_task: JoinHandle<()>,
    }

    async fn fixture() -> Fixture {
        let daemon = FakeDaemon::start().await.unwrap();
        let bridge = FakeBridge::new();
        let dir = TempDir::new().unwrap();

        let config = PipelineConfig {
            boot_poll_interval_ms: 10,
            ..Default::default()
        };
        let registry = Arc::new(DeviceRegistry::new(
            bridge.clone(),
            config,
            Vec::new(),
            dir.path().to_path_buf(),
        ));

        let run_registry = registry.clone();
        let run_task = tokio::spawn(async move { run_registry.run().await });

        Fixture {
            registry,
            bridge,
            daemon,
            _dir: dir,
            run_task,
        }
    }

    fn online_device(fx: &Fixture, serial: &str) -> Arc<FakeDevice> {
        let device = Arc::new(FakeDevice::new(serial, 30));
        device.set_daemon_addr(fx.daemon.addr());
        device
    }

    async fn wait_for_proxy(registry: &DeviceRegistry, serial: &str) -> Arc<TransportProxy> {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(proxy) = registry.proxy_for(serial) {
                    return proxy;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("proxy never appeared")
    }

    async fn wait_for_no_proxy(registry: &DeviceRegistry, serial: &str) {
        timeout(Duration::from_secs(5), async {
            while registry.proxy_for(serial).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("proxy never torn down")
    }

    #[tokio::test]
    async fn test_connect_online_creates_proxy() {
        let fx = fixture().await;
        let device = online_device(&fx, "dev-1");
        fx.bridge.connect_device(device);

        let proxy = wait_for_proxy(&fx.registry, "dev-1").await;
        assert_eq!(proxy.device().serial, "dev-1");

        fx.run_task.abort();
        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_connect_defers_launch_until_online() {
        let fx = fixture().await;
        let device = online_device(&fx, "dev-2");
        device.set_state(DeviceState::Offline);
        fx.bridge.connect_device(device);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Context exists, but no launch ran while offline.
        assert!(fx.registry.context("dev-2").is_some());
        assert!(fx.registry.proxy_for("dev-2").is_none());

        fx.bridge.set_device_state("dev-2", DeviceState::Online);
        wait_for_proxy(&fx.registry, "dev-2").await;

        fx.run_task.abort();
        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_and_clears_reference() {
        let fx = fixture().await;
        let device = online_device(&fx, "dev-3");
        fx.bridge.connect_device(device.clone());
        let proxy = wait_for_proxy(&fx.registry, "dev-3").await;
        let socket = proxy.socket_path().unwrap();

        fx.bridge.disconnect_device("dev-3");
        wait_for_no_proxy(&fx.registry, "dev-3").await;

        // Context survives for the next reconnect; proxy reference is gone.
        let context = fx.registry.context("dev-3").unwrap();
        assert!(context.proxy().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!socket.exists(), "proxy socket removed on teardown");
        assert!(device.forward_targets().is_empty(), "forward removed");

        fx.run_task.abort();
        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_builds_fresh_proxy_from_clean_state() {
        let fx = fixture().await;
        let device = online_device(&fx, "dev-4");
        fx.bridge.connect_device(device.clone());
        let first = wait_for_proxy(&fx.registry, "dev-4").await;

        fx.bridge.disconnect_device("dev-4");
        wait_for_no_proxy(&fx.registry, "dev-4").await;
        let context_before = fx.registry.context("dev-4").unwrap();

        device.set_state(DeviceState::Online);
        fx.bridge.connect_device(device);
        let second = wait_for_proxy(&fx.registry, "dev-4").await;

        assert!(!Arc::ptr_eq(&first, &second), "fresh proxy after teardown");
        // Same context across reconnects.
        let context_after = fx.registry.context("dev-4").unwrap();
        assert!(Arc::ptr_eq(&context_before, &context_after));

        fx.run_task.abort();
        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_at_most_one_proxy_per_device() {
        let fx = fixture().await;
        let device = online_device(&fx, "dev-5");
        fx.bridge.connect_device(device.clone());
        let first = wait_for_proxy(&fx.registry, "dev-5").await;

        // A duplicate connect signal while the proxy is live must not
        // replace it.
        fx.bridge.connect_device(device);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let still = fx.registry.proxy_for("dev-5").unwrap();
        assert!(Arc::ptr_eq(&first, &still));

        fx.run_task.abort();
        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_bridge_lost_tears_down_every_proxy() {
        let fx = fixture().await;
        for serial in ["dev-6a", "dev-6b"] {
            fx.bridge.connect_device(online_device(&fx, serial));
        }
        wait_for_proxy(&fx.registry, "dev-6a").await;
        wait_for_proxy(&fx.registry, "dev-6b").await;

        fx.bridge.lose_bridge();
        wait_for_no_proxy(&fx.registry, "dev-6a").await;
        wait_for_no_proxy(&fx.registry, "dev-6b").await;

        fx.run_task.abort();
        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_cancels_inflight_launch() {
        let fx = fixture().await;
        let device = online_device(&fx, "dev-7");
        // A long boot keeps the launch in its polling phase.
        device.set_boot_polls_until_ready(1000);
        fx.bridge.connect_device(device);

        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.bridge.disconnect_device("dev-7");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The cancelled launch never produced a proxy, and the worker is
        // free again for the next event.
        assert!(fx.registry.proxy_for("dev-7").is_none());

        fx.run_task.abort();
        fx.registry.shutdown().await;
    }
}
