//! Daemon launcher.
//!
//! One launch attempt per device event, driven through an explicit state
//! machine: `WaitBoot → PushFiles → StartDaemon → WaitReady → CreateProxy →
//! Done | Failed`. A failed attempt is not retried here; the next
//! connect/state-change event for the device starts a fresh attempt.
//!
//! Cancellation is a watch channel observed at every suspension point, so
//! an in-flight launch stops promptly when its device disconnects.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::bridge::{DeviceBridge, DeviceHandle, device_snapshot};
use crate::config::PipelineConfig;
use crate::error::{Result, TetherError};
use crate::pipeline::channel::create_transport_proxy;
use crate::pipeline::extension::PipelineExtension;
use crate::pipeline::files::FileManager;
use crate::pipeline::proxy::TransportProxy;

/// Device property polled for boot completion.
pub const BOOT_COMPLETE_PROPERTY: &str = "dev.bootcomplete";
/// Value the boot property reports once the device finished booting.
pub const BOOT_COMPLETE_VALUE: &str = "1";
/// Daemon stdout prefix signalling its server is accepting connections.
pub const READY_MARKER: &str = "Server listening on";

/// Phase of one launch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPhase {
    WaitBoot,
    PushFiles,
    StartDaemon,
    WaitReady,
    CreateProxy,
    Done,
    Failed,
}

impl std::fmt::Display for LaunchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LaunchPhase::WaitBoot => "wait-boot",
            LaunchPhase::PushFiles => "push-files",
            LaunchPhase::StartDaemon => "start-daemon",
            LaunchPhase::WaitReady => "wait-ready",
            LaunchPhase::CreateProxy => "create-proxy",
            LaunchPhase::Done => "done",
            LaunchPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Runs launch attempts for the registry's device workers.
pub struct DaemonLauncher {
    config: Arc<PipelineConfig>,
    extensions: Arc<Vec<Arc<dyn PipelineExtension>>>,
    bridge: Arc<dyn DeviceBridge>,
    runtime_dir: PathBuf,
}

impl DaemonLauncher {
    pub fn new(
        config: Arc<PipelineConfig>,
        extensions: Arc<Vec<Arc<dyn PipelineExtension>>>,
        bridge: Arc<dyn DeviceBridge>,
        runtime_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            extensions,
            bridge,
            runtime_dir,
        }
    }

    /// Run one launch attempt.
    ///
    /// Returns the new proxy, or `None` when the attempt was cancelled or a
    /// proxy already exists for the device (duplicate daemon-ready
    /// signals). Transient device errors surface as `Err` for the caller
    /// to log; they never cross device boundaries.
    pub async fn launch(
        &self,
        handle: Arc<dyn DeviceHandle>,
        mut cancel: watch::Receiver<bool>,
        has_proxy: impl Fn() -> bool,
    ) -> Result<Option<Arc<TransportProxy>>> {
        let serial = handle.serial().to_string();

        tracing::debug!("launch attempt for {}: {}", serial, LaunchPhase::WaitBoot);
        if !self.wait_boot(handle.as_ref(), &mut cancel).await? {
            return Ok(None);
        }

        let device = device_snapshot(handle.as_ref(), &self.config).await;
        for extension in self.extensions.iter() {
            extension.on_pre_daemon_start(&device);
        }

        if cancelled(&cancel) {
            return Ok(None);
        }
        tracing::debug!("launch attempt for {}: {}", serial, LaunchPhase::PushFiles);
        let files = FileManager::new(&self.config, &self.extensions);
        files.copy_files_to_device(handle.as_ref()).await?;

        if cancelled(&cancel) {
            return Ok(None);
        }
        tracing::debug!("launch attempt for {}: {}", serial, LaunchPhase::StartDaemon);
        let command = format!(
            "{} -config_file={}",
            self.config.device_path(&self.config.daemon_name),
            self.config.daemon_config_path()
        );
        tracing::info!("starting daemon on {}: {}", serial, command);
        let mut lines = handle.shell_lines(&command).await?;

        tracing::debug!("launch attempt for {}: {}", serial, LaunchPhase::WaitReady);
        // Devices at or above the banner threshold are guaranteed to print
        // the readiness marker; on older devices the daemon is assumed up
        // as soon as it produces any output.
        let banner_required =
            handle.feature_level() >= self.config.readiness_banner_feature_level;
        loop {
            tokio::select! {
                maybe_line = lines.recv() => match maybe_line {
                    Some(line) => {
                        tracing::debug!("[daemon {}] {}", serial, line);
                        if !banner_required || line.starts_with(READY_MARKER) {
                            break;
                        }
                    }
                    None => return Err(TetherError::DaemonExited),
                },
                _ = cancel.changed() => {
                    if cancelled(&cancel) {
                        return Ok(None);
                    }
                }
            }
        }

        // Duplicate daemon-ready callbacks must not build a second proxy.
        if has_proxy() {
            tracing::info!("proxy already exists for {}; skipping creation", serial);
            drain_daemon_output(serial.clone(), lines);
            return Ok(None);
        }

        if cancelled(&cancel) {
            return Ok(None);
        }
        tracing::debug!("launch attempt for {}: {}", serial, LaunchPhase::CreateProxy);
        let proxy = create_transport_proxy(
            handle.clone(),
            self.bridge.clone(),
            device,
            &self.config,
            &self.extensions,
            &self.runtime_dir,
        )
        .await?;

        drain_daemon_output(serial.clone(), lines);
        tracing::info!(
            "launch attempt for {}: {} (proxy on {:?})",
            serial,
            LaunchPhase::Done,
            proxy.socket_path()
        );
        Ok(Some(proxy))
    }

    /// Poll the boot-completion property until the device is ready.
    ///
    /// Returns `false` when cancelled, `Err(Timeout)` when the device never
    /// reports completion within the configured number of attempts.
    async fn wait_boot(
        &self,
        handle: &dyn DeviceHandle,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let interval = Duration::from_millis(self.config.boot_poll_interval_ms);
        for _ in 0..self.config.boot_poll_attempts {
            if cancelled(cancel) {
                return Ok(false);
            }
            if let Some(value) = handle.get_property(BOOT_COMPLETE_PROPERTY).await?
                && value == BOOT_COMPLETE_VALUE
            {
                return Ok(true);
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.changed() => {
                    if cancelled(cancel) {
                        return Ok(false);
                    }
                }
            }
        }
        Err(TetherError::Timeout(format!(
            "device {} did not finish booting",
            handle.serial()
        )))
    }
}

fn cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Keep logging the daemon's stdout after the launch completed. The task
/// ends when the daemon's shell stream does.
fn drain_daemon_output(serial: String, mut lines: tokio::sync::mpsc::Receiver<String>) {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            tracing::debug!("[daemon {}] {}", serial, line);
        }
        tracing::debug!("daemon output for {} ended", serial);
    });
}
