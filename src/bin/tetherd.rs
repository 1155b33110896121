//! tetherd: the host-side transport pipeline daemon.
//!
//! Long-running process that watches adb for devices, spawns the on-device
//! daemon on each connected device, and serves one proxy socket per device
//! under the runtime directory.
//!
//! ## Files
//!
//! - `~/.tether/run/<serial>.sock` - per-device proxy sockets
//! - `~/.tether/tetherd.pid` - PID file
//! - `~/.tether/log/` - daily-rotated daemon logs

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tracing_appender::non_blocking::WorkerGuard;

use tether::bridge::adb::AdbBridge;
use tether::config::PipelineConfig;
use tether::pipeline::DeviceRegistry;

#[derive(Parser, Debug)]
#[command(name = "tetherd", version, about = "Device transport pipeline daemon")]
struct Args {
    /// Home directory for sockets, logs, and the PID file.
    #[arg(long, env = "TETHER_HOME")]
    home: Option<PathBuf>,

    /// Pipeline configuration file (TOML). Defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the adb executable.
    #[arg(long, default_value = "adb")]
    adb: PathBuf,

    /// Device poll interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Log to stderr instead of the rolling log file.
    #[arg(long)]
    foreground: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let home = match &args.home {
        Some(home) => home.clone(),
        None => dirs::home_dir()
            .context("could not determine home directory")?
            .join(".tether"),
    };
    let runtime_dir = home.join("run");
    std::fs::create_dir_all(&runtime_dir)
        .with_context(|| format!("creating runtime dir {:?}", runtime_dir))?;

    let _guard = init_logging(&home, args.foreground)?;
    tracing::info!("tetherd starting, version {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading pipeline config {:?}", path))?,
        None => PipelineConfig::default(),
    };

    let pid_path = home.join("tetherd.pid");
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let bridge = AdbBridge::start(
        args.adb.clone(),
        Duration::from_millis(args.poll_interval_ms),
    );
    let registry = DeviceRegistry::new(bridge, config, Vec::new(), runtime_dir);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    select! {
        _ = registry.run() => {
            tracing::warn!("bridge event stream ended");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down...");
        }
    }

    tracing::info!("disconnecting proxies...");
    registry.shutdown().await;

    let _ = std::fs::remove_file(&pid_path);
    tracing::info!("tetherd shutdown complete");
    Ok(())
}

/// Initialize logging: daily-rotated files under `<home>/log`, or stderr in
/// foreground mode. The returned guard must be kept alive so buffered log
/// lines are flushed on exit.
fn init_logging(home: &std::path::Path, foreground: bool) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if foreground {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    }

    let log_dir = home.join("log");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tetherd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .init();

    Ok(Some(guard))
}
