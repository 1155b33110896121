use thiserror::Error;

use crate::rpc::protocol::MethodId;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("device bridge is unavailable")]
    BridgeUnavailable,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("command rejected by device: {0}")]
    CommandRejected(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("daemon exited before becoming ready")]
    DaemonExited,

    #[error("proxy server is not initialized")]
    ProxyNotInitialized,

    #[error("proxy server is already initialized")]
    ProxyAlreadyInitialized,

    #[error("method {0:?} is not implemented by this proxy")]
    Unimplemented(MethodId),

    #[error("transport protocol error: {0}")]
    Protocol(String),

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TetherError {
    /// Whether this error is a transient device-communication failure.
    ///
    /// Transient errors (rejected commands, I/O during unplug, timeouts) are
    /// logged and the launch attempt is abandoned; a fresh device event
    /// retries from scratch. Everything else is treated as fatal for the
    /// attempt that raised it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TetherError::BridgeUnavailable
                | TetherError::DeviceNotFound(_)
                | TetherError::CommandRejected(_)
                | TetherError::Timeout(_)
                | TetherError::DaemonExited
                | TetherError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
