//! Pipeline configuration.
//!
//! Feature-level thresholds, ports, socket names, and on-device paths are
//! product-specific values that drift as device support evolves, so they all
//! live here rather than as constants scattered through the pipeline. The
//! defaults match current device support; `tetherd --config` overrides them
//! from a TOML file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default cap on a single transport message.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 512 * 1024 * 1024 - 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// On-device directory the daemon and its support files are pushed to.
    pub device_dir: String,
    /// File name of the daemon executable, both on the host (under an
    /// abi subdirectory of `resources_dir`) and on the device.
    pub daemon_name: String,
    /// File name of the agent library; pushed with an abi-suffixed name on
    /// feature levels at or above `agent_feature_level`.
    pub agent_lib_name: String,
    /// TCP port the daemon listens on for devices below
    /// `abstract_socket_feature_level`.
    pub device_port: u16,
    /// Abstract-namespace socket name the daemon listens on for newer
    /// devices.
    pub device_socket_name: String,
    /// Cap on a single message over the daemon channel and proxy sockets.
    pub max_message_size: u32,
    /// How many times to poll the boot-completion property before giving up.
    pub boot_poll_attempts: u32,
    /// Delay between boot-completion polls, in milliseconds.
    pub boot_poll_interval_ms: u64,
    /// Feature level at which the daemon is guaranteed to print its
    /// readiness banner; below it the proxy is created on first output.
    pub readiness_banner_feature_level: u32,
    /// Feature level at which port forwarding targets the abstract-namespace
    /// socket instead of a fixed TCP port.
    pub abstract_socket_feature_level: u32,
    /// Feature level at which the agent library is pushed alongside the
    /// daemon.
    pub agent_feature_level: u32,
    /// Inclusive supported feature-level range. Devices outside it are
    /// still registered, with an `unsupported_reason` on their snapshot.
    pub min_supported_feature_level: u32,
    pub max_supported_feature_level: u32,
    /// Host directory holding per-abi daemon executables and agent
    /// libraries.
    pub resources_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_dir: "/data/local/tmp/tether/".to_string(),
            daemon_name: "tether_daemon".to_string(),
            agent_lib_name: "libtether_agent.so".to_string(),
            device_port: 12389,
            device_socket_name: "TetherTransport".to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            boot_poll_attempts: 60,
            boot_poll_interval_ms: 1000,
            readiness_banner_feature_level: 24,
            abstract_socket_feature_level: 26,
            agent_feature_level: 26,
            min_supported_feature_level: 21,
            max_supported_feature_level: u32::MAX,
            resources_dir: PathBuf::from("resources"),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Reason a device at `feature_level` is unsupported, or an empty string
    /// when it is supported.
    pub fn unsupported_reason(&self, feature_level: u32) -> String {
        if feature_level < self.min_supported_feature_level {
            format!(
                "feature level {} is below the supported minimum {}",
                feature_level, self.min_supported_feature_level
            )
        } else if feature_level > self.max_supported_feature_level {
            format!(
                "feature level {} is above the supported maximum {}",
                feature_level, self.max_supported_feature_level
            )
        } else {
            String::new()
        }
    }

    /// On-device path of a pushed file.
    pub fn device_path(&self, file_name: &str) -> String {
        let dir = self.device_dir.trim_end_matches('/');
        format!("{}/{}", dir, file_name)
    }

    /// On-device path of the generated daemon configuration.
    pub fn daemon_config_path(&self) -> String {
        self.device_path("daemon.cfg")
    }

    /// On-device path of the generated agent configuration.
    pub fn agent_config_path(&self) -> String {
        self.device_path("agent.cfg")
    }
}

/// Configuration blob generated on the host and pushed to the device for the
/// daemon to read at startup. Extensions may add fields via `extra` before
/// the blob is serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Abstract-namespace socket the daemon should listen on, when the
    /// device supports it.
    pub socket_name: String,
    /// TCP port the daemon should listen on otherwise.
    pub port: u16,
    pub max_message_size: u32,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Configuration blob for the on-device agent, pushed alongside the daemon
/// config on supported feature levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub socket_name: String,
    pub max_message_size: u32,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_supported_range() {
        let config = PipelineConfig::default();
        assert_eq!(config.unsupported_reason(21), "");
        assert_eq!(config.unsupported_reason(35), "");
        assert!(config.unsupported_reason(20).contains("below"));
    }

    #[test]
    fn test_max_supported_bound() {
        let config = PipelineConfig {
            max_supported_feature_level: 34,
            ..Default::default()
        };
        assert!(config.unsupported_reason(35).contains("above"));
        assert_eq!(config.unsupported_reason(34), "");
    }

    #[test]
    fn test_device_paths_join_cleanly() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.daemon_config_path(),
            "/data/local/tmp/tether/daemon.cfg"
        );
        assert_eq!(
            config.device_path("tether_daemon"),
            "/data/local/tmp/tether/tether_daemon"
        );
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: PipelineConfig =
            toml::from_str("device_port = 9999\nboot_poll_attempts = 3").unwrap();
        assert_eq!(config.device_port, 9999);
        assert_eq!(config.boot_poll_attempts, 3);
        // Everything else keeps its default.
        assert_eq!(config.device_socket_name, "TetherTransport");
    }
}
