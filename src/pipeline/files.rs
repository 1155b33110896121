//! On-device file layout for the daemon.
//!
//! Before the daemon is started, the launcher pushes the abi-selected
//! daemon executable, the agent library (on feature levels that support
//! it), and the generated daemon/agent configuration blobs into the
//! configured device directory. Each transfer follows the same sequence:
//! remove the old file, ensure the directory exists, push, and (for
//! executables) chmod, trying the symbolic form first and falling back to
//! an octal chmod once if the device's shell rejects it.

use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::DeviceHandle;
use crate::config::{AgentConfig, DaemonConfig, PipelineConfig};
use crate::error::{Result, TetherError};
use crate::pipeline::extension::PipelineExtension;

/// Pushes daemon files and generated configuration to a device.
pub struct FileManager<'a> {
    config: &'a PipelineConfig,
    extensions: &'a [Arc<dyn PipelineExtension>],
}

impl<'a> FileManager<'a> {
    pub fn new(config: &'a PipelineConfig, extensions: &'a [Arc<dyn PipelineExtension>]) -> Self {
        Self { config, extensions }
    }

    /// Copy everything the daemon needs onto the device.
    pub async fn copy_files_to_device(&self, device: &dyn DeviceHandle) -> Result<()> {
        let abi = device
            .abis()
            .into_iter()
            .next()
            .ok_or_else(|| TetherError::Protocol("device reports no ABIs".to_string()))?;

        let daemon_source = self.host_resource(&abi, &self.config.daemon_name);
        self.push_file(
            device,
            &daemon_source,
            &self.config.device_path(&self.config.daemon_name),
            true,
        )
        .await?;

        if device.feature_level() >= self.config.agent_feature_level {
            let agent_source = self.host_resource(&abi, &self.config.agent_lib_name);
            let remote_name = abi_suffixed(&self.config.agent_lib_name, &abi);
            self.push_file(
                device,
                &agent_source,
                &self.config.device_path(&remote_name),
                false,
            )
            .await?;

            self.push_agent_config(device).await?;
        }

        self.push_daemon_config(device).await?;
        Ok(())
    }

    /// Generate, customize, and push the daemon configuration.
    async fn push_daemon_config(&self, device: &dyn DeviceHandle) -> Result<()> {
        let mut config = DaemonConfig {
            socket_name: self.config.device_socket_name.clone(),
            port: self.config.device_port,
            max_message_size: self.config.max_message_size,
            extra: Default::default(),
        };
        for extension in self.extensions {
            extension.customize_daemon_config(&mut config);
        }
        let bytes = serde_json::to_vec(&config)?;
        self.push_generated(device, &bytes, &self.config.daemon_config_path())
            .await
    }

    /// Generate, customize, and push the agent configuration.
    async fn push_agent_config(&self, device: &dyn DeviceHandle) -> Result<()> {
        let mut config = AgentConfig {
            socket_name: self.config.device_socket_name.clone(),
            max_message_size: self.config.max_message_size,
            extra: Default::default(),
        };
        for extension in self.extensions {
            extension.customize_agent_config(&mut config);
        }
        let bytes = serde_json::to_vec(&config)?;
        self.push_generated(device, &bytes, &self.config.agent_config_path())
            .await
    }

    fn host_resource(&self, abi: &str, name: &str) -> PathBuf {
        self.config.resources_dir.join(abi).join(name)
    }

    async fn push_file(
        &self,
        device: &dyn DeviceHandle,
        source: &PathBuf,
        remote: &str,
        executable: bool,
    ) -> Result<()> {
        self.prepare_remote(device, remote).await?;
        device.push_file(source, remote).await?;
        if executable {
            self.make_executable(device, remote).await?;
        }
        Ok(())
    }

    async fn push_generated(
        &self,
        device: &dyn DeviceHandle,
        bytes: &[u8],
        remote: &str,
    ) -> Result<()> {
        self.prepare_remote(device, remote).await?;
        device.push_bytes(bytes, remote).await
    }

    async fn prepare_remote(&self, device: &dyn DeviceHandle, remote: &str) -> Result<()> {
        device.shell(&format!("rm -f {}", remote)).await?;
        let dir = remote.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("/");
        device.shell(&format!("mkdir -p {}", dir)).await?;
        Ok(())
    }

    /// Mark a pushed file executable.
    ///
    /// Old shells reject the symbolic form with "Bad mode"; the octal form
    /// is tried exactly once as a fallback.
    async fn make_executable(&self, device: &dyn DeviceHandle, remote: &str) -> Result<()> {
        let output = device.shell(&format!("chmod +x {}", remote)).await?;
        if !output.trim().is_empty() {
            device.shell(&format!("chmod 777 {}", remote)).await?;
        }
        Ok(())
    }
}

/// Insert the abi before the file extension: `libtether_agent.so` +
/// `arm64-v8a` → `libtether_agent_arm64-v8a.so`.
fn abi_suffixed(name: &str, abi: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}_{}.{}", stem, abi, ext),
        None => format!("{}_{}", name, abi),
    }
}
