//! Extension hooks.
//!
//! Third parties customize the pipeline at three points: the proxy-service
//! set (before the proxy server is built), the daemon configuration, and
//! the agent configuration (before either is pushed to the device).
//! Extensions are registered on the [`crate::pipeline::DeviceRegistry`] at
//! construction time.

use tether_types::Device;

use crate::config::{AgentConfig, DaemonConfig};
use crate::pipeline::proxy::TransportProxy;

/// Customization hooks invoked at fixed points of the launch flow.
///
/// All methods default to no-ops; implement only what you need.
pub trait PipelineExtension: Send + Sync {
    /// Called after the device's boot completed, before any files are
    /// pushed.
    fn on_pre_daemon_start(&self, _device: &Device) {}

    /// Customize the daemon configuration before it is pushed. Fields set
    /// by the pipeline itself (socket name, port, message cap) establish
    /// the daemon connection and should not be overridden.
    fn customize_daemon_config(&self, _config: &mut DaemonConfig) {}

    /// Customize the agent configuration before it is pushed.
    fn customize_agent_config(&self, _config: &mut AgentConfig) {}

    /// Customize the proxy (register additional services or command
    /// handlers) before its server is built.
    fn customize_proxy(&self, _proxy: &TransportProxy) {}
}
