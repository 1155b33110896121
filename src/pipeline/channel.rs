//! Channel establisher.
//!
//! Allocates a free local port, creates the forward rule to the device's
//! daemon socket, opens the size-capped channel over it, and assembles the
//! proxy on top. Devices at or above the abstract-socket feature level are
//! forwarded to the daemon's abstract-namespace socket; older devices to
//! its fixed TCP port. A failure after partial setup disconnects whatever
//! was built so neither the forwarded port nor the channel leaks.

use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;

use tether_types::Device;

use crate::bridge::{DeviceBridge, DeviceHandle, ForwardTarget};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::pipeline::device_service::DeviceProxyService;
use crate::pipeline::extension::PipelineExtension;
use crate::pipeline::proxy::{ForwardGuard, TransportProxy};
use crate::rpc::client::TransportClient;

/// Allocate a free local TCP port.
async fn pick_free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Build, initialize, and connect the proxy for one device.
///
/// On any failure after the forward rule exists, the partially-built proxy
/// is disconnected (closing the channel and removing the forward) before
/// the error propagates.
pub(crate) async fn create_transport_proxy(
    handle: Arc<dyn DeviceHandle>,
    bridge: Arc<dyn DeviceBridge>,
    device: Device,
    config: &PipelineConfig,
    extensions: &[Arc<dyn PipelineExtension>],
    runtime_dir: &Path,
) -> Result<Arc<TransportProxy>> {
    let local_port = pick_free_port().await?;

    let target = if handle.feature_level() >= config.abstract_socket_feature_level {
        ForwardTarget::AbstractSocket(config.device_socket_name.clone())
    } else {
        ForwardTarget::Tcp(config.device_port)
    };
    handle.create_forward(local_port, target).await?;
    tracing::info!(
        "port forwarding created for {}: local port {}",
        device.serial,
        local_port
    );

    let forward = ForwardGuard::new(handle.clone(), local_port);
    let client = match TransportClient::connect(local_port, config.max_message_size).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            forward.remove().await;
            return Err(e);
        }
    };

    let proxy = Arc::new(TransportProxy::new(
        device.clone(),
        client.clone(),
        forward,
        runtime_dir.to_path_buf(),
        config.max_message_size,
    ));
    let device_service = Arc::new(DeviceProxyService::new(device, client, handle, bridge));

    let assembled: Result<()> = async {
        proxy.attach_device_service(device_service)?;
        for extension in extensions {
            extension.customize_proxy(&proxy);
        }
        proxy.initialize_server(proxy.device().serial.as_str())?;
        proxy.connect().await?;
        Ok(())
    }
    .await;

    if let Err(e) = assembled {
        proxy.disconnect().await;
        return Err(e);
    }

    Ok(proxy)
}
