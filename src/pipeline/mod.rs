//! The transport pipeline.
//!
//! Leaf to root: [`events`] (the multiplexer queue), [`files`] (on-device
//! file layout), [`channel`] (forwarded channel + proxy assembly),
//! [`proxy`]/[`device_service`] (the host-side RPC proxy),
//! [`stream_server`] (the non-device variant), [`launcher`] (per-attempt
//! daemon launch state machine), and [`registry`] (device lifecycle).

pub mod channel;
pub mod device_service;
pub mod events;
pub mod extension;
pub mod files;
pub mod launcher;
pub mod proxy;
pub mod registry;
pub mod stream_server;

pub use device_service::{CommandHandler, DeviceProxyService};
pub use events::{ByteCache, EventQueue, EventSink};
pub use extension::PipelineExtension;
pub use launcher::LaunchPhase;
pub use proxy::{ProxyService, TransportProxy};
pub use registry::DeviceRegistry;
pub use stream_server::EventStreamServer;
