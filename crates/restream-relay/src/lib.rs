//! Live relay orchestration.
//!
//! This crate supervises the tasks that move a live source to its streaming
//! destinations:
//! - Source proxy tasks ingesting and re-serving source streams
//! - Relay tasks binding videos to destination accounts and running egress
//! - The overlay renderer feeding composited frames into egress stdin
//! - A manager tying relay lifecycles to proxy lifecycle events

pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod platform;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod renderer;
pub mod resources;

pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use logging::TaskLogger;
pub use manager::RelayManager;
pub use platform::{
    DestinationService, DirectResolver, InMemorySettings, RtmpDestination, SettingsStore,
    SourceResolver,
};
pub use proxy::SourceProxyTask;
pub use registry::{ProxyEvent, ProxyEventListener, TaskRegistry};
pub use relay::{select_account, RelayContext, RelayTask};
pub use renderer::OverlayRenderer;
pub use resources::{Account, Video};
