//! Forge Lifecycle - local emulation of a platform's staging and running phases
//!
//! The [`Stager`] turns application source into a droplet by running the
//! platform builder inside a container, and the [`Runner`] executes a
//! droplet (or commits it to an image) under platform-compatible
//! environment metadata. Both drive the container engine only through the
//! [`forge_engine`] contracts.
use forge_engine::Container;
use tracing::warn;

pub mod app_config;
pub mod config;
pub mod env;
pub mod error;
pub mod loader;
pub mod runner;
pub mod script;
pub mod stager;
pub mod units;
pub mod versioner;

pub use app_config::{
    plain, AppConfig, Buildpack, Buildpacks, Colorizer, NetworkConfig, Service, Services,
};
pub use config::ForgeConfig;
pub use error::{ForgeError, VersionError};
pub use loader::{Loader, NoopLoader, TracingLoader};
pub use runner::{ExportConfig, RunConfig, Runner};
pub use stager::{CacheStore, StageConfig, Stager};
pub use units::to_megabytes;
pub use versioner::{StaticVersioner, Versioner};

/// Remove a container whose work is done or abandoned
pub(crate) async fn close_container(contr: Box<dyn Container>) {
    if let Err(e) = contr.close().await {
        warn!("Failed to remove container {}: {}", contr.id(), e);
    }
}
