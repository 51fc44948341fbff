//! # airpods
//!
//! Service lifecycle orchestration for a small fleet of local AI services
//! (an Ollama inference server, the Open WebUI chat front-end and a ComfyUI
//! image-generation server) running on a single host inside Podman or Docker.
//!
//! ## Architecture Overview
//!
//! - **[`config`]**: layered configuration: built-in defaults, user override,
//!   schema validation and `{{path}}` template resolution
//! - **[`services`]**: the service registry, the [`ServiceManager`] orchestration
//!   engine, the startup health wait and the reload handle
//! - **[`runtime`]**: the [`ContainerRuntime`] seam with Podman and Docker adapters
//! - **[`gpu`]**: pure GPU capability → CUDA image selection
//! - **[`system`]**: host dependency checks and GPU detection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use airpods::config::{self, SearchPaths};
//! use airpods::services::{CatalogOptions, ServiceManager, ServiceRegistry};
//! use airpods::system::HostInspector;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let loaded = config::load(&SearchPaths::from_env())?;
//!     let runtime = airpods::runtime::runtime_for(loaded.config.runtime.prefer.as_str())?;
//!     let registry = ServiceRegistry::from_config(
//!         &loaded.config,
//!         &loaded.state,
//!         &CatalogOptions::default(),
//!     )?;
//!
//!     let manager = ServiceManager::new(
//!         Arc::new(registry),
//!         runtime,
//!         Arc::new(HostInspector),
//!         &loaded.config,
//!     );
//!
//!     manager.ensure_network().await?;
//!     let specs = manager.registry().resolve::<&str>(None)?;
//!     manager.ensure_volumes(&specs).await?;
//!     for spec in &specs {
//!         let result = manager.start_service(spec, false, false).await?;
//!         println!("{}: pod created = {}", spec.name, result.pod_created);
//!     }
//!     Ok(())
//! }
//! ```

/// Layered configuration loading, validation and template resolution.
pub mod config;

/// Environment constants and path utilities.
///
/// Centralizes file names, directory names and environment variable names
/// used throughout the crate.
pub mod env;

/// GPU capability → CUDA image selection.
pub mod gpu;

/// Tracing subscriber setup.
pub mod logging;

/// Container engine abstraction and adapters.
pub mod runtime;

/// Service catalog and orchestration engine.
pub mod services;

/// On-disk state layout (bind-mount directories, secret file).
pub mod state;

/// Host dependency checks and GPU detection.
pub mod system;

pub use config::{AirpodsConfig, ConfigError, LoadedConfig, SearchPaths};
pub use runtime::{ContainerRuntime, RuntimeError};
pub use services::{
    CatalogOptions, ManagerHandle, ServiceError, ServiceManager, ServiceRegistry, ServiceSpec,
};
pub use state::StatePaths;
