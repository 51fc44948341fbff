//! Layered configuration.
//!
//! The effective configuration is produced by a fixed pipeline:
//!
//! 1. parse the built-in [`defaults`] document
//! 2. deep-[`merge`] the user override (if one is located) over it
//! 3. [`validate`] the merged tree into a typed [`AirpodsConfig`]
//! 4. apply runtime defaults (`"auto"` gateway and GPU flag)
//! 5. resolve `{{path}}` templates and re-validate
//!
//! Every failure is fatal and surfaces as a [`ConfigError`].

pub mod defaults;
pub mod locate;
pub mod merge;
pub mod resolver;
pub mod schema;

use crate::state::StatePaths;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub use locate::{SearchPaths, locate, state_root};
pub use merge::merge;
pub use resolver::resolve_templates;
pub use schema::{
    AirpodsConfig, CliConfig, DependenciesConfig, GpuConfig, HealthConfig, MetaConfig,
    NetworkSettings, PortMapping, ResourceLimits, RestartPolicy, RuntimeConfig,
    RuntimePreference, ServiceConfig, VolumeConfig, validate,
};

/// Gateway hostname substituted for `runtime.host_gateway = "auto"`.
pub const AUTO_HOST_GATEWAY: &str = "host.containers.internal";

/// Device flag substituted for `runtime.gpu_device_flag = "auto"`.
pub const AUTO_GPU_DEVICE_FLAG: &str = "--device nvidia.com/gpu=all";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Document violates the schema
    #[error("Invalid configuration at {path}: {message}")]
    Invalid { path: String, message: String },

    /// One or more `{{...}}` markers could not be resolved
    #[error(
        "Unknown template reference(s) [{}] in {}",
        .references.join(", "),
        .locations.join(", ")
    )]
    UnresolvedReferences {
        references: Vec<String>,
        locations: Vec<String>,
    },

    /// A reference reappeared while resolving the same value
    #[error("Circular template reference {{{{{reference}}}}} in {location}")]
    TemplateCycle { reference: String, location: String },

    /// Explicitly requested config file does not exist
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Malformed TOML
    #[error("Invalid TOML in {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// A fully resolved configuration and where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Arc<AirpodsConfig>,
    /// User override file, if one was found
    pub source: Option<PathBuf>,
    pub state: StatePaths,
}

/// Read and parse a TOML file.
pub fn read_document(path: &Path) -> Result<toml::Table> {
    let text = std::fs::read_to_string(path)?;
    defaults::parse_document(&text, path.to_path_buf())
}

/// Run the pipeline over the defaults and an optional override tree.
pub fn build(overlay: Option<&toml::Table>) -> Result<AirpodsConfig> {
    let defaults = defaults::default_document()?;
    let merged = match overlay {
        Some(overlay) => merge(&defaults, overlay),
        None => defaults,
    };

    let config = validate(&merged)?;
    let config = apply_runtime_defaults(config);
    resolve_templates(&config)
}

/// Build a configuration from override TOML text.
pub fn from_toml_str(text: &str) -> Result<AirpodsConfig> {
    let overlay = defaults::parse_document(text, PathBuf::from("<inline>"))?;
    build(Some(&overlay))
}

/// The built-in configuration with no override.
pub fn builtin() -> Result<AirpodsConfig> {
    build(None)
}

/// Replace `"auto"` runtime settings with concrete values.
pub fn apply_runtime_defaults(mut config: AirpodsConfig) -> AirpodsConfig {
    if config.runtime.host_gateway == "auto" {
        config.runtime.host_gateway = AUTO_HOST_GATEWAY.to_string();
    }
    if config.runtime.gpu_device_flag == "auto" {
        config.runtime.gpu_device_flag = AUTO_GPU_DEVICE_FLAG.to_string();
    }
    config
}

/// Locate, load and resolve the effective configuration.
///
/// # Errors
///
/// Any discovery, parse, validation or template failure.
pub fn load(paths: &SearchPaths) -> Result<LoadedConfig> {
    let source = locate(paths)?;
    let overlay = source.as_deref().map(read_document).transpose()?;
    let config = build(overlay.as_ref())?;

    let mut state = StatePaths::new(state_root(paths, source.as_deref()));
    if let Some(home) = &paths.home {
        state = state.with_home(home);
    }

    match &source {
        Some(path) => info!(
            "Loaded configuration from {} ({} services)",
            path.display(),
            config.services.len()
        ),
        None => info!(
            "Using built-in configuration ({} services)",
            config.services.len()
        ),
    }

    Ok(LoadedConfig {
        config: Arc::new(config),
        source,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_applies_runtime_defaults() {
        let config = builtin().unwrap();
        assert_eq!(config.runtime.host_gateway, AUTO_HOST_GATEWAY);
        assert_eq!(config.runtime.gpu_device_flag, AUTO_GPU_DEVICE_FLAG);
    }

    #[test]
    fn test_explicit_values_are_kept() {
        let config = from_toml_str(
            "[runtime]\nhost_gateway = \"10.0.0.1\"\ngpu_device_flag = \"--gpus all\"\n",
        )
        .unwrap();
        assert_eq!(config.runtime.host_gateway, "10.0.0.1");
        assert_eq!(config.runtime.gpu_device_flag, "--gpus all");
    }

    #[test]
    fn test_override_reaches_templates() {
        let config =
            from_toml_str("[services.ollama]\nports = [{ host = 11500, container = 11600 }]\n")
                .unwrap();
        let webui = config.service("open-webui").unwrap();
        assert_eq!(webui.env["OLLAMA_BASE_URL"], "http://ollama:11600");
    }

    #[test]
    fn test_template_may_reference_runtime() {
        let config = from_toml_str(
            "[services.ollama.env]\nGATEWAY = \"{{runtime.host_gateway}}\"\n",
        )
        .unwrap();
        assert_eq!(
            config.service("ollama").unwrap().env["GATEWAY"],
            AUTO_HOST_GATEWAY
        );
    }

    #[test]
    fn test_error_messages() {
        let err = ConfigError::TemplateCycle {
            reference: "a.b".to_string(),
            location: "services.x.env.Y".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Circular template reference {{a.b}} in services.x.env.Y"
        );

        let err = ConfigError::UnresolvedReferences {
            references: vec!["a".to_string(), "b".to_string()],
            locations: vec!["x".to_string()],
        };
        assert_eq!(err.to_string(), "Unknown template reference(s) [a, b] in x");
    }

    #[test]
    fn test_parse_error_from_inline() {
        assert!(matches!(
            from_toml_str("not = [valid"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
