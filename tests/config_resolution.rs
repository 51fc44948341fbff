//! Integration tests for configuration discovery and the load pipeline.

use airpods::config::{self, ConfigError, SearchPaths};
use airpods::services::{CatalogOptions, ServiceRegistry};
use serial_test::serial;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(path: &Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

#[test]
fn test_load_without_override_uses_builtin() {
    let user = TempDir::new().unwrap();
    let paths = SearchPaths {
        home: Some(user.path().to_path_buf()),
        ..Default::default()
    };

    let loaded = config::load(&paths).unwrap();
    assert!(loaded.source.is_none());
    assert_eq!(
        loaded.state.root(),
        user.path().join(".config").join("airpods")
    );
    assert_eq!(loaded.config.services.len(), 3);
}

#[test]
fn test_override_is_merged_over_defaults() {
    let home = TempDir::new().unwrap();
    write(
        &home.path().join("configs").join("config.toml"),
        r#"
[cli]
max_concurrent_pulls = 4

[services.ollama]
ports = [{ host = 11500, container = 11600 }]

[services.ollama.env]
EXTRA = "{{services.ollama.image}}"
"#,
    );

    let loaded = config::load(&SearchPaths {
        home_override: Some(home.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();

    assert_eq!(loaded.state.root(), home.path());
    assert_eq!(loaded.config.cli.max_concurrent_pulls, 4);
    // untouched defaults survive the merge
    assert_eq!(loaded.config.cli.stop_timeout, 10);

    let ollama = loaded.config.service("ollama").unwrap();
    assert_eq!(ollama.env["EXTRA"], "docker.io/ollama/ollama:latest");
    assert_eq!(ollama.env["OLLAMA_HOST"], "0.0.0.0");
    let webui = loaded.config.service("open-webui").unwrap();
    assert_eq!(webui.env["OLLAMA_BASE_URL"], "http://ollama:11600");
}

#[test]
fn test_bind_sources_resolve_under_state_root() {
    let home = TempDir::new().unwrap();
    write(&home.path().join("config.toml"), "[meta]\nversion = \"1.0\"\n");

    let loaded = config::load(&SearchPaths {
        home_override: Some(home.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();
    let options = CatalogOptions {
        secret_factory: Some(std::sync::Arc::new(|| Ok("x".to_string()))),
        ..Default::default()
    };
    let registry = ServiceRegistry::from_config(&loaded.config, &loaded.state, &options).unwrap();

    let comfyui = registry.get("comfyui").unwrap();
    assert_eq!(
        comfyui.volumes[0].source,
        home.path()
            .join("volumes")
            .join("comfyui/workspace")
            .display()
            .to_string()
    );
}

#[test]
fn test_invalid_override_names_field() {
    let home = TempDir::new().unwrap();
    write(
        &home.path().join("config.toml"),
        "[services.ollama]\nports = [{ host = 0, container = 11434 }]\n",
    );

    let err = config::load(&SearchPaths {
        home_override: Some(home.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap_err();
    match err {
        ConfigError::Invalid { path, .. } => assert_eq!(path, "services.ollama.ports[0].host"),
        other => panic!("expected Invalid, got {other}"),
    }
}

fn invalid_field(text: &str) -> (String, String) {
    match config::from_toml_str(text) {
        Err(ConfigError::Invalid { path, message }) => (path, message),
        Err(other) => panic!("expected Invalid, got {other}"),
        Ok(_) => panic!("expected {text:?} to be rejected"),
    }
}

#[test]
fn test_mistyped_cli_value_names_field() {
    let (path, message) = invalid_field("[cli]\nstop_timeout = \"ten\"\n");
    assert_eq!(path, "cli.stop_timeout");
    assert!(message.contains("invalid type"), "{message}");
}

#[test]
fn test_out_of_range_port_names_field() {
    let (path, _) = invalid_field(
        "[services.ollama]\nports = [{ host = 11434, container = 11434 }, { host = 70000, container = 1 }]\n",
    );
    assert_eq!(path, "services.ollama.ports[1].host");

    let (path, _) = invalid_field("[services.ollama]\nports = { host = 1, container = 70000 }\n");
    assert_eq!(path, "services.ollama.ports.container");
}

#[test]
fn test_unknown_restart_policy_names_field() {
    let (path, message) = invalid_field("[runtime]\nrestart_policy = \"sometimes\"\n");
    assert_eq!(path, "runtime.restart_policy");
    assert!(message.contains("sometimes"), "{message}");
}

#[test]
fn test_mistyped_gpu_flag_names_field() {
    let (path, _) = invalid_field("[services.ollama.gpu]\nenabled = \"yes\"\n");
    assert_eq!(path, "services.ollama.gpu.enabled");
}

#[test]
fn test_nested_network_and_env_fields_named() {
    let (path, _) = invalid_field("[runtime.network]\nipv6 = 1\n");
    assert_eq!(path, "runtime.network.ipv6");

    let (path, _) = invalid_field("[services.open-webui.env]\nPORT = 8080\n");
    assert_eq!(path, "services.open-webui.env.PORT");
}

#[test]
fn test_escaping_bind_source_rejected() {
    let (path, message) = invalid_field(
        "[services.comfyui.volumes.workspace]\nsource = \"bind://../../etc\"\ntarget = \"/workspace\"\n",
    );
    assert_eq!(path, "services.comfyui.volumes.workspace.source");
    assert!(message.contains("volumes directory"), "{message}");
}

#[test]
fn test_template_cycle_is_fatal() {
    let err = config::from_toml_str(
        "[services.ollama.env]\nA = \"{{services.open-webui.image}}\"\n[services.open-webui]\nimage = \"{{services.open-webui.image}}/x\"\n",
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::TemplateCycle { .. }), "{err}");
}

#[test]
fn test_malformed_toml_reports_file() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("config.toml");
    write(&file, "[cli\nstop_timeout = 1\n");

    let err = config::load(&SearchPaths {
        home_override: Some(home.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap_err();
    match err {
        ConfigError::Parse { path, .. } => assert_eq!(path, file),
        other => panic!("expected Parse, got {other}"),
    }
}

#[test]
#[serial]
fn test_search_paths_from_env() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("custom.toml");
    write(&file, "[cli]\nlog_lines = 50\n");

    // SAFETY: serialized with every other env-mutating test
    unsafe {
        std::env::set_var("AIRPODS_CONFIG", &file);
        std::env::remove_var("AIRPODS_HOME");
    }
    let paths = SearchPaths::from_env();
    unsafe {
        std::env::remove_var("AIRPODS_CONFIG");
    }

    assert_eq!(paths.config_override.as_deref(), Some(file.as_path()));
    let loaded = config::load(&paths).unwrap();
    assert_eq!(loaded.source.as_deref(), Some(file.as_path()));
    assert_eq!(loaded.config.cli.log_lines, 50);
    assert_eq!(loaded.state.root(), home.path());
}

#[test]
#[serial]
fn test_empty_env_vars_fall_through_search_order() {
    unsafe {
        std::env::set_var("AIRPODS_CONFIG", "");
        std::env::set_var("AIRPODS_HOME", "");
    }
    let paths = SearchPaths::from_env();
    unsafe {
        std::env::remove_var("AIRPODS_CONFIG");
        std::env::remove_var("AIRPODS_HOME");
    }

    assert!(paths.config_override.is_none());
    assert!(paths.home_override.is_none());
}
