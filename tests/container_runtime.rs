//! Integration tests for the Podman adapter against a real engine.
//!
//! Skipped when podman is not available or SKIP_CONTAINER_TESTS=1.

use airpods::config::NetworkSettings;
use airpods::runtime::{ContainerRuntime, NetworkRequest, PodmanRuntime};
use serial_test::serial;
use std::time::Duration;
use test_tag::tag;

/// Check if container tests should run.
fn should_run_container_tests() -> bool {
    if let Ok(value) = std::env::var("SKIP_CONTAINER_TESTS")
        && (value == "1" || value.eq_ignore_ascii_case("true"))
    {
        return false;
    }

    std::process::Command::new("podman")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn unique(prefix: &str) -> String {
    format!("{}_{}", prefix, std::process::id())
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_network_lifecycle() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (podman not available or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let runtime = PodmanRuntime::new();
    let request = NetworkRequest::from_settings(unique("airpods_it_net"), &NetworkSettings::default());
    let _ = runtime.remove_network(&request.name).await;

    assert!(runtime.ensure_network(&request).await.unwrap());
    assert!(!runtime.ensure_network(&request).await.unwrap());
    assert!(runtime.network_exists(&request.name).await.unwrap());

    runtime.remove_network(&request.name).await.unwrap();
    assert!(!runtime.network_exists(&request.name).await.unwrap());
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_volume_lifecycle() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (podman not available or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let runtime = PodmanRuntime::new();
    let name = unique("airpods_it_vol");

    assert!(runtime.ensure_volume(&name).await.unwrap());
    assert!(!runtime.ensure_volume(&name).await.unwrap());
    assert!(runtime.list_volumes().await.unwrap().contains(&name));

    runtime.remove_volume(&name).await.unwrap();
    assert!(!runtime.volume_exists(&name).await.unwrap());
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_missing_pod_queries() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (podman not available or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let runtime = PodmanRuntime::new();
    let name = unique("airpods_it_missing_pod");

    assert!(!runtime.pod_exists(&name).await.unwrap());
    assert!(runtime.pod_inspect(&name).await.unwrap().is_none());
    // stop and remove of a missing pod are not errors
    runtime.stop_pod(&name, Duration::from_secs(1)).await.unwrap();
    runtime.remove_pod(&name).await.unwrap();
    assert!(
        runtime
            .pod_status()
            .await
            .unwrap()
            .iter()
            .all(|row| row.name != name)
    );
}
