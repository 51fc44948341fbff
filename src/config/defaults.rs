//! Built-in default configuration document.

use super::{ConfigError, Result};
use std::path::PathBuf;

/// The default document, merged under any user override.
pub const DEFAULT_CONFIG_TOML: &str = r#"
[meta]
version = "1.0"

[runtime]
prefer = "auto"
host_gateway = "auto"
network_name = "airpods_network"
gpu_device_flag = "auto"
restart_policy = "unless-stopped"

[runtime.network]
driver = "bridge"
dns_servers = []
ipv6 = false
internal = false

[cli]
stop_timeout = 10
log_lines = 200
ping_timeout = 2.0
startup_timeout = 120
startup_check_interval = 2.0
max_concurrent_pulls = 1
auto_confirm = false
debug = false

[dependencies]
required = ["podman", "podman-compose", "uv"]
optional = ["nvidia-smi"]
skip_checks = false

[services.ollama]
enabled = true
image = "docker.io/ollama/ollama:latest"
pod = "ollama"
container = "ollama-0"
network_aliases = ["ollama"]
ports = [{ host = 11434, container = 11434 }]
needs_webui_secret = false

[services.ollama.volumes.data]
source = "bind://airpods_ollama_data"
target = "/root/.ollama"

[services.ollama.gpu]
enabled = true
force_cpu = false

[services.ollama.health]
path = "/api/tags"
expected_status = [200, 299]

[services.ollama.env]
OLLAMA_ORIGINS = "*"
OLLAMA_HOST = "0.0.0.0"

[services.ollama.resources]

[services.open-webui]
enabled = true
image = "ghcr.io/open-webui/open-webui:latest"
pod = "open-webui"
container = "open-webui-0"
network_aliases = ["webui", "open-webui"]
ports = [{ host = 3000, container = 8080 }]
needs_webui_secret = true

[services.open-webui.volumes.data]
source = "bind://airpods_webui_data"
target = "/app/backend/data"

[services.open-webui.volumes.plugins]
source = "bind://webui_plugins"
target = "/app/backend/data/functions"

[services.open-webui.gpu]
enabled = false
force_cpu = false

[services.open-webui.health]
path = "/"
expected_status = [200, 399]

[services.open-webui.env]
OLLAMA_BASE_URL = "http://ollama:{{services.ollama.ports.0.container}}"
ENABLE_COMMUNITY_SHARING = "True"

[services.open-webui.resources]

[services.comfyui]
enabled = true
image = "docker.io/yanwk/comfyui-boot:cu128-slim"
pod = "comfyui"
container = "comfyui-0"
network_aliases = ["comfyui"]
ports = [{ host = 8188, container = 8188 }]
needs_webui_secret = false

[services.comfyui.volumes.workspace]
source = "bind://comfyui/workspace"
target = "/workspace"

[services.comfyui.volumes.models]
source = "bind://airpods_comfyui_data"
target = "/root/ComfyUI/models"

[services.comfyui.gpu]
enabled = true
force_cpu = false
cuda_image = true

[services.comfyui.health]
path = "/"
expected_status = [200, 299]

[services.comfyui.env]

[services.comfyui.resources]
"#;

/// Parse the built-in default document.
pub fn default_document() -> Result<toml::Table> {
    parse_document(DEFAULT_CONFIG_TOML, PathBuf::from("<defaults>"))
}

/// Parse a TOML document, attributing failures to `origin`.
pub fn parse_document(text: &str, origin: PathBuf) -> Result<toml::Table> {
    text.parse::<toml::Table>().map_err(|e| ConfigError::Parse {
        path: origin,
        message: e.to_string(),
    })
}
