//! Environment constants and path utilities for airpods.
//!
//! This module centralizes all hardcoded paths, directory names, and environment
//! variable names used throughout the crate, making them easier to maintain and modify.

use std::path::{Path, PathBuf};

/// Application directory name under XDG / `~/.config`
pub const APP_DIR_NAME: &str = "airpods";

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Subdirectory holding configuration files inside a state root
pub const CONFIGS_DIR_NAME: &str = "configs";

/// Subdirectory holding bind-mounted service data inside a state root
pub const VOLUMES_DIR_NAME: &str = "volumes";

/// File persisting the Open WebUI session secret
pub const WEBUI_SECRET_FILE_NAME: &str = "webui_secret";

/// Markers identifying a project root when walking up from the current directory
pub const PROJECT_MARKERS: &[&str] = &[".git"];

/// Environment variable names read by the configuration layer
pub mod vars {
    /// Explicit configuration file path
    pub const CONFIG: &str = "AIRPODS_CONFIG";

    /// Explicit state/home directory
    pub const HOME: &str = "AIRPODS_HOME";

    /// XDG configuration base directory
    pub const XDG_CONFIG_HOME: &str = "XDG_CONFIG_HOME";

    /// User home directory
    pub const USER_HOME: &str = "HOME";
}

/// Build the `configs` directory path from a state root
pub fn configs_dir_path(state_root: &Path) -> PathBuf {
    state_root.join(CONFIGS_DIR_NAME)
}

/// Build the bind-mount volumes directory path from a state root
pub fn volumes_dir_path(state_root: &Path) -> PathBuf {
    state_root.join(VOLUMES_DIR_NAME)
}

/// Build the WebUI secret file path from a state root
pub fn webui_secret_file_path(state_root: &Path) -> PathBuf {
    configs_dir_path(state_root).join(WEBUI_SECRET_FILE_NAME)
}

/// Candidate config files inside a base directory, in priority order
pub fn config_candidates(base: &Path) -> [PathBuf; 2] {
    [
        configs_dir_path(base).join(CONFIG_FILE_NAME),
        base.join(CONFIG_FILE_NAME),
    ]
}

/// Build the per-user application directory from an XDG config base
pub fn xdg_app_dir_path(xdg_config_home: &Path) -> PathBuf {
    xdg_config_home.join(APP_DIR_NAME)
}

/// Build the per-user application directory from a home directory
pub fn user_app_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(".config").join(APP_DIR_NAME)
}

/// Home directory owning a config file.
///
/// A file at `<home>/configs/config.toml` belongs to `<home>`; any other file
/// belongs to its parent directory.
pub fn config_home(config_file: &Path) -> PathBuf {
    let parent = config_file.parent().unwrap_or_else(|| Path::new("."));
    if parent.file_name().is_some_and(|name| name == CONFIGS_DIR_NAME) {
        parent.parent().unwrap_or(parent).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_construction() {
        let root = Path::new("/srv/airpods");

        assert_eq!(configs_dir_path(root), Path::new("/srv/airpods/configs"));
        assert_eq!(volumes_dir_path(root), Path::new("/srv/airpods/volumes"));
        assert_eq!(
            webui_secret_file_path(root),
            Path::new("/srv/airpods/configs/webui_secret")
        );
    }

    #[test]
    fn test_config_candidates_order() {
        let [first, second] = config_candidates(Path::new("/home/user/.config/airpods"));
        assert_eq!(
            first,
            Path::new("/home/user/.config/airpods/configs/config.toml")
        );
        assert_eq!(second, Path::new("/home/user/.config/airpods/config.toml"));
    }

    #[test]
    fn test_config_home() {
        assert_eq!(
            config_home(Path::new("/opt/ap/configs/config.toml")),
            Path::new("/opt/ap")
        );
        assert_eq!(
            config_home(Path::new("/opt/ap/config.toml")),
            Path::new("/opt/ap")
        );
    }

    #[test]
    fn test_user_dirs() {
        assert_eq!(
            user_app_dir_path(Path::new("/home/user")),
            Path::new("/home/user/.config/airpods")
        );
        assert_eq!(
            xdg_app_dir_path(Path::new("/xdg")),
            Path::new("/xdg/airpods")
        );
    }
}
