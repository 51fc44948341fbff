//! Configuration file discovery.
//!
//! The discovery hierarchy, first hit wins:
//! 1. `AIRPODS_CONFIG`: explicit file (must exist)
//! 2. `AIRPODS_HOME`: `<home>/configs/config.toml`, then `<home>/config.toml`
//! 3. Project root (nearest ancestor with `.git`): same two candidates
//! 4. `$XDG_CONFIG_HOME/airpods`: same two candidates
//! 5. `~/.config/airpods`: same two candidates
//!
//! When `AIRPODS_HOME` is set the search ends there, found or not.

use super::{ConfigError, Result};
use crate::env;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment inputs to discovery, captured once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPaths {
    pub config_override: Option<PathBuf>,
    pub home_override: Option<PathBuf>,
    pub current_dir: Option<PathBuf>,
    pub xdg_config_home: Option<PathBuf>,
    pub home: Option<PathBuf>,
}

impl SearchPaths {
    /// Capture discovery inputs from the process environment.
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var_os(name)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        };

        Self {
            config_override: var(env::vars::CONFIG),
            home_override: var(env::vars::HOME),
            current_dir: std::env::current_dir().ok(),
            xdg_config_home: var(env::vars::XDG_CONFIG_HOME),
            home: var(env::vars::USER_HOME),
        }
    }

    /// Expand a leading `~/` using the captured home directory.
    pub fn expand(&self, path: &Path) -> PathBuf {
        match (path.strip_prefix("~"), self.home.as_ref()) {
            (Ok(rest), Some(home)) => home.join(rest),
            _ => path.to_path_buf(),
        }
    }

    /// Nearest ancestor of the current directory carrying a project marker.
    pub fn project_root(&self) -> Option<PathBuf> {
        let start = self.current_dir.as_ref()?;
        start
            .ancestors()
            .find(|dir| {
                env::PROJECT_MARKERS
                    .iter()
                    .any(|marker| dir.join(marker).exists())
            })
            .map(Path::to_path_buf)
    }

    /// Candidate base directories after the explicit overrides, in order.
    fn fallback_bases(&self) -> Vec<PathBuf> {
        let mut bases = Vec::new();
        if let Some(root) = self.project_root() {
            bases.push(root);
        }
        if let Some(xdg) = &self.xdg_config_home {
            bases.push(env::xdg_app_dir_path(&self.expand(xdg)));
        }
        if let Some(home) = &self.home {
            bases.push(env::user_app_dir_path(home));
        }
        bases
    }
}

fn first_existing(base: &Path) -> Option<PathBuf> {
    env::config_candidates(base)
        .into_iter()
        .find(|candidate| candidate.is_file())
}

/// Locate the user configuration file.
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`] when `AIRPODS_CONFIG` names a missing file.
pub fn locate(paths: &SearchPaths) -> Result<Option<PathBuf>> {
    if let Some(explicit) = &paths.config_override {
        let path = paths.expand(explicit);
        if !path.is_file() {
            return Err(ConfigError::NotFound(path));
        }
        debug!("Using config from {}: {}", env::vars::CONFIG, path.display());
        return Ok(Some(path));
    }

    if let Some(home) = &paths.home_override {
        let found = first_existing(&paths.expand(home));
        debug!("Config lookup under {}: {:?}", env::vars::HOME, found);
        return Ok(found);
    }

    for base in paths.fallback_bases() {
        if let Some(found) = first_existing(&base) {
            debug!("Found config: {}", found.display());
            return Ok(Some(found));
        }
    }

    Ok(None)
}

/// State root for bind mounts and the secret file.
///
/// The home of the located config file wins; otherwise the first configured
/// base directory is used.
pub fn state_root(paths: &SearchPaths, located: Option<&Path>) -> PathBuf {
    if let Some(file) = located {
        return env::config_home(file);
    }
    if let Some(home) = &paths.home_override {
        return paths.expand(home);
    }
    paths
        .fallback_bases()
        .into_iter()
        .next()
        .or_else(|| paths.current_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "[meta]\nversion = \"1.0\"\n").unwrap();
    }

    #[test]
    fn test_explicit_override_must_exist() {
        let temp = TempDir::new().unwrap();
        let paths = SearchPaths {
            config_override: Some(temp.path().join("missing.toml")),
            ..Default::default()
        };
        assert!(matches!(locate(&paths), Err(ConfigError::NotFound(_))));

        let file = temp.path().join("custom.toml");
        write_config(&file);
        let paths = SearchPaths {
            config_override: Some(file.clone()),
            ..Default::default()
        };
        assert_eq!(locate(&paths).unwrap(), Some(file));
    }

    #[test]
    fn test_home_override_prefers_configs_dir() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("configs").join("config.toml");
        let flat = temp.path().join("config.toml");
        write_config(&flat);
        write_config(&nested);

        let paths = SearchPaths {
            home_override: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(locate(&paths).unwrap(), Some(nested.clone()));
        assert_eq!(state_root(&paths, Some(&nested)), temp.path());
    }

    #[test]
    fn test_home_override_stops_search() {
        let home = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        write_config(&user.path().join(".config/airpods/config.toml"));

        let paths = SearchPaths {
            home_override: Some(home.path().to_path_buf()),
            home: Some(user.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(locate(&paths).unwrap(), None);
        assert_eq!(state_root(&paths, None), home.path());
    }

    #[test]
    fn test_project_root_then_xdg_then_home() {
        let project = TempDir::new().unwrap();
        fs::create_dir_all(project.path().join(".git")).unwrap();
        let nested_cwd = project.path().join("src").join("deep");
        fs::create_dir_all(&nested_cwd).unwrap();

        let xdg = TempDir::new().unwrap();
        let xdg_file = xdg.path().join("airpods").join("config.toml");
        write_config(&xdg_file);

        let paths = SearchPaths {
            current_dir: Some(nested_cwd),
            xdg_config_home: Some(xdg.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(paths.project_root().as_deref(), Some(project.path()));
        // project has no config file yet, XDG wins
        assert_eq!(locate(&paths).unwrap(), Some(xdg_file));

        let project_file = project.path().join("configs").join("config.toml");
        write_config(&project_file);
        assert_eq!(locate(&paths).unwrap(), Some(project_file));
    }

    #[test]
    fn test_nothing_found() {
        let user = TempDir::new().unwrap();
        let paths = SearchPaths {
            home: Some(user.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(locate(&paths).unwrap(), None);
        assert_eq!(
            state_root(&paths, None),
            user.path().join(".config").join("airpods")
        );
    }

    #[test]
    fn test_tilde_expansion() {
        let paths = SearchPaths {
            home: Some(PathBuf::from("/home/dev")),
            ..Default::default()
        };
        assert_eq!(
            paths.expand(Path::new("~/airpods")),
            Path::new("/home/dev/airpods")
        );
        assert_eq!(paths.expand(Path::new("/abs")), Path::new("/abs"));
    }
}
