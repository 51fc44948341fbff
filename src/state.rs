//! On-disk state layout.
//!
//! Everything airpods persists outside the container engine lives under a single
//! state root: bind-mounted service data under `volumes/` and the generated
//! WebUI secret under `configs/`. Directories are created on first use and are
//! never deleted here.

use crate::env;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Prefix marking a volume source relative to the state root's `volumes/` dir.
pub const BIND_PREFIX: &str = "bind://";

/// Resolved state directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
    home: Option<PathBuf>,
}

impl StatePaths {
    /// Create state paths rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            home: None,
        }
    }

    /// Set the user home used to expand `~/` volume sources.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn configs_dir(&self) -> PathBuf {
        env::configs_dir_path(&self.root)
    }

    pub fn volumes_dir(&self) -> PathBuf {
        env::volumes_dir_path(&self.root)
    }

    pub fn secret_path(&self) -> PathBuf {
        env::webui_secret_file_path(&self.root)
    }

    /// Resolve a configured volume source.
    ///
    /// `bind://<rel>` becomes `<root>/volumes/<rel>`, a leading `~/` expands to
    /// the user home when one is known, anything else is returned verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::InvalidInput`] when a bind source leaves the
    /// volumes directory.
    pub fn resolve_volume_source(&self, source: &str) -> io::Result<String> {
        if let Some(relative) = bind_relative(source)? {
            return Ok(self.volumes_dir().join(relative).display().to_string());
        }

        if let (Some(rest), Some(home)) = (source.strip_prefix("~/"), self.home.as_ref()) {
            return Ok(home.join(rest).display().to_string());
        }

        Ok(source.to_string())
    }
}

/// Relative path of a `bind://` source, or `None` for any other source.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidInput`] when the path climbs out of the
/// volumes directory with `..`.
pub fn bind_relative(source: &str) -> io::Result<Option<&Path>> {
    let Some(relative) = source.strip_prefix(BIND_PREFIX) else {
        return Ok(None);
    };
    let relative = Path::new(relative.trim_start_matches('/'));
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bind source {} must stay inside the volumes directory", source),
        ));
    }
    Ok(Some(relative))
}

/// Ensure a bind-mount source directory exists.
///
/// Returns `true` when the directory was newly created.
pub fn ensure_bind_source(path: &Path) -> io::Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    std::fs::create_dir_all(path)?;
    debug!("Created bind directory: {}", path.display());
    Ok(true)
}
