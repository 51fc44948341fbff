//! Runtime-generated secrets.
//!
//! A [`SecretEnv`] wraps a zero-argument factory and calls it at most once per
//! process. The default factory persists its token to disk so later runs reuse
//! the same value.

use super::{Result, ServiceError};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Environment key carrying the Open WebUI session secret.
pub const WEBUI_SECRET_ENV: &str = "WEBUI_SECRET_KEY";

/// Length of generated tokens.
pub const TOKEN_LENGTH: usize = 43;

/// Zero-argument secret producer; expected to persist its own result.
pub type SecretFactory = Arc<dyn Fn() -> io::Result<String> + Send + Sync>;

/// An environment entry whose value is produced on first use.
pub struct SecretEnv {
    key: String,
    factory: SecretFactory,
    cached: Mutex<Option<String>>,
}

impl SecretEnv {
    pub fn new(key: impl Into<String>, factory: SecretFactory) -> Self {
        Self {
            key: key.into(),
            factory,
            cached: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The secret value, invoking the factory on first call only.
    pub fn value(&self) -> Result<String> {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(value) = cached.as_ref() {
            return Ok(value.clone());
        }

        let value = (self.factory)()
            .map_err(|e| ServiceError::Secret(format!("{}: {}", self.key, e)))?;
        *cached = Some(value.clone());
        Ok(value)
    }
}

impl std::fmt::Debug for SecretEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretEnv")
            .field("key", &self.key)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Generate a random URL-safe token.
pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Factory persisting a generated token at `path`.
///
/// An existing non-empty file is reused (trimmed); otherwise a fresh token is
/// written, creating parent directories as needed.
pub fn file_secret_factory(path: PathBuf) -> SecretFactory {
    Arc::new(move || {
        if path.is_file() {
            let existing = std::fs::read_to_string(&path)?;
            let existing = existing.trim();
            if !existing.is_empty() {
                debug!("Reusing secret from {}", path.display());
                return Ok(existing.to_string());
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let token = generate_token();
        std::fs::write(&path, &token)?;
        info!("Generated new secret at {}", path.display());
        Ok(token)
    })
}
