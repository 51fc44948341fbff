//! Reloadable access to the current [`ServiceManager`].

use super::Result;
use super::manager::ServiceManager;
use super::registry::{CatalogOptions, ServiceRegistry};
use crate::config::LoadedConfig;
use crate::runtime::ContainerRuntime;
use crate::system::SystemInspector;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Owns the current manager and swaps it wholesale on reload.
///
/// Callers holding an `Arc` from [`current`](Self::current) keep using the
/// manager they started with; nothing is patched in place.
pub struct ManagerHandle {
    current: RwLock<Arc<ServiceManager>>,
    runtime: Arc<dyn ContainerRuntime>,
    system: Arc<dyn SystemInspector>,
}

impl ManagerHandle {
    pub fn new(manager: ServiceManager) -> Self {
        let runtime = manager.runtime().clone();
        let system = manager.system().clone();
        Self {
            current: RwLock::new(Arc::new(manager)),
            runtime,
            system,
        }
    }

    pub async fn current(&self) -> Arc<ServiceManager> {
        self.current.read().await.clone()
    }

    /// Rebuild registry and manager from `loaded` and make them current.
    ///
    /// The engine adapter and system inspector carry over. On error the previous
    /// manager stays in place.
    pub async fn reload(
        &self,
        loaded: &LoadedConfig,
        options: &CatalogOptions,
    ) -> Result<Arc<ServiceManager>> {
        let registry = ServiceRegistry::from_config(&loaded.config, &loaded.state, options)?;
        let manager = Arc::new(ServiceManager::new(
            Arc::new(registry),
            self.runtime.clone(),
            self.system.clone(),
            &loaded.config,
        ));

        *self.current.write().await = manager.clone();
        info!(
            "Reloaded configuration ({} services)",
            manager.registry().len()
        );
        Ok(manager)
    }
}

impl std::fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("runtime", &self.runtime.name())
            .finish_non_exhaustive()
    }
}
