use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{CatalogError, ServiceError};
use crate::executor::BuildExecutor;
use crate::imagebuilder::MakeImageBuilder;
use crate::jobs::{JobQueue, MemoryQueue};
use crate::orchestrator::{spawn_workers, Orchestrator};
use crate::toolchain::Bootstrapper;
use crate::upstream::Mirror;

/// Everything a process needs to accept and run builds.
pub struct Service {
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
    pub bootstrapper: Bootstrapper,
    pub executor: Arc<BuildExecutor>,
    queue: Arc<dyn JobQueue>,
}

impl Service {
    pub fn new(config: Config) -> Result<Self, ServiceError> {
        let catalog = Catalog::load(&config.catalog_dir)?;
        Self::with_catalog(config, catalog)
    }

    pub fn with_catalog(config: Config, catalog: Catalog) -> Result<Self, ServiceError> {
        let mirror = Arc::new(Mirror::new(&config.upstream_url)?);
        let bootstrapper =
            Bootstrapper::new(config.cache_dir.clone(), mirror, &config.upstream_key);
        let executor = Arc::new(BuildExecutor::new(
            config.store_dir.clone(),
            Arc::new(bootstrapper.clone()),
            Arc::new(MakeImageBuilder::new(&config.make)),
        ));
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new(config.retention()));
        let orchestrator = Arc::new(Orchestrator::new(catalog, queue.clone()));
        info!(
            "Service ready: store {}, cache {}, upstream {}",
            config.store_dir.display(),
            config.cache_dir.display(),
            config.upstream_url
        );
        Ok(Self {
            config,
            orchestrator,
            bootstrapper,
            executor,
            queue,
        })
    }

    pub fn start_workers(&self) -> Vec<JoinHandle<()>> {
        spawn_workers(
            self.queue.clone(),
            self.executor.clone(),
            self.config.workers,
        )
    }

    /// Re-reads the catalog directory and swaps the snapshot in.
    pub fn reload_catalog(&self) -> Result<(), CatalogError> {
        let catalog = Catalog::load(&self.config.catalog_dir)?;
        self.orchestrator.replace_catalog(catalog);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use std::fs;

    fn config(root: &std::path::Path) -> Config {
        Config {
            store_dir: root.join("store"),
            cache_dir: root.join("cache"),
            catalog_dir: root.join("catalog"),
            upstream_url: format!("file://{}", root.join("mirror").display()),
            upstream_key: crate::config::DEFAULT_UPSTREAM_KEY.into(),
            store_url: "http://localhost/store".into(),
            workers: 1,
            mode: Mode::Development,
            make: "make".into(),
        }
    }

    #[test]
    fn missing_catalog_is_a_startup_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            Service::new(config(root.path())),
            Err(ServiceError::Catalog(_))
        ));
    }

    #[tokio::test]
    async fn reload_picks_up_new_versions() {
        let root = tempfile::tempdir().unwrap();
        let catalog_dir = root.path().join("catalog");
        fs::create_dir_all(&catalog_dir).unwrap();
        fs::write(catalog_dir.join("versions.json"), "[]").unwrap();
        let service = Service::new(config(root.path())).unwrap();
        assert_eq!(service.orchestrator.catalog().versions().count(), 0);

        fs::write(catalog_dir.join("versions.json"), r#"["SNAPSHOT"]"#).unwrap();
        fs::write(catalog_dir.join("profiles-SNAPSHOT.json"), r#"{"profiles": {}}"#).unwrap();
        fs::write(catalog_dir.join("packages-SNAPSHOT.json"), "[]").unwrap();
        service.reload_catalog().unwrap();
        assert_eq!(
            service.orchestrator.catalog().versions().collect::<Vec<_>>(),
            vec!["SNAPSHOT"]
        );
    }
}
