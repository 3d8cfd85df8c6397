//! # Registry storage service
//!
//! Assembles the pieces of a container image registry's storage engine: an
//! [`imagestore::LocalImageStore`] with its dedupe [`cache::Cache`], and a
//! [`scheduler::Scheduler`] running the optional background extensions
//! (repository scrubbing, scanner database refresh).
//!
//! ## Example
//!
//! ```no_run
//! use registry::{Config, RegistryBuilder};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_toml(r#"
//!     [storage]
//!     root_directory = "/var/lib/registry"
//!
//!     [extensions.scrub]
//!     enable = true
//!     interval = "24h"
//! "#)?;
//!
//! let registry = RegistryBuilder::new(config).build().await?;
//! let cancel = CancellationToken::new();
//! registry.run(cancel).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use imagestore::{ImageStore, LocalImageStore, StoreOptions};
use scheduler::{Priority, Scheduler};
use tokio_util::sync::CancellationToken;

pub mod config;
mod error;
pub mod extensions;

pub use config::Config;
pub use error::{RegistryError, RegistryResult};

use extensions::{DbUpdateGenerator, Scanner, ScrubGenerator};

/// Registry builder for configuring and creating the storage service
#[derive(Debug)]
pub struct RegistryBuilder {
    config: Config,
    store: Option<Arc<dyn ImageStore>>,
    scanner: Option<Arc<dyn Scanner>>,
    dispatch: Option<tracing::Dispatch>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            scanner: None,
            dispatch: None,
        }
    }

    /// Use an existing image store instead of opening one from the storage
    /// configuration
    pub fn store(mut self, store: Arc<dyn ImageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the scanner whose database the scanner extension refreshes
    pub fn scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Log background work through `dispatch` instead of the default
    /// dispatcher at build time
    pub fn dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Open the store and cache, and register the enabled extensions
    #[tracing::instrument(skip(self), fields(root = %self.config.storage.root_directory))]
    pub async fn build(self) -> RegistryResult<Registry> {
        let store = match self.store {
            Some(store) => store,
            None => open_store(&self.config).await?,
        };

        let scheduler = match self.dispatch {
            Some(dispatch) => Scheduler::with_dispatch(self.config.scheduler.clone(), dispatch)?,
            None => Scheduler::new(self.config.scheduler.clone())?,
        };

        let scrub = &self.config.extensions.scrub;
        if scrub.enable {
            tracing::info!(interval = ?scrub.interval, mode = ?scrub.mode, "scrub enabled");
            scheduler.submit_generator(
                ScrubGenerator::new(store.clone(), scrub.mode),
                scrub.interval,
                Priority::Low,
            )?;
        }

        let scanner = &self.config.extensions.scanner;
        match (&self.scanner, scanner.enable) {
            (Some(db), true) => {
                let generator = DbUpdateGenerator::new(db.clone(), scanner.update_interval);
                let poll = generator.poll_interval();
                tracing::info!(
                    interval = ?scanner.update_interval,
                    ?poll,
                    "scanner DB refresh enabled"
                );
                scheduler.submit_generator(generator, poll, Priority::High)?;
            }
            (None, true) => {
                tracing::warn!("scanner DB refresh enabled, but no scanner is available");
            }
            (_, false) => {}
        }

        Ok(Registry {
            config: self.config,
            store,
            scheduler,
        })
    }
}

async fn open_store(config: &Config) -> RegistryResult<Arc<dyn ImageStore>> {
    let storage = &config.storage;
    tokio::fs::create_dir_all(&storage.root_directory).await?;

    let cache = storage.cache_config().build().await?;
    tracing::debug!(cache = cache.name(), "opened dedupe cache");

    let options = StoreOptions {
        dedupe: storage.dedupe,
        commit: storage.commit,
    };
    Ok(Arc::new(LocalImageStore::new(
        storage.root_directory.clone(),
        cache,
        options,
    )))
}

/// The assembled storage service.
#[derive(Debug, Clone)]
pub struct Registry {
    config: Config,
    store: Arc<dyn ImageStore>,
    scheduler: Scheduler,
}

impl Registry {
    /// Configuration the registry was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The image store.
    pub fn store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    /// The background scheduler, for submitting additional work.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run background work until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> RegistryResult<()> {
        tracing::info!(root = %self.store.root_dir(), "registry started");
        self.scheduler.run(cancel).await?;
        tracing::info!("registry stopped");
        Ok(())
    }
}
