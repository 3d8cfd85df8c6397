//! # Dedupe caches
//!
//! Configuration and unification for the cache drivers that back blob
//! deduplication in the image store.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

pub(crate) mod memory;
pub(crate) mod null;
#[cfg(feature = "sqlite")]
pub(crate) mod sqlite;

#[doc(inline)]
pub use memory::MemoryCache;

#[doc(inline)]
pub use null::NullCache;

#[cfg(feature = "sqlite")]
#[doc(inline)]
pub use sqlite::SqliteCache;

#[doc(inline)]
pub use cache_driver::{CacheDriver, CacheError, CacheErrorKind, Claim};

/// Which cache driver to use, as it appears in the registry configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CacheConfig {
    /// Dedupe disabled.
    Null,

    /// Process-local cache, lost on restart.
    Memory,

    /// Persistent cache in an SQLite database file.
    #[cfg(feature = "sqlite")]
    Sqlite {
        /// Location of the database file.
        path: Utf8PathBuf,
    },
}

impl CacheConfig {
    /// Open the configured cache driver.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Cache, CacheError> {
        let cache: Cache = match self {
            CacheConfig::Null => NullCache.into(),
            CacheConfig::Memory => MemoryCache::new().into(),
            #[cfg(feature = "sqlite")]
            CacheConfig::Sqlite { path } => SqliteCache::connect(&path).await?.into(),
        };
        Ok(cache)
    }
}

pub(crate) type ArcDriver = Arc<dyn CacheDriver + Send + Sync>;

/// A shared handle to a cache driver.
#[derive(Debug, Clone)]
pub struct Cache {
    driver: ArcDriver,
}

impl<D> From<D> for Cache
where
    D: CacheDriver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Cache::new(value)
    }
}

impl Default for Cache {
    fn default() -> Self {
        Cache::new(NullCache)
    }
}

impl Cache {
    /// Wrap a cache driver.
    pub fn new<D: CacheDriver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// See [`CacheDriver::put_if_absent`].
    #[tracing::instrument(level = "debug", skip(self), fields(driver=self.driver.name()))]
    pub async fn put_if_absent(&self, digest: &str, path: &Utf8Path) -> Result<Claim, CacheError> {
        self.driver.put_if_absent(digest, path).await
    }

    /// See [`CacheDriver::put`].
    #[tracing::instrument(level = "debug", skip(self), fields(driver=self.driver.name()))]
    pub async fn put(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError> {
        self.driver.put(digest, path).await
    }

    /// See [`CacheDriver::get`].
    #[tracing::instrument(level = "debug", skip(self), fields(driver=self.driver.name()))]
    pub async fn get(&self, digest: &str) -> Result<Option<Utf8PathBuf>, CacheError> {
        self.driver.get(digest).await
    }

    /// See [`CacheDriver::locations`].
    pub async fn locations(&self, digest: &str) -> Result<Vec<Utf8PathBuf>, CacheError> {
        self.driver.locations(digest).await
    }

    /// See [`CacheDriver::contains`].
    pub async fn contains(&self, digest: &str, path: &Utf8Path) -> Result<bool, CacheError> {
        self.driver.contains(digest, path).await
    }

    /// See [`CacheDriver::delete`].
    #[tracing::instrument(level = "debug", skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError> {
        self.driver.delete(digest, path).await
    }
}
