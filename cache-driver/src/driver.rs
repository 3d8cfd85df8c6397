use std::{fmt, ops::Deref, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::CacheError;

/// The outcome of [`CacheDriver::put_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Claim {
    /// No entry existed for the digest, and the given path is now its original
    /// location. The caller is responsible for putting the bytes there.
    Inserted,

    /// An entry already exists. The path is the original location holding the
    /// content, which the caller should share instead of writing the bytes again.
    Existing(Utf8PathBuf),
}

impl Claim {
    /// Whether this claim created a new entry.
    pub fn is_inserted(&self) -> bool {
        matches!(self, Claim::Inserted)
    }
}

/// A cache driver, which records where the content for each digest lives.
///
/// Paths are opaque to the driver. The image store hands it paths relative to
/// the store root, so a cache file can move along with the store.
///
/// Locations for a digest are ordered by insertion. The first one is the
/// *original*: the location new writes of the same content are linked to.
#[async_trait::async_trait]
pub trait CacheDriver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Atomically claim a digest for a path.
    ///
    /// If the digest has no entry, `path` becomes its original location and
    /// [`Claim::Inserted`] is returned. Otherwise nothing is recorded and the
    /// current original location is returned. Concurrent calls for the same
    /// digest must observe exactly one `Inserted`.
    async fn put_if_absent(&self, digest: &str, path: &Utf8Path) -> Result<Claim, CacheError>;

    /// Record an additional location for a digest. Recording a location twice
    /// is not an error.
    async fn put(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError>;

    /// Get the original location for a digest, if there is one.
    async fn get(&self, digest: &str) -> Result<Option<Utf8PathBuf>, CacheError>;

    /// All recorded locations for a digest, original first.
    async fn locations(&self, digest: &str) -> Result<Vec<Utf8PathBuf>, CacheError>;

    /// Check whether a specific location is recorded for a digest.
    async fn contains(&self, digest: &str, path: &Utf8Path) -> Result<bool, CacheError> {
        Ok(self.locations(digest).await?.iter().any(|p| p == path))
    }

    /// Remove one location for a digest. The entry is dropped once its last
    /// location is removed. Removing an unknown location is not an error.
    async fn delete(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError>;
}

#[async_trait::async_trait]
impl<D> CacheDriver for Arc<D>
where
    D: ?Sized + CacheDriver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn put_if_absent(&self, digest: &str, path: &Utf8Path) -> Result<Claim, CacheError> {
        self.deref().put_if_absent(digest, path).await
    }

    async fn put(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError> {
        self.deref().put(digest, path).await
    }

    async fn get(&self, digest: &str) -> Result<Option<Utf8PathBuf>, CacheError> {
        self.deref().get(digest).await
    }

    async fn locations(&self, digest: &str) -> Result<Vec<Utf8PathBuf>, CacheError> {
        self.deref().locations(digest).await
    }

    async fn contains(&self, digest: &str, path: &Utf8Path) -> Result<bool, CacheError> {
        self.deref().contains(digest, path).await
    }

    async fn delete(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError> {
        self.deref().delete(digest, path).await
    }
}

#[async_trait::async_trait]
impl<D> CacheDriver for &D
where
    D: ?Sized + CacheDriver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn put_if_absent(&self, digest: &str, path: &Utf8Path) -> Result<Claim, CacheError> {
        (**self).put_if_absent(digest, path).await
    }

    async fn put(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError> {
        (**self).put(digest, path).await
    }

    async fn get(&self, digest: &str) -> Result<Option<Utf8PathBuf>, CacheError> {
        (**self).get(digest).await
    }

    async fn locations(&self, digest: &str) -> Result<Vec<Utf8PathBuf>, CacheError> {
        (**self).locations(digest).await
    }

    async fn contains(&self, digest: &str, path: &Utf8Path) -> Result<bool, CacheError> {
        (**self).contains(digest, path).await
    }

    async fn delete(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError> {
        (**self).delete(digest, path).await
    }
}
