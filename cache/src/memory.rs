use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::RwLock;

use cache_driver::{CacheDriver, CacheError, CacheErrorKind, Claim};

fn empty_digest(engine: &'static str) -> CacheError {
    CacheError::builder(engine, CacheErrorKind::InvalidRequest, "empty digest")
        .context("digest must not be empty")
        .build()
}

/// Cache driver that keeps the digest locations in memory.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<Utf8PathBuf>>>,
}

impl MemoryCache {
    /// Create an empty `MemoryCache`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of digests with at least one location.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no digest is recorded.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl CacheDriver for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put_if_absent(&self, digest: &str, path: &Utf8Path) -> Result<Claim, CacheError> {
        if digest.is_empty() {
            return Err(empty_digest(self.name()));
        }

        let mut entries = self.entries.write().await;
        if let Some(original) = entries.get(digest).and_then(|paths| paths.first()) {
            return Ok(Claim::Existing(original.clone()));
        }
        entries.insert(digest.to_owned(), vec![path.to_owned()]);
        Ok(Claim::Inserted)
    }

    async fn put(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError> {
        if digest.is_empty() {
            return Err(empty_digest(self.name()));
        }

        let mut entries = self.entries.write().await;
        let paths = entries.entry(digest.to_owned()).or_default();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_owned());
        }
        Ok(())
    }

    async fn get(&self, digest: &str) -> Result<Option<Utf8PathBuf>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries.get(digest).and_then(|paths| paths.first().cloned()))
    }

    async fn locations(&self, digest: &str) -> Result<Vec<Utf8PathBuf>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries.get(digest).cloned().unwrap_or_default())
    }

    async fn delete(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        if let Some(paths) = entries.get_mut(digest) {
            paths.retain(|p| p != path);
            if paths.is_empty() {
                entries.remove(digest);
            }
        }
        Ok(())
    }
}
