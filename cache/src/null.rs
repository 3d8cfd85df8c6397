use camino::{Utf8Path, Utf8PathBuf};

use cache_driver::{CacheDriver, CacheError, Claim};

/// Cache driver used when dedupe is disabled. Every claim succeeds and nothing
/// is ever recorded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

#[async_trait::async_trait]
impl CacheDriver for NullCache {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn put_if_absent(&self, _digest: &str, _path: &Utf8Path) -> Result<Claim, CacheError> {
        Ok(Claim::Inserted)
    }

    async fn put(&self, _digest: &str, _path: &Utf8Path) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get(&self, _digest: &str) -> Result<Option<Utf8PathBuf>, CacheError> {
        Ok(None)
    }

    async fn locations(&self, _digest: &str) -> Result<Vec<Utf8PathBuf>, CacheError> {
        Ok(Vec::new())
    }

    async fn delete(&self, _digest: &str, _path: &Utf8Path) -> Result<(), CacheError> {
        Ok(())
    }
}
