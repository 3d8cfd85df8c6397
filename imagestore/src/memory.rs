use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::digest::Digest;
use crate::error::{StoreError, StoreResult};
use crate::index::Reference;
use crate::manifest::{Descriptor, ImageIndex, Manifest};
use crate::store::{
    is_child_manifest, referenced_digests, validate_references, validate_repository, BlobInfo,
    BlobReader, BlobStream, ImageStore,
};

#[derive(Debug, Clone)]
struct MemoryBlob {
    data: Bytes,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryRepo {
    blobs: HashMap<Digest, MemoryBlob>,
    index: ImageIndex,
}

/// Image store that keeps everything in memory.
///
/// Identical content pushed to several repositories shares one buffer.
#[derive(Debug)]
pub struct MemoryImageStore {
    root: Utf8PathBuf,
    repos: parking_lot::RwLock<BTreeMap<String, MemoryRepo>>,
    // Serializes index read-modify-write across awaits.
    writer: Mutex<()>,
}

impl Default for MemoryImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryImageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            root: Utf8PathBuf::from("memory"),
            repos: parking_lot::RwLock::new(BTreeMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Drop a blob behind the store's back, as if it were lost from disk.
    pub fn discard_blob(&self, repo: &str, digest: &Digest) -> bool {
        self.repos
            .write()
            .get_mut(repo)
            .and_then(|r| r.blobs.remove(digest))
            .is_some()
    }

    /// Overwrite a blob's bytes behind the store's back, as if it were
    /// corrupted on disk.
    pub fn corrupt_blob(&self, repo: &str, digest: &Digest, data: impl Into<Bytes>) -> bool {
        match self.repos.write().get_mut(repo).and_then(|r| r.blobs.get_mut(digest)) {
            Some(blob) => {
                blob.data = data.into();
                true
            }
            None => false,
        }
    }

    fn shared_content(&self, digest: &Digest) -> Option<Bytes> {
        self.repos
            .read()
            .values()
            .find_map(|r| r.blobs.get(digest).map(|b| b.data.clone()))
    }

    fn insert_blob(&self, repo: &str, digest: &Digest, data: Bytes) {
        let data = self.shared_content(digest).unwrap_or(data);
        self.repos
            .write()
            .entry(repo.to_owned())
            .or_default()
            .blobs
            .entry(digest.clone())
            .or_insert_with(|| MemoryBlob {
                data,
                modified: Utc::now(),
            });
    }

    fn blob(&self, repo: &str, digest: &Digest) -> StoreResult<MemoryBlob> {
        self.repos
            .read()
            .get(repo)
            .and_then(|r| r.blobs.get(digest).cloned())
            .ok_or_else(|| StoreError::BlobNotFound(digest.to_string()))
    }
}

#[async_trait::async_trait]
impl ImageStore for MemoryImageStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn root_dir(&self) -> &Utf8Path {
        &self.root
    }

    async fn init_repo(&self, repo: &str) -> StoreResult<()> {
        validate_repository(repo)?;
        self.repos.write().entry(repo.to_owned()).or_default();
        Ok(())
    }

    async fn list_repos(&self) -> StoreResult<Vec<String>> {
        Ok(self.repos.read().keys().cloned().collect())
    }

    async fn put_blob(
        &self,
        repo: &str,
        digest: &Digest,
        reader: &mut BlobReader<'_>,
        cancel: &CancellationToken,
    ) -> StoreResult<u64> {
        self.init_repo(repo).await?;

        let mut data = Vec::new();
        let mut digester = digest.algorithm().digester();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            data.extend_from_slice(&buf[..n]);
        }

        let actual = digester.finalize();
        if &actual != digest {
            return Err(StoreError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        let size = data.len() as u64;
        self.insert_blob(repo, digest, data.into());
        Ok(size)
    }

    async fn get_blob(&self, repo: &str, digest: &Digest) -> StoreResult<BlobStream> {
        validate_repository(repo)?;
        let blob = self.blob(repo, digest)?;
        Ok(BlobStream::new(blob.data.len() as u64, Cursor::new(blob.data)))
    }

    async fn stat_blob(&self, repo: &str, digest: &Digest) -> StoreResult<BlobInfo> {
        validate_repository(repo)?;
        let blob = self.blob(repo, digest)?;
        Ok(BlobInfo {
            size: blob.data.len() as u64,
            modified: blob.modified,
        })
    }

    async fn delete_blob(&self, repo: &str, digest: &Digest) -> StoreResult<()> {
        validate_repository(repo)?;
        let _writer = self.writer.lock().await;

        let index = self.get_index(repo).await?;
        if referenced_digests(self, repo, &index).await?.contains(digest) {
            return Err(StoreError::BlobReferenced(digest.to_string()));
        }

        if self.discard_blob(repo, digest) {
            Ok(())
        } else {
            Err(StoreError::BlobNotFound(digest.to_string()))
        }
    }

    async fn get_index(&self, repo: &str) -> StoreResult<ImageIndex> {
        validate_repository(repo)?;
        self.repos
            .read()
            .get(repo)
            .map(|r| r.index.clone())
            .ok_or_else(|| StoreError::RepoNotFound(repo.to_owned()))
    }

    async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        body: Bytes,
    ) -> StoreResult<Digest> {
        validate_repository(repo)?;
        let reference: Reference = reference.parse()?;
        let manifest = Manifest::parse(media_type, &body)?;

        let digest = match &reference {
            Reference::Digest(expected) => {
                let actual = Digest::from_bytes(expected.algorithm(), &body);
                if &actual != expected {
                    return Err(StoreError::DigestMismatch {
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
                actual
            }
            Reference::Tag(_) => Digest::sha256(&body),
        };

        let _writer = self.writer.lock().await;
        self.init_repo(repo).await?;
        validate_references(self, repo, &manifest).await?;

        let mut descriptor = Descriptor::new(media_type, digest.clone(), body.len() as u64);
        descriptor.artifact_type = manifest.artifact_type().map(str::to_owned);

        self.insert_blob(repo, &digest, body);
        if let Some(r) = self.repos.write().get_mut(repo) {
            r.index.record(descriptor, reference.tag());
        }
        Ok(digest)
    }

    async fn delete_manifest(&self, repo: &str, reference: &str) -> StoreResult<()> {
        validate_repository(repo)?;
        let parsed: Reference = reference.parse()?;
        let not_found = || StoreError::ManifestNotFound(format!("{repo}:{reference}"));

        let _writer = self.writer.lock().await;
        let mut index = self.get_index(repo).await.map_err(|_| not_found())?;

        match parsed {
            Reference::Tag(tag) => {
                if index.remove_tag(&tag).is_none() {
                    return Err(not_found());
                }
            }
            Reference::Digest(digest) => {
                if is_child_manifest(self, repo, &index, &digest).await? {
                    return Err(StoreError::ManifestReferenced(digest.to_string()));
                }
                if index.remove_digest(&digest) == 0 {
                    return Err(not_found());
                }
                self.discard_blob(repo, &digest);
            }
        }

        if let Some(r) = self.repos.write().get_mut(repo) {
            r.index = index;
        }
        Ok(())
    }
}
