//! Filesystem image store with content deduplication.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<repo>/oci-layout
//! <root>/<repo>/index.json
//! <root>/<repo>/blobs/<algorithm>/<hex>
//! <root>/<repo>/.uploads/<staging files>
//! ```

use std::io::ErrorKind;

use bytes::Bytes;
use cache::{Cache, Claim};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::check::{ScrubMode, ScrubResult};
use crate::digest::{Algorithm, Digest};
use crate::error::{StoreError, StoreResult};
use crate::index::Reference;
use crate::lock::KeyedLocks;
use crate::manifest::{Descriptor, ImageIndex, Manifest};
use crate::store::{
    is_child_manifest, referenced_digests, validate_references, validate_repository, BlobInfo,
    BlobReader, BlobStream, ImageStore,
};

const UPLOADS: &str = ".uploads";
const BLOBS: &str = "blobs";
const INDEX: &str = "index.json";
const OCI_LAYOUT: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &[u8] = br#"{"imageLayoutVersion":"1.0.0"}"#;
const COPY_BUFFER: usize = 64 * 1024;

// A cache entry can go stale more than once while we claim it; give up on
// dedupe after this many prunes.
const DEDUPE_ATTEMPTS: usize = 3;

/// Options for [`LocalImageStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Hard-link identical blobs across repositories.
    pub dedupe: bool,
    /// Flush staged content and index updates to disk before they become
    /// visible.
    pub commit: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            dedupe: true,
            commit: false,
        }
    }
}

/// Image store on a local filesystem.
#[derive(Debug)]
pub struct LocalImageStore {
    root: Utf8PathBuf,
    cache: Cache,
    options: StoreOptions,
    blob_locks: KeyedLocks,
    repo_locks: KeyedLocks,
}

fn not_found(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::NotFound
}

async fn remove_quietly(path: &Utf8Path) {
    if let Err(err) = fs::remove_file(path).await {
        if !not_found(&err) {
            tracing::warn!(%path, error = %err, "failed to remove file");
        }
    }
}

impl LocalImageStore {
    /// Create a store rooted at `root`. With dedupe disabled the cache is
    /// never consulted.
    pub fn new(root: impl Into<Utf8PathBuf>, cache: Cache, options: StoreOptions) -> Self {
        let cache = if options.dedupe {
            cache
        } else {
            Cache::default()
        };
        Self {
            root: root.into(),
            cache,
            options,
            blob_locks: KeyedLocks::new(),
            repo_locks: KeyedLocks::new(),
        }
    }

    /// Store options in effect.
    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// The dedupe cache.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    fn repo_dir(&self, repo: &str) -> Utf8PathBuf {
        self.root.join(repo)
    }

    /// Blob location relative to the root, as recorded in the cache.
    fn blob_key(repo: &str, digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(repo).join(digest.blob_path())
    }

    /// Absolute location of a blob.
    pub fn blob_path(&self, repo: &str, digest: &Digest) -> Utf8PathBuf {
        self.root.join(Self::blob_key(repo, digest))
    }

    fn staging_path(&self, repo: &str) -> Utf8PathBuf {
        self.repo_dir(repo)
            .join(UPLOADS)
            .join(uuid::Uuid::new_v4().to_string())
    }

    /// Create the layout. The caller holds the repository lock.
    async fn ensure_layout(&self, repo: &str) -> StoreResult<()> {
        let dir = self.repo_dir(repo);
        fs::create_dir_all(dir.join(BLOBS)).await?;
        fs::create_dir_all(dir.join(UPLOADS)).await?;

        let layout = dir.join(OCI_LAYOUT);
        if !fs::try_exists(&layout).await? {
            self.write_atomic(repo, &layout, OCI_LAYOUT_CONTENT).await?;
        }

        let index = dir.join(INDEX);
        if !fs::try_exists(&index).await? {
            let body = serde_json::to_vec(&ImageIndex::default())?;
            self.write_atomic(repo, &index, &body).await?;
            tracing::debug!(repo, "initialized repository");
        }
        Ok(())
    }

    /// Write a small file through a staging file and a rename.
    async fn write_atomic(&self, repo: &str, path: &Utf8Path, content: &[u8]) -> StoreResult<()> {
        let staging = self.staging_path(repo);
        let result = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(content).await?;
            file.flush().await?;
            if self.options.commit {
                file.sync_all().await?;
            }
            drop(file);
            fs::rename(&staging, path).await
        }
        .await;

        if let Err(err) = result {
            remove_quietly(&staging).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn read_index(&self, repo: &str) -> StoreResult<ImageIndex> {
        let path = self.repo_dir(repo).join(INDEX);
        let body = match fs::read(&path).await {
            Ok(body) => body,
            Err(err) if not_found(&err) => return Err(StoreError::RepoNotFound(repo.to_owned())),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&body)?)
    }

    async fn write_index(&self, repo: &str, index: &ImageIndex) -> StoreResult<()> {
        let body = serde_json::to_vec(index)?;
        self.write_atomic(repo, &self.repo_dir(repo).join(INDEX), &body)
            .await
    }

    /// Copy the upload into a staging file, hashing as it goes.
    async fn stage(
        &self,
        staging: &Utf8Path,
        algorithm: Algorithm,
        reader: &mut BlobReader<'_>,
        cancel: &CancellationToken,
    ) -> StoreResult<(u64, Digest)> {
        let mut file = fs::File::create(staging).await?;
        let mut digester = algorithm.digester();
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut size = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            size += n as u64;
        }

        file.flush().await?;
        if self.options.commit {
            file.sync_all().await?;
        }
        Ok((size, digester.finalize()))
    }

    /// Move a staged blob into place without dedupe.
    async fn commit_fresh(&self, staging: &Utf8Path, target: &Utf8Path) -> StoreResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staging, target).await?;
        Ok(())
    }

    /// Hard-link `original` to `target` through a temporary name, so the
    /// target appears atomically.
    async fn link_into(&self, original: &Utf8Path, target: &Utf8Path) -> std::io::Result<()> {
        let parent = target
            .parent()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "blob path has no parent"))?;
        fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!(".{}.link", uuid::Uuid::new_v4()));
        fs::hard_link(original, &tmp).await?;
        if let Err(err) = fs::rename(&tmp, target).await {
            remove_quietly(&tmp).await;
            return Err(err);
        }
        Ok(())
    }

    async fn record_location(&self, digest: &Digest, key: &Utf8Path) {
        if let Err(err) = self.cache.put(&digest.to_string(), key).await {
            tracing::warn!(%digest, path = %key, error = %err, "failed to record blob location in cache");
        }
    }

    /// Move a verified staging file into place, linking to an existing copy
    /// of the content where the cache knows one.
    ///
    /// Any dedupe failure falls back to a fresh write.
    #[tracing::instrument(level = "debug", skip(self, staging, target), fields(digest = %digest))]
    async fn commit_blob(
        &self,
        digest: &Digest,
        key: &Utf8Path,
        staging: &Utf8Path,
        target: &Utf8Path,
        size: u64,
    ) -> StoreResult<()> {
        let digest_str = digest.to_string();

        for _ in 0..DEDUPE_ATTEMPTS {
            let original_key = match self.cache.put_if_absent(&digest_str, key).await {
                Ok(Claim::Inserted) => return self.commit_fresh(staging, target).await,
                Ok(Claim::Existing(original)) => original,
                Err(err) => {
                    tracing::warn!(error = %err, "dedupe cache unavailable, writing blob without dedupe");
                    return self.commit_fresh(staging, target).await;
                }
            };

            let original = self.root.join(&original_key);
            let original_size = if original_key == key {
                // Our own location is recorded but the file is gone.
                None
            } else {
                match fs::metadata(&original).await {
                    Ok(meta) => Some(meta.len()),
                    Err(err) if not_found(&err) => None,
                    Err(err) => {
                        tracing::warn!(%original, error = %err, "failed to inspect original blob, writing without dedupe");
                        self.commit_fresh(staging, target).await?;
                        self.record_location(digest, key).await;
                        return Ok(());
                    }
                }
            };

            let Some(original_size) = original_size else {
                tracing::info!(original = %original_key, "original blob vanished, pruning cache entry");
                if let Err(err) = self.cache.delete(&digest_str, &original_key).await {
                    tracing::warn!(error = %err, "failed to prune stale cache entry, writing without dedupe");
                    self.commit_fresh(staging, target).await?;
                    return Ok(());
                }
                continue;
            };

            if original_size != size {
                tracing::warn!(%original, original_size, size, "original blob has the wrong size, writing without dedupe");
                self.commit_fresh(staging, target).await?;
                self.record_location(digest, key).await;
                return Ok(());
            }

            match self.link_into(&original, target).await {
                Ok(()) => {
                    tracing::debug!(%original, "deduplicated blob");
                    remove_quietly(staging).await;
                }
                Err(err) => {
                    tracing::warn!(%original, error = %err, "failed to link blob, writing without dedupe");
                    self.commit_fresh(staging, target).await?;
                }
            }
            self.record_location(digest, key).await;
            return Ok(());
        }

        tracing::warn!("cache entry kept going stale, writing blob without dedupe");
        self.commit_fresh(staging, target).await?;
        self.record_location(digest, key).await;
        Ok(())
    }

    /// Store a blob. The repository layout must exist.
    async fn store_blob(
        &self,
        repo: &str,
        digest: &Digest,
        reader: &mut BlobReader<'_>,
        cancel: &CancellationToken,
    ) -> StoreResult<u64> {
        let staging = self.staging_path(repo);
        let (size, actual) = match self.stage(&staging, digest.algorithm(), reader, cancel).await {
            Ok(staged) => staged,
            Err(err) => {
                remove_quietly(&staging).await;
                return Err(err);
            }
        };

        if &actual != digest {
            remove_quietly(&staging).await;
            return Err(StoreError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        let _guard = self.blob_locks.lock(&digest.to_string()).await;
        let key = Self::blob_key(repo, digest);
        let target = self.root.join(&key);

        if fs::try_exists(&target).await? {
            tracing::debug!(repo, %digest, "blob already present");
            remove_quietly(&staging).await;
            return Ok(size);
        }

        let result = self.commit_blob(digest, &key, &staging, &target, size).await;
        if result.is_err() {
            remove_quietly(&staging).await;
        }
        result.map(|()| size)
    }

    /// Remove a blob file and its cache location. The caller holds the
    /// repository lock.
    async fn remove_blob(&self, repo: &str, digest: &Digest) -> StoreResult<()> {
        let _guard = self.blob_locks.lock(&digest.to_string()).await;
        let key = Self::blob_key(repo, digest);
        match fs::remove_file(self.root.join(&key)).await {
            Ok(()) => {}
            Err(err) if not_found(&err) => return Err(StoreError::BlobNotFound(digest.to_string())),
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.cache.delete(&digest.to_string(), &key).await {
            tracing::warn!(%digest, error = %err, "failed to remove blob location from cache");
        }
        Ok(())
    }
}

fn walk_repos(root: &Utf8Path, dir: &Utf8Path, repos: &mut Vec<String>) -> std::io::Result<()> {
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(err) if not_found(&err) => return Ok(()),
        Err(err) => return Err(err),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if name == BLOBS || name.starts_with('.') {
            continue;
        }

        let path = entry.path();
        if path.join(INDEX).is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                repos.push(relative.as_str().to_owned());
            }
        }
        walk_repos(root, path, repos)?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl ImageStore for LocalImageStore {
    fn name(&self) -> &'static str {
        "local"
    }

    fn root_dir(&self) -> &Utf8Path {
        &self.root
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn init_repo(&self, repo: &str) -> StoreResult<()> {
        validate_repository(repo)?;
        let _guard = self.repo_locks.lock(repo).await;
        self.ensure_layout(repo).await
    }

    async fn list_repos(&self) -> StoreResult<Vec<String>> {
        let root = self.root.clone();
        let mut repos = tokio::task::spawn_blocking(move || {
            let mut repos = Vec::new();
            walk_repos(&root, &root, &mut repos).map(|()| repos)
        })
        .await
        .map_err(std::io::Error::other)??;

        repos.sort();
        Ok(repos)
    }

    #[tracing::instrument(skip(self, reader, cancel), fields(store = "local", digest = %digest))]
    async fn put_blob(
        &self,
        repo: &str,
        digest: &Digest,
        reader: &mut BlobReader<'_>,
        cancel: &CancellationToken,
    ) -> StoreResult<u64> {
        self.init_repo(repo).await?;
        self.store_blob(repo, digest, reader, cancel).await
    }

    async fn get_blob(&self, repo: &str, digest: &Digest) -> StoreResult<BlobStream> {
        validate_repository(repo)?;
        let path = self.blob_path(repo, digest);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if not_found(&err) => return Err(StoreError::BlobNotFound(digest.to_string())),
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata().await?.len();
        Ok(BlobStream::new(size, file))
    }

    async fn stat_blob(&self, repo: &str, digest: &Digest) -> StoreResult<BlobInfo> {
        validate_repository(repo)?;
        let meta = match fs::metadata(self.blob_path(repo, digest)).await {
            Ok(meta) => meta,
            Err(err) if not_found(&err) => return Err(StoreError::BlobNotFound(digest.to_string())),
            Err(err) => return Err(err.into()),
        };
        Ok(BlobInfo {
            size: meta.len(),
            modified: DateTime::<Utc>::from(meta.modified()?),
        })
    }

    #[tracing::instrument(skip(self), fields(store = "local", digest = %digest))]
    async fn delete_blob(&self, repo: &str, digest: &Digest) -> StoreResult<()> {
        validate_repository(repo)?;
        let _guard = self.repo_locks.lock(repo).await;

        match self.read_index(repo).await {
            Ok(index) => {
                if referenced_digests(self, repo, &index).await?.contains(digest) {
                    return Err(StoreError::BlobReferenced(digest.to_string()));
                }
            }
            Err(StoreError::RepoNotFound(_)) => {}
            Err(err) => return Err(err),
        }

        self.remove_blob(repo, digest).await
    }

    async fn get_index(&self, repo: &str) -> StoreResult<ImageIndex> {
        validate_repository(repo)?;
        self.read_index(repo).await
    }

    #[tracing::instrument(skip(self, body), fields(store = "local", size = body.len()))]
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

        let _guard = self.repo_locks.lock(repo).await;
        self.ensure_layout(repo).await?;
        validate_references(self, repo, &manifest).await?;

        let mut reader: &[u8] = &body;
        self.store_blob(repo, &digest, &mut reader, &CancellationToken::new())
            .await?;

        let mut descriptor = Descriptor::new(media_type, digest.clone(), body.len() as u64);
        descriptor.artifact_type = manifest.artifact_type().map(str::to_owned);

        let mut index = self.read_index(repo).await?;
        index.record(descriptor, reference.tag());
        self.write_index(repo, &index).await?;

        tracing::debug!(%digest, %reference, "stored manifest");
        Ok(digest)
    }

    #[tracing::instrument(skip(self), fields(store = "local"))]
    async fn delete_manifest(&self, repo: &str, reference: &str) -> StoreResult<()> {
        validate_repository(repo)?;
        let parsed: Reference = reference.parse()?;
        let not_found = || StoreError::ManifestNotFound(format!("{repo}:{reference}"));

        let _guard = self.repo_locks.lock(repo).await;
        let mut index = match self.read_index(repo).await {
            Ok(index) => index,
            Err(StoreError::RepoNotFound(_)) => return Err(not_found()),
            Err(err) => return Err(err),
        };

        match parsed {
            Reference::Tag(tag) => {
                if index.remove_tag(&tag).is_none() {
                    return Err(not_found());
                }
                self.write_index(repo, &index).await
            }
            Reference::Digest(digest) => {
                if is_child_manifest(self, repo, &index, &digest).await? {
                    return Err(StoreError::ManifestReferenced(digest.to_string()));
                }
                if index.remove_digest(&digest) == 0 {
                    return Err(not_found());
                }
                self.write_index(repo, &index).await?;

                match self.remove_blob(repo, &digest).await {
                    Err(err) if err.is_not_found() => {
                        tracing::warn!(%digest, "manifest blob already missing");
                        Ok(())
                    }
                    other => other,
                }
            }
        }
    }

    async fn check_repo(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        mode: ScrubMode,
    ) -> StoreResult<Vec<ScrubResult>> {
        validate_repository(repo)?;
        crate::check::check_repo(self, cancel, repo, mode).await
    }
}

#[cfg(test)]
mod tests {
    #[cfg(unix)]
    use std::os::unix::fs::MetadataExt;

    use cache::MemoryCache;

    use super::*;
    use crate::check::ScrubStatus;
    use crate::manifest::{OCI_INDEX, OCI_MANIFEST};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: LocalImageStore,
        cache: Cache,
    }

    fn fixture(options: StoreOptions) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cache = Cache::new(MemoryCache::new());
        let store = LocalImageStore::new(root, cache.clone(), options);
        Fixture {
            _dir: dir,
            store,
            cache,
        }
    }

    async fn put(store: &LocalImageStore, repo: &str, content: &[u8]) -> Digest {
        let digest = Digest::sha256(content);
        let mut reader = content;
        store
            .put_blob(repo, &digest, &mut reader, &CancellationToken::new())
            .await
            .unwrap();
        digest
    }

    fn descriptor_json(media_type: &str, digest: &Digest, size: usize) -> String {
        format!(r#"{{"mediaType":"{media_type}","digest":"{digest}","size":{size}}}"#)
    }

    /// Push a config, one layer and a manifest tagged `tag`.
    async fn push_image(store: &LocalImageStore, repo: &str, tag: &str, layer: &[u8]) -> (Digest, Digest) {
        let config = br#"{"architecture":"amd64","os":"linux"}"#;
        let config_digest = put(store, repo, config).await;
        let layer_digest = put(store, repo, layer).await;
        let body = format!(
            r#"{{"schemaVersion":2,"mediaType":"{OCI_MANIFEST}","config":{},"layers":[{}]}}"#,
            descriptor_json("application/vnd.oci.image.config.v1+json", &config_digest, config.len()),
            descriptor_json("application/vnd.oci.image.layer.v1.tar+gzip", &layer_digest, layer.len()),
        );
        let manifest = store
            .put_manifest(repo, tag, OCI_MANIFEST, Bytes::from(body))
            .await
            .unwrap();
        (manifest, layer_digest)
    }

    #[tokio::test]
    async fn put_and_get_blob() {
        let f = fixture(StoreOptions::default());
        let digest = put(&f.store, "library/alpine", b"hello").await;

        let stream = f.store.get_blob("library/alpine", &digest).await.unwrap();
        assert_eq!(stream.size(), 5);
        assert_eq!(&stream.bytes().await.unwrap()[..], b"hello");

        let info = f.store.stat_blob("library/alpine", &digest).await.unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(f.store.verify_blob("library/alpine", &digest).await.unwrap(), 5);

        let root = f.store.root_dir();
        assert!(root.join("library/alpine/oci-layout").is_file());
        assert!(root.join("library/alpine/index.json").is_file());
    }

    #[tokio::test]
    async fn digest_mismatch_leaves_nothing() {
        let f = fixture(StoreOptions::default());
        let claimed = Digest::sha256(b"something else");
        let mut reader: &[u8] = b"hello";

        let err = f
            .store
            .put_blob("alpine", &claimed, &mut reader, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));

        assert!(!f.store.blob_path("alpine", &claimed).exists());
        let uploads = f.store.root_dir().join("alpine").join(UPLOADS);
        assert_eq!(std::fs::read_dir(uploads).unwrap().count(), 0);
        assert!(f.cache.get(&claimed.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_put_stores_nothing() {
        let f = fixture(StoreOptions::default());
        let digest = Digest::sha256(b"hello");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut reader: &[u8] = b"hello";
        let err = f
            .store
            .put_blob("alpine", &digest, &mut reader, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(!f.store.blob_path("alpine", &digest).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dedupe_links_identical_content() {
        let f = fixture(StoreOptions::default());
        let a = put(&f.store, "a", b"shared layer").await;
        let b = put(&f.store, "b", b"shared layer").await;
        assert_eq!(a, b);

        let meta_a = std::fs::metadata(f.store.blob_path("a", &a)).unwrap();
        let meta_b = std::fs::metadata(f.store.blob_path("b", &b)).unwrap();
        assert_eq!(meta_a.ino(), meta_b.ino());
        assert_eq!(meta_a.nlink(), 2);

        let locations = f.cache.locations(&a.to_string()).await.unwrap();
        assert_eq!(
            locations,
            vec![
                Utf8PathBuf::from("a").join(a.blob_path()),
                Utf8PathBuf::from("b").join(b.blob_path())
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dedupe_disabled_writes_copies() {
        let f = fixture(StoreOptions {
            dedupe: false,
            commit: true,
        });
        let a = put(&f.store, "a", b"shared layer").await;
        put(&f.store, "b", b"shared layer").await;

        let meta = std::fs::metadata(f.store.blob_path("a", &a)).unwrap();
        assert_eq!(meta.nlink(), 1);
        assert_eq!(f.store.cache().name(), "null");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn vanished_original_is_pruned() {
        let f = fixture(StoreOptions::default());
        let digest = put(&f.store, "a", b"layer").await;
        std::fs::remove_file(f.store.blob_path("a", &digest)).unwrap();

        put(&f.store, "b", b"layer").await;
        let locations = f.cache.locations(&digest.to_string()).await.unwrap();
        assert_eq!(locations, vec![Utf8PathBuf::from("b").join(digest.blob_path())]);
        assert_eq!(
            f.store.verify_blob("b", &digest).await.unwrap(),
            b"layer".len() as u64
        );
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pushes_share_one_copy() {
        let Fixture {
            _dir: dir,
            store,
            cache,
        } = fixture(StoreOptions::default());
        let store = std::sync::Arc::new(store);
        let content: &'static [u8] = b"layer pushed everywhere at once";
        let digest = Digest::sha256(content);

        let pushes: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                let digest = digest.clone();
                tokio::spawn(async move {
                    let mut reader = content;
                    store
                        .put_blob(&format!("repo{n}"), &digest, &mut reader, &CancellationToken::new())
                        .await
                })
            })
            .collect();
        for push in pushes {
            assert_eq!(push.await.unwrap().unwrap(), content.len() as u64);
        }

        let inodes: std::collections::HashSet<u64> = (0..8)
            .map(|n| {
                std::fs::metadata(store.blob_path(&format!("repo{n}"), &digest))
                    .unwrap()
                    .ino()
            })
            .collect();
        assert_eq!(inodes.len(), 1);

        let mut locations = cache.locations(&digest.to_string()).await.unwrap();
        locations.sort();
        let expected: Vec<Utf8PathBuf> = (0..8)
            .map(|n| Utf8PathBuf::from(format!("repo{n}")).join(digest.blob_path()))
            .collect();
        assert_eq!(locations, expected);
        drop(dir);
    }

    #[tokio::test]
    async fn manifests_and_tags() {
        let f = fixture(StoreOptions::default());
        let (manifest, _) = push_image(&f.store, "alpine", "latest", b"layer one").await;

        let stored = f.store.get_manifest("alpine", "latest").await.unwrap();
        assert_eq!(stored.descriptor.digest, manifest);
        assert_eq!(stored.descriptor.media_type, OCI_MANIFEST);
        assert_eq!(Digest::sha256(&stored.body), manifest);

        let by_digest = f
            .store
            .get_manifest("alpine", &manifest.to_string())
            .await
            .unwrap();
        assert_eq!(by_digest.body, stored.body);

        let (second, _) = push_image(&f.store, "alpine", "latest", b"layer two").await;
        assert_ne!(second, manifest);
        assert_eq!(f.store.list_tags("alpine").await.unwrap(), vec!["latest".to_owned()]);

        f.store.delete_manifest("alpine", "latest").await.unwrap();
        assert!(f.store.list_tags("alpine").await.unwrap().is_empty());
        assert!(f
            .store
            .get_manifest("alpine", "latest")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn manifest_with_missing_blob_is_rejected() {
        let f = fixture(StoreOptions::default());
        let config = put(&f.store, "alpine", b"{}").await;
        let missing = Digest::sha256(b"never pushed");
        let body = format!(
            r#"{{"schemaVersion":2,"config":{},"layers":[{}]}}"#,
            descriptor_json("application/vnd.oci.image.config.v1+json", &config, 2),
            descriptor_json("application/vnd.oci.image.layer.v1.tar", &missing, 12),
        );

        let err = f
            .store
            .put_manifest("alpine", "latest", OCI_MANIFEST, Bytes::from(body))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BlobNotFound(d) if d == missing.to_string()));
        assert!(f.store.list_tags("alpine").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn manifest_digest_reference_must_match() {
        let f = fixture(StoreOptions::default());
        let body = Bytes::from_static(br#"{"schemaVersion":2,"manifests":[]}"#);
        let wrong = Digest::sha256(b"other");

        let err = f
            .store
            .put_manifest("alpine", &wrong.to_string(), OCI_INDEX, body.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));

        let right = Digest::sha256(&body);
        let digest = f
            .store
            .put_manifest("alpine", &right.to_string(), OCI_INDEX, body)
            .await
            .unwrap();
        assert_eq!(digest, right);
        let index = f.store.get_index("alpine").await.unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.manifests[0].tag(), None);
    }

    #[tokio::test]
    async fn referenced_blob_cannot_be_deleted() {
        let f = fixture(StoreOptions::default());
        let (manifest, layer) = push_image(&f.store, "alpine", "latest", b"layer").await;

        let err = f.store.delete_blob("alpine", &layer).await.unwrap_err();
        assert!(matches!(err, StoreError::BlobReferenced(_)));
        let err = f.store.delete_blob("alpine", &manifest).await.unwrap_err();
        assert!(matches!(err, StoreError::BlobReferenced(_)));

        f.store
            .delete_manifest("alpine", &manifest.to_string())
            .await
            .unwrap();
        f.store.delete_blob("alpine", &layer).await.unwrap();
        assert!(f
            .store
            .stat_blob("alpine", &layer)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn deleting_blob_promotes_next_location() {
        let f = fixture(StoreOptions::default());
        let digest = put(&f.store, "a", b"layer").await;
        put(&f.store, "b", b"layer").await;

        f.store.delete_blob("a", &digest).await.unwrap();
        assert_eq!(
            f.cache.get(&digest.to_string()).await.unwrap(),
            Some(Utf8PathBuf::from("b").join(digest.blob_path()))
        );

        // A third repository links to the promoted original.
        put(&f.store, "c", b"layer").await;
        assert_eq!(f.store.verify_blob("c", &digest).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn list_nested_repos() {
        let f = fixture(StoreOptions::default());
        put(&f.store, "library/alpine", b"x").await;
        put(&f.store, "library", b"x").await;
        put(&f.store, "zeta", b"x").await;

        assert_eq!(
            f.store.list_repos().await.unwrap(),
            vec!["library".to_owned(), "library/alpine".to_owned(), "zeta".to_owned()]
        );
    }

    #[tokio::test]
    async fn invalid_repository_is_rejected() {
        let f = fixture(StoreOptions::default());
        let err = f.store.get_index("../escape").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRepository(_)));
    }

    #[tokio::test]
    async fn scrub_reports_deleted_blob() {
        let f = fixture(StoreOptions::default());
        let (_, layer) = push_image(&f.store, "alpine", "v1", b"layer one").await;
        push_image(&f.store, "alpine", "v2", b"layer two").await;

        std::fs::remove_file(f.store.blob_path("alpine", &layer)).unwrap();

        let results = f
            .store
            .check_repo(&CancellationToken::new(), "alpine", ScrubMode::Reachability)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        let v1 = results.iter().find(|r| r.tag == "v1").unwrap();
        assert_eq!(v1.status, ScrubStatus::Affected);
        assert_eq!(v1.affected_blob.as_ref(), Some(&layer));
        assert!(v1.error.is_some());

        let v2 = results.iter().find(|r| r.tag == "v2").unwrap();
        assert!(v2.is_ok());
    }

    #[tokio::test]
    async fn scrub_ten_tags_one_corrupt() {
        let f = fixture(StoreOptions::default());
        let mut corrupted = None;
        for i in 0..10 {
            let (_, layer) = push_image(&f.store, "busybox", &format!("t{i}"), format!("layer {i}").as_bytes()).await;
            if i == 4 {
                corrupted = Some(layer);
            }
        }
        let corrupted = corrupted.unwrap();
        std::fs::remove_file(f.store.blob_path("busybox", &corrupted)).unwrap();

        let results = f
            .store
            .check_repo(&CancellationToken::new(), "busybox", ScrubMode::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 10);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 9);
        let affected: Vec<_> = results.iter().filter(|r| !r.is_ok()).collect();
        assert_eq!(affected[0].tag, "t4");
        assert_eq!(affected[0].affected_blob.as_ref(), Some(&corrupted));
    }

    #[tokio::test]
    async fn verify_mode_detects_same_size_corruption() {
        let f = fixture(StoreOptions {
            dedupe: false,
            commit: false,
        });
        let (_, layer) = push_image(&f.store, "alpine", "latest", b"layer").await;
        std::fs::write(f.store.blob_path("alpine", &layer), b"LAYER").unwrap();

        let cancel = CancellationToken::new();
        let results = f
            .store
            .check_repo(&cancel, "alpine", ScrubMode::Reachability)
            .await
            .unwrap();
        assert!(results[0].is_ok());

        let results = f
            .store
            .check_repo(&cancel, "alpine", ScrubMode::Verify)
            .await
            .unwrap();
        assert_eq!(results[0].status, ScrubStatus::Affected);
        assert_eq!(results[0].affected_blob.as_ref(), Some(&layer));
    }

    #[tokio::test]
    async fn scrub_follows_index_children() {
        let f = fixture(StoreOptions::default());
        let (child, layer) = push_image(&f.store, "multi", "amd64", b"amd64 layer").await;
        let child_size = f.store.stat_blob("multi", &child).await.unwrap().size;
        let body = format!(
            r#"{{"schemaVersion":2,"mediaType":"{OCI_INDEX}","manifests":[{}]}}"#,
            descriptor_json(OCI_MANIFEST, &child, child_size as usize)
        );
        f.store
            .put_manifest("multi", "latest", OCI_INDEX, Bytes::from(body))
            .await
            .unwrap();
        f.store.delete_manifest("multi", "amd64").await.unwrap();

        let err = f
            .store
            .delete_manifest("multi", &child.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ManifestReferenced(_)));

        std::fs::remove_file(f.store.blob_path("multi", &layer)).unwrap();
        let results = f
            .store
            .check_repo(&CancellationToken::new(), "multi", ScrubMode::Reachability)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tag, "latest");
        assert_eq!(results[0].status, ScrubStatus::Affected);
        assert_eq!(results[0].affected_blob.as_ref(), Some(&layer));
    }

    #[tokio::test]
    async fn scrub_missing_repo_is_an_error() {
        let f = fixture(StoreOptions::default());
        let err = f
            .store
            .check_repo(&CancellationToken::new(), "nothing", ScrubMode::Reachability)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RepoNotFound(_)));
    }
}
