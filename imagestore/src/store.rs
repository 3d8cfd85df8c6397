use std::collections::HashSet;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::check::{ScrubMode, ScrubResult};
use crate::digest::Digest;
use crate::error::{StoreError, StoreResult};
use crate::index::Reference;
use crate::manifest::{Descriptor, ImageIndex, Manifest};

const READ_CHUNK: usize = 64 * 1024;

/// Names used by the repository layout, which would collide with a nested
/// repository of the same name.
const RESERVED_COMPONENTS: [&str; 3] = ["blobs", "index.json", "oci-layout"];

/// Readable content of a stored blob.
pub struct BlobStream {
    size: u64,
    reader: Box<dyn AsyncRead + Unpin + Send + Sync>,
}

impl fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStream").field("size", &self.size).finish()
    }
}

impl BlobStream {
    /// Wrap a reader over `size` bytes of blob content.
    pub fn new<R>(size: u64, reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
    {
        Self {
            size,
            reader: Box::new(reader),
        }
    }

    /// Size of the blob in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the whole blob into memory.
    pub async fn bytes(mut self) -> io::Result<Bytes> {
        let mut buf = Vec::with_capacity(usize::try_from(self.size).unwrap_or_default());
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf.into())
    }
}

impl AsyncRead for BlobStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// Metadata for a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobInfo {
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// A manifest body together with its index descriptor.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    /// Descriptor, including media type and digest.
    pub descriptor: Descriptor,
    /// Raw manifest bytes, exactly as pushed.
    pub body: Bytes,
}

/// Reader type accepted by [`ImageStore::put_blob`].
pub type BlobReader<'r> = dyn AsyncRead + Unpin + Send + 'r;

/// Content-addressable storage for the repositories of a registry.
///
/// Every operation validates the repository name first.
#[async_trait::async_trait]
pub trait ImageStore: fmt::Debug + Send + Sync {
    /// Name of the store implementation.
    fn name(&self) -> &'static str;

    /// Directory all repositories live under.
    fn root_dir(&self) -> &Utf8Path;

    /// Create the repository layout if it does not exist yet.
    async fn init_repo(&self, repo: &str) -> StoreResult<()>;

    /// All repositories in the store, sorted.
    async fn list_repos(&self) -> StoreResult<Vec<String>>;

    /// Stream a blob into the repository, checking it against `digest`.
    ///
    /// Returns the blob size. Nothing is stored if the content does not hash
    /// to `digest` or the token is cancelled before the upload completes.
    async fn put_blob(
        &self,
        repo: &str,
        digest: &Digest,
        reader: &mut BlobReader<'_>,
        cancel: &CancellationToken,
    ) -> StoreResult<u64>;

    /// Open a blob for reading.
    async fn get_blob(&self, repo: &str, digest: &Digest) -> StoreResult<BlobStream>;

    /// Size and modification time of a blob.
    async fn stat_blob(&self, repo: &str, digest: &Digest) -> StoreResult<BlobInfo>;

    /// Delete a blob that no manifest in the repository index references.
    async fn delete_blob(&self, repo: &str, digest: &Digest) -> StoreResult<()>;

    /// The repository's `index.json`.
    async fn get_index(&self, repo: &str) -> StoreResult<ImageIndex>;

    /// Validate and store a manifest, then record it under `reference`.
    async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        body: Bytes,
    ) -> StoreResult<Digest>;

    /// Remove a tag, or, for a digest reference, the manifest and every tag
    /// pointing to it.
    async fn delete_manifest(&self, repo: &str, reference: &str) -> StoreResult<()>;

    /// Re-hash a stored blob, returning its size.
    async fn verify_blob(&self, repo: &str, digest: &Digest) -> StoreResult<u64> {
        let mut stream = self.get_blob(repo, digest).await?;
        let mut digester = digest.algorithm().digester();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut size = 0u64;
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            size += n as u64;
        }

        let actual = digester.finalize();
        if &actual != digest {
            return Err(StoreError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(size)
    }

    /// Fetch a manifest by tag or digest.
    async fn get_manifest(&self, repo: &str, reference: &str) -> StoreResult<StoredManifest> {
        let parsed: Reference = reference.parse()?;
        let not_found = || StoreError::ManifestNotFound(format!("{repo}:{reference}"));

        let index = match self.get_index(repo).await {
            Ok(index) => index,
            Err(StoreError::RepoNotFound(_)) => return Err(not_found()),
            Err(err) => return Err(err),
        };

        let (digest, descriptor) = match (&parsed, index.find(&parsed)) {
            (_, Some(descriptor)) => (descriptor.digest.clone(), Some(descriptor.clone())),
            // Children of an index are stored but not listed.
            (Reference::Digest(digest), None) => (digest.clone(), None),
            (Reference::Tag(_), None) => return Err(not_found()),
        };

        let body = match self.get_blob(repo, &digest).await {
            Ok(stream) => stream.bytes().await?,
            Err(err) if err.is_not_found() => return Err(not_found()),
            Err(err) => return Err(err),
        };

        let descriptor = match descriptor {
            Some(mut descriptor) => {
                descriptor.set_tag(None);
                descriptor
            }
            None => Descriptor::new(
                Manifest::detect_media_type(&body),
                digest,
                body.len() as u64,
            ),
        };
        Ok(StoredManifest { descriptor, body })
    }

    /// Tags of a repository, in index order.
    async fn list_tags(&self, repo: &str) -> StoreResult<Vec<String>> {
        Ok(self.get_index(repo).await?.tags())
    }

    /// Re-resolve every manifest and blob reachable from the repository
    /// index, one result per index entry.
    async fn check_repo(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        mode: ScrubMode,
    ) -> StoreResult<Vec<ScrubResult>> {
        crate::check::check_repo(self, cancel, repo, mode).await
    }
}

/// Check that every blob or child manifest a new manifest refers to is
/// present with the recorded size.
pub(crate) async fn validate_references<S>(
    store: &S,
    repo: &str,
    manifest: &Manifest,
) -> StoreResult<()>
where
    S: ImageStore + ?Sized,
{
    let (descriptors, missing): (Vec<&Descriptor>, fn(String) -> StoreError) = match manifest {
        Manifest::Image(m) => (m.blobs().collect(), StoreError::BlobNotFound),
        Manifest::Index(i) => (i.manifests.iter().collect(), StoreError::ManifestNotFound),
    };

    for descriptor in descriptors {
        let info = match store.stat_blob(repo, &descriptor.digest).await {
            Ok(info) => info,
            Err(err) if err.is_not_found() => return Err(missing(descriptor.digest.to_string())),
            Err(err) => return Err(err),
        };
        if info.size != descriptor.size {
            return Err(StoreError::SizeMismatch {
                digest: descriptor.digest.to_string(),
                expected: descriptor.size,
                actual: info.size,
            });
        }
    }
    Ok(())
}

/// Every digest kept alive by the manifests listed in `index`: the manifests
/// themselves, the children of indexes and the blobs of image manifests.
///
/// Manifests that cannot be read are skipped; the scrubber reports those.
pub(crate) async fn referenced_digests<S>(
    store: &S,
    repo: &str,
    index: &ImageIndex,
) -> StoreResult<HashSet<Digest>>
where
    S: ImageStore + ?Sized,
{
    let mut referenced = HashSet::new();
    let mut pending: Vec<Descriptor> = index.manifests.clone();

    while let Some(descriptor) = pending.pop() {
        if !referenced.insert(descriptor.digest.clone()) {
            continue;
        }

        let body = match store.get_blob(repo, &descriptor.digest).await {
            Ok(stream) => stream.bytes().await?,
            Err(err) if err.is_not_found() => {
                tracing::debug!(digest = %descriptor.digest, "skipping missing manifest");
                continue;
            }
            Err(err) => return Err(err),
        };

        match Manifest::from_descriptor(&descriptor, &body) {
            Ok(Manifest::Image(m)) => {
                referenced.extend(m.blobs().map(|d| d.digest.clone()));
            }
            Ok(Manifest::Index(i)) => pending.extend(i.manifests),
            Err(err) => {
                tracing::debug!(digest = %descriptor.digest, error = %err, "skipping unreadable manifest");
            }
        }
    }

    Ok(referenced)
}

/// Whether an index entry other than the manifest itself lists `digest` as
/// a child.
pub(crate) async fn is_child_manifest<S>(
    store: &S,
    repo: &str,
    index: &ImageIndex,
    digest: &Digest,
) -> StoreResult<bool>
where
    S: ImageStore + ?Sized,
{
    for parent in index.manifests.iter().filter(|d| d.is_index() && &d.digest != digest) {
        let body = match store.get_blob(repo, &parent.digest).await {
            Ok(stream) => stream.bytes().await?,
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err),
        };
        if let Ok(Manifest::Index(i)) = Manifest::from_descriptor(parent, &body) {
            if i.manifests.iter().any(|child| &child.digest == digest) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Validate a repository name: `/`-separated components of lower-case
/// alphanumerics joined by `.`, `_`, `__` or runs of `-`. Components may not
/// be named after the layout's own entries (`blobs`, `index.json`,
/// `oci-layout`).
pub fn validate_repository(name: &str) -> StoreResult<()> {
    let invalid = || StoreError::InvalidRepository(name.to_owned());
    if name.is_empty() || name.len() > 255 {
        return Err(invalid());
    }
    if name
        .split('/')
        .all(|c| valid_component(c) && !RESERVED_COMPONENTS.contains(&c))
    {
        Ok(())
    } else {
        Err(invalid())
    }
}

fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !alnum(first) || !alnum(last) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(&bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(&bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let ok = matches!(separator, "." | "_" | "__") || separator.bytes().all(|b| b == b'-');
        if !ok {
            return false;
        }
    }
    true
}
