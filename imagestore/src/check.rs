//! Repository integrity checks.

use std::fmt;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::digest::Digest;
use crate::error::{StoreError, StoreResult};
use crate::manifest::{Descriptor, Manifest};
use crate::store::ImageStore;

/// How thoroughly a check inspects stored content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrubMode {
    /// Every referenced blob exists with its recorded size.
    #[default]
    Reachability,
    /// Additionally re-hash every referenced blob.
    Verify,
}

/// Outcome for one index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrubStatus {
    /// Everything the entry references resolved.
    Ok,
    /// Something the entry references is missing or damaged.
    Affected,
}

impl fmt::Display for ScrubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrubStatus::Ok => f.write_str("ok"),
            ScrubStatus::Affected => f.write_str("affected"),
        }
    }
}

/// Result of checking one tag (or untagged manifest) of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrubResult {
    /// Repository name.
    pub repo: String,
    /// Tag, or the manifest digest for untagged entries.
    pub tag: String,
    /// Whether the entry is intact.
    pub status: ScrubStatus,
    /// First digest found missing or damaged.
    pub affected_blob: Option<Digest>,
    /// Why the blob is affected.
    pub error: Option<String>,
}

impl ScrubResult {
    /// Whether the entry is intact.
    pub fn is_ok(&self) -> bool {
        self.status == ScrubStatus::Ok
    }
}

struct Failure {
    digest: Digest,
    error: StoreError,
}

impl Failure {
    fn new(digest: &Digest, error: StoreError) -> Self {
        Self {
            digest: digest.clone(),
            error,
        }
    }
}

/// Check every entry of a repository index.
///
/// Problems with an entry go into its result. Only a failure to read the
/// index itself, or cancellation, aborts the check.
#[tracing::instrument(level = "debug", skip(store, cancel), fields(store = store.name()))]
pub async fn check_repo<S>(
    store: &S,
    cancel: &CancellationToken,
    repo: &str,
    mode: ScrubMode,
) -> StoreResult<Vec<ScrubResult>>
where
    S: ImageStore + ?Sized,
{
    let index = store.get_index(repo).await?;
    let mut results = Vec::with_capacity(index.manifests.len());

    for descriptor in &index.manifests {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let tag = descriptor
            .tag()
            .map(str::to_owned)
            .unwrap_or_else(|| descriptor.digest.to_string());

        let result = match check_manifest(store, repo, descriptor, mode).await {
            Ok(()) => ScrubResult {
                repo: repo.to_owned(),
                tag,
                status: ScrubStatus::Ok,
                affected_blob: None,
                error: None,
            },
            Err(failure) => ScrubResult {
                repo: repo.to_owned(),
                tag,
                status: ScrubStatus::Affected,
                affected_blob: Some(failure.digest),
                error: Some(failure.error.to_string()),
            },
        };
        results.push(result);
    }

    Ok(results)
}

async fn check_blob<S>(
    store: &S,
    repo: &str,
    descriptor: &Descriptor,
    mode: ScrubMode,
) -> Result<(), Failure>
where
    S: ImageStore + ?Sized,
{
    let digest = &descriptor.digest;
    let size = match mode {
        ScrubMode::Reachability => store
            .stat_blob(repo, digest)
            .await
            .map_err(|e| Failure::new(digest, e))?
            .size,
        ScrubMode::Verify => store
            .verify_blob(repo, digest)
            .await
            .map_err(|e| Failure::new(digest, e))?,
    };

    if size != descriptor.size {
        return Err(Failure::new(
            digest,
            StoreError::SizeMismatch {
                digest: digest.to_string(),
                expected: descriptor.size,
                actual: size,
            },
        ));
    }
    Ok(())
}

fn check_manifest<'a, S>(
    store: &'a S,
    repo: &'a str,
    descriptor: &'a Descriptor,
    mode: ScrubMode,
) -> BoxFuture<'a, Result<(), Failure>>
where
    S: ImageStore + ?Sized,
{
    async move {
        let digest = &descriptor.digest;
        check_blob(store, repo, descriptor, mode).await?;

        let body = store
            .get_blob(repo, digest)
            .await
            .map_err(|e| Failure::new(digest, e))?
            .bytes()
            .await
            .map_err(|e| Failure::new(digest, e.into()))?;

        match Manifest::from_descriptor(descriptor, &body).map_err(|e| Failure::new(digest, e))? {
            Manifest::Image(manifest) => {
                for blob in manifest.blobs() {
                    check_blob(store, repo, blob, mode).await?;
                }
            }
            Manifest::Index(index) => {
                for child in &index.manifests {
                    check_manifest(store, repo, child, mode).await?;
                }
            }
        }
        Ok(())
    }
    .boxed()
}
