//! Error types for the image store

use cache::CacheError;

use crate::digest::DigestError;

/// Result type for image store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Error types for image store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Repository not found
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] DigestError),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// Stored or uploaded bytes do not hash to the digest
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Stored blob size differs from the size recorded by a descriptor
    #[error("size mismatch for {digest}: expected {expected}, got {actual}")]
    SizeMismatch {
        /// Blob digest
        digest: String,
        /// Size recorded by the descriptor
        expected: u64,
        /// Size on disk
        actual: u64,
    },

    /// Blob is referenced by a manifest in the repository index
    #[error("blob {0} is referenced by a manifest")]
    BlobReferenced(String),

    /// Manifest is a child of an index in the repository
    #[error("manifest {0} is referenced by an index")]
    ManifestReferenced(String),

    /// Operation cancelled through its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// Cache error
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error reports missing content.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::BlobNotFound(_) | StoreError::ManifestNotFound(_) | StoreError::RepoNotFound(_)
        )
    }

    /// Whether this error reports content that does not match its digest.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            StoreError::DigestMismatch { .. } | StoreError::SizeMismatch { .. }
        )
    }
}
