//! # Image store
//!
//! Content-addressable storage for container images: blobs and manifests
//! kept per repository in the OCI image layout, with identical blobs
//! deduplicated across repositories through a [`cache::Cache`].
//!
//! ## Example
//!
//! ```no_run
//! use cache::{Cache, MemoryCache};
//! use imagestore::{Digest, ImageStore, LocalImageStore, StoreOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = LocalImageStore::new(
//!     "/var/lib/registry",
//!     Cache::new(MemoryCache::new()),
//!     StoreOptions::default(),
//! );
//!
//! let layer = b"layer content";
//! let digest = Digest::sha256(layer);
//! let mut reader = &layer[..];
//! store
//!     .put_blob("library/alpine", &digest, &mut reader, &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod check;
mod digest;
mod error;
mod index;
mod local;
mod lock;
mod manifest;
mod memory;
mod store;

pub use check::{check_repo, ScrubMode, ScrubResult, ScrubStatus};
pub use digest::{Algorithm, Digest, DigestError, Digester};
pub use error::{StoreError, StoreResult};
pub use index::{validate_tag, Reference};
pub use local::{LocalImageStore, StoreOptions};
pub use manifest::{
    Descriptor, ImageIndex, ImageManifest, Manifest, Platform, DOCKER_MANIFEST,
    DOCKER_MANIFEST_LIST, OCI_INDEX, OCI_MANIFEST, REF_NAME,
};
pub use memory::MemoryImageStore;
pub use store::{validate_repository, BlobInfo, BlobReader, BlobStream, ImageStore, StoredManifest};
