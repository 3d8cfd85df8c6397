//! OCI manifest and index documents.
//!
//! Docker schema 2 manifests and manifest lists share the OCI structure, so
//! they parse into the same types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{StoreError, StoreResult};

/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Docker schema 2 manifest.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

const FOREIGN_LAYERS: &[&str] = &[
    "application/vnd.oci.image.layer.nondistributable.v1.tar",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd",
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
];

/// Annotation carrying the tag of an index entry.
pub const REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Platform an image manifest is built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// Operating system version.
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Required operating system features.
    #[serde(rename = "os.features", default, skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    /// CPU variant, e.g. `v8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A typed reference to content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the referenced content.
    pub digest: Digest,
    /// Size in bytes of the referenced content.
    pub size: u64,
    /// Alternate download locations, used by foreign layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    /// Platform of a manifest listed in an index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Artifact type of the referenced manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    /// A descriptor with only the required fields.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            platform: None,
            artifact_type: None,
        }
    }

    /// The tag recorded on this descriptor, if any.
    pub fn tag(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(REF_NAME))
            .map(String::as_str)
    }

    /// Set or clear the tag annotation.
    pub fn set_tag(&mut self, tag: Option<&str>) {
        match tag {
            Some(tag) => {
                self.annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(REF_NAME.to_owned(), tag.to_owned());
            }
            None => {
                if let Some(annotations) = self.annotations.as_mut() {
                    annotations.remove(REF_NAME);
                    if annotations.is_empty() {
                        self.annotations = None;
                    }
                }
            }
        }
    }

    /// Whether this is a foreign (non-distributable) layer, which the
    /// registry is not required to hold.
    pub fn is_foreign(&self) -> bool {
        FOREIGN_LAYERS.contains(&self.media_type.as_str())
    }

    /// Whether the descriptor points to an index rather than an image.
    pub fn is_index(&self) -> bool {
        is_index_type(&self.media_type)
    }
}

/// OCI image manifest: a config blob plus layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always 2.
    pub schema_version: u32,
    /// Media type of the document itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Type of artifact, for non-image content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Image configuration blob.
    pub config: Descriptor,
    /// Filesystem layers, base first.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// Manifest this one refers to (signatures, SBOMs, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageManifest {
    /// Blobs that must be present for this manifest to be pulled.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config)
            .chain(self.layers.iter())
            .filter(|d| !d.is_foreign())
    }
}

/// OCI image index. Also the format of a repository's `index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always 2.
    pub schema_version: u32,
    /// Media type of the document itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Type of artifact, for non-image content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Listed manifests.
    pub manifests: Vec<Descriptor>,
    /// Manifest this one refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(OCI_INDEX.to_owned()),
            artifact_type: None,
            manifests: Vec::new(),
            subject: None,
            annotations: None,
        }
    }
}

/// A parsed manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// Image manifest.
    Image(ImageManifest),
    /// Image index or manifest list.
    Index(ImageIndex),
}

fn is_index_type(media_type: &str) -> bool {
    matches!(media_type, OCI_INDEX | DOCKER_MANIFEST_LIST)
}

fn invalid(reason: impl Into<String>) -> StoreError {
    StoreError::InvalidManifest(reason.into())
}

impl Manifest {
    /// Parse and validate a manifest body against the media type the client
    /// supplied for it.
    pub fn parse(media_type: &str, body: &[u8]) -> StoreResult<Self> {
        let (schema_version, embedded, manifest) = match media_type {
            OCI_MANIFEST | DOCKER_MANIFEST => {
                let m: ImageManifest = serde_json::from_slice(body)
                    .map_err(|e| invalid(format!("parsing image manifest: {e}")))?;
                (m.schema_version, m.media_type.clone(), Manifest::Image(m))
            }
            OCI_INDEX | DOCKER_MANIFEST_LIST => {
                let i: ImageIndex = serde_json::from_slice(body)
                    .map_err(|e| invalid(format!("parsing image index: {e}")))?;
                (i.schema_version, i.media_type.clone(), Manifest::Index(i))
            }
            other => return Err(StoreError::UnsupportedManifestType(other.to_owned())),
        };

        if schema_version != 2 {
            return Err(invalid(format!("unsupported schema version {schema_version}")));
        }

        if let Some(embedded) = embedded {
            if embedded != media_type {
                return Err(invalid(format!(
                    "media type {embedded} in body does not match {media_type}"
                )));
            }
        }

        Ok(manifest)
    }

    /// Parse a stored manifest using the media type recorded by its descriptor.
    pub fn from_descriptor(descriptor: &Descriptor, body: &[u8]) -> StoreResult<Self> {
        Self::parse(&descriptor.media_type, body)
    }

    /// Media type of a stored manifest, taken from its `mediaType` field or,
    /// for documents without one, from its shape.
    pub fn detect_media_type(body: &[u8]) -> String {
        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
            if let Some(media_type) = json.get("mediaType").and_then(|v| v.as_str()) {
                return media_type.to_owned();
            }
            if json.get("manifests").is_some() {
                return OCI_INDEX.to_owned();
            }
        }
        OCI_MANIFEST.to_owned()
    }

    /// Artifact type declared by the document.
    pub fn artifact_type(&self) -> Option<&str> {
        match self {
            Manifest::Image(m) => m
                .artifact_type
                .as_deref()
                .or(Some(m.config.media_type.as_str()).filter(|t| !t.is_empty())),
            Manifest::Index(i) => i.artifact_type.as_deref(),
        }
    }
}
