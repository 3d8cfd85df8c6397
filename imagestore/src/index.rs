//! Tag bookkeeping in a repository's `index.json`.

use std::fmt;
use std::str::FromStr;

use crate::digest::Digest;
use crate::error::StoreError;
use crate::manifest::{Descriptor, ImageIndex};

const MAX_TAG_LEN: usize = 128;

/// How a client names a manifest: by tag or by digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A mutable tag, e.g. `latest`.
    Tag(String),
    /// An immutable digest.
    Digest(Digest),
}

impl Reference {
    /// The tag, for tag references.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

impl FromStr for Reference {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            return Ok(Reference::Digest(s.parse()?));
        }
        validate_tag(s)?;
        Ok(Reference::Tag(s.to_owned()))
    }
}

/// Validate a tag: `[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}`.
pub fn validate_tag(tag: &str) -> Result<(), StoreError> {
    let mut chars = tag.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphanumeric() || first == '_')
                && tag.len() <= MAX_TAG_LEN
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTag(tag.to_owned()))
    }
}

impl ImageIndex {
    /// Find the entry for a reference. For digests this is the first entry
    /// with that digest.
    pub fn find(&self, reference: &Reference) -> Option<&Descriptor> {
        match reference {
            Reference::Tag(tag) => self.manifests.iter().find(|d| d.tag() == Some(tag)),
            Reference::Digest(digest) => self.manifests.iter().find(|d| &d.digest == digest),
        }
    }

    /// Tags in index order.
    pub fn tags(&self) -> Vec<String> {
        self.manifests
            .iter()
            .filter_map(|d| d.tag().map(str::to_owned))
            .collect()
    }

    /// Record a manifest, tagged or not.
    ///
    /// A tag moves to the new manifest. An untagged put of a digest already
    /// listed is a no-op, and tagging a digest replaces its untagged entry.
    pub fn record(&mut self, mut descriptor: Descriptor, tag: Option<&str>) {
        descriptor.set_tag(tag);
        match tag {
            Some(tag) => {
                self.manifests.retain(|d| {
                    d.tag() != Some(tag) && !(d.tag().is_none() && d.digest == descriptor.digest)
                });
                self.manifests.push(descriptor);
            }
            None => {
                if !self.manifests.iter().any(|d| d.digest == descriptor.digest) {
                    self.manifests.push(descriptor);
                }
            }
        }
    }

    /// Remove a tag, returning the entry it pointed at.
    pub fn remove_tag(&mut self, tag: &str) -> Option<Descriptor> {
        let position = self.manifests.iter().position(|d| d.tag() == Some(tag))?;
        Some(self.manifests.remove(position))
    }

    /// Remove every entry for a digest, returning how many were removed.
    pub fn remove_digest(&mut self, digest: &Digest) -> usize {
        let before = self.manifests.len();
        self.manifests.retain(|d| &d.digest != digest);
        before - self.manifests.len()
    }
}
