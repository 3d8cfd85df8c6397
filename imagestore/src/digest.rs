//! Content digests, `algorithm:hex`.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;

const SHA256_LEN: usize = 64;
const SHA512_LEN: usize = 128;

/// Reasons a string is not a valid digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    /// Missing the `algorithm:` prefix.
    #[error("digest {0:?} is not of the form algorithm:hex")]
    Format(String),

    /// An algorithm other than sha256 or sha512.
    #[error("unsupported digest algorithm {0:?}")]
    Algorithm(String),

    /// The hex part has the wrong length for the algorithm.
    #[error("wrong {algorithm} hash length {actual}, expected {expected}")]
    Length {
        /// Algorithm name.
        algorithm: &'static str,
        /// Length found.
        actual: usize,
        /// Length required.
        expected: usize,
    },

    /// The hex part is not lower-case hexadecimal.
    #[error("hash {0:?} is not lower-case hex")]
    Encoding(String),
}

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256, the default for new content.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    /// Algorithm name as used in digests and paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => SHA256_LEN,
            Algorithm::Sha512 => SHA512_LEN,
        }
    }

    /// A fresh incremental hasher for this algorithm.
    pub fn digester(&self) -> Digester {
        match self {
            Algorithm::Sha256 => Digester::Sha256(sha2::Sha256::new()),
            Algorithm::Sha512 => Digester::Sha512(sha2::Sha512::new()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(DigestError::Algorithm(other.to_owned())),
        }
    }
}

/// A validated content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Build a digest from its parts, validating the hash.
    pub fn new(algorithm: Algorithm, hex: impl Into<String>) -> Result<Self, DigestError> {
        let hex = hex.into();
        if hex.len() != algorithm.hex_len() {
            return Err(DigestError::Length {
                algorithm: algorithm.as_str(),
                actual: hex.len(),
                expected: algorithm.hex_len(),
            });
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DigestError::Encoding(hex));
        }
        Ok(Self { algorithm, hex })
    }

    /// Digest of an in-memory buffer.
    pub fn from_bytes(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut digester = algorithm.digester();
        digester.update(data);
        digester.finalize()
    }

    /// SHA-256 digest of an in-memory buffer.
    pub fn sha256(data: &[u8]) -> Self {
        Self::from_bytes(Algorithm::Sha256, data)
    }

    /// The algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lower-case hex encoded hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Location relative to a repository directory: `blobs/<algorithm>/<hex>`.
    pub fn blob_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from("blobs")
            .join(self.algorithm.as_str())
            .join(&self.hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::Format(s.to_owned()))?;
        Digest::new(algorithm.parse()?, hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher producing a [`Digest`].
#[derive(Debug, Clone)]
pub enum Digester {
    /// SHA-256 state.
    Sha256(sha2::Sha256),
    /// SHA-512 state.
    Sha512(sha2::Sha512),
}

impl Digester {
    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Sha256(h) => h.update(data),
            Digester::Sha512(h) => h.update(data),
        }
    }

    /// Finish hashing.
    pub fn finalize(self) -> Digest {
        let (algorithm, hex) = match self {
            Digester::Sha256(h) => (Algorithm::Sha256, hex::encode(h.finalize())),
            Digester::Sha512(h) => (Algorithm::Sha512, hex::encode(h.finalize())),
        };
        Digest { algorithm, hex }
    }
}
