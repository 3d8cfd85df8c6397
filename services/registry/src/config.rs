//! Registry configuration, as read from a TOML file.

use std::time::Duration;

use cache::CacheConfig;
use camino::{Utf8Path, Utf8PathBuf};
use imagestore::ScrubMode;
use scheduler::SchedulerConfig;
use serde::Deserialize;

use crate::error::{RegistryError, RegistryResult};

/// Top-level registry configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where and how content is stored.
    pub storage: StorageConfig,
    /// Worker pool settings.
    pub scheduler: SchedulerConfig,
    /// Optional background work.
    pub extensions: ExtensionsConfig,
    /// Log output settings, used by the server binary.
    pub log: LogConfig,
}

impl Config {
    /// Parse a configuration document.
    pub fn from_toml(document: &str) -> RegistryResult<Self> {
        Ok(toml_edit::de::from_str(document)?)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Utf8Path) -> RegistryResult<Self> {
        let document =
            std::fs::read_to_string(path).map_err(|source| RegistryError::ConfigFile {
                path: path.to_owned(),
                source,
            })?;
        Self::from_toml(&document)
    }
}

/// Image store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding every repository.
    pub root_directory: Utf8PathBuf,
    /// Hard-link identical blobs across repositories.
    pub dedupe: bool,
    /// Flush writes to disk before they become visible.
    pub commit: bool,
    /// Dedupe cache. Defaults to an SQLite database in the root directory
    /// when dedupe is enabled.
    pub cache: Option<CacheConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_directory: Utf8PathBuf::from("/var/lib/registry"),
            dedupe: true,
            commit: false,
            cache: None,
        }
    }
}

impl StorageConfig {
    /// The cache driver to build for this store.
    pub fn cache_config(&self) -> CacheConfig {
        match (&self.cache, self.dedupe) {
            (_, false) => CacheConfig::Null,
            (Some(cache), true) => cache.clone(),
            (None, true) => CacheConfig::Sqlite {
                path: self.root_directory.join("cache.db"),
            },
        }
    }
}

/// Background extensions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Periodic integrity checks.
    pub scrub: ScrubConfig,
    /// Periodic vulnerability database refresh.
    pub scanner: ScannerConfig,
}

/// Scrub extension settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrubConfig {
    /// Register the scrub generator.
    pub enable: bool,
    /// Time between sweeps over every repository.
    #[serde(deserialize_with = "duration::deserialize")]
    pub interval: Duration,
    /// How thoroughly blobs are checked.
    pub mode: ScrubMode,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            enable: false,
            interval: Duration::from_secs(24 * 60 * 60),
            mode: ScrubMode::default(),
        }
    }
}

/// Scanner database refresh settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Register the database refresh generator.
    pub enable: bool,
    /// Time between database refreshes.
    #[serde(deserialize_with = "duration::deserialize")]
    pub update_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enable: false,
            update_interval: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

/// Durations written as a positive integer with a unit suffix: `ms`, `s`,
/// `m`, `h` or `d`, of at most [`MAX`](duration::MAX).
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, de};

    /// Longest accepted duration, 100 years.
    pub const MAX: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

    /// Parse a duration such as `1500ms` or `24h`.
    pub fn parse(value: &str) -> Result<Duration, String> {
        let duration = parse_unbounded(value)?;
        if duration.is_zero() {
            return Err(format!("duration {value:?} must be greater than zero"));
        }
        if duration > MAX {
            return Err(format!("duration {value:?} is too large"));
        }
        Ok(duration)
    }

    fn parse_unbounded(value: &str) -> Result<Duration, String> {
        let value = value.trim();
        let split = value
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration {value:?} is missing a unit"))?;
        let (amount, unit) = value.split_at(split);
        let amount: u64 = amount
            .parse()
            .map_err(|_| format!("duration {value:?} does not start with a number"))?;

        let seconds = match unit {
            "ms" => return Ok(Duration::from_millis(amount)),
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            _ => return Err(format!("unknown duration unit {unit:?} in {value:?}")),
        };
        amount
            .checked_mul(seconds)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {value:?} is too large"))
    }

    /// Deserialize a duration string.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        parse(&value).map_err(de::Error::custom)
    }
}
