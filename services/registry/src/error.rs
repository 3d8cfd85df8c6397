//! Error types for the registry

use camino::Utf8PathBuf;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors from assembling or running the registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The configuration file could not be parsed
    #[error("invalid configuration: {0}")]
    Config(#[from] toml_edit::de::Error),

    /// The configuration file could not be read
    #[error("reading configuration from {path}")]
    ConfigFile {
        /// Location of the configuration file
        path: Utf8PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Image store error
    #[error("storage error: {0}")]
    Store(#[from] imagestore::StoreError),

    /// Cache driver error
    #[error(transparent)]
    Cache(#[from] cache::CacheError),

    /// Scheduler error
    #[error("scheduler error: {0}")]
    Scheduler(#[from] scheduler::SchedulerError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
