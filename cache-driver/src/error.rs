use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes cache errors by what the caller can do about them, independent
/// of the driver that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorKind {
    /// The backing database could not be reached, opened or locked.
    ///
    /// **Retryable:** Yes - the database may recover (e.g. a busy lock clears).
    /// **Caller action:** Continue without dedupe, or retry later.
    Unavailable,

    /// Reading or writing the backing file failed.
    ///
    /// **Retryable:** Maybe - depends on whether the I/O issue is transient.
    Io,

    /// The stored data could not be decoded (e.g. a non UTF-8 path).
    ///
    /// **Retryable:** No - the cache content is damaged.
    /// **Caller action:** Rebuild the cache, it is not the source of truth.
    Corrupt,

    /// The request was invalid (an empty digest, an unusable path, ...).
    ///
    /// **Retryable:** No - the request itself is invalid.
    InvalidRequest,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl CacheErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheErrorKind::Unavailable | CacheErrorKind::Io)
    }
}

impl fmt::Display for CacheErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheErrorKind::Unavailable => write!(f, "unavailable"),
            CacheErrorKind::Io => write!(f, "I/O error"),
            CacheErrorKind::Corrupt => write!(f, "corrupt data"),
            CacheErrorKind::InvalidRequest => write!(f, "invalid request"),
            CacheErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace, controlled by `RUST_BACKTRACE`.
    backtrace: Backtrace,

    /// Span context at the point where the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Cache error with the digest and location it concerns.
///
/// # Example
///
/// ```rust
/// use cache_driver::{CacheError, CacheErrorKind};
///
/// let error = CacheError::builder(
///     "sqlite",
///     CacheErrorKind::Unavailable,
///     std::io::Error::new(std::io::ErrorKind::Other, "database is locked"),
/// )
/// .digest("sha256:abc")
/// .path("library/alpine/blobs/sha256/abc")
/// .build();
///
/// assert!(error.is_retryable());
/// ```
#[derive(Debug)]
pub struct CacheError {
    kind: CacheErrorKind,
    engine: &'static str,
    digest: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for CacheError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl CacheError {
    /// Create a new cache error with the minimum required information.
    ///
    /// For more control, use `CacheError::builder()`.
    pub fn new<E>(engine: &'static str, kind: CacheErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            digest: None,
            path: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder for constructing a cache error with full context.
    pub fn builder<E>(engine: &'static str, kind: CacheErrorKind, error: E) -> CacheErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        CacheErrorBuilder {
            engine,
            kind,
            source: error.into(),
            digest: None,
            path: None,
            context: None,
        }
    }

    /// Returns a boxed closure that creates a cache error from a downstream error,
    /// for use with `.map_err()`.
    ///
    /// ```rust
    /// use cache_driver::{CacheError, CacheErrorKind};
    ///
    /// fn open() -> Result<std::fs::File, CacheError> {
    ///     std::fs::File::open("cache.db").map_err(CacheError::with("sqlite", CacheErrorKind::Io))
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: CacheErrorKind,
    ) -> Box<dyn FnOnce(E) -> CacheError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| CacheError::new(engine, kind, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> CacheErrorKind {
        self.kind
    }

    /// Returns the cache engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the digest, if available.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Returns the location, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cache error [{}] from {}", self.kind, self.engine)?;

        if let Some(digest) = &self.digest {
            write!(f, " (digest: {})", digest)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

impl From<eyre::Report> for CacheError {
    fn from(report: eyre::Report) -> Self {
        CacheError::new("unknown", CacheErrorKind::Other, report)
    }
}

/// Builder for constructing a [`CacheError`] with optional context fields.
#[derive(Debug)]
pub struct CacheErrorBuilder {
    kind: CacheErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    digest: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl CacheErrorBuilder {
    /// Set the digest.
    pub fn digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Set the location.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `CacheError`.
    pub fn build(self) -> CacheError {
        CacheError {
            kind: self.kind,
            engine: self.engine,
            digest: self.digest,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
