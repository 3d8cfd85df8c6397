//! # Cache driver
//!
//! The dedupe bookkeeping interface used by the image store: a mapping from a
//! content digest to the ordered set of store locations holding that content.

mod driver;
mod error;

pub use driver::CacheDriver;
pub use driver::Claim;
pub use error::CacheError;
pub use error::CacheErrorBuilder;
pub use error::CacheErrorKind;
