//! Optional background work run through the scheduler.

pub mod scanner;
pub mod scrub;

pub use scanner::{DbUpdateGenerator, DbUpdateTask, Scanner};
pub use scrub::{ScrubGenerator, ScrubTask, run_scrub_repo};
