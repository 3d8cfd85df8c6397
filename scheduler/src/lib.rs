//! # Task scheduler
//!
//! A fixed pool of workers draining three priority queues, fed by one-off
//! task submissions and by generators that produce a batch of tasks on a
//! recurring interval.
//!
//! Tasks of a higher [`Priority`] always run before lower ones; tasks of
//! equal priority run in submission order. Cancelling the token passed to
//! [`Scheduler::run`] stops the generators, keeps queued tasks from
//! starting and asks running tasks to stop.

mod error;
mod queue;
mod scheduler;
mod task;

pub use error::SchedulerError;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use task::{BoxGenerator, BoxTask, Generator, Priority, Task};
