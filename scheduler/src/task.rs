use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Scheduling priority. Higher priorities always run first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background maintenance, runs when nothing else is waiting.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// Runs ahead of everything else.
    High,
}

impl Priority {
    pub(crate) const LEVELS: usize = 3;

    /// Queue index, highest priority last.
    pub(crate) fn level(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => f.write_str("low"),
            Priority::Medium => f.write_str("medium"),
            Priority::High => f.write_str("high"),
        }
    }
}

/// A unit of deferred work.
#[async_trait::async_trait]
pub trait Task: fmt::Debug + Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Do the work. Long-running tasks should watch `cancel` and return
    /// early once it fires.
    async fn do_work(&self, cancel: &CancellationToken) -> eyre::Result<()>;
}

/// A type-erased task.
pub type BoxTask = Box<dyn Task>;

#[async_trait::async_trait]
impl<T> Task for Box<T>
where
    T: Task + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn do_work(&self, cancel: &CancellationToken) -> eyre::Result<()> {
        (**self).do_work(cancel).await
    }
}

/// Produces batches of tasks on a fixed interval.
///
/// For every batch the scheduler calls [`reset`](Generator::reset), then
/// [`next`](Generator::next) until it returns `None` or fails. A failed batch
/// is retried on the next interval. Once [`is_done`](Generator::is_done)
/// returns true the generator is dropped.
#[async_trait::async_trait]
pub trait Generator: fmt::Debug + Send {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// The next task of the current batch, or `None` when the batch is
    /// complete.
    async fn next(&mut self, cancel: &CancellationToken) -> eyre::Result<Option<BoxTask>>;

    /// Whether the generator will never produce tasks again.
    fn is_done(&self) -> bool {
        false
    }

    /// Prepare for a new batch.
    fn reset(&mut self) {}
}

/// A type-erased generator.
pub type BoxGenerator = Box<dyn Generator>;

#[async_trait::async_trait]
impl<G> Generator for Box<G>
where
    G: Generator + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn next(&mut self, cancel: &CancellationToken) -> eyre::Result<Option<BoxTask>> {
        (**self).next(cancel).await
    }

    fn is_done(&self) -> bool {
        (**self).is_done()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
