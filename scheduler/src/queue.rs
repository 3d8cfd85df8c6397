use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::task::{BoxTask, Priority};

/// A task waiting for a worker.
#[derive(Debug)]
pub(crate) struct QueuedTask {
    pub(crate) task: BoxTask,
    pub(crate) priority: Priority,
    /// Queued-task counter of the generator batch this task came from.
    pub(crate) batch: Option<Arc<AtomicUsize>>,
}

impl QueuedTask {
    pub(crate) fn new(task: BoxTask, priority: Priority) -> Self {
        Self {
            task,
            priority,
            batch: None,
        }
    }

    pub(crate) fn from_batch(task: BoxTask, priority: Priority, batch: Arc<AtomicUsize>) -> Self {
        batch.fetch_add(1, Ordering::AcqRel);
        Self {
            task,
            priority,
            batch: Some(batch),
        }
    }
}

/// One FIFO per priority level. Workers always take from the highest
/// non-empty level.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    levels: Mutex<[VecDeque<QueuedTask>; Priority::LEVELS]>,
    ready: Notify,
}

impl TaskQueue {
    pub(crate) fn push(&self, item: QueuedTask) {
        self.levels.lock()[item.priority.level()].push_back(item);
        self.ready.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<QueuedTask> {
        let item = self
            .levels
            .lock()
            .iter_mut()
            .rev()
            .find_map(VecDeque::pop_front)?;
        if let Some(batch) = &item.batch {
            batch.fetch_sub(1, Ordering::AcqRel);
        }
        Some(item)
    }

    /// Wait for the next task. Returns `None` once `cancel` fires, even if
    /// tasks are still queued.
    pub(crate) async fn pop(&self, cancel: &CancellationToken) -> Option<QueuedTask> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            // Register interest before looking, so a push between the check
            // and the wait is not missed.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.levels.lock().iter().map(VecDeque::len).sum()
    }
}
