//! Periodic refresh of the vulnerability scanner's database.
//!
//! Matching images against the database is not done here; the registry only
//! keeps the database fresh through whatever [`Scanner`] it is given.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use scheduler::{BoxTask, Generator, Task};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A vulnerability scanner with a database that needs refreshing.
#[async_trait::async_trait]
pub trait Scanner: fmt::Debug + Send + Sync {
    /// Download or rebuild the vulnerability database.
    async fn update_db(&self, cancel: &CancellationToken) -> eyre::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateState {
    /// An update should be queued on the next batch.
    Pending,
    /// An update is queued or running.
    Running,
    /// The last successful update started at this instant.
    Done(Instant),
}

// Polls per update interval, so an update starts close to when it is due.
const POLLS_PER_INTERVAL: u32 = 5;
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Runs a single database update.
#[derive(Debug)]
pub struct DbUpdateTask {
    scanner: Arc<dyn Scanner>,
    interval: Duration,
    state: Arc<Mutex<UpdateState>>,
    finished: AtomicBool,
}

#[async_trait::async_trait]
impl Task for DbUpdateTask {
    fn name(&self) -> &str {
        "scanner db update"
    }

    async fn do_work(&self, cancel: &CancellationToken) -> eyre::Result<()> {
        tracing::info!("updating scanner DB");
        let started = Instant::now();
        let result = self.scanner.update_db(cancel).await;
        self.finished.store(true, Ordering::Release);
        match result {
            Ok(()) => {
                *self.state.lock() = UpdateState::Done(started);
                tracing::info!(
                    interval = ?self.interval,
                    "DB update completed, next update scheduled"
                );
                Ok(())
            }
            Err(err) => {
                // Retried on the generator's next batch.
                *self.state.lock() = UpdateState::Pending;
                Err(err.wrap_err("updating scanner DB"))
            }
        }
    }
}

impl Drop for DbUpdateTask {
    fn drop(&mut self) {
        // A task that panicked or never ran leaves the update due again.
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        if *state == UpdateState::Running {
            *state = UpdateState::Pending;
        }
    }
}

/// Yields a [`DbUpdateTask`] once the previous update is older than the
/// update interval.
///
/// The generator can be polled more often than it updates; a failed update
/// is retried on the next poll.
#[derive(Debug)]
pub struct DbUpdateGenerator {
    scanner: Arc<dyn Scanner>,
    interval: Duration,
    state: Arc<Mutex<UpdateState>>,
}

impl DbUpdateGenerator {
    /// Create a generator refreshing `scanner` every `interval`.
    pub fn new(scanner: Arc<dyn Scanner>, interval: Duration) -> Self {
        Self {
            scanner,
            interval,
            state: Arc::new(Mutex::new(UpdateState::Pending)),
        }
    }

    /// How often the scheduler should poll this generator: a fraction of the
    /// update interval, capped at a minute.
    pub fn poll_interval(&self) -> Duration {
        (self.interval / POLLS_PER_INTERVAL).min(MAX_POLL_INTERVAL)
    }
}

#[async_trait::async_trait]
impl Generator for DbUpdateGenerator {
    fn name(&self) -> &str {
        "scanner db update"
    }

    async fn next(&mut self, _cancel: &CancellationToken) -> eyre::Result<Option<BoxTask>> {
        let mut state = self.state.lock();
        if *state != UpdateState::Pending {
            return Ok(None);
        }
        *state = UpdateState::Running;

        Ok(Some(Box::new(DbUpdateTask {
            scanner: self.scanner.clone(),
            interval: self.interval,
            state: self.state.clone(),
            finished: AtomicBool::new(false),
        })))
    }

    fn reset(&mut self) {
        let mut state = self.state.lock();
        if let UpdateState::Done(at) = *state {
            if at.elapsed() >= self.interval {
                *state = UpdateState::Pending;
            }
        }
    }
}
