use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument};

use crate::error::SchedulerError;
use crate::queue::{QueuedTask, TaskQueue};
use crate::task::{BoxGenerator, Generator, Priority, Task};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of tasks run concurrently.
    pub num_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get() * 4,
        }
    }
}

/// Snapshot of scheduler activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks currently running.
    pub running: usize,
    /// Tasks that completed successfully.
    pub done: u64,
    /// Tasks that returned an error or panicked.
    pub failed: u64,
}

#[derive(Debug)]
struct GeneratorEntry {
    generator: BoxGenerator,
    interval: Duration,
    priority: Priority,
    next_run: Instant,
    /// Tasks from this generator still waiting in the queue.
    queued: Arc<AtomicUsize>,
}

#[derive(Debug)]
struct Inner {
    config: SchedulerConfig,
    dispatch: Dispatch,
    queue: TaskQueue,
    pending: parking_lot::Mutex<Vec<GeneratorEntry>>,
    submitted: tokio::sync::Notify,
    running: AtomicBool,
    active: AtomicUsize,
    done: AtomicU64,
    failed: AtomicU64,
}

/// Runs tasks on a fixed pool of workers, in priority order, and polls
/// generators for new tasks on their interval.
///
/// ```no_run
/// use std::time::Duration;
/// use scheduler::{Priority, Scheduler, SchedulerConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(generator: impl scheduler::Generator + 'static) -> Result<(), scheduler::SchedulerError> {
/// let scheduler = Scheduler::new(SchedulerConfig { num_workers: 4 })?;
/// scheduler.submit_generator(generator, Duration::from_secs(3600), Priority::Low)?;
///
/// let cancel = CancellationToken::new();
/// let handle = scheduler.spawn(cancel.clone());
/// // ...
/// cancel.cancel();
/// handle.await.expect("scheduler panicked")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl Scheduler {
    /// Create a scheduler that logs through the current default dispatcher.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);
        Self::with_dispatch(config, dispatch)
    }

    /// Create a scheduler whose workers and generator loop log through
    /// `dispatch`.
    pub fn with_dispatch(config: SchedulerConfig, dispatch: Dispatch) -> Result<Self, SchedulerError> {
        if config.num_workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "num_workers must be at least 1".to_owned(),
            ));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                dispatch,
                queue: TaskQueue::default(),
                pending: parking_lot::Mutex::new(Vec::new()),
                submitted: tokio::sync::Notify::new(),
                running: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                done: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register a generator. Its first batch is produced as soon as the
    /// scheduler runs, later ones every `interval`.
    ///
    /// A zero interval is rejected. Intervals too long to represent as a
    /// deadline run the generator once.
    pub fn submit_generator<G>(
        &self,
        generator: G,
        interval: Duration,
        priority: Priority,
    ) -> Result<(), SchedulerError>
    where
        G: Generator + 'static,
    {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(format!(
                "generator {} needs a non-zero interval",
                generator.name()
            )));
        }

        let entry = GeneratorEntry {
            generator: Box::new(generator),
            interval,
            priority,
            next_run: Instant::now(),
            queued: Arc::new(AtomicUsize::new(0)),
        };
        self.inner.pending.lock().push(entry);
        self.inner.submitted.notify_one();
        Ok(())
    }

    /// Queue a single task.
    pub fn submit_task<T>(&self, task: T, priority: Priority)
    where
        T: Task + 'static,
    {
        self.inner
            .queue
            .push(QueuedTask::new(Box::new(task), priority));
    }

    /// Current activity counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.inner.queue.len(),
            running: self.inner.active.load(Ordering::Acquire),
            done: self.inner.done.load(Ordering::Acquire),
            failed: self.inner.failed.load(Ordering::Acquire),
        }
    }

    /// Whether `run` is in progress.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Run workers and generators until `cancel` fires and every worker has
    /// exited. Running tasks see the same token and are expected to stop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.inner.running);

        let dispatch = self.inner.dispatch.clone();
        run_scheduler(self.inner.clone(), cancel)
            .with_subscriber(dispatch)
            .await;
        Ok(())
    }

    /// Run the scheduler on a background task.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<Result<(), SchedulerError>> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    }
}

async fn run_scheduler(inner: Arc<Inner>, cancel: CancellationToken) {
    let workers = inner.config.num_workers;
    tracing::info!(workers, "scheduler started");

    let mut pool = JoinSet::new();
    for id in 0..workers {
        let worker = run_worker(inner.clone(), id, cancel.clone());
        pool.spawn(worker.with_subscriber(inner.dispatch.clone()));
    }

    run_generators(&inner, &cancel).await;

    while let Some(result) = pool.join_next().await {
        if let Err(err) = result {
            tracing::error!(error = %err, "scheduler worker exited abnormally");
        }
    }
    tracing::info!("scheduler stopped");
}

async fn run_worker(inner: Arc<Inner>, id: usize, cancel: CancellationToken) {
    while let Some(item) = inner.queue.pop(&cancel).await {
        let span = tracing::info_span!(
            "task",
            worker = id,
            task = item.task.name(),
            priority = %item.priority
        );

        inner.active.fetch_add(1, Ordering::AcqRel);
        let result = AssertUnwindSafe(item.task.do_work(&cancel))
            .catch_unwind()
            .instrument(span.clone())
            .await;
        inner.active.fetch_sub(1, Ordering::AcqRel);

        span.in_scope(|| match result {
            Ok(Ok(())) => {
                inner.done.fetch_add(1, Ordering::AcqRel);
                tracing::debug!("task completed");
            }
            Ok(Err(err)) => {
                inner.failed.fetch_add(1, Ordering::AcqRel);
                tracing::error!(error = ?err, "task failed");
            }
            Err(panic) => {
                inner.failed.fetch_add(1, Ordering::AcqRel);
                tracing::error!(panic = panic_message(panic.as_ref()), "task panicked");
            }
        });
    }
    tracing::trace!(worker = id, "worker stopped");
}

// Roughly 30 years, the same horizon tokio uses for an unbounded sleep.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn next_deadline(now: Instant, interval: Duration) -> Instant {
    now.checked_add(interval)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

async fn run_generators(inner: &Inner, cancel: &CancellationToken) {
    let mut generators: Vec<GeneratorEntry> = Vec::new();

    loop {
        generators.append(&mut inner.pending.lock());

        let now = Instant::now();
        for entry in generators.iter_mut().filter(|e| e.next_run <= now) {
            if cancel.is_cancelled() {
                break;
            }
            run_batch(inner, entry, cancel).await;
            entry.next_run = next_deadline(now, entry.interval);
        }

        generators.retain(|entry| {
            let done = entry.generator.is_done();
            if done {
                tracing::debug!(generator = entry.generator.name(), "generator finished");
            }
            !done
        });

        let deadline = generators.iter().map(|e| e.next_run).min();
        let sleep = match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline),
            None => tokio::time::sleep(FAR_FUTURE),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = inner.submitted.notified() => {}
            _ = sleep => {}
        }
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(generator = entry.generator.name(), priority = %entry.priority))]
async fn run_batch(inner: &Inner, entry: &mut GeneratorEntry, cancel: &CancellationToken) {
    let waiting = entry.queued.load(Ordering::Acquire);
    if waiting > 0 {
        tracing::debug!(waiting, "previous batch still queued, skipping");
        return;
    }

    entry.generator.reset();
    let mut produced = 0usize;
    while !cancel.is_cancelled() {
        let next = AssertUnwindSafe(entry.generator.next(cancel))
            .catch_unwind()
            .await;
        match next {
            Ok(Ok(Some(task))) => {
                inner.queue.push(QueuedTask::from_batch(
                    task,
                    entry.priority,
                    entry.queued.clone(),
                ));
                produced += 1;
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                tracing::warn!(error = ?err, "generator failed, retrying next interval");
                break;
            }
            Err(panic) => {
                tracing::error!(panic = panic_message(panic.as_ref()), "generator panicked, retrying next interval");
                break;
            }
        }
    }
    tracing::debug!(produced, "generated batch");
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;
    use crate::task::BoxTask;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct Record {
        name: String,
        log: Log,
    }

    impl Record {
        fn new(name: impl Into<String>, log: &Log) -> Self {
            Self {
                name: name.into(),
                log: log.clone(),
            }
        }
    }

    #[async_trait::async_trait]
    impl Task for Record {
        fn name(&self) -> &str {
            &self.name
        }

        async fn do_work(&self, _cancel: &CancellationToken) -> eyre::Result<()> {
            self.log.lock().push(self.name.clone());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Fail;

    #[async_trait::async_trait]
    impl Task for Fail {
        async fn do_work(&self, _cancel: &CancellationToken) -> eyre::Result<()> {
            eyre::bail!("task failed on purpose")
        }
    }

    #[derive(Debug)]
    struct Panic;

    #[async_trait::async_trait]
    impl Task for Panic {
        async fn do_work(&self, _cancel: &CancellationToken) -> eyre::Result<()> {
            panic!("task panicked on purpose")
        }
    }

    /// Blocks its worker until cancelled.
    #[derive(Debug)]
    struct Block;

    #[async_trait::async_trait]
    impl Task for Block {
        async fn do_work(&self, cancel: &CancellationToken) -> eyre::Result<()> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    /// Yields `per_batch` tasks per batch, counting batches.
    #[derive(Debug)]
    struct Ticker {
        batches: Arc<AtomicUsize>,
        per_batch: usize,
        remaining: usize,
        max_batches: Option<usize>,
        log: Log,
    }

    impl Ticker {
        fn new(per_batch: usize, log: &Log) -> Self {
            Self {
                batches: Arc::new(AtomicUsize::new(0)),
                per_batch,
                remaining: 0,
                max_batches: None,
                log: log.clone(),
            }
        }
    }

    #[async_trait::async_trait]
    impl Generator for Ticker {
        async fn next(&mut self, _cancel: &CancellationToken) -> eyre::Result<Option<BoxTask>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Box::new(Record::new("tick", &self.log))))
        }

        fn is_done(&self) -> bool {
            self.max_batches
                .is_some_and(|max| self.batches.load(Ordering::Acquire) >= max)
        }

        fn reset(&mut self) {
            self.batches.fetch_add(1, Ordering::AcqRel);
            self.remaining = self.per_batch;
        }
    }

    fn scheduler(workers: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            num_workers: workers,
        })
        .unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn stop(cancel: CancellationToken, handle: JoinHandle<Result<(), SchedulerError>>) {
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop in time")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = Scheduler::new(SchedulerConfig { num_workers: 0 }).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[test]
    fn default_workers() {
        assert_eq!(SchedulerConfig::default().num_workers, num_cpus::get() * 4);
    }

    #[tokio::test]
    async fn high_priority_runs_first() {
        let log = Log::default();
        let scheduler = scheduler(1);
        scheduler.submit_task(Record::new("low", &log), Priority::Low);
        scheduler.submit_task(Record::new("medium", &log), Priority::Medium);
        scheduler.submit_task(Record::new("high-1", &log), Priority::High);
        scheduler.submit_task(Record::new("high-2", &log), Priority::High);

        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());
        wait_for(|| log.lock().len() == 4).await;
        stop(cancel, handle).await;

        assert_eq!(*log.lock(), vec!["high-1", "high-2", "medium", "low"]);
    }

    #[tokio::test]
    async fn failed_and_panicking_tasks_are_counted() {
        let log = Log::default();
        let scheduler = scheduler(1);
        scheduler.submit_task(Fail, Priority::High);
        scheduler.submit_task(Panic, Priority::High);
        scheduler.submit_task(Record::new("after", &log), Priority::Low);

        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());
        wait_for(|| scheduler.stats().done == 1).await;
        stop(cancel, handle).await;

        let stats = scheduler.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.done, 1);
        assert_eq!(stats.queued, 0);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let scheduler = scheduler(1);
        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());
        wait_for(|| scheduler.is_running()).await;

        let err = scheduler.run(cancel.clone()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning));

        stop(cancel, handle).await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn generator_recurs_on_interval() {
        let log = Log::default();
        let scheduler = scheduler(2);
        let ticker = Ticker::new(1, &log);
        let batches = ticker.batches.clone();
        scheduler
            .submit_generator(ticker, Duration::from_millis(20), Priority::Medium)
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(210)).await;
        stop(cancel, handle).await;

        assert!(batches.load(Ordering::Acquire) >= 5);
        assert!(log.lock().len() >= 5);
    }

    #[tokio::test]
    async fn no_tasks_start_after_cancellation() {
        let log = Log::default();
        let scheduler = scheduler(2);
        scheduler
            .submit_generator(Ticker::new(3, &log), Duration::from_millis(5), Priority::High)
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());
        wait_for(|| log.lock().len() >= 3).await;
        stop(cancel, handle).await;

        let after_stop = log.lock().len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.lock().len(), after_stop);
    }

    #[tokio::test]
    async fn done_generator_is_dropped() {
        let log = Log::default();
        let scheduler = scheduler(1);
        let mut ticker = Ticker::new(2, &log);
        ticker.max_batches = Some(1);
        let batches = ticker.batches.clone();
        scheduler
            .submit_generator(ticker, Duration::from_millis(5), Priority::Medium)
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());
        wait_for(|| log.lock().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop(cancel, handle).await;

        assert_eq!(batches.load(Ordering::Acquire), 1);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let log = Log::default();
        let scheduler = scheduler(1);
        let err = scheduler
            .submit_generator(Ticker::new(1, &log), Duration::ZERO, Priority::Low)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn unbounded_interval_runs_once() {
        let log = Log::default();
        let scheduler = scheduler(1);
        let ticker = Ticker::new(1, &log);
        let batches = ticker.batches.clone();
        scheduler
            .submit_generator(ticker, Duration::MAX, Priority::Medium)
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());
        wait_for(|| log.lock().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop(cancel, handle).await;

        assert_eq!(batches.load(Ordering::Acquire), 1);
    }

    #[test]
    fn deadline_saturates() {
        let now = Instant::now();
        assert_eq!(next_deadline(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert!(next_deadline(now, Duration::MAX) > now + Duration::from_secs(86_400 * 365));
    }

    #[tokio::test]
    async fn busy_generator_skips_batches() {
        let log = Log::default();
        let scheduler = scheduler(1);
        // Occupy the only worker so generated tasks stay queued.
        scheduler.submit_task(Block, Priority::High);

        let ticker = Ticker::new(1, &log);
        let batches = ticker.batches.clone();
        scheduler
            .submit_generator(ticker, Duration::from_millis(5), Priority::Low)
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());
        wait_for(|| scheduler.stats().running == 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(scheduler.stats().queued, 1);
        assert_eq!(batches.load(Ordering::Acquire), 1);
        stop(cancel, handle).await;
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn logs_through_explicit_dispatch() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();

        let scheduler =
            Scheduler::with_dispatch(SchedulerConfig { num_workers: 1 }, Dispatch::new(subscriber))
                .unwrap();
        scheduler.submit_task(Fail, Priority::Medium);

        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());
        wait_for(|| scheduler.stats().failed == 1).await;
        stop(cancel, handle).await;

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("scheduler started"), "{output}");
        assert!(output.contains("task failed"), "{output}");
        assert!(output.contains("scheduler stopped"), "{output}");
    }
}
