/// Errors from creating or running a [`Scheduler`](crate::Scheduler).
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The configuration cannot be used.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// `run` was called while the scheduler was already running.
    #[error("scheduler is already running")]
    AlreadyRunning,
}
