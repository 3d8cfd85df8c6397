//! Periodic integrity checks of every repository.

use std::collections::VecDeque;
use std::sync::Arc;

use imagestore::{ImageStore, ScrubMode, ScrubResult, ScrubStatus, StoreResult};
use scheduler::{BoxTask, Generator, Task};
use tokio_util::sync::CancellationToken;

/// Check one repository and log the outcome for every tag.
///
/// Problems with individual tags are reported in the results; an error is
/// returned only when the repository itself could not be checked.
pub async fn run_scrub_repo<S>(
    cancel: &CancellationToken,
    store: &S,
    repo: &str,
    mode: ScrubMode,
) -> StoreResult<Vec<ScrubResult>>
where
    S: ImageStore + ?Sized,
{
    let location = store.root_dir().join(repo);
    tracing::info!("executing scrub to check manifest/blob integrity for {location}");

    let results = match store.check_repo(cancel, repo, mode).await {
        Ok(results) => results,
        Err(err) => {
            tracing::error!(error = %err, "error while running scrub for {location}");
            tracing::info!("scrub unsuccessfully completed for {location}");
            return Err(err);
        }
    };

    for result in &results {
        match result.status {
            ScrubStatus::Ok => tracing::info!(
                image = %result.repo,
                tag = %result.tag,
                status = %result.status,
                "scrub: blobs/manifest ok"
            ),
            ScrubStatus::Affected => tracing::warn!(
                image = %result.repo,
                tag = %result.tag,
                status = %result.status,
                affected_blob = result.affected_blob.as_ref().map(tracing::field::display),
                error = result.error.as_deref(),
                "scrub: blobs/manifest affected"
            ),
        }
    }

    tracing::info!("scrub successfully completed for {location}");
    Ok(results)
}

/// Scrub a single repository.
#[derive(Debug)]
pub struct ScrubTask {
    store: Arc<dyn ImageStore>,
    repo: String,
    mode: ScrubMode,
    name: String,
}

impl ScrubTask {
    /// Create a task checking `repo`.
    pub fn new(store: Arc<dyn ImageStore>, repo: impl Into<String>, mode: ScrubMode) -> Self {
        let repo = repo.into();
        Self {
            name: format!("scrub {repo}"),
            store,
            repo,
            mode,
        }
    }

    /// Repository this task checks.
    pub fn repo(&self) -> &str {
        &self.repo
    }
}

#[async_trait::async_trait]
impl Task for ScrubTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn do_work(&self, cancel: &CancellationToken) -> eyre::Result<()> {
        run_scrub_repo(cancel, self.store.as_ref(), &self.repo, self.mode).await?;
        Ok(())
    }
}

/// Yields one [`ScrubTask`] per repository on every sweep.
///
/// Repositories are listed when a sweep starts, so repositories created
/// during a sweep are picked up by the next one.
#[derive(Debug)]
pub struct ScrubGenerator {
    store: Arc<dyn ImageStore>,
    mode: ScrubMode,
    pending: Option<VecDeque<String>>,
}

impl ScrubGenerator {
    /// Create a generator over every repository in `store`.
    pub fn new(store: Arc<dyn ImageStore>, mode: ScrubMode) -> Self {
        Self {
            store,
            mode,
            pending: None,
        }
    }
}

#[async_trait::async_trait]
impl Generator for ScrubGenerator {
    fn name(&self) -> &str {
        "scrub"
    }

    async fn next(&mut self, _cancel: &CancellationToken) -> eyre::Result<Option<BoxTask>> {
        if self.pending.is_none() {
            let repos = self.store.list_repos().await?;
            tracing::debug!(repos = repos.len(), "starting scrub sweep");
            self.pending = Some(repos.into());
        }

        let next = self.pending.as_mut().and_then(VecDeque::pop_front);
        Ok(next.map(|repo| Box::new(ScrubTask::new(self.store.clone(), repo, self.mode)) as BoxTask))
    }

    fn reset(&mut self) {
        self.pending = None;
    }
}
