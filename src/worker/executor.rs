use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::job::{ExecutionResult, JobStatus, WorkItem};
use crate::store::SharedStore;

/// Runs simulated jobs and reports their progress into the shared store.
///
/// A job with `cycles` terms sleeps `cycles` times for `step_delay`. After a
/// step the remaining count is written to the owner's progress hash, so the
/// field always shows the cycles left as of the last finished step. When the
/// job ends, either way, the field is deleted.
#[derive(Clone)]
pub struct TaskExecutor {
    store: Arc<dyn SharedStore>,
    step_delay: Duration,
    granularity: u32,
    progress_ttl: Option<Duration>,
}

impl TaskExecutor {
    pub fn new(store: Arc<dyn SharedStore>, step_delay: Duration) -> Self {
        Self {
            store,
            step_delay,
            granularity: 1,
            progress_ttl: None,
        }
    }

    /// Write progress only every `every` steps. The final step is always written.
    pub fn with_granularity(mut self, every: u32) -> Self {
        self.granularity = every.max(1);
        self
    }

    pub fn with_progress_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.progress_ttl = ttl;
        self
    }

    /// Execute one work item until it finishes or `cancel` fires.
    ///
    /// Cancellation is checked between steps and during the delay; it is
    /// reported as [`JobStatus::Cancelled`], never as an error. Errors only come
    /// from the store. A job aborted by a failed progress write still has its
    /// progress field removed, best effort, before the error is returned.
    pub async fn execute(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let progress_key = item.owner.progress_key();
        let field = item.progress_field();
        tracing::info!(
            job_id = %item.job_id,
            package = %item.package,
            cycles = item.cycles,
            "Job starting"
        );

        let mut remaining = item.cycles;
        let mut steps = 0u32;

        while remaining > 0 {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.step_delay) => {}
            }

            remaining -= 1;
            steps += 1;

            if steps % self.granularity == 0 || remaining == 0 {
                if let Err(e) = self
                    .store
                    .hset(&progress_key, &field, &remaining.to_string(), self.progress_ttl)
                    .await
                {
                    self.discard_progress(&progress_key, &field).await;
                    return Err(e);
                }
            }
            tracing::debug!(job_id = %item.job_id, step = steps, remaining, "Job step done");
        }

        let status = if remaining == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Cancelled
        };

        let removed = self.store.hdel(&progress_key, &field).await?;
        tracing::info!(
            job_id = %item.job_id,
            owner = %item.owner,
            status = %status,
            steps,
            remaining,
            progress_removed = removed,
            "Job finished"
        );

        Ok(ExecutionResult {
            job_id: item.job_id.clone(),
            package: item.package.clone(),
            status,
            steps_completed: steps,
            remaining,
        })
    }

    async fn discard_progress(&self, progress_key: &str, field: &str) {
        if let Err(e) = self.store.hdel(progress_key, field).await {
            tracing::warn!(
                key = %progress_key,
                field = %field,
                error = %e,
                "Could not remove progress of aborted job"
            );
        }
    }
}
