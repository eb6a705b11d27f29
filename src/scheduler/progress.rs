use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::identity::ServerIdentity;
use crate::scheduler::job::{parse_assignment_terms, progress_field};
use crate::store::SharedStore;
use crate::worker::pool::WorkerPoolHandle;

/// What the claim protocol hands over for every package it enqueued.
#[derive(Debug, Clone)]
pub struct PackageProgress {
    pub token: String,
    pub package: String,
    /// Job id and initial cycle count, for jobs that were actually enqueued.
    pub jobs: Vec<(String, u32)>,
    /// Workers started for this package, stopped again once it is complete.
    pub workers: usize,
}

impl PackageProgress {
    pub fn total_cycles(&self) -> u64 {
        self.jobs.iter().map(|(_, cycles)| u64::from(*cycles)).sum()
    }
}

/// Cycle-weighted completion, 0..=100. A package without work is complete.
pub fn completion_percent(total: u64, remaining: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = total.saturating_sub(remaining);
    ((done * 100) / total) as u8
}

/// Watches claimed packages and publishes how far along they are.
///
/// Each package gets a monitor that polls the owner's progress hash. A job
/// whose field is gone is finished (completed or cancelled). The percentage is
/// written to the server's completion hash under the claim token; at 100% the
/// workers started for the package are released.
#[derive(Clone)]
pub struct CompletionTracker {
    store: Arc<dyn SharedStore>,
    identity: ServerIdentity,
    pool: WorkerPoolHandle,
    poll_interval: Duration,
    ttl: Option<Duration>,
    shutdown: CancellationToken,
}

impl CompletionTracker {
    pub fn new(
        store: Arc<dyn SharedStore>,
        identity: ServerIdentity,
        pool: WorkerPoolHandle,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            identity,
            pool,
            poll_interval,
            ttl: None,
            shutdown,
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn track(&self, progress: PackageProgress) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.monitor(progress).await })
    }

    /// One reading of the package's completion percentage.
    pub async fn measure(&self, progress: &PackageProgress) -> Result<u8> {
        let live: HashMap<String, String> = self
            .store
            .hgetall(&self.identity.progress_key())
            .await?
            .into_iter()
            .collect();

        let remaining: u64 = progress
            .jobs
            .iter()
            .filter_map(|(job_id, initial)| {
                live.get(&progress_field(&progress.package, job_id)).map(|raw| {
                    // An unreadable value counts as untouched.
                    u64::from(parse_assignment_terms(raw).unwrap_or(*initial).min(*initial))
                })
            })
            .sum();

        Ok(completion_percent(progress.total_cycles(), remaining))
    }

    async fn monitor(self, progress: PackageProgress) {
        let completion_key = self.identity.completion_key();
        let mut interval = tokio::time::interval(self.poll_interval);
        let mut last: Option<u8> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let percent = match self.measure(&progress).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(token = %progress.token, error = %e, "Failed to read package progress");
                    continue;
                }
            };

            if last != Some(percent) {
                if let Err(e) = self
                    .store
                    .hset(&completion_key, &progress.token, &percent.to_string(), self.ttl)
                    .await
                {
                    tracing::warn!(token = %progress.token, error = %e, "Failed to publish package completion");
                    continue;
                }
                tracing::debug!(token = %progress.token, percent, "Package progress");
                last = Some(percent);
            }

            if percent == 100 {
                break;
            }
        }

        tracing::info!(
            server = %self.identity,
            token = %progress.token,
            package = %progress.package,
            jobs = progress.jobs.len(),
            "Package completed"
        );

        if progress.workers > 0 {
            if let Err(e) = self.pool.request_cancel(progress.workers) {
                tracing::debug!(error = %e, "Worker pool already stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_cycle_weighted() {
        assert_eq!(completion_percent(10, 10), 0);
        assert_eq!(completion_percent(10, 5), 50);
        assert_eq!(completion_percent(3, 1), 66);
        assert_eq!(completion_percent(10, 0), 100);
    }

    #[test]
    fn empty_package_is_complete() {
        assert_eq!(completion_percent(0, 0), 100);
    }

    #[test]
    fn total_cycles_sums_jobs() {
        let progress = PackageProgress {
            token: "t".into(),
            package: "p".into(),
            jobs: vec![("a".into(), 3), ("b".into(), 4)],
            workers: 1,
        };
        assert_eq!(progress.total_cycles(), 7);
    }
}
