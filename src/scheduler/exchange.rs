use std::sync::Arc;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::BackServerConfig;
use crate::error::{BackServerError, Result};
use crate::identity::ServerIdentity;
use crate::scheduler::job::{parse_assignment_terms, WorkItem};
use crate::scheduler::progress::{CompletionTracker, PackageProgress};
use crate::scheduler::queue::WorkQueue;
use crate::store::{KeyCommand, SharedStore};
use crate::worker::pool::{compute_workers, WorkerPoolHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// Subscribed and waiting for a notification.
    Idle,
    /// Racing other servers for exchange entries.
    Draining,
}

/// Shared, inspectable Idle/Draining latch.
///
/// Moving to `Draining` is a compare-and-set, so at most one drain cycle runs
/// per server and notifications that arrive meanwhile are ignored.
#[derive(Debug, Clone)]
pub struct ClaimStateHandle {
    state: Arc<watch::Sender<ClaimState>>,
}

impl Default for ClaimStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaimStateHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ClaimState::Idle);
        Self { state: Arc::new(tx) }
    }

    pub fn current(&self) -> ClaimState {
        *self.state.borrow()
    }

    /// `Idle -> Draining`. Returns false when a drain is already running.
    pub fn try_begin_drain(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ClaimState::Idle {
                *state = ClaimState::Draining;
                true
            } else {
                false
            }
        })
    }

    /// `Draining -> Idle`, releasing the latch.
    pub fn finish_drain(&self) {
        self.state.send_replace(ClaimState::Idle);
    }
}

/// Releases the latch however the drain ends, including on abort.
struct DrainGuard<'a>(&'a ClaimStateHandle);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.finish_drain();
    }
}

/// Pick which listed entry to try.
///
/// Uniform over `[0, len)`. With a single entry the generator is not touched.
pub fn choose_index<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Option<usize> {
    match len {
        0 => None,
        1 => Some(0),
        n => Some(rng.gen_range(0..n)),
    }
}

/// A package this server won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedPackage {
    /// Exchange field that was removed.
    pub token: String,
    /// Key of the package hash.
    pub package: String,
    pub jobs_enqueued: usize,
    pub jobs_skipped: usize,
    pub workers_requested: usize,
}

enum ClaimAttempt {
    Drained,
    Lost,
    Won(ClaimedPackage),
}

/// Competing-consumers claim protocol over the shared exchange hash.
///
/// Every server subscribes to the exchange key. A hash-set notification starts
/// a drain cycle that keeps listing the exchange, picking one entry at random
/// and trying to delete it. The store guarantees a single successful delete per
/// entry; the winner records ownership, loads the package, feeds its jobs into
/// the local [`WorkQueue`] and asks the worker pool for more workers.
#[derive(Clone)]
pub struct ExchangeClaimer {
    store: Arc<dyn SharedStore>,
    config: Arc<BackServerConfig>,
    identity: ServerIdentity,
    queue: Arc<WorkQueue>,
    pool: WorkerPoolHandle,
    state: ClaimStateHandle,
    tracker: Option<CompletionTracker>,
}

impl ExchangeClaimer {
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: Arc<BackServerConfig>,
        identity: ServerIdentity,
        queue: Arc<WorkQueue>,
        pool: WorkerPoolHandle,
    ) -> Self {
        Self {
            store,
            config,
            identity,
            queue,
            pool,
            state: ClaimStateHandle::new(),
            tracker: None,
        }
    }

    /// Monitor each claimed package until all its jobs are gone.
    pub fn with_completion_tracker(mut self, tracker: CompletionTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn state(&self) -> &ClaimStateHandle {
        &self.state
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Subscribe to the exchange and claim packages until `cancel` fires.
    ///
    /// One drain runs right after subscribing, so entries published earlier are
    /// not missed. Store failures end the loop with an error; the caller owns
    /// the retry policy.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let key = self.config.exchange_key.clone();
        let mut events = self.store.subscribe(&key).await?;
        tracing::info!(server = %self.identity, key = %key, "Subscribed to exchange");

        let mut drains: JoinSet<Result<Vec<ClaimedPackage>>> = JoinSet::new();
        self.start_drain(&mut drains, cancel);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => {
                    let Some(event) = event else {
                        return Err(BackServerError::SubscriptionClosed(key));
                    };
                    if event.command != KeyCommand::HashSet {
                        tracing::trace!(key = %key, command = %event.command, "Exchange event ignored");
                        continue;
                    }
                    tracing::debug!(key = %key, command = %event.command, "Exchange notification received");
                    self.start_drain(&mut drains, cancel);
                }
                Some(joined) = drains.join_next(), if !drains.is_empty() => {
                    match joined {
                        Ok(Ok(claimed)) => {
                            tracing::info!(
                                server = %self.identity,
                                claimed = claimed.len(),
                                "Drain cycle finished, waiting for the next notification"
                            );
                        }
                        Ok(Err(e)) => return Err(e),
                        Err(e) => return Err(BackServerError::Internal(format!("drain task failed: {}", e))),
                    }
                }
            }
        }

        drains.shutdown().await;
        Ok(())
    }

    fn start_drain(
        &self,
        drains: &mut JoinSet<Result<Vec<ClaimedPackage>>>,
        cancel: &CancellationToken,
    ) {
        if !self.state.try_begin_drain() {
            tracing::debug!(server = %self.identity, "Already draining, notification ignored");
            return;
        }
        let this = self.clone();
        let cancel = cancel.clone();
        drains.spawn(async move { this.drain_started(&cancel).await });
    }

    /// Run one drain cycle now, unless one is already in progress (`None`).
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<Option<Vec<ClaimedPackage>>> {
        if !self.state.try_begin_drain() {
            return Ok(None);
        }
        self.drain_started(cancel).await.map(Some)
    }

    /// Drain with the latch already held.
    async fn drain_started(&self, cancel: &CancellationToken) -> Result<Vec<ClaimedPackage>> {
        let mut claimed = Vec::new();
        loop {
            {
                let _guard = DrainGuard(&self.state);
                self.drain_until_empty(cancel, &mut claimed).await?;
            }

            // Entries published between our last read and the release would
            // otherwise wait for the next notification.
            if cancel.is_cancelled() || !self.store.exists(&self.config.exchange_key).await? {
                break;
            }
            if !self.state.try_begin_drain() {
                break;
            }
            tracing::debug!(server = %self.identity, "Exchange refilled while releasing, draining again");
        }
        Ok(claimed)
    }

    async fn drain_until_empty(
        &self,
        cancel: &CancellationToken,
        claimed: &mut Vec<ClaimedPackage>,
    ) -> Result<()> {
        tracing::debug!(server = %self.identity, "Drain cycle started");
        while !cancel.is_cancelled() {
            match self.try_claim_once().await? {
                ClaimAttempt::Drained => break,
                ClaimAttempt::Lost => continue,
                ClaimAttempt::Won(package) => claimed.push(package),
            }
        }
        Ok(())
    }

    async fn try_claim_once(&self) -> Result<ClaimAttempt> {
        let key = &self.config.exchange_key;

        if !self.store.exists(key).await? {
            tracing::debug!(server = %self.identity, "Exchange key gone, nothing left to claim");
            return Ok(ClaimAttempt::Drained);
        }

        let mut entries = self.store.hgetall(key).await?;
        let candidates = entries.len();
        let picked = {
            let mut rng = rand::thread_rng();
            choose_index(candidates, &mut rng)
        };
        let Some(index) = picked else {
            tracing::debug!(server = %self.identity, "Exchange empty");
            return Ok(ClaimAttempt::Drained);
        };
        let (token, package) = entries.swap_remove(index);

        tracing::debug!(server = %self.identity, token = %token, candidates, "Attempting claim");
        if !self.store.hdel(key, &token).await? {
            tracing::debug!(server = %self.identity, token = %token, "Claim lost to another server");
            return Ok(ClaimAttempt::Lost);
        }
        tracing::info!(server = %self.identity, token = %token, package = %package, "Claim won");

        let taken = match self.register_ownership(&token, &package).await {
            Ok(()) => self.fan_out(&token, &package).await,
            Err(e) => Err(e),
        };
        match taken {
            Ok(claimed) => Ok(ClaimAttempt::Won(claimed)),
            Err(e) => {
                self.release_claim(&token, &package).await;
                Err(e)
            }
        }
    }

    /// Give a won entry back to the exchange after the take-over failed, so
    /// any server can claim it again. Best effort.
    async fn release_claim(&self, token: &str, package: &str) {
        if let Err(e) = self
            .store
            .hset(&self.config.exchange_key, token, package, None)
            .await
        {
            tracing::error!(
                server = %self.identity,
                token = %token,
                package = %package,
                error = %e,
                "Package lost: could not return it to the exchange"
            );
            return;
        }
        tracing::warn!(server = %self.identity, token = %token, package = %package, "Claim returned to the exchange");

        let ownership = [
            (self.config.ownership_audit_key.clone(), token),
            (self.identity.packages_key(), token),
        ];
        for (key, field) in ownership {
            if let Err(e) = self.store.hdel(&key, field).await {
                tracing::warn!(key = %key, token = %token, error = %e, "Could not clear ownership record");
            }
        }
    }

    /// Audit records only; nothing in this crate reads them back.
    async fn register_ownership(&self, token: &str, package: &str) -> Result<()> {
        let ttl = self.config.ownership_ttl;
        self.store
            .hset(
                &self.config.ownership_audit_key,
                token,
                self.identity.as_str(),
                ttl,
            )
            .await?;
        self.store
            .hset(&self.identity.packages_key(), token, package, ttl)
            .await?;
        tracing::debug!(
            server = %self.identity,
            token = %token,
            package = %package,
            audit_key = %self.config.ownership_audit_key,
            "Ownership registered"
        );
        Ok(())
    }

    /// Load the package in one read and push its jobs to the queue in order.
    ///
    /// Progress for every job is written and workers are requested before
    /// anything is queued, so a store failure never leaves queued jobs behind.
    async fn fan_out(&self, token: &str, package: &str) -> Result<ClaimedPackage> {
        let jobs = self.store.hgetall(package).await?;
        let mut accepted = Vec::with_capacity(jobs.len());
        let mut skipped = 0;

        for (index, (job_id, raw_terms)) in jobs.into_iter().enumerate() {
            let Some(cycles) = parse_assignment_terms(&raw_terms) else {
                tracing::warn!(
                    package = %package,
                    job_id = %job_id,
                    terms = %raw_terms,
                    "Skipping job with unreadable assignment terms"
                );
                skipped += 1;
                continue;
            };
            accepted.push(WorkItem::new(
                job_id,
                self.identity.clone(),
                package,
                cycles,
                index,
            ));
        }

        self.seed_progress(&accepted).await?;

        let workers = if accepted.is_empty() {
            0
        } else {
            compute_workers(
                accepted.len(),
                self.config.balance_ratio,
                self.config.max_workers_per_server,
            )
        };
        if workers > 0 {
            if let Err(e) = self.pool.request_add(workers) {
                self.discard_progress(&accepted).await;
                return Err(e);
            }
        }

        let jobs: Vec<(String, u32)> = accepted
            .iter()
            .map(|item| (item.job_id.clone(), item.cycles))
            .collect();
        let enqueued = accepted.len();
        for item in accepted {
            self.queue.enqueue(item);
        }

        tracing::info!(
            server = %self.identity,
            token = %token,
            package = %package,
            enqueued,
            skipped,
            workers,
            "Package sent to queue"
        );

        if let Some(tracker) = &self.tracker {
            tracker.track(PackageProgress {
                token: token.to_string(),
                package: package.to_string(),
                jobs,
                workers,
            });
        }

        Ok(ClaimedPackage {
            token: token.to_string(),
            package: package.to_string(),
            jobs_enqueued: enqueued,
            jobs_skipped: skipped,
            workers_requested: workers,
        })
    }

    /// Write the initial progress of every job. On failure the fields written
    /// so far are removed again.
    async fn seed_progress(&self, items: &[WorkItem]) -> Result<()> {
        let progress_key = self.identity.progress_key();
        for (seeded, item) in items.iter().enumerate() {
            if let Err(e) = self
                .store
                .hset(
                    &progress_key,
                    &item.progress_field(),
                    &item.cycles.to_string(),
                    self.config.progress_ttl,
                )
                .await
            {
                self.discard_progress(&items[..seeded]).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn discard_progress(&self, items: &[WorkItem]) {
        let progress_key = self.identity.progress_key();
        for item in items {
            if let Err(e) = self.store.hdel(&progress_key, &item.progress_field()).await {
                tracing::warn!(job_id = %item.job_id, error = %e, "Could not remove progress of unqueued job");
            }
        }
    }
}
