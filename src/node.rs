use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::BackServerConfig;
use crate::error::Result;
use crate::identity::{deregister_readiness, register_readiness, ServerIdentity};
use crate::scheduler::{CompletionTracker, ExchangeClaimer, ExecutionResult, WorkQueue};
use crate::store::SharedStore;
use crate::worker::{ScaleSignals, TaskExecutor, WorkerPool};

/// One back-server process: identity, queue, worker pool and claim loop.
pub struct BackServer {
    config: Arc<BackServerConfig>,
    store: Arc<dyn SharedStore>,
    identity: ServerIdentity,
    outcomes: Option<mpsc::UnboundedSender<ExecutionResult>>,
}

impl BackServer {
    pub fn new(config: BackServerConfig, store: Arc<dyn SharedStore>) -> Self {
        let identity = ServerIdentity::generate(&config.server_prefix);
        Self {
            config: Arc::new(config),
            store,
            identity,
            outcomes: None,
        }
    }

    /// Observe every job result produced by this server.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<ExecutionResult>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Run until `shutdown` fires.
    ///
    /// 1. Registers this server in the readiness directory
    /// 2. Spawns the worker pool supervisor (starts with no workers)
    /// 3. Spawns the external scale-signal listener
    /// 4. Runs the exchange claim loop, retrying store failures with back-off
    ///
    /// On shutdown the readiness entry is removed (best effort) and the call
    /// returns once every worker has stopped.
    ///
    /// # Errors
    ///
    /// Fails if the initial readiness registration fails or a loop hits a
    /// non-retryable error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.config.clone();
        config.validate()?;

        tracing::info!(
            server = %self.identity,
            exchange_key = %config.exchange_key,
            balance_ratio = config.balance_ratio,
            max_workers = config.max_workers_per_server,
            "Starting back-server"
        );
        register_readiness(self.store.as_ref(), &config, &self.identity).await?;

        let queue = Arc::new(WorkQueue::new());
        let executor = TaskExecutor::new(self.store.clone(), config.step_delay)
            .with_granularity(config.progress_granularity)
            .with_progress_ttl(config.progress_ttl);

        let mut pool = WorkerPool::new(queue.clone(), executor, shutdown.clone())
            .with_error_backoff(config.retry_backoff_min);
        if let Some(tx) = self.outcomes.clone() {
            pool = pool.with_outcomes(tx);
        }
        let (pool_handle, pool_task) = pool.spawn();

        let tracker = CompletionTracker::new(
            self.store.clone(),
            self.identity.clone(),
            pool_handle.clone(),
            config.completion_poll_interval,
            shutdown.clone(),
        )
        .with_ttl(config.progress_ttl);

        let signals = ScaleSignals::new(
            self.store.clone(),
            &config,
            &self.identity,
            pool_handle.clone(),
        );
        let signals_shutdown = shutdown.clone();
        let signals_config = config.clone();
        let signals_task = tokio::spawn(async move {
            supervise("scale signals", &signals_shutdown, &signals_config, || {
                signals.run(&signals_shutdown)
            })
            .await
        });

        let claimer = ExchangeClaimer::new(
            self.store.clone(),
            config.clone(),
            self.identity.clone(),
            queue,
            pool_handle,
        )
        .with_completion_tracker(tracker);

        let claim_result =
            supervise("exchange claim", &shutdown, &config, || claimer.run(&shutdown)).await;

        // A fatal claim error still takes the whole server down cleanly.
        shutdown.cancel();
        deregister_readiness(self.store.as_ref(), &config, &self.identity).await;

        match signals_task.await {
            Ok(Err(e)) => tracing::error!(error = %e, "Scale signal listener failed"),
            Err(e) => tracing::error!(error = %e, "Scale signal task panicked"),
            Ok(Ok(())) => {}
        }
        if let Err(e) = pool_task.await {
            tracing::error!(error = %e, "Worker pool supervisor panicked");
        }

        tracing::info!(server = %self.identity, "Back-server stopped");
        claim_result
    }
}

/// Keep a subscription loop alive across retryable store failures.
///
/// Back-off doubles from `retry_backoff_min` up to `retry_backoff_max` and is
/// cut short by shutdown.
async fn supervise<F, Fut>(
    name: &'static str,
    shutdown: &CancellationToken,
    config: &BackServerConfig,
    mut run: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut backoff = config.retry_backoff_min;
    loop {
        match run().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    task = name,
                    error = %e,
                    retry_in = ?backoff,
                    "Shared store unavailable, retrying"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = next_backoff(backoff, config.retry_backoff_max);
            }
            Err(e) => {
                tracing::error!(task = name, error = %e, "Fatal error");
                return Err(e);
            }
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
