use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{BackServerError, Result};
use crate::scheduler::job::ExecutionResult;
use crate::scheduler::queue::WorkQueue;
use crate::worker::executor::TaskExecutor;

/// Number of workers to start for a freshly claimed package of `jobs` jobs.
///
/// - `ratio == 0`: one worker per job
/// - `ratio > 0`: `jobs / ratio`, at least 1, capped by `max_workers` when it is positive
/// - `ratio < 0`: exactly `-ratio` workers whatever the package size
pub fn compute_workers(jobs: usize, ratio: i32, max_workers: i32) -> usize {
    match ratio {
        0 => jobs,
        r if r > 0 => {
            let mut count = (jobs / r as usize).max(1);
            if max_workers > 0 {
                count = count.min(max_workers as usize);
            }
            count
        }
        r => r.unsigned_abs() as usize,
    }
}

#[derive(Debug)]
enum PoolCommand {
    Add(usize),
    Cancel(usize),
}

/// Cheap handle used to resize a running [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolHandle {
    commands: mpsc::UnboundedSender<PoolCommand>,
    size: watch::Receiver<usize>,
}

impl WorkerPoolHandle {
    /// Start `n` more consumer loops.
    pub fn request_add(&self, n: usize) -> Result<()> {
        self.send(PoolCommand::Add(n))
    }

    /// Stop `n` consumer loops. A stopped loop finishes its current job first.
    pub fn request_cancel(&self, n: usize) -> Result<()> {
        self.send(PoolCommand::Cancel(n))
    }

    /// Number of live consumer loops as last published by the pool.
    pub fn size(&self) -> usize {
        *self.size.borrow()
    }

    /// Wait until the pool reports exactly `n` live workers.
    pub async fn wait_for_size(&self, n: usize) -> Result<()> {
        let mut rx = self.size.clone();
        rx.wait_for(|size| *size == n)
            .await
            .map(|_| ())
            .map_err(|_| BackServerError::Internal("worker pool stopped".to_string()))
    }

    fn send(&self, command: PoolCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| BackServerError::Internal("worker pool stopped".to_string()))
    }
}

struct WorkerSlot {
    id: u64,
    token: CancellationToken,
}

/// Supervisor owning the set of consumer loops that drain the [`WorkQueue`].
///
/// Only the supervisor task touches the live set; everyone else talks to it
/// through a [`WorkerPoolHandle`]. Each loop has its own cancellation token,
/// a child of the process shutdown token:
///
/// - cancelling one loop stops it from dequeuing again, but its current job runs on
/// - process shutdown also cancels in-flight jobs, which then report `Cancelled`
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    executor: TaskExecutor,
    shutdown: CancellationToken,
    outcomes: Option<mpsc::UnboundedSender<ExecutionResult>>,
    error_backoff: Duration,
    live: Vec<WorkerSlot>,
    tasks: JoinSet<()>,
    next_id: u64,
    size_tx: watch::Sender<usize>,
}

impl WorkerPool {
    pub fn new(queue: Arc<WorkQueue>, executor: TaskExecutor, shutdown: CancellationToken) -> Self {
        let (size_tx, _) = watch::channel(0);
        Self {
            queue,
            executor,
            shutdown,
            outcomes: None,
            error_backoff: Duration::from_millis(500),
            live: Vec::new(),
            tasks: JoinSet::new(),
            next_id: 1,
            size_tx,
        }
    }

    /// Forward every execution result to `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<ExecutionResult>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    /// Pause after a store failure before a worker dequeues again.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Start the supervisor task. It exits after shutdown, once every worker has stopped.
    pub fn spawn(self) -> (WorkerPoolHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = WorkerPoolHandle {
            commands,
            size: self.size_tx.subscribe(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PoolCommand>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(PoolCommand::Add(n)) => self.add(n),
                    Some(PoolCommand::Cancel(n)) => self.cancel(n),
                    None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Worker task ended abnormally");
                    }
                }
            }
        }
        self.stop_all().await;
    }

    fn add(&mut self, n: usize) {
        for _ in 0..n {
            let id = self.next_id;
            self.next_id += 1;
            let token = self.shutdown.child_token();

            self.tasks.spawn(worker_loop(
                id,
                self.queue.clone(),
                self.executor.clone(),
                token.clone(),
                self.shutdown.clone(),
                self.outcomes.clone(),
                self.error_backoff,
            ));
            self.live.push(WorkerSlot { id, token });
        }
        self.publish_size();
        tracing::info!(added = n, live = self.live.len(), "Workers added");
    }

    /// Retire the most recently started workers first.
    fn cancel(&mut self, n: usize) {
        if n > self.live.len() {
            tracing::warn!(
                requested = n,
                live = self.live.len(),
                "Asked to cancel more workers than are running"
            );
        }
        let keep = self.live.len().saturating_sub(n);
        let retired = self.live.split_off(keep);
        for slot in &retired {
            slot.token.cancel();
            tracing::debug!(worker_id = slot.id, "Worker cancelled");
        }
        self.publish_size();
        tracing::info!(cancelled = retired.len(), live = self.live.len(), "Workers cancelled");
    }

    async fn stop_all(mut self) {
        for slot in self.live.drain(..) {
            slot.token.cancel();
        }
        self.publish_size();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("All workers stopped");
    }

    fn publish_size(&self) {
        self.size_tx.send_replace(self.live.len());
    }
}

/// One consumer loop: dequeue, execute, repeat until `token` is cancelled.
async fn worker_loop(
    id: u64,
    queue: Arc<WorkQueue>,
    executor: TaskExecutor,
    token: CancellationToken,
    shutdown: CancellationToken,
    outcomes: Option<mpsc::UnboundedSender<ExecutionResult>>,
    error_backoff: Duration,
) {
    tracing::debug!(worker_id = id, "Worker started");

    while let Some(item) = queue.dequeue(&token).await {
        match executor.execute(&item, &shutdown).await {
            Ok(result) => {
                if let Some(tx) = &outcomes {
                    // Observer may have gone away; results are already logged.
                    let _ = tx.send(result);
                }
            }
            Err(e) => {
                tracing::error!(
                    worker_id = id,
                    job_id = %item.job_id,
                    error = %e,
                    "Job aborted by store failure"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(error_backoff) => {}
                }
            }
        }
    }

    tracing::debug!(worker_id = id, "Worker stopped");
}
