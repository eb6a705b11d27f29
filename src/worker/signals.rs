use std::sync::Arc;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::BackServerConfig;
use crate::error::{BackServerError, Result};
use crate::identity::ServerIdentity;
use crate::store::{KeyCommand, SharedStore};
use crate::worker::pool::WorkerPoolHandle;

/// Largest add or cancel count applied from one batch of requests.
pub const MAX_SCALE_REQUEST: usize = 1024;

/// Lets operators resize one server's pool through the shared store.
///
/// Writing `hset process:add:<server> <any field> <n>` starts `n` workers and
/// `process:cancel:<server>` stops `n`. Fields are consumed with an atomic
/// delete, so a request is applied once even if notifications repeat.
pub struct ScaleSignals {
    store: Arc<dyn SharedStore>,
    pool: WorkerPoolHandle,
    add_key: String,
    cancel_key: String,
}

impl ScaleSignals {
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: &BackServerConfig,
        identity: &ServerIdentity,
        pool: WorkerPoolHandle,
    ) -> Self {
        Self {
            store,
            pool,
            add_key: identity.scale_key(&config.scale_add_prefix),
            cancel_key: identity.scale_key(&config.scale_cancel_prefix),
        }
    }

    pub fn add_key(&self) -> &str {
        &self.add_key
    }

    pub fn cancel_key(&self) -> &str {
        &self.cancel_key
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let adds = self.store.subscribe(&self.add_key).await?;
        let cancels = self.store.subscribe(&self.cancel_key).await?;
        let mut events = adds.merge(cancels);
        tracing::info!(add_key = %self.add_key, cancel_key = %self.cancel_key, "Listening for scale signals");

        // Requests written while we were not subscribed.
        self.apply(&self.add_key).await?;
        self.apply(&self.cancel_key).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.next() => {
                    let Some(event) = event else {
                        return Err(BackServerError::SubscriptionClosed(self.add_key.clone()));
                    };
                    if event.command == KeyCommand::HashSet {
                        self.apply(&event.key).await?;
                    }
                }
            }
        }
    }

    /// Consume every pending request on `key` and forward the total to the pool.
    pub async fn apply(&self, key: &str) -> Result<usize> {
        let mut total = 0usize;
        for (field, raw) in self.store.hgetall(key).await? {
            if !self.store.hdel(key, &field).await? {
                continue;
            }
            match raw.trim().parse::<usize>() {
                Ok(n) => total = total.saturating_add(n),
                Err(_) => {
                    tracing::warn!(key = %key, field = %field, value = %raw, "Ignoring malformed scale request");
                }
            }
        }

        if total > MAX_SCALE_REQUEST {
            tracing::warn!(key = %key, requested = total, max = MAX_SCALE_REQUEST, "Scale request capped");
            total = MAX_SCALE_REQUEST;
        }

        if total > 0 {
            if key == self.add_key {
                tracing::info!(count = total, "External request to add workers");
                self.pool.request_add(total)?;
            } else {
                tracing::info!(count = total, "External request to cancel workers");
                self.pool.request_cancel(total)?;
            }
        }
        Ok(total)
    }
}
