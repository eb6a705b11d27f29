//! Shared helpers for back-server integration tests.
//!
//! Everything runs against [`InMemoryStore`] with millisecond step delays.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use backserver::config::BackServerConfig;
use backserver::error::{BackServerError, Result};
use backserver::store::{InMemoryStore, KeyEventStream, SharedStore};

/// Config with fast timings for tests.
pub fn test_config() -> BackServerConfig {
    BackServerConfig {
        step_delay: Duration::from_millis(5),
        completion_poll_interval: Duration::from_millis(10),
        retry_backoff_min: Duration::from_millis(10),
        retry_backoff_max: Duration::from_millis(50),
        ..BackServerConfig::default()
    }
}

/// Write a package hash, then announce it on the exchange, as a producer would.
pub async fn publish_package(
    store: &dyn SharedStore,
    exchange_key: &str,
    token: &str,
    package: &str,
    jobs: &[(&str, &str)],
) {
    for (job_id, terms) in jobs {
        store.hset(package, job_id, terms, None).await.unwrap();
    }
    store.hset(exchange_key, token, package, None).await.unwrap();
}

/// Poll `check` until it returns true or `limit` passes.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsetCall {
    pub key: String,
    pub field: String,
    pub value: String,
}

/// Store wrapper that records every `hset` and can cancel a token after the
/// n-th write to one field.
pub struct RecordingStore {
    inner: InMemoryStore,
    writes: Mutex<Vec<HsetCall>>,
    trip: Mutex<Option<(String, usize, CancellationToken)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            writes: Mutex::new(Vec::new()),
            trip: Mutex::new(None),
        }
    }

    /// Direct access that bypasses recording, for seeding state.
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Cancel `token` right after the `after`-th write to `field`.
    pub fn cancel_after_writes(&self, field: &str, after: usize, token: CancellationToken) {
        *self.trip.lock() = Some((field.to_string(), after, token));
    }

    pub fn writes_for(&self, field: &str) -> Vec<String> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.field == field)
            .map(|w| w.value.clone())
            .collect()
    }
}

#[async_trait]
impl SharedStore for RecordingStore {
    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.inner.hset(key, field, value, ttl).await?;
        let count = {
            let mut writes = self.writes.lock();
            writes.push(HsetCall {
                key: key.to_string(),
                field: field.to_string(),
                value: value.to_string(),
            });
            writes.iter().filter(|w| w.field == field).count()
        };
        if let Some((trip_field, after, token)) = self.trip.lock().as_ref() {
            if trip_field == field && count == *after {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.inner.hget(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        self.inner.hgetall(key).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.inner.hdel(key, field).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn subscribe(&self, key: &str) -> Result<KeyEventStream> {
        self.inner.subscribe(key).await
    }
}

struct HsetFault {
    key_suffix: String,
    skip: usize,
    fail: usize,
}

/// Store wrapper for failure and contention paths.
///
/// Writes and subscriptions can be scripted to fail with a retryable
/// [`BackServerError::Store`]. A yielding store hands control back to the
/// runtime before every call, so concurrent claimers interleave their
/// round trips the way remote clients would.
pub struct FaultyStore {
    inner: InMemoryStore,
    yields: bool,
    hset_faults: Mutex<Vec<HsetFault>>,
    subscribe_faults: Mutex<HashMap<String, usize>>,
    lost_deletes: Mutex<HashMap<String, usize>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            yields: false,
            hset_faults: Mutex::new(Vec::new()),
            subscribe_faults: Mutex::new(HashMap::new()),
            lost_deletes: Mutex::new(HashMap::new()),
        }
    }

    pub fn yielding() -> Self {
        Self {
            yields: true,
            ..Self::new()
        }
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Let `skip` writes to keys ending in `key_suffix` through, then fail `fail` of them.
    pub fn fail_hset(&self, key_suffix: &str, skip: usize, fail: usize) {
        self.hset_faults.lock().push(HsetFault {
            key_suffix: key_suffix.to_string(),
            skip,
            fail,
        });
    }

    /// Fail the next `times` subscriptions to `key`.
    pub fn fail_subscribe(&self, key: &str, times: usize) {
        self.subscribe_faults.lock().insert(key.to_string(), times);
    }

    pub fn pending_subscribe_failures(&self, key: &str) -> usize {
        self.subscribe_faults.lock().get(key).copied().unwrap_or(0)
    }

    /// Deletes on `key` that found the field already gone.
    pub fn lost_deletes(&self, key: &str) -> usize {
        self.lost_deletes.lock().get(key).copied().unwrap_or(0)
    }

    async fn pause(&self) {
        if self.yields {
            tokio::task::yield_now().await;
        }
    }

    fn hset_fails(&self, key: &str) -> bool {
        let mut faults = self.hset_faults.lock();
        let Some(fault) = faults.iter_mut().find(|f| key.ends_with(&f.key_suffix)) else {
            return false;
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            false
        } else if fault.fail > 0 {
            fault.fail -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl SharedStore for FaultyStore {
    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.pause().await;
        if self.hset_fails(key) {
            return Err(BackServerError::Store(format!("write to {} refused", key)));
        }
        self.inner.hset(key, field, value, ttl).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.pause().await;
        self.inner.hget(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        self.pause().await;
        self.inner.hgetall(key).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.pause().await;
        let removed = self.inner.hdel(key, field).await?;
        if !removed {
            *self.lost_deletes.lock().entry(key.to_string()).or_default() += 1;
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.pause().await;
        self.inner.exists(key).await
    }

    async fn subscribe(&self, key: &str) -> Result<KeyEventStream> {
        self.pause().await;
        {
            let mut faults = self.subscribe_faults.lock();
            if let Some(left) = faults.get_mut(key).filter(|left| **left > 0) {
                *left -= 1;
                return Err(BackServerError::Store(format!("subscription to {} refused", key)));
            }
        }
        self.inner.subscribe(key).await
    }
}

pub fn shared(store: InMemoryStore) -> Arc<dyn SharedStore> {
    Arc::new(store)
}
