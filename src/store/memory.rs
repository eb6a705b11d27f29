use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::Result;
use crate::store::{KeyCommand, KeyEvent, KeyEventStream, SharedStore};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct Hash {
    /// Kept in insertion order so enumeration matches the order fields were written.
    fields: Vec<(String, String)>,
    expires_at: Option<Instant>,
}

impl Hash {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Single-process shared store.
///
/// One mutex guards every hash, so each operation is linearizable and
/// [`SharedStore::hdel`] behaves as an atomic conditional delete. Expiry is
/// applied lazily when a key is touched.
#[derive(Debug)]
pub struct InMemoryStore {
    hashes: Mutex<HashMap<String, Hash>>,
    events: broadcast::Sender<KeyEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            hashes: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Number of live keys, mostly useful in tests.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.hashes
            .lock()
            .values()
            .filter(|h| !h.is_expired(now))
            .count()
    }

    fn notify(&self, key: &str, command: KeyCommand) {
        // No receivers is fine: nobody is subscribed yet.
        let _ = self.events.send(KeyEvent {
            key: key.to_string(),
            command,
        });
    }

    /// Drop `key` if its TTL has passed. Must be called with the lock held.
    fn purge_expired(&self, hashes: &mut HashMap<String, Hash>, key: &str) {
        let now = Instant::now();
        if hashes.get(key).is_some_and(|h| h.is_expired(now)) {
            hashes.remove(key);
            self.notify(key, KeyCommand::Expired);
        }
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut hashes = self.hashes.lock();
        self.purge_expired(&mut hashes, key);

        let hash = hashes.entry(key.to_string()).or_default();
        match hash.fields.iter_mut().find(|(f, _)| f == field) {
            Some((_, v)) => *v = value.to_string(),
            None => hash.fields.push((field.to_string(), value.to_string())),
        }
        if let Some(ttl) = ttl {
            hash.expires_at = Some(Instant::now() + ttl);
        }
        self.notify(key, KeyCommand::HashSet);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut hashes = self.hashes.lock();
        self.purge_expired(&mut hashes, key);
        Ok(hashes.get(key).and_then(|h| {
            h.fields
                .iter()
                .find(|(f, _)| f == field)
                .map(|(_, v)| v.clone())
        }))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut hashes = self.hashes.lock();
        self.purge_expired(&mut hashes, key);
        Ok(hashes
            .get(key)
            .map(|h| h.fields.clone())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut hashes = self.hashes.lock();
        self.purge_expired(&mut hashes, key);

        let Some(hash) = hashes.get_mut(key) else {
            return Ok(false);
        };
        let Some(pos) = hash.fields.iter().position(|(f, _)| f == field) else {
            return Ok(false);
        };
        hash.fields.remove(pos);
        let emptied = hash.fields.is_empty();
        self.notify(key, KeyCommand::HashDelete);

        // An empty hash stops existing.
        if emptied {
            hashes.remove(key);
            self.notify(key, KeyCommand::Deleted);
        }
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut hashes = self.hashes.lock();
        self.purge_expired(&mut hashes, key);
        Ok(hashes.contains_key(key))
    }

    async fn subscribe(&self, key: &str) -> Result<KeyEventStream> {
        let key = key.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            match event {
                Ok(event) if event.key == key => Some(event),
                Ok(_) => None,
                // A dropped write to this key may be among the skipped events.
                // Report one so the subscriber re-reads the key.
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(key = %key, skipped, "Subscriber lagged, notifications dropped");
                    Some(KeyEvent {
                        key: key.clone(),
                        command: KeyCommand::HashSet,
                    })
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
