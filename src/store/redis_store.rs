use std::fmt;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use tokio_stream::StreamExt;

use crate::error::Result;
use crate::store::{KeyCommand, KeyEvent, KeyEventStream, SharedStore};

/// Shared store backed by Redis.
///
/// Commands go through a [`ConnectionManager`], which reconnects on its own.
/// Subscriptions open a dedicated pub/sub connection per key and listen on the
/// keyspace channel `__keyspace@<db>__:<key>`, so the server must have keyspace
/// notifications enabled. [`RedisStore::connect`] tries to switch them on.
#[derive(Clone)]
pub struct RedisStore {
    client: ::redis::Client,
    conn: ConnectionManager,
    db: i64,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("db", &self.db)
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        tracing::info!(url = %redis_url, "Connecting to shared store");

        let client = ::redis::Client::open(redis_url)?;
        let db = db_from_url(redis_url);
        let mut conn = ConnectionManager::new(client.clone()).await?;

        // Managed services often forbid CONFIG; the operator then has to enable it.
        let enabled: ::redis::RedisResult<()> = ::redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("KEA")
            .query_async(&mut conn)
            .await;
        if let Err(e) = enabled {
            tracing::warn!(
                error = %e,
                "Could not enable keyspace notifications, make sure notify-keyspace-events includes K and h"
            );
        }

        tracing::info!(db, "Connected to shared store");
        Ok(Self { client, conn, db })
    }

    fn keyspace_channel(&self, key: &str) -> String {
        format!("__keyspace@{}__:{}", self.db, key)
    }
}

/// Database index from a `redis://host:port/<db>` url, 0 when absent.
fn db_from_url(url: &str) -> i64 {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    without_scheme
        .split_once('/')
        .and_then(|(_, path)| path.split(['?', '#']).next())
        .and_then(|db| db.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
                ::redis::pipe()
                    .atomic()
                    .hset(key, field, value)
                    .ignore()
                    .expire(key, secs)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await?;
            }
            None => {
                conn.hset::<_, _, _, ()>(key, field, value).await?;
            }
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        // Pairs keep the server's enumeration order.
        let fields: Vec<(String, String)> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn subscribe(&self, key: &str) -> Result<KeyEventStream> {
        let channel = self.keyspace_channel(key);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        tracing::debug!(channel = %channel, "Subscribed to keyspace channel");

        let key = key.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            match msg.get_payload::<String>() {
                Ok(event) => Some(KeyEvent {
                    key: key.clone(),
                    command: KeyCommand::parse(&event),
                }),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Unreadable keyspace notification");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
