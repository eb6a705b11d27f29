//! Shared key/value store capability.
//!
//! Back-servers never coordinate through local locks. Everything they agree on
//! lives in one shared store that offers hash fields, an atomic field delete,
//! and change notifications:
//!
//! - [`SharedStore`]: the primitives the claim protocol and executors need
//! - [`InMemoryStore`]: linearizable single-process store, used by tests and demos
//! - [`RedisStore`]: Redis-backed store using keyspace notifications
//!
//! # Correctness anchor
//!
//! [`SharedStore::hdel`] must be atomic: when several callers delete the same
//! field concurrently, exactly one of them observes `true`. The exchange claim
//! protocol treats that `true` as exclusive ownership of a package.

pub mod memory;
pub mod redis_store;

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::Result;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

/// Mutation reported by a change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCommand {
    HashSet,
    HashDelete,
    Deleted,
    Expired,
    Other(String),
}

impl KeyCommand {
    /// Map a Redis keyspace event name onto a command.
    pub fn parse(event: &str) -> Self {
        match event {
            "hset" => KeyCommand::HashSet,
            "hdel" => KeyCommand::HashDelete,
            "del" => KeyCommand::Deleted,
            "expired" => KeyCommand::Expired,
            other => KeyCommand::Other(other.to_string()),
        }
    }
}

impl fmt::Display for KeyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyCommand::HashSet => write!(f, "hset"),
            KeyCommand::HashDelete => write!(f, "hdel"),
            KeyCommand::Deleted => write!(f, "del"),
            KeyCommand::Expired => write!(f, "expired"),
            KeyCommand::Other(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub command: KeyCommand,
}

pub type KeyEventStream = Pin<Box<dyn Stream<Item = KeyEvent> + Send>>;

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Set one hash field. A `ttl` (re)arms expiry on the whole key.
    async fn hset(&self, key: &str, field: &str, value: &str, ttl: Option<Duration>)
        -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

    /// Atomically remove one field. Returns `true` only for the caller that removed it.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Subscribe to mutations of one key.
    async fn subscribe(&self, key: &str) -> Result<KeyEventStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keyspace_events() {
        assert_eq!(KeyCommand::parse("hset"), KeyCommand::HashSet);
        assert_eq!(KeyCommand::parse("hdel"), KeyCommand::HashDelete);
        assert_eq!(KeyCommand::parse("del"), KeyCommand::Deleted);
        assert_eq!(KeyCommand::parse("expired"), KeyCommand::Expired);
        assert_eq!(
            KeyCommand::parse("hincrby"),
            KeyCommand::Other("hincrby".to_string())
        );
    }

    #[test]
    fn display_round_trips_known_commands() {
        for cmd in [
            KeyCommand::HashSet,
            KeyCommand::HashDelete,
            KeyCommand::Deleted,
            KeyCommand::Expired,
        ] {
            assert_eq!(KeyCommand::parse(&cmd.to_string()), cmd);
        }
    }
}
