use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::BackServerConfig;
use crate::error::Result;
use crate::store::SharedStore;

/// Unique name of one back-server process, e.g. `backserver:6f1c...`.
///
/// Generated once at startup and never reused. It also namespaces the
/// server-scoped hashes (progress, claimed packages, completion).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerIdentity(Arc<str>);

impl ServerIdentity {
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}:{}", prefix, Uuid::new_v4()).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hash of job id -> remaining cycles for jobs this server holds.
    pub fn progress_key(&self) -> String {
        format!("{}:progress", self.0)
    }

    /// Hash of claim token -> package reference for packages this server won.
    pub fn packages_key(&self) -> String {
        format!("{}:packages", self.0)
    }

    /// Hash of claim token -> completion percentage.
    pub fn completion_key(&self) -> String {
        format!("{}:completion", self.0)
    }

    pub fn scale_key(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.0)
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Announce this server in the readiness directory.
///
/// The field is the identity and the value is the registration time.
pub async fn register_readiness(
    store: &dyn SharedStore,
    config: &BackServerConfig,
    identity: &ServerIdentity,
) -> Result<()> {
    let registered_at = Utc::now().to_rfc3339();
    store
        .hset(
            &config.readiness_key,
            identity.as_str(),
            &registered_at,
            config.readiness_ttl,
        )
        .await?;
    tracing::info!(server = %identity, key = %config.readiness_key, "Registered as ready");
    Ok(())
}

/// Remove this server from the readiness directory. Best effort: failures are logged.
pub async fn deregister_readiness(
    store: &dyn SharedStore,
    config: &BackServerConfig,
    identity: &ServerIdentity,
) {
    match store.hdel(&config.readiness_key, identity.as_str()).await {
        Ok(removed) => {
            tracing::info!(server = %identity, removed, "Removed readiness entry");
        }
        Err(e) => {
            tracing::warn!(server = %identity, error = %e, "Failed to remove readiness entry");
        }
    }
}
