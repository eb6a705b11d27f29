use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{BackServerError, Result};

/// Runtime settings for one back-server process.
///
/// Every key name is shared by all servers competing on the same store, so
/// servers that should cooperate must agree on them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackServerConfig {
    /// Namespace prepended to the generated server identity.
    pub server_prefix: String,
    /// Hash holding unclaimed packages (claim token -> package reference).
    pub exchange_key: String,
    /// Directory of servers available for work.
    pub readiness_key: String,
    /// Global audit hash (claim token -> winning server).
    pub ownership_audit_key: String,
    /// Prefix of the per-server key used to ask for more workers.
    pub scale_add_prefix: String,
    /// Prefix of the per-server key used to ask for fewer workers.
    pub scale_cancel_prefix: String,

    /// 0 = one worker per job, >0 = jobs per worker, <0 = fixed worker count.
    pub balance_ratio: i32,
    /// Upper bound on workers added per package; ignored unless positive.
    pub max_workers_per_server: i32,

    /// Simulated duration of a single job cycle.
    #[serde(deserialize_with = "de_secs")]
    pub step_delay: Duration,
    /// Write job progress every N steps. The last step is always written.
    pub progress_granularity: u32,
    #[serde(deserialize_with = "de_secs")]
    pub completion_poll_interval: Duration,

    #[serde(deserialize_with = "de_opt_secs")]
    pub ownership_ttl: Option<Duration>,
    #[serde(deserialize_with = "de_opt_secs")]
    pub progress_ttl: Option<Duration>,
    #[serde(deserialize_with = "de_opt_secs")]
    pub readiness_ttl: Option<Duration>,

    #[serde(deserialize_with = "de_secs")]
    pub retry_backoff_min: Duration,
    #[serde(deserialize_with = "de_secs")]
    pub retry_backoff_max: Duration,
}

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for BackServerConfig {
    fn default() -> Self {
        Self {
            server_prefix: "backserver".to_string(),
            exchange_key: "exchange:packages".to_string(),
            readiness_key: "backservers:ready".to_string(),
            ownership_audit_key: "tasks:proceed".to_string(),
            scale_add_prefix: "process:add".to_string(),
            scale_cancel_prefix: "process:cancel".to_string(),
            balance_ratio: 3,
            max_workers_per_server: 8,
            step_delay: Duration::from_secs(3),
            progress_granularity: 1,
            completion_poll_interval: Duration::from_secs(1),
            ownership_ttl: Some(ONE_DAY),
            progress_ttl: Some(ONE_DAY),
            readiness_ttl: None,
            retry_backoff_min: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(30),
        }
    }
}

impl BackServerConfig {
    /// Load settings from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_exchange_key(mut self, key: impl Into<String>) -> Self {
        self.exchange_key = key.into();
        self
    }

    pub fn with_balance(mut self, ratio: i32, max_workers: i32) -> Self {
        self.balance_ratio = ratio;
        self.max_workers_per_server = max_workers;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let keys = [
            ("server_prefix", &self.server_prefix),
            ("exchange_key", &self.exchange_key),
            ("readiness_key", &self.readiness_key),
            ("ownership_audit_key", &self.ownership_audit_key),
            ("scale_add_prefix", &self.scale_add_prefix),
            ("scale_cancel_prefix", &self.scale_cancel_prefix),
        ];
        if let Some((name, _)) = keys.iter().find(|(_, value)| value.is_empty()) {
            return Err(BackServerError::Config(format!("{} must not be empty", name)));
        }
        if self.progress_granularity == 0 {
            return Err(BackServerError::Config(
                "progress_granularity must be at least 1".to_string(),
            ));
        }
        if self.step_delay.is_zero() {
            return Err(BackServerError::Config(
                "step_delay must be greater than zero".to_string(),
            ));
        }
        if self.retry_backoff_min > self.retry_backoff_max {
            return Err(BackServerError::Config(
                "retry_backoff_min exceeds retry_backoff_max".to_string(),
            ));
        }
        Ok(())
    }
}

fn secs_to_duration<E: serde::de::Error>(secs: f64) -> std::result::Result<Duration, E> {
    Duration::try_from_secs_f64(secs).map_err(E::custom)
}

fn de_secs<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    secs_to_duration(f64::deserialize(d)?)
}

fn de_opt_secs<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    Option::<f64>::deserialize(d)?
        .map(secs_to_duration)
        .transpose()
}
