use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackServerError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Subscription closed for key {0}")]
    SubscriptionClosed(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackServerError {
    /// Whether the owning loop should back off and retry instead of giving up.
    ///
    /// Store connectivity problems are transient from the point of view of one
    /// server; everything else points at a local defect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackServerError::Store(_)
                | BackServerError::Redis(_)
                | BackServerError::SubscriptionClosed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_are_retryable() {
        assert!(BackServerError::Store("connection reset".into()).is_retryable());
        assert!(BackServerError::SubscriptionClosed("exchange".into()).is_retryable());
    }

    #[test]
    fn local_failures_are_not_retryable() {
        assert!(!BackServerError::Config("bad ratio".into()).is_retryable());
        assert!(!BackServerError::Internal("join failed".into()).is_retryable());
    }
}
