//! Error types for the connection pool.

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced to pool callers.
///
/// Failures that happen to idle connections (failed idle validation,
/// eviction) are handled inside the pool and never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("connection pool {pool} exhausted (waited {waited_ms}ms)")]
    PoolExhausted { pool: String, waited_ms: u64 },

    #[error("connection pool {0} is closed")]
    PoolClosed(String),

    #[error("connection failed validation: {0}")]
    ValidationFailed(String),

    #[error("connection factory error: {0}")]
    ConnectionFactory(String),

    #[error("lease {0} was already returned")]
    AlreadyReturned(u64),

    #[error("lease {0} does not belong to this pool")]
    UnknownConnection(u64),

    #[error("lease {0} was reclaimed as abandoned")]
    Abandoned(u64),

    #[error("operation vetoed by interceptor {interceptor}: {reason}")]
    Intercepted { interceptor: String, reason: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid pool configuration: {0}")]
    Config(String),
}

impl PoolError {
    /// Whether the error is caused by pool capacity rather than a fault.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PoolError::PoolExhausted { .. })
    }

    /// Whether the pool was closed underneath the caller.
    pub fn is_closed(&self) -> bool {
        matches!(self, PoolError::PoolClosed(_))
    }

    /// Short stable label, suitable for log fields and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::PoolExhausted { .. } => "exhausted",
            PoolError::PoolClosed(_) => "closed",
            PoolError::ValidationFailed(_) => "validation_failed",
            PoolError::ConnectionFactory(_) => "connection_factory",
            PoolError::AlreadyReturned(_) => "already_returned",
            PoolError::UnknownConnection(_) => "unknown_connection",
            PoolError::Abandoned(_) => "abandoned",
            PoolError::Intercepted { .. } => "intercepted",
            PoolError::Backend(_) => "backend",
            PoolError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_names_pool_and_wait() {
        let err = PoolError::PoolExhausted {
            pool: "orders".to_string(),
            waited_ms: 250,
        };
        assert_eq!(err.to_string(), "connection pool orders exhausted (waited 250ms)");
        assert!(err.is_exhausted());
        assert!(!err.is_closed());
        assert_eq!(err.kind(), "exhausted");
    }

    #[test]
    fn intercepted_message_names_interceptor() {
        let err = PoolError::Intercepted {
            interceptor: "max-payload".to_string(),
            reason: "payload of 10 bytes exceeds 4".to_string(),
        };
        assert!(err.to_string().contains("max-payload"));
        assert!(err.to_string().contains("exceeds 4"));
    }
}
