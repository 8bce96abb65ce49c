//! Error types for per-user pool management.

use std::fmt;

/// Errors returned by the connection pool manager and connection factories.
///
/// `Clone` so one creation outcome can be delivered to every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The maximum number of concurrently pooled users has been reached.
    CapacityExceeded { max_users: usize },
    /// The database could not be reached or the connection failed.
    Connection(String),
    /// The database refused the downstream token.
    TokenRejected(String),
    /// The downstream token had already expired.
    TokenExpired,
    /// Creation (or acquisition) did not finish within the connect timeout.
    Timeout,
    ShuttingDown,
    Internal(String),
}

impl PoolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::Connection(_) => "CONNECTION_FAILED",
            Self::TokenRejected(_) => "DATABASE_TOKEN_REJECTED",
            Self::TokenExpired => "DATABASE_TOKEN_EXPIRED",
            Self::Timeout => "CONNECTION_TIMEOUT",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Internal(_) => "POOL_INTERNAL",
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded { max_users } => write!(
                f,
                "Maximum concurrent users ({}) reached, retry later",
                max_users
            ),
            Self::Connection(msg) => write!(f, "Database connection failed: {}", msg),
            Self::TokenRejected(msg) => write!(f, "Database rejected the access token: {}", msg),
            Self::TokenExpired => write!(f, "Database access token has expired"),
            Self::Timeout => write!(f, "Timed out waiting for a database connection"),
            Self::ShuttingDown => write!(f, "Connection pool manager is shutting down"),
            Self::Internal(msg) => write!(f, "Internal pool error: {}", msg),
        }
    }
}

impl std::error::Error for PoolError {}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
