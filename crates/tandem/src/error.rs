//! Error taxonomy shared across the routing engine.

/// The routing error codes surfaced to the switch via the `error` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoRoute,
    NoAuth,
    Forbidden,
    Busy,
    Offline,
    Failure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoRoute => "noroute",
            ErrorCode::NoAuth => "noauth",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::Busy => "busy",
            ErrorCode::Offline => "offline",
            ErrorCode::Failure => "failure",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routing decision failed for a reason the switch should learn about.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("routing failed ({code}): {message}")]
pub struct RoutingError {
    pub code: ErrorCode,
    pub message: String,
}

impl RoutingError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn noroute(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoRoute, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Failure, message)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    /// Transport-class failures are worth retrying; everything else is not.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StorageError::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            )
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("key-value store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed cache entry: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Everything a routing job can trip over.
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl TaskError {
    pub fn is_transport(&self) -> bool {
        matches!(self, TaskError::Storage(err) if err.is_transport())
    }
}
