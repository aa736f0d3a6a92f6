//! Error taxonomy shared across the driver.
//!
//! Mirrors the split the teacher crate draws between a typed library error
//! (`ApiError`/`BillingError` there, `YdbError` here) and propagation by
//! `?` throughout. Kinds are grouped per spec.md section 7.

use crate::status::StatusCode;

pub type YdbResult<T> = Result<T, YdbError>;

#[derive(Debug, thiserror::Error)]
pub enum YdbError {
    /// Deadline or wait exceeded; surfaced verbatim, never retried by the
    /// engine that raised it (a caller wrapping in `with_retries` may still
    /// retry the operation as a whole).
    #[error("timeout expired: {0}")]
    TimeoutExpired(String),

    /// Connection-level failure. Triggers endpoint pessimization and is
    /// classified retryable-slow.
    #[error("transport error against {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// A unary call returned a non-success status from the server.
    #[error("server returned {status:?}: {message}")]
    Status {
        status: StatusCode,
        message: String,
    },

    /// Schema/name issue, sometimes tolerated by the caller (e.g.
    /// drop-nonexistent-table).
    #[error("scheme error: {0}")]
    Scheme(String),

    /// Server reported success but omitted the payload the caller needed
    /// (no `tx_meta`, no `iam_token`, ...). Always fatal.
    #[error("empty payload: {0}")]
    EmptyPayload(&'static str),

    /// Caller supplied invalid arguments. Always fatal.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The pool, driver, or discovery service has been torn down.
    #[error("{0} has been destroyed")]
    Destroyed(&'static str),

    /// Raised by `SessionPool::acquire` when no waiter slot opens before the
    /// caller's timeout elapses.
    #[error("No session became available within timeout of {0} ms")]
    NoSessionAvailable(u64),

    /// Auth provider failed to produce a token.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl YdbError {
    /// Best-effort downgrade: a gRPC transport error carries the endpoint it
    /// failed against so the caller can pessimize it without re-threading
    /// that context through every call site.
    pub fn transport(endpoint: impl Into<String>, source: tonic::transport::Error) -> Self {
        YdbError::Transport {
            endpoint: endpoint.into(),
            source,
        }
    }

    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        YdbError::Status {
            status,
            message: message.into(),
        }
    }

    /// Whether the server tolerates this as success-equivalent for
    /// idempotent drop-like operations (spec.md 4.5, `dropTable`).
    pub fn is_tolerable_scheme_error(&self) -> bool {
        matches!(self, YdbError::Scheme(_))
            || matches!(self, YdbError::Status { status: StatusCode::SchemeError, .. })
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            YdbError::Status { status, .. } => Some(*status),
            YdbError::Scheme(_) => Some(StatusCode::SchemeError),
            _ => None,
        }
    }
}
