//! Gateway error taxonomy.
//!
//! Guard failures (bulkhead, breaker, timeout) are distinct variants so they map to
//! distinct HTTP statuses and metric names; they are never retried by the gateway.
//! Transport-level transient errors retry inside the transport adapter and escalate
//! unchanged if the budget is exhausted.
use http::StatusCode;
use thiserror::Error;

use crate::ports::transport::TransportError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// Missing trace fields, unknown route or malformed callback URI.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A polling/callback submission reused an existing request id.
    #[error("Duplicate request id: {id}")]
    DuplicateRequest { id: String },

    /// No bulkhead slot became available within the wait budget.
    #[error("Concurrency limit reached for pool '{pool}'")]
    BulkheadFull { pool: String },

    /// The circuit is open; the downstream call was not attempted.
    #[error("Circuit '{name}' is open")]
    CircuitOpen { name: String },

    /// The downstream call exceeded its budget and was cancelled.
    #[error("Call timed out after {budget_ms}ms in pool '{pool}'")]
    Timeout { pool: String, budget_ms: u64 },

    /// The downstream answered with a status outside the acceptable set.
    #[error("Downstream call failed with status {status}")]
    DownstreamCallFailure { status: u16 },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Mailbox store error: {0}")]
    Store(String),

    /// Uncaught failure during execution, wrapping the root cause.
    #[error("Service error: {0}")]
    ServiceError(String),
}

impl GatewayError {
    /// HTTP status this error surfaces as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::DuplicateRequest { .. } => StatusCode::NOT_ACCEPTABLE,
            GatewayError::BulkheadFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DownstreamCallFailure { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ServiceError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable tag used in log lines and stored error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::DuplicateRequest { .. } => "duplicate_request",
            GatewayError::BulkheadFull { .. } => "bulkhead_full",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::DownstreamCallFailure { .. } => "downstream_failure",
            GatewayError::Transport(_) => "transport",
            GatewayError::Store(_) => "store",
            GatewayError::ServiceError(_) => "service_error",
        }
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
