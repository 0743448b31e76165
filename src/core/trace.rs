//! Trace normalization: every request is stamped before execution.
//!
//! Request id and transaction id are caller-supplied and required; normalization
//! fails with a bad-request error before any guard is touched or any downstream
//! work happens. The timestamp defaults to now when the caller omits it.
use chrono::{DateTime, Utc};
use http::HeaderMap;

use crate::core::error::{GatewayError, GatewayResult};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRANSACTION_ID_HEADER: &str = "x-transaction-id";
pub const PARENT_REQUEST_ID_HEADER: &str = "x-parent-request-id";
pub const TIMESTAMP_HEADER: &str = "x-request-timestamp";

/// Immutable trace identity stamped on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceInfo {
    pub request_id: String,
    pub transaction_id: String,
    pub parent_request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TraceInfo {
    /// Extract and validate trace identity from request headers.
    pub fn from_headers(headers: &HeaderMap) -> GatewayResult<Self> {
        let request_id = required_header(headers, REQUEST_ID_HEADER)?;
        let transaction_id = required_header(headers, TRANSACTION_ID_HEADER)?;

        let parent_request_id = headers
            .get(PARENT_REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let timestamp = headers
            .get(TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            request_id,
            transaction_id,
            parent_request_id,
            timestamp,
        })
    }
}

fn required_header(headers: &HeaderMap, name: &str) -> GatewayResult<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::BadRequest(format!("missing required header '{name}'")))
}
