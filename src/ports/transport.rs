//! Downstream transport port.
//!
//! The executor speaks to upstream services exclusively through this trait, so
//! tests can substitute a scripted transport and the HTTP adapter stays at the
//! edge of the crate.
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection-level failure (refused, reset, DNS). Retried by the adapter
    /// within its bounded budget before escalating.
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid upstream URI: {0}")]
    InvalidUri(String),

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Request failed: {0}")]
    Other(String),
}

/// A fully-formed call to one upstream endpoint.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Buffered upstream response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
pub trait DownstreamTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}
