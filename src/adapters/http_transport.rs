//! Downstream HTTP transport using Hyper with Rustls (HTTP/1.1 + HTTP/2).
//!
//! One shared connection pool serves every configured service; its size is
//! derived from the summed pool concurrency so the bulkheads, not the
//! transport, are what limits parallelism. Connection-level failures are
//! retried a bounded number of times here; anything the guards rejected is
//! never retried.
use std::time::Duration;

use async_trait::async_trait;
use http::{Request, Version, header, header::HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::transport::{
    DownstreamTransport, TransportError, TransportRequest, TransportResponse,
};

const CONNECT_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<bytes::Bytes>>,
}

impl HyperTransport {
    /// Create the shared transport. `pool_size` bounds idle connections per
    /// host; `accept_invalid_certs` disables certificate verification and is
    /// only meant for test environments.
    pub fn new(pool_size: u32, accept_invalid_certs: bool) -> eyre::Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let tls_config = if accept_invalid_certs {
            tracing::warn!("Downstream TLS certificate verification is disabled");
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(std::sync::Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut root_cert_store = rustls::RootCertStore::empty();
            let native_certs = load_native_certs();
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            if !native_certs.errors.is_empty() {
                tracing::warn!(
                    "Some native certificates failed to load: {:?}",
                    native_certs.errors
                );
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth()
        };

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(pool_size.max(1) as usize)
            .build::<_, Full<bytes::Bytes>>(https_connector);

        tracing::info!(pool_size, "Created downstream HTTP transport");
        Ok(Self { client })
    }

    fn build_request(
        &self,
        request: &TransportRequest,
    ) -> Result<Request<Full<bytes::Bytes>>, TransportError> {
        let uri: hyper::Uri = request
            .uri
            .parse()
            .map_err(|e| TransportError::InvalidUri(format!("{}: {e}", request.uri)))?;

        let host_value = match (uri.host(), uri.port()) {
            (Some(host), Some(port)) => HeaderValue::from_str(&format!("{host}:{port}")).ok(),
            (Some(host), None) => HeaderValue::from_str(host).ok(),
            (None, _) => {
                return Err(TransportError::InvalidUri(format!(
                    "no host in '{}'",
                    request.uri
                )));
            }
        };

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(uri)
            .version(Version::HTTP_11);
        if let Some(headers) = builder.headers_mut() {
            *headers = request.headers.clone();
            if let Some(host) = host_value {
                headers.insert(header::HOST, host);
            }
            if !headers.contains_key(header::USER_AGENT) {
                headers.insert(
                    header::USER_AGENT,
                    HeaderValue::from_static("Tollgate-Gateway/1.0"),
                );
            }
        }
        builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

#[async_trait]
impl DownstreamTransport for HyperTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut last_err = None;

        for attempt in 1..=CONNECT_ATTEMPTS {
            let outgoing = self.build_request(&request)?;
            match self.client.request(outgoing).await {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    let collected = body
                        .collect()
                        .await
                        .map_err(|e| TransportError::Body(e.to_string()))?;
                    return Ok(TransportResponse {
                        status: parts.status.as_u16(),
                        headers: parts.headers,
                        body: collected.to_bytes(),
                    });
                }
                Err(e) if e.is_connect() && attempt < CONNECT_ATTEMPTS => {
                    tracing::debug!(
                        uri = %request.uri,
                        attempt,
                        error = %e,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    last_err = Some(e);
                }
                Err(e) if e.is_connect() => {
                    return Err(TransportError::Connection(format!(
                        "{} {} failed after {CONNECT_ATTEMPTS} attempts: {e}",
                        request.method, request.uri
                    )));
                }
                Err(e) => {
                    return Err(TransportError::Other(format!(
                        "{} {} failed: {e}",
                        request.method, request.uri
                    )));
                }
            }
        }

        Err(TransportError::Connection(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "exhausted connection attempts".to_string()),
        ))
    }
}

/// Certificate verifier that accepts anything. Only reachable through the
/// explicit `danger_accept_invalid_certs` switch.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_creation() {
        assert!(HyperTransport::new(32, false).is_ok());
    }

    #[tokio::test]
    async fn invalid_uri_is_rejected_before_sending() {
        let transport = HyperTransport::new(1, false).unwrap();
        let err = transport
            .send(TransportRequest {
                method: http::Method::GET,
                uri: "not a uri".to_string(),
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUri(_)));
    }

    #[tokio::test]
    async fn uri_without_host_is_rejected() {
        let transport = HyperTransport::new(1, false).unwrap();
        let err = transport
            .send(TransportRequest {
                method: http::Method::GET,
                uri: "/relative/path".to_string(),
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUri(_)));
    }
}
