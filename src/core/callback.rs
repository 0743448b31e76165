//! Callback delivery.
//!
//! When a callback-mode request completes, its stored outcome is pushed to
//! the URI the caller supplied at submission. Deliveries run through the same
//! guard chain as routed calls, under a synthetic `callback.{authority}` pool,
//! so a dead callback endpoint cannot soak up unbounded concurrency. Delivery
//! is attempted once; a failed push is logged and left for the caller to poll.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use http::{HeaderMap, HeaderValue, Method, header};

use crate::{
    config::{ExecutionStrategy, GatewayConfig},
    core::{
        executor::CommandExecutor,
        mailbox::{MAILBOX_ID_HEADER, MailboxResponse},
        resolve::PoolSettings,
        trace::{REQUEST_ID_HEADER, TRANSACTION_ID_HEADER, TraceInfo},
    },
    metrics,
    ports::transport::TransportRequest,
};

/// Delivery method override; defaults to POST.
pub const CALLBACK_METHOD_HEADER: &str = "x-callback-method";
/// Per-delivery timeout override, milliseconds.
pub const CALLBACK_TIMEOUT_HEADER: &str = "x-callback-timeout-ms";
pub const RESPONSE_STATUS_HEADER: &str = "x-response-status";

pub struct CallbackDispatcher {
    executor: CommandExecutor,
    config: Arc<ArcSwap<GatewayConfig>>,
}

impl CallbackDispatcher {
    pub fn new(executor: CommandExecutor, config: Arc<ArcSwap<GatewayConfig>>) -> Self {
        Self { executor, config }
    }

    /// Push one stored outcome to its callback target. `overrides` are the
    /// headers captured at submission time, which may carry the delivery
    /// method and timeout. Never fails the surrounding request lifecycle;
    /// all failures end as a log line and a counter.
    pub async fn deliver(
        &self,
        callback_uri: &str,
        overrides: &HeaderMap,
        trace: &TraceInfo,
        response: &MailboxResponse,
    ) {
        let mut target = match self.resolve_target(callback_uri) {
            Ok(target) => target,
            Err(reason) => {
                tracing::warn!(
                    callback_uri,
                    request_id = %trace.request_id,
                    reason,
                    "Dropping undeliverable callback"
                );
                metrics::increment_callback_delivery(false);
                return;
            }
        };
        if let Some(method) = overrides
            .get(CALLBACK_METHOD_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        {
            target.method = method;
        }

        let config = self.config.load_full();
        let timeout_ms = overrides
            .get(CALLBACK_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(config.defaults.callback_timeout_ms);

        let pool = format!("callback.{}", target.authority);
        let mut settings = PoolSettings::process_default(&config.defaults);
        settings.timeout = Duration::from_millis(timeout_ms);
        self.executor.registry().ensure(&pool, &settings);

        let request = TransportRequest {
            method: target.method,
            uri: target.uri,
            headers: delivery_headers(trace, response),
            body: bytes::Bytes::from(response.body.clone()),
        };

        let outcome = self
            .executor
            .execute_guarded(&pool, ExecutionStrategy::Direct, request, |status| {
                (200..300).contains(&status)
            })
            .await;

        match outcome {
            Ok(_) => {
                tracing::info!(
                    callback_uri,
                    request_id = %trace.request_id,
                    pool = %pool,
                    "Callback delivered"
                );
                metrics::increment_callback_delivery(true);
            }
            Err(err) => {
                tracing::warn!(
                    callback_uri,
                    request_id = %trace.request_id,
                    pool = %pool,
                    error = %err,
                    "Callback delivery failed"
                );
                metrics::increment_callback_delivery(false);
            }
        }
    }

    /// Turn a callback URI into a concrete HTTP target. `http`/`https` URIs
    /// are used as-is; a dotted `environment.service.api` name is resolved
    /// against the configured services.
    fn resolve_target(&self, callback_uri: &str) -> Result<CallbackTarget, &'static str> {
        if let Ok(url) = url::Url::parse(callback_uri) {
            if matches!(url.scheme(), "http" | "https") {
                let authority = url.host_str().ok_or("callback URI has no host")?.to_string();
                return Ok(CallbackTarget {
                    uri: callback_uri.to_string(),
                    authority,
                    method: Method::POST,
                });
            }
        }

        let mut parts = callback_uri.splitn(3, '.');
        let (Some(environment), Some(service), Some(api)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err("callback URI is neither http(s) nor environment.service.api");
        };

        let config = self.config.load_full();
        let Some(svc) = config.services.get(service) else {
            return Err("callback names an unknown service");
        };
        let Some(route) = svc.routes.get(api) else {
            return Err("callback names an unknown api");
        };

        tracing::debug!(environment, service, api, "Resolved discovery callback");
        Ok(CallbackTarget {
            uri: format!("{}{}", svc.endpoint.trim_end_matches('/'), route.path),
            authority: service.to_string(),
            method: Method::POST,
        })
    }
}

struct CallbackTarget {
    uri: String,
    authority: String,
    method: Method,
}

fn delivery_headers(trace: &TraceInfo, response: &MailboxResponse) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    insert_str(&mut headers, REQUEST_ID_HEADER, &trace.request_id);
    insert_str(&mut headers, TRANSACTION_ID_HEADER, &trace.transaction_id);
    insert_str(&mut headers, MAILBOX_ID_HEADER, &response.mailbox_id);
    insert_str(
        &mut headers,
        RESPONSE_STATUS_HEADER,
        &response.status.to_string(),
    );
    headers
}

fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::{GatewayConfig, RouteConfig, ServiceConfig, TransportKind},
        core::registry::ResilienceRegistry,
        metrics::ExecutionMetrics,
        ports::transport::{DownstreamTransport, TransportError, TransportResponse},
    };
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl DownstreamTransport for NullTransport {
        async fn send(
            &self,
            _request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: bytes::Bytes::new(),
            })
        }
    }

    fn dispatcher(config: GatewayConfig) -> CallbackDispatcher {
        let registry = Arc::new(ResilienceRegistry::new(&config));
        let shared = Arc::new(ArcSwap::from_pointee(config));
        let executor = CommandExecutor::new(
            shared.clone(),
            registry,
            Arc::new(NullTransport),
            Arc::new(ExecutionMetrics::new()),
        );
        CallbackDispatcher::new(executor, shared)
    }

    #[test]
    fn http_uri_resolves_directly() {
        let d = dispatcher(GatewayConfig::default());
        let target = d.resolve_target("http://client.example:9000/hook").unwrap();
        assert_eq!(target.uri, "http://client.example:9000/hook");
        assert_eq!(target.authority, "client.example");
        assert_eq!(target.method, Method::POST);
    }

    #[test]
    fn dotted_name_resolves_against_services() {
        let mut config = GatewayConfig::default();
        let mut routes = std::collections::HashMap::new();
        routes.insert("notify".to_string(), RouteConfig::new("/hooks/notify"));
        config.services.insert(
            "billing".to_string(),
            ServiceConfig {
                endpoint: "http://billing:8080".to_string(),
                transport: TransportKind::Plain,
                auth_header: None,
                routes,
                pools: std::collections::HashMap::new(),
                default_pool: None,
            },
        );

        let d = dispatcher(config);
        let target = d.resolve_target("prod.billing.notify").unwrap();
        assert_eq!(target.uri, "http://billing:8080/hooks/notify");
        assert_eq!(target.authority, "billing");
    }

    #[test]
    fn unknown_service_is_rejected() {
        let d = dispatcher(GatewayConfig::default());
        assert!(d.resolve_target("prod.nope.notify").is_err());
        assert!(d.resolve_target("not-a-uri").is_err());
    }
}
