//! Guarded command execution.
//!
//! The executor is the single funnel for every downstream call, regardless of
//! call mode: it resolves the route to a pool, then applies the guards in a
//! fixed order. Bulkhead admission comes first so a saturated pool sheds load
//! before anything else is spent on the call, the breaker check follows, and
//! the timeout bounds only the transport call itself. Guarded failures are
//! never retried here; retry-on-transient lives inside the transport adapter.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use http::{HeaderMap, HeaderValue, Method, header};
use tokio::task::JoinHandle;

use crate::{
    config::{ExecutionStrategy, FallbackConfig, GatewayConfig},
    core::{
        error::{GatewayError, GatewayResult},
        registry::ResilienceRegistry,
        resolve,
        trace::{
            PARENT_REQUEST_ID_HEADER, REQUEST_ID_HEADER, TIMESTAMP_HEADER, TRANSACTION_ID_HEADER,
            TraceInfo,
        },
    },
    metrics::{self, ExecutionMetrics},
    ports::transport::{DownstreamTransport, TransportRequest, TransportResponse},
};

/// One inbound call, already stamped with its trace identity.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub service: String,
    pub path: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trace: TraceInfo,
}

/// Buffered result returned to the caller (or persisted to a mailbox).
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct CommandExecutor {
    config: Arc<ArcSwap<GatewayConfig>>,
    registry: Arc<ResilienceRegistry>,
    transport: Arc<dyn DownstreamTransport>,
    metrics: Arc<ExecutionMetrics>,
}

impl CommandExecutor {
    pub fn new(
        config: Arc<ArcSwap<GatewayConfig>>,
        registry: Arc<ResilienceRegistry>,
        transport: Arc<dyn DownstreamTransport>,
        metrics: Arc<ExecutionMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            transport,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ResilienceRegistry> {
        &self.registry
    }

    /// Execute one routed call through its guards.
    pub async fn execute(&self, request: GatewayRequest) -> GatewayResult<GatewayResponse> {
        let config = self.config.load_full();

        let Some((api, route, service)) = config.find_route(&request.service, &request.path)
        else {
            return Err(GatewayError::BadRequest(format!(
                "no route for '{}{}'",
                request.service, request.path
            )));
        };
        if !route.allows_method(request.method.as_str()) {
            return Err(GatewayError::BadRequest(format!(
                "method {} not allowed on '{}'",
                request.method, route.path
            )));
        }

        let resolved =
            resolve::resolve_pool(&request.service, api, route, service, &config.defaults);
        self.registry.ensure(&resolved.name, &resolved.settings);

        let downstream = build_transport_request(&request, &service.endpoint, service, route);
        let acceptable = |status: u16| route.is_acceptable_status(status);
        let fallback = route.fallback.clone();
        let strategy = route.strategy;

        let outcome = self
            .execute_guarded(&resolved.name, strategy, downstream, acceptable)
            .await;

        match outcome {
            Ok(response) => {
                tracing::info!(
                    service = %request.service,
                    api = %api,
                    pool = %resolved.name,
                    status = response.status,
                    request_id = %request.trace.request_id,
                    transaction_id = %request.trace.transaction_id,
                    "Call completed"
                );
                Ok(GatewayResponse {
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                })
            }
            Err(err) => {
                tracing::warn!(
                    service = %request.service,
                    api = %api,
                    pool = %resolved.name,
                    error = %err,
                    kind = err.kind(),
                    request_id = %request.trace.request_id,
                    transaction_id = %request.trace.transaction_id,
                    "Call failed"
                );
                match fallback {
                    Some(fb) if fb.enabled && err.status_code().is_server_error() => {
                        Ok(fallback_response(&fb))
                    }
                    _ => Err(err),
                }
            }
        }
    }

    /// Execute in a detached task, for call modes that answer before the
    /// downstream work finishes.
    pub fn execute_spawned(
        &self,
        request: GatewayRequest,
    ) -> JoinHandle<GatewayResult<GatewayResponse>> {
        let executor = self.clone();
        tokio::spawn(async move { executor.execute(request).await })
    }

    /// Stream-shaped surface for callers that consume all responses as
    /// streams. Yields exactly one element.
    pub fn execute_stream(
        &self,
        request: GatewayRequest,
    ) -> BoxStream<'static, GatewayResult<GatewayResponse>> {
        let executor = self.clone();
        Box::pin(futures_util::stream::once(async move {
            executor.execute(request).await
        }))
    }

    /// Run one already-resolved call through the guard chain. Used by the
    /// routed path above and directly by callers that manage their own pool
    /// names, such as callback delivery.
    pub async fn execute_guarded(
        &self,
        pool: &str,
        strategy: ExecutionStrategy,
        request: TransportRequest,
        acceptable: impl Fn(u16) -> bool,
    ) -> GatewayResult<TransportResponse> {
        let bulkhead = self.registry.bulkhead(pool);
        let _permit = match bulkhead.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                metrics::increment_bulkhead_rejection(pool);
                return Err(err);
            }
        };

        let breaker = self.registry.breaker(pool);
        if !breaker.allow_call() {
            metrics::increment_call_total(pool, "circuit_open");
            return Err(GatewayError::CircuitOpen {
                name: pool.to_string(),
            });
        }

        let budget = self.registry.timeout(pool);
        let started = std::time::Instant::now();
        let result = self.call_with_budget(strategy, budget, pool, request).await;
        self.metrics.record_latency(pool, started.elapsed());

        match result {
            Ok(response) if acceptable(response.status) => {
                breaker.record_success();
                metrics::increment_call_total(pool, "success");
                Ok(response)
            }
            Ok(response) => {
                breaker.record_failure();
                let err = GatewayError::DownstreamCallFailure {
                    status: response.status,
                };
                metrics::increment_call_total(pool, err.kind());
                Err(err)
            }
            Err(err) => {
                breaker.record_failure();
                metrics::increment_call_total(pool, err.kind());
                Err(err)
            }
        }
    }

    async fn call_with_budget(
        &self,
        strategy: ExecutionStrategy,
        budget: Duration,
        pool: &str,
        request: TransportRequest,
    ) -> GatewayResult<TransportResponse> {
        let timeout_err = || GatewayError::Timeout {
            pool: pool.to_string(),
            budget_ms: budget.as_millis() as u64,
        };

        match strategy {
            ExecutionStrategy::Pooled => {
                let transport = self.transport.clone();
                let mut handle = tokio::spawn(async move { transport.send(request).await });
                match tokio::time::timeout(budget, &mut handle).await {
                    Ok(Ok(result)) => result.map_err(GatewayError::from),
                    Ok(Err(join_err)) => Err(GatewayError::ServiceError(join_err.to_string())),
                    Err(_) => {
                        handle.abort();
                        Err(timeout_err())
                    }
                }
            }
            ExecutionStrategy::Direct => {
                match tokio::time::timeout(budget, self.transport.send(request)).await {
                    Ok(result) => result.map_err(GatewayError::from),
                    Err(_) => Err(timeout_err()),
                }
            }
        }
    }
}

fn fallback_response(fallback: &FallbackConfig) -> GatewayResponse {
    GatewayResponse {
        status: fallback.status,
        headers: HeaderMap::new(),
        body: fallback
            .body
            .as_ref()
            .map(|b| Bytes::from(b.clone()))
            .unwrap_or_default(),
    }
}

fn build_transport_request(
    request: &GatewayRequest,
    endpoint: &str,
    service: &crate::config::ServiceConfig,
    route: &crate::config::RouteConfig,
) -> TransportRequest {
    let mut headers = request.headers.clone();
    headers.remove(header::HOST);

    insert_str(&mut headers, REQUEST_ID_HEADER, &request.trace.request_id);
    insert_str(
        &mut headers,
        TRANSACTION_ID_HEADER,
        &request.trace.transaction_id,
    );
    if let Some(parent) = &request.trace.parent_request_id {
        insert_str(&mut headers, PARENT_REQUEST_ID_HEADER, parent);
    }
    insert_str(
        &mut headers,
        TIMESTAMP_HEADER,
        &request.trace.timestamp.to_rfc3339(),
    );
    if let Some(auth) = &service.auth_header {
        if let Ok(value) = HeaderValue::from_str(auth) {
            headers.insert(header::AUTHORIZATION, value);
        }
    }
    if let Some(accept) = &route.accept {
        if let Ok(value) = HeaderValue::from_str(accept) {
            headers.insert(header::ACCEPT, value);
        }
    }

    TransportRequest {
        method: request.method.clone(),
        uri: format!("{}{}", endpoint.trim_end_matches('/'), request.path),
        headers,
        body: request.body.clone(),
    }
}

fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
    };

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::{
        config::{BreakerConfig, RouteConfig, ServiceConfig, TransportKind},
        ports::transport::TransportError,
    };

    struct ScriptedTransport {
        status: u16,
        delay: Duration,
        fail_connect: bool,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn ok(status: u16) -> Self {
            Self {
                status,
                delay: Duration::ZERO,
                fail_connect: false,
                calls: AtomicU32::new(0),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                status: 200,
                delay,
                fail_connect: false,
                calls: AtomicU32::new(0),
            }
        }

        fn broken() -> Self {
            Self {
                status: 0,
                delay: Duration::ZERO,
                fail_connect: true,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DownstreamTransport for ScriptedTransport {
        async fn send(
            &self,
            _request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_connect {
                return Err(TransportError::Connection("refused".to_string()));
            }
            Ok(TransportResponse {
                status: self.status,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"ok"),
            })
        }
    }

    fn test_config(route: RouteConfig) -> GatewayConfig {
        let mut routes = HashMap::new();
        routes.insert("detail".to_string(), route);
        let mut services = HashMap::new();
        services.insert(
            "orders".to_string(),
            ServiceConfig {
                endpoint: "http://orders:8080".to_string(),
                transport: TransportKind::Plain,
                auth_header: Some("Bearer token".to_string()),
                routes,
                pools: HashMap::new(),
                default_pool: None,
            },
        );
        GatewayConfig {
            services,
            ..GatewayConfig::default()
        }
    }

    fn executor_for(
        config: GatewayConfig,
        transport: Arc<dyn DownstreamTransport>,
    ) -> CommandExecutor {
        let registry = Arc::new(ResilienceRegistry::new(&config));
        CommandExecutor::new(
            Arc::new(ArcSwap::from_pointee(config)),
            registry,
            transport,
            Arc::new(ExecutionMetrics::new()),
        )
    }

    fn request(path: &str) -> GatewayRequest {
        GatewayRequest {
            service: "orders".to_string(),
            path: path.to_string(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            trace: TraceInfo {
                request_id: "req-1".to_string(),
                transaction_id: "txn-1".to_string(),
                parent_request_id: None,
                timestamp: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn routes_and_returns_success() {
        let executor = executor_for(
            test_config(RouteConfig::new("/orders")),
            Arc::new(ScriptedTransport::ok(200)),
        );
        let response = executor.execute(request("/orders/42")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn stream_surface_yields_exactly_one_response() {
        use futures_util::StreamExt;

        let executor = executor_for(
            test_config(RouteConfig::new("/orders")),
            Arc::new(ScriptedTransport::ok(200)),
        );
        let mut stream = executor.execute_stream(request("/orders/42"));
        let first = stream.next().await.expect("one element").unwrap();
        assert_eq!(first.status, 200);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_route_is_bad_request() {
        let executor = executor_for(
            test_config(RouteConfig::new("/orders")),
            Arc::new(ScriptedTransport::ok(200)),
        );
        let err = executor.execute(request("/payments")).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn disallowed_method_is_bad_request() {
        let mut route = RouteConfig::new("/orders");
        route.methods = vec!["POST".to_string()];
        let executor = executor_for(test_config(route), Arc::new(ScriptedTransport::ok(200)));
        let err = executor.execute(request("/orders/42")).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn unacceptable_status_is_downstream_failure() {
        let executor = executor_for(
            test_config(RouteConfig::new("/orders")),
            Arc::new(ScriptedTransport::ok(500)),
        );
        let err = executor.execute(request("/orders/42")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::DownstreamCallFailure { status: 500 }
        ));
    }

    #[tokio::test]
    async fn acceptable_codes_override_2xx_default() {
        let mut route = RouteConfig::new("/orders");
        route.acceptable_codes = vec![404];
        let executor = executor_for(test_config(route), Arc::new(ScriptedTransport::ok(404)));
        let response = executor.execute(request("/orders/42")).await.unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let mut route = RouteConfig::new("/orders");
        route.timeout_ms = Some(30);
        let executor = executor_for(
            test_config(route),
            Arc::new(ScriptedTransport::slow(Duration::from_millis(200))),
        );
        let err = executor.execute(request("/orders/42")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { budget_ms: 30, .. }));
    }

    #[tokio::test]
    async fn direct_strategy_times_out_too() {
        let mut route = RouteConfig::new("/orders");
        route.timeout_ms = Some(30);
        route.strategy = ExecutionStrategy::Direct;
        let executor = executor_for(
            test_config(route),
            Arc::new(ScriptedTransport::slow(Duration::from_millis(200))),
        );
        let err = executor.execute(request("/orders/42")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
    }

    #[tokio::test]
    async fn timed_out_pooled_call_is_aborted() {
        struct FlaggingTransport {
            completed: Arc<AtomicBool>,
        }

        #[async_trait]
        impl DownstreamTransport for FlaggingTransport {
            async fn send(
                &self,
                _request: TransportRequest,
            ) -> Result<TransportResponse, TransportError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                self.completed.store(true, Ordering::SeqCst);
                Ok(TransportResponse {
                    status: 200,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                })
            }
        }

        let mut route = RouteConfig::new("/orders");
        route.timeout_ms = Some(30);
        let completed = Arc::new(AtomicBool::new(false));
        let executor = executor_for(
            test_config(route),
            Arc::new(FlaggingTransport {
                completed: completed.clone(),
            }),
        );

        let err = executor.execute(request("/orders/42")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));

        // The spawned call was aborted, not left to finish in the background.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!completed.load(Ordering::SeqCst));
    }

    #[test]
    fn bulkhead_rejection_increments_its_counter() {
        use ::metrics::{
            Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString,
            Unit, with_local_recorder,
        };

        #[derive(Default)]
        struct CounterSpy {
            counts: Arc<Mutex<HashMap<String, u64>>>,
        }

        struct SpyHandle {
            name: String,
            counts: Arc<Mutex<HashMap<String, u64>>>,
        }

        impl CounterFn for SpyHandle {
            fn increment(&self, value: u64) {
                *self
                    .counts
                    .lock()
                    .unwrap()
                    .entry(self.name.clone())
                    .or_default() += value;
            }

            fn absolute(&self, _value: u64) {}
        }

        impl Recorder for CounterSpy {
            fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

            fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

            fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

            fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
                Counter::from_arc(Arc::new(SpyHandle {
                    name: key.name().to_string(),
                    counts: self.counts.clone(),
                }))
            }

            fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
                Gauge::noop()
            }

            fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
                Histogram::noop()
            }
        }

        let spy = CounterSpy::default();
        let counts = spy.counts.clone();

        with_local_recorder(&spy, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            runtime.block_on(async {
                let mut route = RouteConfig::new("/orders");
                route.concurrency = Some(1);
                route.timeout_ms = Some(2_000);
                let executor = executor_for(
                    test_config(route),
                    Arc::new(ScriptedTransport::slow(Duration::from_millis(400))),
                );

                let background = {
                    let executor = executor.clone();
                    tokio::spawn(async move { executor.execute(request("/orders/1")).await })
                };
                tokio::time::sleep(Duration::from_millis(50)).await;

                let err = executor.execute(request("/orders/2")).await.unwrap_err();
                assert!(matches!(err, GatewayError::BulkheadFull { .. }));
                let _ = background.await;
            });
        });

        assert_eq!(
            counts
                .lock()
                .unwrap()
                .get(crate::metrics::TOLLGATE_BULKHEAD_REJECTIONS_TOTAL),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn saturated_pool_sheds_load() {
        let mut route = RouteConfig::new("/orders");
        route.concurrency = Some(1);
        route.timeout_ms = Some(2_000);
        let executor = executor_for(
            test_config(route),
            Arc::new(ScriptedTransport::slow(Duration::from_millis(400))),
        );

        let background = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(request("/orders/1")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = executor.execute(request("/orders/2")).await.unwrap_err();
        assert!(matches!(err, GatewayError::BulkheadFull { .. }));
        assert!(background.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling_downstream() {
        let mut route = RouteConfig::new("/orders");
        route.breaker = Some(BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            reset_ms: 60_000,
            half_open_max_calls: 1,
        });
        let transport = Arc::new(ScriptedTransport::broken());
        let executor = executor_for(test_config(route), transport.clone());

        for _ in 0..2 {
            let _ = executor.execute(request("/orders/42")).await;
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        let err = executor.execute(request("/orders/42")).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        // The third attempt never reached the transport.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fallback_substitutes_guarded_failures() {
        let mut route = RouteConfig::new("/orders");
        route.fallback = Some(FallbackConfig {
            enabled: true,
            status: 200,
            body: Some("{\"cached\":true}".to_string()),
        });
        let executor = executor_for(test_config(route), Arc::new(ScriptedTransport::broken()));

        let response = executor.execute(request("/orders/42")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from("{\"cached\":true}"));
    }

    #[tokio::test]
    async fn bad_requests_never_fall_back() {
        let mut route = RouteConfig::new("/orders");
        route.methods = vec!["POST".to_string()];
        route.fallback = Some(FallbackConfig {
            enabled: true,
            status: 200,
            body: None,
        });
        let executor = executor_for(test_config(route), Arc::new(ScriptedTransport::ok(200)));
        assert!(executor.execute(request("/orders/42")).await.is_err());
    }
}
