//! Full adaptive tuning cycle: saturate a pool, collect, retune, and verify
//! the patched snapshot and the rebuilt guards.
use std::{collections::HashMap, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method};
use tollgate::{
    config::{GatewayConfig, RouteConfig, ServiceConfig, TransportKind},
    core::{
        executor::{CommandExecutor, GatewayRequest},
        registry::ResilienceRegistry,
        trace::TraceInfo,
    },
    metrics::ExecutionMetrics,
    optimizer::{ConfigUpdater, MetricsCache, MetricsCollector},
    ports::transport::{DownstreamTransport, TransportError, TransportRequest, TransportResponse},
};

struct SlowTransport {
    delay: Duration,
}

#[async_trait]
impl DownstreamTransport for SlowTransport {
    async fn send(&self, _request: TransportRequest) -> Result<TransportResponse, TransportError> {
        tokio::time::sleep(self.delay).await;
        Ok(TransportResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
    }
}

fn gateway_config() -> GatewayConfig {
    let mut route = RouteConfig::new("/orders");
    route.concurrency = Some(2);
    route.timeout_ms = Some(5_000);
    let mut routes = HashMap::new();
    routes.insert("detail".to_string(), route);
    let mut services = HashMap::new();
    services.insert(
        "orders".to_string(),
        ServiceConfig {
            endpoint: "http://orders:8080".to_string(),
            transport: TransportKind::Plain,
            auth_header: None,
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

fn request(request_id: &str) -> GatewayRequest {
    GatewayRequest {
        service: "orders".to_string(),
        path: "/orders/42".to_string(),
        method: Method::GET,
        headers: HeaderMap::new(),
        body: Bytes::new(),
        trace: TraceInfo {
            request_id: request_id.to_string(),
            transaction_id: "txn-1".to_string(),
            parent_request_id: None,
            timestamp: Utc::now(),
        },
    }
}

#[tokio::test]
async fn saturated_pool_is_grown_and_timeout_retuned() {
    let config = gateway_config();
    let registry = Arc::new(ResilienceRegistry::new(&config));
    let shared = Arc::new(ArcSwap::from_pointee(config));
    let execution = Arc::new(ExecutionMetrics::new());
    let executor = CommandExecutor::new(
        shared.clone(),
        registry.clone(),
        Arc::new(SlowTransport {
            delay: Duration::from_millis(200),
        }),
        execution.clone(),
    );

    let cache = Arc::new(MetricsCache::new(
        Duration::from_secs(300),
        Duration::from_secs(60),
    ));
    let collector = MetricsCollector::new(
        shared.clone(),
        registry.clone(),
        execution.clone(),
        cache.clone(),
    );
    let updater = ConfigUpdater::new(shared.clone(), registry.clone(), cache.clone());

    // Fill both slots of the pool.
    let mut handles = Vec::new();
    for i in 0..2 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor.execute(request(&format!("req-{i}"))).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // First pass sees the pool at full utilization.
    collector.collect_once();

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    // Second pass drains the completed calls' latency samples.
    collector.collect_once();

    assert_eq!(updater.run_once(), 1);

    let tuned = shared.load();
    let route = &tuned.services["orders"].routes["detail"];
    // Peak 2 at limit 2 is full utilization; ceil(2 * 1.5) = 3.
    assert_eq!(route.concurrency, Some(3));
    // The expansion cap stays anchored to the configured concurrency.
    assert_eq!(route.initial_concurrency, Some(2));
    // Timeout now tracks observed latency instead of the configured 5s.
    let tuned_timeout = route.timeout_ms.expect("timeout was retuned");
    assert!(tuned_timeout < 5_000);
    assert!(tuned_timeout >= 200);

    // The live guards follow the patched snapshot.
    assert_eq!(registry.bulkhead("orders.detail").allowed(), 3);
    assert_eq!(
        registry.timeout("orders.detail"),
        Duration::from_millis(tuned_timeout)
    );
}

#[tokio::test]
async fn quiet_cycle_never_shrinks_a_grown_pool() {
    let config = gateway_config();
    let registry = Arc::new(ResilienceRegistry::new(&config));
    let shared = Arc::new(ArcSwap::from_pointee(config));
    let execution = Arc::new(ExecutionMetrics::new());
    let executor = CommandExecutor::new(
        shared.clone(),
        registry.clone(),
        Arc::new(SlowTransport {
            delay: Duration::from_millis(100),
        }),
        execution.clone(),
    );

    let cache = Arc::new(MetricsCache::new(
        Duration::from_secs(300),
        Duration::from_secs(60),
    ));
    let collector = MetricsCollector::new(
        shared.clone(),
        registry.clone(),
        execution.clone(),
        cache.clone(),
    );
    let updater = ConfigUpdater::new(shared.clone(), registry.clone(), cache.clone());

    // Saturate once so the pool grows.
    let mut handles = Vec::new();
    for i in 0..2 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor.execute(request(&format!("req-{i}"))).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    collector.collect_once();
    for handle in handles {
        let _ = handle.await.unwrap();
    }
    assert!(updater.run_once() >= 1);

    let grown = shared.load().services["orders"].routes["detail"].concurrency;
    assert_eq!(grown, Some(3));

    // A later idle pass leaves the grown limit in place.
    collector.collect_once();
    updater.run_once();
    assert_eq!(
        shared.load().services["orders"].routes["detail"].concurrency,
        Some(3)
    );
    assert_eq!(registry.bulkhead("orders.detail").allowed(), 3);
}
