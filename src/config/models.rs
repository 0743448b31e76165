//! Configuration data structures for Tollgate.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! intentionally serde-friendly and include defaults so that minimal configs remain concise.
//! The live configuration is held behind an `ArcSwap` and replaced wholesale, never mutated
//! field by field: the optimizer builds a patched copy and swaps it in one store.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    /// Downstream services keyed by service name.
    pub services: HashMap<String, ServiceConfig>,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub mailbox: MailboxConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            services: HashMap::new(),
            defaults: DefaultsConfig::default(),
            collector: CollectorConfig::default(),
            optimizer: OptimizerConfig::default(),
            mailbox: MailboxConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Sum of all reserved pool concurrency. The downstream connection pool is
    /// sized from this so shared pools can never starve the transport.
    pub fn total_concurrency(&self) -> u32 {
        let mut total = 0u32;
        for service in self.services.values() {
            for pool in service.pools.values() {
                total = total.saturating_add(pool.concurrency);
            }
            for route in service.routes.values() {
                if route.pool.is_none() && !route.shared_pool {
                    total = total
                        .saturating_add(route.concurrency.unwrap_or(self.defaults.concurrency));
                }
            }
        }
        total.max(self.defaults.concurrency)
    }

    /// Longest-prefix match of a request path against a service's routes.
    pub fn find_route<'a>(
        &'a self,
        service: &str,
        path: &str,
    ) -> Option<(&'a str, &'a RouteConfig, &'a ServiceConfig)> {
        let svc = self.services.get(service)?;
        svc.routes
            .iter()
            .filter(|(_, route)| path.starts_with(route.path.as_str()))
            .max_by_key(|(_, route)| route.path.len())
            .map(|(api, route)| (api.as_str(), route, svc))
    }
}

/// Process-wide fallback settings used when a route or pool omits a value.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Default downstream call budget in milliseconds.
    pub timeout_ms: u64,
    /// Default per-pool concurrency limit.
    pub concurrency: u32,
    /// How long a call may wait for a bulkhead slot before failing fast.
    pub bulkhead_wait_ms: u64,
    /// Budget for callback delivery when the client supplies none.
    pub callback_timeout_ms: u64,
    pub breaker: BreakerConfig,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            concurrency: 16,
            bulkhead_wait_ms: 100,
            callback_timeout_ms: 10_000,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long an open breaker rejects before probing.
    pub reset_ms: u64,
    /// Probe budget while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_ms: 30_000,
            half_open_max_calls: 3,
        }
    }
}

/// How the gateway connects to a downstream service. A tagged union rather
/// than config subclassing: transport-specific settings live in the variant.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Plain,
    Tls {
        #[serde(default)]
        danger_accept_invalid_certs: bool,
    },
}

/// One downstream service: base endpoint, its routes and optional shared pools.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Base URL, e.g. `http://orders.internal:8080`.
    pub endpoint: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Optional static Authorization header value forwarded downstream.
    #[serde(default)]
    pub auth_header: Option<String>,
    /// Routes keyed by API name.
    pub routes: HashMap<String, RouteConfig>,
    /// Named pools shareable across this service's routes.
    #[serde(default)]
    pub pools: HashMap<String, PoolConfig>,
    /// Pool used by routes that configure nothing of their own, and the
    /// target of `shared_pool` routes.
    #[serde(default)]
    pub default_pool: Option<String>,
}

/// Which execution strategy guards the downstream call.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Submit the call to a spawned task so a timeout can abort it.
    #[default]
    Pooled,
    /// Run the call on the request task; timeout drops the future in place.
    Direct,
}

/// Static response substituted on failure when fallback is enabled.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FallbackConfig {
    pub enabled: bool,
    #[serde(default = "default_fallback_status")]
    pub status: u16,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_fallback_status() -> u16 {
    200
}

/// Per-route configuration. Optional resilience fields fall back to the pool
/// or the process defaults during registry rebuild.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    /// Path prefix under the service, e.g. `/orders`.
    pub path: String,
    /// Allowed methods; empty means any.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Content type requested from the downstream.
    #[serde(default)]
    pub accept: Option<String>,
    /// Named pool declared in the service pool group.
    #[serde(default)]
    pub pool: Option<String>,
    /// Route opts into the service-wide shared pool.
    #[serde(default)]
    pub shared_pool: bool,
    #[serde(default)]
    pub concurrency: Option<u32>,
    /// Concurrency as originally configured; the optimizer caps growth
    /// relative to this, never to its own previous output.
    #[serde(default)]
    pub initial_concurrency: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
    /// Response codes treated as success; empty means any 2xx.
    #[serde(default)]
    pub acceptable_codes: Vec<u16>,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
    /// Advisory to the caller only; the gateway never retries guarded failures.
    #[serde(default)]
    pub retry_advisory: bool,
}

impl RouteConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            methods: Vec::new(),
            accept: None,
            pool: None,
            shared_pool: false,
            concurrency: None,
            initial_concurrency: None,
            timeout_ms: None,
            breaker: None,
            acceptable_codes: Vec::new(),
            strategy: ExecutionStrategy::default(),
            fallback: None,
            retry_advisory: false,
        }
    }

    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    pub fn is_acceptable_status(&self, status: u16) -> bool {
        if self.acceptable_codes.is_empty() {
            (200..300).contains(&status)
        } else {
            self.acceptable_codes.contains(&status)
        }
    }
}

/// A named concurrency pool with its own limit and timeout.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub concurrency: u32,
    #[serde(default)]
    pub initial_concurrency: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Bulkhead wait budget override in milliseconds.
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// Metrics collector cadence and cache window.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Cache entries older than this are evicted.
    pub window_secs: u64,
    /// Width of one time bucket.
    pub bucket_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            window_secs: 300,
            bucket_secs: 60,
        }
    }
}

/// Adaptive tuning parameters. The updater runs on a slower period than the
/// collector and only ever grows concurrency.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Utilization fraction of current concurrency that triggers growth.
    pub max_threshold: f64,
    /// Growth factor applied to the observed peak.
    pub multiplier: f64,
    /// Cap as a multiple of the initially configured concurrency.
    pub max_expansion_limit: f64,
    /// Concurrency is never set below this.
    pub min_concurrency: u32,
    /// Timeout is retuned to `mean latency x buffer`.
    pub timeout_buffer: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            max_threshold: 0.8,
            multiplier: 1.5,
            max_expansion_limit: 4.0,
            min_concurrency: 2,
            timeout_buffer: 3.0,
        }
    }
}

/// Which persistence backend holds mailbox records.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum MailboxStoreKind {
    #[default]
    Memory,
    Redis {
        url: String,
    },
}

/// Mailbox persistence settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MailboxConfig {
    /// Per-record time to live in seconds.
    pub ttl_secs: u64,
    pub store: MailboxStoreKind,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            store: MailboxStoreKind::Memory,
        }
    }
}
