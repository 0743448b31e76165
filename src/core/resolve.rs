//! Deterministic pool resolution.
//!
//! Maps a route (and its owning service) to the single name that keys the
//! circuit breaker, bulkhead and timeout tables in the resilience registry.
//! Resolution is pure: no I/O, no allocation beyond the returned name, and the
//! same configuration snapshot always yields the same answer.
use std::time::Duration;

use crate::config::{BreakerConfig, DefaultsConfig, RouteConfig, ServiceConfig};

/// Name of the process-wide fallback pool.
pub const DEFAULT_POOL: &str = "default";

/// Effective guard settings for one resolved pool name, used by the registry
/// during rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub concurrency: u32,
    pub initial_concurrency: u32,
    pub timeout: Duration,
    pub wait: Duration,
    pub breaker: BreakerConfig,
}

impl PoolSettings {
    pub fn process_default(defaults: &DefaultsConfig) -> Self {
        Self {
            concurrency: defaults.concurrency,
            initial_concurrency: defaults.concurrency,
            timeout: Duration::from_millis(defaults.timeout_ms),
            wait: Duration::from_millis(defaults.bulkhead_wait_ms),
            breaker: defaults.breaker.clone(),
        }
    }
}

/// A resolved pool: the registry key plus the settings behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPool {
    pub name: String,
    pub settings: PoolSettings,
}

/// Resolve the pool for a route. Precedence, first match wins:
/// 1. a named pool referenced by the route and declared in the service group,
/// 2. `{service}.shared` when the route opts in and the service has a default pool,
/// 3. a dedicated `{service}.{api}` pool when the route carries its own limits,
/// 4. the service-level default pool,
/// 5. the process-wide default pool.
pub fn resolve_pool(
    service_name: &str,
    api_name: &str,
    route: &RouteConfig,
    service: &ServiceConfig,
    defaults: &DefaultsConfig,
) -> ResolvedPool {
    if let Some(pool_name) = &route.pool {
        if let Some(pool) = service.pools.get(pool_name) {
            return ResolvedPool {
                name: format!("{service_name}.{pool_name}"),
                settings: settings_from_pool(pool, route, defaults),
            };
        }
    }

    if route.shared_pool {
        if let Some(default_pool) = &service.default_pool {
            if let Some(pool) = service.pools.get(default_pool) {
                return ResolvedPool {
                    name: format!("{service_name}.shared"),
                    settings: settings_from_pool(pool, route, defaults),
                };
            }
        }
    }

    if route.concurrency.is_some() || route.timeout_ms.is_some() || route.breaker.is_some() {
        let concurrency = route.concurrency.unwrap_or(defaults.concurrency);
        return ResolvedPool {
            name: format!("{service_name}.{api_name}"),
            settings: PoolSettings {
                concurrency,
                initial_concurrency: route.initial_concurrency.unwrap_or(concurrency),
                timeout: Duration::from_millis(route.timeout_ms.unwrap_or(defaults.timeout_ms)),
                wait: Duration::from_millis(defaults.bulkhead_wait_ms),
                breaker: route.breaker.clone().unwrap_or_else(|| defaults.breaker.clone()),
            },
        };
    }

    if let Some(default_pool) = &service.default_pool {
        if let Some(pool) = service.pools.get(default_pool) {
            return ResolvedPool {
                name: format!("{service_name}.{default_pool}"),
                settings: settings_from_pool(pool, route, defaults),
            };
        }
    }

    ResolvedPool {
        name: DEFAULT_POOL.to_string(),
        settings: PoolSettings::process_default(defaults),
    }
}

fn settings_from_pool(
    pool: &crate::config::PoolConfig,
    route: &RouteConfig,
    defaults: &DefaultsConfig,
) -> PoolSettings {
    PoolSettings {
        concurrency: pool.concurrency,
        initial_concurrency: pool.initial_concurrency.unwrap_or(pool.concurrency),
        timeout: Duration::from_millis(
            pool.timeout_ms
                .or(route.timeout_ms)
                .unwrap_or(defaults.timeout_ms),
        ),
        wait: Duration::from_millis(pool.wait_ms.unwrap_or(defaults.bulkhead_wait_ms)),
        breaker: route
            .breaker
            .clone()
            .unwrap_or_else(|| defaults.breaker.clone()),
    }
}
