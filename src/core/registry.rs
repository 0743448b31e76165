//! Runtime registry of resilience guards.
//!
//! One entry per resolved pool name, each holding a circuit breaker, a
//! bulkhead and a timeout budget. The registry is rebuilt additively from
//! every configuration snapshot: entries are created or adjusted in place so
//! in-flight calls keep their guards, and retired names simply stop being
//! looked up. The `default` entry always exists and backs any name that was
//! never registered.
use std::{sync::Arc, time::Duration};

use crate::{
    config::GatewayConfig,
    core::{
        breaker::{BreakerState, CircuitBreaker},
        bulkhead::Bulkhead,
        resolve::{self, DEFAULT_POOL, PoolSettings},
    },
};

/// Point-in-time gauge readings for one pool, consumed by the collector.
#[derive(Debug, Clone)]
pub struct PoolGauges {
    pub pool: String,
    pub in_flight: u32,
    pub peak_in_flight: u32,
    pub limit: u32,
    pub breaker_state: BreakerState,
}

pub struct ResilienceRegistry {
    settings: scc::HashMap<String, PoolSettings>,
    breakers: scc::HashMap<String, Arc<CircuitBreaker>>,
    bulkheads: scc::HashMap<String, Arc<Bulkhead>>,
    timeouts: scc::HashMap<String, Duration>,
}

impl ResilienceRegistry {
    pub fn new(config: &GatewayConfig) -> Self {
        let registry = Self {
            settings: scc::HashMap::new(),
            breakers: scc::HashMap::new(),
            bulkheads: scc::HashMap::new(),
            timeouts: scc::HashMap::new(),
        };
        registry.ensure(
            DEFAULT_POOL,
            &PoolSettings::process_default(&config.defaults),
        );
        registry.rebuild(config);
        registry
    }

    /// Bring the registry in line with a configuration snapshot. Idempotent:
    /// unchanged entries are left untouched, so a reload never disturbs pools
    /// whose settings did not move.
    pub fn rebuild(&self, config: &GatewayConfig) {
        self.ensure(
            DEFAULT_POOL,
            &PoolSettings::process_default(&config.defaults),
        );
        for (service_name, service) in &config.services {
            for (api_name, route) in &service.routes {
                let resolved =
                    resolve::resolve_pool(service_name, api_name, route, service, &config.defaults);
                self.ensure(&resolved.name, &resolved.settings);
            }
        }
    }

    /// Create the guards for a name, or adjust them when the settings moved.
    pub fn ensure(&self, name: &str, settings: &PoolSettings) {
        let previous = self.settings.read(name, |_, s| s.clone());

        match previous {
            Some(prev) if prev == *settings => {}
            Some(prev) => {
                if prev.concurrency != settings.concurrency {
                    if let Some(bulkhead) = self.bulkhead_entry(name) {
                        bulkhead.resize(settings.concurrency);
                    }
                }
                if prev.timeout != settings.timeout {
                    self.timeouts
                        .entry(name.to_string())
                        .and_modify(|t| *t = settings.timeout)
                        .or_insert(settings.timeout);
                }
                if prev.breaker != settings.breaker {
                    // Replacing the breaker drops its accumulated state; only
                    // done when the thresholds themselves changed.
                    let breaker = Arc::new(CircuitBreaker::new(name, settings.breaker.clone()));
                    self.breakers
                        .entry(name.to_string())
                        .and_modify(|b| *b = breaker.clone())
                        .or_insert(breaker);
                }
                self.settings
                    .entry(name.to_string())
                    .and_modify(|s| *s = settings.clone())
                    .or_insert_with(|| settings.clone());
            }
            None => {
                let _ = self.bulkheads.insert(
                    name.to_string(),
                    Arc::new(Bulkhead::new(name, settings.concurrency, settings.wait)),
                );
                let _ = self.breakers.insert(
                    name.to_string(),
                    Arc::new(CircuitBreaker::new(name, settings.breaker.clone())),
                );
                let _ = self.timeouts.insert(name.to_string(), settings.timeout);
                let _ = self.settings.insert(name.to_string(), settings.clone());
                tracing::debug!(pool = %name, limit = settings.concurrency, "Registered pool guards");
            }
        }
    }

    /// Bulkhead for a name, falling back to the default pool's.
    pub fn bulkhead(&self, name: &str) -> Arc<Bulkhead> {
        self.bulkhead_entry(name)
            .or_else(|| self.bulkhead_entry(DEFAULT_POOL))
            .expect("default pool is always registered")
    }

    /// Breaker for a name, falling back to the default pool's.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .read(name, |_, b| b.clone())
            .or_else(|| self.breakers.read(DEFAULT_POOL, |_, b| b.clone()))
            .expect("default pool is always registered")
    }

    /// Timeout budget for a name, falling back to the default pool's.
    pub fn timeout(&self, name: &str) -> Duration {
        self.timeouts
            .read(name, |_, t| *t)
            .or_else(|| self.timeouts.read(DEFAULT_POOL, |_, t| *t))
            .expect("default pool is always registered")
    }

    /// Last settings applied for a name, if it is registered.
    pub fn settings(&self, name: &str) -> Option<PoolSettings> {
        self.settings.read(name, |_, s| s.clone())
    }

    /// Gauge readings for every registered pool. Peak counters are consumed:
    /// each call restarts the peak window.
    pub fn gauges(&self) -> Vec<PoolGauges> {
        let mut out = Vec::new();
        self.bulkheads.scan(|name, bulkhead| {
            let breaker_state = self
                .breakers
                .read(name, |_, b| b.state())
                .unwrap_or(BreakerState::Closed);
            out.push(PoolGauges {
                pool: name.clone(),
                in_flight: bulkhead.in_flight(),
                peak_in_flight: bulkhead.take_peak(),
                limit: bulkhead.allowed(),
                breaker_state,
            });
        });
        out
    }

    fn bulkhead_entry(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.read(name, |_, b| b.clone())
    }
}
