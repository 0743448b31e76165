//! Adaptive configuration updates.
//!
//! On each cycle the updater aggregates the cached samples per pool, decides
//! whether the pool deserves more concurrency or a retuned timeout, and, when
//! anything moved, swaps in a patched configuration snapshot and rebuilds the
//! registry from it. Concurrency only ever grows: shedding load is the
//! bulkhead's job at admission time, and shrinking a hot pool under traffic
//! would amplify the very saturation the optimizer reacted to. Growth is
//! capped relative to the originally configured concurrency.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;

use crate::{
    config::{GatewayConfig, OptimizerConfig},
    core::registry::ResilienceRegistry,
    metrics::MetricKind,
    optimizer::collector::MetricsCache,
};

pub struct ConfigUpdater {
    config: Arc<ArcSwap<GatewayConfig>>,
    registry: Arc<ResilienceRegistry>,
    cache: Arc<MetricsCache>,
    /// Originally configured concurrency per pool, the base for the
    /// expansion cap. Recorded on first sight so later patches do not move
    /// the cap.
    baselines: Mutex<HashMap<String, u32>>,
}

/// Tuning decision for one pool.
#[derive(Debug, PartialEq)]
struct PoolAdjustment {
    pool: String,
    concurrency: Option<u32>,
    timeout_ms: Option<u64>,
}

impl ConfigUpdater {
    pub fn new(
        config: Arc<ArcSwap<GatewayConfig>>,
        registry: Arc<ResilienceRegistry>,
        cache: Arc<MetricsCache>,
    ) -> Self {
        Self {
            config,
            registry,
            cache,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    /// One optimization cycle. Returns how many pools were adjusted.
    pub fn run_once(&self) -> usize {
        let current = self.config.load_full();
        let options = &current.optimizer;

        let mut adjustments = Vec::new();
        for pool in self.cache.pools() {
            if let Some(adjustment) = self.evaluate_pool(&pool, options) {
                adjustments.push(adjustment);
            }
        }
        if adjustments.is_empty() {
            return 0;
        }

        let mut patched = (*current).clone();
        let mut applied = 0;
        for adjustment in adjustments {
            if apply_adjustment(&mut patched, &adjustment) {
                applied += 1;
                tracing::info!(
                    pool = %adjustment.pool,
                    concurrency = ?adjustment.concurrency,
                    timeout_ms = ?adjustment.timeout_ms,
                    "Retuned pool"
                );
            }
        }
        if applied > 0 {
            let patched = Arc::new(patched);
            self.config.store(patched.clone());
            self.registry.rebuild(&patched);
        }
        applied
    }

    fn evaluate_pool(&self, pool: &str, options: &OptimizerConfig) -> Option<PoolAdjustment> {
        let settings = self.registry.settings(pool)?;

        let baseline = match self.baselines.lock() {
            Ok(mut baselines) => *baselines
                .entry(pool.to_string())
                .or_insert(settings.initial_concurrency),
            Err(_) => settings.initial_concurrency,
        };

        let utilization = max_of(&self.cache.samples(pool, MetricKind::BulkheadUtilization));
        let max_active = max_of(&self.cache.samples(pool, MetricKind::PoolMaxActive));
        let mean_latency = avg_of(&self.cache.samples(pool, MetricKind::LatencyPercentile));

        let mut concurrency = None;
        if let (Some(utilization), Some(max_active)) = (utilization, max_active) {
            if utilization >= options.max_threshold {
                let cap = ((baseline as f64) * options.max_expansion_limit).ceil() as u32;
                let target = ((max_active * options.multiplier).ceil() as u32)
                    .clamp(options.min_concurrency, cap.max(options.min_concurrency));
                if target > settings.concurrency {
                    concurrency = Some(target);
                }
            }
        }

        let mut timeout_ms = None;
        if let Some(mean) = mean_latency {
            if mean > 0.0 {
                let current = settings.timeout.as_millis() as u64;
                let tuned = (mean * options.timeout_buffer).ceil() as u64;
                // Retune only outside the band [mean, mean * buffer]; a
                // timeout already inside it is left alone.
                if tuned > 0 && ((current as f64) < mean || current > tuned) {
                    timeout_ms = Some(tuned);
                }
            }
        }

        if concurrency.is_none() && timeout_ms.is_none() {
            return None;
        }
        Some(PoolAdjustment {
            pool: pool.to_string(),
            concurrency,
            timeout_ms,
        })
    }

    /// Run on the configured period until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let optimizer_config = self.config.load().optimizer.clone();
                let period = Duration::from_secs(optimizer_config.interval_secs.max(1));
                tokio::time::sleep(period).await;
                if !optimizer_config.enabled {
                    continue;
                }
                let adjusted = self.run_once();
                if adjusted > 0 {
                    tracing::info!(pools = adjusted, "Applied tuned configuration");
                }
            }
        })
    }
}

/// Write an adjustment back into the configuration tree, locating the pool
/// by its resolved name. Synthetic pools (`default`, `callback.*`) have no
/// configuration location and are skipped.
fn apply_adjustment(config: &mut GatewayConfig, adjustment: &PoolAdjustment) -> bool {
    let Some((service_name, remainder)) = adjustment.pool.split_once('.') else {
        return false;
    };
    let Some(service) = config.services.get_mut(service_name) else {
        return false;
    };

    let pool_name = if remainder == "shared" {
        service.default_pool.clone()
    } else if service.pools.contains_key(remainder) {
        Some(remainder.to_string())
    } else {
        None
    };

    if let Some(pool_name) = pool_name {
        let Some(pool) = service.pools.get_mut(&pool_name) else {
            return false;
        };
        if pool.initial_concurrency.is_none() {
            pool.initial_concurrency = Some(pool.concurrency);
        }
        if let Some(concurrency) = adjustment.concurrency {
            pool.concurrency = concurrency;
        }
        if let Some(timeout_ms) = adjustment.timeout_ms {
            pool.timeout_ms = Some(timeout_ms);
        }
        return true;
    }

    let Some(route) = service.routes.get_mut(remainder) else {
        return false;
    };
    if route.initial_concurrency.is_none() {
        route.initial_concurrency = route.concurrency;
    }
    if let Some(concurrency) = adjustment.concurrency {
        route.concurrency = Some(concurrency);
    }
    if let Some(timeout_ms) = adjustment.timeout_ms {
        route.timeout_ms = Some(timeout_ms);
    }
    true
}

fn max_of(samples: &[f64]) -> Option<f64> {
    samples.iter().copied().reduce(f64::max)
}

fn avg_of(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}
