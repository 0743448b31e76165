//! Metrics collection for the adaptive optimizer.
//!
//! The collector runs on a short period, drains the executor's latency
//! buffers, reads pool gauges from the registry, and files everything into a
//! time-bucketed cache. The updater later aggregates over the cache window.
//! Expiry is lazy: stale buckets are dropped on each collection pass, and the
//! per-pool index is cleaned alongside them.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;

use crate::{
    config::GatewayConfig,
    core::{breaker::BreakerState, registry::ResilienceRegistry},
    metrics::{self, ExecutionMetrics, MetricKind, MetricSample},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    bucket: i64,
    pool: String,
    kind: MetricKind,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, Vec<f64>>,
    /// Which buckets each pool has written to, so expiry never scans the
    /// whole entry table per pool.
    by_pool: HashMap<String, HashSet<i64>>,
}

/// Time-bucketed sample cache shared by the collector and the updater.
pub struct MetricsCache {
    window_secs: i64,
    bucket_secs: i64,
    inner: Mutex<CacheInner>,
}

impl MetricsCache {
    pub fn new(window: Duration, bucket: Duration) -> Self {
        Self {
            window_secs: window.as_secs().max(1) as i64,
            bucket_secs: bucket.as_secs().max(1) as i64,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// File one sample under the bucket containing `now_secs` (unix time).
    pub fn insert_at(&self, now_secs: i64, sample: MetricSample) {
        let bucket = now_secs - now_secs.rem_euclid(self.bucket_secs);
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner
            .by_pool
            .entry(sample.pool.clone())
            .or_default()
            .insert(bucket);
        inner
            .entries
            .entry(CacheKey {
                bucket,
                pool: sample.pool,
                kind: sample.kind,
            })
            .or_default()
            .push(sample.value);
    }

    pub fn insert(&self, sample: MetricSample) {
        self.insert_at(chrono::Utc::now().timestamp(), sample);
    }

    /// All samples of one kind for a pool that are still inside the window.
    pub fn samples_at(&self, now_secs: i64, pool: &str, kind: MetricKind) -> Vec<f64> {
        let oldest = now_secs - self.window_secs;
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let Some(buckets) = inner.by_pool.get(pool) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for bucket in buckets {
            if *bucket < oldest {
                continue;
            }
            if let Some(values) = inner.entries.get(&CacheKey {
                bucket: *bucket,
                pool: pool.to_string(),
                kind,
            }) {
                out.extend_from_slice(values);
            }
        }
        out
    }

    pub fn samples(&self, pool: &str, kind: MetricKind) -> Vec<f64> {
        self.samples_at(chrono::Utc::now().timestamp(), pool, kind)
    }

    /// Pools with at least one live sample.
    pub fn pools(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(inner) => inner
                .by_pool
                .iter()
                .filter(|(_, buckets)| !buckets.is_empty())
                .map(|(pool, _)| pool.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Drop buckets that fell out of the window, cleaning the pool index.
    pub fn purge_expired_at(&self, now_secs: i64) {
        let oldest = now_secs - self.window_secs;
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.entries.retain(|key, _| key.bucket >= oldest);
        inner.by_pool.retain(|_, buckets| {
            buckets.retain(|bucket| *bucket >= oldest);
            !buckets.is_empty()
        });
    }

    pub fn purge_expired(&self) {
        self.purge_expired_at(chrono::Utc::now().timestamp());
    }
}

/// Periodic task feeding the cache from the live gauges and latency buffers.
pub struct MetricsCollector {
    config: Arc<ArcSwap<GatewayConfig>>,
    registry: Arc<ResilienceRegistry>,
    execution: Arc<ExecutionMetrics>,
    cache: Arc<MetricsCache>,
}

impl MetricsCollector {
    pub fn new(
        config: Arc<ArcSwap<GatewayConfig>>,
        registry: Arc<ResilienceRegistry>,
        execution: Arc<ExecutionMetrics>,
        cache: Arc<MetricsCache>,
    ) -> Self {
        Self {
            config,
            registry,
            execution,
            cache,
        }
    }

    /// One collection pass: drain latencies, snapshot gauges, expire.
    pub fn collect_once(&self) {
        let now = chrono::Utc::now().timestamp();

        for (pool, samples) in self.execution.take_latency_samples() {
            for value in samples {
                self.cache.insert_at(
                    now,
                    MetricSample {
                        pool: pool.clone(),
                        kind: MetricKind::LatencyPercentile,
                        value,
                    },
                );
            }
        }

        for gauge in self.registry.gauges() {
            metrics::set_bulkhead_gauges(&gauge.pool, gauge.in_flight, gauge.limit);
            metrics::set_breaker_state(
                &gauge.pool,
                match gauge.breaker_state {
                    BreakerState::Closed => 0,
                    BreakerState::Open => 1,
                    BreakerState::HalfOpen => 2,
                },
            );

            self.cache.insert_at(
                now,
                MetricSample {
                    pool: gauge.pool.clone(),
                    kind: MetricKind::PoolMaxActive,
                    value: gauge.peak_in_flight as f64,
                },
            );
            if gauge.limit > 0 {
                self.cache.insert_at(
                    now,
                    MetricSample {
                        pool: gauge.pool,
                        kind: MetricKind::BulkheadUtilization,
                        value: gauge.peak_in_flight as f64 / gauge.limit as f64,
                    },
                );
            }
        }

        self.cache.purge_expired_at(now);
    }

    /// Run on the configured period until the task is aborted. Re-reads the
    /// configuration every tick so a reload can change cadence or disable
    /// collection without a restart.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let collector_config = self.config.load().collector.clone();
                let period = Duration::from_secs(collector_config.interval_secs.max(1));
                tokio::time::sleep(period).await;
                if !collector_config.enabled {
                    continue;
                }
                self.collect_once();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pool: &str, kind: MetricKind, value: f64) -> MetricSample {
        MetricSample {
            pool: pool.to_string(),
            kind,
            value,
        }
    }

    #[test]
    fn groups_samples_by_pool_and_kind() {
        let cache = MetricsCache::new(Duration::from_secs(300), Duration::from_secs(60));
        cache.insert_at(1_000, sample("a", MetricKind::PoolMaxActive, 3.0));
        cache.insert_at(1_010, sample("a", MetricKind::PoolMaxActive, 5.0));
        cache.insert_at(1_010, sample("a", MetricKind::LatencyPercentile, 42.0));
        cache.insert_at(1_010, sample("b", MetricKind::PoolMaxActive, 1.0));

        let mut values = cache.samples_at(1_020, "a", MetricKind::PoolMaxActive);
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![3.0, 5.0]);
        assert_eq!(
            cache.samples_at(1_020, "a", MetricKind::LatencyPercentile),
            vec![42.0]
        );
        assert_eq!(cache.samples_at(1_020, "b", MetricKind::LatencyPercentile), Vec::<f64>::new());
    }

    #[test]
    fn window_excludes_old_buckets() {
        let cache = MetricsCache::new(Duration::from_secs(120), Duration::from_secs(60));
        cache.insert_at(0, sample("a", MetricKind::PoolMaxActive, 9.0));
        cache.insert_at(500, sample("a", MetricKind::PoolMaxActive, 2.0));

        let values = cache.samples_at(500, "a", MetricKind::PoolMaxActive);
        assert_eq!(values, vec![2.0]);
    }

    #[test]
    fn purge_drops_expired_buckets_and_index_entries() {
        let cache = MetricsCache::new(Duration::from_secs(120), Duration::from_secs(60));
        cache.insert_at(0, sample("old", MetricKind::PoolMaxActive, 9.0));
        cache.insert_at(600, sample("fresh", MetricKind::PoolMaxActive, 1.0));

        cache.purge_expired_at(600);
        assert_eq!(cache.pools(), vec!["fresh".to_string()]);
        assert!(cache.samples_at(600, "old", MetricKind::PoolMaxActive).is_empty());
    }

    #[test]
    fn same_bucket_accumulates() {
        let cache = MetricsCache::new(Duration::from_secs(300), Duration::from_secs(60));
        cache.insert_at(100, sample("a", MetricKind::LatencyPercentile, 10.0));
        cache.insert_at(110, sample("a", MetricKind::LatencyPercentile, 20.0));
        assert_eq!(
            cache.samples_at(120, "a", MetricKind::LatencyPercentile).len(),
            2
        );
    }
}
