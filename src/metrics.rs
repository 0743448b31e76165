//! Lightweight metrics helpers for Tollgate.
//!
//! This module exposes a small set of convenience functions wrapping the
//! `metrics` crate macros. It intentionally avoids embedding a concrete
//! exporter (the application can initialize any compatible recorder
//! externally) while still documenting and describing Tollgate-specific
//! metric names.
//!
//! Provided metrics (labels vary by family):
//! * `tollgate_calls_total` (counter, labels: pool, outcome)
//! * `tollgate_call_duration_seconds` (histogram, labels: pool)
//! * `tollgate_bulkhead_rejections_total` (counter, labels: pool)
//! * `tollgate_bulkhead_in_flight` (gauge, labels: pool)
//! * `tollgate_bulkhead_limit` (gauge, labels: pool)
//! * `tollgate_breaker_state` (gauge, labels: pool; 0 closed, 1 open, 2 half-open)
//! * `tollgate_mailbox_requests_total` (counter, labels: mode)
//! * `tollgate_callback_deliveries_total` (counter, labels: outcome)
//! * `tollgate_config_reloads_total` (counter)
//!
//! Alongside the recorder macros, [`ExecutionMetrics`] keeps an owned,
//! structured view of per-pool latency samples. The adaptive optimizer reads
//! typed [`MetricSample`] values from it instead of parsing exported metric
//! names back apart.
use std::{collections::HashMap, sync::Mutex, time::Duration};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

// Tollgate-specific metric names
pub const TOLLGATE_CALLS_TOTAL: &str = "tollgate_calls_total";
pub const TOLLGATE_CALL_DURATION_SECONDS: &str = "tollgate_call_duration_seconds";
pub const TOLLGATE_BULKHEAD_REJECTIONS_TOTAL: &str = "tollgate_bulkhead_rejections_total";
pub const TOLLGATE_BULKHEAD_IN_FLIGHT: &str = "tollgate_bulkhead_in_flight";
pub const TOLLGATE_BULKHEAD_LIMIT: &str = "tollgate_bulkhead_limit";
pub const TOLLGATE_BREAKER_STATE: &str = "tollgate_breaker_state";
pub const TOLLGATE_MAILBOX_REQUESTS_TOTAL: &str = "tollgate_mailbox_requests_total";
pub const TOLLGATE_CALLBACK_DELIVERIES_TOTAL: &str = "tollgate_callback_deliveries_total";
pub const TOLLGATE_CONFIG_RELOADS_TOTAL: &str = "tollgate_config_reloads_total";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        TOLLGATE_CALLS_TOTAL,
        Unit::Count,
        "Total number of guarded downstream calls, by pool and outcome."
    );
    describe_histogram!(
        TOLLGATE_CALL_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of guarded downstream calls, by pool."
    );
    describe_counter!(
        TOLLGATE_BULKHEAD_REJECTIONS_TOTAL,
        Unit::Count,
        "Calls shed at bulkhead admission because the pool was full."
    );
    describe_gauge!(
        TOLLGATE_BULKHEAD_IN_FLIGHT,
        "Calls currently holding a slot in a pool's bulkhead."
    );
    describe_gauge!(
        TOLLGATE_BULKHEAD_LIMIT,
        "Configured concurrency limit of a pool's bulkhead."
    );
    describe_gauge!(
        TOLLGATE_BREAKER_STATE,
        "Circuit breaker state per pool (0 closed, 1 open, 2 half-open)."
    );
    describe_counter!(
        TOLLGATE_MAILBOX_REQUESTS_TOTAL,
        Unit::Count,
        "Mailbox submissions accepted, by call mode."
    );
    describe_counter!(
        TOLLGATE_CALLBACK_DELIVERIES_TOTAL,
        Unit::Count,
        "Callback delivery attempts, by outcome."
    );
    describe_counter!(
        TOLLGATE_CONFIG_RELOADS_TOTAL,
        Unit::Count,
        "Configuration snapshots applied at runtime."
    );
});

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&DESCRIBED);
    tracing::info!("Tollgate metrics system initialized");
    Ok(())
}

/// Count one finished guarded call. `outcome` is "success" or an error tag.
pub fn increment_call_total(pool: &str, outcome: &str) {
    counter!(
        TOLLGATE_CALLS_TOTAL,
        "pool" => pool.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a completed call's duration.
pub fn record_call_duration(pool: &str, duration: Duration) {
    histogram!(
        TOLLGATE_CALL_DURATION_SECONDS,
        "pool" => pool.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Count one call shed at bulkhead admission.
pub fn increment_bulkhead_rejection(pool: &str) {
    counter!(TOLLGATE_BULKHEAD_REJECTIONS_TOTAL, "pool" => pool.to_string()).increment(1);
}

/// Publish a pool's bulkhead occupancy and limit.
pub fn set_bulkhead_gauges(pool: &str, in_flight: u32, limit: u32) {
    gauge!(TOLLGATE_BULKHEAD_IN_FLIGHT, "pool" => pool.to_string()).set(in_flight as f64);
    gauge!(TOLLGATE_BULKHEAD_LIMIT, "pool" => pool.to_string()).set(limit as f64);
}

/// Publish a pool's breaker state (0 closed, 1 open, 2 half-open).
pub fn set_breaker_state(pool: &str, state: u8) {
    gauge!(TOLLGATE_BREAKER_STATE, "pool" => pool.to_string()).set(state as f64);
}

/// Count a mailbox submission by call mode.
pub fn increment_mailbox_request(mode: &str) {
    counter!(TOLLGATE_MAILBOX_REQUESTS_TOTAL, "mode" => mode.to_string()).increment(1);
}

/// Count a callback delivery attempt.
pub fn increment_callback_delivery(success: bool) {
    let outcome = if success { "delivered" } else { "failed" };
    counter!(TOLLGATE_CALLBACK_DELIVERIES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Count an applied configuration snapshot.
pub fn increment_config_reload() {
    counter!(TOLLGATE_CONFIG_RELOADS_TOTAL).increment(1);
}

/// What a structured sample measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Peak concurrent calls observed in a pool during a window.
    PoolMaxActive,
    /// Peak occupancy divided by the pool's limit, 0.0..=1.0.
    BulkheadUtilization,
    /// A single call latency observation, in milliseconds.
    LatencyPercentile,
}

/// One structured observation attributed to a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub pool: String,
    pub kind: MetricKind,
    pub value: f64,
}

/// Owned per-pool latency buffers, drained by the metrics collector.
///
/// The executor records every call here in addition to the recorder macros;
/// draining returns raw millisecond samples grouped by pool so downstream
/// consumers aggregate however they need.
#[derive(Default)]
pub struct ExecutionMetrics {
    latencies: Mutex<HashMap<String, Vec<f64>>>,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call latency against a pool.
    pub fn record_latency(&self, pool: &str, duration: Duration) {
        record_call_duration(pool, duration);
        if let Ok(mut buffers) = self.latencies.lock() {
            buffers
                .entry(pool.to_string())
                .or_default()
                .push(duration.as_secs_f64() * 1_000.0);
        }
    }

    /// Drain all buffered latency samples, leaving the buffers empty.
    pub fn take_latency_samples(&self) -> HashMap<String, Vec<f64>> {
        match self.latencies.lock() {
            Ok(mut buffers) => std::mem::take(&mut *buffers),
            Err(_) => HashMap::new(),
        }
    }
}
