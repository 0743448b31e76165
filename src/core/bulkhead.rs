//! Semaphore-backed concurrency limiter ("bulkhead").
//!
//! Each named pool owns one bulkhead. Acquisition waits up to the pool's
//! configured budget and then fails fast; it never queues unboundedly. The
//! limiter tracks in-flight and peak-in-flight counts for the metrics surface.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::error::{GatewayError, GatewayResult};

pub struct Bulkhead {
    name: String,
    semaphore: Arc<Semaphore>,
    limit: AtomicU32,
    wait: Duration,
    in_flight: Arc<AtomicU32>,
    peak_in_flight: Arc<AtomicU32>,
}

/// RAII guard for one admitted call. Dropping it releases the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicU32>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, limit: u32, wait: Duration) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(limit as usize)),
            limit: AtomicU32::new(limit),
            wait,
            in_flight: Arc::new(AtomicU32::new(0)),
            peak_in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Acquire a slot within the wait budget, or fail fast.
    pub async fn acquire(&self) -> GatewayResult<BulkheadPermit> {
        let acquired =
            tokio::time::timeout(self.wait, self.semaphore.clone().acquire_owned()).await;

        match acquired {
            Ok(Ok(permit)) => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
                Ok(BulkheadPermit {
                    _permit: permit,
                    in_flight: self.in_flight.clone(),
                })
            }
            Ok(Err(_)) | Err(_) => Err(GatewayError::BulkheadFull {
                pool: self.name.clone(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured concurrency limit.
    pub fn allowed(&self) -> u32 {
        self.limit.load(Ordering::SeqCst)
    }

    /// Slots currently free.
    pub fn available(&self) -> u32 {
        self.semaphore.available_permits() as u32
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Peak in-flight count since the last snapshot.
    pub fn take_peak(&self) -> u32 {
        self.peak_in_flight
            .swap(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst)
    }

    /// Adjust the limit in place. Growth is immediate; shrinking acquires and
    /// forgets the surplus permits, draining as in-flight calls complete.
    pub fn resize(&self, new_limit: u32) {
        let old = self.limit.swap(new_limit, Ordering::SeqCst);
        if new_limit == old {
            return;
        }
        if new_limit > old {
            self.semaphore.add_permits((new_limit - old) as usize);
            tracing::info!(
                pool = %self.name,
                old,
                new = new_limit,
                "Increased bulkhead concurrency"
            );
        } else {
            let surplus = old - new_limit;
            let semaphore = self.semaphore.clone();
            let pool = self.name.clone();
            tokio::spawn(async move {
                match semaphore.acquire_many_owned(surplus).await {
                    Ok(permits) => {
                        permits.forget();
                        tracing::info!(pool = %pool, removed = surplus, "Shrunk bulkhead concurrency");
                    }
                    Err(_) => {
                        tracing::warn!(pool = %pool, "Bulkhead semaphore closed during shrink");
                    }
                }
            });
        }
    }
}
