//! Circuit breaker guarding one named pool.
//!
//! Standard three-state breaker: Closed passes calls, Open rejects without
//! touching the downstream, HalfOpen admits a bounded probe budget after the
//! reset window. All bookkeeping is lock-light (atomics plus a mutexed
//! instant) so the executor never awaits inside the breaker.
use std::{
    sync::{
        Mutex,
        atomic::{AtomicU32, AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    half_open_calls: AtomicU32,
    last_transition: Mutex<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            last_transition: Mutex::new(Instant::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may proceed. Transitions Open to HalfOpen once the
    /// reset window has elapsed; while HalfOpen, admits only the probe budget.
    pub fn allow_call(&self) -> bool {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => true,
            STATE_OPEN => {
                let elapsed = self
                    .last_transition
                    .lock()
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_millis(self.config.reset_ms) {
                    self.transition(STATE_HALF_OPEN);
                    self.half_open_calls.fetch_add(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
            _ => {
                self.half_open_calls.fetch_add(1, Ordering::SeqCst)
                    < self.config.half_open_max_calls
            }
        }
    }

    /// Record a successful call. Closes the breaker from HalfOpen once the
    /// success threshold is met.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;

        if self.state.load(Ordering::SeqCst) == STATE_HALF_OPEN
            && successes >= self.config.success_threshold
        {
            self.transition(STATE_CLOSED);
            tracing::info!(breaker = %self.name, "Circuit breaker closed");
        }
    }

    /// Record a failed call. Opens the breaker from Closed once the failure
    /// threshold is crossed; any HalfOpen failure reopens immediately.
    pub fn record_failure(&self) {
        self.consecutive_successes.store(0, Ordering::SeqCst);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED if failures >= self.config.failure_threshold => {
                self.transition(STATE_OPEN);
                tracing::warn!(breaker = %self.name, failures, "Circuit breaker opened");
            }
            STATE_HALF_OPEN => {
                self.transition(STATE_OPEN);
                tracing::warn!(breaker = %self.name, "Circuit breaker reopened from half-open");
            }
            _ => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => BreakerState::Closed,
            STATE_OPEN => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    fn transition(&self, new_state: u8) {
        self.state.store(new_state, Ordering::SeqCst);
        if let Ok(mut t) = self.last_transition.lock() {
            *t = Instant::now();
        }
        self.half_open_calls.store(0, Ordering::SeqCst);
        if new_state == STATE_CLOSED {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.consecutive_successes.store(0, Ordering::SeqCst);
        }
    }
}
