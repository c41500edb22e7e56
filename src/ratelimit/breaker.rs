//! Circuit breaker guarding the remote counter store.
//!
//! After enough consecutive remote failures the limiter stops paying the
//! latency of doomed remote calls and answers from the local store until a
//! cooldown has passed.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Remote calls go through
    Closed,
    /// Remote calls are skipped until the cooldown ends
    Open,
    /// One trial call is in flight
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at_ms: u64,
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown_ms: u64,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown_ms,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at_ms: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether a remote call should be attempted now.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// admits exactly one caller.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            // A trial abandoned for a whole cooldown is replaced by a new one.
            BreakerState::Open | BreakerState::HalfOpen => {
                let now = self.clock.now_ms();
                if now.saturating_sub(inner.opened_at_ms) >= self.cooldown_ms {
                    inner.state = BreakerState::HalfOpen;
                    inner.opened_at_ms = now;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!("Remote counter store recovered, closing circuit breaker");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.failure_threshold,
            BreakerState::Open => false,
        };

        if trip {
            warn!(
                failures = inner.consecutive_failures,
                cooldown_ms = self.cooldown_ms,
                "Opening circuit breaker for remote counter store"
            );
            inner.state = BreakerState::Open;
            inner.opened_at_ms = self.clock.now_ms();
        }
    }
}
