//! Circuit breaker.
//!
//! `CLOSED → OPEN → HALF_OPEN → CLOSED | OPEN`. Failures are counted inside
//! a sliding window; an open circuit rejects without reaching the transport.

use super::{from_fn, Middleware};
use crate::error::RpcError;
use crate::message::ResponseItem;
use crate::streaming;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that trip the circuit.
    pub failure_threshold: usize,
    pub failure_window: Duration,
    /// Idle time in `Open` before probes are allowed.
    pub reset_timeout: Duration,
    /// Consecutive probe successes that close the circuit again.
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: usize,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Admission check. An expired `Open` transitions to `HalfOpen` and lets
    /// the probe through.
    fn admit(&self) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    tracing::debug!("circuit half-open, allowing probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(RpcError::circuit_open("circuit is open"))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.state {
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    tracing::debug!("circuit closed after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.opened_at = None;
                    inner.half_open_successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                let window = self.config.failure_window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|oldest| now.duration_since(*oldest) > window)
                {
                    inner.failures.pop_front();
                }
                if inner.failures.len() >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = inner.failures.len(),
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("probe failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// Circuit breaker middleware with its own breaker instance.
pub fn circuit_breaker_middleware(config: CircuitBreakerConfig) -> Middleware {
    circuit_breaker_with(Arc::new(CircuitBreaker::new(config)))
}

/// Circuit breaker middleware around a shared breaker, for callers that
/// want to observe or share its state.
pub fn circuit_breaker_with(breaker: Arc<CircuitBreaker>) -> Middleware {
    from_fn(move |ctx, next| {
        let breaker = breaker.clone();
        async move {
            if let Err(error) = breaker.admit() {
                return streaming::single(ResponseItem::error(ctx.envelope.id.clone(), error));
            }

            let mut stream = next(ctx).await;
            match stream.next().await {
                Some(first) => {
                    if first.is_success() {
                        breaker.record_success();
                    } else {
                        breaker.record_failure();
                    }
                    streaming::prepend(first, stream)
                }
                None => streaming::empty(),
            }
        }
    })
}
