//! Middleware composition engine.
//!
//! A [`Runner`] turns a [`CallContext`] into a lazy sequence of response
//! items; a [`Middleware`] wraps the next runner. Composition follows the
//! onion model: the first middleware in the chain is outermost and sees the
//! request first and the response last. One engine drives both unary and
//! streaming flows, on the client and on the server.
//!
//! A middleware may call its next runner exactly once (transform), several
//! times (retry), never (short-circuit: cache hit, open circuit, rate-limit
//! reject), or under a deadline (timeout).

mod auth;
mod cache;
mod circuit_breaker;
mod rate_limit;
mod retry;
mod timeout;
mod trace;
mod validate;

pub use auth::{auth_middleware, bearer_auth_middleware};
pub use cache::{cache_middleware, canonical_json, CacheConfig};
pub use circuit_breaker::{
    circuit_breaker_middleware, circuit_breaker_with, CircuitBreaker, CircuitBreakerConfig,
    CircuitState,
};
pub use rate_limit::{
    rate_limit_middleware, rate_limit_with, RateLimitConfig, RateLimitStrategy, RateLimiter,
};
pub use retry::{retry_middleware, RetryConfig};
pub use timeout::timeout_middleware;
pub use trace::tracing_middleware;
pub use validate::validation_middleware;

use crate::message::{Envelope, Metadata};
use crate::streaming::ItemStream;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Per-call execution context threaded through a middleware chain.
///
/// The envelope is immutable; middleware that alters it derives a copy via
/// [`CallContext::with_envelope`]. `state` is shared by every stage of the
/// chain (server handlers use it as scratch space).
#[derive(Clone)]
pub struct CallContext {
    pub envelope: Envelope,
    state: Arc<Mutex<Metadata>>,
}

impl CallContext {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            state: Arc::new(Mutex::new(Metadata::new())),
        }
    }

    /// Same shared state, different envelope.
    pub fn with_envelope(&self, envelope: Envelope) -> Self {
        Self {
            envelope,
            state: self.state.clone(),
        }
    }

    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn state(&self, key: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

/// Terminal or composed call executor.
pub type Runner = Arc<dyn Fn(CallContext) -> BoxFuture<'static, ItemStream> + Send + Sync>;

/// Wraps the next runner, onion-style.
pub type Middleware =
    Arc<dyn Fn(CallContext, Runner) -> BoxFuture<'static, ItemStream> + Send + Sync>;

/// Build a runner from an async closure.
pub fn runner_fn<F, Fut>(f: F) -> Runner
where
    F: Fn(CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ItemStream> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Build a middleware from an async closure.
pub fn from_fn<F, Fut>(f: F) -> Middleware
where
    F: Fn(CallContext, Runner) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ItemStream> + Send + 'static,
{
    Arc::new(move |ctx, next| Box::pin(f(ctx, next)))
}

/// A middleware that forwards the call unchanged.
pub fn identity() -> Middleware {
    from_fn(|ctx, next| async move { next(ctx).await })
}

/// Compose middlewares around a terminal runner.
///
/// `compose([m1, m2], r)` produces `m1(m2(r))`: `m1` is outermost.
/// Composition is associative - prepending `m0` to the chain equals wrapping
/// the composed runner in `m0` directly.
pub fn compose(middleware: &[Middleware], terminal: Runner) -> Runner {
    middleware.iter().rev().fold(terminal, |next, mw| {
        let mw = mw.clone();
        Arc::new(move |ctx: CallContext| {
            let mw = mw.clone();
            let next = next.clone();
            Box::pin(async move { mw(ctx, next).await })
        })
    })
}
