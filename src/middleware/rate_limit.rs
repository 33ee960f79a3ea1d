//! Token-bucket rate limiting.
//!
//! `max_requests` tokens refill linearly over `window`; each call takes one.
//! `Reject` fails immediately with `RATE_LIMIT`; `Queue` admits up to
//! `max_queue_size` waiters served in arrival order.

use super::{from_fn, Middleware};
use crate::error::RpcError;
use crate::message::ResponseItem;
use crate::streaming;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum RateLimitStrategy {
    Reject,
    Queue { max_queue_size: usize },
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub strategy: RateLimitStrategy,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            strategy: RateLimitStrategy::Reject,
        }
    }

    pub fn queued(mut self, max_queue_size: usize) -> Self {
        self.strategy = RateLimitStrategy::Queue { max_queue_size };
        self
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    // The tokio mutex doubles as the FIFO waiter queue: a queued acquirer
    // holds it while sleeping out its deficit, so arrival order is served.
    bucket: tokio::sync::Mutex<Bucket>,
    queued: AtomicUsize,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let tokens = f64::from(config.max_requests);
        Self {
            config,
            bucket: tokio::sync::Mutex::new(Bucket {
                tokens,
                last_refill: Instant::now(),
            }),
            queued: AtomicUsize::new(0),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let rate = f64::from(self.config.max_requests) / self.config.window.as_secs_f64();
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(f64::from(self.config.max_requests));
        bucket.last_refill = Instant::now();
    }

    pub async fn acquire(&self) -> Result<(), RpcError> {
        match self.config.strategy {
            RateLimitStrategy::Reject => {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    Ok(())
                } else {
                    Err(RpcError::rate_limit("rate limit exceeded"))
                }
            }
            RateLimitStrategy::Queue { max_queue_size } => {
                if self.queued.fetch_add(1, Ordering::SeqCst) >= max_queue_size {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(RpcError::rate_limit("rate limit queue is full"));
                }
                let _guard = QueueGuard(&self.queued);

                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens < 1.0 {
                    let rate =
                        f64::from(self.config.max_requests) / self.config.window.as_secs_f64();
                    let deficit = 1.0 - bucket.tokens;
                    tokio::time::sleep(Duration::from_secs_f64(deficit / rate)).await;
                    self.refill(&mut bucket);
                }
                bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                Ok(())
            }
        }
    }
}

struct QueueGuard<'a>(&'a AtomicUsize);

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Rate-limit middleware with its own bucket.
pub fn rate_limit_middleware(config: RateLimitConfig) -> Middleware {
    rate_limit_with(Arc::new(RateLimiter::new(config)))
}

/// Rate-limit middleware around a shared limiter.
pub fn rate_limit_with(limiter: Arc<RateLimiter>) -> Middleware {
    from_fn(move |ctx, next| {
        let limiter = limiter.clone();
        async move {
            match limiter.acquire().await {
                Ok(()) => next(ctx).await,
                Err(error) => {
                    tracing::debug!(method = %ctx.envelope.method, "rate limited");
                    streaming::single(ResponseItem::error(ctx.envelope.id.clone(), error))
                }
            }
        }
    })
}
