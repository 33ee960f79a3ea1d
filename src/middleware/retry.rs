//! Retry on retryable errors with jittered exponential backoff.

use super::{from_fn, Middleware};
use crate::message::ResponseItem;
use crate::streaming;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of re-invocations after the initial attempt.
    pub max_retries: u32,
    /// Base backoff; attempt `n` waits `base × 2^n ± jitter·base`.
    pub base: Duration,
    /// Jitter factor in `[0, 1]`, uniform around the exponential delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(100),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base.as_secs_f64() * 2f64.powi(attempt as i32);
        let spread = self.jitter * self.base.as_secs_f64();
        let jittered = if spread > 0.0 {
            exponential + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            exponential
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Re-invoke the wrapped runner when its first item is a retryable error.
///
/// External cancellation is honored during backoff: a cancelled request
/// aborts immediately instead of sleeping out the delay.
pub fn retry_middleware(config: RetryConfig) -> Middleware {
    from_fn(move |ctx, next| {
        let config = config.clone();
        async move {
            let mut attempt: u32 = 0;
            loop {
                let mut stream = next(ctx.clone()).await;
                let first = match futures::StreamExt::next(&mut stream).await {
                    Some(item) => item,
                    None => return streaming::empty(),
                };

                let retryable = first.status.is_retryable() && attempt < config.max_retries;
                if !retryable {
                    return streaming::prepend(first, stream);
                }

                let delay = config.delay(attempt);
                attempt += 1;
                tracing::debug!(
                    method = %ctx.envelope.method,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after retryable error"
                );

                if let Some(cancel) = ctx.envelope.cancel.clone() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return streaming::single(ResponseItem::error(
                                ctx.envelope.id.clone(),
                                crate::error::RpcError::aborted("cancelled during retry backoff"),
                            ));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    })
}
