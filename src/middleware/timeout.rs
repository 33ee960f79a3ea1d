//! Deadline middleware.
//!
//! One implementation covers both scopes: placed inside a retry middleware
//! the deadline is per-attempt, placed outside it spans all retries.

use super::{from_fn, Middleware};
use crate::cancel::{linked, CancellationSignal, SignalLink};
use crate::error::RpcError;
use crate::message::ResponseItem;
use crate::streaming;
use futures::StreamExt;
use std::time::Duration;

/// Race each invocation of the wrapped runner against a fresh deadline.
///
/// A derived cancellation signal (composed with the request's own) is handed
/// downstream so the transport observes the expiry; if the deadline fires
/// while the outer request is not cancelled the caller sees `TIMEOUT`,
/// otherwise `ABORTED`.
pub fn timeout_middleware(duration: Duration) -> Middleware {
    from_fn(move |ctx, next| async move {
        let outer = ctx.envelope.cancel.clone();
        let (derived, link) = match &outer {
            Some(signal) => linked([signal.clone()]),
            None => (CancellationSignal::arc(), SignalLink::empty()),
        };

        let id = ctx.envelope.id.clone();
        let inner_ctx =
            ctx.with_envelope(ctx.envelope.clone_with_cancel(Some(derived.clone())));

        let first_item = async {
            let mut stream = next(inner_ctx).await;
            let first = stream.next().await;
            (first, stream)
        };

        match tokio::time::timeout(duration, first_item).await {
            Ok((Some(first), rest)) => {
                // The link must outlive the stream so late outer cancellation
                // still reaches the transport.
                streaming::attach(streaming::prepend(first, rest), link)
            }
            Ok((None, _)) => streaming::empty(),
            Err(_) => {
                derived.cancel();
                let error = if outer.map(|o| o.is_cancelled()).unwrap_or(false) {
                    RpcError::aborted("request cancelled")
                } else {
                    tracing::debug!(id = %id, timeout_ms = duration.as_millis() as u64, "deadline exceeded");
                    RpcError::timeout(format!("deadline of {:?} exceeded", duration))
                };
                streaming::single(ResponseItem::error(id, error))
            }
        }
    })
}
