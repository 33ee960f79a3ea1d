//! Authentication metadata injection. Stateless.

use super::{from_fn, Middleware};
use serde_json::Value;
use std::sync::Arc;

/// Inject an `authorization` metadata entry when the call has none.
///
/// Middleware-provided values sit at the bottom of the context merge order,
/// so an explicit per-call value always wins.
pub fn auth_middleware(provider: Arc<dyn Fn() -> String + Send + Sync>) -> Middleware {
    from_fn(move |ctx, next| {
        let provider = provider.clone();
        async move {
            if ctx.envelope.metadata.contains_key("authorization") {
                return next(ctx).await;
            }
            let mut metadata = ctx.envelope.metadata.clone();
            metadata.insert("authorization".to_string(), Value::String(provider()));
            let ctx = ctx.with_envelope(ctx.envelope.clone_with_metadata(metadata));
            next(ctx).await
        }
    })
}

/// Bearer-token convenience wrapper.
pub fn bearer_auth_middleware(token: impl Into<String>) -> Middleware {
    let header = format!("Bearer {}", token.into());
    auth_middleware(Arc::new(move || header.clone()))
}
