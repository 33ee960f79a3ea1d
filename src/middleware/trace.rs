//! Tracing metadata injection. Stateless.

use super::{from_fn, Middleware};
use serde_json::Value;
use uuid::Uuid;

/// Propagate a `traceId` (reused when present) and stamp a fresh `spanId`
/// per call, logging the request boundary.
pub fn tracing_middleware() -> Middleware {
    from_fn(|ctx, next| async move {
        let mut metadata = ctx.envelope.metadata.clone();
        let trace_id = metadata
            .get("traceId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let span_id = Uuid::now_v7().to_string();
        metadata.insert("traceId".to_string(), Value::String(trace_id.clone()));
        metadata.insert("spanId".to_string(), Value::String(span_id));

        tracing::debug!(method = %ctx.envelope.method, trace_id = %trace_id, "rpc request");
        let ctx = ctx.with_envelope(ctx.envelope.clone_with_metadata(metadata));
        next(ctx).await
    })
}
