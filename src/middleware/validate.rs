//! Client-side schema validation.
//!
//! Consults the per-chain schema map populated by `Client::schema`. Input
//! failures short-circuit before the transport; success payloads failing the
//! output schema are rewritten into `OUTPUT_VALIDATION_ERROR` items.

use super::{from_fn, Middleware};
use crate::client::SchemaMap;
use crate::error::code;
use crate::message::{ResponseItem, Status};
use crate::streaming;
use futures::StreamExt;
use std::sync::Arc;

pub fn validation_middleware(schemas: Arc<SchemaMap>) -> Middleware {
    from_fn(move |ctx, next| {
        let schemas = schemas.clone();
        async move {
            let Some(entry) = schemas.get(&ctx.envelope.method) else {
                return next(ctx).await;
            };

            let parsed = match entry.input.safe_parse(&ctx.envelope.payload) {
                Ok(value) => value,
                Err(failure) => {
                    return streaming::single(ResponseItem::error(
                        ctx.envelope.id.clone(),
                        failure.into_error(code::VALIDATION_ERROR),
                    ));
                }
            };

            let ctx = ctx.with_envelope(ctx.envelope.clone_with_payload(parsed));
            let output = entry.output.clone();
            let stream = next(ctx).await;
            let checked: crate::streaming::ItemStream =
                Box::pin(stream.map(move |item| match &item.status {
                    Status::Success { .. } => match output.safe_parse(&item.payload) {
                        Ok(payload) => ResponseItem { payload, ..item },
                        Err(failure) => ResponseItem::error(
                            item.id.clone(),
                            failure.into_error(code::OUTPUT_VALIDATION_ERROR),
                        ),
                    },
                    Status::Error(_) => item,
                }));
            checked
        }
    })
}
