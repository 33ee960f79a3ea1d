//! Transport contract and concrete transports.
//!
//! A transport is the sole wire-format seam: it turns an [`Envelope`] into a
//! lazy sequence of response items. Transport-level failures never surface
//! out-of-band - they become a single error item with an honest `retryable`
//! flag.

mod http;
mod inproc;
mod mock;
mod ws;
mod ws_server;

pub use http::{
    default_url_strategy, default_verb_strategy, HttpTransport, UrlStrategy, VerbStrategy,
};
pub use inproc::InProcTransport;
pub use mock::MockTransport;
pub use ws::{StreamFlag, WireKind, WireMessage, WsConfig, WsState, WsTransport};
pub use ws_server::WsServerTransport;

use crate::error::{RpcError, RpcResult};
use crate::message::{Envelope, ResponseItem};
use crate::streaming::ItemStream;
use async_trait::async_trait;

/// Abstract request/response or streaming transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier.
    fn name(&self) -> &str;

    /// Produce the response sequence for one envelope. Must yield at least
    /// one item for a successful unary call; every item echoes the
    /// envelope's id.
    async fn send(&self, envelope: Envelope) -> ItemStream;

    /// Idempotent release of all resources. Outstanding correlated requests
    /// are rejected with a terminal error; subsequent sends fail.
    async fn close(&self) -> RpcResult<()>;
}

pub(crate) fn aborted_item(envelope: &Envelope) -> ResponseItem {
    ResponseItem::error(
        envelope.id.clone(),
        RpcError::aborted("request cancelled"),
    )
}

pub(crate) fn closed_item(envelope: &Envelope, transport: &str) -> ResponseItem {
    ResponseItem::error(
        envelope.id.clone(),
        RpcError::execution(format!("transport '{}' is closed", transport)),
    )
}
