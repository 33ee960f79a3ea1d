//! In-process transport: client and server in the same process, no wire.

use super::{aborted_item, closed_item, Transport};
use crate::error::RpcResult;
use crate::message::Envelope;
use crate::server::{Dispatcher, Server};
use crate::streaming::{self, ItemStream};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct InProcTransport {
    dispatcher: Dispatcher,
    closed: AtomicBool,
}

impl InProcTransport {
    pub fn new(server: &Server) -> Self {
        Self {
            dispatcher: server.dispatcher(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_dispatcher(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for InProcTransport {
    fn name(&self) -> &str {
        "inproc"
    }

    async fn send(&self, envelope: Envelope) -> ItemStream {
        if self.closed.load(Ordering::SeqCst) {
            return streaming::single(closed_item(&envelope, self.name()));
        }
        if envelope.is_cancelled() {
            return streaming::single(aborted_item(&envelope));
        }
        (self.dispatcher)(envelope).await
    }

    async fn close(&self) -> RpcResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
