//! Scripted in-memory transport for tests and examples.

use super::{aborted_item, closed_item, Transport};
use crate::error::{RpcError, RpcResult};
use crate::message::{Envelope, Method, ResponseItem, Status};
use crate::streaming::{self, ItemStream};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Replies are scripted per method key and consumed in FIFO order; an
/// unscripted method echoes its payload back as a success. Every sent
/// envelope is recorded for assertions.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Vec<(Status, Value)>>>>,
    sent: Mutex<Vec<Envelope>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_success(&self, method: &Method, payload: Value) {
        self.enqueue_items(method, vec![(Status::ok(), payload)]);
    }

    pub fn enqueue_error(&self, method: &Method, error: RpcError) {
        self.enqueue_items(method, vec![(Status::Error(error), Value::Null)]);
    }

    pub fn enqueue_items(&self, method: &Method, items: Vec<(Status, Value)>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method.key())
            .or_default()
            .push_back(items);
    }

    /// Envelopes observed so far.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, envelope: Envelope) -> ItemStream {
        if self.closed.load(Ordering::SeqCst) {
            return streaming::single(closed_item(&envelope, self.name()));
        }
        if envelope.is_cancelled() {
            return streaming::single(aborted_item(&envelope));
        }

        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope.clone());

        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&envelope.method.key())
            .and_then(VecDeque::pop_front);

        let items = match scripted {
            Some(replies) => replies
                .into_iter()
                .map(|(status, payload)| ResponseItem {
                    id: envelope.id.clone(),
                    status,
                    payload,
                    metadata: Default::default(),
                })
                .collect(),
            None => vec![ResponseItem::success(
                envelope.id.clone(),
                envelope.payload.clone(),
            )],
        };
        streaming::from_items(items)
    }

    async fn close(&self) -> RpcResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
