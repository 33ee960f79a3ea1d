//! Lazy response-item sequences.
//!
//! A response is a finite sequence of [`ResponseItem`]s produced by
//! `transport.send`. Streams are single-consumer; [`tee`] splits one
//! producer into a relayed stream plus a completion future carrying the
//! collected items.

use crate::message::ResponseItem;
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Boxed stream of response items.
pub type ItemStream = Pin<Box<dyn Stream<Item = ResponseItem> + Send>>;

/// A one-item stream (the unary case).
pub fn single(item: ResponseItem) -> ItemStream {
    Box::pin(stream::once(futures::future::ready(item)))
}

/// A stream over already-materialized items.
pub fn from_items(items: Vec<ResponseItem>) -> ItemStream {
    Box::pin(stream::iter(items))
}

pub fn empty() -> ItemStream {
    Box::pin(stream::empty())
}

/// Push one item back in front of a stream.
pub fn prepend(item: ResponseItem, rest: ItemStream) -> ItemStream {
    Box::pin(stream::once(futures::future::ready(item)).chain(rest))
}

/// Drain a stream into a vector.
pub async fn collect(stream: ItemStream) -> Vec<ResponseItem> {
    stream.collect().await
}

/// Keep `guard` alive for as long as the stream is being consumed.
pub fn attach<G: Send + 'static>(stream: ItemStream, guard: G) -> ItemStream {
    Box::pin(Guarded {
        inner: stream,
        _guard: guard,
    })
}

struct Guarded<G> {
    inner: ItemStream,
    _guard: G,
}

impl<G> Stream for Guarded<G> {
    type Item = ResponseItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<G> Unpin for Guarded<G> {}

/// Split one producer into `(relayed stream, completion future)`.
///
/// The completion future resolves with every item the consumer saw, once the
/// stream ends or the relayed half is dropped.
pub fn tee(stream: ItemStream) -> (ItemStream, oneshot::Receiver<Vec<ResponseItem>>) {
    let (tx, rx) = oneshot::channel();
    let teed = Tee {
        inner: stream,
        seen: Vec::new(),
        done: Some(tx),
    };
    (Box::pin(teed), rx)
}

struct Tee {
    inner: ItemStream,
    seen: Vec<ResponseItem>,
    done: Option<oneshot::Sender<Vec<ResponseItem>>>,
}

impl Stream for Tee {
    type Item = ResponseItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(item)) => {
                self.seen.push(item.clone());
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                if let Some(tx) = self.done.take() {
                    let _ = tx.send(std::mem::take(&mut self.seen));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Unpin for Tee {}

impl Drop for Tee {
    fn drop(&mut self) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(std::mem::take(&mut self.seen));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use serde_json::json;

    #[tokio::test]
    async fn test_tee_collects_everything() {
        let items = vec![
            ResponseItem::success("1", json!(1)),
            ResponseItem::success("1", json!(2)),
        ];
        let (mut relayed, completion) = tee(from_items(items.clone()));

        let mut relayed_items = Vec::new();
        while let Some(item) = relayed.next().await {
            relayed_items.push(item);
        }
        assert_eq!(relayed_items, items);
        assert_eq!(completion.await.unwrap(), items);
    }

    #[tokio::test]
    async fn test_tee_resolves_on_consumer_drop() {
        let items = vec![
            ResponseItem::success("1", json!(1)),
            ResponseItem::error("1", RpcError::timeout("slow")),
        ];
        let (mut relayed, completion) = tee(from_items(items));
        let first = relayed.next().await.unwrap();
        drop(relayed);

        let seen = completion.await.unwrap();
        assert_eq!(seen, vec![first]);
    }

    #[tokio::test]
    async fn test_prepend_restores_order() {
        let rest = from_items(vec![ResponseItem::success("1", json!(2))]);
        let combined = prepend(ResponseItem::success("1", json!(1)), rest);
        let items = collect(combined).await;
        assert_eq!(items[0].payload, json!(1));
        assert_eq!(items[1].payload, json!(2));
    }
}
