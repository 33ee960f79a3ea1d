//! Server-side WebSocket transport.
//!
//! Accept loop translating wire messages into envelopes and response item
//! streams back into framed responses. Each connection gets a writer task;
//! requests are dispatched concurrently, so responses multiplex on the
//! socket in completion order, correlated by id.

use super::ws::{WireKind, WireMessage};
use crate::error::{RpcError, RpcResult};
use crate::message::{Envelope, ResponseItem};
use crate::server::{Dispatcher, ServerTransport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub struct WsServerTransport {
    bind_addr: String,
    runtime: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl WsServerTransport {
    pub fn bind(addr: impl Into<String>) -> Self {
        Self {
            bind_addr: addr.into(),
            runtime: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The bound address, available after `start` (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ServerTransport for WsServerTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn start(&self, dispatcher: Dispatcher) -> RpcResult<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| RpcError::execution(format!("failed to bind '{}': {}", self.bind_addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| RpcError::execution(format!("failed to read local addr: {}", e)))?;
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local);
        tracing::debug!(addr = %local, "websocket server listening");

        let accept_loop = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "websocket connection accepted");
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(serve_connection(stream, dispatcher));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                    }
                }
            }
        });

        let previous = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(accept_loop);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> RpcResult<()> {
        if let Some(handle) = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, dispatcher: Dispatcher) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::warn!(error = %err, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut inbound) = socket.split();

    // Single writer per connection; request tasks funnel frames through it.
    let (frames_tx, mut frames_rx) = mpsc::channel::<WireMessage>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(WsMessage::Close(None)).await;
    });

    while let Some(message) = inbound.next().await {
        let text = match message {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(wire) = serde_json::from_str::<WireMessage>(&text) else {
            tracing::warn!("dropping malformed wire message");
            continue;
        };

        match wire.kind {
            WireKind::Ping => {
                if frames_tx.send(WireMessage::pong(wire.id)).await.is_err() {
                    break;
                }
            }
            WireKind::Request => {
                let Some(method) = wire.method.clone() else {
                    let error = ResponseItem::error(
                        wire.id.clone(),
                        RpcError::validation("request frame is missing a method"),
                    );
                    if frames_tx
                        .send(WireMessage::response(&error, true))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                };

                let mut envelope = Envelope::new(
                    method,
                    wire.payload.clone().unwrap_or(serde_json::Value::Null),
                );
                envelope.id = wire.id.clone();
                envelope.metadata = wire.metadata.clone().unwrap_or_default();

                let dispatcher = dispatcher.clone();
                let frames_tx = frames_tx.clone();
                let request_id = wire.id.clone();
                tokio::spawn(async move {
                    let mut items = dispatcher(envelope).await;
                    let mut previous: Option<ResponseItem> = items.next().await;
                    while let Some(current) = items.next().await {
                        if let Some(item) = previous.replace(current) {
                            if frames_tx
                                .send(WireMessage::response(&item, false))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    // Always close out the caller's correlation entry: an
                    // empty stream still gets a terminal done frame.
                    let last = previous.unwrap_or_else(|| {
                        ResponseItem::success(request_id, serde_json::Value::Null)
                    });
                    let _ = frames_tx.send(WireMessage::response(&last, true)).await;
                });
            }
            WireKind::Pong | WireKind::Response | WireKind::Error => {}
        }
    }

    writer.abort();
}
