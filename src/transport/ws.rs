//! WebSocket transport.
//!
//! A persistent multiplexed connection driven by a single actor task that
//! owns the socket, the correlation table and all timers. Callers submit
//! envelopes over a command queue and receive items through a per-call
//! channel, so streaming responses flow until the wire marks `stream.done`.
//!
//! Connection lifecycle:
//! `Disconnected → Connecting → Connected → {Reconnecting → Connecting | Disconnecting → Disconnected}`
//!
//! On loss the actor reconnects with exponential backoff and rejects the
//! pending correlation entries with `DISCONNECTED` - requests are not resent
//! automatically. Exhausting `max_attempts` parks the transport in terminal
//! `Disconnected`.

use super::{aborted_item, Transport};
use crate::error::{RpcError, RpcResult};
use crate::message::{Envelope, Metadata, Method, ResponseItem, Status};
use crate::streaming::{self, ItemStream};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connection_timeout: Duration,
    /// Per-call response channel capacity.
    pub channel_capacity: usize,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(10),
            channel_capacity: 32,
        }
    }

    pub fn with_backoff(
        mut self,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: u32,
    ) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self.multiplier = multiplier;
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// `min(max_delay, initial_delay × multiplier^attempt)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireKind {
    Request,
    Response,
    Ping,
    Pong,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamFlag {
    pub done: bool,
}

/// Minimum wire shape shared by both ends of the fabric's WebSocket framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: WireKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub method: Option<Method>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stream: Option<StreamFlag>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<RpcError>,
}

impl WireMessage {
    fn base(id: impl Into<String>, kind: WireKind) -> Self {
        Self {
            id: id.into(),
            kind,
            method: None,
            payload: None,
            metadata: None,
            status: None,
            stream: None,
            error: None,
        }
    }

    pub fn request(envelope: &Envelope) -> Self {
        let mut msg = Self::base(envelope.id.clone(), WireKind::Request);
        msg.method = Some(envelope.method.clone());
        msg.payload = Some(envelope.payload.clone());
        if !envelope.metadata.is_empty() {
            msg.metadata = Some(envelope.metadata.clone());
        }
        msg
    }

    pub fn response(item: &ResponseItem, done: bool) -> Self {
        let mut msg = Self::base(item.id.clone(), WireKind::Response);
        msg.payload = Some(item.payload.clone());
        msg.status = Some(item.status.clone());
        if !item.metadata.is_empty() {
            msg.metadata = Some(item.metadata.clone());
        }
        msg.stream = Some(StreamFlag { done });
        msg
    }

    pub fn ping(id: impl Into<String>) -> Self {
        Self::base(id, WireKind::Ping)
    }

    pub fn pong(id: impl Into<String>) -> Self {
        Self::base(id, WireKind::Pong)
    }

    /// Whether this message terminates its response stream.
    pub fn is_done(&self) -> bool {
        match self.kind {
            WireKind::Error => true,
            _ => self.stream.map(|s| s.done).unwrap_or(true),
        }
    }

    /// Interpret an inbound response/error message as a response item.
    pub fn into_item(self) -> ResponseItem {
        let status = match (self.status, self.error) {
            (_, Some(error)) => Status::Error(error),
            (Some(status), None) => status,
            (None, None) => Status::ok(),
        };
        ResponseItem {
            id: self.id,
            status,
            payload: self.payload.unwrap_or(Value::Null),
            metadata: self.metadata.unwrap_or_default(),
        }
    }
}

enum Command {
    Send {
        envelope: Envelope,
        replies: mpsc::Sender<ResponseItem>,
    },
    Cancel {
        id: String,
    },
    Close,
}

pub struct WsTransport {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<WsState>,
    connection_timeout: Duration,
    channel_capacity: usize,
}

impl WsTransport {
    /// Spawn the connection actor and start connecting immediately.
    pub fn connect(config: WsConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(WsState::Connecting);
        let connection_timeout = config.connection_timeout;
        let channel_capacity = config.channel_capacity.max(1);
        tokio::spawn(actor(config, cmd_rx, state_tx));
        Self {
            cmd_tx,
            state_rx,
            connection_timeout,
            channel_capacity,
        }
    }

    pub fn state(&self) -> WsState {
        *self.state_rx.borrow()
    }

    async fn wait_connected(&self) -> RpcResult<()> {
        let mut state_rx = self.state_rx.clone();
        let wait = async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    WsState::Connected => return Ok(()),
                    WsState::Disconnected => {
                        return Err(RpcError::disconnected("websocket transport is disconnected"))
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(RpcError::disconnected("websocket transport is gone"));
                }
            }
        };
        tokio::time::timeout(self.connection_timeout, wait)
            .await
            .map_err(|_| RpcError::aborted("connection not established within budget"))?
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn send(&self, envelope: Envelope) -> ItemStream {
        if envelope.is_cancelled() {
            return streaming::single(aborted_item(&envelope));
        }
        if let Err(error) = self.wait_connected().await {
            return streaming::single(ResponseItem::error(envelope.id.clone(), error));
        }

        let (replies, rx) = mpsc::channel(self.channel_capacity);
        let id = envelope.id.clone();
        let cancel = envelope.cancel.clone();
        if self
            .cmd_tx
            .send(Command::Send { envelope: envelope.clone(), replies })
            .is_err()
        {
            return streaming::single(ResponseItem::error(
                id,
                RpcError::disconnected("websocket transport is gone"),
            ));
        }

        struct RelayState {
            rx: mpsc::Receiver<ResponseItem>,
            cancel: Option<std::sync::Arc<crate::cancel::CancellationSignal>>,
            cmd_tx: mpsc::UnboundedSender<Command>,
            id: String,
            finished: bool,
        }

        let state = RelayState {
            rx,
            cancel,
            cmd_tx: self.cmd_tx.clone(),
            id,
            finished: false,
        };

        Box::pin(futures::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            let next = match &state.cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = state.cmd_tx.send(Command::Cancel { id: state.id.clone() });
                            state.finished = true;
                            let item = ResponseItem::error(
                                state.id.clone(),
                                RpcError::aborted("request cancelled"),
                            );
                            return Some((item, state));
                        }
                        item = state.rx.recv() => item,
                    }
                }
                None => state.rx.recv().await,
            };
            next.map(|item| (item, state))
        }))
    }

    async fn close(&self) -> RpcResult<()> {
        if self.cmd_tx.send(Command::Close).is_err() {
            return Ok(());
        }
        let mut state_rx = self.state_rx.clone();
        loop {
            if *state_rx.borrow_and_update() == WsState::Disconnected {
                return Ok(());
            }
            if state_rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Exit {
    /// Explicit close; terminal.
    Closed,
    /// Connection lost; reconnect.
    Lost,
}

struct Pending(HashMap<String, mpsc::Sender<ResponseItem>>);

impl Pending {
    fn reject_all(&mut self, error: &RpcError) {
        for (id, tx) in self.0.drain() {
            let _ = tx.try_send(ResponseItem::error(id, error.clone()));
        }
    }
}

async fn actor(
    config: WsConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<WsState>,
) {
    let mut pending = Pending(HashMap::new());
    let mut queued: VecDeque<(Envelope, mpsc::Sender<ResponseItem>)> = VecDeque::new();
    let mut attempt: u32 = 0;

    loop {
        let _ = state_tx.send(WsState::Connecting);
        let connected =
            tokio::time::timeout(config.connection_timeout, connect_async(config.url.as_str()))
                .await;

        match connected {
            Ok(Ok((socket, _))) => {
                attempt = 0;
                tracing::debug!(url = %config.url, "websocket connected");
                let _ = state_tx.send(WsState::Connected);
                match run_connected(socket, &config, &mut cmd_rx, &mut pending, &mut queued).await
                {
                    Exit::Closed => {
                        pending.reject_all(&RpcError::disconnected("transport closed"));
                        reject_queued(&mut queued, &RpcError::disconnected("transport closed"));
                        let _ = state_tx.send(WsState::Disconnected);
                        return;
                    }
                    Exit::Lost => {
                        tracing::warn!(url = %config.url, "websocket connection lost");
                        pending.reject_all(&RpcError::disconnected("connection lost"));
                        let _ = state_tx.send(WsState::Reconnecting);
                    }
                }
            }
            _ => {
                tracing::debug!(url = %config.url, attempt, "websocket connect failed");
                let _ = state_tx.send(WsState::Reconnecting);
            }
        }

        let delay = config.backoff_delay(attempt);
        attempt += 1;
        if attempt >= config.max_attempts {
            tracing::warn!(url = %config.url, attempt, "reconnect attempts exhausted");
            break;
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    None => {
                        let _ = state_tx.send(WsState::Disconnected);
                        return;
                    }
                    Some(Command::Close) => {
                        let _ = state_tx.send(WsState::Disconnecting);
                        pending.reject_all(&RpcError::disconnected("transport closed"));
                        reject_queued(&mut queued, &RpcError::disconnected("transport closed"));
                        let _ = state_tx.send(WsState::Disconnected);
                        return;
                    }
                    Some(Command::Cancel { id }) => {
                        pending.0.remove(&id);
                        queued.retain(|(envelope, _)| envelope.id != id);
                    }
                    // Arrivals during the backoff window wait for the next
                    // connection and are drained on open.
                    Some(Command::Send { envelope, replies }) => {
                        queued.push_back((envelope, replies));
                    }
                },
            }
        }
    }

    // Terminal: reject everything until the handle goes away.
    let terminal = RpcError::disconnected("websocket transport is disconnected");
    pending.reject_all(&terminal);
    reject_queued(&mut queued, &terminal);
    let _ = state_tx.send(WsState::Disconnected);
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Send { envelope, replies } => {
                let _ = replies.try_send(ResponseItem::error(envelope.id, terminal.clone()));
            }
            Command::Close => return,
            Command::Cancel { .. } => {}
        }
    }
}

fn reject_queued(
    queued: &mut VecDeque<(Envelope, mpsc::Sender<ResponseItem>)>,
    error: &RpcError,
) {
    for (envelope, tx) in queued.drain(..) {
        let _ = tx.try_send(ResponseItem::error(envelope.id, error.clone()));
    }
}

async fn run_connected(
    socket: Socket,
    config: &WsConfig,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    pending: &mut Pending,
    queued: &mut VecDeque<(Envelope, mpsc::Sender<ResponseItem>)>,
) -> Exit {
    let (mut sink, mut stream) = socket.split();

    while let Some((envelope, replies)) = queued.pop_front() {
        if send_wire(&mut sink, &WireMessage::request(&envelope)).await.is_err() {
            let _ = replies.try_send(ResponseItem::error(
                envelope.id,
                RpcError::disconnected("connection lost"),
            ));
            return Exit::Lost;
        }
        pending.0.insert(envelope.id.clone(), replies);
    }

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut awaiting_pong: Option<String> = None;
    let pong_deadline = tokio::time::sleep(Duration::from_secs(0));
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Close) => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Exit::Closed;
                }
                Some(Command::Cancel { id }) => {
                    pending.0.remove(&id);
                }
                Some(Command::Send { envelope, replies }) => {
                    match send_wire(&mut sink, &WireMessage::request(&envelope)).await {
                        Ok(()) => {
                            pending.0.insert(envelope.id.clone(), replies);
                        }
                        Err(()) => {
                            let _ = replies.try_send(ResponseItem::error(
                                envelope.id,
                                RpcError::disconnected("connection lost"),
                            ));
                            return Exit::Lost;
                        }
                    }
                }
            },
            inbound = stream.next() => match inbound {
                None | Some(Err(_)) => return Exit::Lost,
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(msg) = serde_json::from_str::<WireMessage>(&text) else {
                        tracing::warn!("dropping malformed wire message");
                        continue;
                    };
                    match msg.kind {
                        WireKind::Ping => {
                            if send_wire(&mut sink, &WireMessage::pong(msg.id)).await.is_err() {
                                return Exit::Lost;
                            }
                        }
                        WireKind::Pong => {
                            if awaiting_pong.as_deref() == Some(msg.id.as_str()) {
                                awaiting_pong = None;
                            }
                        }
                        WireKind::Response | WireKind::Error => {
                            let done = msg.is_done();
                            let id = msg.id.clone();
                            if let Some(tx) = pending.0.get(&id) {
                                if tx.try_send(msg.into_item()).is_err() {
                                    tracing::warn!(id = %id, "response channel full or gone, dropping item");
                                }
                            }
                            if done {
                                pending.0.remove(&id);
                            }
                        }
                        WireKind::Request => {
                            tracing::warn!("client transport received a request frame, ignoring");
                        }
                    }
                }
                Some(Ok(WsMessage::Ping(body))) => {
                    if sink.send(WsMessage::Pong(body)).await.is_err() {
                        return Exit::Lost;
                    }
                }
                Some(Ok(WsMessage::Close(_))) => return Exit::Lost,
                Some(Ok(_)) => {}
            },
            _ = heartbeat.tick() => {
                if awaiting_pong.is_none() {
                    let id = Uuid::now_v7().to_string();
                    if send_wire(&mut sink, &WireMessage::ping(&id)).await.is_err() {
                        return Exit::Lost;
                    }
                    awaiting_pong = Some(id);
                    pong_deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + config.heartbeat_timeout);
                }
            },
            _ = &mut pong_deadline, if awaiting_pong.is_some() => {
                tracing::warn!("heartbeat timed out, closing socket");
                let _ = sink.send(WsMessage::Close(None)).await;
                return Exit::Lost;
            },
        }
    }
}

async fn send_wire(
    sink: &mut futures::stream::SplitSink<Socket, WsMessage>,
    msg: &WireMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    sink.send(WsMessage::Text(text)).await.map_err(|_| ())
}
