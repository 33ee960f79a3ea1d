//! Server dispatch.
//!
//! A pattern-matched handler registry (literal and regex segments, linear
//! first-match-wins in registration order), a middleware pipeline mirroring
//! the client's, and a start/stop lifecycle fanned out over the server's
//! transports. Mounted procedures get input/output validation and a
//! registry-backed client for nested calls.

use crate::config::FabricConfig;
use crate::error::{RpcError, RpcResult};
use crate::message::{Envelope, Method, ResponseItem};
use crate::middleware::{compose, CallContext, Middleware, Runner};
use crate::registry::{
    ProcContext, Procedure, ProcedurePath, ProcedureRegistry, ProcedureReply, RegisterOptions,
};
use crate::streaming::{self, ItemStream};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use regex::Regex;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Type-erased dispatch entry point handed to server transports.
pub type Dispatcher = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ItemStream> + Send + Sync>;

/// Server-side transport lifecycle.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Begin accepting requests, delivering each envelope to `dispatcher`.
    async fn start(&self, dispatcher: Dispatcher) -> RpcResult<()>;

    /// Idempotent shutdown.
    async fn stop(&self) -> RpcResult<()>;
}

/// Matches one method segment: exact string or anchored regex.
#[derive(Debug, Clone)]
pub enum SegmentMatcher {
    Literal(String),
    Pattern(Regex),
}

impl SegmentMatcher {
    pub fn literal(segment: impl Into<String>) -> Self {
        Self::Literal(segment.into())
    }

    /// Compile a pattern matching the full segment.
    pub fn pattern(pattern: &str) -> RpcResult<Self> {
        let anchored = format!("^(?:{})$", pattern);
        Regex::new(&anchored)
            .map(Self::Pattern)
            .map_err(|e| RpcError::validation(format!("invalid matcher pattern: {}", e)))
    }

    pub fn matches(&self, segment: &str) -> bool {
        match self {
            Self::Literal(expected) => expected == segment,
            Self::Pattern(regex) => regex.is_match(segment),
        }
    }
}

impl From<&str> for SegmentMatcher {
    fn from(segment: &str) -> Self {
        Self::literal(segment)
    }
}

impl From<String> for SegmentMatcher {
    fn from(segment: String) -> Self {
        Self::Literal(segment)
    }
}

/// Structural method matcher. A missing version matcher accepts any version;
/// a present one requires the request to carry a matching version.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    pub service: SegmentMatcher,
    pub operation: SegmentMatcher,
    pub version: Option<SegmentMatcher>,
}

impl MethodMatcher {
    pub fn new(service: impl Into<SegmentMatcher>, operation: impl Into<SegmentMatcher>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<SegmentMatcher>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn matches(&self, method: &Method) -> bool {
        if !self.service.matches(&method.service) || !self.operation.matches(&method.operation) {
            return false;
        }
        match (&self.version, &method.version) {
            (None, _) => true,
            (Some(matcher), Some(version)) => matcher.matches(version),
            (Some(_), None) => false,
        }
    }
}

struct ServerInner {
    handlers: Vec<(MethodMatcher, Runner)>,
    middleware: Vec<Middleware>,
    transports: Vec<Arc<dyn ServerTransport>>,
    registry: Arc<ProcedureRegistry>,
    config: FabricConfig,
}

/// RPC server: handler registry + middleware + transports.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub struct ServerBuilder {
    handlers: Vec<(MethodMatcher, Runner)>,
    middleware: Vec<Middleware>,
    transports: Vec<Arc<dyn ServerTransport>>,
    registry: Arc<ProcedureRegistry>,
    config: FabricConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            middleware: Vec::new(),
            transports: Vec::new(),
            registry: Arc::new(ProcedureRegistry::new()),
            config: FabricConfig::default(),
        }
    }
}

impl ServerBuilder {
    /// Register a raw runner. Registration order is the match order: more
    /// specific matchers go first, later registrations never shadow earlier
    /// ones.
    pub fn route(mut self, matcher: MethodMatcher, runner: Runner) -> Self {
        self.handlers.push((matcher, runner));
        self
    }

    /// Register a unary handler.
    pub fn unary<F, Fut>(self, matcher: MethodMatcher, handler: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Value>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let runner: Runner = Arc::new(move |ctx: CallContext| {
            let handler = handler.clone();
            Box::pin(async move {
                let envelope = ctx.envelope;
                let id = envelope.id.clone();
                match handler(envelope).await {
                    Ok(value) => streaming::single(ResponseItem::success(id, value)),
                    Err(error) => streaming::single(ResponseItem::error(id, error)),
                }
            })
        });
        self.route(matcher, runner)
    }

    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ServerTransport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Serve procedures out of an existing (possibly the global) registry.
    pub fn registry(mut self, registry: Arc<ProcedureRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: FabricConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a procedure and make it method-addressable. Procedures need
    /// at least two path segments to form a method; shorter paths remain
    /// reachable through batch routing only.
    pub fn mount(self, procedure: Procedure) -> RpcResult<Self> {
        procedure.path.to_method()?;
        self.registry
            .register(procedure, RegisterOptions::default())?;
        Ok(self)
    }

    pub fn build(self) -> RpcResult<Server> {
        self.config
            .validate()
            .map_err(|e| RpcError::validation(e.to_string()))?;
        Ok(Server {
            inner: Arc::new(ServerInner {
                handlers: self.handlers,
                middleware: self.middleware,
                transports: self.transports,
                registry: self.registry,
                config: self.config,
            }),
        })
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn registry(&self) -> Arc<ProcedureRegistry> {
        self.inner.registry.clone()
    }

    /// Dispatch entry point for transports.
    pub fn dispatcher(&self) -> Dispatcher {
        let inner = self.inner.clone();
        Arc::new(move |envelope| {
            let inner = inner.clone();
            Box::pin(async move { dispatch(inner, envelope).await })
        })
    }

    pub async fn dispatch(&self, envelope: Envelope) -> ItemStream {
        dispatch(self.inner.clone(), envelope).await
    }

    /// Start every transport concurrently; the first failure aborts the
    /// overall start (already-started transports are the caller's decision).
    pub async fn start(&self) -> RpcResult<()> {
        let dispatcher = self.dispatcher();
        let starts = self.inner.transports.iter().map(|transport| {
            let dispatcher = dispatcher.clone();
            async move {
                tracing::debug!(transport = transport.name(), "starting transport");
                transport.start(dispatcher).await
            }
        });
        futures::future::try_join_all(starts).await.map(|_| ())
    }

    /// Stop every transport; all are attempted even if one fails.
    pub async fn stop(&self) -> RpcResult<()> {
        let stops = self.inner.transports.iter().map(|t| t.stop());
        let results = futures::future::join_all(stops).await;
        results.into_iter().collect::<RpcResult<Vec<_>>>()?;
        Ok(())
    }
}

async fn dispatch(inner: Arc<ServerInner>, envelope: Envelope) -> ItemStream {
    tracing::debug!(method = %envelope.method, id = %envelope.id, "request");

    let payload_size = serde_json::to_vec(&envelope.payload)
        .map(|b| b.len())
        .unwrap_or(0);
    if payload_size > inner.config.max_payload_size {
        return streaming::single(ResponseItem::error(
            envelope.id.clone(),
            RpcError::validation(format!(
                "payload of {} bytes exceeds the maximum of {}",
                payload_size, inner.config.max_payload_size
            )),
        ));
    }

    let matched = inner
        .handlers
        .iter()
        .find(|(matcher, _)| matcher.matches(&envelope.method))
        .map(|(_, runner)| runner.clone());

    let runner = match matched {
        Some(runner) => runner,
        None => {
            let procedure = ProcedurePath::from_method(&envelope.method)
                .ok()
                .and_then(|path| inner.registry.get(&path));
            match procedure {
                Some(procedure) => procedure_runner(procedure, inner.registry.clone()),
                None => {
                    return streaming::single(ResponseItem::error(
                        envelope.id.clone(),
                        RpcError::not_found(format!(
                            "no handler for method '{}'",
                            envelope.method
                        )),
                    ));
                }
            }
        }
    };

    let chain = compose(&inner.middleware, runner);
    let id = envelope.id.clone();
    let ctx = CallContext::new(envelope);

    match AssertUnwindSafe(chain(ctx)).catch_unwind().await {
        Ok(stream) => {
            let stream_id = id;
            let contained: ItemStream =
                Box::pin(AssertUnwindSafe(stream).catch_unwind().map(move |item| {
                    item.unwrap_or_else(|_| {
                        ResponseItem::error(
                            stream_id.clone(),
                            RpcError::handler("handler panicked while streaming"),
                        )
                    })
                }));
            contained
        }
        Err(_) => streaming::single(ResponseItem::error(
            id,
            RpcError::handler("handler panicked"),
        )),
    }
}

/// Wrap a registered procedure into a runner: validate input, call the
/// handler with a procedure context, validate output.
fn procedure_runner(procedure: Arc<Procedure>, registry: Arc<ProcedureRegistry>) -> Runner {
    Arc::new(move |ctx: CallContext| {
        let procedure = procedure.clone();
        let registry = registry.clone();
        Box::pin(async move {
            let envelope = ctx.envelope;
            let id = envelope.id.clone();
            let mut proc_ctx = ProcContext::new(registry, procedure.path.clone())
                .with_metadata(envelope.metadata.clone());
            proc_ctx.signal = envelope.cancel.clone();

            match procedure.invoke(envelope.payload.clone(), proc_ctx).await {
                Ok(ProcedureReply::Single(value)) => {
                    streaming::single(ResponseItem::success(id, value))
                }
                Ok(ProcedureReply::Stream(values)) => {
                    let items: ItemStream = Box::pin(values.map(move |item| match item {
                        Ok(value) => ResponseItem::success(id.clone(), value),
                        Err(error) => ResponseItem::error(id.clone(), error),
                    }));
                    items
                }
                Err(error) => streaming::single(ResponseItem::error(id, error)),
            }
        })
    })
}
