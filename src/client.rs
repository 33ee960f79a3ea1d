//! RPC client.
//!
//! Owns a transport and a middleware chain, and threads a hierarchical
//! context into every call's metadata. `with_context` derives child clients
//! that share the middleware array, schema map and transport by reference.

use crate::cancel::CancellationSignal;
use crate::error::{RpcError, RpcResult};
use crate::message::{deep_merge, merge_metadata, Envelope, Metadata, Method, ResponseItem};
use crate::middleware::{compose, CallContext, Middleware, Runner};
use crate::streaming::ItemStream;
use crate::transport::Transport;
use crate::validation::Validator;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

/// Validators registered for one method.
#[derive(Clone)]
pub struct MethodSchemas {
    pub input: Arc<dyn Validator>,
    pub output: Arc<dyn Validator>,
}

/// Per-chain schema store consulted by the validation middleware.
#[derive(Default)]
pub struct SchemaMap {
    entries: RwLock<HashMap<String, MethodSchemas>>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, method: &Method, schemas: MethodSchemas) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.key(), schemas);
    }

    pub fn get(&self, method: &Method) -> Option<MethodSchemas> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&method.key())
            .cloned()
    }
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Raw metadata; highest merge priority.
    pub metadata: Metadata,
    /// Per-call context, merged above the client hierarchy.
    pub context: Value,
    pub cancel: Option<Arc<CancellationSignal>>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self {
            context: Value::Null,
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<CancellationSignal>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    middleware: Arc<Vec<Middleware>>,
    default_metadata: Metadata,
    throw_on_error: bool,
    context: Value,
    parent: Option<Client>,
    schemas: Arc<SchemaMap>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    middleware: Vec<Middleware>,
    default_metadata: Metadata,
    throw_on_error: bool,
    context: Value,
    schemas: Option<Arc<SchemaMap>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            transport: None,
            middleware: Vec::new(),
            default_metadata: Metadata::new(),
            throw_on_error: true,
            context: Value::Null,
            schemas: None,
        }
    }
}

impl ClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Middleware execute in registration order, first is outermost.
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn default_metadata(mut self, metadata: Metadata) -> Self {
        self.default_metadata = metadata;
        self
    }

    pub fn throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = throw_on_error;
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Share an externally-created schema map, so a validation middleware
    /// built before the client can consult the same store.
    pub fn schemas(mut self, schemas: Arc<SchemaMap>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn build(self) -> RpcResult<Client> {
        let transport = self
            .transport
            .ok_or_else(|| RpcError::validation("client requires a transport"))?;
        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                middleware: Arc::new(self.middleware),
                default_metadata: self.default_metadata,
                throw_on_error: self.throw_on_error,
                context: self.context,
                parent: None,
                schemas: self.schemas.unwrap_or_else(|| Arc::new(SchemaMap::new())),
            }),
        })
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Derive a child client with extra context. The middleware array,
    /// schema map and transport are shared by reference.
    pub fn with_context(&self, context: Value) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                transport: self.inner.transport.clone(),
                middleware: self.inner.middleware.clone(),
                default_metadata: Metadata::new(),
                throw_on_error: self.inner.throw_on_error,
                context,
                parent: Some(self.clone()),
                schemas: self.inner.schemas.clone(),
            }),
        }
    }

    /// Register validators consulted by the validation middleware. The map
    /// is shared across the whole `with_context` chain.
    pub fn schema(
        &self,
        method: &Method,
        input: Arc<dyn Validator>,
        output: Arc<dyn Validator>,
    ) {
        self.inner.schemas.insert(method, MethodSchemas { input, output });
    }

    pub fn schemas(&self) -> Arc<SchemaMap> {
        self.inner.schemas.clone()
    }

    /// Effective context: ancestors root-first, then this client, then the
    /// per-call context. Objects merge deep; `null` entries are skipped.
    fn effective_context(&self, call_context: &Value) -> Value {
        let mut chain: Vec<&ClientInner> = Vec::new();
        let mut cursor = Some(self);
        while let Some(client) = cursor {
            chain.push(client.inner.as_ref());
            cursor = client.inner.parent.as_ref();
        }

        let mut merged = Value::Object(serde_json::Map::new());
        for inner in chain.iter().rev() {
            deep_merge(&mut merged, &inner.context);
        }
        deep_merge(&mut merged, call_context);
        merged
    }

    fn build_envelope(&self, method: Method, payload: Value, options: &CallOptions) -> Envelope {
        // Default metadata, ancestors root-first.
        let mut metadata = Metadata::new();
        let mut chain: Vec<&ClientInner> = Vec::new();
        let mut cursor = Some(self);
        while let Some(client) = cursor {
            chain.push(client.inner.as_ref());
            cursor = client.inner.parent.as_ref();
        }
        for inner in chain.iter().rev() {
            merge_metadata(&mut metadata, &inner.default_metadata);
        }

        // Merged context flows into the metadata, per-call metadata wins.
        if let Value::Object(context) = self.effective_context(&options.context) {
            merge_metadata(&mut metadata, &context);
        }
        merge_metadata(&mut metadata, &options.metadata);

        let mut envelope = Envelope::new(method, payload).with_metadata(metadata);
        envelope.cancel = options.cancel.clone();
        envelope
    }

    /// Run the composed middleware chain down to the transport.
    async fn run(&self, envelope: Envelope) -> ItemStream {
        let transport = self.inner.transport.clone();
        let terminal: Runner = Arc::new(move |ctx: CallContext| {
            let transport = transport.clone();
            Box::pin(async move { transport.send(ctx.envelope).await })
        });
        let chain = compose(&self.inner.middleware, terminal);
        chain(CallContext::new(envelope)).await
    }

    /// Unary call: first item of the response sequence. Error items surface
    /// as typed errors carrying code, message, retryable and the response id.
    pub async fn call(
        &self,
        method: Method,
        payload: Value,
        options: CallOptions,
    ) -> RpcResult<Value> {
        self.call_item(method, payload, options).await.into_result()
    }

    /// Unary call surfacing the raw first response item (for callers that
    /// opted out of `throw_on_error` semantics).
    pub async fn call_item(
        &self,
        method: Method,
        payload: Value,
        options: CallOptions,
    ) -> ResponseItem {
        let envelope = self.build_envelope(method, payload, &options);
        let id = envelope.id.clone();
        let mut stream = self.run(envelope).await;
        match stream.next().await {
            Some(item) => item,
            None => ResponseItem::error(
                id,
                RpcError::execution("transport yielded no response"),
            ),
        }
    }

    /// Streaming call yielding one payload per response item. With
    /// `throw_on_error` the first error item terminates the stream; without
    /// it, error items are yielded as `Err` and the stream continues.
    pub async fn stream(
        &self,
        method: Method,
        payload: Value,
        options: CallOptions,
    ) -> Pin<Box<dyn Stream<Item = RpcResult<Value>> + Send>> {
        let envelope = self.build_envelope(method, payload, &options);
        let items = self.run(envelope).await;
        let stop_on_error = self.inner.throw_on_error;

        Box::pin(futures::stream::unfold(
            (items, false),
            move |(mut items, stopped)| async move {
                if stopped {
                    return None;
                }
                let item = items.next().await?;
                match item.into_result() {
                    Ok(payload) => Some((Ok(payload), (items, false))),
                    Err(error) => Some((Err(error), (items, stop_on_error))),
                }
            },
        ))
    }

    /// Close the owned transport.
    pub async fn close(&self) -> RpcResult<()> {
        self.inner.transport.close().await
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }
}
