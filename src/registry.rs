//! Procedure registry.
//!
//! A tree of typed procedures stored under dotted path keys. Registration
//! and removal emit events to subscribed listeners; a materialized tree view
//! and prefix queries support discovery tooling.

use crate::cancel::CancellationSignal;
use crate::error::{code, RpcError, RpcResult};
use crate::message::{Metadata, Method};
use crate::validation::{self, Validator};
use futures::future::BoxFuture;
use futures::stream::Stream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// Validate the dotted path format: non-empty segments of
/// ASCII alphanumerics and underscores.
pub fn validate_path(path: &str) -> RpcResult<()> {
    if path.is_empty() {
        return Err(RpcError::validation("procedure path cannot be empty"));
    }
    if path.starts_with('.') || path.ends_with('.') {
        return Err(RpcError::validation(
            "procedure path cannot start or end with a dot",
        ));
    }
    if path.contains("..") {
        return Err(RpcError::validation(
            "procedure path cannot contain consecutive dots",
        ));
    }
    for ch in path.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '_' && ch != '.' {
            return Err(RpcError::validation(format!(
                "procedure path contains invalid character: '{}'",
                ch
            )));
        }
    }
    Ok(())
}

/// Ordered sequence of path segments addressing a procedure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProcedurePath(Vec<String>);

impl ProcedurePath {
    pub fn parse(path: &str) -> RpcResult<Self> {
        validate_path(path)?;
        Ok(Self(path.split('.').map(str::to_string).collect()))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Dot-joined key form.
    pub fn key(&self) -> String {
        self.0.join(".")
    }

    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Method addressing: first segment is the service, the rest form the
    /// operation. Requires at least two segments.
    pub fn to_method(&self) -> RpcResult<Method> {
        if self.0.len() < 2 {
            return Err(RpcError::validation(format!(
                "path '{}' needs at least 2 segments to form a method",
                self.key()
            )));
        }
        Ok(Method::new(self.0[0].clone(), self.0[1..].join(".")))
    }

    pub fn from_method(method: &Method) -> RpcResult<Self> {
        Self::parse(&format!("{}.{}", method.service, method.operation))
    }
}

impl fmt::Display for ProcedurePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl TryFrom<String> for ProcedurePath {
    type Error = RpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProcedurePath> for String {
    fn from(path: ProcedurePath) -> Self {
        path.key()
    }
}

/// Descriptive procedure metadata for discovery and documentation.
#[derive(Debug, Clone, Default)]
pub struct ProcedureMetadata {
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub deprecated: bool,
    pub extra: Metadata,
}

/// Stream of output values produced by a streaming procedure.
pub type ValueStream = Pin<Box<dyn Stream<Item = RpcResult<Value>> + Send>>;

type UnaryHandler =
    Arc<dyn Fn(Value, ProcContext) -> BoxFuture<'static, RpcResult<Value>> + Send + Sync>;
type StreamingHandler =
    Arc<dyn Fn(Value, ProcContext) -> BoxFuture<'static, RpcResult<ValueStream>> + Send + Sync>;

#[derive(Clone)]
pub enum ProcedureHandler {
    Unary(UnaryHandler),
    Streaming(StreamingHandler),
}

/// Result of invoking a procedure.
pub enum ProcedureReply {
    Single(Value),
    Stream(ValueStream),
}

impl std::fmt::Debug for ProcedureReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcedureReply::Single(v) => f.debug_tuple("Single").field(v).finish(),
            ProcedureReply::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

impl ProcedureReply {
    /// Materialize: a stream is drained into an array, failing on the first
    /// error item.
    pub async fn into_value(self) -> RpcResult<Value> {
        match self {
            Self::Single(value) => Ok(value),
            Self::Stream(mut stream) => {
                let mut items = Vec::new();
                while let Some(next) = stream.next().await {
                    items.push(next?);
                }
                Ok(Value::Array(items))
            }
        }
    }
}

/// A named endpoint with input/output validators and an optional handler.
/// Without a handler the procedure is a stub, usable for typing and
/// discovery but not executable.
#[derive(Clone)]
pub struct Procedure {
    pub path: ProcedurePath,
    pub input: Arc<dyn Validator>,
    pub output: Arc<dyn Validator>,
    pub metadata: ProcedureMetadata,
    pub handler: Option<ProcedureHandler>,
    pub streaming: bool,
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("path", &self.path)
            .field("streaming", &self.streaming)
            .field("executable", &self.handler.is_some())
            .finish()
    }
}

impl Procedure {
    pub fn builder(path: impl Into<String>) -> ProcedureBuilder {
        ProcedureBuilder::new(path)
    }

    pub fn is_executable(&self) -> bool {
        self.handler.is_some()
    }

    /// Run the procedure: validate the input, call the handler, validate the
    /// output (each streamed value for streaming procedures).
    pub async fn invoke(&self, input: Value, ctx: ProcContext) -> RpcResult<ProcedureReply> {
        let parsed = self.input.parse(&input)?;
        let handler = self.handler.as_ref().ok_or_else(|| {
            RpcError::not_found(format!("procedure '{}' has no handler", self.path))
        })?;

        match handler {
            ProcedureHandler::Unary(h) => {
                let output = h(parsed, ctx).await?;
                let validated = self
                    .output
                    .safe_parse(&output)
                    .map_err(|f| f.into_error(code::OUTPUT_VALIDATION_ERROR))?;
                Ok(ProcedureReply::Single(validated))
            }
            ProcedureHandler::Streaming(h) => {
                let stream = h(parsed, ctx).await?;
                let validator = self.output.clone();
                let checked = stream.map(move |item| {
                    item.and_then(|value| {
                        validator
                            .safe_parse(&value)
                            .map_err(|f| f.into_error(code::OUTPUT_VALIDATION_ERROR))
                    })
                });
                Ok(ProcedureReply::Stream(Box::pin(checked)))
            }
        }
    }
}

/// Fluent builder for procedures.
pub struct ProcedureBuilder {
    path: String,
    input: Arc<dyn Validator>,
    output: Arc<dyn Validator>,
    metadata: ProcedureMetadata,
    handler: Option<ProcedureHandler>,
    streaming: bool,
}

impl ProcedureBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            input: validation::any(),
            output: validation::any(),
            metadata: ProcedureMetadata::default(),
            handler: None,
            streaming: false,
        }
    }

    pub fn input(mut self, validator: Arc<dyn Validator>) -> Self {
        self.input = validator;
        self
    }

    pub fn output(mut self, validator: Arc<dyn Validator>) -> Self {
        self.output = validator;
        self
    }

    /// Shape-check the input against `T`.
    pub fn input_typed<T>(self) -> Self
    where
        T: DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        self.input(validation::typed::<T>())
    }

    /// Shape-check the output against `T`.
    pub fn output_typed<T>(self) -> Self
    where
        T: DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        self.output(validation::typed::<T>())
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    pub fn deprecated(mut self, deprecated: bool) -> Self {
        self.metadata.deprecated = deprecated;
        self
    }

    /// Raw JSON handler.
    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value, ProcContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Value>> + Send + 'static,
    {
        self.handler = Some(ProcedureHandler::Unary(Arc::new(move |input, ctx| {
            Box::pin(f(input, ctx))
        })));
        self.streaming = false;
        self
    }

    /// Typed handler; JSON conversion happens at the boundary.
    pub fn handler_typed<I, O, F, Fut>(mut self, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, ProcContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = RpcResult<O>> + Send + 'static,
    {
        self.handler = Some(ProcedureHandler::Unary(Arc::new(move |input, ctx| {
            let f = f.clone();
            Box::pin(async move {
                let input: I = serde_json::from_value(input)
                    .map_err(|e| RpcError::validation(format!("invalid input: {}", e)))?;
                let output = f(input, ctx).await?;
                serde_json::to_value(output)
                    .map_err(|e| RpcError::execution(format!("failed to serialize output: {}", e)))
            })
        })));
        self.streaming = false;
        self
    }

    /// Handler producing a stream of output values.
    pub fn streaming_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value, ProcContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<ValueStream>> + Send + 'static,
    {
        self.handler = Some(ProcedureHandler::Streaming(Arc::new(move |input, ctx| {
            Box::pin(f(input, ctx))
        })));
        self.streaming = true;
        self
    }

    /// Finish without a handler: a client-side stub.
    pub fn stub(mut self) -> Self {
        self.handler = None;
        self
    }

    pub fn build(self) -> RpcResult<Procedure> {
        let path = ProcedurePath::parse(&self.path)?;
        Ok(Procedure {
            path,
            input: self.input,
            output: self.output,
            metadata: self.metadata,
            handler: self.handler,
            streaming: self.streaming,
        })
    }
}

/// Context handed to procedure handlers.
#[derive(Clone)]
pub struct ProcContext {
    pub metadata: Metadata,
    pub signal: Option<Arc<CancellationSignal>>,
    pub path: ProcedurePath,
    pub registry: Arc<ProcedureRegistry>,
}

impl ProcContext {
    pub fn new(registry: Arc<ProcedureRegistry>, path: ProcedurePath) -> Self {
        Self {
            metadata: Metadata::new(),
            signal: None,
            path,
            registry,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_signal(mut self, signal: Arc<CancellationSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.as_ref().map(|s| s.is_cancelled()).unwrap_or(false)
    }

    /// Client for inter-procedure calls through the same registry.
    pub fn client(&self) -> RegistryClient {
        RegistryClient {
            registry: self.registry.clone(),
            metadata: self.metadata.clone(),
            signal: self.signal.clone(),
        }
    }
}

/// Resolves calls against a registry, with schema validation at the call
/// boundary. Handed to procedure handlers for nested calls.
#[derive(Clone)]
pub struct RegistryClient {
    registry: Arc<ProcedureRegistry>,
    metadata: Metadata,
    signal: Option<Arc<CancellationSignal>>,
}

impl RegistryClient {
    pub fn new(registry: Arc<ProcedureRegistry>) -> Self {
        Self {
            registry,
            metadata: Metadata::new(),
            signal: None,
        }
    }

    pub fn call(&self, path: &str, input: Value) -> BoxFuture<'static, RpcResult<Value>> {
        let registry = self.registry.clone();
        let metadata = self.metadata.clone();
        let signal = self.signal.clone();
        let path = path.to_string();
        Box::pin(async move {
            let path = ProcedurePath::parse(&path)?;
            let procedure = registry
                .get(&path)
                .ok_or_else(|| RpcError::not_found(format!("no procedure at '{}'", path)))?;
            let mut ctx = ProcContext::new(registry, path).with_metadata(metadata);
            ctx.signal = signal;
            procedure.invoke(input, ctx).await?.into_value().await
        })
    }
}

/// Registration / removal notification.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered { path: ProcedurePath },
    Unregistered { path: ProcedurePath },
}

type Listener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOptions {
    pub override_existing: bool,
}

/// Materialized tree view of the registry.
#[derive(Debug, Clone, Default)]
pub struct ProcedureTreeNode {
    pub procedure: Option<Arc<Procedure>>,
    pub children: BTreeMap<String, ProcedureTreeNode>,
}

/// Path-keyed procedure store. Writes are atomic with respect to reads and
/// no lock is held across an await.
#[derive(Default)]
pub struct ProcedureRegistry {
    procedures: RwLock<HashMap<String, Arc<Procedure>>>,
    listeners: RwLock<Vec<Listener>>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<ProcedureRegistry>> = OnceLock::new();

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance. A convention, not a requirement: servers
    /// may own scoped registries.
    pub fn global() -> Arc<Self> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(Self::new()))
            .clone()
    }

    pub fn register(&self, procedure: Procedure, options: RegisterOptions) -> RpcResult<()> {
        let key = procedure.path.key();
        let path = procedure.path.clone();
        {
            let mut procedures = self
                .procedures
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if procedures.contains_key(&key) && !options.override_existing {
                return Err(RpcError::already_registered(&key));
            }
            procedures.insert(key, Arc::new(procedure));
        }
        tracing::debug!(path = %path, "procedure registered");
        self.emit(&RegistryEvent::Registered { path });
        Ok(())
    }

    pub fn unregister(&self, path: &ProcedurePath) -> bool {
        let removed = self
            .procedures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&path.key())
            .is_some();
        if removed {
            tracing::debug!(path = %path, "procedure unregistered");
            self.emit(&RegistryEvent::Unregistered { path: path.clone() });
        }
        removed
    }

    pub fn get(&self, path: &ProcedurePath) -> Option<Arc<Procedure>> {
        self.procedures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path.key())
            .cloned()
    }

    pub fn get_key(&self, key: &str) -> Option<Arc<Procedure>> {
        self.procedures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn has(&self, path: &ProcedurePath) -> bool {
        self.get(path).is_some()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.get_key(key).is_some()
    }

    /// Every procedure whose path starts with the prefix; the empty prefix
    /// returns all. Results are ordered by key.
    pub fn by_prefix(&self, prefix: &str) -> Vec<Arc<Procedure>> {
        let procedures = self
            .procedures
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<_> = procedures
            .iter()
            .filter(|(key, _)| {
                prefix.is_empty()
                    || key.as_str() == prefix
                    || key.starts_with(&format!("{}.", prefix))
            })
            .map(|(_, procedure)| procedure.clone())
            .collect();
        matched.sort_by_key(|p| p.path.key());
        matched
    }

    /// Sorted listing of registered paths.
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .procedures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.procedures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialized nested view; the leaf at a path is the procedure
    /// registered there.
    pub fn tree(&self) -> ProcedureTreeNode {
        let procedures = self
            .procedures
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut root = ProcedureTreeNode::default();
        for procedure in procedures.values() {
            let mut node = &mut root;
            for segment in procedure.path.segments() {
                node = node.children.entry(segment.clone()).or_default();
            }
            node.procedure = Some(procedure.clone());
        }
        root
    }

    /// Unique path segments appearing at the given depth.
    pub fn namespaces_at_depth(&self, depth: usize) -> BTreeSet<String> {
        self.procedures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|p| p.path.segments().get(depth).cloned())
            .collect()
    }

    /// Remove everything, emitting one unregister event per entry.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut procedures = self
                .procedures
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            procedures.drain().map(|(_, p)| p.path.clone()).collect()
        };
        for path in drained {
            self.emit(&RegistryEvent::Unregistered { path });
        }
    }

    /// Subscribe to registration events. Delivery is synchronous, in
    /// subscription order.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    fn emit(&self, event: &RegistryEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot {
            // A panicking listener must not block the others or the caller.
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!("registry listener panicked");
            }
        }
    }
}
