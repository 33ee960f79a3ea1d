//! # rpc-fabric
//!
//! A protocol-agnostic RPC fabric: a client/server pair plus a procedure
//! registry that let application code invoke typed remote or in-process
//! procedures through composable middleware, over swappable transports,
//! with batch routing of nested call trees.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Client                              │
//! │  call / stream ──▶ context merge ──▶ middleware chain        │
//! │                                          │                   │
//! │            retry · timeout · cache · breaker · rate limit    │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ Envelope
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Transport                             │
//! │     websocket (reconnect + heartbeat + correlation)          │
//! │     http · in-process · mock                                 │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ ResponseItem*
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Server                              │
//! │  matcher registry ──▶ middleware ──▶ handler / procedure     │
//! │                                          │                   │
//! │               registry ◀── batch executor (all/race/stream)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rpc_fabric::prelude::*;
//!
//! let server = Server::builder()
//!     .mount(
//!         Procedure::builder("users.get")
//!             .input_typed::<GetUserInput>()
//!             .handler_typed(|input: GetUserInput, _ctx| async move {
//!                 Ok(User { id: input.id, name: "A".into() })
//!             })
//!             .build()?,
//!     )?
//!     .build()?;
//!
//! let client = Client::builder()
//!     .transport(Arc::new(InProcTransport::new(&server)))
//!     .middleware(retry_middleware(RetryConfig::default()))
//!     .middleware(timeout_middleware(Duration::from_secs(5)))
//!     .build()?;
//!
//! let user = client
//!     .call(Method::new("users", "get"), json!({ "id": "1" }), CallOptions::new())
//!     .await?;
//! ```
//!
//! ## Batch routing
//!
//! ```rust,ignore
//! let executor = BatchExecutor::new(server.registry());
//! let output = executor
//!     .route(
//!         &json!({
//!             "users": { "get": { "id": "1" } },
//!             "orders": { "list": { "userId": "1" } },
//!         }),
//!         &BatchOptions::new(BatchStrategy::All),
//!     )
//!     .await?;
//! assert!(output.tree["users"]["get"]["success"].as_bool().unwrap());
//! ```
//!
//! ## Module structure
//!
//! - [`client`] - client state, context hierarchy, call/stream
//! - [`server`] - matcher registry, dispatch, transport lifecycle
//! - [`registry`] - procedures, path-keyed store, events, tree view
//! - [`route`] / [`batch`] - route resolution and fan-out strategies
//! - [`middleware`] - the onion composer and reference middlewares
//! - [`transport`] - transport contract, WebSocket/HTTP/in-process/mock
//! - [`message`] / [`error`] - envelopes, status model, error taxonomy

pub mod batch;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod middleware;
pub mod registry;
pub mod route;
pub mod server;
pub mod streaming;
pub mod transport;
pub mod validation;

#[cfg(test)]
mod tests;

// Public API
pub use batch::{
    BatchExecutor, BatchOptions, BatchOutcome, BatchStrategy, RouteOutcome, RouteOutput,
    StreamConfig,
};
pub use cancel::{linked, CancellationSignal, SignalLink};
pub use client::{CallOptions, Client, ClientBuilder, MethodSchemas, SchemaMap};
pub use config::{ConfigValidationError, FabricConfig};
pub use error::{code, ErrorCode, RpcError, RpcResult};
pub use message::{deep_merge, merge_metadata, Envelope, Metadata, Method, ResponseItem, Status};
pub use middleware::{
    auth_middleware, bearer_auth_middleware, cache_middleware, circuit_breaker_middleware,
    circuit_breaker_with, compose, from_fn, identity, rate_limit_middleware, rate_limit_with,
    retry_middleware, runner_fn, timeout_middleware, tracing_middleware, validation_middleware,
    CacheConfig, CallContext, CircuitBreaker, CircuitBreakerConfig, CircuitState, Middleware,
    RateLimitConfig, RateLimitStrategy, RateLimiter, RetryConfig, Runner,
};
pub use registry::{
    validate_path, ProcContext, Procedure, ProcedureBuilder, ProcedureHandler, ProcedureMetadata,
    ProcedurePath, ProcedureRegistry, ProcedureReply, ProcedureTreeNode, RegisterOptions,
    RegistryClient, RegistryEvent, ValueStream,
};
pub use route::{
    build_response_tree, resolve, OutputConfig, ProcedureCallResult, Resolution, ResolveOptions,
    ResolvedRoute, RouteError, RouteErrorKind,
};
pub use server::{Dispatcher, MethodMatcher, SegmentMatcher, Server, ServerBuilder, ServerTransport};
pub use streaming::ItemStream;
pub use transport::{
    HttpTransport, InProcTransport, MockTransport, Transport, WireKind, WireMessage, WsConfig,
    WsServerTransport, WsState, WsTransport,
};
pub use validation::{
    FieldError, Validate, ValidationFailure, ValidationResult, Validator,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        // Batch
        BatchExecutor,
        BatchOptions,
        BatchStrategy,
        // Client
        CallOptions,
        CancellationSignal,
        Client,
        Envelope,
        // Errors
        ErrorCode,
        FabricConfig,
        // Transports
        HttpTransport,
        InProcTransport,
        // Messages
        Metadata,
        Method,
        MethodMatcher,
        MockTransport,
        // Registry
        ProcContext,
        Procedure,
        ProcedurePath,
        ProcedureRegistry,
        ResponseItem,
        RpcError,
        RpcResult,
        SegmentMatcher,
        // Server
        Server,
        Status,
        Transport,
        // Validation
        Validate,
        ValidationResult,
        Validator,
        WsConfig,
        WsServerTransport,
        WsTransport,
        // Middlewares
        cache_middleware,
        circuit_breaker_middleware,
        rate_limit_middleware,
        retry_middleware,
        timeout_middleware,
        tracing_middleware,
        validation_middleware,
        CacheConfig,
        CircuitBreakerConfig,
        RateLimitConfig,
        RetryConfig,
    };
    pub use serde_json::json;
    pub use std::sync::Arc;
}
