//! Batch executor.
//!
//! Fans a resolved route set out under one of three strategies - `all`
//! (join every result), `race` (first settled wins), `stream` (completion
//! order under bounded concurrency) - and rebuilds a response tree
//! isomorphic to the request tree. Every route runs inside a catch-all:
//! panics and errors settle as failure results, never as raw rejections.

use crate::cancel::{linked, CancellationSignal, SignalLink};
use crate::error::{RpcError, RpcResult};
use crate::message::Metadata;
use crate::registry::{ProcContext, ProcedurePath, ProcedureRegistry};
use crate::route::{
    build_response_tree, resolve, ProcedureCallResult, ResolveOptions, ResolvedRoute,
};
use futures::future::join_all;
use futures::stream::Stream;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchStrategy {
    #[default]
    All,
    Race,
    Stream,
}

#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    /// Maximum in-flight routes; default is the number of routes.
    pub concurrency: Option<usize>,
}

#[derive(Clone, Default)]
pub struct BatchOptions {
    pub strategy: BatchStrategy,
    pub continue_on_error: bool,
    pub validate_input: bool,
    pub stream: StreamConfig,
    /// Upper bound on routes per batch; unbounded when unset.
    pub max_routes: Option<usize>,
    /// Metadata forwarded into every route's procedure context.
    pub metadata: Metadata,
    pub cancel: Option<Arc<CancellationSignal>>,
}

impl BatchOptions {
    pub fn new(strategy: BatchStrategy) -> Self {
        Self {
            strategy,
            validate_input: true,
            ..Self::default()
        }
    }
}

/// One settled route with its wall-clock duration.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub path: ProcedurePath,
    pub result: ProcedureCallResult,
    pub duration: Duration,
}

/// Settled batch: per-route outcomes plus the overall duration (start to
/// last settlement for `all`, start to first for `race`).
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub results: Vec<RouteOutcome>,
    pub success: bool,
    pub duration: Duration,
}

/// Full result of routing a request tree.
#[derive(Debug, Clone)]
pub struct RouteOutput {
    /// Response tree isomorphic to the request tree.
    pub tree: Value,
    pub success: bool,
    pub results: Vec<RouteOutcome>,
    pub duration: Duration,
}

pub struct BatchExecutor {
    registry: Arc<ProcedureRegistry>,
}

impl BatchExecutor {
    pub fn new(registry: Arc<ProcedureRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve a route tree and execute it under the configured strategy.
    pub async fn route(&self, tree: &Value, options: &BatchOptions) -> RpcResult<RouteOutput> {
        let start = Instant::now();
        let resolution = resolve(
            &self.registry,
            tree,
            &ResolveOptions {
                validate_input: options.validate_input,
                continue_on_error: options.continue_on_error,
            },
        );

        if let Some(max) = options.max_routes {
            if resolution.resolved.len() > max {
                return Err(RpcError::validation(format!(
                    "batch of {} routes exceeds the maximum of {}",
                    resolution.resolved.len(),
                    max
                )));
            }
        }

        let mut failures: Vec<RouteOutcome> = resolution
            .errors
            .iter()
            .filter_map(|error| {
                let path = ProcedurePath::parse(&error.path).ok()?;
                Some(RouteOutcome {
                    result: ProcedureCallResult::fail(&error.path, &error.to_rpc_error()),
                    path,
                    duration: Duration::ZERO,
                })
            })
            .collect();

        // Routes that did resolve always execute; resolution errors settle
        // as failure leaves alongside them.
        let resolution_failed = !resolution.success();
        let outcome = match options.strategy {
            BatchStrategy::All => self.execute_all(resolution.resolved, options).await,
            BatchStrategy::Race => self.execute_race(resolution.resolved, options).await,
            BatchStrategy::Stream => {
                let mut stream = self.execute_stream(resolution.resolved, options);
                let mut results = Vec::new();
                while let Some(settled) = futures::StreamExt::next(&mut stream).await {
                    results.push(settled);
                }
                let success = results.iter().all(|r| r.result.is_success());
                BatchOutcome {
                    results,
                    success,
                    duration: start.elapsed(),
                }
            }
        };

        let mut results = outcome.results;
        let success = outcome.success && !resolution_failed;
        results.append(&mut failures);
        let tree = build_response_tree(results.iter().map(|r| (&r.path, &r.result)));
        Ok(RouteOutput {
            tree,
            success,
            results,
            duration: start.elapsed(),
        })
    }

    /// Launch every route concurrently and wait for all of them. A failed
    /// route never cancels its peers; success is the conjunction.
    pub async fn execute_all(
        &self,
        routes: Vec<ResolvedRoute>,
        options: &BatchOptions,
    ) -> BatchOutcome {
        let start = Instant::now();
        let futures: Vec<_> = routes
            .into_iter()
            .map(|route| {
                run_route(
                    self.registry.clone(),
                    route,
                    options.metadata.clone(),
                    options.cancel.clone(),
                )
            })
            .collect();
        let results = join_all(futures).await;
        let success = results.iter().all(|r| r.result.is_success());
        BatchOutcome {
            results,
            success,
            duration: start.elapsed(),
        }
    }

    /// First settled result - success or failure - wins. Losers are stopped
    /// cooperatively through a batch-local cancellation signal and their
    /// outcomes are discarded.
    pub async fn execute_race(
        &self,
        routes: Vec<ResolvedRoute>,
        options: &BatchOptions,
    ) -> BatchOutcome {
        let start = Instant::now();
        if routes.is_empty() {
            return BatchOutcome {
                results: Vec::new(),
                success: true,
                duration: start.elapsed(),
            };
        }

        let (batch_signal, _link) = match &options.cancel {
            Some(outer) => linked([outer.clone()]),
            None => (CancellationSignal::arc(), SignalLink::empty()),
        };

        let futures: Vec<_> = routes
            .into_iter()
            .map(|route| {
                Box::pin(run_route(
                    self.registry.clone(),
                    route,
                    options.metadata.clone(),
                    Some(batch_signal.clone()),
                ))
            })
            .collect();

        let (winner, _index, _losers) = futures::future::select_all(futures).await;
        batch_signal.cancel();

        let success = winner.result.is_success();
        BatchOutcome {
            results: vec![winner],
            success,
            duration: start.elapsed(),
        }
    }

    /// Yield results in completion order with bounded in-flight concurrency.
    /// Dropping the returned stream terminates the consumer side; permits
    /// are released on every exit path.
    pub fn execute_stream(
        &self,
        routes: Vec<ResolvedRoute>,
        options: &BatchOptions,
    ) -> Pin<Box<dyn Stream<Item = RouteOutcome> + Send>> {
        let limit = options
            .stream
            .concurrency
            .unwrap_or(routes.len())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let (tx, rx) = mpsc::channel(routes.len().max(1));

        for route in routes {
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            let registry = self.registry.clone();
            let metadata = options.metadata.clone();
            let cancel = options.cancel.clone();
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let outcome = run_route(registry, route, metadata, cancel).await;
                let _ = tx.send(outcome).await;
            });
        }

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|outcome| (outcome, rx))
        }))
    }
}

async fn run_route(
    registry: Arc<ProcedureRegistry>,
    route: ResolvedRoute,
    metadata: Metadata,
    cancel: Option<Arc<CancellationSignal>>,
) -> RouteOutcome {
    let start = Instant::now();
    let path = route.path.clone();
    let key = path.key();

    if cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
        return RouteOutcome {
            path,
            result: ProcedureCallResult::fail(&key, &RpcError::aborted("batch cancelled")),
            duration: start.elapsed(),
        };
    }

    let mut ctx = ProcContext::new(registry, path.clone()).with_metadata(metadata);
    ctx.signal = cancel;

    let invocation = async {
        route
            .procedure
            .invoke(route.input, ctx)
            .await?
            .into_value()
            .await
    };

    let result = match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(data)) => ProcedureCallResult::ok(data),
        Ok(Err(error)) => ProcedureCallResult::fail(&key, &error),
        Err(_) => ProcedureCallResult::fail(
            &key,
            &RpcError::execution(format!("route '{}' panicked", key)),
        ),
    };

    RouteOutcome {
        path,
        result,
        duration: start.elapsed(),
    }
}
