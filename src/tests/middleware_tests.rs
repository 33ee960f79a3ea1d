//! Middleware engine tests: onion ordering, composition laws, short-circuit
//! and multi-invocation behavior.

use crate::message::{Envelope, Method, ResponseItem};
use crate::middleware::{compose, from_fn, identity, runner_fn, CallContext, Middleware, Runner};
use crate::streaming;
use proptest::prelude::*;
use serde_json::json;
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

fn test_context() -> CallContext {
    CallContext::new(Envelope::new(Method::new("svc", "op"), json!(null)))
}

/// Logs `<name>_enter` on the request path and `<name>_exit` once the full
/// response has passed through.
fn logging_middleware(name: &str, log: Log) -> Middleware {
    let name = name.to_string();
    from_fn(move |ctx, next| {
        let name = name.clone();
        let log = log.clone();
        async move {
            log.lock().unwrap().push(format!("{}_enter", name));
            let items = streaming::collect(next(ctx).await).await;
            log.lock().unwrap().push(format!("{}_exit", name));
            streaming::from_items(items)
        }
    })
}

fn short_circuit_middleware(name: &str, log: Log) -> Middleware {
    let name = name.to_string();
    from_fn(move |ctx, _next| {
        let name = name.clone();
        let log = log.clone();
        async move {
            log.lock().unwrap().push(format!("{}_short_circuit", name));
            streaming::single(ResponseItem::success(
                ctx.envelope.id.clone(),
                json!({ "short_circuit": true }),
            ))
        }
    })
}

fn logging_terminal(log: Log) -> Runner {
    runner_fn(move |ctx| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push("handler".to_string());
            streaming::single(ResponseItem::success(ctx.envelope.id.clone(), json!("ok")))
        }
    })
}

proptest! {
    /// For middleware added in order [M1..Mn] the execution order is
    /// M1 → … → Mn → handler → Mn → … → M1.
    #[test]
    fn prop_onion_execution_order(middleware_count in 1usize..5) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let log: Log = Arc::default();
            let chain: Vec<Middleware> = (0..middleware_count)
                .map(|i| logging_middleware(&format!("M{}", i + 1), log.clone()))
                .collect();

            let runner = compose(&chain, logging_terminal(log.clone()));
            streaming::collect(runner(test_context()).await).await;

            let mut expected = Vec::new();
            for i in 0..middleware_count {
                expected.push(format!("M{}_enter", i + 1));
            }
            expected.push("handler".to_string());
            for i in (0..middleware_count).rev() {
                expected.push(format!("M{}_exit", i + 1));
            }
            let log_guard = log.lock().unwrap();
            prop_assert_eq!(log_guard.as_slice(), expected.as_slice());
            Ok(())
        })?;
    }

    /// Composing [A, B, …] then prepending C equals composing [C, A, B, …].
    #[test]
    fn prop_composition_is_associative(middleware_count in 1usize..4) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let flat_log: Log = Arc::default();
            let flat_chain: Vec<Middleware> = (0..middleware_count)
                .map(|i| logging_middleware(&format!("M{}", i + 1), flat_log.clone()))
                .collect();
            let flat = compose(&flat_chain, logging_terminal(flat_log.clone()));
            let flat_items = streaming::collect(flat(test_context()).await).await;

            let nested_log: Log = Arc::default();
            let nested_chain: Vec<Middleware> = (0..middleware_count)
                .map(|i| logging_middleware(&format!("M{}", i + 1), nested_log.clone()))
                .collect();
            let inner = compose(&nested_chain[1..], logging_terminal(nested_log.clone()));
            let nested = compose(&nested_chain[..1], inner);
            let nested_items = streaming::collect(nested(test_context()).await).await;

            let flat_log_guard = flat_log.lock().unwrap();
            let nested_log_guard = nested_log.lock().unwrap();
            prop_assert_eq!(
                flat_log_guard.as_slice(),
                nested_log_guard.as_slice()
            );
            prop_assert_eq!(flat_items.len(), nested_items.len());
            prop_assert_eq!(&flat_items[0].payload, &nested_items[0].payload);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_identity_middleware_is_neutral() {
    let log: Log = Arc::default();
    let with_identity = compose(
        &[
            logging_middleware("M1", log.clone()),
            identity(),
            logging_middleware("M2", log.clone()),
        ],
        logging_terminal(log.clone()),
    );
    let items = streaming::collect(with_identity(test_context()).await).await;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].payload, json!("ok"));
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &["M1_enter", "M2_enter", "handler", "M2_exit", "M1_exit"]
    );
}

#[tokio::test]
async fn test_short_circuit_skips_downstream() {
    let log: Log = Arc::default();
    let runner = compose(
        &[
            logging_middleware("M1", log.clone()),
            short_circuit_middleware("M2", log.clone()),
            logging_middleware("M3", log.clone()),
        ],
        logging_terminal(log.clone()),
    );

    let items = streaming::collect(runner(test_context()).await).await;
    assert_eq!(items[0].payload, json!({ "short_circuit": true }));

    let log = log.lock().unwrap();
    assert!(!log.contains(&"M3_enter".to_string()));
    assert!(!log.contains(&"handler".to_string()));
    assert_eq!(log.as_slice(), &["M1_enter", "M2_short_circuit", "M1_exit"]);
}

#[tokio::test]
async fn test_middleware_may_invoke_next_repeatedly() {
    let log: Log = Arc::default();
    let twice = from_fn(|ctx, next| async move {
        streaming::collect(next(ctx.clone()).await).await;
        next(ctx).await
    });

    let runner = compose(&[twice], logging_terminal(log.clone()));
    streaming::collect(runner(test_context()).await).await;

    let handler_runs = log
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.as_str() == "handler")
        .count();
    assert_eq!(handler_runs, 2);
}

#[tokio::test]
async fn test_error_items_flow_outward_unchanged() {
    let failing = runner_fn(|ctx| async move {
        streaming::single(ResponseItem::error(
            ctx.envelope.id.clone(),
            crate::error::RpcError::transport(503, "unavailable"),
        ))
    });

    let runner = compose(&[identity(), identity()], failing);
    let items = streaming::collect(runner(test_context()).await).await;

    assert_eq!(items.len(), 1);
    let error = items[0].status.error().unwrap();
    assert_eq!(error.code, crate::error::ErrorCode::Numeric(503));
    assert!(error.retryable);
}

#[tokio::test]
async fn test_state_is_shared_across_the_chain() {
    let writer = from_fn(|ctx, next| async move {
        ctx.set_state("observed", json!(true));
        next(ctx).await
    });
    let reader = from_fn(|ctx, next| async move {
        assert_eq!(ctx.state("observed"), Some(json!(true)));
        next(ctx).await
    });

    let runner = compose(
        &[writer, reader],
        runner_fn(|ctx| async move {
            streaming::single(ResponseItem::success(ctx.envelope.id.clone(), json!(null)))
        }),
    );
    streaming::collect(runner(test_context()).await).await;
}
