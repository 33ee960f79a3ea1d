//! Batch executor tests: strategies, concurrency bounds, response-tree
//! isomorphism and failure containment.

use crate::batch::{BatchExecutor, BatchOptions, BatchStrategy, StreamConfig};
use crate::cancel::CancellationSignal;
use crate::registry::{Procedure, ProcedureRegistry, RegisterOptions};
use crate::route::{resolve, ResolveOptions};
use futures::StreamExt;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn register(registry: &ProcedureRegistry, procedure: Procedure) {
    registry
        .register(procedure, RegisterOptions::default())
        .unwrap();
}

fn fixture_registry() -> Arc<ProcedureRegistry> {
    let registry = Arc::new(ProcedureRegistry::new());
    register(
        &registry,
        Procedure::builder("users.get")
            .handler(|input, _| async move { Ok(json!({ "id": input["id"] })) })
            .build()
            .unwrap(),
    );
    register(
        &registry,
        Procedure::builder("orders.list")
            .handler(|_, _| async move { Ok(json!([{ "oid": "o1" }])) })
            .build()
            .unwrap(),
    );
    registry
}

#[tokio::test]
async fn test_all_strategy_builds_isomorphic_tree() {
    let executor = BatchExecutor::new(fixture_registry());
    let output = executor
        .route(
            &json!({
                "users": { "get": { "id": "1" } },
                "orders": { "list": { "userId": "1" } },
            }),
            &BatchOptions::new(BatchStrategy::All),
        )
        .await
        .unwrap();

    assert!(output.success);
    assert_eq!(
        output.tree,
        json!({
            "users": { "get": { "success": true, "data": { "id": "1" } } },
            "orders": { "list": { "success": true, "data": [{ "oid": "o1" }] } },
        })
    );
}

#[tokio::test]
async fn test_all_collects_failures_without_cancelling_peers() {
    let registry = Arc::new(ProcedureRegistry::new());
    let slow_completed = Arc::new(AtomicUsize::new(0));
    let slow_marker = slow_completed.clone();
    register(
        &registry,
        Procedure::builder("jobs.slow")
            .handler(move |_, _| {
                let marker = slow_marker.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    marker.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("done"))
                }
            })
            .build()
            .unwrap(),
    );
    register(
        &registry,
        Procedure::builder("jobs.failing")
            .handler(|_, _| async move {
                Err(crate::error::RpcError::handler("expected failure"))
            })
            .build()
            .unwrap(),
    );

    let executor = BatchExecutor::new(registry);
    let output = executor
        .route(
            &json!({ "jobs": { "slow": {}, "failing": {} } }),
            &BatchOptions::new(BatchStrategy::All),
        )
        .await
        .unwrap();

    assert!(!output.success);
    assert_eq!(output.results.len(), 2);
    // The failing route never cancelled its peer.
    assert_eq!(slow_completed.load(Ordering::SeqCst), 1);
    assert_eq!(output.tree["jobs"]["slow"]["success"], true);
    assert_eq!(output.tree["jobs"]["failing"]["success"], false);
    assert_eq!(output.tree["jobs"]["failing"]["code"], "HANDLER_ERROR");
}

#[tokio::test]
async fn test_race_picks_first_settled() {
    let registry = Arc::new(ProcedureRegistry::new());
    register(
        &registry,
        Procedure::builder("race.slow")
            .handler(|_, _| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("A"))
            })
            .build()
            .unwrap(),
    );
    register(
        &registry,
        Procedure::builder("race.fast")
            .handler(|_, _| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!("B"))
            })
            .build()
            .unwrap(),
    );

    let executor = BatchExecutor::new(registry);
    let output = executor
        .route(
            &json!({ "race": { "slow": {}, "fast": {} } }),
            &BatchOptions::new(BatchStrategy::Race),
        )
        .await
        .unwrap();

    assert!(output.success);
    assert_eq!(output.results.len(), 1);
    assert_eq!(output.results[0].path.key(), "race.fast");
    assert_eq!(output.tree["race"]["fast"]["data"], "B");
    assert!(output.tree["race"].get("slow").is_none());
}

#[tokio::test]
async fn test_race_failure_wins_too() {
    let registry = Arc::new(ProcedureRegistry::new());
    register(
        &registry,
        Procedure::builder("race.slow_ok")
            .handler(|_, _| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("ok"))
            })
            .build()
            .unwrap(),
    );
    register(
        &registry,
        Procedure::builder("race.fast_fail")
            .handler(|_, _| async move {
                Err(crate::error::RpcError::handler("fast failure"))
            })
            .build()
            .unwrap(),
    );

    let executor = BatchExecutor::new(registry);
    let output = executor
        .route(
            &json!({ "race": { "slow_ok": {}, "fast_fail": {} } }),
            &BatchOptions::new(BatchStrategy::Race),
        )
        .await
        .unwrap();

    assert!(!output.success);
    assert_eq!(output.results.len(), 1);
    assert_eq!(output.results[0].path.key(), "race.fast_fail");
}

#[tokio::test]
async fn test_stream_respects_concurrency_bound() {
    let registry = Arc::new(ProcedureRegistry::new());
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    for i in 0..8 {
        let in_flight = in_flight.clone();
        let max_seen = max_seen.clone();
        register(
            &registry,
            Procedure::builder(format!("work.task{}", i))
                .handler(move |_, _| {
                    let in_flight = in_flight.clone();
                    let max_seen = max_seen.clone();
                    async move {
                        let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(current, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!(current))
                    }
                })
                .build()
                .unwrap(),
        );
    }

    let tree: Value = json!({
        "work": (0..8).map(|i| (format!("task{}", i), json!({}))).collect::<serde_json::Map<_, _>>()
    });

    let executor = BatchExecutor::new(registry.clone());
    let resolution = resolve(&registry, &tree, &ResolveOptions::default());
    assert_eq!(resolution.resolved.len(), 8);

    let mut options = BatchOptions::new(BatchStrategy::Stream);
    options.stream = StreamConfig { concurrency: Some(2) };
    let outcomes: Vec<_> = executor
        .execute_stream(resolution.resolved, &options)
        .collect()
        .await;

    // All routes complete and the in-flight count never exceeds the permit
    // budget.
    assert_eq!(outcomes.len(), 8);
    assert!(outcomes.iter().all(|o| o.result.is_success()));
    assert!(max_seen.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_stream_yields_in_completion_order() {
    let registry = Arc::new(ProcedureRegistry::new());
    register(
        &registry,
        Procedure::builder("mix.slow")
            .handler(|_, _| async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(json!("slow"))
            })
            .build()
            .unwrap(),
    );
    register(
        &registry,
        Procedure::builder("mix.fast")
            .handler(|_, _| async move { Ok(json!("fast")) })
            .build()
            .unwrap(),
    );

    let executor = BatchExecutor::new(registry.clone());
    let resolution = resolve(
        &registry,
        &json!({ "mix": { "slow": {}, "fast": {} } }),
        &ResolveOptions::default(),
    );
    let outcomes: Vec<_> = executor
        .execute_stream(resolution.resolved, &BatchOptions::new(BatchStrategy::Stream))
        .collect()
        .await;

    assert_eq!(outcomes[0].path.key(), "mix.fast");
    assert_eq!(outcomes[1].path.key(), "mix.slow");
}

#[tokio::test]
async fn test_empty_tree_succeeds_with_empty_response() {
    let executor = BatchExecutor::new(fixture_registry());
    let output = executor
        .route(&json!({}), &BatchOptions::new(BatchStrategy::All))
        .await
        .unwrap();

    assert!(output.success);
    assert!(output.results.is_empty());
    assert_eq!(output.tree, json!({}));
}

#[tokio::test]
async fn test_not_found_routes_become_failure_leaves() {
    let executor = BatchExecutor::new(fixture_registry());
    let mut options = BatchOptions::new(BatchStrategy::All);
    options.continue_on_error = true;

    let output = executor
        .route(
            &json!({
                "users": { "get": { "id": "1" } },
                "ghosts": { "list": {} },
            }),
            &options,
        )
        .await
        .unwrap();

    assert!(!output.success);
    assert_eq!(output.tree["users"]["get"]["success"], true);
    assert_eq!(output.tree["ghosts"]["list"]["success"], false);
    assert_eq!(output.tree["ghosts"]["list"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_panicking_route_settles_as_failure() {
    let registry = Arc::new(ProcedureRegistry::new());
    register(
        &registry,
        Procedure::builder("jobs.panics")
            .handler(|_, _| async move {
                panic!("route exploded");
                #[allow(unreachable_code)]
                Ok(json!(null))
            })
            .build()
            .unwrap(),
    );

    let executor = BatchExecutor::new(registry);
    let output = executor
        .route(
            &json!({ "jobs": { "panics": {} } }),
            &BatchOptions::new(BatchStrategy::All),
        )
        .await
        .unwrap();

    assert!(!output.success);
    assert_eq!(output.tree["jobs"]["panics"]["code"], "EXECUTION_ERROR");
}

#[tokio::test]
async fn test_cancelled_batch_settles_routes_as_aborted() {
    let executor = BatchExecutor::new(fixture_registry());
    let cancel = CancellationSignal::arc();
    cancel.cancel();

    let mut options = BatchOptions::new(BatchStrategy::All);
    options.cancel = Some(cancel);
    let output = executor
        .route(&json!({ "users": { "get": { "id": "1" } } }), &options)
        .await
        .unwrap();

    assert!(!output.success);
    assert_eq!(output.tree["users"]["get"]["code"], "ABORTED");
}

#[tokio::test]
async fn test_single_segment_procedures_are_route_addressable() {
    // Too short for method dispatch, but batch routing reaches them.
    let registry = Arc::new(ProcedureRegistry::new());
    register(
        &registry,
        Procedure::builder("health")
            .handler(|_, _| async move { Ok(json!("healthy")) })
            .build()
            .unwrap(),
    );

    let executor = BatchExecutor::new(registry);
    let output = executor
        .route(&json!({ "health": {} }), &BatchOptions::new(BatchStrategy::All))
        .await
        .unwrap();

    assert!(output.success);
    assert_eq!(output.tree["health"]["data"], "healthy");
}

#[tokio::test]
async fn test_max_routes_limit() {
    let executor = BatchExecutor::new(fixture_registry());
    let mut options = BatchOptions::new(BatchStrategy::All);
    options.max_routes = Some(1);

    let error = executor
        .route(
            &json!({
                "users": { "get": { "id": "1" } },
                "orders": { "list": {} },
            }),
            &options,
        )
        .await
        .unwrap_err();
    assert!(error.is(crate::error::code::VALIDATION_ERROR));
}

#[tokio::test]
async fn test_durations_are_recorded() {
    let registry = Arc::new(ProcedureRegistry::new());
    register(
        &registry,
        Procedure::builder("timing.sleepy")
            .handler(|_, _| async move {
                tokio::time::sleep(Duration::from_millis(25)).await;
                Ok(json!(null))
            })
            .build()
            .unwrap(),
    );

    let executor = BatchExecutor::new(registry);
    let output = executor
        .route(
            &json!({ "timing": { "sleepy": {} } }),
            &BatchOptions::new(BatchStrategy::All),
        )
        .await
        .unwrap();

    assert!(output.results[0].duration >= Duration::from_millis(20));
    assert!(output.duration >= output.results[0].duration);
}

proptest! {
    /// Flattening resolves exactly the registered leaves, and the response
    /// tree mirrors the request tree's shape.
    #[test]
    fn prop_flatten_count_and_shape(
        include_users_get in proptest::bool::ANY,
        include_users_list in proptest::bool::ANY,
        include_orders_list in proptest::bool::ANY,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let registry = Arc::new(ProcedureRegistry::new());
            for path in ["users.get", "users.list", "orders.list"] {
                register(
                    &registry,
                    Procedure::builder(path)
                        .handler(|input, _| async move { Ok(input) })
                        .build()
                        .unwrap(),
                );
            }

            let mut users = serde_json::Map::new();
            if include_users_get {
                users.insert("get".into(), json!({ "id": "1" }));
            }
            if include_users_list {
                users.insert("list".into(), json!({}));
            }
            let mut tree = serde_json::Map::new();
            if !users.is_empty() {
                tree.insert("users".into(), Value::Object(users));
            }
            if include_orders_list {
                tree.insert("orders".into(), json!({ "list": {} }));
            }
            let tree = Value::Object(tree);

            let expected = usize::from(include_users_get)
                + usize::from(include_users_list)
                + usize::from(include_orders_list);

            let resolution = resolve(&registry, &tree, &ResolveOptions::default());
            prop_assert_eq!(resolution.resolved.len(), expected);

            let executor = BatchExecutor::new(registry);
            let output = executor
                .route(&tree, &BatchOptions::new(BatchStrategy::All))
                .await
                .unwrap();
            prop_assert!(output.success);
            prop_assert_eq!(output.results.len(), expected);

            if include_users_get {
                prop_assert!(output.tree["users"]["get"]["success"].as_bool().unwrap());
            }
            if include_orders_list {
                prop_assert!(output.tree["orders"]["list"]["success"].as_bool().unwrap());
            }
            Ok(())
        })?;
    }
}
