//! Server dispatch tests: matchers, middleware, procedure mounting,
//! registry events and boundaries.

use crate::config::FabricConfig;
use crate::error::{code, RpcError};
use crate::message::{Envelope, Method, ResponseItem};
use crate::middleware::from_fn;
use crate::registry::{Procedure, ProcedureRegistry, RegisterOptions, RegistryEvent};
use crate::server::{MethodMatcher, SegmentMatcher, Server};
use crate::streaming;
use crate::validation;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

async fn first_item(server: &Server, method: Method, payload: Value) -> ResponseItem {
    let envelope = Envelope::new(method, payload);
    let mut stream = server.dispatch(envelope).await;
    stream.next().await.expect("dispatch yields at least one item")
}

#[tokio::test]
async fn test_unary_handler_round_trip() {
    let server = Server::builder()
        .unary(MethodMatcher::new("users", "get"), |_envelope| async move {
            Ok(json!({ "id": "1", "name": "A" }))
        })
        .build()
        .unwrap();

    let item = first_item(&server, Method::new("users", "get"), json!({ "id": "1" })).await;
    assert!(item.is_success());
    assert_eq!(item.payload, json!({ "id": "1", "name": "A" }));
}

#[tokio::test]
async fn test_unmatched_method_is_not_found() {
    let server = Server::builder().build().unwrap();
    let item = first_item(&server, Method::new("ghosts", "list"), json!(null)).await;
    assert!(item.status.error().unwrap().is(code::NOT_FOUND));
}

#[tokio::test]
async fn test_pattern_matcher_spans_operations() {
    let server = Server::builder()
        .unary(
            MethodMatcher::new("users", SegmentMatcher::pattern("get|list").unwrap()),
            |envelope| async move { Ok(json!({ "operation": envelope.method.operation })) },
        )
        .build()
        .unwrap();

    let get = first_item(&server, Method::new("users", "get"), json!(null)).await;
    assert_eq!(get.payload["operation"], "get");
    let list = first_item(&server, Method::new("users", "list"), json!(null)).await;
    assert_eq!(list.payload["operation"], "list");
    let create = first_item(&server, Method::new("users", "create"), json!(null)).await;
    assert!(create.is_error());
}

#[tokio::test]
async fn test_pattern_matches_full_segment_only() {
    let server = Server::builder()
        .unary(
            MethodMatcher::new("users", SegmentMatcher::pattern("get").unwrap()),
            |_| async move { Ok(json!("matched")) },
        )
        .build()
        .unwrap();

    let partial = first_item(&server, Method::new("users", "getAll"), json!(null)).await;
    assert!(partial.is_error());
}

#[tokio::test]
async fn test_first_match_wins_in_registration_order() {
    let server = Server::builder()
        .unary(MethodMatcher::new("users", "get"), |_| async move {
            Ok(json!("specific"))
        })
        .unary(
            MethodMatcher::new("users", SegmentMatcher::pattern(".*").unwrap()),
            |_| async move { Ok(json!("wildcard")) },
        )
        .build()
        .unwrap();

    let specific = first_item(&server, Method::new("users", "get"), json!(null)).await;
    assert_eq!(specific.payload, json!("specific"));
    let other = first_item(&server, Method::new("users", "delete"), json!(null)).await;
    assert_eq!(other.payload, json!("wildcard"));
}

#[tokio::test]
async fn test_version_matcher_requires_version() {
    let server = Server::builder()
        .unary(
            MethodMatcher::new("users", "get").with_version("v2"),
            |_| async move { Ok(json!("v2 handler")) },
        )
        .build()
        .unwrap();

    let versioned =
        first_item(&server, Method::new("users", "get").with_version("v2"), json!(null)).await;
    assert!(versioned.is_success());

    let unversioned = first_item(&server, Method::new("users", "get"), json!(null)).await;
    assert!(unversioned.is_error());
}

#[tokio::test]
async fn test_server_middleware_wraps_handlers() {
    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let log_mw = log.clone();
    let server = Server::builder()
        .middleware(from_fn(move |ctx, next| {
            let log = log_mw.clone();
            async move {
                log.lock().unwrap().push("before".into());
                let items = streaming::collect(next(ctx).await).await;
                log.lock().unwrap().push("after".into());
                streaming::from_items(items)
            }
        }))
        .unary(MethodMatcher::new("users", "get"), |_| async move {
            Ok(json!(null))
        })
        .build()
        .unwrap();

    first_item(&server, Method::new("users", "get"), json!(null)).await;
    assert_eq!(log.lock().unwrap().as_slice(), &["before", "after"]);
}

#[tokio::test]
async fn test_handler_panic_becomes_error_item() {
    let server = Server::builder()
        .unary(MethodMatcher::new("jobs", "explode"), |_| async move {
            panic!("boom");
            #[allow(unreachable_code)]
            Ok(json!(null))
        })
        .build()
        .unwrap();

    let item = first_item(&server, Method::new("jobs", "explode"), json!(null)).await;
    assert!(item.status.error().unwrap().is(code::HANDLER_ERROR));
}

#[tokio::test]
async fn test_payload_size_limit() {
    let server = Server::builder()
        .config(FabricConfig::new().with_max_payload_size(16))
        .unary(MethodMatcher::new("users", "get"), |_| async move {
            Ok(json!(null))
        })
        .build()
        .unwrap();

    let item = first_item(
        &server,
        Method::new("users", "get"),
        json!({ "filler": "a".repeat(64) }),
    )
    .await;
    assert!(item.status.error().unwrap().is(code::VALIDATION_ERROR));
}

#[tokio::test]
async fn test_mounted_procedure_validates_input_and_output() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct GetUser {
        id: String,
    }

    let server = Server::builder()
        .mount(
            Procedure::builder("users.get")
                .input_typed::<GetUser>()
                .handler_typed(|input: GetUser, _ctx| async move {
                    Ok(json!({ "id": input.id }))
                })
                .build()
                .unwrap(),
        )
        .unwrap()
        .build()
        .unwrap();

    let ok = first_item(&server, Method::new("users", "get"), json!({ "id": "1" })).await;
    assert!(ok.is_success());
    assert_eq!(ok.payload, json!({ "id": "1" }));

    let bad = first_item(&server, Method::new("users", "get"), json!({ "id": 7 })).await;
    assert!(bad.status.error().unwrap().is(code::VALIDATION_ERROR));
}

#[tokio::test]
async fn test_mounted_procedure_output_validation() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct User {
        id: String,
    }

    let server = Server::builder()
        .mount(
            Procedure::builder("users.get")
                .output(validation::typed::<User>())
                .handler(|_, _| async move { Ok(json!({ "wrong": "shape" })) })
                .build()
                .unwrap(),
        )
        .unwrap()
        .build()
        .unwrap();

    let item = first_item(&server, Method::new("users", "get"), json!({})).await;
    assert!(item
        .status
        .error()
        .unwrap()
        .is(code::OUTPUT_VALIDATION_ERROR));
}

#[tokio::test]
async fn test_mount_rejects_single_segment_paths() {
    let result = Server::builder().mount(
        Procedure::builder("health")
            .handler(|_, _| async move { Ok(json!("ok")) })
            .build()
            .unwrap(),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn test_deep_procedure_paths_are_method_addressable() {
    let server = Server::builder()
        .mount(
            Procedure::builder("users.admin.get")
                .handler(|_, _| async move { Ok(json!("admin")) })
                .build()
                .unwrap(),
        )
        .unwrap()
        .build()
        .unwrap();

    // service = first segment, operation = rest.
    let item = first_item(&server, Method::new("users", "admin.get"), json!(null)).await;
    assert_eq!(item.payload, json!("admin"));
}

#[tokio::test]
async fn test_inter_procedure_call_through_registry_client() {
    let server = Server::builder()
        .mount(
            Procedure::builder("orders.list")
                .handler(|input, _| async move {
                    Ok(json!([{ "oid": "o1", "userId": input["userId"] }]))
                })
                .build()
                .unwrap(),
        )
        .unwrap()
        .mount(
            Procedure::builder("users.with_orders")
                .handler(|input, ctx| async move {
                    let orders = ctx
                        .client()
                        .call("orders.list", json!({ "userId": input["id"] }))
                        .await?;
                    Ok(json!({ "id": input["id"], "orders": orders }))
                })
                .build()
                .unwrap(),
        )
        .unwrap()
        .build()
        .unwrap();

    let item = first_item(
        &server,
        Method::new("users", "with_orders"),
        json!({ "id": "1" }),
    )
    .await;
    assert!(item.is_success());
    assert_eq!(item.payload["orders"][0]["oid"], "o1");
}

#[tokio::test]
async fn test_streaming_procedure_yields_items() {
    let server = Server::builder()
        .mount(
            Procedure::builder("feed.ticks")
                .streaming_handler(|_, _| async move {
                    let values = futures::stream::iter((1..=3).map(|i| Ok(json!(i))));
                    Ok(Box::pin(values) as crate::registry::ValueStream)
                })
                .build()
                .unwrap(),
        )
        .unwrap()
        .build()
        .unwrap();

    let envelope = Envelope::new(Method::new("feed", "ticks"), json!(null));
    let id = envelope.id.clone();
    let items = streaming::collect(server.dispatch(envelope).await).await;

    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|item| item.id == id && item.is_success()));
    assert_eq!(items[2].payload, json!(3));
}

#[test]
fn test_registry_events_fire_in_subscription_order() {
    let registry = ProcedureRegistry::new();
    let log: Arc<Mutex<Vec<String>>> = Arc::default();

    let first = log.clone();
    registry.subscribe(move |event| {
        if let RegistryEvent::Registered { path } = event {
            first.lock().unwrap().push(format!("first:{}", path));
        }
    });
    let second = log.clone();
    registry.subscribe(move |event| {
        if let RegistryEvent::Registered { path } = event {
            second.lock().unwrap().push(format!("second:{}", path));
        }
    });

    registry
        .register(
            Procedure::builder("users.get")
                .handler(|input, _| async move { Ok(input) })
                .build()
                .unwrap(),
            RegisterOptions::default(),
        )
        .unwrap();

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &["first:users.get", "second:users.get"]
    );
}

#[test]
fn test_panicking_listener_is_isolated() {
    let registry = ProcedureRegistry::new();
    let log: Arc<Mutex<Vec<String>>> = Arc::default();

    registry.subscribe(|_| panic!("listener bug"));
    let survivor = log.clone();
    registry.subscribe(move |event| {
        if let RegistryEvent::Unregistered { path } = event {
            survivor.lock().unwrap().push(path.key());
        }
    });

    let procedure = Procedure::builder("users.get")
        .handler(|input, _| async move { Ok(input) })
        .build()
        .unwrap();
    let path = procedure.path.clone();
    registry
        .register(procedure, RegisterOptions::default())
        .unwrap();
    assert!(registry.unregister(&path));

    // The panicking listener neither blocked the second listener nor the
    // registry operations.
    assert_eq!(log.lock().unwrap().as_slice(), &["users.get"]);
}

#[tokio::test]
async fn test_scoped_registry_server() {
    let registry = Arc::new(ProcedureRegistry::new());
    registry
        .register(
            Procedure::builder("users.get")
                .handler(|_, _| async move { Ok(json!("scoped")) })
                .build()
                .unwrap(),
            RegisterOptions::default(),
        )
        .unwrap();

    let server = Server::builder().registry(registry).build().unwrap();
    let item = first_item(&server, Method::new("users", "get"), json!(null)).await;
    assert_eq!(item.payload, json!("scoped"));

    // The global registry was not touched.
    assert!(!ProcedureRegistry::global()
        .has(&crate::registry::ProcedurePath::parse("users.get").unwrap()));
}

#[tokio::test]
async fn test_procedure_error_keeps_its_code() {
    let server = Server::builder()
        .mount(
            Procedure::builder("users.get")
                .handler(|_, _| async move {
                    Err(RpcError::not_found("no such user"))
                })
                .build()
                .unwrap(),
        )
        .unwrap()
        .build()
        .unwrap();

    let item = first_item(&server, Method::new("users", "get"), json!(null)).await;
    let error = item.status.error().unwrap();
    assert!(error.is(code::NOT_FOUND));
    assert_eq!(error.message, "no such user");
}
