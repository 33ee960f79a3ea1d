//! Route trees and the route resolver.
//!
//! A route tree is a nested JSON value whose leaves land on registered
//! procedure paths. The resolver flattens it depth-first into
//! `(path, input, procedure)` entries, validating inputs on the way; the
//! response tree is rebuilt isomorphic to the request tree with a
//! [`ProcedureCallResult`] at every leaf.

use crate::error::{ErrorCode, RpcError};
use crate::registry::{Procedure, ProcedurePath, ProcedureRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Output configuration attached to a `{in, out}` leaf, preserved opaquely
/// for the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig(pub Value);

/// One flattened leaf of a route tree.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub path: ProcedurePath,
    pub input: Value,
    pub output: Option<OutputConfig>,
    pub procedure: Arc<Procedure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteErrorKind {
    NotFound,
    Validation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteError {
    pub kind: RouteErrorKind,
    pub path: String,
    pub message: String,
}

impl RouteError {
    pub fn to_rpc_error(&self) -> RpcError {
        match self.kind {
            RouteErrorKind::NotFound => RpcError::not_found(self.message.clone()),
            RouteErrorKind::Validation => RpcError::validation(self.message.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub validate_input: bool,
    pub continue_on_error: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            validate_input: true,
            continue_on_error: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub resolved: Vec<ResolvedRoute>,
    pub errors: Vec<RouteError>,
}

impl Resolution {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Flatten a route tree against a registry.
///
/// A subtree is a leaf when it is `{in, out?}`-shaped, when a procedure is
/// registered at its path, or when it is not a JSON object. `not_found`
/// errors never stop the walk; a validation error does unless
/// `continue_on_error` is set.
pub fn resolve(
    registry: &ProcedureRegistry,
    tree: &Value,
    options: &ResolveOptions,
) -> Resolution {
    let mut resolution = Resolution::default();
    let mut halted = false;
    walk(
        registry,
        tree,
        &mut Vec::new(),
        options,
        &mut resolution,
        &mut halted,
    );
    resolution
}

fn walk(
    registry: &ProcedureRegistry,
    value: &Value,
    prefix: &mut Vec<String>,
    options: &ResolveOptions,
    resolution: &mut Resolution,
    halted: &mut bool,
) {
    if *halted {
        return;
    }

    let key = prefix.join(".");
    if let Value::Object(fields) = value {
        let configured = fields.contains_key("in");
        if !configured && !registry.has_key(&key) {
            for (segment, child) in fields {
                prefix.push(segment.clone());
                walk(registry, child, prefix, options, resolution, halted);
                prefix.pop();
                if *halted {
                    return;
                }
            }
            return;
        }
        let (input, output) = if configured {
            (
                fields.get("in").cloned().unwrap_or(Value::Null),
                fields.get("out").cloned().map(OutputConfig),
            )
        } else {
            (value.clone(), None)
        };
        resolve_leaf(registry, &key, input, output, options, resolution, halted);
    } else {
        resolve_leaf(registry, &key, value.clone(), None, options, resolution, halted);
    }
}

fn resolve_leaf(
    registry: &ProcedureRegistry,
    key: &str,
    input: Value,
    output: Option<OutputConfig>,
    options: &ResolveOptions,
    resolution: &mut Resolution,
    halted: &mut bool,
) {
    let path = match ProcedurePath::parse(key) {
        Ok(path) => path,
        Err(err) => {
            resolution.errors.push(RouteError {
                kind: RouteErrorKind::NotFound,
                path: key.to_string(),
                message: err.message,
            });
            return;
        }
    };

    let Some(procedure) = registry.get(&path) else {
        // Cheap to report; keep collecting siblings.
        resolution.errors.push(RouteError {
            kind: RouteErrorKind::NotFound,
            path: key.to_string(),
            message: format!("no procedure at '{}'", key),
        });
        return;
    };

    let input = if options.validate_input {
        match procedure.input.safe_parse(&input) {
            Ok(parsed) => parsed,
            Err(failure) => {
                resolution.errors.push(RouteError {
                    kind: RouteErrorKind::Validation,
                    path: key.to_string(),
                    message: failure.message,
                });
                if !options.continue_on_error {
                    *halted = true;
                }
                return;
            }
        }
    } else {
        input
    };

    resolution.resolved.push(ResolvedRoute {
        path,
        input,
        output,
        procedure,
    });
}

/// Settled outcome of one routed procedure call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcedureCallResult {
    Success {
        success: bool,
        data: Value,
    },
    Failure {
        success: bool,
        code: ErrorCode,
        message: String,
        retryable: bool,
        path: String,
    },
}

impl ProcedureCallResult {
    pub fn ok(data: Value) -> Self {
        Self::Success { success: true, data }
    }

    pub fn fail(path: &str, error: &RpcError) -> Self {
        Self::Failure {
            success: false,
            code: error.code.clone(),
            message: error.message.clone(),
            retryable: error.retryable,
            path: path.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Rebuild a response tree isomorphic to the request tree: every result is
/// assigned at the leaf addressed by its path.
pub fn build_response_tree<'a>(
    results: impl IntoIterator<Item = (&'a ProcedurePath, &'a ProcedureCallResult)>,
) -> Value {
    fn insert_at(node: &mut Map<String, Value>, segments: &[String], value: Value) {
        let Some((head, rest)) = segments.split_first() else {
            return;
        };
        if rest.is_empty() {
            node.insert(head.clone(), value);
            return;
        }
        let child = node
            .entry(head.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        if let Value::Object(map) = child {
            insert_at(map, rest, value);
        }
    }

    let mut root = Map::new();
    for (path, result) in results {
        let rendered = serde_json::to_value(result).unwrap_or(Value::Null);
        insert_at(&mut root, path.segments(), rendered);
    }
    Value::Object(root)
}
