//! Message envelopes and the status model.
//!
//! Envelopes and response items are immutable after creation: middleware
//! that needs different metadata produces a shallow copy before calling the
//! next runner.

use crate::cancel::CancellationSignal;
use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Ordered-irrelevant string-keyed metadata carried alongside payloads.
pub type Metadata = serde_json::Map<String, Value>;

/// Identifies an RPC endpoint. Equality is component-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Method {
    pub service: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<String>,
}

impl Method {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Dotted key form, used for schema maps and cache keys.
    pub fn key(&self) -> String {
        match &self.version {
            Some(v) => format!("{}.{}@{}", self.service, self.operation, v),
            None => format!("{}.{}", self.service, self.operation),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Outcome of a response item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Status {
    Success { code: u16 },
    Error(RpcError),
}

impl Status {
    pub fn ok() -> Self {
        Self::Success { code: 200 }
    }

    pub fn success(code: u16) -> Self {
        Self::Success { code }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn error(&self) -> Option<&RpcError> {
        match self {
            Self::Error(e) => Some(e),
            Self::Success { .. } => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error().map(|e| e.retryable).unwrap_or(false)
    }
}

/// Unified request carrier. The `id` is unique per call and echoed on every
/// response item; multiplexed transports correlate on it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: String,
    pub method: Method,
    pub payload: Value,
    pub metadata: Metadata,
    pub cancel: Option<Arc<CancellationSignal>>,
}

impl Envelope {
    pub fn new(method: Method, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            method,
            payload,
            metadata: Metadata::new(),
            cancel: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<CancellationSignal>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false)
    }

    /// Shallow copy with different metadata, for middleware that rewrites it.
    pub fn clone_with_metadata(&self, metadata: Metadata) -> Self {
        Self {
            metadata,
            ..self.clone()
        }
    }

    /// Shallow copy with a different payload.
    pub fn clone_with_payload(&self, payload: Value) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Shallow copy with a different cancellation signal.
    pub fn clone_with_cancel(&self, cancel: Option<Arc<CancellationSignal>>) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }
}

/// One element of a response sequence (unary responses have length 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseItem {
    pub id: String,
    pub status: Status,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ResponseItem {
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            status: Status::ok(),
            payload,
            metadata: Metadata::new(),
        }
    }

    pub fn success_with_code(id: impl Into<String>, code: u16, payload: Value) -> Self {
        Self {
            id: id.into(),
            status: Status::success(code),
            payload,
            metadata: Metadata::new(),
        }
    }

    pub fn error(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: id.into(),
            status: Status::Error(error),
            payload: Value::Null,
            metadata: Metadata::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }

    /// Surface the payload, or the error with this item's id attached.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.status {
            Status::Success { .. } => Ok(self.payload),
            Status::Error(e) => Err(e.with_response_id(&self.id)),
        }
    }
}

/// Recursive merge for context values.
///
/// Plain JSON objects merge key-wise; arrays, primitives and mismatched
/// shapes are replaced wholesale. `null` on the override side means "unset"
/// and is skipped.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match overlay {
        Value::Null => {}
        Value::Object(over) => {
            if let Value::Object(b) = base {
                for (key, value) in over {
                    if value.is_null() {
                        continue;
                    }
                    match b.get_mut(key) {
                        Some(existing) => deep_merge(existing, value),
                        None => {
                            b.insert(key.clone(), value.clone());
                        }
                    }
                }
            } else {
                *base = overlay.clone();
            }
        }
        other => *base = other.clone(),
    }
}

/// [`deep_merge`] over metadata maps.
pub fn merge_metadata(base: &mut Metadata, overlay: &Metadata) {
    for (key, value) in overlay {
        if value.is_null() {
            continue;
        }
        match base.get_mut(key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
