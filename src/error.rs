//! Error types for fabric operations

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable string identifiers for system errors.
///
/// The set is open: transports pass native numeric codes through unchanged.
pub mod code {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const OUTPUT_VALIDATION_ERROR: &str = "OUTPUT_VALIDATION_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const ABORTED: &str = "ABORTED";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const RATE_LIMIT: &str = "RATE_LIMIT";
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
    pub const ALREADY_REGISTERED: &str = "ALREADY_REGISTERED";
    pub const DISCONNECTED: &str = "DISCONNECTED";
}

/// Error code: a stable string identifier, or a numeric code passed through
/// from a transport (e.g. an HTTP status).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Numeric(u16),
    Symbol(String),
}

impl ErrorCode {
    pub fn symbol(s: impl Into<String>) -> Self {
        Self::Symbol(s.into())
    }

    /// Returns the symbolic form, if any.
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(s) => Some(s.as_str()),
            Self::Numeric(_) => None,
        }
    }

    pub fn as_numeric(&self) -> Option<u16> {
        match self {
            Self::Numeric(n) => Some(*n),
            Self::Symbol(_) => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{}", n),
            Self::Symbol(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        Self::Symbol(s.to_string())
    }
}

impl From<u16> for ErrorCode {
    fn from(n: u16) -> Self {
        Self::Numeric(n)
    }
}

/// RPC error with code, message and a protocol-independent retryable flag.
///
/// Travels inside [`crate::message::Status`], so it is serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
            details: None,
        }
    }

    /// Add details to the error
    pub fn with_details(mut self, details: impl Serialize) -> Self {
        self.details = serde_json::to_value(details).ok();
        self
    }

    /// Record the id of the response item this error was surfaced from.
    pub fn with_response_id(mut self, id: &str) -> Self {
        let mut details = match self.details.take() {
            Some(serde_json::Value::Object(map)) => map,
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("details".to_string(), other);
                map
            }
            None => serde_json::Map::new(),
        };
        details.insert("responseId".to_string(), serde_json::Value::String(id.to_string()));
        self.details = Some(serde_json::Value::Object(details));
        self
    }

    /// Check against a stable code identifier.
    pub fn is(&self, code: &str) -> bool {
        self.code.as_symbol() == Some(code)
    }

    // Common error constructors

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(code::NOT_FOUND, message, false)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(code::VALIDATION_ERROR, message, false)
    }

    pub fn output_validation(message: impl Into<String>) -> Self {
        Self::new(code::OUTPUT_VALIDATION_ERROR, message, false)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(code::TIMEOUT, message, true)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(code::ABORTED, message, false)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(code::CIRCUIT_OPEN, message, true)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(code::RATE_LIMIT, message, true)
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(code::HANDLER_ERROR, message, false)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(code::EXECUTION_ERROR, message, false)
    }

    pub fn already_registered(path: &str) -> Self {
        Self::new(
            code::ALREADY_REGISTERED,
            format!("procedure '{}' is already registered", path),
            false,
        )
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(code::DISCONNECTED, message, true)
    }

    /// Map a numeric transport status onto the fabric's retryable convention:
    /// 408/429 and 5xx are retryable, other client errors are not.
    pub fn transport(status: u16, message: impl Into<String>) -> Self {
        let retryable = matches!(status, 408 | 429) || (500..=599).contains(&status);
        Self::new(status, message, retryable)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::execution(format!("JSON error: {}", err))
    }
}

/// Result type alias for fabric operations
pub type RpcResult<T> = Result<T, RpcError>;
