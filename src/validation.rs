//! Input/output validation.
//!
//! Procedures and client schema registration consume the [`Validator`]
//! contract: `parse` (value or error) and `safe_parse` (structured outcome).
//! Any library exposing these semantics can be adapted; the built-in
//! adapters cover typed deserialization, the [`Validate`] trait and plain
//! closures.

use crate::error::{code, RpcError, RpcResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

/// A single field-level validation error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn required(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("'{}' is required", field);
        Self { field, message }
    }

    pub fn range(field: impl Into<String>, min: i64, max: i64) -> Self {
        let field = field.into();
        let message = format!("'{}' must be between {} and {}", field, min, max);
        Self { field, message }
    }
}

/// Aggregate outcome of validating a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<FieldError>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn from_errors(errors: Vec<FieldError>) -> Self {
        Self { errors }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Types that can validate their own field-level invariants.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

/// Structured failure returned by [`Validator::safe_parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub message: String,
    #[serde(default)]
    pub errors: Vec<FieldError>,
}

impl ValidationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn with_errors(mut self, errors: Vec<FieldError>) -> Self {
        self.errors = errors;
        self
    }

    /// Convert to an [`RpcError`] under the given stable code
    /// (`VALIDATION_ERROR` for inputs, `OUTPUT_VALIDATION_ERROR` for outputs).
    pub fn into_error(self, error_code: &str) -> RpcError {
        let details = serde_json::json!({ "errors": self.errors });
        RpcError::new(error_code, self.message, false).with_details(details)
    }
}

/// The validator contract.
pub trait Validator: Send + Sync {
    /// Validate and normalize; structured failure on mismatch.
    fn safe_parse(&self, value: &Value) -> Result<Value, ValidationFailure>;

    /// Validate and normalize; `VALIDATION_ERROR` on mismatch.
    fn parse(&self, value: &Value) -> RpcResult<Value> {
        self.safe_parse(value)
            .map_err(|failure| failure.into_error(code::VALIDATION_ERROR))
    }
}

/// Accepts any value unchanged.
pub struct AnyValidator;

impl Validator for AnyValidator {
    fn safe_parse(&self, value: &Value) -> Result<Value, ValidationFailure> {
        Ok(value.clone())
    }
}

/// Accept any value; the default schema for untyped procedures.
pub fn any() -> Arc<dyn Validator> {
    Arc::new(AnyValidator)
}

/// Shape validation through `T`'s deserialization, re-serialized to
/// normalize (unknown handling, defaults) the accepted value.
pub struct TypedValidator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for TypedValidator<T> {
    fn default() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Validator for TypedValidator<T>
where
    T: DeserializeOwned + Serialize + Send + Sync,
{
    fn safe_parse(&self, value: &Value) -> Result<Value, ValidationFailure> {
        let typed: T = serde_json::from_value(value.clone())
            .map_err(|e| ValidationFailure::new(e.to_string()))?;
        serde_json::to_value(typed).map_err(|e| ValidationFailure::new(e.to_string()))
    }
}

/// Shape-check against `T`.
pub fn typed<T>() -> Arc<dyn Validator>
where
    T: DeserializeOwned + Serialize + Send + Sync + 'static,
{
    Arc::new(TypedValidator::<T>::default())
}

/// Shape-check against `T`, then run its [`Validate`] rules.
pub struct ValidatedType<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for ValidatedType<T> {
    fn default() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Validator for ValidatedType<T>
where
    T: DeserializeOwned + Serialize + Validate + Send + Sync,
{
    fn safe_parse(&self, value: &Value) -> Result<Value, ValidationFailure> {
        let typed: T = serde_json::from_value(value.clone())
            .map_err(|e| ValidationFailure::new(e.to_string()))?;
        let result = typed.validate();
        if !result.is_valid() {
            return Err(
                ValidationFailure::new("validation failed").with_errors(result.errors)
            );
        }
        serde_json::to_value(typed).map_err(|e| ValidationFailure::new(e.to_string()))
    }
}

/// Shape-check against `T` and run its [`Validate`] rules.
pub fn validated<T>() -> Arc<dyn Validator>
where
    T: DeserializeOwned + Serialize + Validate + Send + Sync + 'static,
{
    Arc::new(ValidatedType::<T>::default())
}

struct FnValidator<F>(F);

impl<F> Validator for FnValidator<F>
where
    F: Fn(&Value) -> Result<Value, ValidationFailure> + Send + Sync,
{
    fn safe_parse(&self, value: &Value) -> Result<Value, ValidationFailure> {
        (self.0)(value)
    }
}

/// Build a validator from a closure.
pub fn validator_fn<F>(f: F) -> Arc<dyn Validator>
where
    F: Fn(&Value) -> Result<Value, ValidationFailure> + Send + Sync + 'static,
{
    Arc::new(FnValidator(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Person {
        name: String,
        age: i64,
    }

    impl Validate for Person {
        fn validate(&self) -> ValidationResult {
            let mut errors = Vec::new();
            if self.name.is_empty() {
                errors.push(FieldError::required("name"));
            }
            if !(0..=150).contains(&self.age) {
                errors.push(FieldError::range("age", 0, 150));
            }
            ValidationResult::from_errors(errors)
        }
    }

    #[test]
    fn test_typed_accepts_matching_shape() {
        let v = typed::<Person>();
        let parsed = v.safe_parse(&json!({ "name": "A", "age": 30 })).unwrap();
        assert_eq!(parsed["name"], "A");
    }

    #[test]
    fn test_typed_rejects_wrong_shape() {
        let v = typed::<Person>();
        assert!(v.safe_parse(&json!({ "name": "A" })).is_err());
        let err = v.parse(&json!(42)).unwrap_err();
        assert!(err.is(code::VALIDATION_ERROR));
    }

    #[test]
    fn test_validated_runs_field_rules() {
        let v = validated::<Person>();
        let failure = v
            .safe_parse(&json!({ "name": "", "age": 200 }))
            .unwrap_err();
        assert_eq!(failure.errors.len(), 2);
        assert_eq!(failure.errors[0].field, "name");
    }

    #[test]
    fn test_any_passes_everything() {
        let v = any();
        assert_eq!(v.safe_parse(&json!(null)).unwrap(), json!(null));
        assert_eq!(v.safe_parse(&json!([1, 2])).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_failure_into_output_error() {
        let err = ValidationFailure::new("bad shape").into_error(code::OUTPUT_VALIDATION_ERROR);
        assert!(err.is(code::OUTPUT_VALIDATION_ERROR));
        assert!(!err.retryable);
    }
}
