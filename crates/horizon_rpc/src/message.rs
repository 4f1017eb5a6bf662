//! The wire-level message envelope.
//!
//! Every frame exchanged between a [`Caller`](crate::Caller) and a
//! [`Dispatcher`](crate::Dispatcher) carries exactly one [`Message`]:
//!
//! ```json
//! {
//!   "method": "echo",
//!   "params": { "msg": "hi" },
//!   "correlationId": "7",
//!   "errorKind": "handler_error"
//! }
//! ```
//!
//! `errorKind` is only present on error responses. Messages are immutable
//! once built; the builder-style methods consume `self` and return a new value.

use crate::serialization::SerializationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Named parameters of a message.
pub type Params = Map<String, Value>;

/// Param key carrying the human-readable description on error responses.
pub const ERROR_PARAM: &str = "error";

/// Param key carrying an optional machine-readable failure reason.
pub const REASON_PARAM: &str = "reason";

/// Protocol-level failure categories reported on responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No handler is registered for the requested method.
    MethodNotFound,
    /// The handler returned an error or panicked.
    HandlerError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MethodNotFound => "method_not_found",
            ErrorKind::HandlerError => "handler_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request or response travelling over an RPC connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    method: String,
    #[serde(default)]
    params: Params,
    correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
}

impl Message {
    /// Creates a request message.
    ///
    /// The method must be non-empty; this is checked when the message is
    /// encoded rather than here.
    pub fn request(
        method: impl Into<String>,
        params: Params,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            params,
            correlation_id: correlation_id.into(),
            error_kind: None,
        }
    }

    /// Builds a successful response to this request.
    ///
    /// The response reuses the request's method and correlation id.
    pub fn reply(&self, params: Params) -> Self {
        Self {
            method: self.method.clone(),
            params,
            correlation_id: self.correlation_id.clone(),
            error_kind: None,
        }
    }

    /// Builds an error response to this request.
    pub fn error_reply(&self, kind: ErrorKind, detail: impl Into<String>) -> Self {
        let mut params = Params::new();
        params.insert(ERROR_PARAM.to_string(), Value::String(detail.into()));
        Self {
            method: self.method.clone(),
            params,
            correlation_id: self.correlation_id.clone(),
            error_kind: Some(kind),
        }
    }

    /// Returns a copy of this message tagged with another correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Returns a copy of this message with one extra parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn is_error(&self) -> bool {
        self.error_kind.is_some()
    }

    /// Human-readable error description, present on error responses.
    pub fn error_detail(&self) -> Option<&str> {
        self.param(ERROR_PARAM).and_then(Value::as_str)
    }

    /// Machine-readable error reason, if the handler supplied one.
    pub fn error_reason(&self) -> Option<&str> {
        self.param(REASON_PARAM).and_then(Value::as_str)
    }

    pub fn into_params(self) -> Params {
        self.params
    }

    /// Checks the structural invariants of the envelope.
    pub fn validate(&self) -> Result<(), SerializationError> {
        if self.method.is_empty() {
            return Err(SerializationError::InvalidFormat(
                "message method must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Converts a JSON value into message params.
///
/// Objects are used as-is; any other value is wrapped under a `"value"` key.
pub fn to_params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        other => {
            let mut params = Params::new();
            params.insert("value".to_string(), other);
            params
        }
    }
}
