//! Error types for the RPC layer.
//!
//! Two families live here. [`RpcError`] covers everything that can go wrong
//! locally or on the transport: connecting, writing, a call timing out or the
//! connection closing while a call is pending. [`HandlerError`] is what a
//! registered handler returns; the dispatcher turns it into a `handler_error`
//! response instead of failing the connection.

use crate::serialization::SerializationError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while connecting, calling or serving.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The peer actively refused the connection.
    #[error("connection to {address} refused: {source}")]
    ConnectionRefused {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Establishing the connection took longer than the connect timeout.
    #[error("connection to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    /// The connection closed before the call could complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response arrived within the configured call timeout.
    #[error("call {correlation_id} ({method}) timed out after {timeout:?}")]
    CallTimeout {
        method: String,
        correlation_id: String,
        timeout: Duration,
    },

    /// The call was cancelled before a response arrived.
    #[error("call {0} cancelled")]
    Cancelled(String),

    /// Binding a listening socket failed.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// A message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Failure reported by a request handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The request params could not be interpreted.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The handler ran but could not produce a result.
    #[error("{message}")]
    Failed {
        reason: Option<String>,
        message: String,
    },
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            reason: None,
            message: message.into(),
        }
    }

    /// A failure tagged with a machine-readable reason that is forwarded to
    /// the caller in the `reason` param.
    pub fn with_reason(reason: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Failed {
            reason: Some(reason.into()),
            message: message.into(),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            HandlerError::InvalidParams(_) => Some("invalid_params"),
            HandlerError::Failed { reason, .. } => reason.as_deref(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        HandlerError::InvalidParams(error.to_string())
    }
}
