//! # Horizon RPC
//!
//! A bidirectional message-passing layer between two processes: a [`Caller`]
//! issues requests and correlates their responses, a [`Dispatcher`] routes
//! inbound requests to registered handlers.
//!
//! ## Overview
//!
//! - **Message**: `{method, params, correlationId, errorKind?}` envelope,
//!   JSON on the wire through a [`FrameCodec`].
//! - **Transport**: any ordered, reliable frame stream implementing
//!   [`Connection`]; TCP with length-prefixed frames and an in-memory pair
//!   are provided.
//! - **Caller**: non-blocking `call()` returning a [`PendingCall`] future,
//!   per-call timeouts, cancellation, and rejection of pending calls when the
//!   connection closes.
//! - **Dispatcher**: upsert handler registry, per-connection receive loops,
//!   `method_not_found` / `handler_error` responses instead of transport
//!   faults.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use horizon_rpc::{Caller, Dispatcher, RpcConfig, to_params};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), horizon_rpc::RpcError> {
//! let dispatcher = Arc::new(Dispatcher::new(RpcConfig::default()));
//! dispatcher.register_handler("echo", |request, _ctx| {
//!     Ok(request.reply(request.params().clone()))
//! });
//! let listener = dispatcher.listen("127.0.0.1:0".parse().unwrap()).await?;
//!
//! let caller = Caller::connect(&listener.local_addr().to_string(), RpcConfig::default()).await?;
//! let response = caller.call("echo", to_params(json!({"msg": "hi"})))?.await?;
//! assert_eq!(response.param("msg"), Some(&json!("hi")));
//! # Ok(())
//! # }
//! ```

pub mod caller;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod serialization;
pub mod stats;
pub mod transport;

pub use caller::{Caller, PendingCall};
pub use config::RpcConfig;
pub use dispatcher::{
    ConnectionContext, ConnectionId, ConnectionInfo, Dispatcher, HandlerFn, ListenerHandle,
};
pub use error::{HandlerError, Result, RpcError};
pub use message::{to_params, ErrorKind, Message, Params, ERROR_PARAM, REASON_PARAM};
pub use serialization::{FrameCodec, JsonCodec, SerializationError};
pub use stats::{CallerStats, DispatcherStats};
pub use transport::{memory, Connection, FrameReader, FrameWriter, TcpConnection};
