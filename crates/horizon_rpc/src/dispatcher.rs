//! Server side of the RPC layer.
//!
//! A [`Dispatcher`] owns a registry of `method -> handler` functions and
//! serves any number of connections. Each connection gets its own receive
//! loop; frames on one connection are handled in the order they arrive, and
//! every response carries the correlation id of the request that produced it.
//!
//! Handler failures never reach the transport: an `Err` or a panic becomes a
//! `handler_error` response, and an unknown method becomes a
//! `method_not_found` response. The connection stays usable either way.

use crate::config::RpcConfig;
use crate::error::{HandlerError, Result, RpcError};
use crate::message::{ErrorKind, Message, REASON_PARAM};
use crate::serialization::{ensure_frame_fits, FrameCodec, JsonCodec, SerializationError};
use crate::stats::{bump, DispatcherCounters, DispatcherStats};
use crate::transport::{spawn_writer, Connection, FrameReader, TcpConnection};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Unique identifier of a connection served by a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the connection a request arrived on, handed to every handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub remote_addr: String,
}

impl ConnectionContext {
    /// Context for requests dispatched directly, without a transport.
    pub fn detached() -> Self {
        Self {
            connection_id: ConnectionId::new(),
            remote_addr: "detached".to_string(),
        }
    }
}

/// Bookkeeping for a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote_addr: String,
    pub connected_at: SystemTime,
}

/// A request handler.
///
/// Returns the response message; the dispatcher overwrites its correlation
/// id with the request's, so handlers usually just call [`Message::reply`].
pub type HandlerFn =
    dyn Fn(&Message, &ConnectionContext) -> std::result::Result<Message, HandlerError> + Send + Sync;

type DisconnectHook = dyn Fn(&ConnectionContext) + Send + Sync;

/// Routes inbound requests to registered handlers.
pub struct Dispatcher {
    handlers: DashMap<String, Arc<HandlerFn>>,
    connections: DashMap<ConnectionId, ConnectionInfo>,
    disconnect_hooks: RwLock<Vec<Arc<DisconnectHook>>>,
    codec: Arc<dyn FrameCodec>,
    config: RpcConfig,
    shutdown_sender: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    counters: DispatcherCounters,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.len())
            .field("connections", &self.connections.len())
            .field("codec", &self.codec.format_name())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(RpcConfig::default())
    }
}

impl Dispatcher {
    pub fn new(config: RpcConfig) -> Self {
        Self::with_codec(config, Arc::new(JsonCodec::new()))
    }

    pub fn with_codec(config: RpcConfig, codec: Arc<dyn FrameCodec>) -> Self {
        let (shutdown_sender, _) = broadcast::channel(1);
        Self {
            handlers: DashMap::new(),
            connections: DashMap::new(),
            disconnect_hooks: RwLock::new(Vec::new()),
            codec,
            config,
            shutdown_sender,
            shutting_down: AtomicBool::new(false),
            counters: DispatcherCounters::default(),
        }
    }

    /// Registers `handler` for `method`, replacing any previous handler.
    pub fn register_handler<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(&Message, &ConnectionContext) -> std::result::Result<Message, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let method = method.into();
        if self.handlers.insert(method.clone(), Arc::new(handler)).is_some() {
            debug!("🔁 Replaced handler for '{}'", method);
        } else {
            debug!("📝 Registered handler for '{}'", method);
        }
    }

    /// Removes the handler for `method`. Returns whether one was registered.
    pub fn unregister_handler(&self, method: &str) -> bool {
        self.handlers.remove(method).is_some()
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn registered_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        methods.sort();
        methods
    }

    /// Adds a hook run once for every connection after it closes.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(&ConnectionContext) + Send + Sync + 'static,
    {
        self.disconnect_hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(hook));
    }

    /// Produces the response to a single request.
    ///
    /// Always returns exactly one message carrying the request's correlation
    /// id: the handler's result, or a `method_not_found` / `handler_error`
    /// response.
    pub fn dispatch(&self, request: &Message, ctx: &ConnectionContext) -> Message {
        bump(&self.counters.requests_handled);

        // Clone out of the map so no shard lock is held while user code runs.
        let handler = match self.handlers.get(request.method()) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                bump(&self.counters.method_not_found);
                debug!(
                    "No handler for '{}' (call {} from {})",
                    request.method(),
                    request.correlation_id(),
                    ctx.remote_addr
                );
                return request.error_reply(
                    ErrorKind::MethodNotFound,
                    format!("no handler registered for method '{}'", request.method()),
                );
            }
        };

        match catch_unwind(AssertUnwindSafe(|| handler(request, ctx))) {
            Ok(Ok(response)) => response.with_correlation_id(request.correlation_id()),
            Ok(Err(e)) => {
                bump(&self.counters.handler_errors);
                warn!(
                    "Handler for '{}' failed on call {} from {}: {}",
                    request.method(),
                    request.correlation_id(),
                    ctx.remote_addr,
                    e
                );
                let response = request.error_reply(ErrorKind::HandlerError, e.to_string());
                match e.reason() {
                    Some(reason) => response.with_param(REASON_PARAM, reason),
                    None => response,
                }
            }
            Err(panic) => {
                bump(&self.counters.handler_errors);
                let detail = panic_message(panic.as_ref());
                error!(
                    "💥 Handler for '{}' panicked on call {} from {}: {}",
                    request.method(),
                    request.correlation_id(),
                    ctx.remote_addr,
                    detail
                );
                request
                    .error_reply(ErrorKind::HandlerError, format!("handler panicked: {detail}"))
                    .with_param(REASON_PARAM, "panic")
            }
        }
    }

    /// Decodes, dispatches and encodes one frame. Malformed frames yield `None`.
    fn handle_frame(&self, frame: &[u8], ctx: &ConnectionContext) -> Option<Vec<u8>> {
        let request = match self.codec.decode(frame) {
            Ok(request) => request,
            Err(e) => {
                bump(&self.counters.malformed_frames);
                warn!("Dropping malformed frame from {}: {}", ctx.remote_addr, e);
                return None;
            }
        };

        let response = self.dispatch(&request, ctx);
        match self.encode_frame(&response) {
            Ok(frame) => Some(frame),
            Err(e) => {
                bump(&self.counters.handler_errors);
                warn!(
                    "Response to '{}' from {} could not be encoded: {}",
                    request.method(),
                    ctx.remote_addr,
                    e
                );
                let reason = match e {
                    SerializationError::FrameTooLarge { .. } => "frame_too_large",
                    _ => "encoding_failed",
                };
                let fallback = request
                    .error_reply(
                        ErrorKind::HandlerError,
                        format!("response could not be encoded: {e}"),
                    )
                    .with_param(REASON_PARAM, reason);
                self.encode_frame(&fallback).ok()
            }
        }
    }

    /// Encodes a response, refusing frames the transport would reject.
    fn encode_frame(&self, message: &Message) -> std::result::Result<Vec<u8>, SerializationError> {
        let frame = self.codec.encode(message)?;
        ensure_frame_fits(&frame, self.config.max_frame_size)?;
        Ok(frame)
    }

    /// Serves requests arriving on `connection` until it closes or the
    /// dispatcher shuts down.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn serve_connection(self: &Arc<Self>, connection: Box<dyn Connection>) -> ConnectionId {
        let ctx = ConnectionContext {
            connection_id: ConnectionId::new(),
            remote_addr: connection.remote_addr(),
        };
        let connection_id = ctx.connection_id;

        self.connections.insert(
            connection_id,
            ConnectionInfo {
                remote_addr: ctx.remote_addr.clone(),
                connected_at: SystemTime::now(),
            },
        );
        info!("🔗 Connection {} opened from {}", connection_id, ctx.remote_addr);

        // Subscribe before checking the flag so a concurrent shutdown is not missed.
        let shutdown = self.shutdown_sender.subscribe();
        let already_down = self.shutting_down.load(Ordering::SeqCst);

        let (reader, writer) = connection.split();
        let (outbound, writer_task) = spawn_writer(writer, ctx.remote_addr.clone());
        let this = Arc::clone(self);

        tokio::spawn(async move {
            if !already_down {
                this.connection_loop(&ctx, reader, &outbound, shutdown).await;
            }
            drop(outbound);
            this.connection_closed(&ctx);
            if let Err(e) = writer_task.await {
                debug!("Writer task for {} ended abnormally: {}", ctx.remote_addr, e);
            }
        });

        connection_id
    }

    async fn connection_loop(
        &self,
        ctx: &ConnectionContext,
        mut reader: Box<dyn FrameReader>,
        outbound: &mpsc::UnboundedSender<Vec<u8>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                frame = reader.read_frame() => match frame {
                    Ok(Some(frame)) => {
                        if let Some(response) = self.handle_frame(&frame, ctx) {
                            if outbound.send(response).is_err() {
                                debug!("Writer for {} is gone", ctx.remote_addr);
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("Peer {} closed the connection", ctx.remote_addr);
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        bump(&self.counters.malformed_frames);
                        warn!("Dropping frame from {}: {}", ctx.remote_addr, e);
                    }
                    Err(e) => {
                        warn!("Read from {} failed: {}", ctx.remote_addr, e);
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    debug!("Closing connection {} for shutdown", ctx.connection_id);
                    break;
                }
            }
        }
    }

    fn connection_closed(&self, ctx: &ConnectionContext) {
        if self.connections.remove(&ctx.connection_id).is_none() {
            return;
        }

        let hooks: Vec<Arc<DisconnectHook>> = self
            .disconnect_hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for hook in hooks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook(ctx))) {
                error!(
                    "Disconnect hook panicked for connection {}: {}",
                    ctx.connection_id,
                    panic_message(panic.as_ref())
                );
            }
        }

        info!("🔌 Connection {} from {} closed", ctx.connection_id, ctx.remote_addr);
    }

    /// Binds a TCP listener on `address` and serves every accepted connection.
    ///
    /// Returns once the socket is bound; accepting happens in the background
    /// until [`shutdown`](Self::shutdown) or [`ListenerHandle::stop`].
    pub async fn listen(self: &Arc<Self>, address: SocketAddr) -> Result<ListenerHandle> {
        let bind_error = |source: std::io::Error| RpcError::Bind {
            address: address.to_string(),
            source,
        };

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_error)?;
        if let Err(e) = socket.set_reuse_address(true) {
            debug!("Failed to set SO_REUSEADDR on {}: {}", address, e);
        }
        socket.bind(&address.into()).map_err(bind_error)?;
        socket.listen(1024).map_err(bind_error)?;

        let std_listener: StdTcpListener = socket.into();
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!("✅ Dispatcher listening on {}", local_addr);

        // Subscribe before checking the flag so a concurrent shutdown is not missed.
        let mut shutdown = self.shutdown_sender.subscribe();
        let already_down = self.shutting_down.load(Ordering::SeqCst);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            if already_down {
                debug!("Dispatcher already shut down, not accepting on {}", local_addr);
                return;
            }
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                            }
                            let connection =
                                TcpConnection::new(stream, peer, this.config.max_frame_size);
                            this.serve_connection(Box::new(connection));
                        }
                        Err(e) => {
                            error!("Failed to accept connection on {}: {}", local_addr, e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    _ = shutdown.recv() => break,
                }
            }
            info!("Listener on {} stopped", local_addr);
        });

        Ok(ListenerHandle { local_addr, task })
    }

    /// Stops every accept loop and closes every served connection.
    ///
    /// Disconnect hooks still run for the closed connections.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "🛑 Dispatcher shutting down ({} open connection(s))",
            self.connections.len()
        );
        // No receivers simply means nothing is running.
        let _ = self.shutdown_sender.send(());
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_info(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&connection_id).map(|e| e.value().clone())
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot(self.connections.len())
    }
}

/// A running TCP accept loop.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// The address actually bound, useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections. Connections already accepted keep
    /// being served.
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
