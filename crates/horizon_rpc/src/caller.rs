//! Client side of the RPC layer.
//!
//! A [`Caller`] owns one connection. Every [`call`](Caller::call) gets a fresh
//! correlation id and an entry in the pending-call table; the receive loop
//! removes that entry when the matching response arrives and resolves the
//! returned [`PendingCall`]. Responses may come back in any order.
//!
//! A pending entry is removed exactly once, by whichever happens first:
//!
//! * its response arrives,
//! * its timeout expires (`CallTimeout`),
//! * it is cancelled (`Cancelled`),
//! * the connection closes (`ConnectionClosed`).

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::message::{Message, Params};
use crate::serialization::{ensure_frame_fits, FrameCodec, JsonCodec};
use crate::stats::{bump, CallerCounters, CallerStats};
use crate::transport::{spawn_writer, Connection, FrameReader, TcpConnection};
use dashmap::DashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

type CallOutcome = Result<Message>;

struct PendingEntry {
    method: String,
    responder: oneshot::Sender<CallOutcome>,
    timer: Option<AbortHandle>,
}

impl PendingEntry {
    fn resolve(self, outcome: CallOutcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The receiver is gone when the caller chose not to await the call.
        let _ = self.responder.send(outcome);
    }
}

/// State shared between the caller handle, its receive loop and call timers.
struct CallerShared {
    pending: DashMap<String, PendingEntry>,
    next_correlation_id: AtomicU64,
    /// Queue feeding the writer task; `None` once the connection is closed.
    outbound: RwLock<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    codec: Arc<dyn FrameCodec>,
    config: RpcConfig,
    remote_addr: String,
    stats: CallerCounters,
    /// Runtime the caller was created on; timers are spawned here so `call`
    /// also works from threads outside the runtime.
    runtime: Handle,
}

impl CallerShared {
    fn handle_inbound_frame(&self, frame: &[u8]) {
        let message = match self.codec.decode(frame) {
            Ok(message) => message,
            Err(e) => {
                bump(&self.stats.malformed_frames);
                warn!("Dropping malformed frame from {}: {}", self.remote_addr, e);
                return;
            }
        };

        match self.pending.remove(message.correlation_id()) {
            Some((correlation_id, entry)) => {
                bump(&self.stats.responses_matched);
                debug!(
                    "Resolved call {} ({}) from {}",
                    correlation_id, entry.method, self.remote_addr
                );
                entry.resolve(Ok(message));
            }
            None => {
                bump(&self.stats.unknown_responses);
                warn!(
                    "Discarding response '{}' with unknown correlation id {} from {}",
                    message.method(),
                    message.correlation_id(),
                    self.remote_addr
                );
            }
        }
    }

    fn expire(&self, correlation_id: &str, timeout: Duration) {
        if let Some((correlation_id, entry)) = self.pending.remove(correlation_id) {
            bump(&self.stats.timeouts);
            warn!(
                "⏱️ Call {} ({}) to {} timed out after {:?}",
                correlation_id, entry.method, self.remote_addr, timeout
            );
            let method = entry.method.clone();
            entry.resolve(Err(RpcError::CallTimeout {
                method,
                correlation_id,
                timeout,
            }));
        }
    }

    /// Close the outbound queue and reject every pending call.
    ///
    /// Taking the queue under the write lock first guarantees no call can
    /// insert a new entry after the drain below.
    fn fail_all_pending(&self) {
        let was_open = self
            .outbound
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some();

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0usize;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.resolve(Err(RpcError::ConnectionClosed));
                rejected += 1;
            }
        }

        if was_open {
            info!(
                "🔌 Connection to {} closed, rejected {} pending call(s)",
                self.remote_addr, rejected
            );
        }
    }
}

struct CallerTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Issues calls over a single connection and correlates their responses.
pub struct Caller {
    shared: Arc<CallerShared>,
    tasks: Mutex<Option<CallerTasks>>,
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("remote_addr", &self.shared.remote_addr)
            .field("pending_calls", &self.shared.pending.len())
            .field("codec", &self.shared.codec.format_name())
            .finish()
    }
}

impl Caller {
    /// Connects to `address` over TCP.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused` when nothing listens at `address`, `ConnectTimeout`
    /// when the handshake exceeds `config.connect_timeout_ms`.
    pub async fn connect(address: &str, config: RpcConfig) -> Result<Self> {
        let connection = TcpConnection::connect(address, &config).await?;
        info!("🔗 Connected to {}", address);
        Ok(Self::with_connection(Box::new(connection), config))
    }

    /// Creates a caller over an already established connection.
    ///
    /// Must be called from within a Tokio runtime: the receive loop and the
    /// writer run as background tasks.
    pub fn with_connection(connection: Box<dyn Connection>, config: RpcConfig) -> Self {
        Self::with_codec(connection, config, Arc::new(JsonCodec::new()))
    }

    /// Like [`with_connection`](Self::with_connection) with a custom frame codec.
    pub fn with_codec(
        connection: Box<dyn Connection>,
        config: RpcConfig,
        codec: Arc<dyn FrameCodec>,
    ) -> Self {
        let remote_addr = connection.remote_addr();
        let (reader, writer) = connection.split();
        let (outbound, writer_task) = spawn_writer(writer, remote_addr.clone());

        let shared = Arc::new(CallerShared {
            pending: DashMap::new(),
            next_correlation_id: AtomicU64::new(1),
            outbound: RwLock::new(Some(outbound)),
            codec,
            config,
            remote_addr,
            stats: CallerCounters::default(),
            runtime: Handle::current(),
        });

        let reader_task = tokio::spawn(receive_loop(Arc::clone(&shared), reader));

        Self {
            shared,
            tasks: Mutex::new(Some(CallerTasks {
                reader: reader_task,
                writer: writer_task,
            })),
        }
    }

    /// Sends a request and returns a handle to its eventual response.
    ///
    /// This never blocks: the frame is queued for the writer task. The
    /// returned [`PendingCall`] can be awaited or dropped; dropping it does
    /// not cancel the call. `call` may be used from any thread, including
    /// ones outside the Tokio runtime.
    ///
    /// Protocol-level failures (`method_not_found`, `handler_error`) resolve
    /// successfully with a response whose [`Message::error_kind`] is set.
    ///
    /// # Errors
    ///
    /// `Serialization` if the request cannot be encoded (e.g. empty method) or
    /// its frame exceeds `max_frame_size`, `ConnectionClosed` if the
    /// connection is already closed. Nothing is sent and no call stays
    /// pending when an error is returned.
    pub fn call(&self, method: impl Into<String>, params: Params) -> Result<PendingCall> {
        let method = method.into();
        let correlation_id = self
            .shared
            .next_correlation_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let request = Message::request(method.clone(), params, correlation_id.clone());
        let frame = self.shared.codec.encode(&request)?;
        ensure_frame_fits(&frame, self.shared.config.max_frame_size)?;
        let (responder, receiver) = oneshot::channel();

        {
            let outbound = self
                .shared
                .outbound
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let sender = outbound.as_ref().ok_or(RpcError::ConnectionClosed)?;

            // Insert and arm before sending so a fast response always finds
            // its entry and every queued call has its timer.
            self.shared.pending.insert(
                correlation_id.clone(),
                PendingEntry {
                    method: method.clone(),
                    responder,
                    timer: None,
                },
            );
            if let Some(timeout) = self.shared.config.call_timeout() {
                self.arm_timer(&correlation_id, timeout);
            }
            if sender.send(frame).is_err() {
                if let Some((_, entry)) = self.shared.pending.remove(&correlation_id) {
                    if let Some(timer) = entry.timer {
                        timer.abort();
                    }
                }
                return Err(RpcError::ConnectionClosed);
            }
        }

        bump(&self.shared.stats.calls_issued);
        debug!(
            "📤 Call {} ({}) sent to {}",
            correlation_id, method, self.shared.remote_addr
        );

        Ok(PendingCall {
            correlation_id,
            method,
            receiver,
        })
    }

    fn arm_timer(&self, correlation_id: &str, timeout: Duration) {
        let shared: Weak<CallerShared> = Arc::downgrade(&self.shared);
        let id = correlation_id.to_string();
        let timer = self.shared.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire(&id, timeout);
            }
        });

        match self.shared.pending.get_mut(correlation_id) {
            Some(mut entry) => entry.timer = Some(timer.abort_handle()),
            // Already resolved while the timer was being armed.
            None => timer.abort(),
        }
    }

    /// Rejects a pending call with `Cancelled`.
    ///
    /// Returns `false` if no call with this correlation id is pending.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        match self.shared.pending.remove(correlation_id) {
            Some((correlation_id, entry)) => {
                bump(&self.shared.stats.cancelled);
                debug!("Cancelled call {} ({})", correlation_id, entry.method);
                entry.resolve(Err(RpcError::Cancelled(correlation_id)));
                true
            }
            None => false,
        }
    }

    /// Closes the connection.
    ///
    /// Every still-pending call is rejected with `ConnectionClosed`. Frames
    /// already queued are flushed before the write half shuts down. Calling
    /// `close` more than once is harmless.
    pub async fn close(&self) {
        self.shared.fail_all_pending();

        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tasks) = tasks {
            tasks.reader.abort();
            if let Err(e) = tasks.writer.await {
                if !e.is_cancelled() {
                    warn!("Writer task for {} failed: {}", self.shared.remote_addr, e);
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared
            .outbound
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn remote_addr(&self) -> &str {
        &self.shared.remote_addr
    }

    pub fn stats(&self) -> CallerStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for Caller {
    fn drop(&mut self) {
        self.shared.fail_all_pending();
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tasks) = tasks {
            tasks.reader.abort();
        }
    }
}

async fn receive_loop(shared: Arc<CallerShared>, mut reader: Box<dyn FrameReader>) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => shared.handle_inbound_frame(&frame),
            Ok(None) => {
                debug!("Peer {} closed the connection", shared.remote_addr);
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                bump(&shared.stats.malformed_frames);
                warn!("Dropping frame from {}: {}", shared.remote_addr, e);
            }
            Err(e) => {
                warn!("Read from {} failed: {}", shared.remote_addr, e);
                break;
            }
        }
    }
    shared.fail_all_pending();
}

/// Handle to the eventual response of a call.
///
/// Resolves to the response message, or to an error when the call times
/// out, is cancelled or its connection closes.
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: String,
    method: String,
    receiver: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Future for PendingCall {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{to_params, ErrorKind};
    use crate::serialization::SerializationError;
    use crate::transport::{memory, FrameWriter};
    use serde_json::json;

    /// Peer side of a memory link that the test drives by hand.
    struct ManualPeer {
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        codec: JsonCodec,
    }

    impl ManualPeer {
        async fn next_request(&mut self) -> Message {
            let frame = self.reader.read_frame().await.unwrap().unwrap();
            self.codec.decode(&frame).unwrap()
        }

        async fn send(&mut self, message: &Message) {
            let frame = self.codec.encode(message).unwrap();
            self.writer.write_frame(&frame).await.unwrap();
        }
    }

    fn setup(config: RpcConfig) -> (Caller, ManualPeer) {
        let (local, remote) = memory::pair();
        let caller = Caller::with_connection(Box::new(local), config);
        let (reader, writer) = Box::new(remote).split();
        (
            caller,
            ManualPeer {
                reader,
                writer,
                codec: JsonCodec::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_out_of_order_responses_resolve_their_own_calls() {
        let (caller, mut peer) = setup(RpcConfig::default());

        let first = caller.call("echo", to_params(json!({"n": 1}))).unwrap();
        let second = caller.call("echo", to_params(json!({"n": 2}))).unwrap();
        assert_ne!(first.correlation_id(), second.correlation_id());

        let req1 = peer.next_request().await;
        let req2 = peer.next_request().await;
        peer.send(&req2.reply(req2.params().clone())).await;
        peer.send(&req1.reply(req1.params().clone())).await;

        let resp1 = first.await.unwrap();
        let resp2 = second.await.unwrap();
        assert_eq!(resp1.param("n"), Some(&json!(1)));
        assert_eq!(resp2.param("n"), Some(&json!(2)));
        assert_eq!(caller.pending_calls(), 0);
        assert_eq!(caller.stats().responses_matched, 2);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames_are_discarded() {
        let (caller, mut peer) = setup(RpcConfig::default());
        let call = caller.call("ping", Params::new()).unwrap();
        let request = peer.next_request().await;

        let stray = Message::request("ping", Params::new(), "no-such-call");
        peer.send(&stray).await;
        peer.writer.write_frame(b"{ definitely not json").await.unwrap();
        peer.send(&request.reply(to_params(json!({"pong": true})))).await;

        let response = call.await.unwrap();
        assert_eq!(response.param("pong"), Some(&json!(true)));

        let stats = caller.stats();
        assert_eq!(stats.unknown_responses, 1);
        assert_eq!(stats.malformed_frames, 1);
        assert!(!caller.is_closed());
    }

    #[tokio::test]
    async fn test_error_kind_responses_resolve_not_reject() {
        let (caller, mut peer) = setup(RpcConfig::default());
        let call = caller.call("missing", Params::new()).unwrap();
        let request = peer.next_request().await;
        peer.send(&request.error_reply(ErrorKind::MethodNotFound, "nope"))
            .await;

        let response = call.await.unwrap();
        assert_eq!(response.error_kind(), Some(ErrorKind::MethodNotFound));
    }

    #[tokio::test]
    async fn test_call_timeout_removes_pending_entry() {
        let config = RpcConfig::default().with_call_timeout(Duration::from_millis(50));
        let (caller, mut peer) = setup(config);

        let call = caller.call("slow", Params::new()).unwrap();
        let request = peer.next_request().await;

        let result = call.await;
        assert!(matches!(result, Err(RpcError::CallTimeout { .. })));
        assert_eq!(caller.pending_calls(), 0);
        assert_eq!(caller.stats().timeouts, 1);

        // A late response is treated as unknown.
        peer.send(&request.reply(Params::new())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(caller.stats().unknown_responses, 1);
    }

    #[tokio::test]
    async fn test_timeout_applies_even_when_not_awaited() {
        let config = RpcConfig::default().with_call_timeout(Duration::from_millis(30));
        let (caller, _peer) = setup(config);

        drop(caller.call("fire_and_forget", Params::new()).unwrap());
        assert_eq!(caller.pending_calls(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(caller.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_pending_calls() {
        let (caller, mut peer) = setup(RpcConfig::default());
        let call = caller.call("never_answered", Params::new()).unwrap();
        let _ = peer.next_request().await;

        caller.close().await;

        assert!(matches!(call.await, Err(RpcError::ConnectionClosed)));
        assert_eq!(caller.pending_calls(), 0);
        assert!(caller.is_closed());
        assert!(matches!(
            caller.call("after_close", Params::new()),
            Err(RpcError::ConnectionClosed)
        ));

        // The peer observes the orderly shutdown.
        assert_eq!(peer.reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_peer_disconnect_rejects_pending_calls() {
        let (caller, peer) = setup(RpcConfig::default());
        let call = caller.call("ping", Params::new()).unwrap();

        drop(peer);

        assert!(matches!(call.await, Err(RpcError::ConnectionClosed)));
        assert_eq!(caller.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_rejects_only_that_call() {
        let (caller, mut peer) = setup(RpcConfig::default());
        let cancelled = caller.call("a", Params::new()).unwrap();
        let kept = caller.call("b", Params::new()).unwrap();
        let id = cancelled.correlation_id().to_string();

        assert!(caller.cancel(&id));
        assert!(!caller.cancel(&id));
        assert!(matches!(cancelled.await, Err(RpcError::Cancelled(ref c)) if *c == id));

        let _ = peer.next_request().await;
        let request_b = peer.next_request().await;
        peer.send(&request_b.reply(Params::new())).await;
        assert!(kept.await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_method_is_rejected_locally() {
        let (caller, _peer) = setup(RpcConfig::default());
        assert!(matches!(
            caller.call("", Params::new()),
            Err(RpcError::Serialization(_))
        ));
        assert_eq!(caller.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected_locally() {
        let config = RpcConfig {
            max_frame_size: 256,
            ..Default::default()
        };
        let (caller, mut peer) = setup(config);

        let blob = "x".repeat(1024);
        let result = caller.call("echo", to_params(json!({ "blob": blob })));
        assert!(matches!(
            result,
            Err(RpcError::Serialization(SerializationError::FrameTooLarge { limit: 256, .. }))
        ));
        assert_eq!(caller.pending_calls(), 0);
        assert_eq!(caller.stats().calls_issued, 0);

        // The connection is untouched and the next call goes through.
        let call = caller.call("echo", to_params(json!({"n": 2}))).unwrap();
        let request = peer.next_request().await;
        assert_eq!(request.param("n"), Some(&json!(2)));
        peer.send(&request.reply(request.params().clone())).await;
        assert_eq!(call.await.unwrap().param("n"), Some(&json!(2)));
        assert!(!caller.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_call_from_thread_outside_runtime() {
        let config = RpcConfig::default().with_call_timeout(Duration::from_millis(50));
        let (caller, mut peer) = setup(config);
        let caller = Arc::new(caller);

        let spawn_call = |method: &'static str| {
            let caller = Arc::clone(&caller);
            std::thread::spawn(move || caller.call(method, Params::new()))
                .join()
                .expect("call panicked on a plain thread")
        };

        let answered = spawn_call("ping").unwrap();
        let request = peer.next_request().await;
        peer.send(&request.reply(to_params(json!({"pong": true})))).await;
        assert_eq!(answered.await.unwrap().param("pong"), Some(&json!(true)));

        // Timers armed from a plain thread still fire.
        let unanswered = spawn_call("slow").unwrap();
        assert!(matches!(unanswered.await, Err(RpcError::CallTimeout { .. })));
        assert_eq!(caller.pending_calls(), 0);
    }
}
