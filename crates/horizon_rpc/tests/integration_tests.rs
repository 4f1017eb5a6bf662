//! End-to-end tests for callers and dispatchers talking over TCP.

use futures::future::join_all;
use horizon_rpc::{
    to_params, Caller, Dispatcher, ErrorKind, HandlerError, Params, RpcConfig, RpcError,
    SerializationError,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

async fn start_dispatcher() -> (Arc<Dispatcher>, SocketAddr) {
    let dispatcher = Arc::new(Dispatcher::new(RpcConfig::default()));
    dispatcher.register_handler("echo", |request, _ctx| {
        Ok(request.reply(request.params().clone()))
    });
    dispatcher.register_handler("fail", |_request, _ctx| {
        Err(HandlerError::failed("this handler always fails"))
    });
    dispatcher.register_handler("panic", |_request, _ctx| panic!("handler blew up"));
    dispatcher.register_handler("whoami", |request, ctx| {
        Ok(request.reply(to_params(json!({
            "connectionId": ctx.connection_id.to_string(),
        }))))
    });

    let listener = dispatcher
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind dispatcher");
    let addr = listener.local_addr();
    (dispatcher, addr)
}

/// A TCP peer that accepts connections and never answers.
async fn start_silent_peer() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, task)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_round_trip() {
    let (_dispatcher, addr) = start_dispatcher().await;
    let caller = Caller::connect(&addr.to_string(), RpcConfig::default())
        .await
        .unwrap();

    let response = caller
        .call("echo", to_params(json!({"msg": "hi"})))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(response.param("msg"), Some(&json!("hi")));
    assert_eq!(response.error_kind(), None);
    assert_eq!(caller.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_calls_resolve_to_their_own_responses() {
    let (_dispatcher, addr) = start_dispatcher().await;
    let caller = Caller::connect(&addr.to_string(), RpcConfig::default())
        .await
        .unwrap();

    let calls: Vec<_> = (0..64)
        .map(|i| {
            caller
                .call("echo", to_params(json!({"index": i})))
                .unwrap()
        })
        .collect();
    let ids: Vec<String> = calls.iter().map(|c| c.correlation_id().to_string()).collect();

    let responses = join_all(calls).await;
    for (i, (response, id)) in responses.into_iter().zip(ids).enumerate() {
        let response = response.unwrap();
        assert_eq!(response.correlation_id(), id);
        assert_eq!(response.param("index"), Some(&json!(i)));
    }
    assert_eq!(caller.stats().responses_matched, 64);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_method_resolves_with_error_kind() {
    let (_dispatcher, addr) = start_dispatcher().await;
    let caller = Caller::connect(&addr.to_string(), RpcConfig::default())
        .await
        .unwrap();

    let call = caller.call("does_not_exist", Params::new()).unwrap();
    let id = call.correlation_id().to_string();
    let response = call.await.unwrap();

    assert_eq!(response.error_kind(), Some(ErrorKind::MethodNotFound));
    assert_eq!(response.correlation_id(), id);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_faults_leave_connection_usable() {
    let (dispatcher, addr) = start_dispatcher().await;
    let caller = Caller::connect(&addr.to_string(), RpcConfig::default())
        .await
        .unwrap();

    let failed = caller.call("fail", Params::new()).unwrap().await.unwrap();
    assert_eq!(failed.error_kind(), Some(ErrorKind::HandlerError));

    let panicked = caller.call("panic", Params::new()).unwrap().await.unwrap();
    assert_eq!(panicked.error_kind(), Some(ErrorKind::HandlerError));
    assert_eq!(panicked.error_reason(), Some("panic"));

    let echoed = caller
        .call("echo", to_params(json!({"still": "alive"})))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(echoed.param("still"), Some(&json!("alive")));

    let stats = dispatcher.stats();
    assert_eq!(stats.handler_errors, 2);
    assert_eq!(stats.active_connections, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connections_are_tracked_separately() {
    let (dispatcher, addr) = start_dispatcher().await;
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    dispatcher.on_disconnect(move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let first = Caller::connect(&addr.to_string(), RpcConfig::default())
        .await
        .unwrap();
    let second = Caller::connect(&addr.to_string(), RpcConfig::default())
        .await
        .unwrap();

    let a = first.call("whoami", Params::new()).unwrap().await.unwrap();
    let b = second.call("whoami", Params::new()).unwrap().await.unwrap();
    assert_ne!(a.param("connectionId"), b.param("connectionId"));
    assert_eq!(dispatcher.connection_count(), 2);

    first.close().await;
    second.close().await;

    timeout(Duration::from_secs(2), async {
        while disconnects.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("disconnect hooks did not run");
    assert_eq!(dispatcher.connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_while_pending_rejects_with_connection_closed() {
    let (addr, _peer) = start_silent_peer().await;
    let caller = Caller::connect(&addr.to_string(), RpcConfig::default())
        .await
        .unwrap();

    let call = caller.call("echo", to_params(json!({"msg": "lost"}))).unwrap();
    caller.close().await;

    assert!(matches!(call.await, Err(RpcError::ConnectionClosed)));
    assert_eq!(caller.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_timeout_against_silent_peer() {
    let (addr, _peer) = start_silent_peer().await;
    let config = RpcConfig::default().with_call_timeout(Duration::from_millis(100));
    let caller = Caller::connect(&addr.to_string(), config).await.unwrap();

    let result = caller.call("echo", Params::new()).unwrap().await;
    match result {
        Err(RpcError::CallTimeout { method, .. }) => assert_eq!(method, "echo"),
        other => panic!("expected CallTimeout, got {other:?}"),
    }
    assert_eq!(caller.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_disconnect_rejects_pending_calls() {
    let (addr, peer) = start_silent_peer().await;
    let caller = Caller::connect(&addr.to_string(), RpcConfig::default())
        .await
        .unwrap();
    let call = caller.call("echo", Params::new()).unwrap();

    // Dropping the silent peer closes every socket it was holding.
    peer.abort();

    let outcome = timeout(Duration::from_secs(2), call)
        .await
        .expect("pending call hung after peer went away");
    assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_stops_on_shutdown() {
    let (dispatcher, addr) = start_dispatcher().await;
    let caller = Caller::connect(&addr.to_string(), RpcConfig::default())
        .await
        .unwrap();
    let call = caller.call("echo", Params::new()).unwrap();
    assert!(call.await.is_ok());

    dispatcher.shutdown();

    timeout(Duration::from_secs(2), async {
        while dispatcher.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connections were not closed on shutdown");

    // The served connection is gone, so further calls fail instead of hanging.
    let outcome = timeout(Duration::from_secs(2), async {
        loop {
            match caller.call("echo", Params::new()) {
                Ok(call) => {
                    if call.await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_connect_to_closed_port_is_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let result = Caller::connect(&format!("127.0.0.1:{port}"), RpcConfig::default()).await;
    assert!(matches!(result, Err(RpcError::ConnectionRefused { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_frames_leave_connection_usable() {
    let config = RpcConfig {
        max_frame_size: 1024,
        ..Default::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(config.clone()));
    dispatcher.register_handler("echo", |request, _ctx| {
        Ok(request.reply(request.params().clone()))
    });
    dispatcher.register_handler("double", |request, _ctx| {
        let blob = request.param("blob").cloned().unwrap_or_default();
        Ok(request.reply(to_params(json!({ "first": blob, "second": blob }))))
    });
    let listener = dispatcher
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let caller = Caller::connect(&listener.local_addr().to_string(), config)
        .await
        .unwrap();

    // Too large to send: rejected before anything is queued.
    let blob = "x".repeat(4096);
    let result = caller.call("echo", to_params(json!({ "blob": blob })));
    assert!(matches!(
        result,
        Err(RpcError::Serialization(SerializationError::FrameTooLarge { .. }))
    ));

    // Fits as a request, but the response would not.
    let response = caller
        .call("double", to_params(json!({ "blob": "y".repeat(600) })))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(response.error_kind(), Some(ErrorKind::HandlerError));
    assert_eq!(response.error_reason(), Some("frame_too_large"));

    let response = caller
        .call("echo", to_params(json!({"n": 2})))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(response.param("n"), Some(&json!(2)));
    assert!(!caller.is_closed());
    assert_eq!(dispatcher.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_with_smaller_frame_limit_drops_only_that_request() {
    let dispatcher = Arc::new(Dispatcher::new(RpcConfig {
        max_frame_size: 1024,
        ..Default::default()
    }));
    dispatcher.register_handler("echo", |request, _ctx| {
        Ok(request.reply(request.params().clone()))
    });
    let listener = dispatcher
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let caller_config = RpcConfig::default().with_call_timeout(Duration::from_millis(200));
    let caller = Caller::connect(&listener.local_addr().to_string(), caller_config)
        .await
        .unwrap();

    let dropped = caller
        .call("echo", to_params(json!({ "blob": "x".repeat(4096) })))
        .unwrap();
    assert!(matches!(dropped.await, Err(RpcError::CallTimeout { .. })));

    let response = caller
        .call("echo", to_params(json!({"n": 3})))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(response.param("n"), Some(&json!(3)));
    assert_eq!(dispatcher.stats().malformed_frames, 1);
}

#[tokio::test]
async fn test_listen_after_shutdown_does_not_accept() {
    let dispatcher = Arc::new(Dispatcher::new(RpcConfig::default()));
    dispatcher.shutdown();

    let listener = dispatcher
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    timeout(Duration::from_secs(2), async {
        while !listener.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("accept loop kept running after shutdown");
}
