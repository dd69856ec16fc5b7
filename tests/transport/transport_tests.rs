//! Client/server contract tests.
//!
//! Every test uses its own stream prefix, so runs against a shared Redis
//! never see each other's streams.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use redstream::store::Connector;
use redstream::test_utils::{
    fast_options, wait_until, EchoHandler, FailingHandler, RecordingEventHandler,
};
use redstream::{
    request_fn, HandlerError, HandlerMap, Pattern, StreamsClient, StreamsOptions, StreamsServer,
    TransportError,
};

const WAIT: Duration = Duration::from_secs(5);

/// Unique stream prefix for one test.
pub fn test_prefix(name: &str) -> String {
    format!("test_{}_{}", name, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn options(prefix: &str) -> StreamsOptions {
    fast_options(prefix)
}

async fn start_server(
    connector: &Arc<dyn Connector>,
    options: StreamsOptions,
    handlers: HandlerMap,
) -> StreamsServer {
    let server = StreamsServer::new(options, connector.clone(), Arc::new(handlers));
    server.listen().await.expect("listen should succeed");
    server
}

// =============================================================================
// Events
// =============================================================================

pub async fn test_emit_reaches_event_handler(connector: Arc<dyn Connector>) {
    let prefix = test_prefix("emit");
    let handlers = HandlerMap::new();
    let seen = RecordingEventHandler::new();
    handlers.add_event_handler("user.created", seen.clone());
    let server = start_server(&connector, options(&prefix), handlers).await;

    let client = StreamsClient::new(options(&prefix), connector.clone());
    client
        .emit("user.created", &json!({ "id": 1 }))
        .await
        .expect("emit should succeed");

    assert!(wait_until(WAIT, || seen.count() == 1).await, "event should arrive");
    assert_eq!(seen.payloads(), vec![json!({ "id": 1 })]);
    assert_eq!(
        seen.contexts()[0].stream(),
        format!("{prefix}:user.created")
    );

    client.close().await.unwrap();
    server.close().await.unwrap();
}

pub async fn test_emits_from_many_tasks(connector: Arc<dyn Connector>) {
    let prefix = test_prefix("bulk");
    let handlers = HandlerMap::new();
    let seen = RecordingEventHandler::new();
    handlers.add_event_handler("bulk", seen.clone());
    let server = start_server(&connector, options(&prefix), handlers).await;

    let client = Arc::new(StreamsClient::new(options(&prefix), connector.clone()));
    client.connect().await.unwrap();
    let tasks: Vec<_> = (0..500)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.emit("bulk", &i).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().expect("emit should succeed");
    }

    assert!(wait_until(WAIT, || seen.count() == 500).await, "all events should arrive");
    let unique: HashSet<i64> = seen.payloads().iter().filter_map(Value::as_i64).collect();
    assert_eq!(unique.len(), 500);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

pub async fn test_competing_servers_share_work(connector: Arc<dyn Connector>) {
    let prefix = test_prefix("compete");
    let seen_a = RecordingEventHandler::new();
    let seen_b = RecordingEventHandler::new();

    let handlers_a = HandlerMap::new();
    handlers_a.add_event_handler("work", seen_a.clone());
    let handlers_b = HandlerMap::new();
    handlers_b.add_event_handler("work", seen_b.clone());

    let a = start_server(
        &connector,
        options(&prefix).with_consumer_name("a").with_batch_size(5),
        handlers_a,
    )
    .await;
    let b = start_server(
        &connector,
        options(&prefix).with_consumer_name("b").with_batch_size(5),
        handlers_b,
    )
    .await;

    let client = StreamsClient::new(options(&prefix), connector.clone());
    for i in 0..100 {
        client.emit("work", &i).await.unwrap();
    }

    assert!(wait_until(WAIT, || seen_a.count() + seen_b.count() >= 100).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut all = seen_a.payloads();
    all.extend(seen_b.payloads());
    assert_eq!(all.len(), 100, "each event handled exactly once");
    let unique: HashSet<i64> = all.iter().filter_map(Value::as_i64).collect();
    assert_eq!(unique.len(), 100);

    client.close().await.unwrap();
    a.close().await.unwrap();
    b.close().await.unwrap();
}

// =============================================================================
// Requests
// =============================================================================

pub async fn test_send_roundtrip(connector: Arc<dyn Connector>) {
    let prefix = test_prefix("echo");
    let handlers = HandlerMap::new();
    handlers.add_request_handler(
        "user.echo",
        request_fn(|data, _| async move { Ok(json!({ "ok": true, "data": data })) }),
    );
    let server = start_server(&connector, options(&prefix), handlers).await;

    let client = StreamsClient::new(options(&prefix), connector.clone());
    let reply: Value = tokio::time::timeout(WAIT, client.send("user.echo", &json!({ "id": 1 })))
        .await
        .expect("reply should arrive")
        .expect("send should succeed");
    assert_eq!(reply, json!({ "ok": true, "data": { "id": 1 } }));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

pub async fn test_handler_error_rejects(connector: Arc<dyn Connector>) {
    let prefix = test_prefix("boom");
    let handlers = HandlerMap::new();
    handlers.add_request_handler("explode", FailingHandler::new("boom"));
    let server = start_server(&connector, options(&prefix), handlers).await;

    let client = StreamsClient::new(options(&prefix), connector.clone());
    let result: redstream::Result<Value> =
        tokio::time::timeout(WAIT, client.send("explode", &json!({})))
            .await
            .expect("reply should arrive");

    match result {
        Err(TransportError::Handler { message, .. }) => assert_eq!(message, "boom"),
        other => panic!("expected handler error, got {other:?}"),
    }

    client.close().await.unwrap();
    server.close().await.unwrap();
}

pub async fn test_concurrent_requests_correlate(connector: Arc<dyn Connector>) {
    let prefix = test_prefix("corr");
    let handlers = HandlerMap::new();
    handlers.add_request_handler(
        "square",
        request_fn(|data, _| async move {
            match data.as_i64() {
                Some(n) => Ok(json!(n * n)),
                None => Err(HandlerError::new("not a number")),
            }
        }),
    );
    let server = start_server(&connector, options(&prefix), handlers).await;

    let client = Arc::new(StreamsClient::new(options(&prefix), connector.clone()));
    let tasks: Vec<_> = (0..100i64)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let squared: redstream::Result<i64> = client.send("square", &i).await;
                (i, squared)
            })
        })
        .collect();
    for task in tasks {
        let (i, result) = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(result.expect("send should succeed"), i * i);
    }
    assert_eq!(client.pending_requests(), 0);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

pub async fn test_keyed_pattern_roundtrip(connector: Arc<dyn Connector>) {
    let prefix = test_prefix("keyed");
    let handlers = HandlerMap::new();
    handlers.add_request_handler(
        Pattern::keyed([("cmd", "get"), ("resource", "user")]),
        EchoHandler::new(),
    );
    let server = start_server(&connector, options(&prefix), handlers).await;

    let client = StreamsClient::new(options(&prefix), connector.clone());
    let reply: i64 = tokio::time::timeout(
        WAIT,
        client.send(Pattern::keyed([("resource", "user"), ("cmd", "get")]), &42),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply, 42);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

// =============================================================================
// Lifecycle
// =============================================================================

pub async fn test_close_then_reconnect(connector: Arc<dyn Connector>) {
    let prefix = test_prefix("cycle");
    let handlers = HandlerMap::new();
    handlers.add_request_handler("echo", EchoHandler::new());
    let server = start_server(&connector, options(&prefix), handlers).await;

    let client = StreamsClient::new(options(&prefix), connector.clone());
    assert!(matches!(client.unwrap(), Err(TransportError::NotInitialized)));

    let first: String = client.send("echo", "one").await.unwrap();
    client.close().await.unwrap();
    assert!(client.unwrap().is_err());

    client.connect().await.unwrap();
    let second: String = client.send("echo", "two").await.unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("one", "two"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

pub async fn test_server_restart_keeps_group(connector: Arc<dyn Connector>) {
    let prefix = test_prefix("restart");
    let seen = RecordingEventHandler::new();
    let handlers = Arc::new(HandlerMap::new());
    handlers.add_event_handler("restart", seen.clone());

    let server = StreamsServer::new(options(&prefix), connector.clone(), handlers.clone());
    server.listen().await.unwrap();
    server.close().await.unwrap();

    // Entries appended while no server runs are consumed after restart.
    let client = StreamsClient::new(options(&prefix), connector.clone());
    client.emit("restart", &"queued").await.unwrap();

    server.listen().await.unwrap();
    assert!(wait_until(WAIT, || seen.count() == 1).await);
    assert_eq!(seen.payloads(), vec![json!("queued")]);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all transport tests against a connector.
#[macro_export]
macro_rules! run_transport_tests {
    ($connector:expr) => {
        use $crate::transport::transport_tests::*;

        test_emit_reaches_event_handler($connector).await;
        println!("  test_emit_reaches_event_handler: PASSED");

        test_emits_from_many_tasks($connector).await;
        println!("  test_emits_from_many_tasks: PASSED");

        test_competing_servers_share_work($connector).await;
        println!("  test_competing_servers_share_work: PASSED");

        test_send_roundtrip($connector).await;
        println!("  test_send_roundtrip: PASSED");

        test_handler_error_rejects($connector).await;
        println!("  test_handler_error_rejects: PASSED");

        test_concurrent_requests_correlate($connector).await;
        println!("  test_concurrent_requests_correlate: PASSED");

        test_keyed_pattern_roundtrip($connector).await;
        println!("  test_keyed_pattern_roundtrip: PASSED");

        test_close_then_reconnect($connector).await;
        println!("  test_close_then_reconnect: PASSED");

        test_server_restart_keeps_group($connector).await;
        println!("  test_server_restart_keeps_group: PASSED");
    };
}
