use super::*;
use crate::packet::fields;
use crate::server::handlers::{request_fn, EventHandler, HandlerMap, RequestHandler};
use crate::store::MemoryLogStore;
use crate::test_utils::{
    fast_options, wait_until, EchoHandler, FailingHandler, RecordingEventHandler, SequenceHandler,
};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};

const PREFIX: &str = "srv";
const WAIT: Duration = Duration::from_secs(2);

fn server(store: &MemoryLogStore, handlers: Arc<HandlerMap>) -> StreamsServer {
    StreamsServer::new(fast_options(PREFIX), Arc::new(store.clone()), handlers)
}

async fn send_request(store: &MemoryLogStore, pattern: &str, reply_to: &str, payload: Value) -> String {
    let request = RequestPacket::new(reply_to, &payload).unwrap();
    let id = request.id.clone();
    store
        .append(
            &naming::stream_name(PREFIX, pattern),
            &Packet::from(request).to_fields(),
            None,
        )
        .await
        .unwrap();
    id
}

async fn send_event(store: &MemoryLogStore, pattern: &str, payload: Value) {
    let event = EventPacket::new(&payload).unwrap();
    store
        .append(
            &naming::stream_name(PREFIX, pattern),
            &Packet::from(event).to_fields(),
            None,
        )
        .await
        .unwrap();
}

fn responses(store: &MemoryLogStore, reply_to: &str) -> Vec<ResponsePacket> {
    store
        .entries(reply_to)
        .iter()
        .map(|entry| match Packet::decode(&entry.fields).unwrap() {
            Packet::Response(response) => response,
            other => panic!("expected response, got {other:?}"),
        })
        .collect()
}

async fn wait_for_responses(store: &MemoryLogStore, reply_to: &str, n: usize) -> Vec<ResponsePacket> {
    assert!(wait_until(WAIT, || store.len(reply_to) >= n).await);
    responses(store, reply_to)
}

#[tokio::test]
async fn test_unwrap_before_connect_fails() {
    let store = MemoryLogStore::new();
    let server = server(&store, Arc::new(HandlerMap::new()));
    assert!(matches!(server.unwrap(), Err(TransportError::NotInitialized)));

    server.connect().await.unwrap();
    assert!(server.unwrap().is_ok());

    server.close().await.unwrap();
    assert!(matches!(server.unwrap(), Err(TransportError::NotInitialized)));
}

#[tokio::test]
async fn test_listen_creates_groups_idempotently() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    handlers.add_request_handler("user.echo", EchoHandler::new());
    handlers.add_event_handler("user.created", RecordingEventHandler::new());

    let server = server(&store, handlers);
    server.listen().await.unwrap();
    server.listen().await.unwrap();

    assert!(store.has_group("srv:user.echo", "redstream"));
    assert!(store.has_group("srv:user.created", "redstream"));
    assert!(server.is_consuming().await);

    // A second server joining the same group must not fail either.
    let other = StreamsServer::new(
        fast_options(PREFIX),
        Arc::new(store.clone()),
        Arc::new({
            let map = HandlerMap::new();
            map.add_request_handler("user.echo", EchoHandler::new());
            map
        }),
    );
    other.listen().await.unwrap();

    server.close().await.unwrap();
    other.close().await.unwrap();
}

#[tokio::test]
async fn test_listen_without_handlers_does_not_consume() {
    let store = MemoryLogStore::new();
    let server = server(&store, Arc::new(HandlerMap::new()));
    server.listen().await.unwrap();

    assert!(!server.is_consuming().await);
    assert!(server.unwrap().is_ok());
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_request_is_answered_on_reply_stream() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    handlers.add_request_handler(
        "math.sum",
        request_fn(|data, _| async move {
            let sum: i64 = data
                .as_array()
                .map(|items| items.iter().filter_map(Value::as_i64).sum())
                .unwrap_or(0);
            Ok(json!(sum))
        }),
    );
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    let id = send_request(&store, "math.sum", "srv:reply:a", json!([1, 2, 3])).await;
    let responses = wait_for_responses(&store, "srv:reply:a", 1).await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, id);
    assert!(responses[0].is_disposed);
    assert_eq!(responses[0].clone().into_result().unwrap(), json!(6));

    assert!(wait_until(WAIT, || store.pending_count("srv:math.sum", "redstream") == 0).await);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_is_sent_as_err_response() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    handlers.add_request_handler("fails", FailingHandler::new("boom"));
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_request(&store, "fails", "srv:reply:b", json!({})).await;
    let responses = wait_for_responses(&store, "srv:reply:b", 1).await;

    assert!(responses[0].is_disposed);
    let raw = &store.entries("srv:reply:b")[0].fields;
    assert!(raw.contains_key(fields::ERR));
    assert!(!raw.contains_key(fields::DATA));
    match responses[0].clone().into_result() {
        Err(TransportError::Handler { message, .. }) => assert_eq!(message, "boom"),
        other => panic!("expected handler error, got {other:?}"),
    }
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_only_first_handler_value_is_sent() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    handlers.add_request_handler("seq", SequenceHandler::new(vec![json!(1), json!(2), json!(3)]));
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_request(&store, "seq", "srv:reply:c", json!(null)).await;
    let responses = wait_for_responses(&store, "srv:reply:c", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.len("srv:reply:c"), 1);
    assert_eq!(responses[0].clone().into_result().unwrap(), json!(1));
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_handler_outcome_answers_null() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    handlers.add_request_handler("empty", SequenceHandler::new(vec![]));
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_request(&store, "empty", "srv:reply:d", json!(1)).await;
    let responses = wait_for_responses(&store, "srv:reply:d", 1).await;
    assert_eq!(responses[0].clone().into_result().unwrap(), Value::Null);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_malformed_request_payload_gets_serialization_error() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    let echo = EchoHandler::new();
    handlers.add_request_handler("echo", echo.clone());
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    store
        .append(
            "srv:echo",
            &[
                (fields::MARKER, fields::REQUEST_TAG.to_string()),
                (fields::DATA, "{not json".to_string()),
                (fields::ID, "req-1".to_string()),
                (fields::REPLY_TO, "srv:reply:e".to_string()),
            ],
            None,
        )
        .await
        .unwrap();

    let responses = wait_for_responses(&store, "srv:reply:e", 1).await;
    assert_eq!(responses[0].id, "req-1");
    match responses[0].clone().into_result() {
        Err(TransportError::Handler { name, .. }) => assert_eq!(name, "SerializationError"),
        other => panic!("expected serialization error, got {other:?}"),
    }
    assert_eq!(echo.calls(), 0);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_request_without_handler_is_acked_and_dropped() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    let events = RecordingEventHandler::new();
    handlers.add_event_handler("only.events", events.clone());
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_request(&store, "only.events", "srv:reply:f", json!(1)).await;
    assert!(wait_until(WAIT, || {
        server.cursors().contains_key("srv:only.events")
            && store.pending_count("srv:only.events", "redstream") == 0
    })
    .await);

    assert_eq!(store.len("srv:reply:f"), 0);
    assert_eq!(events.count(), 0);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_event_reaches_every_handler() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    let first = RecordingEventHandler::new();
    let second = RecordingEventHandler::failing("second fails");
    handlers.add_event_handler("user.created", first.clone());
    handlers.add_event_handler("user.created", second.clone());
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_event(&store, "user.created", json!({ "id": 7 })).await;
    send_event(&store, "user.created", json!({ "id": 8 })).await;

    assert!(wait_until(WAIT, || first.count() == 2 && second.count() == 2).await);
    assert_eq!(first.payloads(), vec![json!({ "id": 7 }), json!({ "id": 8 })]);

    let ctx = &first.contexts()[0];
    assert_eq!(ctx.stream(), "srv:user.created");
    assert_eq!(ctx.consumer_group(), "redstream");
    assert_eq!(ctx.consumer_name(), server.options().consumer_name);

    assert!(wait_until(WAIT, || store.pending_count("srv:user.created", "redstream") == 0).await);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_loop() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    handlers.add_request_handler(
        "panics",
        request_fn(|data, _| async move {
            if data == json!("explode") {
                panic!("handler exploded");
            }
            Ok(data)
        }),
    );
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_request(&store, "panics", "srv:reply:g", json!("explode")).await;
    send_request(&store, "panics", "srv:reply:g", json!("fine")).await;
    let responses = wait_for_responses(&store, "srv:reply:g", 2).await;

    assert!(responses[0].clone().into_result().is_err());
    assert_eq!(responses[1].clone().into_result().unwrap(), json!("fine"));
    server.close().await.unwrap();
}

/// Panics while building its outcome, before any future is polled.
struct PanicsOnCall;

impl RequestHandler for PanicsOnCall {
    fn handle(
        &self,
        data: Value,
        _ctx: StreamsContext,
    ) -> BoxStream<'static, std::result::Result<Value, HandlerError>> {
        if data == json!("explode") {
            panic!("handler exploded before returning");
        }
        futures::stream::once(async move { Ok(data) }).boxed()
    }
}

impl EventHandler for PanicsOnCall {
    fn handle(
        &self,
        data: Value,
        _ctx: StreamsContext,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        if data == json!("explode") {
            panic!("handler exploded before returning");
        }
        async { Ok(()) }.boxed()
    }
}

#[tokio::test]
async fn test_request_handler_panicking_on_call_does_not_stop_loop() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    handlers.add_request_handler("eager", PanicsOnCall);
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_request(&store, "eager", "srv:reply:p", json!("explode")).await;
    send_request(&store, "eager", "srv:reply:p", json!("fine")).await;
    let responses = wait_for_responses(&store, "srv:reply:p", 2).await;

    match responses[0].clone().into_result() {
        Err(TransportError::Handler { message, .. }) => {
            assert_eq!(message, "request handler panicked")
        }
        other => panic!("expected handler error, got {other:?}"),
    }
    assert_eq!(responses[1].clone().into_result().unwrap(), json!("fine"));
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_event_handler_panicking_on_call_does_not_stop_loop() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    let seen = RecordingEventHandler::new();
    handlers.add_event_handler("eager", PanicsOnCall);
    handlers.add_event_handler("eager", seen.clone());
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_event(&store, "eager", json!("explode")).await;
    send_event(&store, "eager", json!("fine")).await;

    // The handler after the panicking one still sees both events.
    assert!(wait_until(WAIT, || seen.count() == 2).await);
    assert!(wait_until(WAIT, || store.pending_count("srv:eager", "redstream") == 0).await);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_competing_consumers_process_each_entry_once() {
    let store = MemoryLogStore::new();
    let seen_a = RecordingEventHandler::new();
    let seen_b = RecordingEventHandler::new();

    let handlers_a = Arc::new(HandlerMap::new());
    handlers_a.add_event_handler("jobs", seen_a.clone());
    let handlers_b = Arc::new(HandlerMap::new());
    handlers_b.add_event_handler("jobs", seen_b.clone());

    let a = StreamsServer::new(
        fast_options(PREFIX).with_batch_size(5).with_consumer_name("a"),
        Arc::new(store.clone()),
        handlers_a,
    );
    let b = StreamsServer::new(
        fast_options(PREFIX).with_batch_size(5).with_consumer_name("b"),
        Arc::new(store.clone()),
        handlers_b,
    );
    a.listen().await.unwrap();
    b.listen().await.unwrap();

    for i in 0..100 {
        send_event(&store, "jobs", json!(i)).await;
    }

    assert!(wait_until(WAIT, || seen_a.count() + seen_b.count() >= 100).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut all: Vec<Value> = seen_a.payloads();
    all.extend(seen_b.payloads());
    assert_eq!(all.len(), 100);
    let unique: HashSet<i64> = all.iter().filter_map(Value::as_i64).collect();
    assert_eq!(unique.len(), 100);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_group_skips_entries_before_first_listen() {
    let store = MemoryLogStore::new();
    send_event(&store, "late", json!("before")).await;

    let handlers = Arc::new(HandlerMap::new());
    let seen = RecordingEventHandler::new();
    handlers.add_event_handler("late", seen.clone());
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_event(&store, "late", json!("after")).await;
    assert!(wait_until(WAIT, || seen.count() == 1).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(seen.payloads(), vec![json!("after")]);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_read_failures_are_retried() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    let seen = RecordingEventHandler::new();
    handlers.add_event_handler("flaky", seen.clone());
    let server = server(&store, handlers);

    let reconnecting = Arc::new(AtomicUsize::new(0));
    let counter = reconnecting.clone();
    server.on(ConnectionEventKind::Reconnecting, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    store.fail_next_reads(3);
    server.listen().await.unwrap();
    send_event(&store, "flaky", json!("survives")).await;

    assert!(wait_until(WAIT, || seen.count() == 1).await);
    assert_eq!(reconnecting.load(Ordering::SeqCst), 3);
    server.close().await.unwrap();
}

/// Known simplification: a failing read is retried forever at one fixed
/// delay. There is no backoff and no attempt limit.
#[tokio::test]
async fn test_known_simplification_read_retry_is_fixed_and_unbounded() {
    const FAILURES: usize = 25;
    let delay = Duration::from_millis(20);

    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    let seen = RecordingEventHandler::new();
    handlers.add_event_handler("outage", seen.clone());
    let server = StreamsServer::new(
        fast_options(PREFIX).with_retry_delay(delay),
        Arc::new(store.clone()),
        handlers,
    );

    let stamps = Arc::new(Mutex::new(Vec::new()));
    let sink = stamps.clone();
    server.on(ConnectionEventKind::Reconnecting, move |_| {
        sink.lock().unwrap().push(Instant::now());
    });

    store.fail_next_reads(FAILURES);
    server.listen().await.unwrap();
    send_event(&store, "outage", json!("after outage")).await;

    assert!(
        wait_until(Duration::from_secs(5), || seen.count() == 1).await,
        "loop should outlast every injected failure"
    );

    let stamps = stamps.lock().unwrap().clone();
    assert_eq!(stamps.len(), FAILURES);
    for (i, pair) in stamps.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        assert!(gap >= delay, "retry {i} came after {gap:?}, before the delay");
        assert!(gap < delay * 4, "retry {i} came after {gap:?}, delay grew");
    }
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_close_stops_consumption() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    let seen = RecordingEventHandler::new();
    handlers.add_event_handler("stop", seen.clone());
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_event(&store, "stop", json!(1)).await;
    assert!(wait_until(WAIT, || seen.count() == 1).await);

    server.close().await.unwrap();
    assert!(!server.is_consuming().await);
    assert_eq!(store.open_connections(), 0);
    assert!(server.cursors().is_empty());

    send_event(&store, "stop", json!(2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.count(), 1);
}

#[tokio::test]
async fn test_relisten_picks_up_new_patterns() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    let first = RecordingEventHandler::new();
    handlers.add_event_handler("one", first.clone());
    let server = server(&store, handlers.clone());
    server.listen().await.unwrap();

    let second = RecordingEventHandler::new();
    handlers.add_event_handler("two", second.clone());
    server.listen().await.unwrap();
    assert!(store.has_group("srv:two", "redstream"));

    send_event(&store, "one", json!("a")).await;
    send_event(&store, "two", json!("b")).await;
    assert!(wait_until(WAIT, || first.count() == 1 && second.count() == 1).await);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_status_events_on_lifecycle() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    handlers.add_request_handler("x", EchoHandler::new());
    let server = server(&store, handlers);

    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        ConnectionEventKind::Connect,
        ConnectionEventKind::Ready,
        ConnectionEventKind::End,
    ] {
        let log = log.clone();
        server.on(kind, move |event| {
            log.lock().unwrap().push(event.kind());
        });
    }

    server.listen().await.unwrap();
    server.close().await.unwrap();
    // Nothing left to release.
    server.close().await.unwrap();

    // One connect per connection: command and consumer loop.
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            ConnectionEventKind::Connect,
            ConnectionEventKind::Ready,
            ConnectionEventKind::Connect,
            ConnectionEventKind::End,
        ]
    );
}

#[tokio::test]
async fn test_close_without_connect_emits_no_end() {
    let store = MemoryLogStore::new();
    let server = server(&store, Arc::new(HandlerMap::new()));

    let ends = Arc::new(AtomicUsize::new(0));
    let counter = ends.clone();
    server.on(ConnectionEventKind::End, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    server.close().await.unwrap();
    assert_eq!(ends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dropping_server_stops_consumption() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    let seen = RecordingEventHandler::new();
    handlers.add_event_handler("dropped", seen.clone());
    let server = server(&store, handlers);
    server.listen().await.unwrap();

    send_event(&store, "dropped", json!(1)).await;
    assert!(wait_until(WAIT, || seen.count() == 1).await);

    drop(server);
    // Let the loop see the flag at its next read timeout.
    tokio::time::sleep(Duration::from_millis(50)).await;

    send_event(&store, "dropped", json!(2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.count(), 1);
}

#[tokio::test]
async fn test_reply_stream_expiry_is_applied() {
    let store = MemoryLogStore::new();
    let handlers = Arc::new(HandlerMap::new());
    handlers.add_request_handler("ttl", EchoHandler::new());
    let server = StreamsServer::new(
        fast_options(PREFIX).with_reply_stream_ttl(Duration::from_secs(1)),
        Arc::new(store.clone()),
        handlers,
    );
    server.listen().await.unwrap();

    send_request(&store, "ttl", "srv:reply:h", json!(1)).await;
    wait_for_responses(&store, "srv:reply:h", 1).await;
    assert!(wait_until(Duration::from_secs(3), || !store.exists("srv:reply:h")).await);
    server.close().await.unwrap();
}
