//! Test utilities and mock handlers.
//!
//! Helpers for exercising client and server against the in-memory store
//! without a Redis instance.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use serde_json::Value;

use crate::config::StreamsOptions;
use crate::error::HandlerError;
use crate::server::handlers::{EventHandler, RequestHandler, StreamsContext};

/// Options with short block and retry timings, under `prefix`.
pub fn fast_options(prefix: &str) -> StreamsOptions {
    StreamsOptions::new()
        .with_stream_prefix(prefix)
        .with_block_timeout(Duration::from_millis(10))
        .with_retry_delay(Duration::from_millis(10))
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Event handler that records every payload it receives.
#[derive(Clone, Default)]
pub struct RecordingEventHandler {
    received: Arc<Mutex<Vec<(Value, StreamsContext)>>>,
    fail: Option<String>,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recording handler that fails every call after recording it.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            received: Arc::default(),
            fail: Some(message.into()),
        }
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(payload, _)| payload.clone())
            .collect()
    }

    pub fn contexts(&self) -> Vec<StreamsContext> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, ctx)| ctx.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl EventHandler for RecordingEventHandler {
    fn handle(&self, data: Value, ctx: StreamsContext) -> BoxFuture<'static, Result<(), HandlerError>> {
        let received = self.received.clone();
        let fail = self.fail.clone();
        async move {
            received.lock().unwrap().push((data, ctx));
            match fail {
                Some(message) => Err(HandlerError::new(message)),
                None => Ok(()),
            }
        }
        .boxed()
    }
}

/// Request handler answering with its input, counting calls.
#[derive(Clone, Default)]
pub struct EchoHandler {
    calls: Arc<AtomicUsize>,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RequestHandler for EchoHandler {
    fn handle(&self, data: Value, _ctx: StreamsContext) -> BoxStream<'static, Result<Value, HandlerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        stream::once(async move { Ok(data) }).boxed()
    }
}

/// Request handler that always fails with `message`.
#[derive(Clone)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl RequestHandler for FailingHandler {
    fn handle(&self, _data: Value, _ctx: StreamsContext) -> BoxStream<'static, Result<Value, HandlerError>> {
        let err = HandlerError::new(self.message.clone());
        stream::once(async move { Err(err) }).boxed()
    }
}

/// Request handler yielding each of `values` in turn.
#[derive(Clone)]
pub struct SequenceHandler {
    values: Vec<Value>,
}

impl SequenceHandler {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
}

impl RequestHandler for SequenceHandler {
    fn handle(&self, _data: Value, _ctx: StreamsContext) -> BoxStream<'static, Result<Value, HandlerError>> {
        stream::iter(self.values.clone().into_iter().map(Ok)).boxed()
    }
}
