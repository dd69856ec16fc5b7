//! Handler registry consumed by the server.
//!
//! The surrounding framework decides which handlers exist; the server only
//! asks a [`HandlerRegistry`] which patterns to consume and which handler
//! serves a canonical pattern. [`HandlerMap`] is the stock registry.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tracing::info;

use crate::error::HandlerError;
use crate::pattern::Pattern;

/// Where and how an entry was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamsContext {
    stream: String,
    message_id: String,
    consumer_group: String,
    consumer_name: String,
}

impl StreamsContext {
    pub fn new(
        stream: impl Into<String>,
        message_id: impl Into<String>,
        consumer_group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            message_id: message_id.into(),
            consumer_group: consumer_group.into(),
            consumer_name: consumer_name.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }
}

/// Handler for requests.
///
/// May yield several values; the server answers with the first one only.
pub trait RequestHandler: Send + Sync {
    fn handle(
        &self,
        data: Value,
        ctx: StreamsContext,
    ) -> BoxStream<'static, Result<Value, HandlerError>>;
}

/// Handler for fire-and-forget events.
pub trait EventHandler: Send + Sync {
    fn handle(&self, data: Value, ctx: StreamsContext) -> BoxFuture<'static, Result<(), HandlerError>>;
}

/// Source of handlers, keyed by canonical pattern.
pub trait HandlerRegistry: Send + Sync {
    /// Canonical patterns the server should consume.
    fn patterns(&self) -> Vec<String>;

    /// Request handler for a canonical pattern.
    fn request_handler(&self, pattern: &str) -> Option<Arc<dyn RequestHandler>>;

    /// Event handlers for a canonical pattern, in registration order.
    fn event_handlers(&self, pattern: &str) -> Vec<Arc<dyn EventHandler>>;
}

/// Request handler backed by an async closure producing one value.
pub struct FnRequestHandler<F> {
    f: F,
}

/// Event handler backed by an async closure.
pub struct FnEventHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`RequestHandler`].
pub fn request_fn<F, Fut>(f: F) -> FnRequestHandler<F>
where
    F: Fn(Value, StreamsContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnRequestHandler { f }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn event_fn<F, Fut>(f: F) -> FnEventHandler<F>
where
    F: Fn(Value, StreamsContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnEventHandler { f }
}

impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Value, StreamsContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        data: Value,
        ctx: StreamsContext,
    ) -> BoxStream<'static, Result<Value, HandlerError>> {
        stream::once((self.f)(data, ctx)).boxed()
    }
}

impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(Value, StreamsContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, data: Value, ctx: StreamsContext) -> BoxFuture<'static, Result<(), HandlerError>> {
        (self.f)(data, ctx).boxed()
    }
}

/// In-memory handler registry.
///
/// One request handler per pattern (a later registration replaces the
/// earlier one); any number of event handlers per pattern.
#[derive(Default)]
pub struct HandlerMap {
    requests: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    events: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the request handler for `pattern`.
    pub fn add_request_handler(
        &self,
        pattern: impl Into<Pattern>,
        handler: impl RequestHandler + 'static,
    ) {
        let pattern = pattern.into().canonicalize();
        if let Ok(mut requests) = self.requests.write() {
            info!(pattern = %pattern, "Request handler registered");
            requests.insert(pattern, Arc::new(handler));
        }
    }

    /// Add an event handler for `pattern`.
    pub fn add_event_handler(&self, pattern: impl Into<Pattern>, handler: impl EventHandler + 'static) {
        let pattern = pattern.into().canonicalize();
        if let Ok(mut events) = self.events.write() {
            let handlers = events.entry(pattern.clone()).or_default();
            handlers.push(Arc::new(handler));
            info!(pattern = %pattern, handler_count = handlers.len(), "Event handler registered");
        }
    }
}

impl HandlerRegistry for HandlerMap {
    fn patterns(&self) -> Vec<String> {
        let mut patterns = BTreeSet::new();
        if let Ok(requests) = self.requests.read() {
            patterns.extend(requests.keys().cloned());
        }
        if let Ok(events) = self.events.read() {
            patterns.extend(events.keys().cloned());
        }
        patterns.into_iter().collect()
    }

    fn request_handler(&self, pattern: &str) -> Option<Arc<dyn RequestHandler>> {
        self.requests
            .read()
            .ok()
            .and_then(|requests| requests.get(pattern).cloned())
    }

    fn event_handlers(&self, pattern: &str) -> Vec<Arc<dyn EventHandler>> {
        self.events
            .read()
            .ok()
            .and_then(|events| events.get(pattern).cloned())
            .unwrap_or_default()
    }
}
