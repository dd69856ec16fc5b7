//! Consuming side of the transport.
//!
//! A `StreamsServer` joins one consumer group on the stream of every
//! registered pattern and runs a single background loop that reads new
//! entries, dispatches them to handlers and acknowledges them. Requests are
//! answered on the requester's reply stream.

pub mod handlers;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ResolvedOptions, StreamsOptions};
use crate::connection::{self, ConnectionSlot};
use crate::error::{HandlerError, Result, TransportError};
use crate::naming;
use crate::packet::{EventPacket, Packet, RequestPacket, ResponsePacket};
use crate::status::{ConnectionEvent, ConnectionEventKind, StatusListeners};
use crate::store::{Connector, LogStore, ReadOptions, StreamEntry};

use self::handlers::{HandlerRegistry, StreamsContext};

/// Result of dispatching one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchResult {
    /// Handler ran (and a response was sent, for requests).
    Success,
    /// Handler failed; requests were answered with the error.
    HandlerFailed,
    /// No handler for the pattern.
    Unhandled,
    /// Entry could not be decoded or does not belong on a pattern stream.
    Rejected,
}

/// Background consumer loop handle.
struct ConsumerLoop {
    consuming: Arc<AtomicBool>,
    streams: Vec<String>,
    reader: Arc<dyn LogStore>,
    handle: JoinHandle<()>,
}

impl ConsumerLoop {
    /// Stop the loop and wait until it has exited.
    ///
    /// The loop observes the flag at its next read timeout or retry delay.
    async fn stop(self) {
        self.consuming.store(false, Ordering::SeqCst);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Consumer loop terminated abnormally");
        }
        connection::release(self.reader.as_ref()).await;
    }
}

/// Redis Streams server.
pub struct StreamsServer {
    options: Arc<ResolvedOptions>,
    connector: Arc<dyn Connector>,
    registry: Arc<dyn HandlerRegistry>,
    status: Arc<StatusListeners>,
    connection: ConnectionSlot,
    cursors: Arc<Mutex<HashMap<String, String>>>,
    consumer: tokio::sync::Mutex<Option<ConsumerLoop>>,
}

impl StreamsServer {
    pub fn new(
        options: StreamsOptions,
        connector: Arc<dyn Connector>,
        registry: Arc<dyn HandlerRegistry>,
    ) -> Self {
        Self {
            options: Arc::new(options.resolve()),
            connector,
            registry,
            status: Arc::new(StatusListeners::new()),
            connection: ConnectionSlot::default(),
            cursors: Arc::new(Mutex::new(HashMap::new())),
            consumer: tokio::sync::Mutex::new(None),
        }
    }

    /// Server connecting to the Redis instance named by `options`.
    #[cfg(feature = "redis")]
    pub fn redis(options: StreamsOptions, registry: Arc<dyn HandlerRegistry>) -> Self {
        let resolved = options.resolve();
        let connector = crate::store::RedisConnector::new(&resolved.url, resolved.database);
        Self::new(options, Arc::new(connector), registry)
    }

    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    /// Register a connection-state listener.
    pub fn on<F>(&self, kind: ConnectionEventKind, callback: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.status.on(kind, callback);
    }

    /// The underlying store connection.
    ///
    /// Fails with `NotInitialized` before `connect()` and after `close()`.
    pub fn unwrap(&self) -> Result<Arc<dyn LogStore>> {
        self.connection.get()
    }

    /// Whether the consumer loop is running.
    pub async fn is_consuming(&self) -> bool {
        self.consumer.lock().await.is_some()
    }

    /// Last entry id handed to dispatch, per stream.
    pub fn cursors(&self) -> HashMap<String, String> {
        self.cursors
            .lock()
            .map(|cursors| cursors.clone())
            .unwrap_or_default()
    }

    /// Open the command connection. Does nothing when already connected.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.consumer.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<()> {
        if self.connection.is_set() {
            return Ok(());
        }
        let store = connection::open(self.connector.as_ref(), &self.status).await?;
        self.connection.set(store);
        self.status.emit(ConnectionEvent::Ready);
        Ok(())
    }

    /// Ensure a consumer group on every registered pattern's stream and
    /// start consuming.
    ///
    /// Calling again after registering more handlers creates the missing
    /// groups and restarts the loop over the new stream set. With no
    /// registered patterns no loop is started.
    pub async fn listen(&self) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        self.connect_locked().await?;
        let store = self.connection.get()?;

        let streams: Vec<String> = self
            .registry
            .patterns()
            .iter()
            .map(|pattern| self.options.stream_name(pattern))
            .collect();

        if streams.is_empty() {
            info!("No handlers registered, not consuming");
            return Ok(());
        }

        for stream in &streams {
            self.ensure_group(store.as_ref(), stream).await?;
        }

        if let Some(running) = consumer.as_ref() {
            if running.streams == streams {
                debug!("Consumer loop already running");
                return Ok(());
            }
        }
        if let Some(previous) = consumer.take() {
            info!("Restarting consumer loop for new stream set");
            previous.stop().await;
        }

        let reader = connection::open(self.connector.as_ref(), &self.status).await?;
        let consuming = Arc::new(AtomicBool::new(true));
        let worker = Consumer {
            reader: reader.clone(),
            writer: store,
            registry: self.registry.clone(),
            options: self.options.clone(),
            status: self.status.clone(),
            cursors: self.cursors.clone(),
            streams: streams.clone(),
            consuming: consuming.clone(),
        };

        info!(
            group = %self.options.consumer_group,
            consumer = %self.options.consumer_name,
            streams = ?streams,
            "Listening"
        );

        *consumer = Some(ConsumerLoop {
            consuming,
            streams,
            reader,
            handle: tokio::spawn(worker.run()),
        });
        Ok(())
    }

    /// Stop consuming and release connections.
    ///
    /// Waits for the loop to exit, so no handler runs after this returns.
    /// The server can `connect()` and `listen()` again afterwards.
    pub async fn close(&self) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        let mut released = false;
        if let Some(running) = consumer.take() {
            running.stop().await;
            released = true;
        }
        if let Some(store) = self.connection.take() {
            connection::release(store.as_ref()).await;
            released = true;
        }
        if let Ok(mut cursors) = self.cursors.lock() {
            cursors.clear();
        }

        if released {
            self.status.emit(ConnectionEvent::End);
            info!("Server closed");
        } else {
            debug!("Server not connected, nothing to close");
        }
        Ok(())
    }

    async fn ensure_group(&self, store: &dyn LogStore, stream: &str) -> Result<()> {
        let group = &self.options.consumer_group;
        match store.create_group(stream, group).await {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Consumer group created");
                Ok(())
            }
            Err(TransportError::GroupAlreadyExists { .. }) => {
                debug!(stream = %stream, group = %group, "Consumer group exists");
                Ok(())
            }
            Err(e) => {
                error!(stream = %stream, group = %group, error = %e, "Consumer group creation failed");
                Err(e)
            }
        }
    }
}

impl Drop for StreamsServer {
    fn drop(&mut self) {
        if let Some(running) = self.consumer.get_mut().take() {
            running.consuming.store(false, Ordering::SeqCst);
        }
    }
}

/// State owned by the consumer loop task.
struct Consumer {
    reader: Arc<dyn LogStore>,
    writer: Arc<dyn LogStore>,
    registry: Arc<dyn HandlerRegistry>,
    options: Arc<ResolvedOptions>,
    status: Arc<StatusListeners>,
    cursors: Arc<Mutex<HashMap<String, String>>>,
    streams: Vec<String>,
    consuming: Arc<AtomicBool>,
}

impl Consumer {
    async fn run(self) {
        let read = ReadOptions {
            block: self.options.block_timeout,
            count: self.options.batch_size,
        };
        let group = self.options.consumer_group.clone();
        let consumer = self.options.consumer_name.clone();

        while self.consuming.load(Ordering::SeqCst) {
            let batches = match self
                .reader
                .read_group(&group, &consumer, &self.streams, read)
                .await
            {
                Ok(batches) => batches,
                Err(e) => {
                    if !self.consuming.load(Ordering::SeqCst) {
                        break;
                    }
                    connection::pause_after_read_error(
                        &e,
                        &self.status,
                        self.options.retry_delay,
                        &self.streams.join(","),
                    )
                    .await;
                    continue;
                }
            };

            // Claimed entries are finished and acked even when stopping.
            for batch in batches {
                for entry in &batch.entries {
                    self.record_cursor(&batch.stream, &entry.id);
                    let result = self.dispatch(&batch.stream, entry).await;
                    debug!(stream = %batch.stream, id = %entry.id, result = ?result, "Entry dispatched");

                    if let Err(e) = self.reader.ack(&batch.stream, &group, &entry.id).await {
                        warn!(stream = %batch.stream, id = %entry.id, error = %e, "Failed to ack entry");
                    }
                }
            }
        }

        info!(consumer = %consumer, "Consumer loop stopped");
    }

    fn record_cursor(&self, stream: &str, id: &str) {
        if let Ok(mut cursors) = self.cursors.lock() {
            cursors.insert(stream.to_string(), id.to_string());
        }
    }

    async fn dispatch(&self, stream: &str, entry: &StreamEntry) -> DispatchResult {
        let Some(pattern) = naming::pattern_of(&self.options.stream_prefix, stream) else {
            warn!(stream = %stream, "Entry on stream outside prefix");
            return DispatchResult::Rejected;
        };
        let ctx = StreamsContext::new(
            stream,
            &entry.id,
            &self.options.consumer_group,
            &self.options.consumer_name,
        );

        match Packet::decode(&entry.fields) {
            Ok(Packet::Request(request)) => self.handle_request(pattern, request, ctx).await,
            Ok(Packet::Event(event)) => self.handle_event(pattern, event, ctx).await,
            Ok(Packet::Response(response)) => {
                warn!(stream = %stream, id = %response.id, "Response entry on pattern stream, skipping");
                DispatchResult::Rejected
            }
            Err(e) => {
                warn!(stream = %stream, id = %entry.id, error = %e, "Undecodable entry, skipping");
                DispatchResult::Rejected
            }
        }
    }

    async fn handle_request(
        &self,
        pattern: &str,
        request: RequestPacket,
        ctx: StreamsContext,
    ) -> DispatchResult {
        let Some(handler) = self.registry.request_handler(pattern) else {
            warn!(pattern = %pattern, id = %request.id, "No request handler, dropping request");
            return DispatchResult::Unhandled;
        };

        let payload: Value = match request.payload() {
            Ok(payload) => payload,
            Err(e) => {
                let err = match e {
                    TransportError::Serialization(e) => HandlerError::from(e),
                    other => HandlerError::new(other.to_string()),
                };
                self.respond(&request, ResponsePacket::failure(&request.id, &err))
                    .await;
                return DispatchResult::Rejected;
            }
        };

        // Covers the `handle()` call as well as polling.
        let first = AssertUnwindSafe(async move { handler.handle(payload, ctx).next().await })
            .catch_unwind()
            .await;

        let (response, result) = match first {
            Ok(Some(Ok(value))) => (
                ResponsePacket::success(&request.id, &value),
                DispatchResult::Success,
            ),
            Ok(None) => (
                ResponsePacket::success(&request.id, &Value::Null),
                DispatchResult::Success,
            ),
            Ok(Some(Err(err))) => {
                warn!(pattern = %pattern, id = %request.id, error = %err, "Request handler failed");
                (
                    ResponsePacket::failure(&request.id, &err),
                    DispatchResult::HandlerFailed,
                )
            }
            Err(_) => {
                error!(pattern = %pattern, id = %request.id, "Request handler panicked");
                let err = HandlerError::new("request handler panicked");
                (
                    ResponsePacket::failure(&request.id, &err),
                    DispatchResult::HandlerFailed,
                )
            }
        };

        self.respond(&request, response).await;
        result
    }

    /// Append a response to the requester's reply stream.
    async fn respond(&self, request: &RequestPacket, response: ResponsePacket) {
        let fields = Packet::from(response).to_fields();
        if let Err(e) = self
            .writer
            .append(&request.reply_to, &fields, self.options.trim())
            .await
        {
            error!(reply_to = %request.reply_to, id = %request.id, error = %e, "Failed to send response");
            return;
        }

        if let Some(ttl) = self.options.reply_stream_ttl {
            if let Err(e) = self.writer.expire(&request.reply_to, ttl).await {
                warn!(reply_to = %request.reply_to, error = %e, "Failed to set reply stream expiry");
            }
        }
    }

    async fn handle_event(&self, pattern: &str, event: EventPacket, ctx: StreamsContext) -> DispatchResult {
        let handlers = self.registry.event_handlers(pattern);
        if handlers.is_empty() {
            debug!(pattern = %pattern, "No event handler, skipping");
            return DispatchResult::Unhandled;
        }

        let payload: Value = match event.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Undecodable event payload, skipping");
                return DispatchResult::Rejected;
            }
        };

        let mut result = DispatchResult::Success;
        for handler in handlers {
            let outcome =
                AssertUnwindSafe(async { handler.handle(payload.clone(), ctx.clone()).await })
                    .catch_unwind()
                    .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(pattern = %pattern, error = %err, "Event handler failed");
                    result = DispatchResult::HandlerFailed;
                }
                Err(_) => {
                    error!(pattern = %pattern, "Event handler panicked");
                    result = DispatchResult::HandlerFailed;
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests;
