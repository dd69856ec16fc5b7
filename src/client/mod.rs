//! Producing side of the transport.
//!
//! A `StreamsClient` appends events and requests to pattern streams. Each
//! client owns a private reply stream, `{prefix}:reply:{instance id}`, which
//! a background loop reads from the beginning and routes to waiting callers
//! by correlation id.

mod routing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{ResolvedOptions, StreamsOptions};
use crate::connection::{self, ConnectionSlot};
use crate::error::Result;
use crate::naming;
use crate::packet::{EventPacket, Packet, RequestPacket};
use crate::pattern::Pattern;
use crate::status::{ConnectionEvent, ConnectionEventKind, StatusListeners};
use crate::store::{Connector, LogStore, ReadOptions, FROM_START};

pub use self::routing::ReplyStream;
use self::routing::{Delivery, RoutingTable};

/// Background reply loop handle.
struct ReplyLoop {
    listening: Arc<AtomicBool>,
    reader: Arc<dyn LogStore>,
    handle: JoinHandle<()>,
}

impl ReplyLoop {
    async fn stop(self) {
        self.listening.store(false, Ordering::SeqCst);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Reply loop terminated abnormally");
        }
        connection::release(self.reader.as_ref()).await;
    }
}

/// Redis Streams client.
pub struct StreamsClient {
    options: Arc<ResolvedOptions>,
    connector: Arc<dyn Connector>,
    reply_stream: String,
    routing: Arc<RoutingTable>,
    status: Arc<StatusListeners>,
    connection: ConnectionSlot,
    reply_loop: tokio::sync::Mutex<Option<ReplyLoop>>,
}

impl StreamsClient {
    pub fn new(options: StreamsOptions, connector: Arc<dyn Connector>) -> Self {
        let options = options.resolve();
        let instance_id = Uuid::new_v4().simple().to_string();
        let reply_stream = naming::reply_stream_name(&options.stream_prefix, &instance_id);

        Self {
            options: Arc::new(options),
            connector,
            reply_stream,
            routing: Arc::new(RoutingTable::default()),
            status: Arc::new(StatusListeners::new()),
            connection: ConnectionSlot::default(),
            reply_loop: tokio::sync::Mutex::new(None),
        }
    }

    /// Client connecting to the Redis instance named by `options`.
    #[cfg(feature = "redis")]
    pub fn redis(options: StreamsOptions) -> Self {
        let resolved = options.resolve();
        let connector = crate::store::RedisConnector::new(&resolved.url, resolved.database);
        Self::new(options, Arc::new(connector))
    }

    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    /// This client's private reply stream.
    pub fn reply_stream(&self) -> &str {
        &self.reply_stream
    }

    /// Stream name a pattern is published on.
    pub fn stream_name(&self, pattern: impl Into<Pattern>) -> String {
        self.options.stream_name(&pattern.into().canonicalize())
    }

    /// Requests still waiting for a final response.
    pub fn pending_requests(&self) -> usize {
        self.routing.len()
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

    /// Open connections and start the reply loop.
    ///
    /// Does nothing when already connected. `emit`, `send` and `request`
    /// connect on first use.
    pub async fn connect(&self) -> Result<()> {
        let mut reply_loop = self.reply_loop.lock().await;
        if reply_loop.is_some() {
            return Ok(());
        }

        let store = connection::open(self.connector.as_ref(), &self.status).await?;
        let reader = match connection::open(self.connector.as_ref(), &self.status).await {
            Ok(reader) => reader,
            Err(e) => {
                connection::release(store.as_ref()).await;
                return Err(e);
            }
        };

        let listening = Arc::new(AtomicBool::new(true));
        let listener = ReplyListener {
            reader: reader.clone(),
            reply_stream: self.reply_stream.clone(),
            routing: self.routing.clone(),
            options: self.options.clone(),
            status: self.status.clone(),
            listening: listening.clone(),
        };
        *reply_loop = Some(ReplyLoop {
            listening,
            reader,
            handle: tokio::spawn(listener.run()),
        });

        self.connection.set(store);
        self.status.emit(ConnectionEvent::Ready);
        info!(reply_stream = %self.reply_stream, "Client connected");
        Ok(())
    }

    /// Publish a fire-and-forget event. Returns the appended entry id.
    pub async fn emit<T>(&self, pattern: impl Into<Pattern>, payload: &T) -> Result<String>
    where
        T: Serialize + ?Sized,
    {
        let stream = self.stream_name(pattern);
        let packet = Packet::from(EventPacket::new(payload)?);
        let store = self.command_connection().await?;

        let id = store
            .append(&stream, &packet.to_fields(), self.options.trim())
            .await?;
        debug!(stream = %stream, id = %id, "Event emitted");
        Ok(id)
    }

    /// Send a request and stream its responses.
    ///
    /// The request is registered before it is appended, so a response can
    /// never arrive unrouted. There is no implicit timeout; wrap the stream
    /// in `tokio::time::timeout` to bound the wait.
    pub async fn request<T>(&self, pattern: impl Into<Pattern>, payload: &T) -> Result<ReplyStream>
    where
        T: Serialize + ?Sized,
    {
        let stream = self.stream_name(pattern);
        let request = RequestPacket::new(&self.reply_stream, payload)?;
        let store = self.command_connection().await?;

        let id = request.id.clone();
        let rx = self.routing.register(&id);
        let replies = ReplyStream::new(id.clone(), rx, Arc::downgrade(&self.routing));

        let fields = Packet::from(request).to_fields();
        if let Err(e) = store.append(&stream, &fields, self.options.trim()).await {
            self.routing.remove(&id);
            return Err(e);
        }
        debug!(stream = %stream, id = %id, "Request sent");
        Ok(replies)
    }

    /// Send a request and wait for its first response.
    pub async fn send<T, R>(&self, pattern: impl Into<Pattern>, payload: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.request(pattern, payload).await?.first().await
    }

    /// Stop the reply loop and release connections.
    ///
    /// Pending requests fail with `Closed`. The reply stream is deleted. The
    /// client can connect again afterwards.
    pub async fn close(&self) -> Result<()> {
        let mut reply_loop = self.reply_loop.lock().await;
        if let Some(running) = reply_loop.take() {
            running.stop().await;
        }

        let failed = self.routing.fail_all();
        if failed > 0 {
            info!(count = failed, "Failed pending requests on close");
        }

        if let Some(store) = self.connection.take() {
            if let Err(e) = store.delete(&self.reply_stream).await {
                debug!(reply_stream = %self.reply_stream, error = %e, "Could not delete reply stream");
            }
            connection::release(store.as_ref()).await;
        }

        self.status.emit(ConnectionEvent::End);
        info!("Client closed");
        Ok(())
    }

    async fn command_connection(&self) -> Result<Arc<dyn LogStore>> {
        if let Ok(store) = self.connection.get() {
            return Ok(store);
        }
        self.connect().await?;
        self.connection.get()
    }
}

/// State owned by the reply loop task.
struct ReplyListener {
    reader: Arc<dyn LogStore>,
    reply_stream: String,
    routing: Arc<RoutingTable>,
    options: Arc<ResolvedOptions>,
    status: Arc<StatusListeners>,
    listening: Arc<AtomicBool>,
}

impl ReplyListener {
    async fn run(self) {
        let read = ReadOptions {
            block: self.options.block_timeout,
            count: self.options.batch_size,
        };
        // The stream is private, so reading from the start cannot pick up
        // someone else's responses.
        let mut last_id = FROM_START.to_string();

        while self.listening.load(Ordering::SeqCst) {
            let cursor = [(self.reply_stream.clone(), last_id.clone())];
            let batches = match self.reader.read(&cursor, read).await {
                Ok(batches) => batches,
                Err(e) => {
                    if !self.listening.load(Ordering::SeqCst) {
                        break;
                    }
                    connection::pause_after_read_error(
                        &e,
                        &self.status,
                        self.options.retry_delay,
                        &self.reply_stream,
                    )
                    .await;
                    continue;
                }
            };

            for entry in batches.into_iter().flat_map(|batch| batch.entries) {
                last_id = entry.id.clone();
                self.route(&entry.id, Packet::decode(&entry.fields));
            }
        }

        debug!(reply_stream = %self.reply_stream, "Reply loop stopped");
    }

    fn route(&self, entry_id: &str, packet: Result<Packet>) {
        let response = match packet {
            Ok(Packet::Response(response)) => response,
            Ok(_) => {
                debug!(id = %entry_id, "Ignoring non-response entry on reply stream");
                return;
            }
            Err(e) => {
                debug!(id = %entry_id, error = %e, "Ignoring undecodable reply entry");
                return;
            }
        };

        let id = response.id.clone();
        match self.routing.deliver(response) {
            Delivery::Unroutable => debug!(id = %id, "No pending request for response"),
            delivery => debug!(id = %id, delivery = ?delivery, "Response routed"),
        }
    }
}

impl Drop for StreamsClient {
    fn drop(&mut self) {
        if let Ok(mut reply_loop) = self.reply_loop.try_lock() {
            if let Some(running) = reply_loop.as_ref() {
                running.listening.store(false, Ordering::SeqCst);
            }
            reply_loop.take();
        }
    }
}
