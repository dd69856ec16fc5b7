//! Durable log store boundary.
//!
//! This module contains:
//! - `LogStore` trait: the append-only stream operations the transport needs
//! - `Connector` trait: opens one store connection per caller
//! - Implementations: Redis Streams, in-memory

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::packet::FieldMap;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryLogStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisConnector, RedisLogStore};

/// Read position meaning "entries never delivered to this group".
pub const UNDELIVERED: &str = ">";
/// Read position meaning "from the beginning of the stream".
pub const FROM_START: &str = "0";

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned, monotonically increasing id.
    pub id: String,
    pub fields: FieldMap,
}

/// Entries read from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    pub stream: String,
    pub entries: Vec<StreamEntry>,
}

/// Bounds of a blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Maximum time to wait for new entries.
    pub block: Duration,
    /// Maximum entries returned per stream.
    pub count: usize,
}

/// Operations consumed from the log store.
///
/// Implementations:
/// - `RedisLogStore`: Redis Streams (`XADD`, `XREAD`, `XREADGROUP`, ...)
/// - `MemoryLogStore`: in-process store for tests and local development
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append an entry, trimming the stream to approximately `max_len`
    /// entries when given. Returns the new entry id.
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> Result<String>;

    /// Blocking read of entries after the given id on each `(stream, id)`.
    ///
    /// Returns an empty list when `options.block` elapses without entries.
    async fn read(
        &self,
        streams: &[(String, String)],
        options: ReadOptions,
    ) -> Result<Vec<StreamBatch>>;

    /// Blocking consumer-group read of entries never delivered to `group`.
    ///
    /// Each returned entry is claimed by `consumer` and stays pending until
    /// acknowledged.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        options: ReadOptions,
    ) -> Result<Vec<StreamBatch>>;

    /// Create `group` on `stream` starting after the current last entry,
    /// creating the stream if needed.
    ///
    /// Fails with `GroupAlreadyExists` if the group is present.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Acknowledge an entry for a group.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Set an expiry on a key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Release the connection.
    async fn quit(&self) -> Result<()>;

    /// Access the concrete store, e.g. to reach the native connection.
    fn as_any(&self) -> &dyn Any;
}

/// Opens store connections.
///
/// Client and server call `connect` once for command traffic and once for
/// their background loop, so blocking reads never stall appends.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn LogStore>>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}
