//! Redis Streams log store.
//!
//! Maps the `LogStore` operations onto Redis stream commands:
//! `XADD ... MAXLEN ~ n`, `XREAD BLOCK`, `XREADGROUP ... >`,
//! `XGROUP CREATE ... $ MKSTREAM`, `XACK`, `DEL` and `EXPIRE`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, IntoConnectionInfo, RedisResult, Value};
use tracing::{debug, info, warn};

use super::{Connector, LogStore, ReadOptions, StreamBatch, StreamEntry, UNDELIVERED};
use crate::error::{Result, TransportError};
use crate::packet::FieldMap;

/// Error code Redis returns when a consumer group already exists.
const BUSYGROUP: &str = "BUSYGROUP";

/// Redis log store.
///
/// Wraps a `ConnectionManager`, which reconnects transparently after
/// connection loss.
pub struct RedisLogStore {
    conn: ConnectionManager,
}

impl RedisLogStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `database` - Logical database, overriding the one in `url`
    pub async fn new(url: &str, database: Option<i64>) -> Result<Self> {
        let mut info = url.into_connection_info()?;
        if let Some(db) = database {
            info.redis.db = db;
        }
        let client = Client::open(info)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, database = ?database, "Connected to Redis");

        Ok(Self { conn })
    }

    /// The native connection, for commands this crate does not wrap.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn into_batches(reply: Option<StreamReadReply>) -> Vec<StreamBatch> {
        let Some(reply) = reply else {
            return Vec::new();
        };

        reply
            .keys
            .into_iter()
            .map(|key| StreamBatch {
                entries: key
                    .ids
                    .into_iter()
                    .map(|id| StreamEntry {
                        fields: Self::to_field_map(&key.key, &id.id, id.map),
                        id: id.id,
                    })
                    .collect(),
                stream: key.key,
            })
            .filter(|batch| !batch.entries.is_empty())
            .collect()
    }

    fn to_field_map(stream: &str, id: &str, map: HashMap<String, Value>) -> FieldMap {
        map.into_iter()
            .filter_map(|(field, value)| match redis::from_redis_value::<String>(&value) {
                Ok(text) => Some((field, text)),
                Err(e) => {
                    warn!(stream = %stream, id = %id, field = %field, error = %e, "Skipping non-text field");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = match max_len {
            Some(n) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(n), "*", fields)
                    .await?
            }
            None => conn.xadd(stream, "*", fields).await?,
        };
        Ok(id)
    }

    async fn read(
        &self,
        streams: &[(String, String)],
        options: ReadOptions,
    ) -> Result<Vec<StreamBatch>> {
        let keys: Vec<&str> = streams.iter().map(|(k, _)| k.as_str()).collect();
        let ids: Vec<&str> = streams.iter().map(|(_, id)| id.as_str()).collect();
        let opts = StreamReadOptions::default()
            .block(options.block.as_millis() as usize)
            .count(options.count);

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn.xread_options(&keys, &ids, &opts).await?;
        Ok(Self::into_batches(reply))
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        options: ReadOptions,
    ) -> Result<Vec<StreamBatch>> {
        let ids: Vec<&str> = streams.iter().map(|_| UNDELIVERED).collect();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .block(options.block.as_millis() as usize)
            .count(options.count);

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn.xread_options(streams, &ids, &opts).await?;
        Ok(Self::into_batches(reply))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;

        match result {
            Ok(()) => {
                debug!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some(BUSYGROUP) => Err(TransportError::GroupAlreadyExists {
                stream: stream.to_string(),
                group: group.to_string(),
            }),
            Err(e) => Err(TransportError::GroupCreation {
                stream: stream.to_string(),
                group: group.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl.as_secs().max(1) as i64).await?;
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        // The connection closes when the last handle is dropped.
        debug!("Releasing Redis connection");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Opens a fresh `RedisLogStore` per call.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    url: String,
    database: Option<i64>,
}

impl RedisConnector {
    pub fn new(url: impl Into<String>, database: Option<i64>) -> Self {
        Self {
            url: url.into(),
            database,
        }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn LogStore>> {
        let store = RedisLogStore::new(&self.url, self.database).await?;
        Ok(Arc::new(store))
    }

    fn describe(&self) -> String {
        match self.database {
            Some(db) => format!("{} (db {})", self.url, db),
            None => self.url.clone(),
        }
    }
}
