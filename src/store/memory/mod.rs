//! In-memory log store.
//!
//! Mirrors the Redis Streams semantics the transport relies on: monotonic
//! `ms-seq` entry ids, approximate-length trimming (exact here), consumer
//! groups with a last-delivered cursor and a pending-entries list, blocking
//! reads and key expiry. All operations on one store share a single lock,
//! which gives consumer groups their exactly-one-claimant guarantee.
//!
//! Cloning the store shares the underlying data, so every "connection" opened
//! through [`Connector`] sees the same streams.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{Connector, LogStore, ReadOptions, StreamBatch, StreamEntry};
use crate::error::{Result, TransportError};
use crate::packet::FieldMap;

/// Stream entry id (`{millis}-{seq}`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TransportError::Connection(format!("Invalid stream ID '{s}'"));
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    /// Delivered but unacknowledged entries, by claiming consumer.
    pending: BTreeMap<EntryId, String>,
}

#[derive(Default)]
struct StreamLog {
    entries: VecDeque<(EntryId, FieldMap)>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
    expires_at: Option<Instant>,
}

impl StreamLog {
    fn after(&self, from: EntryId, count: usize) -> Vec<StreamEntry> {
        self.entries
            .iter()
            .filter(|(id, _)| *id > from)
            .take(count)
            .map(|(id, fields)| StreamEntry {
                id: id.to_string(),
                fields: fields.clone(),
            })
            .collect()
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamLog>,
}

impl State {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.streams
            .retain(|_, log| log.expires_at.map_or(true, |at| at > now));
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
    fail_reads: AtomicUsize,
    fail_appends: AtomicBool,
    open_connections: AtomicUsize,
}

/// In-process log store with consumer groups.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    shared: Arc<Shared>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| TransportError::Connection("memory store poisoned".to_string()))?;
        state.purge_expired();
        Ok(state)
    }

    fn check_read_fault(&self) -> Result<()> {
        let injected = self
            .shared
            .fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(TransportError::Connection(
                "injected read failure".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }

    /// Fail the next `n` reads (plain or group) with a connection error.
    pub fn fail_next_reads(&self, n: usize) {
        self.shared.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Make every append fail with a connection error while set.
    pub fn set_fail_on_append(&self, fail: bool) {
        self.shared.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Connections opened through [`Connector`] and not yet quit.
    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::SeqCst)
    }

    /// Number of entries in a stream (`XLEN`).
    pub fn len(&self, stream: &str) -> usize {
        self.state()
            .map(|s| s.streams.get(stream).map_or(0, |log| log.entries.len()))
            .unwrap_or(0)
    }

    /// All entries in a stream, oldest first (`XRANGE - +`).
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.state()
            .map(|s| {
                s.streams
                    .get(stream)
                    .map(|log| log.after(EntryId::default(), usize::MAX))
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Whether a key exists.
    pub fn exists(&self, key: &str) -> bool {
        self.state()
            .map(|s| s.streams.contains_key(key))
            .unwrap_or(false)
    }

    /// Whether `group` exists on `stream`.
    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        self.state()
            .map(|s| {
                s.streams
                    .get(stream)
                    .is_some_and(|log| log.groups.contains_key(group))
            })
            .unwrap_or(false)
    }

    /// Delivered-but-unacknowledged entries for a group (`XPENDING` count).
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state()
            .map(|s| {
                s.streams
                    .get(stream)
                    .and_then(|log| log.groups.get(group))
                    .map_or(0, |g| g.pending.len())
            })
            .unwrap_or(0)
    }

    fn collect_plain(
        &self,
        streams: &[(String, String)],
        count: usize,
    ) -> Result<Vec<StreamBatch>> {
        let state = self.state()?;
        let mut batches = Vec::new();
        for (stream, from) in streams {
            let Some(log) = state.streams.get(stream) else {
                continue;
            };
            let entries = log.after(from.parse()?, count);
            if !entries.is_empty() {
                batches.push(StreamBatch {
                    stream: stream.clone(),
                    entries,
                });
            }
        }
        Ok(batches)
    }

    fn collect_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamBatch>> {
        let mut state = self.state()?;
        let mut batches = Vec::new();
        for stream in streams {
            let log = state
                .streams
                .get(stream)
                .filter(|log| log.groups.contains_key(group))
                .ok_or_else(|| {
                    TransportError::Connection(format!(
                        "NOGROUP No such key '{stream}' or consumer group '{group}'"
                    ))
                })?;
            let from = log
                .groups
                .get(group)
                .map(|g| g.last_delivered)
                .unwrap_or_default();
            let entries = log.after(from, count);
            if entries.is_empty() {
                continue;
            }

            if let Some(g) = state
                .streams
                .get_mut(stream)
                .and_then(|log| log.groups.get_mut(group))
            {
                for entry in &entries {
                    let id: EntryId = entry.id.parse()?;
                    g.pending.insert(id, consumer.to_string());
                    g.last_delivered = id;
                }
            }

            batches.push(StreamBatch {
                stream: stream.clone(),
                entries,
            });
        }
        Ok(batches)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> Result<String> {
        if self.shared.fail_appends.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(
                "injected append failure".to_string(),
            ));
        }

        let id = {
            let mut state = self.state()?;
            let log = state.streams.entry(stream.to_string()).or_default();

            let ms = now_ms().max(log.last_id.ms);
            let id = if ms == log.last_id.ms {
                EntryId {
                    ms,
                    seq: log.last_id.seq + 1,
                }
            } else {
                EntryId { ms, seq: 0 }
            };

            let map: FieldMap = fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            log.entries.push_back((id, map));
            log.last_id = id;

            if let Some(max_len) = max_len {
                while log.entries.len() > max_len {
                    log.entries.pop_front();
                }
            }
            id
        };

        self.shared.appended.notify_waiters();
        Ok(id.to_string())
    }

    async fn read(
        &self,
        streams: &[(String, String)],
        options: ReadOptions,
    ) -> Result<Vec<StreamBatch>> {
        self.check_read_fault()?;
        let deadline = Instant::now() + options.block;
        loop {
            let notified = self.shared.appended.notified();
            let batches = self.collect_plain(streams, options.count)?;
            if !batches.is_empty() {
                return Ok(batches);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        options: ReadOptions,
    ) -> Result<Vec<StreamBatch>> {
        self.check_read_fault()?;
        let deadline = Instant::now() + options.block;
        loop {
            let notified = self.shared.appended.notified();
            let batches = self.collect_group(group, consumer, streams, options.count)?;
            if !batches.is_empty() {
                return Ok(batches);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state()?;
        let log = state.streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Err(TransportError::GroupAlreadyExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let last_delivered = log.last_id;
        log.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        debug!(stream = %stream, group = %group, "Created consumer group");
        Ok(())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let id: EntryId = id.parse()?;
        let mut state = self.state()?;
        if let Some(g) = state
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
        {
            g.pending.remove(&id);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state()?.streams.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state()?;
        if let Some(log) = state.streams.get_mut(key) {
            log.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        let _ = self
            .shared
            .open_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl Connector for MemoryLogStore {
    async fn connect(&self) -> Result<Arc<dyn LogStore>> {
        self.shared.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
