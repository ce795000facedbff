//! Revisioned store with resumable watches.
//!
//! Every write bumps a single store-wide revision. Values are persisted as
//! `[revision: u64 BE][payload]` so reads report the revision an object was
//! last written at. A bounded in-memory history lets watchers resume from an
//! older revision; anything older than the history is reported as compacted.

use crate::{KVStore, Result, StorageError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

/// Reserved key holding the last assigned revision. No resource prefix
/// starts with '/'.
const REVISION_KEY: &[u8] = b"/berth/revision";

/// Configuration for the revisioned store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Events retained for watch resume
    pub history_limit: usize,
    /// Capacity of the live event broadcast channel
    pub watch_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_limit: 4096,
            watch_buffer: 4096,
        }
    }
}

/// A stored value and the revision it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub revision: u64,
    pub value: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Put { created: bool },
    Delete,
}

/// A single change, as delivered to watchers
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub revision: u64,
    pub key: String,
    pub action: EventAction,
    /// New value for puts, last value for deletes
    pub value: Option<Bytes>,
}

struct StoreInner {
    revision: u64,
    /// Oldest revision a watch may resume from
    compacted: u64,
    history: VecDeque<StoredEvent>,
    events: broadcast::Sender<StoredEvent>,
}

/// Revisioned, watchable store over any `KVStore`
pub struct RevisionedStore {
    kv: Arc<dyn KVStore>,
    config: StoreConfig,
    inner: Mutex<StoreInner>,
}

impl RevisionedStore {
    /// Open the store, continuing from the last persisted revision. History
    /// does not survive a restart, so everything up to that revision counts
    /// as compacted.
    pub fn new(kv: Arc<dyn KVStore>, config: StoreConfig) -> Result<Self> {
        let revision = match kv.get(REVISION_KEY)? {
            Some(raw) => decode_revision(&raw)?,
            None => 0,
        };

        info!("Revisioned store opened at revision {}", revision);

        let (events, _) = broadcast::channel(config.watch_buffer.max(1));

        Ok(Self {
            kv,
            config,
            inner: Mutex::new(StoreInner {
                revision,
                compacted: revision,
                history: VecDeque::new(),
                events,
            }),
        })
    }

    /// Current store revision
    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// Oldest revision a watch can resume from
    pub fn compacted_revision(&self) -> u64 {
        self.inner.lock().compacted
    }

    pub fn get(&self, key: &str) -> Result<Option<Versioned>> {
        match self.kv.get(key.as_bytes())? {
            Some(raw) => Ok(Some(decode_envelope(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write a value, returning the revision assigned to the write
    pub fn put(&self, key: &str, value: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let revision = inner.revision + 1;

        let mut txn = self.kv.transaction()?;
        let created = txn.get(key.as_bytes())?.is_none();
        txn.put(key.as_bytes(), &encode_envelope(revision, value))?;
        txn.put(REVISION_KEY, &revision.to_be_bytes())?;
        txn.commit()?;

        inner.revision = revision;
        debug!("put {} at revision {}", key, revision);

        self.record(
            &mut inner,
            StoredEvent {
                revision,
                key: key.to_string(),
                action: EventAction::Put { created },
                value: Some(Bytes::copy_from_slice(value)),
            },
        );

        Ok(revision)
    }

    /// Delete a key. Returns the revision of the delete, or `None` when the
    /// key did not exist (no revision is consumed then).
    pub fn delete(&self, key: &str) -> Result<Option<u64>> {
        let mut inner = self.inner.lock();

        let mut txn = self.kv.transaction()?;
        let previous = match txn.get(key.as_bytes())? {
            Some(raw) => decode_envelope(&raw)?,
            None => return Ok(None),
        };

        let revision = inner.revision + 1;
        txn.delete(key.as_bytes())?;
        txn.put(REVISION_KEY, &revision.to_be_bytes())?;
        txn.commit()?;

        inner.revision = revision;
        debug!("delete {} at revision {}", key, revision);

        self.record(
            &mut inner,
            StoredEvent {
                revision,
                key: key.to_string(),
                action: EventAction::Delete,
                value: Some(previous.value),
            },
        );

        Ok(Some(revision))
    }

    /// List every key under `prefix` together with the store revision the
    /// listing is consistent with.
    pub fn list(&self, prefix: &str) -> Result<(Vec<(String, Versioned)>, u64)> {
        // Writers hold the lock, so the scan cannot interleave with a write
        let inner = self.inner.lock();

        let mut items = Vec::new();
        for (key, raw) in self.kv.scan(prefix.as_bytes())? {
            let key = String::from_utf8_lossy(&key).into_owned();
            items.push((key, decode_envelope(&raw)?));
        }

        Ok((items, inner.revision))
    }

    /// Watch every change under `prefix` with a revision greater than
    /// `from_revision`.
    pub fn watch(&self, prefix: &str, from_revision: u64) -> Result<Watcher> {
        let inner = self.inner.lock();

        if from_revision < inner.compacted {
            return Err(StorageError::Compacted {
                requested: from_revision,
                compacted: inner.compacted,
            });
        }

        // Subscribe under the lock: the backlog ends exactly where the live
        // stream begins.
        let live = inner.events.subscribe();
        let backlog = inner
            .history
            .iter()
            .filter(|e| e.revision > from_revision && e.key.starts_with(prefix))
            .cloned()
            .collect();

        debug!(
            "watch on {:?} from revision {} (store at {})",
            prefix, from_revision, inner.revision
        );

        Ok(Watcher {
            prefix: prefix.to_string(),
            backlog,
            live,
            last_revision: from_revision,
        })
    }

    /// Drop history up to and including `revision`
    pub fn compact(&self, revision: u64) {
        let mut inner = self.inner.lock();
        let revision = revision.min(inner.revision);

        while inner
            .history
            .front()
            .is_some_and(|e| e.revision <= revision)
        {
            inner.history.pop_front();
        }
        inner.compacted = inner.compacted.max(revision);

        info!("Compacted store history up to revision {}", inner.compacted);
    }

    /// Close every open watch stream. Watchers see the end of their stream
    /// and must resume.
    pub fn disconnect_watchers(&self) {
        let mut inner = self.inner.lock();
        let (events, _) = broadcast::channel(self.config.watch_buffer.max(1));
        inner.events = events;
        info!("Disconnected all watchers at revision {}", inner.revision);
    }

    fn record(&self, inner: &mut StoreInner, event: StoredEvent) {
        inner.history.push_back(event.clone());
        while inner.history.len() > self.config.history_limit {
            if let Some(dropped) = inner.history.pop_front() {
                inner.compacted = dropped.revision;
            }
        }

        // No receivers is fine
        let _ = inner.events.send(event);
    }
}

/// Stream of changes under one prefix, in revision order
pub struct Watcher {
    prefix: String,
    backlog: VecDeque<StoredEvent>,
    live: broadcast::Receiver<StoredEvent>,
    last_revision: u64,
}

impl Watcher {
    /// Next change. `Ok(None)` means the backend closed the stream.
    pub async fn next(&mut self) -> Result<Option<StoredEvent>> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_revision = event.revision;
            return Ok(Some(event));
        }

        loop {
            match self.live.recv().await {
                Ok(event) => {
                    if event.revision <= self.last_revision || !event.key.starts_with(&self.prefix)
                    {
                        continue;
                    }
                    self.last_revision = event.revision;
                    return Ok(Some(event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    return Err(StorageError::WatchLagged {
                        skipped,
                        last_revision: self.last_revision,
                    })
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }

    /// Revision of the last delivered event (or the start revision)
    pub fn last_revision(&self) -> u64 {
        self.last_revision
    }
}

fn encode_envelope(revision: u64, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + value.len());
    buf.extend_from_slice(&revision.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

fn decode_envelope(raw: &Bytes) -> Result<Versioned> {
    if raw.len() < 8 {
        return Err(StorageError::serialization_error(
            format!("stored value too short for a revision header ({} bytes)", raw.len()),
            None,
        ));
    }
    Ok(Versioned {
        revision: decode_revision(&raw[..8])?,
        value: raw.slice(8..),
    })
}

fn decode_revision(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| {
        StorageError::serialization_error("revision header must be 8 bytes", None)
    })?;
    Ok(u64::from_be_bytes(bytes))
}
