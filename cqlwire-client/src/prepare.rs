//! Single-flight prepared statement cache.
//!
//! Concurrent callers asking for the same statement share one PREPARE
//! round-trip. The round-trip runs in its own task, so it completes and
//! populates the entry even if every caller stops waiting. Failed prepares
//! are evicted so a later caller can try again.

use crate::error::ClientError;
use bytes::Bytes;
use cqlwire_protocol::{PreparedMetadata, PreparedResult, QueryParameters, Request, ResultMetadata};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Default number of prepared statements kept per cache.
pub const DEFAULT_PREPARED_CACHE_SIZE: usize = 1000;

/// Identifies a prepared statement on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub addr: SocketAddr,
    pub keyspace: Option<String>,
    pub statement: String,
}

/// A statement prepared on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub id: Bytes,
    pub result_metadata_id: Option<Bytes>,
    pub metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

impl PreparedStatement {
    /// Builds the EXECUTE request for this statement.
    pub fn execute(&self, params: QueryParameters) -> Request {
        Request::Execute {
            id: self.id.clone(),
            result_metadata_id: self.result_metadata_id.clone(),
            params,
        }
    }
}

impl From<PreparedResult> for PreparedStatement {
    fn from(result: PreparedResult) -> Self {
        Self {
            id: result.id,
            result_metadata_id: result.result_metadata_id,
            metadata: result.metadata,
            result_metadata: result.result_metadata,
        }
    }
}

pub type PrepareOutcome = Result<Arc<PreparedStatement>, ClientError>;

type Slot = watch::Receiver<Option<PrepareOutcome>>;

struct Entry {
    slot: Slot,
    last_used: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<StatementKey, Entry>,
    clock: u64,
}

/// Bounded single-flight cache of prepared statements.
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct PreparedCache {
    entries: Arc<Mutex<Entries>>,
    capacity: usize,
}

impl Default for PreparedCache {
    fn default() -> Self {
        Self::new(DEFAULT_PREPARED_CACHE_SIZE)
    }
}

impl PreparedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    /// Returns the cached outcome for `key`, running `prepare` if there is none.
    ///
    /// Only the first caller for a key runs `prepare`; everyone else waits
    /// for its outcome.
    pub async fn get_or_prepare<F, Fut>(&self, key: StatementKey, prepare: F) -> PrepareOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PrepareOutcome> + Send + 'static,
    {
        let (mut slot, leader) = self.lookup(&key);

        if let Some(tx) = leader {
            let round_trip = prepare();
            let cache = self.clone();
            let key = key.clone();
            let watched = slot.clone();
            tokio::spawn(async move {
                let outcome = round_trip.await;
                if let Err(err) = &outcome {
                    tracing::debug!(statement = %key.statement, error = %err, "prepare failed");
                    cache.evict_slot(&key, &watched);
                }
                let _ = tx.send(Some(outcome));
            });
        }

        let outcome = match slot.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(ClientError::ConnectionClosed))
    }

    /// Finds or creates the entry; the creator also gets the sender.
    fn lookup(&self, key: &StatementKey) -> (Slot, Option<watch::Sender<Option<PrepareOutcome>>>) {
        let mut entries = self.entries.lock();
        entries.clock += 1;
        let now = entries.clock;

        if let Some(entry) = entries.map.get_mut(key) {
            entry.last_used = now;
            return (entry.slot.clone(), None);
        }

        let (tx, rx) = watch::channel(None);
        entries.map.insert(
            key.clone(),
            Entry {
                slot: rx.clone(),
                last_used: now,
            },
        );
        if entries.map.len() > self.capacity {
            let oldest = entries
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.map.remove(&oldest);
            }
        }
        (rx, Some(tx))
    }

    /// Removes `key` only if it still refers to `slot`.
    fn evict_slot(&self, key: &StatementKey, slot: &Slot) {
        let mut entries = self.entries.lock();
        if entries
            .map
            .get(key)
            .is_some_and(|entry| entry.slot.same_channel(slot))
        {
            entries.map.remove(key);
        }
    }

    /// Drops `key` from the cache.
    pub fn evict(&self, key: &StatementKey) -> bool {
        self.entries.lock().map.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
