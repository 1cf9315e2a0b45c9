//! Table of calls waiting for a response, keyed by stream id.
//!
//! Removal ordering: an entry leaves the table only when the read loop
//! observes its response (`take`), when its frame provably never reached
//! the socket (`remove`), or when the connection closes (`drain`). Timed out
//! and cancelled calls are merely marked abandoned so that their stream id
//! stays reserved until the server answers.
//!
//! Each registration gets a [`CallId`]. `abandon` and `remove` only touch the
//! entry if it still belongs to that call, so a caller racing with the read
//! loop can never disturb a later call that reused the same stream id.

use crate::error::ClientError;
use cqlwire_protocol::{RawFrame, StreamId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

pub(crate) type CallResult = Result<RawFrame, ClientError>;

pub(crate) type CallId = u64;

enum Slot {
    Waiting(oneshot::Sender<CallResult>),
    Abandoned,
}

struct Entry {
    call: CallId,
    slot: Slot,
}

/// An entry taken out of the table by the read loop.
pub(crate) enum Taken {
    /// A caller is waiting; hand it the result.
    Waiting(oneshot::Sender<CallResult>),
    /// The caller had already given up.
    Abandoned,
    /// Nothing was ever registered under this id.
    Unregistered,
}

#[derive(Default)]
struct Table {
    calls: HashMap<StreamId, Entry>,
    next_call: CallId,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct InFlight {
    table: Mutex<Table>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a call on `stream`. Fails once the table has been drained.
    pub(crate) fn register(
        &self,
        stream: StreamId,
    ) -> Result<(CallId, oneshot::Receiver<CallResult>), ClientError> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(ClientError::ConnectionClosed);
        }
        table.next_call += 1;
        let call = table.next_call;
        let (tx, rx) = oneshot::channel();
        let entry = Entry {
            call,
            slot: Slot::Waiting(tx),
        };
        if table.calls.insert(stream, entry).is_some() {
            // The allocator hands out each id once, so this is a bookkeeping bug.
            tracing::error!(stream, "stream id registered twice");
        }
        Ok((call, rx))
    }

    /// Removes the entry for a response that just arrived.
    pub(crate) fn take(&self, stream: StreamId) -> Taken {
        match self.table.lock().calls.remove(&stream) {
            Some(Entry {
                slot: Slot::Waiting(tx),
                ..
            }) => Taken::Waiting(tx),
            Some(Entry {
                slot: Slot::Abandoned,
                ..
            }) => Taken::Abandoned,
            None => Taken::Unregistered,
        }
    }

    /// Marks `call` as abandoned, keeping its id reserved.
    pub(crate) fn abandon(&self, stream: StreamId, call: CallId) -> bool {
        let mut table = self.table.lock();
        match table.calls.get_mut(&stream) {
            Some(entry) if entry.call == call && matches!(entry.slot, Slot::Waiting(_)) => {
                entry.slot = Slot::Abandoned;
                true
            }
            _ => false,
        }
    }

    /// Removes `call` whose request was never written.
    ///
    /// Returns `false` if the entry is already gone, in which case whoever
    /// removed it owns releasing the stream id.
    pub(crate) fn remove(&self, stream: StreamId, call: CallId) -> bool {
        let mut table = self.table.lock();
        if table.calls.get(&stream).is_some_and(|entry| entry.call == call) {
            table.calls.remove(&stream);
            true
        } else {
            false
        }
    }

    /// Closes the table and fails every waiting call with `err`.
    ///
    /// Returns the ids of all removed entries, abandoned ones included. A
    /// second drain returns nothing.
    pub(crate) fn drain(&self, err: &ClientError) -> Vec<StreamId> {
        let calls = {
            let mut table = self.table.lock();
            table.closed = true;
            std::mem::take(&mut table.calls)
        };

        let mut ids = Vec::with_capacity(calls.len());
        for (stream, entry) in calls {
            if let Slot::Waiting(tx) = entry.slot {
                let _ = tx.send(Err(err.clone()));
            }
            ids.push(stream);
        }
        ids
    }

    /// Number of registered calls, abandoned ones included.
    pub(crate) fn len(&self) -> usize {
        self.table.lock().calls.len()
    }

    #[cfg(test)]
    pub(crate) fn is_abandoned(&self, stream: StreamId) -> bool {
        matches!(
            self.table.lock().calls.get(&stream),
            Some(Entry {
                slot: Slot::Abandoned,
                ..
            })
        )
    }
}
