//! Bounded entry channel between a scan operator and an index backend.

use super::IndexEntry;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Consumer side of an index scan, owned by the scan operator.
#[derive(Debug)]
pub struct IndexConnection {
    entries: mpsc::Receiver<Result<IndexEntry>>,
    stop: Arc<watch::Sender<bool>>,
}

/// Producer side of an index scan, handed to [`super::Index::scan3`].
///
/// Dropping the sender closes the connection.
#[derive(Debug, Clone)]
pub struct EntrySender {
    entries: mpsc::Sender<Result<IndexEntry>>,
    stop: Arc<watch::Sender<bool>>,
}

impl IndexConnection {
    /// Create a connection buffering at most `capacity` entries.
    pub fn new(capacity: usize) -> (IndexConnection, EntrySender) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop, _) = watch::channel(false);
        let stop = Arc::new(stop);
        (
            IndexConnection {
                entries: rx,
                stop: stop.clone(),
            },
            EntrySender { entries: tx, stop },
        )
    }

    /// Next entry, a backend error, or `None` once the backend closed.
    pub async fn recv(&mut self) -> Option<Result<IndexEntry>> {
        self.entries.recv().await
    }

    /// Ask the backend to stop producing. Idempotent.
    pub fn send_stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Stop the backend and discard whatever it already buffered.
    pub fn dispose(&mut self) {
        self.send_stop();
        self.entries.close();
        let mut drained = 0usize;
        while self.entries.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "Discarded buffered index entries");
        }
    }
}

impl Drop for IndexConnection {
    fn drop(&mut self) {
        self.send_stop();
    }
}

impl EntrySender {
    /// Deliver an entry. Returns `false` when the consumer stopped or went
    /// away; the backend should then return without sending more.
    pub async fn send(&self, entry: IndexEntry) -> bool {
        self.deliver(Ok(entry)).await
    }

    /// Report a backend failure to the consumer.
    pub async fn error(&self, err: Error) -> bool {
        self.deliver(Err(err)).await
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow() || self.entries.is_closed()
    }

    async fn deliver(&self, item: Result<IndexEntry>) -> bool {
        if self.is_stopped() {
            return false;
        }
        let mut stopped = self.stop.subscribe();
        tokio::select! {
            sent = self.entries.send(item) => sent.is_ok(),
            _ = stopped.wait_for(|stop| *stop) => false,
        }
    }
}
