//! Log Fan-out (`spec.md` §4.7): persist every inbound `LOG_CHUNK` and
//! multiplex it to live subscribers.
//!
//! Grounded on `buildit-api::ws::Broadcaster` (a `tokio::sync::broadcast`
//! channel behind an `Arc`), generalized from "one broadcaster for all
//! events" to "one broadcaster per job id", created lazily and dropped
//! once the job seals and its last subscriber disconnects.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use cinch_core::log::LogChunk;
use cinch_core::storage::Storage;
use cinch_core::{JobId, Result};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum LogEvent {
    Chunk(LogChunk),
    Sealed,
}

struct JobChannel {
    tx: broadcast::Sender<LogEvent>,
}

#[derive(Default)]
pub struct LogFanout {
    channels: RwLock<HashMap<JobId, JobChannel>>,
}

impl LogFanout {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, job_id: JobId) -> broadcast::Sender<LogEvent> {
        if let Some(chan) = self.channels.read().await.get(&job_id) {
            return chan.tx.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(job_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                JobChannel { tx }
            })
            .tx
            .clone()
    }

    /// Persist then broadcast an inbound chunk (`spec.md` §4.7 step 1-2).
    /// Idempotency on `(job_id, seq)` is `Storage`'s responsibility.
    pub async fn publish(&self, storage: &Arc<dyn Storage>, chunk: LogChunk) -> Result<()> {
        storage.append_log_chunk(chunk.clone()).await?;
        let tx = self.sender_for(chunk.job_id).await;
        let _ = tx.send(LogEvent::Chunk(chunk));
        Ok(())
    }

    /// A new subscriber's live feed, created lazily for jobs with no
    /// prior subscriber. Callers wanting replay should first fetch
    /// persisted chunks via `Storage::list_log_chunks`, then subscribe
    /// here for anything after that point (`spec.md` §4.7).
    pub async fn subscribe(&self, job_id: JobId) -> broadcast::Receiver<LogEvent> {
        self.sender_for(job_id).await.subscribe()
    }

    /// Seal the job's log: broadcast a final `Sealed` marker and drop
    /// the channel once all subscribers have seen it.
    pub async fn seal(&self, storage: &Arc<dyn Storage>, job_id: JobId) -> Result<()> {
        storage.seal_log(job_id).await?;
        if let Some(chan) = self.channels.read().await.get(&job_id) {
            let _ = chan.tx.send(LogEvent::Sealed);
        }
        self.channels.write().await.remove(&job_id);
        Ok(())
    }
}

/// Drain one event for a subscriber, translating a lagged receiver into
/// a dropped-chunk marker on the caller's next successful read
/// (`spec.md` §4.7: "a `dropped=true` marker is set on its next
/// successful delivery"). Grounded on the `RecvError::Lagged` handling
/// in `buildit-api/src/ws.rs::handle_socket`.
pub async fn recv_reconciled(
    rx: &mut broadcast::Receiver<LogEvent>,
) -> Option<(LogEvent, bool)> {
    let mut dropped = false;
    loop {
        match rx.recv().await {
            Ok(event) => return Some((event, dropped)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "subscriber lagging, chunks dropped");
                dropped = true;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
