//! Live session state owned exclusively by the Hub (`spec.md` §3
//! "Ownership summary": "The Hub exclusively owns live session
//! handles"). Never serialized, never passed to `Storage`.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use cinch_core::{JobId, RepositoryId, WorkerId, WorkerMode};
use cinch_protocol::ServerMessage;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("session closed")]
    Closed,
}

/// Abstraction over "write a message to this executor's socket".
///
/// The Hub never writes to a socket directly (`spec.md` §5: "the Hub
/// never writes to the socket directly"); `cinch-server` supplies the
/// concrete implementation, backed by the session's single writer task
/// and its outbound channel, so ordering within one session is
/// preserved regardless of how many callers hold a `Candidate`.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn send(&self, msg: ServerMessage) -> Result<(), SinkError>;
}

pub struct SessionEntry {
    pub worker_id: WorkerId,
    pub sink: std::sync::Arc<dyn SessionSink>,
    pub generation: u64,
    pub labels: HashSet<String>,
    pub mode: WorkerMode,
    pub registered_repos: HashSet<RepositoryId>,
    pub owner_principal_id: String,
    pub owner_login: String,
    pub active_jobs: HashSet<JobId>,
    pub last_heartbeat: DateTime<Utc>,
}
