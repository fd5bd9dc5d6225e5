//! Append-only per-job log stream (`spec.md` §3 "Log Stream").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStreamTag {
    Stdout,
    Stderr,
}

/// One persisted chunk of job output, keyed by `(job_id, seq)`.
///
/// `seq` is monotonic per `(job_id, stream)` so duplicates arriving
/// from an executor reconnect are detectable and idempotent to persist
/// (`spec.md` §3, §4.7, §7 "Idempotency obligations").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub job_id: JobId,
    pub seq: u64,
    pub stream: LogStreamTag,
    pub timestamp: DateTime<Utc>,
    pub data: String,
}

/// Maximum bytes carried by a single `LOG_CHUNK` payload (`spec.md` §4.5).
pub const MAX_LOG_CHUNK_BYTES: usize = 64 * 1024;

/// Maximum size of any framed envelope (`spec.md` §4.5, §6.1).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
