//! Session protocol wire types (`spec.md` §4.5).
//!
//! Transport messages are a closed sum type over the type tags in the
//! protocol tables, one enum per direction, each serialized as
//! `{"type": <tag>, "payload": <object>}` via serde's internally
//! tagged representation. Unknown tags are rejected at decode time —
//! serde does this for free for an internally tagged enum with no
//! catch-all variant, which is the behavior the session layer relies
//! on (`spec.md` §4.5 "Only the following types exist in the core").
//!
//! Grounded on `buildit-api::ws::BroadcastEvent`'s tagged-enum shape,
//! generalized from one-way broadcast to the full duplex session.

use cinch_core::repository::ForgeKind;
use cinch_core::{JobId, JobStatus, TrustLevel, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Maximum bytes carried by a single `LogChunk` payload.
pub const MAX_LOG_CHUNK_BYTES: usize = 64 * 1024;
/// Maximum size of any framed envelope, either direction.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    Stdout,
    Stderr,
}

/// Reason an executor gives when rejecting a `JobAssign` (`JOB_REJECT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AtCapacity,
    LabelMismatch,
    Other,
}

/// Phase in which an executor-side infrastructure failure occurred
/// (`spec.md` §4.5, §4.6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Clone,
    Setup,
    Execute,
    Cleanup,
}

/// The descriptor an executor needs to run a job, handed over in `JobAssign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: JobId,
    pub clone_url: String,
    pub clone_token: Option<String>,
    pub head_sha: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub pr_base: Option<String>,
    pub forge: ForgeKind,
    pub command: String,
    pub timeout_secs: u64,
    pub env: HashMap<String, String>,
    pub trust_level: TrustLevel,
}

impl JobDescriptor {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Control plane → executor messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk { executor_id: WorkerId },
    AuthFail { reason: String },
    Registered,
    JobAssign { descriptor: JobDescriptor },
    JobCancel { job_id: JobId, reason: String },
    Pong,
    Ack { message_id: String },
}

/// Executor → control plane messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorMessage {
    Register {
        labels: Vec<String>,
        mode: cinch_core::WorkerMode,
        registered_repos: Vec<String>,
        capabilities: Vec<String>,
        version: String,
        hostname: String,
    },
    JobAck { job_id: JobId },
    JobReject { job_id: JobId, reason: RejectReason },
    JobStarted { job_id: JobId },
    LogChunk {
        job_id: JobId,
        seq: u64,
        stream: StreamTag,
        data: String,
    },
    JobComplete {
        job_id: JobId,
        exit_code: i32,
        duration_secs: f64,
        /// Set when the executor killed the job after its configured
        /// timeout elapsed, rather than the command exiting on its own
        /// (`spec.md` §4.6 phase 8, scenario S5).
        timed_out: bool,
    },
    JobError {
        job_id: JobId,
        phase: Phase,
        reason: String,
    },
    Ping { active_job_ids: Vec<JobId> },
    StatusUpdate {
        active_count: u32,
        max_capacity: u32,
    },
}

impl ExecutorMessage {
    /// Maps a terminal `JobComplete`/`JobError` to the `Job` status it
    /// drives, for callers that need to validate a transition without
    /// re-deriving it (`spec.md` §3, §4.4 item 8; §7 idempotency).
    pub fn terminal_status(&self) -> Option<JobStatus> {
        match self {
            ExecutorMessage::JobComplete { exit_code, .. } if *exit_code == 0 => {
                Some(JobStatus::Success)
            }
            ExecutorMessage::JobComplete { .. } => Some(JobStatus::Failure),
            ExecutorMessage::JobError { .. } => Some(JobStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds max size of {MAX_FRAME_BYTES} bytes")]
    TooLarge,
    #[error("log chunk payload exceeds max size of {MAX_LOG_CHUNK_BYTES} bytes")]
    LogChunkTooLarge,
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode a single UTF-8 JSON frame into a `ServerMessage`, enforcing
/// the frame-size ceiling before attempting to parse.
pub fn decode_server_message(frame: &[u8]) -> Result<ServerMessage, FrameError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge);
    }
    Ok(serde_json::from_slice(frame)?)
}

/// Decode a single UTF-8 JSON frame into an `ExecutorMessage`, enforcing
/// both the frame-size ceiling and, for `LogChunk`, the payload ceiling.
pub fn decode_executor_message(frame: &[u8]) -> Result<ExecutorMessage, FrameError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge);
    }
    let msg: ExecutorMessage = serde_json::from_slice(frame)?;
    if let ExecutorMessage::LogChunk { data, .. } = &msg {
        if data.len() > MAX_LOG_CHUNK_BYTES {
            return Err(FrameError::LogChunkTooLarge);
        }
    }
    Ok(msg)
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_tag() {
        let err = decode_server_message(br#"{"type": "bogus"}"#).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn roundtrips_job_complete() {
        let job_id = JobId::new();
        let msg = ExecutorMessage::JobComplete {
            job_id,
            exit_code: 0,
            duration_secs: 12.5,
            timed_out: false,
        };
        let encoded = encode(&msg).unwrap();
        let decoded = decode_executor_message(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.terminal_status(), Some(JobStatus::Success));
    }

    #[test]
    fn oversize_frame_rejected() {
        let huge = vec![b'a'; MAX_FRAME_BYTES + 1];
        let err = decode_executor_message(&huge).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge));
    }
}
