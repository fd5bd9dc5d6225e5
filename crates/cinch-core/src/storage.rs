//! The `Storage` collaborator interface (`spec.md` §1, §3, §6.4).
//!
//! `spec.md` treats the durable storage layer as an external
//! collaborator exposed only through this abstract interface; the
//! concrete schema is the collaborator's concern. `cinch-db` provides
//! one concrete implementation over PostgreSQL. The core requires only
//! that `update_job_status` be a linearizable conditional update and
//! that `append_log_chunk` be a totally-ordered idempotent append.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::id::{JobId, RepositoryId, TokenId, WorkerId};
use crate::job::{Job, JobStatus, TerminalReason};
use crate::log::LogChunk;
use crate::repository::Repository;
use crate::worker::Worker;
use crate::{Error, Result};

/// Filters accepted by `Storage::list_jobs` (admin surface, `spec.md` §6.6).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub repository_id: Option<RepositoryId>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
}

/// A bearer token record, hashed at rest (`spec.md` §4.5 "Authentication").
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub id: TokenId,
    pub worker_id: Option<WorkerId>,
    pub hash: Vec<u8>,
    pub repository_scope: Vec<RepositoryId>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

#[async_trait]
pub trait Storage: Send + Sync {
    // -- Repositories --
    async fn create_repository(&self, repo: Repository) -> Result<Repository>;
    async fn get_repository(&self, id: RepositoryId) -> Result<Repository>;
    async fn find_repository_by_identity(
        &self,
        forge: crate::repository::ForgeKind,
        owner: &str,
        name: &str,
    ) -> Result<Option<Repository>>;
    async fn update_repository(&self, repo: Repository) -> Result<Repository>;
    async fn delete_repository(&self, id: RepositoryId) -> Result<()>;
    async fn list_repositories(&self) -> Result<Vec<Repository>>;

    // -- Jobs --
    async fn create_job(&self, job: Job) -> Result<Job>;
    async fn get_job(&self, id: JobId) -> Result<Job>;
    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>>;

    /// Conditional status update: succeeds only if the job's current
    /// status is one of `expected_current`. Returns `Err(Error::Conflict)`
    /// if the job has moved on (e.g. a duplicate `JOB_COMPLETE` after
    /// the job is already terminal) — callers should treat that as a
    /// silent discard per `spec.md` §7.
    async fn update_job_status(
        &self,
        id: JobId,
        expected_current: &[JobStatus],
        next: JobStatus,
        assigned_executor: Option<WorkerId>,
        exit_code: Option<i32>,
        terminal_reason: Option<TerminalReason>,
    ) -> Result<Job>;

    async fn approve_job(&self, id: JobId, approved_by: &str) -> Result<Job>;

    // -- Workers --
    async fn upsert_worker(&self, worker: Worker) -> Result<Worker>;
    async fn get_worker(&self, id: WorkerId) -> Result<Worker>;
    async fn touch_worker_last_seen(&self, id: WorkerId, at: DateTime<Utc>) -> Result<()>;

    // -- Tokens --
    async fn find_token_by_hash(&self, hash: &[u8]) -> Result<Option<TokenRecord>>;
    async fn create_token(&self, token: TokenRecord) -> Result<TokenRecord>;

    // -- Logs --
    /// Idempotent on `(job_id, seq, stream)`: a duplicate append (e.g.
    /// from executor reconnect replay) is a no-op that still returns
    /// `Ok`, per `spec.md` §4.7 and §7.
    async fn append_log_chunk(&self, chunk: LogChunk) -> Result<()>;
    async fn list_log_chunks(&self, job_id: JobId, after_seq: Option<u64>) -> Result<Vec<LogChunk>>;
    async fn seal_log(&self, job_id: JobId) -> Result<()>;
    async fn is_log_sealed(&self, job_id: JobId) -> Result<bool>;
}

/// Helper used by `Storage` implementations to turn an unexpected current
/// status into the standard conflict error.
pub fn conflict_for_status(id: JobId, current: JobStatus) -> Error {
    Error::Conflict(format!("job {id} is in status {current:?}, transition rejected"))
}
