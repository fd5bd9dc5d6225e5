//! In-memory `Storage` implementation used by unit and property tests
//! across the workspace (`spec.md` §8). Not built for production; it
//! exists so Hub/Dispatcher/session tests don't need a live Postgres,
//! matching the property that `Storage` is an abstract collaborator.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::id::{JobId, RepositoryId, WorkerId};
use crate::job::{Job, JobStatus, TerminalReason};
use crate::log::LogChunk;
use crate::repository::{ForgeKind, Repository};
use crate::storage::{conflict_for_status, JobFilter, Storage, TokenRecord};
use crate::worker::Worker;
use crate::{Error, Result};

#[derive(Default)]
pub struct MemoryStorage {
    repositories: Mutex<HashMap<RepositoryId, Repository>>,
    jobs: Mutex<HashMap<JobId, Job>>,
    workers: Mutex<HashMap<WorkerId, Worker>>,
    tokens: Mutex<Vec<TokenRecord>>,
    logs: Mutex<HashMap<JobId, Vec<LogChunk>>>,
    sealed: Mutex<std::collections::HashSet<JobId>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_repository(&self, repo: Repository) -> Result<Repository> {
        self.repositories.lock().unwrap().insert(repo.id, repo.clone());
        Ok(repo)
    }

    async fn get_repository(&self, id: RepositoryId) -> Result<Repository> {
        self.repositories
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("repository {id}")))
    }

    async fn find_repository_by_identity(
        &self,
        forge: ForgeKind,
        owner: &str,
        name: &str,
    ) -> Result<Option<Repository>> {
        Ok(self
            .repositories
            .lock()
            .unwrap()
            .values()
            .find(|r| r.forge == forge && r.owner == owner && r.name == name)
            .cloned())
    }

    async fn update_repository(&self, repo: Repository) -> Result<Repository> {
        self.repositories.lock().unwrap().insert(repo.id, repo.clone());
        Ok(repo)
    }

    async fn delete_repository(&self, id: RepositoryId) -> Result<()> {
        self.repositories.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self.repositories.lock().unwrap().values().cloned().collect())
    }

    async fn create_job(&self, job: Job) -> Result<Job> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        self.jobs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| filter.repository_id.is_none_or(|r| r == j.repository_id))
            .filter(|j| filter.status.is_none_or(|s| s == j.status))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        if let Some(limit) = filter.limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn update_job_status(
        &self,
        id: JobId,
        expected_current: &[JobStatus],
        next: JobStatus,
        assigned_executor: Option<WorkerId>,
        exit_code: Option<i32>,
        terminal_reason: Option<TerminalReason>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        if !expected_current.contains(&job.status) || !job.status.can_transition_to(next) {
            return Err(conflict_for_status(id, job.status));
        }
        job.status = next;
        if let Some(w) = assigned_executor {
            job.assigned_executor = Some(w);
        }
        if let Some(code) = exit_code {
            job.exit_code = Some(code);
        }
        if let Some(reason) = terminal_reason {
            job.terminal_reason = Some(reason);
        }
        match next {
            JobStatus::Running if job.started_at.is_none() => job.started_at = Some(Utc::now()),
            s if s.is_terminal() => job.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(job.clone())
    }

    async fn approve_job(&self, id: JobId, approved_by: &str) -> Result<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        job.approved_by = Some(approved_by.to_string());
        job.approved_at = Some(Utc::now());
        if job.status == JobStatus::PendingContributor {
            job.status = JobStatus::Pending;
        }
        Ok(job.clone())
    }

    async fn upsert_worker(&self, worker: Worker) -> Result<Worker> {
        self.workers.lock().unwrap().insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Worker> {
        self.workers
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))
    }

    async fn touch_worker_last_seen(&self, id: WorkerId, at: chrono::DateTime<Utc>) -> Result<()> {
        if let Some(w) = self.workers.lock().unwrap().get_mut(&id) {
            w.last_seen_at = at;
        }
        Ok(())
    }

    async fn find_token_by_hash(&self, hash: &[u8]) -> Result<Option<TokenRecord>> {
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.hash == hash)
            .cloned())
    }

    async fn create_token(&self, token: TokenRecord) -> Result<TokenRecord> {
        self.tokens.lock().unwrap().push(token.clone());
        Ok(token)
    }

    async fn append_log_chunk(&self, chunk: LogChunk) -> Result<()> {
        let mut logs = self.logs.lock().unwrap();
        let entries = logs.entry(chunk.job_id).or_default();
        if entries
            .iter()
            .any(|c| c.seq == chunk.seq && c.stream == chunk.stream)
        {
            return Ok(());
        }
        entries.push(chunk);
        entries.sort_by_key(|c| c.seq);
        Ok(())
    }

    async fn list_log_chunks(&self, job_id: JobId, after_seq: Option<u64>) -> Result<Vec<LogChunk>> {
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .get(&job_id)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|c| after_seq.is_none_or(|after| c.seq > after))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn seal_log(&self, job_id: JobId) -> Result<()> {
        self.sealed.lock().unwrap().insert(job_id);
        Ok(())
    }

    async fn is_log_sealed(&self, job_id: JobId) -> Result<bool> {
        Ok(self.sealed.lock().unwrap().contains(&job_id))
    }
}
