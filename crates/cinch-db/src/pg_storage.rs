//! `PgStorage`: the concrete `Storage` implementation over PostgreSQL.
//!
//! Grounded on `buildit-scheduler::queue::JobQueue`'s direct-`sqlx`
//! style (bind + `fetch_one`/`fetch_optional`, `FOR UPDATE SKIP
//! LOCKED` for contention-free claiming) rather than the teacher's
//! `clorinde`-generated `buildit-db-queries` crate, which this crate
//! has no counterpart for — see `DESIGN.md`.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;

use cinch_core::job::{Job, JobStatus, TerminalReason};
use cinch_core::log::LogChunk;
use cinch_core::repository::{ForgeKind, Repository};
use cinch_core::storage::{conflict_for_status, JobFilter, Storage, TokenRecord};
use cinch_core::worker::Worker;
use cinch_core::{Error, JobId, RepositoryId, Result, WorkerId};

use crate::rows::{enum_to_text, forge_kind_text, JobRow, LogChunkRow, RepositoryBind, RepositoryRow, TokenRow, WorkerRow};

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn create_repository(&self, repo: Repository) -> Result<Repository> {
        let bind = RepositoryBind::from(&repo);
        let row: RepositoryRow = sqlx::query_as(
            r#"
            INSERT INTO repositories (
                id, forge, owner, name, clone_url, public_url, is_private,
                webhook_secret_ciphertext, webhook_secret_nonce,
                forge_credential_ciphertext, forge_credential_nonce,
                build_command, release_command, workers, env, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,NOW(),NOW())
            RETURNING *
            "#,
        )
        .bind(bind.id)
        .bind(bind.forge)
        .bind(bind.owner)
        .bind(bind.name)
        .bind(bind.clone_url)
        .bind(bind.public_url)
        .bind(bind.is_private)
        .bind(bind.webhook_secret_ciphertext)
        .bind(bind.webhook_secret_nonce)
        .bind(bind.forge_credential_ciphertext)
        .bind(bind.forge_credential_nonce)
        .bind(bind.build_command)
        .bind(bind.release_command)
        .bind(bind.workers)
        .bind(bind.env)
        .fetch_one(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        Ok(row.try_into()?)
    }

    async fn get_repository(&self, id: RepositoryId) -> Result<Repository> {
        let row: RepositoryRow = sqlx::query_as("SELECT * FROM repositories WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?
            .ok_or_else(|| Error::NotFound(format!("repository {id}")))?;
        Ok(row.try_into()?)
    }

    async fn find_repository_by_identity(
        &self,
        forge: ForgeKind,
        owner: &str,
        name: &str,
    ) -> Result<Option<Repository>> {
        let row: Option<RepositoryRow> = sqlx::query_as(
            "SELECT * FROM repositories WHERE forge = $1 AND owner = $2 AND name = $3",
        )
        .bind(forge_kind_text(forge))
        .bind(owner)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        Ok(row.map(TryInto::try_into).transpose()?)
    }

    async fn update_repository(&self, repo: Repository) -> Result<Repository> {
        let bind = RepositoryBind::from(&repo);
        let row: RepositoryRow = sqlx::query_as(
            r#"
            UPDATE repositories SET
                clone_url = $2, public_url = $3, is_private = $4,
                webhook_secret_ciphertext = $5, webhook_secret_nonce = $6,
                forge_credential_ciphertext = $7, forge_credential_nonce = $8,
                build_command = $9, release_command = $10, workers = $11, env = $12,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(bind.id)
        .bind(bind.clone_url)
        .bind(bind.public_url)
        .bind(bind.is_private)
        .bind(bind.webhook_secret_ciphertext)
        .bind(bind.webhook_secret_nonce)
        .bind(bind.forge_credential_ciphertext)
        .bind(bind.forge_credential_nonce)
        .bind(bind.build_command)
        .bind(bind.release_command)
        .bind(bind.workers)
        .bind(bind.env)
        .fetch_one(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        Ok(row.try_into()?)
    }

    async fn delete_repository(&self, id: RepositoryId) -> Result<()> {
        sqlx::query("DELETE FROM repositories WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let rows: Vec<RepositoryRow> = sqlx::query_as("SELECT * FROM repositories ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        let mut repos = Vec::with_capacity(rows.len());
        for row in rows {
            repos.push(row.try_into()?);
        }
        Ok(repos)
    }

    async fn create_job(&self, job: Job) -> Result<Job> {
        let row: JobRow = sqlx::query_as(
            r#"
            INSERT INTO jobs (
                id, repository_id, forge, commit_sha, branch, tag, pr_number, pr_base_branch,
                trust_level, is_fork, author_login, author_stable_id, command, env,
                timeout_secs, required_labels, status, assigned_executor, exit_code,
                terminal_reason, approved_by, approved_at, created_at, started_at, finished_at
            ) VALUES (
                $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24,$25
            )
            RETURNING *
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.repository_id.as_uuid())
        .bind(forge_kind_text(job.forge))
        .bind(&job.commit_sha)
        .bind(&job.branch)
        .bind(&job.tag)
        .bind(job.pr_number.map(|n| n as i64))
        .bind(&job.pr_base_branch)
        .bind(enum_to_text(&job.trust_level))
        .bind(job.is_fork)
        .bind(&job.author_login)
        .bind(&job.author_stable_id)
        .bind(&job.command)
        .bind(Json(&job.env))
        .bind(job.timeout.as_secs() as i64)
        .bind(Json(&job.required_labels))
        .bind(enum_to_text(&job.status))
        .bind(job.assigned_executor.map(|w| w.as_uuid()))
        .bind(job.exit_code)
        .bind(job.terminal_reason.as_ref().map(Json))
        .bind(&job.approved_by)
        .bind(job.approved_at)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .fetch_one(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        Ok(row.try_into()?)
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        let row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        Ok(row.try_into()?)
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let mut builder = sqlx::QueryBuilder::new("SELECT * FROM jobs WHERE 1 = 1");
        if let Some(repo_id) = filter.repository_id {
            builder.push(" AND repository_id = ").push_bind(repo_id.as_uuid());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(enum_to_text(&status));
        }
        builder.push(" ORDER BY created_at ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows: Vec<JobRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        rows.into_iter()
            .map(TryInto::try_into)
            .collect::<std::result::Result<_, _>>()
            .map_err(cinch_core::Error::from)
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
        let expected_text: Vec<String> = expected_current.iter().map(enum_to_text).collect();
        let next_text = enum_to_text(&next);
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE jobs SET
                status = $2,
                assigned_executor = COALESCE($3, assigned_executor),
                exit_code = COALESCE($4, exit_code),
                terminal_reason = COALESCE($5, terminal_reason),
                started_at = CASE WHEN $2 = 'running' AND started_at IS NULL THEN NOW() ELSE started_at END,
                finished_at = CASE WHEN $2 IN ('success','failure','error','cancelled') AND finished_at IS NULL THEN NOW() ELSE finished_at END
            WHERE id = $1 AND status = ANY($6)
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(next_text)
        .bind(assigned_executor.map(|w| w.as_uuid()))
        .bind(exit_code)
        .bind(terminal_reason.as_ref().map(Json))
        .bind(&expected_text)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;

        match row {
            Some(row) => Ok(row.try_into()?),
            None => {
                let current = self.get_job(id).await?;
                Err(conflict_for_status(id, current.status))
            }
        }
    }

    async fn approve_job(&self, id: JobId, approved_by: &str) -> Result<Job> {
        let row: JobRow = sqlx::query_as(
            r#"
            UPDATE jobs SET
                approved_by = $2,
                approved_at = NOW(),
                status = CASE WHEN status = 'pending_contributor' THEN 'pending' ELSE status END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(approved_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?
        .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        Ok(row.try_into()?)
    }

    async fn upsert_worker(&self, worker: Worker) -> Result<Worker> {
        let registered_repos: Vec<uuid::Uuid> =
            worker.registered_repos.iter().map(|r| r.as_uuid()).collect();
        let row: WorkerRow = sqlx::query_as(
            r#"
            INSERT INTO workers (id, display_name, owner_principal_id, owner_login, mode, labels, registered_repos, last_seen_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                owner_principal_id = EXCLUDED.owner_principal_id,
                owner_login = EXCLUDED.owner_login,
                mode = EXCLUDED.mode,
                labels = EXCLUDED.labels,
                registered_repos = EXCLUDED.registered_repos,
                last_seen_at = EXCLUDED.last_seen_at
            RETURNING *
            "#,
        )
        .bind(worker.id.as_uuid())
        .bind(&worker.display_name)
        .bind(&worker.owner_principal_id)
        .bind(&worker.owner_login)
        .bind(enum_to_text(&worker.mode))
        .bind(Json(&worker.labels))
        .bind(Json(registered_repos))
        .bind(worker.last_seen_at)
        .fetch_one(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        Ok(row.try_into()?)
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Worker> {
        let row: WorkerRow = sqlx::query_as("SELECT * FROM workers WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))?;
        Ok(row.try_into()?)
    }

    async fn touch_worker_last_seen(&self, id: WorkerId, at: chrono::DateTime<chrono::Utc>) -> Result<()> {
        sqlx::query("UPDATE workers SET last_seen_at = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        Ok(())
    }

    async fn find_token_by_hash(&self, hash: &[u8]) -> Result<Option<TokenRecord>> {
        let row: Option<TokenRow> = sqlx::query_as("SELECT * FROM tokens WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        Ok(row.map(Into::into))
    }

    async fn create_token(&self, token: TokenRecord) -> Result<TokenRecord> {
        let scope: Vec<uuid::Uuid> = token.repository_scope.iter().map(|r| r.as_uuid()).collect();
        let row: TokenRow = sqlx::query_as(
            r#"
            INSERT INTO tokens (id, worker_id, hash, repository_scope, created_at, revoked)
            VALUES ($1,$2,$3,$4,$5,$6)
            RETURNING *
            "#,
        )
        .bind(token.id.as_uuid())
        .bind(token.worker_id.map(|w| w.as_uuid()))
        .bind(&token.hash)
        .bind(Json(scope))
        .bind(token.created_at)
        .bind(token.revoked)
        .fetch_one(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        Ok(row.into())
    }

    async fn append_log_chunk(&self, chunk: LogChunk) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO log_chunks (job_id, seq, stream, timestamp, data)
            VALUES ($1,$2,$3,$4,$5)
            ON CONFLICT (job_id, seq, stream) DO NOTHING
            "#,
        )
        .bind(chunk.job_id.as_uuid())
        .bind(chunk.seq as i64)
        .bind(enum_to_text(&chunk.stream))
        .bind(chunk.timestamp)
        .bind(&chunk.data)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        Ok(())
    }

    async fn list_log_chunks(&self, job_id: JobId, after_seq: Option<u64>) -> Result<Vec<LogChunk>> {
        let rows: Vec<LogChunkRow> = sqlx::query_as(
            r#"
            SELECT * FROM log_chunks
            WHERE job_id = $1 AND ($2::bigint IS NULL OR seq > $2)
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(after_seq.map(|s| s as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        rows.into_iter()
            .map(TryInto::try_into)
            .collect::<std::result::Result<_, _>>()
            .map_err(cinch_core::Error::from)
    }

    async fn seal_log(&self, job_id: JobId) -> Result<()> {
        sqlx::query(
            "INSERT INTO sealed_logs (job_id, sealed_at) VALUES ($1, NOW()) ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(job_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        Ok(())
    }

    async fn is_log_sealed(&self, job_id: JobId) -> Result<bool> {
        let (sealed,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM sealed_logs WHERE job_id = $1)")
                .bind(job_id.as_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(crate::error::DbError::from)?;
        Ok(sealed)
    }
}
