//! Row shapes and domain<->row conversions.
//!
//! Status-like domain enums (`JobStatus`, `TrustLevel`, `ForgeKind`,
//! `WorkerMode`) are stored as their serde snake_case string form in a
//! `text` column rather than via a dedicated Postgres enum type, so
//! adding a variant never requires a migration. Structured fields
//! (`env`, `labels`, `required_labels`, ...) are stored as `jsonb` via
//! `sqlx::types::Json`, which maps straight onto the `serde`
//! `Serialize`/`Deserialize` impls the domain types already carry.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use cinch_core::job::{Job, JobStatus, TerminalReason, TrustLevel};
use cinch_core::repository::{EncryptedSecret, ForgeKind, Repository};
use cinch_core::storage::TokenRecord;
use cinch_core::worker::{Worker, WorkerMode};
use cinch_core::{JobId, RepositoryId, TokenId, WorkerId};

use crate::error::DbError;

pub(crate) fn enum_to_text<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value).expect("enum serialization is infallible") {
        Value::String(s) => s,
        other => panic!("expected enum to serialize to a string, got {other:?}"),
    }
}

pub(crate) fn text_to_enum<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, DbError> {
    serde_json::from_value(Value::String(text.to_string()))
        .map_err(|e| DbError::CorruptRow(format!("invalid enum text {text:?}: {e}")))
}

#[derive(sqlx::FromRow)]
pub(crate) struct RepositoryRow {
    pub id: Uuid,
    pub forge: String,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    pub public_url: String,
    pub is_private: bool,
    pub webhook_secret_ciphertext: Vec<u8>,
    pub webhook_secret_nonce: Vec<u8>,
    pub forge_credential_ciphertext: Option<Vec<u8>>,
    pub forge_credential_nonce: Option<Vec<u8>>,
    pub build_command: String,
    pub release_command: String,
    pub workers: Json<Vec<String>>,
    pub env: Json<HashMap<String, String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RepositoryRow> for Repository {
    type Error = DbError;

    fn try_from(row: RepositoryRow) -> Result<Self, Self::Error> {
        let forge_credential = match (row.forge_credential_ciphertext, row.forge_credential_nonce) {
            (Some(ciphertext), Some(nonce)) => Some(EncryptedSecret { ciphertext, nonce }),
            _ => None,
        };
        Ok(Repository {
            id: RepositoryId::from_uuid(row.id),
            forge: text_to_enum(&row.forge)?,
            owner: row.owner,
            name: row.name,
            clone_url: row.clone_url,
            public_url: row.public_url,
            is_private: row.is_private,
            webhook_secret: EncryptedSecret {
                ciphertext: row.webhook_secret_ciphertext,
                nonce: row.webhook_secret_nonce,
            },
            forge_credential,
            build_command: row.build_command,
            release_command: row.release_command,
            workers: row.workers.0,
            env: row.env.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) struct RepositoryBind<'a> {
    pub id: Uuid,
    pub forge: String,
    pub owner: &'a str,
    pub name: &'a str,
    pub clone_url: &'a str,
    pub public_url: &'a str,
    pub is_private: bool,
    pub webhook_secret_ciphertext: &'a [u8],
    pub webhook_secret_nonce: &'a [u8],
    pub forge_credential_ciphertext: Option<&'a [u8]>,
    pub forge_credential_nonce: Option<&'a [u8]>,
    pub build_command: &'a str,
    pub release_command: &'a str,
    pub workers: Json<&'a Vec<String>>,
    pub env: Json<&'a HashMap<String, String>>,
}

impl<'a> From<&'a Repository> for RepositoryBind<'a> {
    fn from(r: &'a Repository) -> Self {
        Self {
            id: r.id.as_uuid(),
            forge: enum_to_text(&r.forge),
            owner: &r.owner,
            name: &r.name,
            clone_url: &r.clone_url,
            public_url: &r.public_url,
            is_private: r.is_private,
            webhook_secret_ciphertext: &r.webhook_secret.ciphertext,
            webhook_secret_nonce: &r.webhook_secret.nonce,
            forge_credential_ciphertext: r.forge_credential.as_ref().map(|s| s.ciphertext.as_slice()),
            forge_credential_nonce: r.forge_credential.as_ref().map(|s| s.nonce.as_slice()),
            build_command: &r.build_command,
            release_command: &r.release_command,
            workers: Json(&r.workers),
            env: Json(&r.env),
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub forge: String,
    pub commit_sha: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_base_branch: Option<String>,
    pub trust_level: String,
    pub is_fork: bool,
    pub author_login: String,
    pub author_stable_id: String,
    pub command: String,
    pub env: Json<HashMap<String, String>>,
    pub timeout_secs: i64,
    pub required_labels: Json<Vec<String>>,
    pub status: String,
    pub assigned_executor: Option<Uuid>,
    pub exit_code: Option<i32>,
    pub terminal_reason: Option<Json<TerminalReason>>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            repository_id: RepositoryId::from_uuid(row.repository_id),
            forge: text_to_enum(&row.forge)?,
            commit_sha: row.commit_sha,
            branch: row.branch,
            tag: row.tag,
            pr_number: row.pr_number.map(|n| n as u64),
            pr_base_branch: row.pr_base_branch,
            trust_level: text_to_enum(&row.trust_level)?,
            is_fork: row.is_fork,
            author_login: row.author_login,
            author_stable_id: row.author_stable_id,
            command: row.command,
            env: row.env.0,
            timeout: std::time::Duration::from_secs(row.timeout_secs.max(0) as u64),
            required_labels: row.required_labels.0,
            status: text_to_enum(&row.status)?,
            assigned_executor: row.assigned_executor.map(WorkerId::from_uuid),
            exit_code: row.exit_code,
            terminal_reason: row.terminal_reason.map(|j| j.0),
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct WorkerRow {
    pub id: Uuid,
    pub display_name: String,
    pub owner_principal_id: String,
    pub owner_login: String,
    pub mode: String,
    pub labels: Json<HashSet<String>>,
    pub registered_repos: Json<HashSet<Uuid>>,
    pub last_seen_at: DateTime<Utc>,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = DbError;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        Ok(Worker {
            id: WorkerId::from_uuid(row.id),
            display_name: row.display_name,
            owner_principal_id: row.owner_principal_id,
            owner_login: row.owner_login,
            mode: text_to_enum::<WorkerMode>(&row.mode)?,
            labels: row.labels.0,
            registered_repos: row
                .registered_repos
                .0
                .into_iter()
                .map(RepositoryId::from_uuid)
                .collect(),
            last_seen_at: row.last_seen_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TokenRow {
    pub id: Uuid,
    pub worker_id: Option<Uuid>,
    pub hash: Vec<u8>,
    pub repository_scope: Json<Vec<Uuid>>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

impl From<TokenRow> for TokenRecord {
    fn from(row: TokenRow) -> Self {
        TokenRecord {
            id: TokenId::from_uuid(row.id),
            worker_id: row.worker_id.map(WorkerId::from_uuid),
            hash: row.hash,
            repository_scope: row.repository_scope.0.into_iter().map(RepositoryId::from_uuid).collect(),
            created_at: row.created_at,
            revoked: row.revoked,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct LogChunkRow {
    pub job_id: Uuid,
    pub seq: i64,
    pub stream: String,
    pub timestamp: DateTime<Utc>,
    pub data: String,
}

impl TryFrom<LogChunkRow> for cinch_core::log::LogChunk {
    type Error = DbError;

    fn try_from(row: LogChunkRow) -> Result<Self, Self::Error> {
        Ok(cinch_core::log::LogChunk {
            job_id: JobId::from_uuid(row.job_id),
            seq: row.seq.max(0) as u64,
            stream: text_to_enum(&row.stream)?,
            timestamp: row.timestamp,
            data: row.data,
        })
    }
}

pub(crate) fn forge_kind_text(kind: ForgeKind) -> String {
    enum_to_text(&kind)
}
