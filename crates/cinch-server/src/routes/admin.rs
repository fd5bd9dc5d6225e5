//! Admin surface (`spec.md` §4.2 "Admin surface (conceptual)"): list/get
//! Jobs, tail a Job's log, list Executors, cancel/approve a Job, and
//! repository CRUD.
//!
//! Grounded on `buildit-api/src/routes/repositories.rs` and
//! `buildit-api/src/routes/pipelines.rs` for the CRUD/list shape; the
//! live log tail reuses the session layer's WebSocket pattern against
//! `LogFanout` instead of the Hub.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::SinkExt;
use serde::Deserialize;
use serde_json::json;

use cinch_core::id::{JobId, RepositoryId};
use cinch_core::job::JobStatus;
use cinch_core::repository::Repository;
use cinch_core::storage::JobFilter;
use cinch_dispatcher::DispatchEvent;

use crate::error::ApiError;
use crate::logfanout::LogEvent;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/approve", post(approve_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/log", get(job_log))
        .route("/jobs/{id}/log/stream", get(job_log_stream))
        .route("/executors", get(list_executors))
        .route("/repositories", get(list_repositories).post(create_repository))
        .route("/repositories/{id}", get(get_repository).delete(delete_repository))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
    state
        .admin_tokens
        .get(token)
        .cloned()
        .ok_or_else(|| ApiError::Unauthorized("invalid admin token".to_string()))
}

#[derive(Debug, Deserialize, Default)]
struct ListJobsQuery {
    repository_id: Option<RepositoryId>,
    status: Option<JobStatus>,
    limit: Option<u32>,
}

async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let jobs = state
        .storage
        .list_jobs(JobFilter {
            repository_id: query.repository_id,
            status: query.status,
            limit: query.limit,
        })
        .await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let job = state.storage.get_job(id).await?;
    Ok(Json(job))
}

async fn approve_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let approver = require_admin(&state, &headers)?;
    let job = state.storage.approve_job(id, &approver).await?;
    let _ = state.dispatch_tx.send(DispatchEvent::JobReady(job.id)).await;
    Ok(Json(job))
}

async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state.dispatcher.cancel_job(id, "cancelled via admin API").await?;
    Ok(Json(json!({ "status": "cancel requested" })))
}

#[derive(Debug, Deserialize, Default)]
struct LogQuery {
    after_seq: Option<u64>,
}

async fn job_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let chunks = state.storage.list_log_chunks(id, query.after_seq).await?;
    Ok(Json(chunks))
}

/// Live log tail: historical chunks first, then anything published
/// after the subscription is established (`spec.md` §4.2 "tail Job log
/// (live + historical)").
async fn job_log_stream(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_log(socket, state, id))
}

async fn stream_log(mut socket: WebSocket, state: AppState, job_id: JobId) {
    let mut rx = state.log_fanout.subscribe(job_id).await;

    if let Ok(chunks) = state.storage.list_log_chunks(job_id, None).await {
        for chunk in chunks {
            if socket
                .send(Message::Text(serde_json::to_string(&chunk).unwrap_or_default().into()))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    loop {
        match crate::logfanout::recv_reconciled(&mut rx).await {
            Some((LogEvent::Chunk(chunk), dropped)) => {
                let payload = json!({ "chunk": chunk, "dropped": dropped });
                if socket.send(Message::Text(payload.to_string().into())).await.is_err() {
                    return;
                }
            }
            Some((LogEvent::Sealed, _)) => {
                let _ = socket.send(Message::Text(json!({ "sealed": true }).to_string().into())).await;
                return;
            }
            None => return,
        }
    }
}

async fn list_executors(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.hub.snapshot().await))
}

#[derive(Debug, Deserialize)]
struct CreateRepositoryRequest {
    forge: cinch_core::repository::ForgeKind,
    owner: String,
    name: String,
    clone_url: String,
    public_url: String,
    is_private: bool,
    webhook_secret: String,
    build_command: String,
    release_command: Option<String>,
    workers: Vec<String>,
    env: HashMap<String, String>,
}

async fn create_repository(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateRepositoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let now = chrono::Utc::now();
    let repo = Repository {
        id: RepositoryId::new(),
        forge: req.forge,
        owner: req.owner,
        name: req.name,
        clone_url: req.clone_url,
        public_url: req.public_url,
        is_private: req.is_private,
        webhook_secret: cinch_core::repository::EncryptedSecret {
            ciphertext: req.webhook_secret.into_bytes(),
            nonce: Vec::new(),
        },
        forge_credential: None,
        build_command: req.build_command,
        release_command: req.release_command,
        workers: req.workers,
        env: req.env,
        created_at: now,
        updated_at: now,
    };
    let created = state.storage.create_repository(repo).await?;
    Ok(Json(created))
}

async fn get_repository(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<RepositoryId>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let repo = state.storage.get_repository(id).await?;
    Ok(Json(repo))
}

async fn list_repositories(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let repos = state.storage.list_repositories().await?;
    Ok(Json(repos))
}

async fn delete_repository(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<RepositoryId>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state.storage.delete_repository(id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}
