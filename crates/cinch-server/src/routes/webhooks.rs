//! Forge webhook ingestion (`spec.md` §4.1, §6.2).
//!
//! Grounded on `buildit-api/src/routes/webhooks.rs::process_github_webhook`,
//! generalized from a single hardcoded provider to the `Forge` dispatch
//! table, and from "trigger matching pipelines" to
//! "normalize, then hand off to the Job Factory".

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use tracing::{info, warn};

use cinch_core::repository::ForgeKind;

use crate::error::ApiError;
use crate::{jobfactory, normalize};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/github/{owner}/{repo}", post(github_webhook))
}

async fn github_webhook(
    State(state): State<AppState>,
    axum::extract::Path((owner, repo_name)): axum::extract::Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let forge = state
        .forges
        .get(ForgeKind::Github)
        .ok_or_else(|| ApiError::Internal("github forge adapter not configured".to_string()))?;

    let repo = state
        .storage
        .find_repository_by_identity(ForgeKind::Github, &owner, &repo_name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("repository {owner}/{repo_name} not registered")))?;

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !forge.verify_signature(&repo.webhook_secret.ciphertext, &body, signature) {
        warn!(repo = %repo.full_name(), "rejected webhook with invalid signature");
        return Ok(StatusCode::UNAUTHORIZED);
    }

    let lowered_headers: std::collections::HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
        .collect();
    let Some(event_type) = forge.event_type(&lowered_headers) else {
        return Ok(StatusCode::BAD_REQUEST);
    };

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON payload: {e}")))?;

    let event = match normalize::normalize(ForgeKind::Github, &event_type, &payload) {
        Ok(event) => event,
        Err(e) => {
            info!(repo = %repo.full_name(), event = %event_type, error = %e, "webhook event not dispatchable");
            return Ok(StatusCode::OK);
        }
    };

    let jobs = jobfactory::create_jobs(&event, &repo, &state.storage, &state.access_cache, &state.hub)
        .await?;

    for job in &jobs {
        let _ = state
            .dispatch_tx
            .send(cinch_dispatcher::DispatchEvent::JobReady(job.id))
            .await;
    }

    info!(repo = %repo.full_name(), created = jobs.len(), "webhook processed");
    Ok(StatusCode::OK)
}
