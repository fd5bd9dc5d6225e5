//! Outgoing hooks fired on a Job's terminal transition (`spec.md` §6.5).
//!
//! Shared by the Dispatcher (queue-timeout errors) and the session
//! layer (`JOB_COMPLETE`/`JOB_ERROR`), so every terminal path posts
//! exactly one status update through the same code. Grounded on
//! `buildit-api/src/routes/webhooks.rs` + a notional `services/github.rs`
//! status-posting call, generalized behind the `Forge` trait.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use cinch_core::forge::JobOutcomeState;
use cinch_core::job::{Job, JobStatus};
use cinch_core::storage::Storage;
use cinch_dispatcher::TerminalHook;

use crate::state::ForgeRegistry;

pub struct ServerTerminalHook {
    storage: Arc<dyn Storage>,
    forges: ForgeRegistry,
    public_base_url: String,
}

impl ServerTerminalHook {
    pub fn new(storage: Arc<dyn Storage>, forges: ForgeRegistry, public_base_url: String) -> Self {
        Self {
            storage,
            forges,
            public_base_url,
        }
    }
}

fn outcome_for(status: JobStatus) -> Option<JobOutcomeState> {
    match status {
        JobStatus::Success => Some(JobOutcomeState::Success),
        JobStatus::Failure => Some(JobOutcomeState::Failure),
        JobStatus::Error => Some(JobOutcomeState::Error),
        JobStatus::Cancelled => Some(JobOutcomeState::Error),
        _ => None,
    }
}

#[async_trait]
impl TerminalHook for ServerTerminalHook {
    async fn on_terminal(&self, job: &Job) {
        let Some(state) = outcome_for(job.status) else {
            return;
        };
        let Ok(repo) = self.storage.get_repository(job.repository_id).await else {
            warn!(job_id = %job.id, "terminal hook: repository missing, cannot post status");
            return;
        };
        let Some(forge) = self.forges.get(job.forge) else {
            return;
        };
        let description = match job.status {
            JobStatus::Success => "build succeeded".to_string(),
            JobStatus::Failure => "build failed".to_string(),
            JobStatus::Error => format!(
                "build error: {}",
                job.terminal_reason
                    .as_ref()
                    .map(|r| format!("{r:?}"))
                    .unwrap_or_default()
            ),
            JobStatus::Cancelled => "build cancelled".to_string(),
            _ => return,
        };
        let target_url = format!("{}/jobs/{}", self.public_base_url, job.id);

        // Retried with backoff by the caller in a real deployment; a
        // single attempt here never alters the Job's terminal state
        // regardless of outcome (`spec.md` §6.5).
        if let Err(e) = forge
            .post_status(&repo.full_name(), &job.commit_sha, state, &description, &target_url)
            .await
        {
            warn!(job_id = %job.id, error = %e, "failed to post forge status");
        }
    }
}
