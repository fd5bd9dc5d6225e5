//! Job Factory (`spec.md` §4.2): from a `NormalizedEvent` + matching
//! `Repository`, materialize zero or more durable `Job`s.
//!
//! Grounded on `buildit-api/src/routes/webhooks.rs::handle_push_event`'s
//! per-pipeline fan-out loop, generalized from "one pipeline run" to
//! "one Job per label" and from a single trigger kind to push/tag/PR.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use humantime::parse_duration;
use tracing::warn;

use cinch_core::event::{EventKind, NormalizedEvent, PrAction};
use cinch_core::job::{Job, JobStatus, TrustLevel};
use cinch_core::repository::Repository;
use cinch_core::storage::Storage;
use cinch_core::trust::{compute_trust_level, AccessLevel};
use cinch_core::{JobId, Result};
use cinch_hub::{AccessCache, Hub};

const DEFAULT_TIMEOUT: &str = "30m";

/// Build and persist every Job the event fans out to. A per-Job
/// persistence failure is logged and that Job is skipped; the rest of
/// the fan-out still proceeds (`spec.md` §4.2 "A failure to persist is
/// fatal for that Job only").
pub async fn create_jobs(
    event: &NormalizedEvent,
    repo: &Repository,
    storage: &Arc<dyn Storage>,
    access_cache: &Arc<AccessCache>,
    hub: &Arc<Hub>,
) -> Result<Vec<Job>> {
    let drafts = match &event.kind {
        EventKind::Push(push) => {
            let is_tag = push.tag.is_some();
            let command = repo.command_for(is_tag).to_string();
            let access = access_cache
                .get(event.forge, &event.repository_full_name, &event.sender_login)
                .await
                .unwrap_or(AccessLevel::None);
            let trust_level = compute_trust_level(
                event.sender_login == repo.owner,
                access,
                false,
            );
            repo.fanout_labels()
                .into_iter()
                .map(|labels| JobDraft {
                    commit_sha: push.commit_sha.clone(),
                    branch: push.branch.clone(),
                    tag: push.tag.clone(),
                    pr_number: None,
                    pr_base_branch: None,
                    trust_level,
                    is_fork: false,
                    command: command.clone(),
                    required_labels: labels.into_iter().collect(),
                })
                .collect::<Vec<_>>()
        }
        EventKind::PullRequest(pr) => {
            if !matches!(pr.action, PrAction::Opened | PrAction::Reopened | PrAction::Synchronize) {
                return Ok(Vec::new());
            }
            let access = access_cache
                .get(event.forge, &event.repository_full_name, &event.sender_login)
                .await
                .unwrap_or(AccessLevel::None);
            let trust_level = compute_trust_level(
                event.sender_login == repo.owner,
                access,
                pr.head_is_fork,
            );
            repo.fanout_labels()
                .into_iter()
                .map(|labels| JobDraft {
                    commit_sha: pr.head_sha.clone(),
                    branch: None,
                    tag: None,
                    pr_number: Some(pr.pr_number),
                    pr_base_branch: Some(pr.base_branch.clone()),
                    trust_level,
                    is_fork: pr.head_is_fork,
                    command: repo.build_command.clone(),
                    required_labels: labels.into_iter().collect(),
                })
                .collect::<Vec<_>>()
        }
        EventKind::PrResync(_) => return Ok(Vec::new()),
    };

    let timeout = parse_duration(DEFAULT_TIMEOUT).unwrap_or(Duration::from_secs(30 * 60));
    let mut created = Vec::with_capacity(drafts.len());

    for draft in drafts {
        let status = if draft.trust_level == TrustLevel::External
            && !hub.has_personal_session_for(&event.sender_stable_id).await
        {
            JobStatus::PendingContributor
        } else {
            JobStatus::Pending
        };

        let job = Job {
            id: JobId::new(),
            repository_id: repo.id,
            forge: event.forge,
            commit_sha: draft.commit_sha,
            branch: draft.branch,
            tag: draft.tag,
            pr_number: draft.pr_number,
            pr_base_branch: draft.pr_base_branch,
            trust_level: draft.trust_level,
            is_fork: draft.is_fork,
            author_login: event.sender_login.clone(),
            author_stable_id: event.sender_stable_id.clone(),
            command: draft.command,
            env: repo.env.clone(),
            timeout,
            required_labels: draft.required_labels,
            status,
            assigned_executor: None,
            exit_code: None,
            terminal_reason: None,
            approved_by: None,
            approved_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        match storage.create_job(job).await {
            Ok(job) => created.push(job),
            Err(e) => warn!(repo = %repo.full_name(), error = %e, "failed to persist job, skipping"),
        }
    }

    Ok(created)
}

struct JobDraft {
    commit_sha: String,
    branch: Option<String>,
    tag: Option<String>,
    pr_number: Option<u64>,
    pr_base_branch: Option<String>,
    trust_level: TrustLevel,
    is_fork: bool,
    command: String,
    required_labels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinch_core::repository::{EncryptedSecret, ForgeKind};
    use cinch_core::test_support::MemoryStorage;
    use cinch_core::RepositoryId;
    use std::collections::HashMap as Map;

    fn repo() -> Repository {
        Repository {
            id: RepositoryId::new(),
            forge: ForgeKind::Github,
            owner: "alice".to_string(),
            name: "app".to_string(),
            clone_url: "https://github.com/alice/app.git".to_string(),
            public_url: "https://github.com/alice/app".to_string(),
            is_private: false,
            webhook_secret: EncryptedSecret { ciphertext: vec![], nonce: vec![] },
            forge_credential: None,
            build_command: "make check".to_string(),
            release_command: None,
            workers: vec![],
            env: Map::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn owner_push_creates_single_pending_job() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let access_cache = Arc::new(AccessCache::default());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        let event = NormalizedEvent {
            forge: ForgeKind::Github,
            repository_full_name: repo.full_name(),
            kind: EventKind::Push(cinch_core::event::PushEvent {
                commit_sha: "abc1234".to_string(),
                branch: Some("main".to_string()),
                tag: None,
            }),
            sender_login: "alice".to_string(),
            sender_stable_id: "alice-id".to_string(),
        };
        let jobs = create_jobs(&event, &repo, &storage, &access_cache, &hub)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trust_level, TrustLevel::Owner);
        assert_eq!(jobs[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn external_pr_without_personal_worker_is_pending_contributor() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let access_cache = Arc::new(AccessCache::default());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        let event = NormalizedEvent {
            forge: ForgeKind::Github,
            repository_full_name: repo.full_name(),
            kind: EventKind::PullRequest(cinch_core::event::PullRequestEvent {
                action: PrAction::Opened,
                head_sha: "def5678".to_string(),
                base_branch: "main".to_string(),
                head_is_fork: true,
                pr_number: 7,
            }),
            sender_login: "mallory".to_string(),
            sender_stable_id: "mallory-id".to_string(),
        };
        let jobs = create_jobs(&event, &repo, &storage, &access_cache, &hub)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trust_level, TrustLevel::External);
        assert_eq!(jobs[0].status, JobStatus::PendingContributor);
    }
}
