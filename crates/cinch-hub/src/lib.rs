//! The Hub: in-memory registry of live executor sessions (`spec.md` §4.3).
//!
//! Everything here is process-local and ephemeral, per the "Live
//! connection tracking vs. durable state" split in `spec.md` §9 Design
//! Notes: the Hub never touches `Storage`, and `Storage` never sees a
//! session handle. Grounded on `buildit-api::ws::Broadcaster`'s
//! "shared registry behind an `Arc`, cloned into handlers" shape,
//! generalized from one broadcast channel to a per-executor unicast
//! registry with narrow, typed operations (`buildit-scheduler::queue`'s
//! style of explicit methods rather than ad hoc map access).

mod access_cache;
mod session;

pub use access_cache::AccessCache;
pub use session::{SessionEntry, SessionSink, SinkError};

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use cinch_core::{JobId, RepositoryId, TrustLevel, WorkerId, WorkerMode};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("auth rejected: {0}")]
    AuthRejected(String),
}

/// A candidate session eligible to run a job, in priority order
/// (`spec.md` §4.3 matching rules).
#[derive(Clone)]
pub struct Candidate {
    pub worker_id: WorkerId,
    pub sink: Arc<dyn SessionSink>,
    pub generation: u64,
}

/// Everything the Hub needs to know about a job in order to apply the
/// `spec.md` §4.3 matching rules; deliberately a read-only view (id +
/// last-known-state), never the durable `Job` itself, per §3's
/// "Dispatcher holds only references into the above" invariant.
pub struct MatchRequest<'a> {
    pub trust_level: TrustLevel,
    pub author_stable_id: &'a str,
    pub repository_id: RepositoryId,
    pub has_approval: bool,
    pub required_labels: &'a std::collections::HashSet<String>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<WorkerId, SessionEntry>,
    generations: HashMap<WorkerId, u64>,
    /// Cache-warmth signal for tie-break (b): last successful job per
    /// (worker, repository). Purely an in-process hint, never durable.
    last_success: HashMap<(WorkerId, RepositoryId), DateTime<Utc>>,
}

/// In-memory registry of live executor sessions.
///
/// The session map is protected by a `tokio::sync::RwLock`: lookups
/// (`match_candidates`, `list_visible_to`, `snapshot`) take read locks,
/// `register`/`unregister` take write locks, matching `spec.md` §5's
/// "readers-writer lock" requirement.
pub struct Hub {
    state: RwLock<RegistryState>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Register a newly authenticated session, displacing any prior
    /// live session for the same executor id and returning the new
    /// generation (`spec.md` §4.3 `Register`, invariant 2).
    pub async fn register(
        &self,
        worker_id: WorkerId,
        sink: Arc<dyn SessionSink>,
        labels: std::collections::HashSet<String>,
        mode: WorkerMode,
        registered_repos: std::collections::HashSet<RepositoryId>,
        owner_principal_id: String,
        owner_login: String,
    ) -> u64 {
        let mut state = self.state.write().await;
        let generation = state
            .generations
            .get(&worker_id)
            .map(|g| g + 1)
            .unwrap_or(1);
        state.generations.insert(worker_id, generation);

        if let Some(prior) = state.sessions.remove(&worker_id) {
            debug!(%worker_id, prior_generation = prior.generation, "displacing prior session");
        }

        state.sessions.insert(
            worker_id,
            SessionEntry {
                worker_id,
                sink,
                generation,
                labels,
                mode,
                registered_repos,
                owner_principal_id,
                owner_login,
                active_jobs: Default::default(),
                last_heartbeat: Utc::now(),
            },
        );
        info!(%worker_id, generation, "executor registered");
        generation
    }

    /// Remove a session, but only if `generation` matches the current
    /// live generation. Idempotent: unregistering a stale or absent
    /// generation is a no-op (`spec.md` §4.3 `Unregister`).
    pub async fn unregister(&self, worker_id: WorkerId, generation: u64) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.sessions.get(&worker_id) {
            if entry.generation == generation {
                state.sessions.remove(&worker_id);
                info!(%worker_id, generation, "executor unregistered");
            }
        }
    }

    pub async fn touch_heartbeat(&self, worker_id: WorkerId, generation: u64) -> bool {
        let mut state = self.state.write().await;
        if let Some(entry) = state.sessions.get_mut(&worker_id) {
            if entry.generation == generation {
                entry.last_heartbeat = Utc::now();
                return true;
            }
        }
        false
    }

    pub async fn mark_job_active(&self, worker_id: WorkerId, job_id: JobId) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.sessions.get_mut(&worker_id) {
            entry.active_jobs.insert(job_id);
        }
    }

    /// Remove a job from a worker's in-flight set, regardless of outcome.
    pub async fn mark_job_done(&self, worker_id: WorkerId, job_id: JobId) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.sessions.get_mut(&worker_id) {
            entry.active_jobs.remove(&job_id);
        }
    }

    /// Record cache-warmth for tie-break (b): a job succeeded on
    /// `worker_id` for `repo`. Callers also call `mark_job_done`.
    pub async fn record_job_success(&self, worker_id: WorkerId, repo: RepositoryId) {
        let mut state = self.state.write().await;
        state.last_success.insert((worker_id, repo), Utc::now());
    }

    /// Find executor ids whose `last_heartbeat` is older than `max_age`
    /// (`spec.md` §4.5: dead after 90s without a `PING`). Callers drive
    /// the actual unregister via `unregister`.
    pub async fn dead_sessions(&self, max_age: chrono::Duration) -> Vec<(WorkerId, u64)> {
        let state = self.state.read().await;
        let cutoff = Utc::now() - max_age;
        state
            .sessions
            .values()
            .filter(|e| e.last_heartbeat < cutoff)
            .map(|e| (e.worker_id, e.generation))
            .collect()
    }

    /// Whether `author_stable_id` currently has a live personal session.
    /// Used by the Job Factory to decide `pending` vs `pending_contributor`
    /// for external-trust jobs (`spec.md` §4.2).
    pub async fn has_personal_session_for(&self, author_stable_id: &str) -> bool {
        let state = self.state.read().await;
        state
            .sessions
            .values()
            .any(|e| e.mode == WorkerMode::Personal && e.owner_principal_id == author_stable_id)
    }

    /// `spec.md` §4.3 `MatchCandidates`: ordered list of eligible
    /// session handles. Never errors; may return empty.
    pub async fn match_candidates(&self, req: &MatchRequest<'_>) -> Vec<Candidate> {
        let state = self.state.read().await;
        let author_has_personal_session = state
            .sessions
            .values()
            .any(|e| e.mode == WorkerMode::Personal && e.owner_principal_id == req.author_stable_id);

        let mut eligible: Vec<&SessionEntry> = state
            .sessions
            .values()
            .filter(|e| req.required_labels.is_subset(&e.labels))
            .filter(|e| self.is_eligible(e, req, author_has_personal_session))
            .collect();

        eligible.sort_by(|a, b| {
            let a_load = a.active_jobs.len();
            let b_load = b.active_jobs.len();
            a_load
                .cmp(&b_load)
                .then_with(|| {
                    let a_warm = state.last_success.get(&(a.worker_id, req.repository_id));
                    let b_warm = state.last_success.get(&(b.worker_id, req.repository_id));
                    b_warm.cmp(&a_warm) // more recent first
                })
                .then_with(|| stable_hash(a.worker_id).cmp(&stable_hash(b.worker_id)))
        });

        eligible
            .into_iter()
            .map(|e| Candidate {
                worker_id: e.worker_id,
                sink: e.sink.clone(),
                generation: e.generation,
            })
            .collect()
    }

    fn is_eligible(
        &self,
        entry: &SessionEntry,
        req: &MatchRequest<'_>,
        author_has_personal_session: bool,
    ) -> bool {
        match req.trust_level {
            TrustLevel::Owner | TrustLevel::Collaborator => {
                (entry.mode == WorkerMode::Personal
                    && entry.owner_principal_id == req.author_stable_id)
                    || (entry.mode == WorkerMode::Shared
                        && !author_has_personal_session
                        && entry.registered_repos.contains(&req.repository_id))
            }
            TrustLevel::External => {
                req.has_approval
                    && entry.mode == WorkerMode::Shared
                    && entry.registered_repos.contains(&req.repository_id)
            }
        }
    }

    /// The job ids this Hub currently believes are active on `worker_id`,
    /// for reconciling against an executor's own `PING` active-job list
    /// (`spec.md` §4.5 "current active-job list for reconciliation").
    pub async fn active_jobs_for(&self, worker_id: WorkerId) -> std::collections::HashSet<JobId> {
        let state = self.state.read().await;
        state
            .sessions
            .get(&worker_id)
            .map(|e| e.active_jobs.clone())
            .unwrap_or_default()
    }

    /// Direct, eligibility-independent lookup of a live session's sink.
    /// Unlike `match_candidates`, this is not filtered by `is_eligible` —
    /// callers acting on an *already-assigned* worker (e.g. forwarding a
    /// `JOB_CANCEL`) must not have that worker excluded just because its
    /// eligibility for a fresh assignment has since changed.
    pub async fn sink_for(&self, worker_id: WorkerId) -> Option<Arc<dyn SessionSink>> {
        let state = self.state.read().await;
        state.sessions.get(&worker_id).map(|e| e.sink.clone())
    }

    /// Immutable view for admin APIs (`spec.md` §4.3 `Snapshot`).
    pub async fn snapshot(&self) -> Vec<WorkerSummary> {
        let state = self.state.read().await;
        state.sessions.values().map(WorkerSummary::from).collect()
    }

    /// Filtered view per `spec.md` §4.8 visibility rules.
    pub async fn list_visible_to(
        &self,
        viewer_principal_id: &str,
        viewer_write_repos: &std::collections::HashSet<RepositoryId>,
    ) -> Vec<WorkerSummary> {
        let state = self.state.read().await;
        state
            .sessions
            .values()
            .filter(|e| match e.mode {
                WorkerMode::Personal => e.owner_principal_id == viewer_principal_id,
                WorkerMode::Shared => e
                    .registered_repos
                    .iter()
                    .any(|r| viewer_write_repos.contains(r)),
            })
            .map(WorkerSummary::from)
            .collect()
    }
}

fn stable_hash(id: WorkerId) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

/// Read-only snapshot of a live session, safe to serialize for admin APIs.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSummary {
    pub worker_id: WorkerId,
    pub mode: WorkerMode,
    pub labels: std::collections::HashSet<String>,
    pub registered_repos: std::collections::HashSet<RepositoryId>,
    pub active_job_count: usize,
    pub last_heartbeat: DateTime<Utc>,
}

impl From<&SessionEntry> for WorkerSummary {
    fn from(e: &SessionEntry) -> Self {
        Self {
            worker_id: e.worker_id,
            mode: e.mode,
            labels: e.labels.clone(),
            registered_repos: e.registered_repos.clone(),
            active_job_count: e.active_jobs.len(),
            last_heartbeat: e.last_heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cinch_protocol::ServerMessage;
    use std::collections::HashSet;

    struct NullSink;

    #[async_trait]
    impl SessionSink for NullSink {
        async fn send(&self, _msg: ServerMessage) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_displaces_and_bumps_generation() {
        let hub = Hub::new();
        let worker_id = WorkerId::new();
        let g1 = hub
            .register(
                worker_id,
                Arc::new(NullSink),
                HashSet::new(),
                WorkerMode::Shared,
                HashSet::new(),
                "p1".into(),
                "alice".into(),
            )
            .await;
        let g2 = hub
            .register(
                worker_id,
                Arc::new(NullSink),
                HashSet::new(),
                WorkerMode::Shared,
                HashSet::new(),
                "p1".into(),
                "alice".into(),
            )
            .await;
        assert_eq!(g1, 1);
        assert_eq!(g2, 2);
        assert_eq!(hub.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent_on_stale_generation() {
        let hub = Hub::new();
        let worker_id = WorkerId::new();
        let g1 = hub
            .register(
                worker_id,
                Arc::new(NullSink),
                HashSet::new(),
                WorkerMode::Shared,
                HashSet::new(),
                "p1".into(),
                "alice".into(),
            )
            .await;
        hub.register(
            worker_id,
            Arc::new(NullSink),
            HashSet::new(),
            WorkerMode::Shared,
            HashSet::new(),
            "p1".into(),
            "alice".into(),
        )
        .await;
        // Stale generation: should not remove the current (2nd) session.
        hub.unregister(worker_id, g1).await;
        assert_eq!(hub.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn personal_worker_only_eligible_for_its_owner() {
        let hub = Hub::new();
        let worker_id = WorkerId::new();
        hub.register(
            worker_id,
            Arc::new(NullSink),
            HashSet::new(),
            WorkerMode::Personal,
            HashSet::new(),
            "alice-id".into(),
            "alice".into(),
        )
        .await;
        let repo = RepositoryId::new();
        let labels = HashSet::new();
        let req = MatchRequest {
            trust_level: TrustLevel::Owner,
            author_stable_id: "bob-id",
            repository_id: repo,
            has_approval: false,
            required_labels: &labels,
        };
        assert!(hub.match_candidates(&req).await.is_empty());

        let req2 = MatchRequest {
            trust_level: TrustLevel::Owner,
            author_stable_id: "alice-id",
            repository_id: repo,
            has_approval: false,
            required_labels: &labels,
        };
        assert_eq!(hub.match_candidates(&req2).await.len(), 1);
    }

    #[tokio::test]
    async fn external_requires_approval_and_shared_registered_repo() {
        let hub = Hub::new();
        let worker_id = WorkerId::new();
        let repo = RepositoryId::new();
        hub.register(
            worker_id,
            Arc::new(NullSink),
            HashSet::new(),
            WorkerMode::Shared,
            HashSet::from([repo]),
            "ci-owner".into(),
            "ci".into(),
        )
        .await;
        let labels = HashSet::new();
        let req = MatchRequest {
            trust_level: TrustLevel::External,
            author_stable_id: "mallory-id",
            repository_id: repo,
            has_approval: false,
            required_labels: &labels,
        };
        assert!(hub.match_candidates(&req).await.is_empty());

        let req2 = MatchRequest {
            has_approval: true,
            ..req
        };
        assert_eq!(hub.match_candidates(&req2).await.len(), 1);
    }

    #[tokio::test]
    async fn fewer_active_assignments_wins_tie_break() {
        let hub = Hub::new();
        let repo = RepositoryId::new();
        let busy = WorkerId::new();
        let idle = WorkerId::new();
        for id in [busy, idle] {
            hub.register(
                id,
                Arc::new(NullSink),
                HashSet::new(),
                WorkerMode::Shared,
                HashSet::from([repo]),
                "ci-owner".into(),
                "ci".into(),
            )
            .await;
        }
        hub.mark_job_active(busy, JobId::new()).await;
        let labels = HashSet::new();
        let req = MatchRequest {
            trust_level: TrustLevel::External,
            author_stable_id: "mallory-id",
            repository_id: repo,
            has_approval: true,
            required_labels: &labels,
        };
        let candidates = hub.match_candidates(&req).await;
        assert_eq!(candidates[0].worker_id, idle);
    }
}
