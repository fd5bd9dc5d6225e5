//! The Dispatcher: matches queued jobs to eligible executor sessions
//! and owns the `pending -> assigned` transition (`spec.md` §4.4).
//!
//! Grounded on `buildit-scheduler::orchestrator::PipelineOrchestrator`
//! for the "spawn one task driven by an mpsc event channel" shape, and
//! on `buildit-scheduler::queue::JobQueue`'s conditional claim/release
//! style — generalized here to conditional Job-status transitions
//! against `Storage` directly, since Job status IS the queue state
//! (`spec.md` §3), rather than a dedicated `job_queue` table.

mod locks;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use cinch_core::job::{Job, JobStatus, TerminalReason};
use cinch_core::repository::Repository;
use cinch_core::storage::Storage;
use cinch_core::{Error, JobId, Result, WorkerId};
use cinch_hub::{Hub, MatchRequest};
use cinch_protocol::{JobDescriptor, RejectReason, ServerMessage};

pub use locks::JobLocks;

/// Builds the `JobDescriptor` an executor needs to run a job, including
/// minting any short-lived clone credential. Kept out of this crate so
/// the Dispatcher never depends on a specific `Forge` implementation
/// (`spec.md` §9 Design Notes: forge adapters are a capability tag plus
/// dispatch table, not something the dispatch core reaches into).
#[async_trait]
pub trait DescriptorFactory: Send + Sync {
    async fn build(&self, job: &Job, repo: &Repository) -> Result<JobDescriptor>;
}

/// Invoked once per Job terminal transition (`spec.md` §6.5 "Outgoing
/// hooks"). Implementations own their own retry-with-backoff; a
/// failure here MUST NOT alter the Job's terminal state, which is why
/// this is a fire-and-forget notification rather than a `Result`.
#[async_trait]
pub trait TerminalHook: Send + Sync {
    async fn on_terminal(&self, job: &Job);
}

/// Events that wake the Dispatcher's decision loop (`spec.md` §5:
/// "suspends on a condition variable fed by (a) newly-persisted Jobs,
/// (b) Hub register/unregister events, (c) session
/// JOB_REJECT/JOB_COMPLETE events").
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    JobReady(JobId),
    HubChanged,
    JobRejected { job_id: JobId, worker_id: WorkerId, reason: RejectReason },
    JobAck { job_id: JobId },
}

const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    hub: Arc<Hub>,
    descriptors: Arc<dyn DescriptorFactory>,
    hook: Arc<dyn TerminalHook>,
    locks: JobLocks,
    queue_timeout: Duration,
    /// Jobs excluded from the candidate set for the current attempt
    /// only, per `spec.md` §4.4 step 7 ("remove that executor from the
    /// candidate set for this attempt only").
    rejected_this_attempt: tokio::sync::Mutex<std::collections::HashMap<JobId, HashSet<WorkerId>>>,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        hub: Arc<Hub>,
        descriptors: Arc<dyn DescriptorFactory>,
        hook: Arc<dyn TerminalHook>,
    ) -> Self {
        Self {
            storage,
            hub,
            descriptors,
            hook,
            locks: JobLocks::new(),
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            rejected_this_attempt: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Spawn the event loop, returning the sender side other
    /// components (webhook handlers, the Hub, session readers) use to
    /// wake it.
    pub fn spawn(self: Arc<Self>) -> mpsc::Sender<DispatchEvent> {
        let (tx, mut rx) = mpsc::channel::<DispatchEvent>(1024);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatcher.handle_event(event).await;
            }
        });
        tx
    }

    async fn handle_event(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::JobReady(job_id) => self.try_dispatch(job_id).await,
            DispatchEvent::HubChanged => {
                // A real deployment would re-scan the pending set here;
                // the core's queue timeout sweep and webhook-triggered
                // JobReady events are what actually requeue work, so
                // this is a log-only hook point for now.
            }
            DispatchEvent::JobRejected { job_id, worker_id, reason } => {
                self.on_reject(job_id, worker_id, reason).await;
            }
            DispatchEvent::JobAck { job_id } => {
                self.on_ack(job_id).await;
            }
        }
    }

    /// `spec.md` §4.4 steps 1-6: pop, validate, match, assign.
    pub async fn try_dispatch(&self, job_id: JobId) {
        let _guard = self.locks.lock(job_id).await;

        let job = match self.storage.get_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(%job_id, error = %e, "job vanished before dispatch");
                return;
            }
        };

        if !matches!(job.status, JobStatus::Pending | JobStatus::PendingContributor) {
            return; // step 2: not eligible for (re)dispatch, drop.
        }

        let repo = match self.storage.get_repository(job.repository_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(%job_id, error = %e, "repository missing for job");
                return;
            }
        };

        let excluded = self
            .rejected_this_attempt
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default();

        let required_labels: HashSet<String> = job.required_labels.iter().cloned().collect();
        let req = MatchRequest {
            trust_level: job.trust_level,
            author_stable_id: &job.author_stable_id,
            repository_id: job.repository_id,
            has_approval: job.approved_by.is_some(),
            required_labels: &required_labels,
        };
        let candidates: Vec<_> = self
            .hub
            .match_candidates(&req)
            .await
            .into_iter()
            .filter(|c| !excluded.contains(&c.worker_id))
            .collect();

        let Some(candidate) = candidates.into_iter().next() else {
            let age = Utc::now().signed_duration_since(job.created_at);
            if age.to_std().unwrap_or_default() > self.queue_timeout {
                let _ = self
                    .storage
                    .update_job_status(
                        job_id,
                        &[JobStatus::Pending, JobStatus::PendingContributor],
                        JobStatus::Error,
                        None,
                        None,
                        Some(TerminalReason::NoEligibleWorker),
                    )
                    .await
                    .inspect(|updated| {
                        let hook = self.hook.clone();
                        let updated = updated.clone();
                        tokio::spawn(async move { hook.on_terminal(&updated).await });
                    });
                info!(%job_id, "no eligible worker within queue_timeout; job errored");
            }
            // Otherwise: leave pending. The next Hub-change notification
            // or queue-timeout sweep will reconsider it.
            return;
        };

        let descriptor = match self.descriptors.build(&job, &repo).await {
            Ok(d) => d,
            Err(e) => {
                warn!(%job_id, error = %e, "failed to build job descriptor");
                return;
            }
        };

        match candidate.sink.send(ServerMessage::JobAssign { descriptor }).await {
            Ok(()) => {
                match self
                    .storage
                    .update_job_status(
                        job_id,
                        &[JobStatus::Pending, JobStatus::PendingContributor],
                        JobStatus::Assigned,
                        Some(candidate.worker_id),
                        None,
                        None,
                    )
                    .await
                {
                    Ok(_) => {
                        self.hub.mark_job_active(candidate.worker_id, job_id).await;
                        info!(%job_id, worker_id = %candidate.worker_id, "job assigned");
                    }
                    Err(e) => {
                        warn!(%job_id, error = %e, "conditional assign write lost a race; discarding");
                    }
                }
            }
            Err(_) => {
                // step 6: send failed (session closed mid-assign); job
                // stays pending and will be retried on the next event.
                warn!(%job_id, worker_id = %candidate.worker_id, "send failed, job remains pending");
            }
        }
    }

    /// `spec.md` §4.4 step 7: executor declined; retry against the
    /// remaining candidate set for this attempt only.
    async fn on_reject(&self, job_id: JobId, worker_id: WorkerId, reason: RejectReason) {
        info!(%job_id, %worker_id, ?reason, "executor rejected assignment");
        let _ = self
            .storage
            .update_job_status(
                job_id,
                &[JobStatus::Assigned],
                JobStatus::Pending,
                None,
                None,
                None,
            )
            .await;
        self.hub.mark_job_done(worker_id, job_id).await;
        self.rejected_this_attempt
            .lock()
            .await
            .entry(job_id)
            .or_default()
            .insert(worker_id);
        self.try_dispatch(job_id).await;
    }

    /// `spec.md` §4.4 step 8: `assigned -> running`.
    async fn on_ack(&self, job_id: JobId) {
        match self
            .storage
            .update_job_status(job_id, &[JobStatus::Assigned], JobStatus::Running, None, None, None)
            .await
        {
            Ok(_) => info!(%job_id, "job running"),
            Err(e) => warn!(%job_id, error = %e, "ack for non-assigned job discarded"),
        }
        self.rejected_this_attempt.lock().await.remove(&job_id);
    }

    /// `spec.md` §4.4 "Cancellation": issue `JOB_CANCEL` if assigned,
    /// else transition directly.
    pub async fn cancel_job(&self, job_id: JobId, reason: &str) -> Result<()> {
        let _guard = self.locks.lock(job_id).await;
        let job = self.storage.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(Error::Conflict(format!("job {job_id} already terminal")));
        }
        if let Some(worker_id) = job.assigned_executor {
            if let Some(sink) = self.hub.sink_for(worker_id).await {
                let _ = sink
                    .send(ServerMessage::JobCancel {
                        job_id,
                        reason: reason.to_string(),
                    })
                    .await;
            }
            // The terminal transition lands when the session confirms
            // via a JOB_COMPLETE/JOB_ERROR carrying a cancelled reason;
            // callers of `cancel_job` only need the signal to go out.
            Ok(())
        } else {
            self.storage
                .update_job_status(
                    job_id,
                    &[JobStatus::Pending, JobStatus::PendingContributor],
                    JobStatus::Cancelled,
                    None,
                    None,
                    Some(TerminalReason::Cancelled { by: None }),
                )
                .await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinch_core::job::TrustLevel;
    use cinch_core::repository::{EncryptedSecret, ForgeKind};
    use cinch_core::test_support::MemoryStorage;
    use cinch_core::{RepositoryId, WorkerMode};
    use std::collections::HashMap as Map;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use tokio::time::timeout;

    struct RecordingSink {
        sent: StdMutex<Vec<ServerMessage>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { sent: StdMutex::new(Vec::new()) }
        }

        fn messages(&self) -> Vec<ServerMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl cinch_hub::SessionSink for RecordingSink {
        async fn send(&self, msg: ServerMessage) -> std::result::Result<(), cinch_hub::SinkError> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    struct StubDescriptors;

    #[async_trait]
    impl DescriptorFactory for StubDescriptors {
        async fn build(&self, job: &Job, repo: &Repository) -> Result<JobDescriptor> {
            Ok(JobDescriptor {
                job_id: job.id,
                clone_url: repo.clone_url.clone(),
                clone_token: None,
                head_sha: job.commit_sha.clone(),
                branch: job.branch.clone(),
                tag: job.tag.clone(),
                pr_base: job.pr_base_branch.clone(),
                forge: job.forge,
                command: job.command.clone(),
                timeout_secs: job.timeout.as_secs(),
                env: job.env.clone(),
                trust_level: job.trust_level,
            })
        }
    }

    /// Forwards each terminal job over an unbounded channel so tests can
    /// `recv` it instead of racing the `tokio::spawn` inside `try_dispatch`.
    struct ChannelHook {
        tx: UnboundedSender<Job>,
    }

    #[async_trait]
    impl TerminalHook for ChannelHook {
        async fn on_terminal(&self, job: &Job) {
            let _ = self.tx.send(job.clone());
        }
    }

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

    fn pending_job(repository_id: RepositoryId) -> Job {
        Job {
            id: JobId::new(),
            repository_id,
            forge: ForgeKind::Github,
            commit_sha: "abc1234".to_string(),
            branch: Some("main".to_string()),
            tag: None,
            pr_number: None,
            pr_base_branch: None,
            trust_level: TrustLevel::Owner,
            is_fork: false,
            author_login: "alice".to_string(),
            author_stable_id: "alice-id".to_string(),
            command: "make check".to_string(),
            env: Map::new(),
            timeout: Duration::from_secs(60),
            required_labels: vec![],
            status: JobStatus::Pending,
            assigned_executor: None,
            exit_code: None,
            terminal_reason: None,
            approved_by: None,
            approved_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn dispatcher(storage: Arc<dyn Storage>, hub: Arc<Hub>) -> Dispatcher {
        let (tx, _rx) = unbounded_channel();
        Dispatcher::new(storage, hub, Arc::new(StubDescriptors), Arc::new(ChannelHook { tx }))
    }

    async fn register_worker(hub: &Hub, repo: RepositoryId) -> WorkerId {
        let worker_id = WorkerId::new();
        hub.register(
            worker_id,
            Arc::new(RecordingSink::new()),
            HashSet::new(),
            WorkerMode::Shared,
            HashSet::from([repo]),
            "ci-owner".to_string(),
            "ci".to_string(),
        )
        .await;
        worker_id
    }

    #[tokio::test]
    async fn try_dispatch_assigns_to_eligible_candidate_without_double_assign() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();
        let worker_id = register_worker(&hub, repo.id).await;

        let job = storage.create_job(pending_job(repo.id)).await.unwrap();
        let d = dispatcher(storage.clone(), hub.clone());
        d.try_dispatch(job.id).await;

        let updated = storage.get_job(job.id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Assigned);
        assert_eq!(updated.assigned_executor, Some(worker_id));
        assert!(hub.active_jobs_for(worker_id).await.contains(&job.id));

        // A second dispatch attempt on the now-Assigned job must be a
        // no-op: it must not re-assign or double-count active jobs.
        d.try_dispatch(job.id).await;
        let still = storage.get_job(job.id).await.unwrap();
        assert_eq!(still.status, JobStatus::Assigned);
        assert_eq!(hub.active_jobs_for(worker_id).await.len(), 1);
    }

    #[tokio::test]
    async fn on_reject_requeues_and_retries_remaining_candidate() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();
        let w1 = register_worker(&hub, repo.id).await;
        let w2 = register_worker(&hub, repo.id).await;

        let job = storage.create_job(pending_job(repo.id)).await.unwrap();
        let d = dispatcher(storage.clone(), hub.clone());
        d.try_dispatch(job.id).await;

        let assigned = storage.get_job(job.id).await.unwrap();
        let first_pick = assigned.assigned_executor.expect("one candidate should be assigned");
        let other = if first_pick == w1 { w2 } else { w1 };

        d.on_reject(job.id, first_pick, RejectReason::AtCapacity).await;

        let retried = storage.get_job(job.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Assigned);
        assert_eq!(retried.assigned_executor, Some(other));
        assert!(!hub.active_jobs_for(first_pick).await.contains(&job.id));
    }

    #[tokio::test]
    async fn on_ack_transitions_assigned_to_running() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();
        register_worker(&hub, repo.id).await;

        let job = storage.create_job(pending_job(repo.id)).await.unwrap();
        let d = dispatcher(storage.clone(), hub.clone());
        d.try_dispatch(job.id).await;
        d.on_ack(job.id).await;

        let updated = storage.get_job(job.id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn try_dispatch_errors_job_with_no_eligible_worker_past_queue_timeout() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();
        // No worker registered at all: no candidate will ever match.

        let mut stale = pending_job(repo.id);
        stale.created_at = Utc::now() - chrono::Duration::hours(1);
        let job = storage.create_job(stale).await.unwrap();

        let (tx, mut rx) = unbounded_channel();
        let d = Dispatcher::new(
            storage.clone(),
            hub.clone(),
            Arc::new(StubDescriptors),
            Arc::new(ChannelHook { tx }),
        )
        .with_queue_timeout(Duration::from_secs(0));
        d.try_dispatch(job.id).await;

        let errored = storage.get_job(job.id).await.unwrap();
        assert_eq!(errored.status, JobStatus::Error);
        assert!(matches!(errored.terminal_reason, Some(TerminalReason::NoEligibleWorker)));

        let hooked = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("terminal hook should fire")
            .expect("channel should carry the errored job");
        assert_eq!(hooked.id, job.id);
    }

    #[tokio::test]
    async fn cancel_job_sends_job_cancel_to_the_assigned_sink() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();

        let worker_id = WorkerId::new();
        let sink = Arc::new(RecordingSink::new());
        hub.register(
            worker_id,
            sink.clone(),
            HashSet::new(),
            WorkerMode::Shared,
            HashSet::from([repo.id]),
            "ci-owner".to_string(),
            "ci".to_string(),
        )
        .await;

        let job = storage.create_job(pending_job(repo.id)).await.unwrap();
        let d = dispatcher(storage.clone(), hub.clone());
        d.try_dispatch(job.id).await;
        assert_eq!(storage.get_job(job.id).await.unwrap().assigned_executor, Some(worker_id));

        d.cancel_job(job.id, "user requested").await.unwrap();

        let messages = sink.messages();
        assert!(messages.iter().any(|m| matches!(m, ServerMessage::JobAssign { .. })));
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::JobCancel { job_id, .. } if *job_id == job.id
        )));
    }

    #[tokio::test]
    async fn cancel_job_transitions_unassigned_job_directly_to_cancelled() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();
        // No worker registered, so the job stays Pending/unassigned.

        let job = storage.create_job(pending_job(repo.id)).await.unwrap();
        let d = dispatcher(storage.clone(), hub.clone());
        d.cancel_job(job.id, "user requested").await.unwrap();

        let updated = storage.get_job(job.id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Cancelled);
        assert!(matches!(updated.terminal_reason, Some(TerminalReason::Cancelled { .. })));
    }
}
