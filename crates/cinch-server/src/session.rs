//! Control-plane side of the Session Protocol (`spec.md` §4.5): one
//! Axum WebSocket per executor, authenticated at upgrade time.
//!
//! Grounded on `buildit-api::ws::ws_handler`/`handle_socket`, which
//! split a single socket into sender/receiver and `tokio::select!` over
//! `receiver.next()` and a `broadcast::Receiver`. Generalized here to a
//! full duplex per-session protocol: a dedicated writer task owns the
//! socket's send half (so the Hub, per `spec.md` §5, never writes to a
//! socket directly), and the reader task processes `ExecutorMessage`s
//! and drives Storage/Hub/Dispatcher updates.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};

use cinch_core::job::{JobStatus, TerminalReason};
use cinch_core::log::LogChunk;
use cinch_core::repository::ForgeKind;
use cinch_core::worker::Worker;
use cinch_core::{RepositoryId, WorkerId};
use cinch_dispatcher::DispatchEvent;
use cinch_hub::{SessionSink, SinkError};
use cinch_protocol::{
    decode_executor_message, encode, ExecutorMessage, Phase, RejectReason, ServerMessage,
    StreamTag,
};

use crate::state::AppState;

/// Executor dead after this long without a `PING` (`spec.md` §4.5).
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
/// Time allowed for the first `REGISTER` after `AUTH_OK`.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

struct WsSink {
    tx: mpsc::Sender<ServerMessage>,
}

#[async_trait]
impl SessionSink for WsSink {
    async fn send(&self, msg: ServerMessage) -> Result<(), SinkError> {
        self.tx.send(msg).await.map_err(|_| SinkError::Closed)
    }
}

pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string());
    ws.on_upgrade(move |socket| handle_session(socket, state, token))
}

/// Work-factor-appropriate hashing is a collaborator concern for a real
/// deployment (e.g. argon2); SHA-256 keyed only by the token's own
/// entropy is used here, matching the storage contract of "looked up
/// by hash" without pulling in a new KDF dependency the teacher doesn't
/// otherwise carry.
fn hash_token(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

async fn handle_session(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(token) = token else {
        let _ = send_raw(&mut ws_tx, ServerMessage::AuthFail { reason: "missing bearer token".to_string() }).await;
        return;
    };

    let token_record = match state.storage.find_token_by_hash(&hash_token(&token)).await {
        Ok(Some(record)) if !record.revoked => record,
        Ok(_) => {
            let _ = send_raw(&mut ws_tx, ServerMessage::AuthFail { reason: "invalid or revoked token".to_string() }).await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "token lookup failed");
            let _ = send_raw(&mut ws_tx, ServerMessage::AuthFail { reason: "internal error".to_string() }).await;
            return;
        }
    };

    let worker_id = token_record.worker_id.unwrap_or_else(WorkerId::new);

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(256);
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Ok(json) = encode(&msg) {
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    if out_tx.send(ServerMessage::AuthOk { executor_id: worker_id }).await.is_err() {
        return;
    }

    let register = match tokio::time::timeout(REGISTER_TIMEOUT, next_executor_message(&mut ws_rx)).await {
        Ok(Some(ExecutorMessage::Register {
            labels,
            mode,
            registered_repos,
            capabilities: _,
            version,
            hostname,
        })) => (labels, mode, registered_repos, version, hostname),
        _ => {
            warn!(%worker_id, "session closed before REGISTER arrived");
            return;
        }
    };
    let (labels, mode, registered_repo_names, version, hostname) = register;

    let registered_repos =
        resolve_repository_ids(&state, &registered_repo_names, &token_record.repository_scope).await;

    let worker = Worker {
        id: worker_id,
        display_name: hostname.clone(),
        owner_principal_id: format!("token:{}", token_record.id),
        owner_login: hostname,
        mode,
        labels: labels.into_iter().collect(),
        registered_repos: registered_repos.clone(),
        last_seen_at: chrono::Utc::now(),
    };
    let owner_principal_id = worker.owner_principal_id.clone();
    let owner_login = worker.owner_login.clone();
    let labels = worker.labels.clone();

    if let Err(e) = state.storage.upsert_worker(worker).await {
        warn!(%worker_id, error = %e, "failed to persist worker record");
        return;
    }

    let sink: Arc<dyn SessionSink> = Arc::new(WsSink { tx: out_tx.clone() });
    let generation = state
        .hub
        .register(worker_id, sink, labels, mode, registered_repos, owner_principal_id, owner_login)
        .await;
    info!(%worker_id, generation, %version, "executor session established");

    if out_tx.send(ServerMessage::Registered).await.is_err() {
        state.hub.unregister(worker_id, generation).await;
        return;
    }

    let mut deadline = Instant::now() + HEARTBEAT_TIMEOUT;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline.into()) => {
                warn!(%worker_id, "session heartbeat timed out");
                break;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        deadline = Instant::now() + HEARTBEAT_TIMEOUT;
                        match decode_executor_message(text.as_bytes()) {
                            Ok(exec_msg) => {
                                handle_executor_message(&state, worker_id, generation, exec_msg, &out_tx).await;
                            }
                            Err(e) => warn!(%worker_id, error = %e, "malformed frame from executor"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(%worker_id, error = %e, "websocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(worker_id, generation).await;
    info!(%worker_id, generation, "executor session closed");
}

async fn next_executor_message(
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<ExecutorMessage> {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match decode_executor_message(text.as_bytes()) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    warn!(error = %e, "malformed frame while awaiting REGISTER");
                    return None;
                }
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(_)) => return None,
            _ => continue,
        }
    }
}

async fn send_raw(
    ws_tx: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<(), axum::Error> {
    if let Ok(json) = encode(&msg) {
        ws_tx.send(Message::Text(json.into())).await?;
    }
    Ok(())
}

/// REGISTER carries plain `owner/name` strings with no forge tag;
/// resolve against every forge kind the repository might be registered
/// under, restricting to the token's repository scope when non-empty
/// (`spec.md` §4.5 "No executor may be authenticated for jobs outside
/// its repository authorization set").
async fn resolve_repository_ids(
    state: &AppState,
    names: &[String],
    token_scope: &[RepositoryId],
) -> HashSet<RepositoryId> {
    const ALL_KINDS: [ForgeKind; 6] = [
        ForgeKind::Github,
        ForgeKind::Gitlab,
        ForgeKind::Forgejo,
        ForgeKind::Gitea,
        ForgeKind::Bitbucket,
        ForgeKind::Generic,
    ];
    let scope: HashSet<RepositoryId> = token_scope.iter().copied().collect();
    let mut resolved = HashSet::new();
    for name in names {
        let Some((owner, repo_name)) = name.split_once('/') else {
            continue;
        };
        for kind in ALL_KINDS {
            if let Ok(Some(repo)) = state.storage.find_repository_by_identity(kind, owner, repo_name).await {
                if scope.is_empty() || scope.contains(&repo.id) {
                    resolved.insert(repo.id);
                }
                break;
            }
        }
    }
    resolved
}

async fn handle_executor_message(
    state: &AppState,
    worker_id: WorkerId,
    _generation: u64,
    msg: ExecutorMessage,
    out_tx: &mpsc::Sender<ServerMessage>,
) {
    match msg {
        ExecutorMessage::Register { .. } => {
            // Only expected once, before the main loop; a resend mid-session
            // would indicate a misbehaving executor and is ignored.
        }
        ExecutorMessage::JobAck { job_id } => {
            let _ = state
                .dispatch_tx
                .send(DispatchEvent::JobAck { job_id })
                .await;
        }
        ExecutorMessage::JobReject { job_id, reason } => {
            dispatch_reject(state, job_id, worker_id, reason).await;
        }
        ExecutorMessage::JobStarted { job_id } => {
            info!(%worker_id, %job_id, "job started");
        }
        ExecutorMessage::LogChunk { job_id, seq, stream, data } => {
            handle_log_chunk(state, job_id, seq, stream, data).await;
        }
        ExecutorMessage::JobComplete { job_id, exit_code, duration_secs, timed_out } => {
            handle_job_complete(state, worker_id, job_id, exit_code, duration_secs, timed_out).await;
            let _ = out_tx.send(ServerMessage::Ack { message_id: job_id.to_string() }).await;
        }
        ExecutorMessage::JobError { job_id, phase, reason } => {
            handle_job_error(state, worker_id, job_id, phase, reason).await;
            let _ = out_tx.send(ServerMessage::Ack { message_id: job_id.to_string() }).await;
        }
        ExecutorMessage::Ping { active_job_ids } => {
            state.hub.touch_heartbeat(worker_id, _generation).await;
            info!(%worker_id, active = active_job_ids.len(), "heartbeat");
            reconcile_active_jobs(state, worker_id, &active_job_ids).await;
            let _ = out_tx.send(ServerMessage::Pong).await;
        }
        ExecutorMessage::StatusUpdate { active_count, max_capacity } => {
            info!(%worker_id, active_count, max_capacity, "status update");
        }
    }
}

/// Reconciles the Hub's view of a worker's in-flight jobs against the
/// executor's own `PING` report (`spec.md` §4.5). A job the Hub still
/// considers active but the executor no longer lists means its
/// `JOB_COMPLETE`/`JOB_ERROR` was lost (executor restart, dropped
/// connection) — errored here rather than left stuck in `assigned`/
/// `running` forever.
async fn reconcile_active_jobs(state: &AppState, worker_id: WorkerId, reported: &[cinch_core::JobId]) {
    let reported: HashSet<cinch_core::JobId> = reported.iter().copied().collect();
    let believed = state.hub.active_jobs_for(worker_id).await;
    for job_id in believed.difference(&reported) {
        let job_id = *job_id;
        warn!(%worker_id, %job_id, "executor no longer reports job as active; marking errored");
        state.hub.mark_job_done(worker_id, job_id).await;
        match state
            .storage
            .update_job_status(
                job_id,
                &[JobStatus::Assigned, JobStatus::Running],
                JobStatus::Error,
                None,
                None,
                Some(TerminalReason::Infra {
                    phase: "execute".to_string(),
                    message: "executor no longer reports this job as active".to_string(),
                }),
            )
            .await
        {
            Ok(job) => {
                let _ = state.log_fanout.seal(&state.storage, job_id).await;
                state.terminal_hook.on_terminal(&job).await;
            }
            Err(e) => {
                warn!(%worker_id, %job_id, error = %e, "reconciliation: job already terminal or untracked");
            }
        }
    }
}

async fn dispatch_reject(state: &AppState, job_id: cinch_core::JobId, worker_id: WorkerId, reason: RejectReason) {
    let _ = state
        .dispatch_tx
        .send(DispatchEvent::JobRejected { job_id, worker_id, reason })
        .await;
}

async fn handle_log_chunk(
    state: &AppState,
    job_id: cinch_core::JobId,
    seq: u64,
    stream: StreamTag,
    data: String,
) {
    match state.storage.is_log_sealed(job_id).await {
        Ok(true) => {
            warn!(%job_id, "dropping log chunk for sealed job");
            return;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(%job_id, error = %e, "failed to check log seal state");
            return;
        }
    }
    let chunk = LogChunk {
        job_id,
        seq,
        stream: match stream {
            StreamTag::Stdout => cinch_core::log::LogStreamTag::Stdout,
            StreamTag::Stderr => cinch_core::log::LogStreamTag::Stderr,
        },
        timestamp: chrono::Utc::now(),
        data,
    };
    if let Err(e) = state.log_fanout.publish(&state.storage, chunk).await {
        warn!(%job_id, error = %e, "failed to publish log chunk");
    }
}

async fn handle_job_complete(
    state: &AppState,
    worker_id: WorkerId,
    job_id: cinch_core::JobId,
    exit_code: i32,
    duration_secs: f64,
    timed_out: bool,
) {
    let next = if exit_code == 0 { JobStatus::Success } else { JobStatus::Failure };
    let terminal_reason = if timed_out {
        Some(TerminalReason::Timeout)
    } else if exit_code == 0 {
        None
    } else {
        Some(TerminalReason::CommandExit(exit_code))
    };

    match state
        .storage
        .update_job_status(job_id, &[JobStatus::Assigned, JobStatus::Running], next, None, Some(exit_code), terminal_reason)
        .await
    {
        Ok(job) => {
            info!(%worker_id, %job_id, exit_code, duration_secs, "job complete");
            state.hub.mark_job_done(worker_id, job_id).await;
            if exit_code == 0 {
                state.hub.record_job_success(worker_id, job.repository_id).await;
            }
            let _ = state.log_fanout.seal(&state.storage, job_id).await;
            state.terminal_hook.on_terminal(&job).await;
        }
        Err(e) => {
            // Already terminal: duplicate JOB_COMPLETE after reconnect
            // (`spec.md` §7, §8 property 7). Acknowledged, discarded.
            warn!(%worker_id, %job_id, error = %e, "duplicate or out-of-order job complete discarded");
        }
    }
}

async fn handle_job_error(
    state: &AppState,
    worker_id: WorkerId,
    job_id: cinch_core::JobId,
    phase: Phase,
    reason: String,
) {
    let phase_name = format!("{phase:?}").to_lowercase();
    match state
        .storage
        .update_job_status(
            job_id,
            &[JobStatus::Assigned, JobStatus::Running],
            JobStatus::Error,
            None,
            None,
            Some(TerminalReason::Infra { phase: phase_name, message: reason.clone() }),
        )
        .await
    {
        Ok(job) => {
            warn!(%worker_id, %job_id, ?phase, %reason, "job errored");
            state.hub.mark_job_done(worker_id, job_id).await;
            let _ = state.log_fanout.seal(&state.storage, job_id).await;
            state.terminal_hook.on_terminal(&job).await;
        }
        Err(e) => {
            warn!(%worker_id, %job_id, error = %e, "duplicate or out-of-order job error discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinch_core::job::{Job, TrustLevel};
    use cinch_core::repository::{EncryptedSecret, Repository};
    use cinch_core::storage::Storage;
    use cinch_core::test_support::MemoryStorage;
    use cinch_core::JobId;
    use cinch_dispatcher::{DescriptorFactory, Dispatcher};
    use cinch_hub::Hub;
    use cinch_protocol::JobDescriptor;
    use std::collections::HashMap as Map;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct NoopDescriptors;

    #[async_trait]
    impl DescriptorFactory for NoopDescriptors {
        async fn build(&self, _job: &Job, _repo: &Repository) -> cinch_core::Result<JobDescriptor> {
            Err(cinch_core::Error::NotFound("descriptors not exercised by these tests".to_string()))
        }
    }

    struct RecordingHook {
        tx: tokio::sync::mpsc::UnboundedSender<Job>,
    }

    #[async_trait]
    impl TerminalHook for RecordingHook {
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
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn assigned_job(repository_id: RepositoryId, worker_id: WorkerId) -> Job {
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
            status: JobStatus::Assigned,
            assigned_executor: Some(worker_id),
            exit_code: None,
            terminal_reason: None,
            approved_by: None,
            approved_at: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn test_state(
        storage: Arc<dyn Storage>,
        hub: Arc<Hub>,
    ) -> (AppState, UnboundedReceiver<Job>, mpsc::Receiver<DispatchEvent>) {
        let (hook_tx, hook_rx) = unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::channel(16);
        let dispatcher = Arc::new(Dispatcher::new(
            storage.clone(),
            hub.clone(),
            Arc::new(NoopDescriptors),
            Arc::new(RecordingHook { tx: hook_tx.clone() }),
        ));
        let state = AppState {
            storage,
            hub,
            dispatcher,
            dispatch_tx,
            access_cache: Arc::new(cinch_hub::AccessCache::default()),
            forges: crate::state::ForgeRegistry::default(),
            log_fanout: Arc::new(crate::logfanout::LogFanout::new()),
            terminal_hook: Arc::new(RecordingHook { tx: hook_tx }),
            admin_tokens: Arc::new(Map::new()),
        };
        (state, hook_rx, dispatch_rx)
    }

    #[tokio::test]
    async fn handle_job_complete_success_clears_active_job_and_fires_hook() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();
        let worker_id = WorkerId::new();
        let job = storage.create_job(assigned_job(repo.id, worker_id)).await.unwrap();
        hub.mark_job_active(worker_id, job.id).await;

        let (state, mut hook_rx, _dispatch_rx) = test_state(storage.clone(), hub.clone());
        handle_job_complete(&state, worker_id, job.id, 0, 1.5, false).await;

        let updated = storage.get_job(job.id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Success);
        assert!(updated.terminal_reason.is_none());
        assert!(!hub.active_jobs_for(worker_id).await.contains(&job.id));

        let hooked = hook_rx.recv().await.expect("terminal hook should fire");
        assert_eq!(hooked.id, job.id);
    }

    #[tokio::test]
    async fn handle_job_complete_timeout_records_timeout_reason() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();
        let worker_id = WorkerId::new();
        let job = storage.create_job(assigned_job(repo.id, worker_id)).await.unwrap();
        hub.mark_job_active(worker_id, job.id).await;

        let (state, _hook_rx, _dispatch_rx) = test_state(storage.clone(), hub.clone());
        handle_job_complete(&state, worker_id, job.id, 124, 30.0, true).await;

        let updated = storage.get_job(job.id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Failure);
        assert!(matches!(updated.terminal_reason, Some(TerminalReason::Timeout)));
    }

    #[tokio::test]
    async fn handle_job_error_marks_infra_failure_and_clears_active_job() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();
        let worker_id = WorkerId::new();
        let job = storage.create_job(assigned_job(repo.id, worker_id)).await.unwrap();
        hub.mark_job_active(worker_id, job.id).await;

        let (state, mut hook_rx, _dispatch_rx) = test_state(storage.clone(), hub.clone());
        handle_job_error(&state, worker_id, job.id, Phase::Clone, "clone failed".to_string()).await;

        let updated = storage.get_job(job.id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Error);
        assert!(matches!(
            updated.terminal_reason,
            Some(TerminalReason::Infra { ref phase, ref message })
                if phase == "clone" && message == "clone failed"
        ));
        assert!(!hub.active_jobs_for(worker_id).await.contains(&job.id));
        assert!(hook_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn reconcile_active_jobs_errors_a_job_the_executor_stopped_reporting() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();
        let worker_id = WorkerId::new();
        let job = storage.create_job(assigned_job(repo.id, worker_id)).await.unwrap();
        hub.mark_job_active(worker_id, job.id).await;

        let (state, mut hook_rx, _dispatch_rx) = test_state(storage.clone(), hub.clone());
        reconcile_active_jobs(&state, worker_id, &[]).await;

        let updated = storage.get_job(job.id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Error);
        assert!(matches!(updated.terminal_reason, Some(TerminalReason::Infra { .. })));
        assert!(!hub.active_jobs_for(worker_id).await.contains(&job.id));
        assert!(hook_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn reconcile_active_jobs_leaves_still_reported_jobs_alone() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let repo = repo();
        storage.create_repository(repo.clone()).await.unwrap();
        let worker_id = WorkerId::new();
        let job = storage.create_job(assigned_job(repo.id, worker_id)).await.unwrap();
        hub.mark_job_active(worker_id, job.id).await;

        let (state, _hook_rx, _dispatch_rx) = test_state(storage.clone(), hub.clone());
        reconcile_active_jobs(&state, worker_id, &[job.id]).await;

        let updated = storage.get_job(job.id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Assigned);
        assert!(hub.active_jobs_for(worker_id).await.contains(&job.id));
    }

    #[tokio::test]
    async fn dispatch_reject_forwards_job_rejected_event() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = Arc::new(Hub::new());
        let (state, _hook_rx, mut dispatch_rx) = test_state(storage, hub);
        let job_id = JobId::new();
        let worker_id = WorkerId::new();

        dispatch_reject(&state, job_id, worker_id, RejectReason::AtCapacity).await;

        let event = dispatch_rx.recv().await.expect("dispatch event should be forwarded");
        assert!(matches!(
            event,
            DispatchEvent::JobRejected { job_id: jid, worker_id: wid, .. }
                if jid == job_id && wid == worker_id
        ));
    }
}
