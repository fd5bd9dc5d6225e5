//! Reconnecting control-plane session client (`spec.md` §4.5).
//!
//! Grounded on `cinch-server::session::handle_session`'s split
//! reader/writer shape, mirrored for the executor side. Unlike the
//! server — which fans a broadcast out to many sockets and so needs a
//! dedicated writer task per session — an executor owns exactly one
//! outbound socket at a time, so the read half, the write half, the
//! heartbeat timer, and the shared job-lifecycle outbound queue are all
//! driven from one `tokio::select!` loop. The outer `run` loop wraps
//! that loop in the reconnection contract: exponential backoff with
//! jitter, re-`REGISTER` on every new connection, and resending each
//! in-flight job's most recent lifecycle message until the control
//! plane acks it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cinch_core::runtime::Runtime;
use cinch_core::worker::WorkerMode;
use cinch_core::JobId;
use cinch_protocol::{decode_server_message, encode, ExecutorMessage, RejectReason, ServerMessage};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lifecycle;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const BACKOFF_STEPS_SECS: [u64; 6] = [1, 2, 4, 8, 16, 30];

#[derive(Clone)]
pub struct AgentConfig {
    pub control_plane_url: String,
    pub token: String,
    pub labels: Vec<String>,
    pub mode: WorkerMode,
    pub registered_repos: Vec<String>,
    pub concurrency: u32,
    pub version: String,
    pub hostname: String,
}

struct JobEntry {
    cancel: CancellationToken,
    last_message: ExecutorMessage,
}

type JobMap = Arc<Mutex<HashMap<JobId, JobEntry>>>;

/// Connects, serves, and reconnects with backoff until `cancel` fires
/// or the control plane rejects authentication outright.
pub async fn run(config: AgentConfig, runtime: Arc<dyn Runtime>, cancel: CancellationToken) -> Result<(), String> {
    let jobs: JobMap = Arc::new(Mutex::new(HashMap::new()));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ExecutorMessage>(256);
    let mut attempt: u32 = 0;

    while !cancel.is_cancelled() {
        match connect_and_serve(&config, &runtime, &jobs, &outbound_tx, &mut outbound_rx, &cancel).await {
            Ok(Outcome::Closed) => {
                attempt = 0;
            }
            Ok(Outcome::AuthFailed(reason)) => {
                return Err(format!("authentication rejected: {reason}"));
            }
            Ok(Outcome::Cancelled) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "executor session failed");
            }
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        info!(seconds = delay.as_secs(), "reconnecting to control plane after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
    }
    Ok(())
}

enum Outcome {
    Closed,
    AuthFailed(String),
    Cancelled,
}

/// 1, 2, 4, 8, 16, 30 seconds capped, plus up to ~300ms of jitter
/// (`spec.md` §4.5 reconnection contract). Jitter is derived from the
/// wall clock rather than a proper RNG crate, since none is otherwise
/// carried by this codebase.
fn backoff_delay(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(BACKOFF_STEPS_SECS.len() - 1);
    let base = BACKOFF_STEPS_SECS[idx];
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_millis())
        .unwrap_or(0);
    let jitter = (millis ^ attempt.wrapping_mul(2_654_435_761)) % 300;
    Duration::from_secs(base) + Duration::from_millis(jitter as u64)
}

async fn connect_and_serve(
    config: &AgentConfig,
    runtime: &Arc<dyn Runtime>,
    jobs: &JobMap,
    outbound_tx: &mpsc::Sender<ExecutorMessage>,
    outbound_rx: &mut mpsc::Receiver<ExecutorMessage>,
    cancel: &CancellationToken,
) -> Result<Outcome, String> {
    let mut request = config
        .control_plane_url
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", config.token)).map_err(|e| e.to_string())?,
    );

    let (stream, _response) = tokio_tungstenite::connect_async(request).await.map_err(|e| e.to_string())?;
    let (mut write, mut read) = stream.split();
    info!(url = %config.control_plane_url, "connected to control plane");

    match next_server_message(&mut read).await {
        Some(ServerMessage::AuthOk { executor_id }) => {
            info!(%executor_id, "authenticated");
        }
        Some(ServerMessage::AuthFail { reason }) => return Ok(Outcome::AuthFailed(reason)),
        _ => return Err("connection closed before AUTH_OK".to_string()),
    }

    let register = ExecutorMessage::Register {
        labels: config.labels.clone(),
        mode: config.mode,
        registered_repos: config.registered_repos.clone(),
        capabilities: vec![],
        version: config.version.clone(),
        hostname: config.hostname.clone(),
    };
    send(&mut write, &register).await?;

    match next_server_message(&mut read).await {
        Some(ServerMessage::Registered) => {}
        Some(ServerMessage::AuthFail { reason }) => return Ok(Outcome::AuthFailed(reason)),
        _ => return Err("connection closed before REGISTERED".to_string()),
    }
    info!("registered with control plane");

    // Reconnection contract: re-announce every in-flight job's most
    // recent lifecycle message (`spec.md` §4.5).
    {
        let jobs = jobs.lock().await;
        for entry in jobs.values() {
            send(&mut write, &entry.last_message).await?;
        }
    }
    send_status_update(&mut write, jobs, config.concurrency).await?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(msg) = outbound else {
                    return Err("job outbound channel closed unexpectedly".to_string());
                };
                track_terminal_message(jobs, &msg).await;
                send(&mut write, &msg).await?;
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match decode_server_message(text.as_bytes()) {
                            Ok(server_msg) => {
                                if let Some(outcome) = handle_server_message(
                                    server_msg,
                                    config,
                                    runtime,
                                    jobs,
                                    outbound_tx,
                                    &mut write,
                                ).await? {
                                    return Ok(outcome);
                                }
                            }
                            Err(e) => warn!(error = %e, "malformed frame from control plane"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(Outcome::Closed),
                    Some(Err(e)) => return Err(e.to_string()),
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                let active_job_ids: Vec<JobId> = jobs.lock().await.keys().copied().collect();
                send(&mut write, &ExecutorMessage::Ping { active_job_ids }).await?;
            }
            _ = cancel.cancelled() => {
                let _ = write.close().await;
                return Ok(Outcome::Cancelled);
            }
        }
    }
}

async fn handle_server_message(
    msg: ServerMessage,
    config: &AgentConfig,
    runtime: &Arc<dyn Runtime>,
    jobs: &JobMap,
    outbound_tx: &mpsc::Sender<ExecutorMessage>,
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) -> Result<Option<Outcome>, String> {
    match msg {
        ServerMessage::AuthFail { reason } => return Ok(Some(Outcome::AuthFailed(reason))),
        ServerMessage::JobAssign { descriptor } => {
            let job_id = descriptor.job_id;
            let at_capacity = jobs.lock().await.len() as u32 >= config.concurrency;
            if at_capacity {
                debug!(%job_id, "rejecting job assignment: at capacity");
                send(write, &ExecutorMessage::JobReject { job_id, reason: RejectReason::AtCapacity }).await?;
                return Ok(None);
            }

            send(write, &ExecutorMessage::JobAck { job_id }).await?;

            let job_cancel = CancellationToken::new();
            jobs.lock().await.insert(
                job_id,
                JobEntry { cancel: job_cancel.clone(), last_message: ExecutorMessage::JobAck { job_id } },
            );
            tokio::spawn(lifecycle::run_job(descriptor, runtime.clone(), outbound_tx.clone(), job_cancel));
            send_status_update(write, jobs, config.concurrency).await?;
        }
        ServerMessage::JobCancel { job_id, reason } => {
            if let Some(entry) = jobs.lock().await.get(&job_id) {
                info!(%job_id, %reason, "cancelling job");
                entry.cancel.cancel();
            }
        }
        ServerMessage::Ack { message_id } => {
            if let Ok(job_id) = message_id.parse::<JobId>() {
                jobs.lock().await.remove(&job_id);
                send_status_update(write, jobs, config.concurrency).await?;
            }
        }
        ServerMessage::Pong => {
            debug!("heartbeat acknowledged");
        }
        ServerMessage::Registered | ServerMessage::AuthOk { .. } => {
            // Only expected once, during the handshake above.
        }
    }
    Ok(None)
}

/// Updates the per-job record used for reconnect resend, and drops
/// terminal entries once they have actually been sent (they stay until
/// the control plane's `Ack` confirms receipt, handled above).
async fn track_terminal_message(jobs: &JobMap, msg: &ExecutorMessage) {
    let job_id = match msg {
        ExecutorMessage::JobStarted { job_id }
        | ExecutorMessage::JobComplete { job_id, .. }
        | ExecutorMessage::JobError { job_id, .. } => *job_id,
        _ => return,
    };
    if let Some(entry) = jobs.lock().await.get_mut(&job_id) {
        entry.last_message = msg.clone();
    }
}

async fn send_status_update(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    jobs: &JobMap,
    max_capacity: u32,
) -> Result<(), String> {
    let active_count = jobs.lock().await.len() as u32;
    send(write, &ExecutorMessage::StatusUpdate { active_count, max_capacity }).await
}

async fn send(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    msg: &ExecutorMessage,
) -> Result<(), String> {
    let json = encode(msg).map_err(|e| e.to_string())?;
    write.send(Message::Text(json.into())).await.map_err(|e| e.to_string())
}

async fn next_server_message(
    read: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Option<ServerMessage> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match decode_server_message(text.as_bytes()) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    warn!(error = %e, "malformed frame during handshake");
                    return None;
                }
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(_)) => return None,
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_thirty_seconds() {
        let d = backoff_delay(10);
        assert!(d.as_secs() >= 30 && d < Duration::from_secs(31));
    }

    #[test]
    fn backoff_grows_for_early_attempts() {
        assert_eq!(backoff_delay(0).as_secs(), 1);
        assert_eq!(backoff_delay(1).as_secs(), 2);
        assert_eq!(backoff_delay(2).as_secs(), 4);
    }
}
