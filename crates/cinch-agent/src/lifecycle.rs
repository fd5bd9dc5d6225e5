//! The executor job lifecycle (`spec.md` §4.6): acknowledge, clone,
//! parse config, resolve the container, mount caches, run, stream,
//! wait, report, clean up.
//!
//! Grounded on `buildit-executor::docker::LocalDockerExecutor::spawn`
//! for the pull/create/start sequencing and git-clone-prefixed command
//! composition, generalized from one opaque `JobSpec` into the
//! explicit multi-phase flow the protocol needs to narrate over the
//! wire (`JOB_STARTED`, `LOG_CHUNK`, `JOB_COMPLETE`/`JOB_ERROR`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cinch_config::{ContainerResolution, PipelineConfig};
use cinch_core::runtime::{BindMount, ContainerSpec, ExitOutcome, OutputStream, Runtime};
use cinch_core::Result as CoreResult;
use cinch_protocol::{ExecutorMessage, JobDescriptor, Phase as WirePhase, StreamTag};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache;
use crate::env::build_env;
use crate::git;
use crate::scratch::Scratch;
use crate::services::RunningServices;

const GRACE_WINDOW: Duration = Duration::from_secs(10);
/// Exit code reported for a timed-out command, matching shell
/// convention for a job killed by its own timeout (`spec.md` §4.6
/// phase 8).
const TIMEOUT_EXIT_CODE: i32 = 124;

/// How a job's run phase ended, distinct from `JobError`: the command
/// ran and exited (on its own or because its timeout fired), as
/// opposed to infrastructure failing to even run it.
enum RunOutcome {
    Exited(i32),
    TimedOut,
}

/// Runs one job end to end, sending protocol messages to `outbound` as
/// it progresses. Never panics across phase boundaries: every fallible
/// step maps to a `JobError` report instead, since the lifecycle owns
/// exactly one `JOB_COMPLETE`/`JOB_ERROR` per job id (`spec.md` §4.6
/// phase 9, §7 idempotency obligations).
pub async fn run_job(
    descriptor: JobDescriptor,
    runtime: Arc<dyn Runtime>,
    outbound: mpsc::Sender<ExecutorMessage>,
    cancel: CancellationToken,
) {
    let job_id = descriptor.job_id;
    let started = std::time::Instant::now();

    let _ = outbound.send(ExecutorMessage::JobStarted { job_id }).await;

    match run_phases(&descriptor, runtime.as_ref(), &outbound, &cancel).await {
        Ok(outcome) => {
            let (exit_code, timed_out) = match outcome {
                RunOutcome::Exited(code) => (code, false),
                RunOutcome::TimedOut => (TIMEOUT_EXIT_CODE, true),
            };
            let _ = outbound
                .send(ExecutorMessage::JobComplete {
                    job_id,
                    exit_code,
                    duration_secs: started.elapsed().as_secs_f64(),
                    timed_out,
                })
                .await;
        }
        Err((phase, reason)) => {
            let _ = outbound.send(ExecutorMessage::JobError { job_id, phase, reason }).await;
        }
    }
}

async fn run_phases(
    descriptor: &JobDescriptor,
    runtime: &dyn Runtime,
    outbound: &mpsc::Sender<ExecutorMessage>,
    cancel: &CancellationToken,
) -> Result<RunOutcome, (WirePhase, String)> {
    let job_id = descriptor.job_id;

    // Phase 2: clone.
    let scratch = Scratch::create(job_id).map_err(|e| (WirePhase::Clone, e.to_string()))?;
    info!(%job_id, path = %scratch.path().display(), "cloning repository");
    git::clone_at_sha(
        &descriptor.clone_url,
        &descriptor.head_sha,
        descriptor.branch.as_deref(),
        descriptor.clone_token.as_deref(),
        scratch.path(),
    )
    .await
    .map_err(|e| (WirePhase::Clone, e.to_string()))?;

    // Phase 3: config parse.
    let config_path = cinch_config::discover(scratch.path()).map_err(|e| (WirePhase::Setup, e.to_string()))?;
    let config = cinch_config::parse_file(&config_path).map_err(|e| (WirePhase::Setup, e.to_string()))?;

    // Phase 4: container resolution.
    let devcontainer_exists = match &config.devcontainer {
        cinch_config::DevcontainerSetting::Path(path) => scratch.path().join(path).is_file(),
        cinch_config::DevcontainerSetting::Disabled(_) => false,
    };
    let resolution = config.resolve_container(devcontainer_exists);

    let image = match &resolution {
        ContainerResolution::Image(image) => {
            runtime.pull_image(image).await.map_err(|e| (WirePhase::Setup, e.to_string()))?;
            image.clone()
        }
        ContainerResolution::Dockerfile(dockerfile) => {
            let contents = std::fs::read(scratch.path().join(dockerfile))
                .map_err(|e| (WirePhase::Setup, e.to_string()))?;
            runtime
                .ensure_image_built(&contents, &scratch.path().display().to_string())
                .await
                .map_err(|e| (WirePhase::Setup, e.to_string()))?
        }
        ContainerResolution::Devcontainer(path) => {
            match devcontainer_image(scratch.path(), path).map_err(|e| (WirePhase::Setup, e))? {
                DevcontainerImage::Image(image) => {
                    runtime.pull_image(&image).await.map_err(|e| (WirePhase::Setup, e.to_string()))?;
                    image
                }
                DevcontainerImage::Dockerfile(dockerfile_path) => {
                    let contents = std::fs::read(&dockerfile_path).map_err(|e| (WirePhase::Setup, e.to_string()))?;
                    runtime
                        .ensure_image_built(&contents, &scratch.path().display().to_string())
                        .await
                        .map_err(|e| (WirePhase::Setup, e.to_string()))?
                }
            }
        }
        ContainerResolution::BareMetal => {
            if !runtime.allows_bare_metal() {
                return Err((WirePhase::Setup, "bare-metal execution (container: none) is not permitted on this executor".to_string()));
            }
            String::new()
        }
        ContainerResolution::DefaultBaseImage => {
            let image = "debian:bookworm-slim".to_string();
            runtime.pull_image(&image).await.map_err(|e| (WirePhase::Setup, e.to_string()))?;
            image
        }
    };

    if matches!(resolution, ContainerResolution::BareMetal) {
        return run_bare_metal(descriptor, &config, scratch.path(), cancel).await;
    }

    // Phase 5: cache mounts.
    let mut binds: Vec<BindMount> = cache::detect_caches(scratch.path(), &crate::scratch::cache_mount_root())
        .map_err(|e| (WirePhase::Setup, e.to_string()))?;
    binds.push(BindMount {
        host_path: scratch.path().display().to_string(),
        container_path: "/workspace".to_string(),
        read_only: false,
    });

    // Services: started before the build container, on a shared ephemeral network.
    let network_name = format!("cinch-{job_id}");
    let job_id_str = job_id.to_string();
    let mut services = None;
    if !config.services.is_empty() {
        runtime.create_network(&network_name).await.map_err(|e| (WirePhase::Setup, e.to_string()))?;
        services = Some(
            RunningServices::start(runtime, &job_id_str, &network_name, &config.services)
                .await
                .map_err(|e| (WirePhase::Setup, e.to_string()))?,
        );
    }

    let result = run_build_container(
        descriptor,
        &config,
        runtime,
        outbound,
        image,
        binds,
        services.is_some().then(|| network_name.clone()),
        cancel,
    )
    .await;

    if let Some(services) = &services {
        services.stop_all(runtime).await;
    }
    if services.is_some() {
        runtime.remove_network(&network_name).await.ok();
    }

    result
}

async fn run_build_container(
    descriptor: &JobDescriptor,
    config: &PipelineConfig,
    runtime: &dyn Runtime,
    outbound: &mpsc::Sender<ExecutorMessage>,
    image: String,
    binds: Vec<BindMount>,
    network: Option<String>,
    cancel: &CancellationToken,
) -> Result<RunOutcome, (WirePhase, String)> {
    let env = build_env(descriptor, &HashMap::new());
    let command = config.command_for(descriptor.tag.is_some()).to_string();

    let spec = ContainerSpec {
        image,
        command: vec!["sh".to_string(), "-c".to_string(), command],
        working_dir: "/workspace".to_string(),
        env,
        binds,
        network,
        name: None,
        network_alias: None,
    };

    // Phase 6: run.
    let handle = runtime.start_container(spec).await.map_err(|e| (WirePhase::Execute, e.to_string()))?;

    // Phase 7: stream.
    let outbound_logs = outbound.clone();
    let job_id = descriptor.job_id;
    let output = runtime.output(&handle).await;
    let stream_task = tokio::spawn(stream_logs(output, job_id, outbound_logs));

    // Phase 8: wait, applying the configured timeout and racing cancellation
    // (`JOB_CANCEL` mid-run, `spec.md` §4.5).
    let outcome = tokio::select! {
        result = runtime.wait(&handle, descriptor.timeout(), GRACE_WINDOW) => {
            result.map_err(|e| (WirePhase::Execute, e.to_string()))
        }
        _ = cancel.cancelled() => {
            runtime.stop(&handle, GRACE_WINDOW).await.ok();
            Err((WirePhase::Execute, "cancelled".to_string()))
        }
    };

    stream_task.abort();
    runtime.remove_container(&handle).await.ok();

    match outcome? {
        ExitOutcome::Exited { code } => Ok(RunOutcome::Exited(code)),
        ExitOutcome::TimedOut => Ok(RunOutcome::TimedOut),
    }
}

async fn stream_logs(
    stream: CoreResult<futures::stream::BoxStream<'static, cinch_core::runtime::OutputChunk>>,
    job_id: cinch_core::JobId,
    outbound: mpsc::Sender<ExecutorMessage>,
) {
    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%job_id, error = %e, "failed to attach to container output");
            return;
        }
    };
    let mut stdout_seq: u64 = 0;
    let mut stderr_seq: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let (tag, seq) = match chunk.stream {
            OutputStream::Stdout => {
                let seq = stdout_seq;
                stdout_seq += 1;
                (StreamTag::Stdout, seq)
            }
            OutputStream::Stderr => {
                let seq = stderr_seq;
                stderr_seq += 1;
                (StreamTag::Stderr, seq)
            }
        };
        for data in split_for_wire(&chunk.bytes) {
            if outbound.send(ExecutorMessage::LogChunk { job_id, seq, stream: tag, data }).await.is_err() {
                return;
            }
        }
    }
}

/// Splits output into wire-safe chunks under `spec.md` §4.5's 64 KiB
/// `LOG_CHUNK` payload ceiling.
fn split_for_wire(bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(cinch_protocol::MAX_LOG_CHUNK_BYTES)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

/// Either a pre-built image reference or a Dockerfile path to build,
/// as read from a devcontainer's top-level `image` or `build.dockerfile`
/// key (`spec.md` §6 "devcontainer JSON (parsed for `image` or
/// `build.dockerfile` only)").
enum DevcontainerImage {
    Image(String),
    Dockerfile(std::path::PathBuf),
}

fn devcontainer_image(worktree: &std::path::Path, relative_path: &str) -> Result<DevcontainerImage, String> {
    let devcontainer_path = worktree.join(relative_path);
    let contents = std::fs::read_to_string(&devcontainer_path).map_err(|e| e.to_string())?;
    let value: serde_json::Value = serde_json::from_str(&contents).map_err(|e| e.to_string())?;
    if let Some(image) = value.get("image").and_then(|v| v.as_str()) {
        return Ok(DevcontainerImage::Image(image.to_string()));
    }
    if let Some(dockerfile) = value.get("build").and_then(|b| b.get("dockerfile")).and_then(|v| v.as_str()) {
        let base = devcontainer_path.parent().unwrap_or(worktree);
        return Ok(DevcontainerImage::Dockerfile(base.join(dockerfile)));
    }
    Err("devcontainer JSON has neither \"image\" nor \"build.dockerfile\"".to_string())
}

/// `container: none` (`spec.md` §4.6 phase 4): runs the command
/// directly on the executor host, bypassing Docker entirely. Only
/// reached when the executor's `allows_bare_metal()` permits it.
async fn run_bare_metal(
    descriptor: &JobDescriptor,
    config: &PipelineConfig,
    worktree: &std::path::Path,
    cancel: &CancellationToken,
) -> Result<RunOutcome, (WirePhase, String)> {
    let env = build_env(descriptor, &HashMap::new());
    let command = config.command_for(descriptor.tag.is_some());

    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(worktree)
        .envs(&env)
        .spawn()
        .map_err(|e| (WirePhase::Execute, e.to_string()))?;

    tokio::select! {
        result = tokio::time::timeout(descriptor.timeout(), child.wait()) => {
            match result {
                Ok(Ok(status)) => Ok(RunOutcome::Exited(status.code().unwrap_or(1))),
                Ok(Err(e)) => Err((WirePhase::Execute, e.to_string())),
                Err(_) => {
                    // Timed out: kill and reap so the child never leaks
                    // past this job's own lifetime.
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Ok(RunOutcome::TimedOut)
                }
            }
        }
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err((WirePhase::Execute, "cancelled".to_string()))
        }
    }
}
