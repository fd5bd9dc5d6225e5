//! The `Runtime` collaborator interface (`spec.md` §1: "container
//! runtime details... exposed as an abstract `Runtime` interface").
//!
//! Generalizes `buildit-core::executor::Executor` from "run a JobSpec,
//! return a JobResult" to the narrower contract Cinch's executor
//! lifecycle (`spec.md` §4.6) actually needs: start a container for a
//! resolved image + command + env, stream its output, wait for exit,
//! and tear it down. The broader lifecycle (clone, config parse, cache
//! mounts, service sidecars) is orchestrated in `cinch-agent` on top of
//! this trait, not inside it — `Runtime` only knows about containers.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

use crate::Result;

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub binds: Vec<BindMount>,
    pub network: Option<String>,
    /// Explicit container name. Services need a stable, globally-unique
    /// name distinct from their DNS alias (`spec.md` §6 "reachable from
    /// the build container by their service name").
    pub name: Option<String>,
    /// DNS name other containers on `network` resolve this one by.
    /// Unset for the build container, which nothing else needs to reach.
    pub network_alias: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

/// Handle to a running or completed container.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub container_id: String,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Build a deterministic image tag from Dockerfile content, so
    /// identical Dockerfiles reuse a built image (`spec.md` §4.6 phase 4).
    fn image_tag_for_dockerfile(&self, dockerfile_contents: &[u8]) -> String;

    /// Build an image from a Dockerfile if `image_tag_for_dockerfile`'s
    /// tag does not already exist locally; a no-op otherwise.
    async fn ensure_image_built(&self, dockerfile_contents: &[u8], context_dir: &str) -> Result<String>;

    /// Pull a pre-built image by reference.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create an ephemeral per-job network, for build container + services.
    async fn create_network(&self, name: &str) -> Result<()>;
    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn start_container(&self, spec: ContainerSpec) -> Result<ContainerHandle>;
    async fn output(&self, handle: &ContainerHandle) -> Result<BoxStream<'static, OutputChunk>>;
    /// Wait for exit, applying `timeout`: on deadline, send a graceful
    /// stop, wait `grace`, then force-kill (`spec.md` §4.6 phase 8, §5).
    async fn wait(
        &self,
        handle: &ContainerHandle,
        timeout: Duration,
        grace: Duration,
    ) -> Result<ExitOutcome>;
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()>;
    async fn remove_container(&self, handle: &ContainerHandle) -> Result<()>;

    /// Run `cmd` inside an already-running container and report whether
    /// it exited zero, for service healthchecks (`spec.md` §6 "services"
    /// `healthcheck.cmd`). Non-interactive; no stdin, output discarded.
    async fn exec_check(&self, handle: &ContainerHandle, cmd: &str) -> Result<bool>;

    /// Whether bare-metal (`container: none`) execution is permitted on
    /// this executor.
    fn allows_bare_metal(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub enum ExitOutcome {
    Exited { code: i32 },
    TimedOut,
}
