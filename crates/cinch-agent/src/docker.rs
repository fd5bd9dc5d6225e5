//! Docker-backed `Runtime` (`spec.md` §4.6 phases 4-10).
//!
//! Grounded on `buildit-executor::docker::LocalDockerExecutor`: the
//! pull/create/start/logs/wait/remove lifecycle against `bollard` is
//! carried over directly, generalized from "run one `JobSpec`, return
//! one `JobResult`" to the narrower per-container primitives the
//! `Runtime` trait exposes (build containers and service containers
//! are both just `ContainerSpec`s to this module; sequencing them into
//! the 10-phase lifecycle is `lifecycle.rs`'s job).

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, NetworkingConfig};
use bollard::network::CreateNetworkOptions;
use cinch_core::runtime::{
    BindMount, ContainerHandle, ContainerSpec, ExitOutcome, OutputChunk, OutputStream, Runtime,
};
use cinch_core::{Error, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub struct DockerRuntime {
    docker: Docker,
    allow_bare_metal: bool,
}

impl DockerRuntime {
    pub fn connect(allow_bare_metal: bool) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Infra { phase: "setup".into(), message: e.to_string() })?;
        Ok(Self { docker, allow_bare_metal })
    }
}

fn infra_err(phase: &str, e: impl std::fmt::Display) -> Error {
    Error::Infra { phase: phase.to_string(), message: e.to_string() }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn image_tag_for_dockerfile(&self, dockerfile_contents: &[u8]) -> String {
        let digest = Sha256::digest(dockerfile_contents);
        format!("cinch-build:{}", hex::encode(&digest[..12]))
    }

    async fn ensure_image_built(&self, dockerfile_contents: &[u8], context_dir: &str) -> Result<String> {
        let tag = self.image_tag_for_dockerfile(dockerfile_contents);
        if self.docker.inspect_image(&tag).await.is_ok() {
            debug!(tag = %tag, "reusing previously built image");
            return Ok(tag);
        }

        // bollard's image-build endpoint wants the context pre-packed as a
        // tar stream; shelling out to the `docker` CLI avoids pulling in a
        // tar/gzip dependency pair for a path the daemon already implements,
        // matching how the rest of this executor shells out to `git`.
        info!(tag = %tag, context = %context_dir, "building image from Dockerfile");
        let output = tokio::process::Command::new("docker")
            .args(["build", "-t", &tag, context_dir])
            .output()
            .await
            .map_err(|e| infra_err("setup", e))?;
        if !output.status.success() {
            return Err(infra_err("setup", String::from_utf8_lossy(&output.stderr)));
        }
        Ok(tag)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(%image, "pulling image");
        let options = CreateImageOptions { from_image: image.to_string(), ..Default::default() };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "pull warning");
                }
            }
        }
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        let options = CreateNetworkOptions { name: name.to_string(), driver: "bridge".to_string(), ..Default::default() };
        self.docker.create_network(options).await.map_err(|e| infra_err("setup", e))?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| infra_err("cleanup", e))
    }

    async fn start_container(&self, spec: ContainerSpec) -> Result<ContainerHandle> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let binds = binds_to_strings(&spec.binds);
        let host_config = HostConfig { binds: (!binds.is_empty()).then_some(binds), ..Default::default() };

        let networking_config = spec.network.as_ref().map(|net| {
            let mut endpoints = HashMap::new();
            endpoints.insert(
                net.clone(),
                EndpointSettings {
                    aliases: spec.network_alias.clone().map(|a| vec![a]),
                    ..Default::default()
                },
            );
            NetworkingConfig { endpoints_config: endpoints }
        });

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: Some(env),
            working_dir: Some(spec.working_dir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let create_options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let container = self
            .docker
            .create_container(create_options, config)
            .await
            .map_err(|e| infra_err("setup", e))?;

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| infra_err("execute", e))?;

        Ok(ContainerHandle { container_id: container.id })
    }

    async fn output(&self, handle: &ContainerHandle) -> Result<BoxStream<'static, OutputChunk>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };
        let stream = self.docker.logs(&handle.container_id, Some(options));
        let mapped = stream.filter_map(|result| async move {
            match result {
                Ok(LogOutput::StdOut { message }) => Some(OutputChunk { stream: OutputStream::Stdout, bytes: message.to_vec() }),
                Ok(LogOutput::StdErr { message }) => Some(OutputChunk { stream: OutputStream::Stderr, bytes: message.to_vec() }),
                Ok(LogOutput::Console { message }) => Some(OutputChunk { stream: OutputStream::Stdout, bytes: message.to_vec() }),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => {
                    warn!(error = %e, "log stream error");
                    None
                }
            }
        });
        Ok(Box::pin(mapped))
    }

    async fn wait(
        &self,
        handle: &ContainerHandle,
        timeout: std::time::Duration,
        grace: std::time::Duration,
    ) -> Result<ExitOutcome> {
        let options = WaitContainerOptions { condition: "not-running" };
        let mut stream = self.docker.wait_container(&handle.container_id, Some(options));

        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Ok(response))) => Ok(ExitOutcome::Exited { code: response.status_code as i32 }),
            Ok(Some(Err(e))) => Err(infra_err("execute", e)),
            Ok(None) => {
                let inspect = self.docker.inspect_container(&handle.container_id, None).await.map_err(|e| infra_err("execute", e))?;
                let code = inspect.state.and_then(|s| s.exit_code).unwrap_or(0) as i32;
                Ok(ExitOutcome::Exited { code })
            }
            Err(_) => {
                self.stop(handle, grace).await?;
                Ok(ExitOutcome::TimedOut)
            }
        }
    }

    async fn stop(&self, handle: &ContainerHandle, grace: std::time::Duration) -> Result<()> {
        let options = StopContainerOptions { t: grace.as_secs() as i64 };
        self.docker
            .stop_container(&handle.container_id, Some(options))
            .await
            .map_err(|e| infra_err("cleanup", e))
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> Result<()> {
        let options = RemoveContainerOptions { force: true, ..Default::default() };
        self.docker
            .remove_container(&handle.container_id, Some(options))
            .await
            .map_err(|e| infra_err("cleanup", e))
    }

    async fn exec_check(&self, handle: &ContainerHandle, cmd: &str) -> Result<bool> {
        let exec = self
            .docker
            .create_exec(
                &handle.container_id,
                bollard::exec::CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), cmd.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| infra_err("setup", e))?;

        if let bollard::exec::StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await.map_err(|e| infra_err("setup", e))?
        {
            while output.next().await.is_some() {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(|e| infra_err("setup", e))?;
        Ok(inspect.exit_code == Some(0))
    }

    fn allows_bare_metal(&self) -> bool {
        self.allow_bare_metal
    }
}

fn binds_to_strings(binds: &[BindMount]) -> Vec<String> {
    binds
        .iter()
        .map(|b| {
            let mode = if b.read_only { "ro" } else { "rw" };
            format!("{}:{}:{}", b.host_path, b.container_path, mode)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_tag_is_deterministic_per_dockerfile_content() {
        let runtime = DockerRuntime { docker: Docker::connect_with_local_defaults().unwrap(), allow_bare_metal: false };
        let a = runtime.image_tag_for_dockerfile(b"FROM alpine\n");
        let b = runtime.image_tag_for_dockerfile(b"FROM alpine\n");
        let c = runtime.image_tag_for_dockerfile(b"FROM ubuntu\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("cinch-build:"));
    }
}
