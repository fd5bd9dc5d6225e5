//! Service sidecars (`spec.md` §6 "services"): started before the
//! build container on a shared ephemeral per-job network, reachable by
//! service name, torn down on every exit path.

use cinch_config::ServiceSpec;
use cinch_core::runtime::{ContainerHandle, ContainerSpec, Runtime};
use cinch_core::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

pub struct RunningServices {
    handles: Vec<(String, ContainerHandle)>,
}

impl RunningServices {
    /// Start every configured service on `network`, waiting out each
    /// one's healthcheck (if any) before returning, so the build
    /// container never races a dependency's startup.
    pub async fn start(
        runtime: &dyn Runtime,
        job_id_prefix: &str,
        network: &str,
        services: &HashMap<String, ServiceSpec>,
    ) -> Result<Self> {
        let mut handles = Vec::new();
        for (name, spec) in services {
            info!(service = %name, image = %spec.image, "starting service sidecar");
            let container_spec = ContainerSpec {
                image: spec.image.clone(),
                command: spec.command.clone().map(|c| vec!["sh".to_string(), "-c".to_string(), c]).unwrap_or_default(),
                working_dir: "/".to_string(),
                env: spec.env.clone(),
                binds: vec![],
                network: Some(network.to_string()),
                name: Some(format!("{job_id_prefix}-svc-{name}")),
                network_alias: Some(name.clone()),
            };
            runtime.pull_image(&container_spec.image).await.ok();
            let handle = match runtime.start_container(container_spec).await {
                Ok(handle) => handle,
                Err(e) => {
                    // Tear down anything already started before bubbling up.
                    let partial = Self { handles };
                    partial.stop_all(runtime).await;
                    return Err(e);
                }
            };
            handles.push((name.clone(), handle));

            if let Some(healthcheck) = &spec.healthcheck {
                if let Err(e) = wait_healthy(runtime, &handles.last().unwrap().1, healthcheck).await {
                    let partial = Self { handles };
                    partial.stop_all(runtime).await;
                    return Err(e);
                }
            }
        }
        Ok(Self { handles })
    }

    pub async fn stop_all(&self, runtime: &dyn Runtime) {
        for (name, handle) in &self.handles {
            if let Err(e) = runtime.stop(handle, Duration::from_secs(5)).await {
                warn!(service = %name, error = %e, "failed to stop service container");
            }
            if let Err(e) = runtime.remove_container(handle).await {
                warn!(service = %name, error = %e, "failed to remove service container");
            }
        }
    }
}

/// Polls a service's healthcheck command until it succeeds or the
/// configured retry budget is exhausted.
async fn wait_healthy(
    runtime: &dyn Runtime,
    handle: &ContainerHandle,
    healthcheck: &cinch_config::HealthCheck,
) -> Result<()> {
    let interval = healthcheck.interval.unwrap_or(Duration::from_secs(2));
    for attempt in 0..healthcheck.retries.max(1) {
        match runtime.exec_check(handle, &healthcheck.cmd).await {
            Ok(true) => return Ok(()),
            Ok(false) => tracing::debug!(attempt, "service healthcheck not ready yet"),
            Err(e) => tracing::debug!(attempt, error = %e, "service healthcheck command failed to run"),
        }
        tokio::time::sleep(interval).await;
    }
    Err(Error::Infra {
        phase: "setup".to_string(),
        message: format!("service healthcheck did not pass after {} attempts", healthcheck.retries.max(1)),
    })
}
