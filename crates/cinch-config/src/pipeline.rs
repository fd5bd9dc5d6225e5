//! In-repository pipeline configuration schema (`spec.md` §6
//! "In-repository configuration file").
//!
//! Unlike `buildit-config::pipeline`'s unimplemented KDL stub, this
//! schema is backed by three concrete formats (YAML, TOML, JSON) that
//! all deserialize through the same `RawPipelineConfig` shape, then
//! get normalized into `PipelineConfig` with defaults applied and
//! durations parsed.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawPipelineConfig {
    pub build: String,
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub services: HashMap<String, RawServiceSpec>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub devcontainer: Option<DevcontainerSetting>,
    #[serde(default)]
    pub container: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawServiceSpec {
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub healthcheck: Option<RawHealthCheck>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHealthCheck {
    pub cmd: String,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub retries: Option<u32>,
}

/// `devcontainer` accepts either a path string or `false` to disable
/// auto-detection. Untagged is safe here (unlike `build`/`image`/etc.)
/// because this field is explicitly typed to accept a boolean.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DevcontainerSetting {
    Disabled(bool),
    Path(String),
}

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub image: String,
    pub env: HashMap<String, String>,
    pub command: Option<String>,
    pub healthcheck: Option<HealthCheck>,
}

#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub cmd: String,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: u32,
}

/// How the build container image is resolved (`spec.md` §4.6 phase 4
/// priority order: `image` → `dockerfile` → `devcontainer` → default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerResolution {
    Image(String),
    Dockerfile(String),
    Devcontainer(String),
    BareMetal,
    DefaultBaseImage,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub build: String,
    pub release: String,
    /// One required label per fan-out target; a job that matches none
    /// of these is unconstrained (`spec.md` §6 default `[]` = any).
    pub workers: Vec<String>,
    pub timeout: Duration,
    pub services: HashMap<String, ServiceSpec>,
    pub image: Option<String>,
    pub dockerfile: Option<String>,
    pub devcontainer: DevcontainerSetting,
    pub bare_metal: bool,
}

const DEFAULT_TIMEOUT: &str = "30m";
const DEFAULT_DEVCONTAINER_PATH: &str = ".devcontainer/devcontainer.json";

impl PipelineConfig {
    pub fn from_raw(raw: RawPipelineConfig) -> ConfigResult<Self> {
        let timeout = humantime::parse_duration(raw.timeout.as_deref().unwrap_or(DEFAULT_TIMEOUT))
            .map_err(|e| ConfigError::InvalidValue {
                field: "timeout".to_string(),
                message: e.to_string(),
            })?;

        let bare_metal = match raw.container.as_deref() {
            None => false,
            Some("none") => true,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "container".to_string(),
                    message: format!("unsupported value {other:?}, only \"none\" is accepted"),
                })
            }
        };

        let services = raw
            .services
            .into_iter()
            .map(|(name, spec)| Ok((name, ServiceSpec::from_raw(spec)?)))
            .collect::<ConfigResult<HashMap<_, _>>>()?;

        let release = raw.release.unwrap_or_else(|| raw.build.clone());
        let devcontainer = raw
            .devcontainer
            .unwrap_or(DevcontainerSetting::Path(DEFAULT_DEVCONTAINER_PATH.to_string()));

        if raw.image.is_some() && raw.dockerfile.is_some() {
            return Err(ConfigError::InvalidValue {
                field: "image/dockerfile".to_string(),
                message: "only one of `image` or `dockerfile` may be set".to_string(),
            });
        }

        Ok(Self {
            build: raw.build,
            release,
            workers: raw.workers,
            timeout,
            services,
            image: raw.image,
            dockerfile: raw.dockerfile,
            devcontainer,
            bare_metal,
        })
    }

    pub fn command_for(&self, is_tag_push: bool) -> &str {
        if is_tag_push {
            &self.release
        } else {
            &self.build
        }
    }

    /// Resolves the container per `spec.md` §4.6 phase 4's priority
    /// order. `devcontainer_exists` tells the caller whether the
    /// configured (or default) devcontainer path was actually found in
    /// the checked-out tree, since that step is auto-detected rather
    /// than required.
    pub fn resolve_container(&self, devcontainer_exists: bool) -> ContainerResolution {
        if let Some(image) = &self.image {
            return ContainerResolution::Image(image.clone());
        }
        if let Some(dockerfile) = &self.dockerfile {
            return ContainerResolution::Dockerfile(dockerfile.clone());
        }
        if let DevcontainerSetting::Path(path) = &self.devcontainer {
            if devcontainer_exists {
                return ContainerResolution::Devcontainer(path.clone());
            }
        }
        if self.bare_metal {
            return ContainerResolution::BareMetal;
        }
        ContainerResolution::DefaultBaseImage
    }
}

impl ServiceSpec {
    fn from_raw(raw: RawServiceSpec) -> ConfigResult<Self> {
        let healthcheck = raw.healthcheck.map(HealthCheck::from_raw).transpose()?;
        Ok(Self {
            image: raw.image,
            env: raw.env,
            command: raw.command,
            healthcheck,
        })
    }
}

impl HealthCheck {
    fn from_raw(raw: RawHealthCheck) -> ConfigResult<Self> {
        let parse = |field: &'static str, s: Option<String>| -> ConfigResult<Option<Duration>> {
            s.map(|s| {
                humantime::parse_duration(&s).map_err(|e| ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
        };
        Ok(Self {
            cmd: raw.cmd,
            interval: parse("services.*.healthcheck.interval", raw.interval)?,
            timeout: parse("services.*.healthcheck.timeout", raw.timeout)?,
            retries: raw.retries.unwrap_or(3),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_defaults_to_build() {
        let raw = RawPipelineConfig {
            build: "make check".to_string(),
            ..Default::default()
        };
        let cfg = PipelineConfig::from_raw(raw).unwrap();
        assert_eq!(cfg.release, "make check");
    }

    #[test]
    fn rejects_image_and_dockerfile_together() {
        let raw = RawPipelineConfig {
            build: "make check".to_string(),
            image: Some("rust:1".to_string()),
            dockerfile: Some("Dockerfile".to_string()),
            ..Default::default()
        };
        assert!(PipelineConfig::from_raw(raw).is_err());
    }

    #[test]
    fn container_resolution_priority() {
        let raw = RawPipelineConfig {
            build: "make check".to_string(),
            image: Some("rust:1".to_string()),
            ..Default::default()
        };
        let cfg = PipelineConfig::from_raw(raw).unwrap();
        assert_eq!(
            cfg.resolve_container(false),
            ContainerResolution::Image("rust:1".to_string())
        );
    }
}
