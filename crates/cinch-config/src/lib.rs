//! In-repository configuration discovery and parsing for Cinch
//! (`spec.md` §6 "In-repository configuration file").
//!
//! Supports YAML, TOML, and JSON, all deserializing to the same
//! `PipelineConfig` schema. YAML parsing enforces the "strict" string
//! semantics `spec.md` requires: see `parse::parse_yaml_strict`.

pub mod error;
pub mod parse;
pub mod pipeline;

pub use error::{ConfigError, ConfigResult};
pub use parse::{discover, parse_file};
pub use pipeline::{ContainerResolution, DevcontainerSetting, HealthCheck, PipelineConfig, ServiceSpec};
