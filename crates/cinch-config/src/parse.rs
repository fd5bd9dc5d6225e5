//! File discovery and strict multi-format parsing (`spec.md` §6).

use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};
use crate::pipeline::{PipelineConfig, RawPipelineConfig};

/// Discovery order: `.cinch.{yaml,yml,toml,json}`, then the same four
/// names without the leading dot.
const CANDIDATES: &[&str] = &[
    ".cinch.yaml",
    ".cinch.yml",
    ".cinch.toml",
    ".cinch.json",
    "cinch.yaml",
    "cinch.yml",
    "cinch.toml",
    "cinch.json",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syntax {
    Yaml,
    Toml,
    Json,
}

fn syntax_for(path: &Path) -> Option<Syntax> {
    match path.extension().and_then(|e| e.to_str())? {
        "yaml" | "yml" => Some(Syntax::Yaml),
        "toml" => Some(Syntax::Toml),
        "json" => Some(Syntax::Json),
        _ => None,
    }
}

/// Find the first matching config file under `repo_root`.
pub fn discover(repo_root: &Path) -> ConfigResult<PathBuf> {
    for name in CANDIDATES {
        let candidate = repo_root.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(ConfigError::NotFound {
        candidates: CANDIDATES,
    })
}

/// Parse a pipeline config file, dispatching on its extension.
pub fn parse_file(path: &Path) -> ConfigResult<PipelineConfig> {
    let contents = std::fs::read_to_string(path)?;
    let syntax = syntax_for(path).ok_or_else(|| ConfigError::InvalidValue {
        field: "<filename>".to_string(),
        message: format!("unrecognized extension for {}", path.display()),
    })?;
    parse_str(&contents, syntax)
}

fn parse_str(contents: &str, syntax: Syntax) -> ConfigResult<PipelineConfig> {
    let raw = match syntax {
        Syntax::Yaml => parse_yaml_strict(contents)?,
        Syntax::Toml => toml::from_str(contents)?,
        Syntax::Json => serde_json::from_str(contents)?,
    };
    PipelineConfig::from_raw(raw)
}

/// Parse YAML text into `.cinch.yaml`'s schema under YAML 1.2 "strict
/// core" string semantics: plain scalars that the YAML 1.1 resolver
/// (which `serde_yaml`'s underlying `libyaml` implements) would coerce
/// into a boolean — `yes`, `no`, `on`, `off`, `y`, `n`, and their case
/// variants — are rejected when the schema expects a string, rather
/// than silently losing the author's literal text.
///
/// This walks the document twice: once through `serde_yaml::Value` to
/// find scalars that resolved to `Bool` where a string field sits, and
/// once through the normal typed deserializer for everything else.
pub(crate) fn parse_yaml_strict(contents: &str) -> ConfigResult<RawPipelineConfig> {
    let value: serde_yaml::Value = serde_yaml::from_str(contents)?;
    reject_ambiguous_bool_scalars(&value, "")?;
    let raw: RawPipelineConfig = serde_yaml::from_value(value)?;
    Ok(raw)
}

/// Fields whose schema type is a plain string (or an optional string),
/// so a YAML-1.1-resolved `Bool` at these paths indicates the author
/// wrote an ambiguous unquoted scalar like `on`/`off`/`yes`/`no`.
const STRING_TYPED_KEYS: &[&str] = &[
    "build",
    "release",
    "timeout",
    "image",
    "dockerfile",
    "container",
];

fn reject_ambiguous_bool_scalars(value: &serde_yaml::Value, path: &str) -> ConfigResult<()> {
    let serde_yaml::Value::Mapping(map) = value else {
        return Ok(());
    };
    for (key, val) in map {
        let serde_yaml::Value::String(key_str) = key else {
            continue;
        };
        let child_path = if path.is_empty() {
            key_str.clone()
        } else {
            format!("{path}.{key_str}")
        };
        if STRING_TYPED_KEYS.contains(&child_path.as_str()) {
            if let serde_yaml::Value::Bool(b) = val {
                return Err(ConfigError::InvalidValue {
                    field: child_path,
                    message: format!(
                        "ambiguous unquoted scalar resolved to boolean {b}; quote it to use as a string"
                    ),
                });
            }
        }
        if child_path == "devcontainer" {
            // `devcontainer` legitimately accepts a boolean (`false`),
            // so no ambiguity check applies to it.
            continue;
        }
        reject_ambiguous_bool_scalars(val, &child_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ambiguous_yes_no_for_string_field() {
        let yaml = "build: make check\ncontainer: no\n";
        let err = parse_str(yaml, Syntax::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "container"));
    }

    #[test]
    fn accepts_quoted_string_that_looks_boolean() {
        let yaml = "build: make check\ncontainer: \"no\"\n";
        // "no" is not a legal `container` value but it should parse as
        // a string (and then fail the later semantic check, not the
        // ambiguity check).
        let err = parse_str(yaml, Syntax::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "container"));
    }

    #[test]
    fn devcontainer_false_is_not_ambiguity_flagged() {
        let yaml = "build: make check\ndevcontainer: false\n";
        let cfg = parse_str(yaml, Syntax::Yaml).unwrap();
        assert!(matches!(
            cfg.devcontainer,
            crate::pipeline::DevcontainerSetting::Disabled(false)
        ));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let yaml = "build: make check\nbogus: 1\n";
        assert!(parse_str(yaml, Syntax::Yaml).is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let toml_src = "build = \"make check\"\ntimeout = \"1h\"\n";
        let cfg = parse_str(toml_src, Syntax::Toml).unwrap();
        assert_eq!(cfg.timeout, std::time::Duration::from_secs(3600));
    }

    #[test]
    fn json_roundtrip() {
        let json_src = r#"{"build": "make check", "workers": ["linux"]}"#;
        let cfg = parse_str(json_src, Syntax::Json).unwrap();
        assert_eq!(cfg.workers, vec!["linux".to_string()]);
    }
}
