//! Environment exposed to the command (`spec.md` §6.3).

use cinch_core::repository::ForgeKind;
use cinch_protocol::JobDescriptor;
use std::collections::HashMap;

/// Builds the well-known `CINCH_*`/forge-conventional environment,
/// layered under the config's own `env` map and the job's snapshotted
/// env so operator-configured values never shadow the protocol's own
/// coordinates.
pub fn build_env(descriptor: &JobDescriptor, config_env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = config_env.clone();
    env.extend(descriptor.env.clone());

    env.insert("CI".to_string(), "true".to_string());
    env.insert("CINCH".to_string(), "true".to_string());
    env.insert("CINCH_JOB_ID".to_string(), descriptor.job_id.to_string());
    env.insert("CINCH_REPO".to_string(), descriptor.clone_url.clone());
    if let Some(branch) = &descriptor.branch {
        env.insert("CINCH_BRANCH".to_string(), branch.clone());
    }
    env.insert("CINCH_COMMIT".to_string(), descriptor.head_sha.clone());
    if let Some(tag) = &descriptor.tag {
        env.insert("CINCH_TAG".to_string(), tag.clone());
    }
    env.insert("CINCH_FORGE".to_string(), descriptor.forge.to_string());

    if let Some(token) = &descriptor.clone_token {
        env.insert("CINCH_FORGE_TOKEN".to_string(), token.clone());
        let forge_var = match descriptor.forge {
            ForgeKind::Github => "GITHUB_TOKEN",
            ForgeKind::Gitlab => "GITLAB_TOKEN",
            ForgeKind::Gitea => "GITEA_TOKEN",
            ForgeKind::Forgejo | ForgeKind::Bitbucket | ForgeKind::Generic => "CI_JOB_TOKEN",
        };
        env.insert(forge_var.to_string(), token.clone());
        if matches!(descriptor.forge, ForgeKind::Gitlab) {
            env.insert("CI_JOB_TOKEN".to_string(), token.clone());
        }
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinch_core::{JobId, TrustLevel};

    fn descriptor() -> JobDescriptor {
        JobDescriptor {
            job_id: JobId::new(),
            clone_url: "https://github.com/acme/app.git".to_string(),
            clone_token: Some("secret".to_string()),
            head_sha: "abc1234".to_string(),
            branch: Some("main".to_string()),
            tag: None,
            pr_base: None,
            forge: ForgeKind::Github,
            command: "make check".to_string(),
            timeout_secs: 1800,
            env: HashMap::new(),
            trust_level: TrustLevel::Owner,
        }
    }

    #[test]
    fn sets_github_token_alias() {
        let env = build_env(&descriptor(), &HashMap::new());
        assert_eq!(env.get("GITHUB_TOKEN"), Some(&"secret".to_string()));
        assert_eq!(env.get("CINCH_FORGE_TOKEN"), Some(&"secret".to_string()));
        assert_eq!(env.get("CI"), Some(&"true".to_string()));
    }

    #[test]
    fn job_env_overrides_config_env() {
        let mut descriptor = descriptor();
        descriptor.env.insert("FOO".to_string(), "from_job".to_string());
        let mut config_env = HashMap::new();
        config_env.insert("FOO".to_string(), "from_config".to_string());

        let env = build_env(&descriptor, &config_env);
        assert_eq!(env.get("FOO"), Some(&"from_job".to_string()));
    }
}
