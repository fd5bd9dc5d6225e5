//! GitHub forge adapter: webhook signature verification and commit
//! status posting.
//!
//! Signature verification is ported directly from
//! `buildit-api/src/routes/webhooks.rs::verify_github_signature`.
//! Status posting is a natural extension of the same `reqwest`-based
//! HTTP client pattern used throughout the teacher's `services/`
//! modules, generalized behind the `Forge` trait so GitLab/Forgejo
//! adapters can be added without touching dispatch code.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use tracing::warn;

use cinch_core::forge::{Forge, JobOutcomeState};
use cinch_core::repository::ForgeKind;
use cinch_core::{Error, Result};

pub struct GithubForge {
    client: reqwest::Client,
    api_base: String,
}

impl GithubForge {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: "https://api.github.com".to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

impl Default for GithubForge {
    fn default() -> Self {
        Self::new()
    }
}

fn outcome_to_github_state(state: JobOutcomeState) -> &'static str {
    match state {
        JobOutcomeState::Pending => "pending",
        JobOutcomeState::Success => "success",
        JobOutcomeState::Failure => "failure",
        JobOutcomeState::Error => "error",
    }
}

#[async_trait]
impl Forge for GithubForge {
    fn kind(&self) -> ForgeKind {
        ForgeKind::Github
    }

    /// `spec.md` §4.1: signature format `sha256=<hex>` over the raw body.
    fn verify_signature(&self, secret: &[u8], body: &[u8], signature_header: Option<&str>) -> bool {
        let Some(signature) = signature_header else {
            return false;
        };
        let Some(sig_hex) = signature.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(sig_hex) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&sig_bytes).is_ok()
    }

    fn event_type(&self, headers: &HashMap<String, String>) -> Option<String> {
        headers.get("x-github-event").cloned()
    }

    /// GitHub app installation tokens would be minted here; without an
    /// app installation configured, the repository's stored credential
    /// (if any) is used unchanged.
    async fn mint_clone_token(&self, _payload_hint: &Value) -> Result<Option<String>> {
        Ok(None)
    }

    async fn post_status(
        &self,
        repo_full_name: &str,
        commit_sha: &str,
        state: JobOutcomeState,
        description: &str,
        target_url: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/repos/{}/statuses/{}",
            self.api_base, repo_full_name, commit_sha
        );
        let body = serde_json::json!({
            "state": outcome_to_github_state(state),
            "description": description,
            "target_url": target_url,
            "context": "cinch",
        });
        let response = self
            .client
            .post(&url)
            .header("User-Agent", "cinch")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Infra {
                phase: "post_status".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            warn!(repo = %repo_full_name, sha = %commit_sha, status = %response.status(), "status post rejected by forge");
        }
        Ok(())
    }
}
