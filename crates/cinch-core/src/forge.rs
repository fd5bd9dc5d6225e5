//! The `Forge` collaborator interface (`spec.md` §1: "forge-specific
//! HTTP clients... exposed as named interfaces only").
//!
//! One implementation per forge kind shares this contract — a
//! capability-tag-plus-dispatch-table, per `spec.md` §9 Design Notes,
//! rather than a trait-object zoo resolved by runtime reflection.

use async_trait::async_trait;
use serde_json::Value;

use crate::repository::ForgeKind;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcomeState {
    Pending,
    Success,
    Failure,
    Error,
}

#[async_trait]
pub trait Forge: Send + Sync {
    fn kind(&self) -> ForgeKind;

    /// Verify a webhook signature against the repository's shared secret.
    fn verify_signature(&self, secret: &[u8], body: &[u8], signature_header: Option<&str>) -> bool;

    /// Parse a verified payload's top-level event-type tag (e.g. GitHub's
    /// `X-GitHub-Event` header value), used by the Event Normalizer to
    /// select a parse path. Headers are passed pre-lowercased by the
    /// caller so implementations don't need a transport-specific map type.
    fn event_type(&self, headers: &std::collections::HashMap<String, String>) -> Option<String>;

    /// Mint a short-lived clone credential for a job, if the forge
    /// supports scoped tokens; `None` means the repository's stored
    /// credential (if any) should be used unchanged.
    async fn mint_clone_token(&self, payload_hint: &Value) -> Result<Option<String>>;

    /// Post a commit status after a Job's terminal transition
    /// (`spec.md` §6 "Outgoing hooks"). Failures here are retried with
    /// backoff by the caller and MUST NOT affect Job state.
    async fn post_status(
        &self,
        repo_full_name: &str,
        commit_sha: &str,
        state: JobOutcomeState,
        description: &str,
        target_url: &str,
    ) -> Result<()>;
}
