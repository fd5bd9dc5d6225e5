//! Normalized forge events, produced by the Event Normalizer (`spec.md` §4.1).
//!
//! The normalizer itself lives in `cinch-server` (it needs the
//! per-forge payload shapes), but the normalized output type is core
//! domain vocabulary shared with the Job Factory.

use serde::{Deserialize, Serialize};

use crate::repository::ForgeKind;

/// A push to a branch or tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub commit_sha: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
}

/// A pull-request lifecycle event relevant to dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub action: PrAction,
    pub head_sha: String,
    pub base_branch: String,
    pub head_is_fork: bool,
    pub pr_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrAction {
    Opened,
    Reopened,
    Synchronize,
    /// Any other PR action the forge reports; the Job Factory ignores it
    /// (`spec.md` §4.2: jobs are created only for opened|reopened|synchronize).
    Other,
}

/// A request to resync trust/access state for a PR without creating a job,
/// e.g. after a collaborator-change webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrResyncEvent {
    pub pr_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    Push(PushEvent),
    PullRequest(PullRequestEvent),
    PrResync(PrResyncEvent),
}

/// Output of the Event Normalizer: a canonical event plus sender identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub forge: ForgeKind,
    pub repository_full_name: String,
    pub kind: EventKind,
    pub sender_login: String,
    pub sender_stable_id: String,
}

/// Errors the Normalizer can raise, per `spec.md` §4.1.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unsupported event: {0}")]
    UnsupportedEvent(String),
}
