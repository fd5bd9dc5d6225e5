//! Job: one concrete execution of a command for a specific commit.
//!
//! The status machine follows `spec.md` §3 exactly. Modeling it as an
//! explicit enum with an exhaustive `can_transition_to` check, rather
//! than scattered status-string comparisons, is the `spec.md` §9
//! Design Notes recommendation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::id::{JobId, RepositoryId, WorkerId};
use crate::repository::ForgeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Owner,
    Collaborator,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    PendingContributor,
    Assigned,
    Running,
    Success,
    Failure,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal edge in the `spec.md` §3 diagram.
    /// The Dispatcher and session layer reject any other transition,
    /// which is invariant (4) and the monotonicity property (Testable
    /// Properties §8, item 2).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Pending, Error)
                | (Pending, PendingContributor)
                | (PendingContributor, Assigned)
                | (PendingContributor, Cancelled)
                | (PendingContributor, Error)
                | (Assigned, Running)
                | (Assigned, Pending) // reverted: send failed or JOB_REJECT
                | (Assigned, Cancelled)
                | (Assigned, Error)
                // JOB_ACK is dispatched async (via the event channel) while
                // JOB_COMPLETE/JOB_ERROR are handled synchronously in the
                // session loop, so a fast executor's terminal message can
                // overtake its own ack; Assigned -> terminal must be legal
                // directly, not only via Running.
                | (Assigned, Success)
                | (Assigned, Failure)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Error)
                | (Running, Cancelled)
        )
    }
}

/// Reason recorded alongside an `error`/`failure` terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TerminalReason {
    NoEligibleWorker,
    Timeout,
    CommandExit(i32),
    Infra { phase: String, message: String },
    Cancelled { by: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub repository_id: RepositoryId,
    pub forge: ForgeKind,
    pub commit_sha: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub pr_number: Option<u64>,
    pub pr_base_branch: Option<String>,
    pub trust_level: TrustLevel,
    pub is_fork: bool,
    pub author_login: String,
    pub author_stable_id: String,
    pub command: String,
    pub env: HashMap<String, String>,
    pub timeout: std::time::Duration,
    /// Labels a candidate worker must have, captured from the
    /// `Repository` at job-creation time so later edits to a
    /// repository's label set don't retroactively change a pending
    /// job's matching criteria (`spec.md` §4.2, §4.3 `MatchCandidates`).
    pub required_labels: Vec<String>,
    pub status: JobStatus,
    pub assigned_executor: Option<WorkerId>,
    pub exit_code: Option<i32>,
    pub terminal_reason: Option<TerminalReason>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_tag_push(&self) -> bool {
        self.tag.is_some()
    }

    pub fn label_requirements(&self) -> &[String] {
        &self.required_labels
    }
}

#[cfg(test)]
mod tests {
    use super::JobStatus::*;

    #[test]
    fn terminal_states_reject_all_transitions() {
        for terminal in [Success, Failure, Error, Cancelled] {
            for next in [Pending, PendingContributor, Assigned, Running, Success] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn assigned_to_running_requires_ack_path() {
        assert!(Assigned.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Running));
    }

    #[test]
    fn pending_contributor_only_reachable_from_pending() {
        assert!(Pending.can_transition_to(PendingContributor));
        assert!(!Assigned.can_transition_to(PendingContributor));
    }
}
