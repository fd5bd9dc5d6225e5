//! Executor (Worker): a remote process offering to run jobs.
//!
//! Durable attributes live here and are owned by `Storage`. The live
//! session handle (transport, current generation, in-flight job set)
//! is NOT part of this type — it is owned exclusively by the Hub
//! (`cinch-hub`), per `spec.md` §3 "Ownership summary".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::id::{RepositoryId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    Personal,
    Shared,
}

/// Durable record of a registered executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub display_name: String,
    pub owner_principal_id: String,
    pub owner_login: String,
    pub mode: WorkerMode,
    pub labels: HashSet<String>,
    /// Only meaningful when `mode == Shared`.
    pub registered_repos: HashSet<RepositoryId>,
    pub last_seen_at: DateTime<Utc>,
}

impl Worker {
    pub fn has_labels(&self, required: &HashSet<String>) -> bool {
        required.is_subset(&self.labels)
    }
}
