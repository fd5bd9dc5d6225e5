//! Repository: a tracked source location.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::id::RepositoryId;

/// Git forge kind. Unlike the teacher's closed 3-way `GitProvider`, this
/// carries a `Generic` fallback per `spec.md` §3 (`{github, gitlab,
/// forgejo, gitea, bitbucket, generic}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForgeKind {
    Github,
    Gitlab,
    Forgejo,
    Gitea,
    Bitbucket,
    Generic,
}

impl fmt::Display for ForgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForgeKind::Github => "github",
            ForgeKind::Gitlab => "gitlab",
            ForgeKind::Forgejo => "forgejo",
            ForgeKind::Gitea => "gitea",
            ForgeKind::Bitbucket => "bitbucket",
            ForgeKind::Generic => "generic",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ForgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "gitlab" => Ok(Self::Gitlab),
            "forgejo" => Ok(Self::Forgejo),
            "gitea" => Ok(Self::Gitea),
            "bitbucket" => Ok(Self::Bitbucket),
            "generic" => Ok(Self::Generic),
            other => Err(format!("unknown forge kind: {other}")),
        }
    }
}

/// A tracked source repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub forge: ForgeKind,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    pub public_url: String,
    pub is_private: bool,
    /// Encrypted at rest; decrypted only inside the forge adapter.
    pub webhook_secret: EncryptedSecret,
    pub forge_credential: Option<EncryptedSecret>,
    pub build_command: String,
    pub release_command: Option<String>,
    pub workers: Vec<String>,
    pub env: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// The command template to use for the given ref kind, per
    /// `spec.md` §4.2: tags use `release` if present, otherwise fall
    /// back to `build`.
    pub fn command_for(&self, is_tag: bool) -> &str {
        if is_tag {
            self.release_command.as_deref().unwrap_or(&self.build_command)
        } else {
            &self.build_command
        }
    }

    /// Labels to fan a job out over; an empty set means "any worker",
    /// represented here as a single synthetic unlabeled fan-out slot.
    pub fn fanout_labels(&self) -> Vec<HashSet<String>> {
        if self.workers.is_empty() {
            vec![HashSet::new()]
        } else {
            self.workers
                .iter()
                .map(|w| HashSet::from([w.clone()]))
                .collect()
        }
    }
}

/// A secret value that is encrypted at rest; this type only carries the
/// ciphertext plus enough metadata to decrypt it. Encryption/decryption
/// itself is a collaborator concern (outside this crate's scope, per
/// `spec.md` §1's "secret storage" Non-goal for the agent side — control
/// plane secrets at rest remain in scope because repositories must store
/// webhook secrets and forge credentials somewhere).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Request to attach a new repository, issued by an authenticated admin.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRepositoryRequest {
    pub forge: ForgeKind,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    pub public_url: String,
    pub is_private: bool,
    pub webhook_secret: String,
    pub forge_credential: Option<String>,
    pub build_command: String,
    pub release_command: Option<String>,
    pub workers: Vec<String>,
    pub env: HashMap<String, String>,
}
