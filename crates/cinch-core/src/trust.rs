//! Trust evaluation (`spec.md` §4.8).

use serde::{Deserialize, Serialize};

use crate::job::TrustLevel;

/// A principal's access level to a repository, as reported by a forge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Write,
    Read,
    None,
}

/// Pure trust computation, grounded directly on the `spec.md` §4.8 rules.
/// This function never performs I/O; callers resolve `access` from the
/// Access Cache beforehand (falling closed to `None` on cache miss at
/// dispatch time, per `spec.md` §4.2/§4.8).
pub fn compute_trust_level(
    sender_is_repo_owner: bool,
    access: AccessLevel,
    is_fork: bool,
) -> TrustLevel {
    if sender_is_repo_owner {
        TrustLevel::Owner
    } else if !is_fork && access == AccessLevel::Write {
        TrustLevel::Collaborator
    } else {
        TrustLevel::External
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_always_trusted() {
        assert_eq!(
            compute_trust_level(true, AccessLevel::None, true),
            TrustLevel::Owner
        );
    }

    #[test]
    fn fork_is_external_even_with_write_access() {
        assert_eq!(
            compute_trust_level(false, AccessLevel::Write, true),
            TrustLevel::External
        );
    }

    #[test]
    fn collaborator_requires_write_access_and_same_repo() {
        assert_eq!(
            compute_trust_level(false, AccessLevel::Write, false),
            TrustLevel::Collaborator
        );
        assert_eq!(
            compute_trust_level(false, AccessLevel::Read, false),
            TrustLevel::External
        );
    }
}
