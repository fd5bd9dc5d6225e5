//! Typed, prefixed resource identifiers.
//!
//! Every entity id in Cinch carries its kind in the wire representation
//! (`j_01hq...`, `w_01hq...`) so a `JobId` can never be accidentally
//! compared against a `WorkerId`. Internally each id wraps a UUIDv7 for
//! time-ordered, sortable storage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when a prefixed id string fails to parse.
#[derive(Debug, thiserror::Error)]
#[error("invalid {kind} id {input:?}: {reason}")]
pub struct IdParseError {
    kind: &'static str,
    input: String,
    reason: &'static str,
}

/// Marker trait supplying the wire prefix for a resource kind.
pub trait IdKind {
    const PREFIX: &'static str;
}

/// A resource id prefixed with its kind tag, e.g. `j_<uuid>`.
pub struct TypedId<K: IdKind> {
    uuid: Uuid,
    _kind: PhantomData<K>,
}

impl<K: IdKind> TypedId<K> {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::now_v7(),
            _kind: PhantomData,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            _kind: PhantomData,
        }
    }

    pub fn as_uuid(&self) -> Uuid {
        self.uuid
    }
}

impl<K: IdKind> Default for TypedId<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: IdKind> Clone for TypedId<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K: IdKind> Copy for TypedId<K> {}

impl<K: IdKind> PartialEq for TypedId<K> {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}
impl<K: IdKind> Eq for TypedId<K> {}

impl<K: IdKind> std::hash::Hash for TypedId<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl<K: IdKind> fmt::Debug for TypedId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", K::PREFIX, self.uuid)
    }
}

impl<K: IdKind> fmt::Display for TypedId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", K::PREFIX, self.uuid)
    }
}

impl<K: IdKind> FromStr for TypedId<K> {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(K::PREFIX).ok_or(IdParseError {
            kind: K::PREFIX,
            input: s.to_string(),
            reason: "missing expected prefix",
        })?;
        let uuid = Uuid::parse_str(rest).map_err(|_| IdParseError {
            kind: K::PREFIX,
            input: s.to_string(),
            reason: "not a valid uuid",
        })?;
        Ok(Self::from_uuid(uuid))
    }
}

impl<K: IdKind> Serialize for TypedId<K> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de, K: IdKind> Deserialize<'de> for TypedId<K> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

macro_rules! id_kind {
    ($kind:ident, $alias:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $kind;

        impl IdKind for $kind {
            const PREFIX: &'static str = $prefix;
        }

        pub type $alias = TypedId<$kind>;
    };
}

id_kind!(JobKind, JobId, "j_");
id_kind!(WorkerKind, WorkerId, "w_");
id_kind!(RepositoryKind, RepositoryId, "r_");
id_kind!(TokenKind, TokenId, "tok_");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_display_and_parse() {
        let id = JobId::new();
        let printed = id.to_string();
        assert!(printed.starts_with("j_"));
        let parsed: JobId = printed.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_prefix() {
        let job_str = JobId::new().to_string();
        assert!(job_str.parse::<WorkerId>().is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let id = WorkerId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: WorkerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
