//! Access Cache: `(forge, repo_full_name, username) -> AccessLevel`
//! with a bounded TTL (`spec.md` §3, §4.8). Created lazily, evicted by
//! TTL, invalidated explicitly on collaborator-change webhooks.
//!
//! Process-local and bounded, like the Hub's session map — generalized
//! from `buildit-db::repo::organization`'s membership-lookup shape
//! (forge collaborator access plays the role org membership does
//! there), but kept in memory rather than a durable table since
//! `spec.md` §3 describes this as a TTL cache, not a record of truth.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::warn;

use cinch_core::repository::ForgeKind;
use cinch_core::trust::AccessLevel;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Key {
    forge: ForgeKind,
    repo_full_name: String,
    username: String,
}

struct Entry {
    level: AccessLevel,
    expires_at: Instant,
}

/// Bounded, TTL'd cache of forge collaborator access.
///
/// On a cache miss at *visibility*-check time, callers MAY issue a
/// live forge query and `insert` the result. On a cache miss at
/// *dispatch* time (Job Factory, `spec.md` §4.2), callers MUST fail
/// closed (treat as `AccessLevel::None`) rather than block on a forge
/// call in that path — this type only stores what it's given; it does
/// not perform I/O itself.
pub struct AccessCache {
    ttl: Duration,
    entries: RwLock<HashMap<Key, Entry>>,
}

impl Default for AccessCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl AccessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns `None` on a cold or TTL-expired entry.
    pub async fn get(&self, forge: ForgeKind, repo_full_name: &str, username: &str) -> Option<AccessLevel> {
        let key = Key {
            forge,
            repo_full_name: repo_full_name.to_string(),
            username: username.to_string(),
        };
        let entries = self.entries.read().await;
        entries.get(&key).and_then(|e| {
            if e.expires_at > Instant::now() {
                Some(e.level)
            } else {
                None
            }
        })
    }

    /// Returns the cached value even if stale, for the forge-rate-limit
    /// fallback path (`spec.md` §4.8: "Queries that hit the forge rate
    /// limit fall back to the cached value even if stale").
    pub async fn get_even_if_stale(
        &self,
        forge: ForgeKind,
        repo_full_name: &str,
        username: &str,
    ) -> Option<AccessLevel> {
        let key = Key {
            forge,
            repo_full_name: repo_full_name.to_string(),
            username: username.to_string(),
        };
        let entries = self.entries.read().await;
        let found = entries.get(&key).map(|e| e.level);
        if found.is_some() {
            warn!(repo = %repo_full_name, %username, "serving stale access-cache entry after rate limit");
        }
        found
    }

    pub async fn insert(&self, forge: ForgeKind, repo_full_name: &str, username: &str, level: AccessLevel) {
        let key = Key {
            forge,
            repo_full_name: repo_full_name.to_string(),
            username: username.to_string(),
        };
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            Entry {
                level,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Explicit invalidation on a collaborator-change webhook.
    pub async fn invalidate_repo(&self, forge: ForgeKind, repo_full_name: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|k, _| !(k.forge == forge && k.repo_full_name == repo_full_name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_then_hit_after_insert() {
        let cache = AccessCache::new(Duration::from_secs(60));
        assert_eq!(cache.get(ForgeKind::Github, "acme/app", "alice").await, None);
        cache
            .insert(ForgeKind::Github, "acme/app", "alice", AccessLevel::Write)
            .await;
        assert_eq!(
            cache.get(ForgeKind::Github, "acme/app", "alice").await,
            Some(AccessLevel::Write)
        );
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_but_stale_read_still_works() {
        let cache = AccessCache::new(Duration::from_millis(1));
        cache
            .insert(ForgeKind::Github, "acme/app", "alice", AccessLevel::Write)
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get(ForgeKind::Github, "acme/app", "alice").await, None);
        assert_eq!(
            cache.get_even_if_stale(ForgeKind::Github, "acme/app", "alice").await,
            Some(AccessLevel::Write)
        );
    }

    #[tokio::test]
    async fn invalidate_repo_clears_all_users() {
        let cache = AccessCache::new(Duration::from_secs(60));
        cache
            .insert(ForgeKind::Github, "acme/app", "alice", AccessLevel::Write)
            .await;
        cache.invalidate_repo(ForgeKind::Github, "acme/app").await;
        assert_eq!(cache.get(ForgeKind::Github, "acme/app", "alice").await, None);
    }
}
