//! Per-job single-writer serialization (`spec.md` §4.4, §5).
//!
//! Storage's conditional status update already enforces correctness
//! under concurrent writers, but serializing in-process avoids two
//! dispatch attempts for the same job racing to send two
//! `JOB_ASSIGN`s before either conditional write lands. Grounded on
//! the general "sharded lock table" idea rather than a single global
//! mutex, so unrelated jobs never block each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use cinch_core::JobId;
use tokio::sync::Mutex as AsyncMutex;

const SHARDS: usize = 16;

pub struct JobLocks {
    shards: Vec<StdMutex<HashMap<JobId, Arc<AsyncMutex<()>>>>>,
}

impl Default for JobLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLocks {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| StdMutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, id: JobId) -> &StdMutex<HashMap<JobId, Arc<AsyncMutex<()>>>> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Acquire the per-job lock, creating its entry on first use.
    pub async fn lock(&self, id: JobId) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut shard = self.shard_for(id).lock().unwrap();
            shard.entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        mutex.lock_owned().await
    }
}
