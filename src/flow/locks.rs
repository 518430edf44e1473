//! Striped per-work-item write locks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use flow_common::WorkItemId;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::errors::FlowError;

/// A fixed pool of mutexes. Each work item id hashes to one shard, so writers
/// for the same id serialise while most different ids proceed in parallel.
pub struct LockPool {
    shards: Vec<Mutex<()>>,
}

impl LockPool {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, id: WorkItemId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Wait for the shard owning `id`, giving up at `deadline`.
    pub async fn acquire(
        &self,
        id: WorkItemId,
        deadline: Instant,
    ) -> Result<MutexGuard<'_, ()>, FlowError> {
        let shard = &self.shards[self.shard_of(id)];
        tokio::time::timeout_at(deadline, shard.lock())
            .await
            .map_err(|_| FlowError::DeadlineExceeded("waiting for work item lock"))
    }
}
