// Per-branch read/write locks
//
// A job branch is mutated only by its own runner (commit = write side) while
// conflict detection reads it (read side). Locks are created on first use and
// dropped again once no guard or waiter holds them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::utils::lock_mutex_recover;

#[derive(Default)]
pub struct BranchLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, branch: &str) -> Arc<RwLock<()>> {
        let mut locks = lock_mutex_recover(&self.locks);
        // Guards and pending acquisitions each own a clone
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(branch.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Shared access for readers of the branch (diffs, file lists)
    pub async fn read(&self, branch: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(branch).read_owned().await
    }

    /// Exclusive access for operations that move the branch (commits)
    pub async fn write(&self, branch: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(branch).write_owned().await
    }
}
