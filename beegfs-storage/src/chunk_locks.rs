//! Per-chunk locks shared by request handlers and resync slaves
//!
//! A chunk is identified by its target and its path relative to the mirror
//! root. Locks are released when the guard drops.

use beegfs_core::TargetId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;

type ChunkKey = (TargetId, String);

#[derive(Debug, Default)]
pub struct ChunkLockStore {
    locked: Mutex<HashSet<ChunkKey>>,
    released: Notify,
}

impl ChunkLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the chunk is free and lock it
    pub async fn lock_chunk(
        self: &Arc<Self>,
        target_id: TargetId,
        entry_id: &str,
    ) -> ChunkLockGuard {
        let key = (target_id, entry_id.to_string());

        loop {
            // register before checking so a release in between is not missed
            let released = self.released.notified();
            let acquired = self.locked.lock().insert(key.clone());
            if acquired {
                return ChunkLockGuard {
                    store: self.clone(),
                    key,
                };
            }
            released.await;
        }
    }

    pub fn try_lock_chunk(
        self: &Arc<Self>,
        target_id: TargetId,
        entry_id: &str,
    ) -> Option<ChunkLockGuard> {
        let key = (target_id, entry_id.to_string());
        if self.locked.lock().insert(key.clone()) {
            Some(ChunkLockGuard {
                store: self.clone(),
                key,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self, target_id: TargetId, entry_id: &str) -> bool {
        self.locked
            .lock()
            .contains(&(target_id, entry_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.locked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked.lock().is_empty()
    }

    fn unlock(&self, key: &ChunkKey) {
        self.locked.lock().remove(key);
        self.released.notify_waiters();
    }
}

/// Holds a chunk lock until dropped
#[derive(Debug)]
pub struct ChunkLockGuard {
    store: Arc<ChunkLockStore>,
    key: ChunkKey,
}

impl ChunkLockGuard {
    pub fn target_id(&self) -> TargetId {
        self.key.0
    }

    pub fn entry_id(&self) -> &str {
        &self.key.1
    }
}

impl Drop for ChunkLockGuard {
    fn drop(&mut self) {
        self.store.unlock(&self.key);
    }
}
