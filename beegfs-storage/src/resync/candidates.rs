//! Work queues of a resync job
//!
//! Slaves pull candidates from [`WorkQueue`]s. A queue knows how many of its
//! items are still being processed, so a slave told to finish when idle only
//! stops once no other slave can add more work.

use beegfs_core::TargetId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A directory to reconcile between primary and secondary
#[derive(Debug, Clone)]
pub struct DirSyncCandidate {
    pub relative_path: String,
    pub target_id: TargetId,
    /// Barrier of the parent directory waiting for this one
    pub parent: Option<Arc<SubdirBarrier>>,
    /// Second pass over a directory whose secondary-only subdirectories
    /// have been emptied
    pub finalize: bool,
}

impl DirSyncCandidate {
    pub fn new(relative_path: impl Into<String>, target_id: TargetId) -> Self {
        Self {
            relative_path: relative_path.into(),
            target_id,
            parent: None,
            finalize: false,
        }
    }

    pub fn child(
        relative_path: impl Into<String>,
        target_id: TargetId,
        parent: Arc<SubdirBarrier>,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            target_id,
            parent: Some(parent),
            finalize: false,
        }
    }

    /// Finalize pass over this directory, reporting to the same parent
    pub fn to_finalize(&self) -> Self {
        Self {
            relative_path: self.relative_path.clone(),
            target_id: self.target_id,
            parent: self.parent.clone(),
            finalize: true,
        }
    }
}

/// A chunk file to copy to the secondary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSyncCandidate {
    pub relative_path: String,
    pub target_id: TargetId,
}

impl FileSyncCandidate {
    pub fn new(relative_path: impl Into<String>, target_id: TargetId) -> Self {
        Self {
            relative_path: relative_path.into(),
            target_id,
        }
    }
}

/// Counts synced subdirectories of one directory; the last one to report
/// enqueues the parent's finalize candidate
#[derive(Debug)]
pub struct SubdirBarrier {
    expected: usize,
    synced: AtomicUsize,
    parent_candidate: DirSyncCandidate,
}

impl SubdirBarrier {
    pub fn new(expected: usize, parent_candidate: DirSyncCandidate) -> Self {
        Self {
            expected,
            synced: AtomicUsize::new(0),
            parent_candidate,
        }
    }

    /// Returns true for exactly one caller: the one completing the count
    pub fn notify_subdir_synced(&self) -> bool {
        self.synced
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.expected).then_some(n + 1)
            })
            .is_ok_and(|prev| prev + 1 == self.expected)
    }

    pub fn parent_candidate(&self) -> &DirSyncCandidate {
        &self.parent_candidate
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn synced(&self) -> usize {
        self.synced.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    in_flight: usize,
    finishing: bool,
}

/// FIFO queue shared by a group of slaves
#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    changed: Notify,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                in_flight: 0,
                finishing: false,
            }),
            changed: Notify::new(),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.state.lock().items.push_back(item);
        self.changed.notify_waiters();
    }

    /// Next item, or `None` once the queue is drained in finishing mode or
    /// `cancel` fires. Every returned item must be followed by [`done`](Self::done).
    pub async fn fetch(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            let changed = self.changed.notified();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    state.in_flight += 1;
                    return Some(item);
                }
                if state.finishing && state.in_flight == 0 {
                    return None;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = changed => {}
            }
        }
    }

    /// Mark a fetched item as processed
    pub fn done(&self) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }

    /// Let slaves stop once the queue is empty and nothing is in flight
    pub fn finish_when_idle(&self) {
        self.state.lock().finishing = true;
        self.changed.notify_waiters();
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.in_flight = 0;
        state.finishing = false;
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

/// All queues of one resync job
#[derive(Debug, Default)]
pub struct SyncCandidateStore {
    pub dirs: WorkQueue<DirSyncCandidate>,
    pub files: WorkQueue<FileSyncCandidate>,
    /// Directories below the walk depth, handed to gather slaves
    pub gather: WorkQueue<String>,
}

impl SyncCandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&self, candidate: DirSyncCandidate) {
        self.dirs.push(candidate);
    }

    pub fn add_file(&self, candidate: FileSyncCandidate) {
        self.files.push(candidate);
    }

    pub fn is_dirs_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn is_files_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&self) {
        self.dirs.clear();
        self.files.clear();
        self.gather.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn barrier(expected: usize) -> SubdirBarrier {
        SubdirBarrier::new(expected, DirSyncCandidate::new("a", 1).to_finalize())
    }

    #[test]
    fn test_barrier_fires_once() {
        let barrier = barrier(3);
        assert!(!barrier.notify_subdir_synced());
        assert!(!barrier.notify_subdir_synced());
        assert!(barrier.notify_subdir_synced());
        assert!(!barrier.notify_subdir_synced());
        assert_eq!(barrier.synced(), 3);
        assert!(barrier.parent_candidate().finalize);
    }

    #[test]
    fn test_barrier_concurrent_signals() {
        for _ in 0..50 {
            let barrier = Arc::new(barrier(16));
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let barrier = barrier.clone();
                    std::thread::spawn(move || barrier.notify_subdir_synced())
                })
                .collect();

            let fired = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|fired| *fired)
                .count();
            assert_eq!(fired, 1);
        }
    }

    proptest! {
        #[test]
        fn barrier_needs_all_signals(expected in 1usize..64, extra in 0usize..8) {
            let barrier = barrier(expected);
            for _ in 0..expected - 1 {
                prop_assert!(!barrier.notify_subdir_synced());
            }
            prop_assert!(barrier.notify_subdir_synced());
            for _ in 0..extra {
                prop_assert!(!barrier.notify_subdir_synced());
            }
        }
    }

    #[tokio::test]
    async fn test_queue_finishes_when_idle() {
        let queue = Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();
        queue.push(1);

        let item = queue.fetch(&cancel).await;
        assert_eq!(item, Some(1));
        queue.finish_when_idle();

        // an in-flight item may still produce work, so a second slave waits
        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.fetch(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.push(2);
        queue.done();
        assert_eq!(waiter.await.unwrap(), Some(2));
        queue.done();

        assert_eq!(queue.fetch(&cancel).await, None);
    }

    #[tokio::test]
    async fn test_queue_fetch_cancelled() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(queue.fetch(&cancel).await, None);
    }

    #[test]
    fn test_store_clear() {
        let store = SyncCandidateStore::new();
        store.add_dir(DirSyncCandidate::new("x", 1));
        store.add_file(FileSyncCandidate::new("x/y", 1));
        assert!(!store.is_dirs_empty());
        assert!(!store.is_files_empty());

        store.clear();
        assert!(store.is_dirs_empty());
        assert!(store.is_files_empty());
    }
}
