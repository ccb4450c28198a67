//! Buddy Mirror Resync
//!
//! Brings a secondary target back in line with its primary after it missed
//! mirrored writes. Runs on the storage node of the primary.
//!
//! # Architecture
//!
//! ```text
//!                    BuddyResyncJob::run
//!                           │
//!          walk local dirs to the walk depth
//!           │                │                 │
//!      newer dirs       deeper dirs       newer files
//!           │                ▼                 │
//!           │         gather slaves ──────┐    │
//!           ▼                ▼            ▼    ▼
//!     ┌───────────────────────┐   ┌──────────────────────┐
//!     │  dir candidate queue  │   │ file candidate queue │
//!     └───────────────────────┘   └──────────────────────┘
//!           │        ▲                     │
//!           ▼        │ children            ▼
//!     dir sync slaves                file sync slaves
//!     list secondary, delete         push chunk blocks
//!     chunks missing locally         to the secondary
//! ```

pub mod candidates;
pub mod dir_sync;
pub mod file_sync;
pub mod gather;
pub mod job;
pub mod resyncer;

pub use candidates::{
    DirSyncCandidate, FileSyncCandidate, SubdirBarrier, SyncCandidateStore, WorkQueue,
};
pub use dir_sync::DirSyncSlave;
pub use file_sync::FileSyncSlave;
pub use gather::GatherSlave;
pub use job::{BuddyResyncJob, JobStats, JobStatus};
pub use resyncer::{BuddyResyncer, ResyncerState};

use beegfs_core::{BeegfsError, ReachabilityState, Result, TargetId};
use beegfs_topology::{NodeHandle, Topology};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buddy_comm::BuddyCommClient;
use crate::chunk_locks::ChunkLockStore;
use crate::chunk_store::ChunkStore;
use crate::targets::StorageTargets;

/// Resync tuning
#[derive(Debug, Clone)]
pub struct ResyncConfig {
    pub dir_sync_slaves: usize,
    pub file_sync_slaves: usize,
    pub gather_slaves: usize,
    /// Subtracted from the last buddy communication time; zero disables it
    pub safety_threshold: Duration,
    /// Directory levels walked by the job itself; deeper ones go to gather slaves
    pub walk_depth: usize,
    /// Entries requested per secondary directory listing
    pub list_batch_size: u32,
    /// Pause between attempts while the buddy is unreachable but not offline
    pub comm_retry_interval: Duration,
    /// Bytes per file block pushed to the secondary
    pub file_block_size: usize,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            dir_sync_slaves: 4,
            file_sync_slaves: 4,
            gather_slaves: 2,
            safety_threshold: Duration::from_secs(10 * 60),
            walk_depth: 2,
            list_batch_size: 50,
            comm_retry_interval: Duration::from_secs(5),
            file_block_size: 1024 * 1024,
        }
    }
}

/// Progress counters shared by all slaves of a job
#[derive(Debug, Default)]
pub struct JobCounters {
    pub dirs_discovered: AtomicU64,
    pub dirs_synced: AtomicU64,
    pub additional_dirs_matched: AtomicU64,
    pub dir_errors: AtomicU64,
    pub files_discovered: AtomicU64,
    pub files_synced: AtomicU64,
    pub file_errors: AtomicU64,
}

impl JobCounters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        Self::get(&self.dir_errors) + Self::get(&self.file_errors)
    }
}

/// Everything the slaves of one job share
pub struct ResyncContext {
    pub target_id: TargetId,
    pub config: ResyncConfig,
    pub topology: Arc<Topology>,
    pub targets: Arc<StorageTargets>,
    pub chunk_store: Arc<dyn ChunkStore>,
    pub buddy: Arc<dyn BuddyCommClient>,
    pub locks: Arc<ChunkLockStore>,
    pub candidates: SyncCandidateStore,
    pub counters: JobCounters,
    pub cancel: CancellationToken,
    target_was_offline: AtomicBool,
    threshold: RwLock<SystemTime>,
}

impl ResyncContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target_id: TargetId,
        config: ResyncConfig,
        topology: Arc<Topology>,
        targets: Arc<StorageTargets>,
        chunk_store: Arc<dyn ChunkStore>,
        buddy: Arc<dyn BuddyCommClient>,
        locks: Arc<ChunkLockStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target_id,
            config,
            topology,
            targets,
            chunk_store,
            buddy,
            locks,
            candidates: SyncCandidateStore::new(),
            counters: JobCounters::default(),
            cancel,
            target_was_offline: AtomicBool::new(false),
            threshold: RwLock::new(UNIX_EPOCH),
        }
    }

    /// Entries modified after this time need a resync
    pub fn threshold(&self) -> SystemTime {
        *self.threshold.read()
    }

    pub fn set_threshold(&self, threshold: SystemTime) {
        *self.threshold.write() = threshold;
    }

    pub fn target_was_offline(&self) -> bool {
        self.target_was_offline.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Buddy target of a local target and the node holding it
    pub fn resolve_buddy(&self, local_target: TargetId) -> Result<(TargetId, NodeHandle)> {
        let buddy_target = self
            .topology
            .storage_buddy_groups
            .get_buddy_target_id(local_target)
            .ok_or(BeegfsError::UnknownTarget(local_target))?;

        let node_id = self
            .topology
            .target_mapper
            .get_node_id(buddy_target)
            .ok_or(BeegfsError::UnknownTarget(buddy_target))?;

        let node = self
            .topology
            .storage_nodes
            .reference(node_id)
            .ok_or(BeegfsError::UnknownNode(node_id))?;

        Ok((buddy_target, node))
    }

    fn buddy_is_offline(&self, buddy_target: TargetId) -> bool {
        self.topology
            .target_states
            .get_state(buddy_target)
            .map_or(true, |s| s.reachability == ReachabilityState::Offline)
    }

    /// Run `op` against the buddy, retrying communication failures for as
    /// long as the buddy target is not offline
    pub async fn buddy_request<T, F, Fut>(&self, buddy_target: TargetId, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            match op().await {
                Err(e) if e.is_communication() => {
                    if self.buddy_is_offline(buddy_target) {
                        self.target_was_offline.store(true, Ordering::Release);
                        return Err(BeegfsError::Communication(format!(
                            "buddy target {} is offline",
                            buddy_target
                        )));
                    }

                    debug!(
                        buddy_target,
                        error = %e,
                        retry_ms = self.config.comm_retry_interval.as_millis(),
                        "Buddy unreachable but not offline, retrying"
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(BeegfsError::Interrupted),
                        _ = tokio::time::sleep(self.config.comm_retry_interval) => {}
                    }
                }
                other => return other,
            }
        }
    }
}
