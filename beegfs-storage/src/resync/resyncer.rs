//! Per-target resync bookkeeping and the periodic check that starts jobs

use beegfs_core::{BeegfsError, ConsistencyState, ReachabilityState, Result, TargetId};
use beegfs_topology::Topology;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::job::{BuddyResyncJob, JobStats};
use super::{ResyncConfig, ResyncContext};
use crate::buddy_comm::BuddyCommClient;
use crate::chunk_locks::ChunkLockStore;
use crate::chunk_store::ChunkStore;
use crate::targets::StorageTargets;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncerState {
    Idle,
    Running,
}

pub struct BuddyResyncer {
    config: ResyncConfig,
    topology: Arc<Topology>,
    targets: Arc<StorageTargets>,
    chunk_store: Arc<dyn ChunkStore>,
    buddy: Arc<dyn BuddyCommClient>,
    locks: Arc<ChunkLockStore>,
    /// Most recent job per target, kept after it finishes for its stats
    jobs: Mutex<HashMap<TargetId, Arc<BuddyResyncJob>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl BuddyResyncer {
    pub fn new(
        config: ResyncConfig,
        topology: Arc<Topology>,
        targets: Arc<StorageTargets>,
        chunk_store: Arc<dyn ChunkStore>,
        buddy: Arc<dyn BuddyCommClient>,
        locks: Arc<ChunkLockStore>,
    ) -> Self {
        Self {
            config,
            topology,
            targets,
            chunk_store,
            buddy,
            locks,
            jobs: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self, target_id: TargetId) -> ResyncerState {
        match self.jobs.lock().get(&target_id) {
            Some(job) if !job.status().is_finished() => ResyncerState::Running,
            _ => ResyncerState::Idle,
        }
    }

    pub fn is_running(&self, target_id: TargetId) -> bool {
        self.state(target_id) == ResyncerState::Running
    }

    /// Spawn a resync job for a local primary target
    pub fn start_resync(&self, target_id: TargetId) -> Result<()> {
        if !self.targets.contains(target_id) {
            return Err(BeegfsError::UnknownTarget(target_id));
        }

        let job = {
            let mut jobs = self.jobs.lock();
            if jobs
                .get(&target_id)
                .is_some_and(|job| !job.status().is_finished())
            {
                return Err(BeegfsError::AlreadyRunning(format!(
                    "resync of target {}",
                    target_id
                )));
            }

            let ctx = Arc::new(ResyncContext::new(
                target_id,
                self.config.clone(),
                self.topology.clone(),
                self.targets.clone(),
                self.chunk_store.clone(),
                self.buddy.clone(),
                self.locks.clone(),
                self.cancel.child_token(),
            ));
            let job = Arc::new(BuddyResyncJob::new(ctx));
            jobs.insert(target_id, job.clone());
            job
        };

        let handle = tokio::spawn(async move {
            if let Err(e) = job.run().await {
                error!(target_id = job.target_id(), error = %e, "Resync job did not run");
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);

        Ok(())
    }

    /// Returns false if no job is running for the target
    pub fn abort(&self, target_id: TargetId) -> bool {
        match self.jobs.lock().get(&target_id) {
            Some(job) if !job.status().is_finished() => {
                info!(target_id, "Aborting buddy resync");
                job.abort();
                true
            }
            _ => false,
        }
    }

    pub fn job_stats(&self, target_id: TargetId) -> Option<JobStats> {
        self.jobs.lock().get(&target_id).map(|job| job.stats())
    }

    /// Start a resync for every local primary whose secondary is online and
    /// needs one. Returns the targets a job was started for.
    pub fn check_and_start(&self) -> Vec<TargetId> {
        let groups = &self.topology.storage_buddy_groups;
        let mut started = Vec::new();

        for target_id in self.targets.target_ids() {
            let Some((group_id, true)) = groups.get_buddy_group_id(target_id) else {
                continue;
            };
            let Some(secondary) = groups.get_secondary_target_id(group_id) else {
                continue;
            };
            let Some(state) = self.topology.target_states.get_state(secondary) else {
                continue;
            };

            let needs_resync = state.consistency == ConsistencyState::NeedsResync
                || self.targets.buddy_needs_resync(target_id);
            if state.reachability != ReachabilityState::Online || !needs_resync {
                continue;
            }
            if self.is_running(target_id) {
                continue;
            }

            match self.start_resync(target_id) {
                Ok(()) => {
                    info!(target_id, secondary, group_id, "Starting buddy resync");
                    started.push(target_id);
                }
                Err(e) => error!(target_id, error = %e, "Unable to start buddy resync"),
            }
        }

        started
    }

    /// Start the periodic resync check
    pub fn start(self: Arc<Self>, check_interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let resyncer = self;

        tokio::spawn(async move {
            let mut check_timer = interval(check_interval);

            info!(
                interval_secs = check_interval.as_secs(),
                targets = resyncer.targets.len(),
                "Buddy resync check started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        resyncer.shutdown().await;
                        info!("Buddy resync check stopped");
                        break;
                    }
                    _ = check_timer.tick() => {
                        let started = resyncer.check_and_start();
                        debug!(started = started.len(), "Buddy resync check complete");
                    }
                }
            }
        })
    }

    /// Abort all jobs and wait for them to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Resync task panicked");
            }
        }
    }
}
