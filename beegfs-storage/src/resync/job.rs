//! One resync run of a local primary target against its secondary

use beegfs_core::{BeegfsError, ConsistencyState, EntryKind, Result, TargetId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::candidates::{DirSyncCandidate, FileSyncCandidate};
use super::dir_sync::DirSyncSlave;
use super::file_sync::FileSyncSlave;
use super::gather::GatherSlave;
use super::{JobCounters, ResyncContext};
use crate::chunk_store::join_path;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    NotStarted,
    Running,
    Success,
    Interrupted,
    Failure,
    Errors,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not-started"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Failure => write!(f, "failure"),
            Self::Errors => write!(f, "errors"),
        }
    }
}

/// Point-in-time view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub target_id: TargetId,
    pub buddy_target_id: Option<TargetId>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub dirs_discovered: u64,
    pub dirs_synced: u64,
    pub additional_dirs_matched: u64,
    pub dir_errors: u64,
    pub files_discovered: u64,
    pub files_synced: u64,
    pub file_errors: u64,
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    buddy_target: Option<TargetId>,
}

/// Entries modified after the returned time must be resynced.
///
/// Without a recorded buddy communication everything is resynced. A zero
/// safety threshold disables the margin, which also means a full resync
/// unless the time was set as an override.
pub fn compute_threshold(
    last_buddy_comm: Option<SystemTime>,
    safety: Duration,
    is_override: bool,
) -> SystemTime {
    let Some(last) = last_buddy_comm else {
        return UNIX_EPOCH;
    };
    if safety.is_zero() {
        return if is_override { last } else { UNIX_EPOCH };
    }
    last.checked_sub(safety)
        .filter(|t| *t > UNIX_EPOCH)
        .unwrap_or(UNIX_EPOCH)
}

pub struct BuddyResyncJob {
    ctx: Arc<ResyncContext>,
    state: Mutex<JobState>,
}

impl BuddyResyncJob {
    pub fn new(ctx: Arc<ResyncContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(JobState {
                status: JobStatus::NotStarted,
                started_at: None,
                ended_at: None,
                buddy_target: None,
            }),
        }
    }

    pub fn target_id(&self) -> TargetId {
        self.ctx.target_id
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    /// Stop the walk and all slaves as soon as possible
    pub fn abort(&self) {
        self.ctx.cancel.cancel();
    }

    pub fn stats(&self) -> JobStats {
        let state = self.state.lock();
        let c = &self.ctx.counters;
        JobStats {
            target_id: self.ctx.target_id,
            buddy_target_id: state.buddy_target,
            status: state.status,
            started_at: state.started_at,
            ended_at: state.ended_at,
            dirs_discovered: JobCounters::get(&c.dirs_discovered),
            dirs_synced: JobCounters::get(&c.dirs_synced),
            additional_dirs_matched: JobCounters::get(&c.additional_dirs_matched),
            dir_errors: JobCounters::get(&c.dir_errors),
            files_discovered: JobCounters::get(&c.files_discovered),
            files_synced: JobCounters::get(&c.files_synced),
            file_errors: JobCounters::get(&c.file_errors),
        }
    }

    /// Run the job to completion. A job runs at most once.
    pub async fn run(&self) -> Result<JobStatus> {
        let target = self.ctx.target_id;
        {
            let mut state = self.state.lock();
            if state.status != JobStatus::NotStarted {
                return Err(BeegfsError::AlreadyRunning(format!(
                    "resync job of target {}",
                    target
                )));
            }
            state.status = JobStatus::Running;
            state.started_at = Some(Utc::now());
        }
        let started = SystemTime::now();
        metrics::resync_job_started();
        info!(target_id = target, "Buddy resync started");

        // Step 1: Reset state left over from an earlier job
        self.ctx.candidates.clear();
        self.ctx.targets.set_resync_in_progress(target, true);

        let status = self.execute().await;
        self.finish(status, started).await;

        Ok(self.status())
    }

    async fn execute(&self) -> JobStatus {
        let target = self.ctx.target_id;

        // Step 2: Tell the secondary a resync is starting
        let (buddy_target, node) = match self.ctx.resolve_buddy(target) {
            Ok(buddy) => buddy,
            Err(e) => {
                error!(target_id = target, error = %e, "Unable to resolve buddy target");
                return JobStatus::Failure;
            }
        };
        self.state.lock().buddy_target = Some(buddy_target);

        if let Err(e) = self.ctx.buddy.storage_resync_started(&node, buddy_target).await {
            error!(
                target_id = target,
                buddy_target,
                error = %e,
                "Unable to notify buddy about resync"
            );
            return JobStatus::Failure;
        }

        // Step 3: Start the slaves
        let config = &self.ctx.config;
        let gather: Vec<JoinHandle<()>> = (0..config.gather_slaves)
            .map(|id| tokio::spawn(GatherSlave::new(id, self.ctx.clone()).run()))
            .collect();
        let mut sync: Vec<JoinHandle<()>> = (0..config.file_sync_slaves)
            .map(|id| tokio::spawn(FileSyncSlave::new(id, self.ctx.clone()).run()))
            .collect();
        sync.extend(
            (0..config.dir_sync_slaves)
                .map(|id| tokio::spawn(DirSyncSlave::new(id, self.ctx.clone()).run())),
        );

        // Step 4: Everything modified after the threshold is a candidate
        let threshold = compute_threshold(
            self.ctx.targets.last_buddy_comm(target),
            config.safety_threshold,
            self.ctx.targets.has_last_buddy_comm_override(target),
        );
        self.ctx.set_threshold(threshold);
        debug!(
            target_id = target,
            threshold_secs = threshold
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "Resync threshold"
        );

        // Step 5: Walk the top levels and feed the slaves
        let walked = self.walk_top_levels().await;

        // Step 6: Drain the queues in order, then join
        if let Err(e) = &walked {
            error!(target_id = target, error = %e, "Directory walk failed");
            self.ctx.cancel.cancel();
        } else if !self.ctx.is_cancelled() {
            self.ctx.candidates.gather.finish_when_idle();
        }
        join_all(gather).await;

        if !self.ctx.is_cancelled() {
            self.ctx.candidates.files.finish_when_idle();
            self.ctx.candidates.dirs.finish_when_idle();
        }
        join_all(sync).await;

        if walked.is_err() {
            JobStatus::Failure
        } else if self.ctx.is_cancelled() {
            JobStatus::Interrupted
        } else if self.ctx.counters.errors() > 0 || self.ctx.target_was_offline() {
            JobStatus::Errors
        } else {
            JobStatus::Success
        }
    }

    /// Walk local directories down to the configured depth. Deeper
    /// directories are handed to the gather slaves.
    async fn walk_top_levels(&self) -> Result<()> {
        let target = self.ctx.target_id;
        let threshold = self.ctx.threshold();
        let store = &self.ctx.chunk_store;

        let root = store
            .stat(target, "")
            .await?
            .ok_or_else(|| BeegfsError::PathNotExists(format!("mirror root of target {}", target)))?;
        if root.mtime > threshold {
            self.ctx.candidates.add_dir(DirSyncCandidate::new("", target));
        }

        let mut pending = vec![(String::new(), 0usize)];
        while let Some((dir, level)) = pending.pop() {
            if self.ctx.is_cancelled() {
                return Ok(());
            }

            for entry in store.list_dir(target, &dir).await? {
                let path = join_path(&dir, &entry.name);
                let meta = store.stat(target, &path).await?.ok_or_else(|| {
                    BeegfsError::PathNotExists(format!("{} vanished during walk", path))
                })?;

                match entry.kind {
                    EntryKind::Dir if level < self.ctx.config.walk_depth => {
                        JobCounters::inc(&self.ctx.counters.dirs_discovered);
                        if meta.mtime > threshold {
                            self.ctx
                                .candidates
                                .add_dir(DirSyncCandidate::new(path.clone(), target));
                        }
                        pending.push((path, level + 1));
                    }
                    EntryKind::Dir => self.ctx.candidates.gather.push(path),
                    EntryKind::File => {
                        if meta.mtime > threshold {
                            JobCounters::inc(&self.ctx.counters.files_discovered);
                            self.ctx
                                .candidates
                                .add_file(FileSyncCandidate::new(path, target));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn finish(&self, status: JobStatus, started: SystemTime) {
        let target = self.ctx.target_id;

        match status {
            JobStatus::Success => {
                self.inform_buddy(ConsistencyState::Good).await;
                self.ctx.targets.set_last_buddy_comm_override(target, None);
                self.ctx.targets.set_last_buddy_comm(target, started);
                // went offline while the secondary was being informed
                let offline = self.ctx.target_was_offline();
                self.ctx.targets.set_buddy_needs_resync(target, offline);
                if offline {
                    warn!(
                        target_id = target,
                        "Resync successful, but buddy went offline during finalization; \
                         needs another resync"
                    );
                }
            }
            JobStatus::Errors | JobStatus::Interrupted => {
                self.inform_buddy(ConsistencyState::Bad).await;
            }
            JobStatus::Failure | JobStatus::NotStarted | JobStatus::Running => {}
        }

        self.ctx.targets.set_resync_in_progress(target, false);
        {
            let mut state = self.state.lock();
            state.status = status;
            state.ended_at = Some(Utc::now());
        }

        let stats = self.stats();
        metrics::resync_job_finished(
            &status.to_string(),
            stats.dirs_synced,
            stats.files_synced,
            stats.dir_errors + stats.file_errors,
        );

        if status == JobStatus::Success {
            info!(
                target_id = target,
                dirs_synced = stats.dirs_synced,
                files_synced = stats.files_synced,
                "Buddy resync finished"
            );
        } else {
            warn!(
                target_id = target,
                status = %status,
                dirs_synced = stats.dirs_synced,
                files_synced = stats.files_synced,
                dir_errors = stats.dir_errors,
                file_errors = stats.file_errors,
                "Buddy resync did not succeed"
            );
        }
    }

    /// Report the new secondary state through the buddy node
    async fn inform_buddy(&self, state: ConsistencyState) {
        let target = self.ctx.target_id;
        let result = match self.ctx.resolve_buddy(target) {
            Ok((buddy_target, node)) => {
                self.ctx
                    .buddy_request(buddy_target, || {
                        self.ctx
                            .buddy
                            .set_target_consistency_state(&node, buddy_target, state)
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            error!(
                target_id = target,
                state = %state,
                error = %e,
                "Unable to inform buddy about resync result"
            );
        }
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "Resync slave panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(s)
    }

    #[test]
    fn test_threshold_without_last_comm_is_full_resync() {
        assert_eq!(
            compute_threshold(None, Duration::from_secs(600), false),
            UNIX_EPOCH
        );
    }

    #[test]
    fn test_threshold_subtracts_safety_margin() {
        assert_eq!(
            compute_threshold(Some(secs(10_000)), Duration::from_secs(600), false),
            secs(9_400)
        );
        // margin larger than the time itself
        assert_eq!(
            compute_threshold(Some(secs(100)), Duration::from_secs(600), false),
            UNIX_EPOCH
        );
    }

    #[test]
    fn test_zero_safety_margin() {
        assert_eq!(
            compute_threshold(Some(secs(10_000)), Duration::ZERO, false),
            UNIX_EPOCH
        );
        assert_eq!(
            compute_threshold(Some(secs(10_000)), Duration::ZERO, true),
            secs(10_000)
        );
    }

    #[test]
    fn test_status_finished() {
        assert!(!JobStatus::NotStarted.is_finished());
        assert!(!JobStatus::Running.is_finished());
        assert!(JobStatus::Errors.is_finished());
        assert_eq!(JobStatus::Interrupted.to_string(), "interrupted");
    }
}
