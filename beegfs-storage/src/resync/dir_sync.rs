//! Directory sync slave
//!
//! Lists a directory on the secondary in batches and removes every chunk the
//! primary does not have. Secondary-only subdirectories are descended into;
//! once all of them are empty a finalize pass removes them.

use beegfs_core::{BeegfsError, ChunkDirPage, EntryKind, Result, TargetId};
use beegfs_topology::Node;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::candidates::{DirSyncCandidate, SubdirBarrier};
use super::{JobCounters, ResyncContext};
use crate::chunk_locks::ChunkLockGuard;
use crate::chunk_store::join_path;

pub struct DirSyncSlave {
    id: usize,
    ctx: Arc<ResyncContext>,
}

impl DirSyncSlave {
    pub fn new(id: usize, ctx: Arc<ResyncContext>) -> Self {
        Self { id, ctx }
    }

    /// Process dir candidates until the job finishes or is aborted
    pub async fn run(self) {
        debug!(slave = self.id, target_id = self.ctx.target_id, "Dir sync slave started");

        while let Some(candidate) = self.ctx.candidates.dirs.fetch(&self.ctx.cancel).await {
            self.process(candidate).await;
            self.ctx.candidates.dirs.done();
        }

        debug!(slave = self.id, target_id = self.ctx.target_id, "Dir sync slave stopped");
    }

    async fn process(&self, candidate: DirSyncCandidate) {
        if candidate.target_id == 0 {
            return;
        }

        let result = if candidate.finalize {
            self.finalize_dir(&candidate).await
        } else {
            self.sync_dir(&candidate).await
        };

        match result {
            Ok(()) => {}
            Err(BeegfsError::Interrupted) => {
                debug!(path = %candidate.relative_path, "Dir sync interrupted");
            }
            Err(e) => {
                error!(
                    target_id = candidate.target_id,
                    path = %candidate.relative_path,
                    error = %e,
                    "Failed to sync directory"
                );
                JobCounters::inc(&self.ctx.counters.dir_errors);
            }
        }
    }

    async fn sync_dir(&self, candidate: &DirSyncCandidate) -> Result<()> {
        let local_target = candidate.target_id;
        let dir = candidate.relative_path.as_str();
        let (buddy_target, node) = self.ctx.resolve_buddy(local_target)?;
        let batch = self.ctx.config.list_batch_size;

        let mut offset = 0;
        let mut missing_dirs = Vec::new();

        loop {
            if self.ctx.is_cancelled() {
                return Err(BeegfsError::Interrupted);
            }

            let page = self.list_buddy_dir(&node, buddy_target, dir, offset).await?;
            let fetched = page.names.len();
            offset = page.new_offset;

            let mut to_remove = Vec::new();
            let mut guards: Vec<ChunkLockGuard> = Vec::new();

            for (name, kind) in page.names.into_iter().zip(page.kinds) {
                let path = join_path(dir, &name);
                match kind {
                    EntryKind::Dir => {
                        let local = self.ctx.chunk_store.stat(local_target, &path).await?;
                        if !local.is_some_and(|m| m.is_dir) {
                            missing_dirs.push(path);
                        }
                    }
                    EntryKind::File => {
                        // stays locked until the secondary copy is gone
                        let guard = self.ctx.locks.lock_chunk(local_target, &path).await;
                        let local = self.ctx.chunk_store.stat(local_target, &path).await?;
                        if local.is_none() {
                            to_remove.push(path);
                            guards.push(guard);
                        }
                    }
                }
            }

            if !to_remove.is_empty() {
                let removed = self.remove_buddy_paths(&node, buddy_target, to_remove).await;
                drop(guards);
                // removed entries no longer occupy positions in the listing
                offset -= removed? as i64;
            }

            if fetched < batch as usize {
                break;
            }
        }

        JobCounters::inc(&self.ctx.counters.dirs_synced);

        if missing_dirs.is_empty() {
            self.complete(candidate);
            return Ok(());
        }

        let barrier = Arc::new(SubdirBarrier::new(
            missing_dirs.len(),
            candidate.to_finalize(),
        ));
        for path in missing_dirs {
            JobCounters::inc(&self.ctx.counters.additional_dirs_matched);
            self.ctx.candidates.add_dir(DirSyncCandidate::child(
                path,
                local_target,
                barrier.clone(),
            ));
        }

        Ok(())
    }

    /// Remove the secondary-only subdirectories, which are empty by now
    async fn finalize_dir(&self, candidate: &DirSyncCandidate) -> Result<()> {
        let local_target = candidate.target_id;
        let dir = candidate.relative_path.as_str();
        let (buddy_target, node) = self.ctx.resolve_buddy(local_target)?;
        let batch = self.ctx.config.list_batch_size;

        let mut offset = 0;
        let mut to_remove = Vec::new();

        loop {
            if self.ctx.is_cancelled() {
                return Err(BeegfsError::Interrupted);
            }

            let page = self.list_buddy_dir(&node, buddy_target, dir, offset).await?;
            let fetched = page.names.len();
            offset = page.new_offset;

            for (name, kind) in page.names.into_iter().zip(page.kinds) {
                if kind != EntryKind::Dir {
                    continue;
                }
                let path = join_path(dir, &name);
                if self.ctx.chunk_store.stat(local_target, &path).await?.is_none() {
                    to_remove.push(path);
                }
            }

            if fetched < batch as usize {
                break;
            }
        }

        if !to_remove.is_empty() {
            self.remove_buddy_paths(&node, buddy_target, to_remove).await?;
        }

        self.complete(candidate);
        Ok(())
    }

    /// Report a finished directory to the barrier of its parent
    fn complete(&self, candidate: &DirSyncCandidate) {
        if let Some(barrier) = &candidate.parent {
            if barrier.notify_subdir_synced() {
                self.ctx
                    .candidates
                    .add_dir(barrier.parent_candidate().clone());
            }
        }
    }

    async fn list_buddy_dir(
        &self,
        node: &Node,
        buddy_target: TargetId,
        dir: &str,
        offset: i64,
    ) -> Result<ChunkDirPage> {
        let batch = self.ctx.config.list_batch_size;
        let result = self
            .ctx
            .buddy_request(buddy_target, || {
                self.ctx
                    .buddy
                    .list_chunk_dir_incremental(node, buddy_target, dir, offset, batch)
            })
            .await;

        match result {
            // nothing to clean up on the secondary
            Err(BeegfsError::PathNotExists(_)) => Ok(ChunkDirPage::default()),
            other => other,
        }
    }

    /// Failed paths are logged and counted but do not fail the directory.
    /// Returns how many paths are gone from the secondary.
    async fn remove_buddy_paths(
        &self,
        node: &Node,
        buddy_target: TargetId,
        paths: Vec<String>,
    ) -> Result<usize> {
        let requested = paths.len();
        let failed = self
            .ctx
            .buddy_request(buddy_target, || {
                self.ctx.buddy.rm_chunk_paths(node, buddy_target, paths.clone())
            })
            .await?;

        let removed = requested.saturating_sub(failed.len());
        for path in failed {
            warn!(buddy_target, path = %path, "Failed to remove path on secondary");
            JobCounters::inc(&self.ctx.counters.dir_errors);
        }

        Ok(removed)
    }
}
