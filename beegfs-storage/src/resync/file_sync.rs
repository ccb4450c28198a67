//! File sync slave: copies changed chunks to the secondary block by block

use beegfs_core::{BeegfsError, Result};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::candidates::FileSyncCandidate;
use super::{JobCounters, ResyncContext};

pub struct FileSyncSlave {
    id: usize,
    ctx: Arc<ResyncContext>,
}

impl FileSyncSlave {
    pub fn new(id: usize, ctx: Arc<ResyncContext>) -> Self {
        Self { id, ctx }
    }

    pub async fn run(self) {
        debug!(slave = self.id, target_id = self.ctx.target_id, "File sync slave started");

        while let Some(candidate) = self.ctx.candidates.files.fetch(&self.ctx.cancel).await {
            match self.sync_file(&candidate).await {
                Ok(()) => JobCounters::inc(&self.ctx.counters.files_synced),
                Err(BeegfsError::Interrupted) => {}
                Err(e) => {
                    error!(
                        target_id = candidate.target_id,
                        path = %candidate.relative_path,
                        error = %e,
                        "Failed to sync chunk"
                    );
                    JobCounters::inc(&self.ctx.counters.file_errors);
                }
            }
            self.ctx.candidates.files.done();
        }

        debug!(slave = self.id, target_id = self.ctx.target_id, "File sync slave stopped");
    }

    async fn sync_file(&self, candidate: &FileSyncCandidate) -> Result<()> {
        if candidate.target_id == 0 {
            return Ok(());
        }

        let local_target = candidate.target_id;
        let path = candidate.relative_path.as_str();
        let (buddy_target, node) = self.ctx.resolve_buddy(local_target)?;

        let _lock = self.ctx.locks.lock_chunk(local_target, path).await;

        let Some(meta) = self.ctx.chunk_store.stat(local_target, path).await? else {
            // removed since it was gathered
            let failed = self
                .ctx
                .buddy_request(buddy_target, || {
                    self.ctx
                        .buddy
                        .rm_chunk_paths(&node, buddy_target, vec![path.to_string()])
                })
                .await?;
            for path in failed {
                warn!(buddy_target, path = %path, "Failed to remove chunk on secondary");
            }
            return Ok(());
        };

        if meta.is_dir {
            return Ok(());
        }

        let block = self.ctx.config.file_block_size;
        let mut offset = 0u64;

        loop {
            if self.ctx.is_cancelled() {
                return Err(BeegfsError::Interrupted);
            }

            let data = self
                .ctx
                .chunk_store
                .read_chunk(local_target, path, offset, block)
                .await?;
            let len = data.len() as u64;
            let last = data.len() < block || offset + len >= meta.size;

            self.ctx
                .buddy_request(buddy_target, || {
                    self.ctx.buddy.resync_local_file(
                        &node,
                        buddy_target,
                        path,
                        offset,
                        data.clone(),
                        last,
                    )
                })
                .await?;

            offset += len;
            if last {
                break;
            }
        }

        debug!(target_id = local_target, path, bytes = offset, "Chunk synced");
        Ok(())
    }
}
