//! Gather slave: walks directory trees below the job's walk depth and turns
//! everything modified since the threshold into sync candidates

use beegfs_core::{EntryKind, Result};
use std::sync::Arc;
use tracing::{debug, error};

use super::candidates::{DirSyncCandidate, FileSyncCandidate};
use super::{JobCounters, ResyncContext};
use crate::chunk_store::join_path;

pub struct GatherSlave {
    id: usize,
    ctx: Arc<ResyncContext>,
}

impl GatherSlave {
    pub fn new(id: usize, ctx: Arc<ResyncContext>) -> Self {
        Self { id, ctx }
    }

    pub async fn run(self) {
        debug!(slave = self.id, target_id = self.ctx.target_id, "Gather slave started");

        while let Some(dir) = self.ctx.candidates.gather.fetch(&self.ctx.cancel).await {
            if let Err(e) = self.gather(&dir).await {
                error!(
                    target_id = self.ctx.target_id,
                    path = %dir,
                    error = %e,
                    "Failed to walk directory"
                );
                JobCounters::inc(&self.ctx.counters.dir_errors);
            }
            self.ctx.candidates.gather.done();
        }

        debug!(slave = self.id, target_id = self.ctx.target_id, "Gather slave stopped");
    }

    async fn gather(&self, root: &str) -> Result<()> {
        let target = self.ctx.target_id;
        let threshold = self.ctx.threshold();
        let mut pending = vec![root.to_string()];

        while let Some(dir) = pending.pop() {
            if self.ctx.is_cancelled() {
                return Ok(());
            }

            let Some(meta) = self.ctx.chunk_store.stat(target, &dir).await? else {
                continue;
            };
            if meta.mtime > threshold {
                JobCounters::inc(&self.ctx.counters.dirs_discovered);
                self.ctx.candidates.add_dir(DirSyncCandidate::new(dir.clone(), target));
            }

            for entry in self.ctx.chunk_store.list_dir(target, &dir).await? {
                let path = join_path(&dir, &entry.name);
                match entry.kind {
                    // unchanged directories may still hold changed chunks
                    EntryKind::Dir => pending.push(path),
                    EntryKind::File => {
                        let newer = self
                            .ctx
                            .chunk_store
                            .stat(target, &path)
                            .await?
                            .is_some_and(|m| m.mtime > threshold);
                        if newer {
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
}
