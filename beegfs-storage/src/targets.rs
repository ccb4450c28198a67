//! Local storage targets of this daemon
//!
//! Besides the target directories this tracks per-target mirror bookkeeping:
//! when the buddy was last reachable, whether it needs a resync, and whether
//! a resync is running.

use beegfs_core::{BeegfsError, ConsistencyState, Result, TargetId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::config::TargetSettings;

/// Subdirectory of a target holding buddy mirrored chunks
pub const BUDDY_MIRROR_SUBDIR: &str = "buddymir";

/// File in a target directory persisting the last buddy communication time
const LAST_BUDDY_COMM_FILE: &str = "lastbuddycomm";

#[derive(Debug, Clone)]
struct TargetEntry {
    path: PathBuf,
    consistency: ConsistencyState,
    last_buddy_comm: Option<SystemTime>,
    last_buddy_comm_override: Option<SystemTime>,
    buddy_needs_resync: bool,
    resync_in_progress: bool,
}

#[derive(Debug, Default)]
pub struct StorageTargets {
    targets: RwLock<BTreeMap<TargetId, TargetEntry>>,
}

impl StorageTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(targets: &[TargetSettings]) -> Self {
        let store = Self::new();
        for target in targets {
            store.add_target(target.id, &target.path);
        }
        store
    }

    /// Add a target directory; a persisted buddy communication time is loaded
    pub fn add_target(&self, target_id: TargetId, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let last_buddy_comm = load_last_buddy_comm(&path);

        self.targets.write().insert(
            target_id,
            TargetEntry {
                path,
                consistency: ConsistencyState::Good,
                last_buddy_comm,
                last_buddy_comm_override: None,
                buddy_needs_resync: false,
                resync_in_progress: false,
            },
        );
    }

    pub fn target_ids(&self) -> Vec<TargetId> {
        self.targets.read().keys().copied().collect()
    }

    pub fn contains(&self, target_id: TargetId) -> bool {
        self.targets.read().contains_key(&target_id)
    }

    pub fn path(&self, target_id: TargetId) -> Option<PathBuf> {
        self.targets.read().get(&target_id).map(|t| t.path.clone())
    }

    /// Root of the buddy mirrored chunks of a target
    pub fn mirror_path(&self, target_id: TargetId) -> Result<PathBuf> {
        self.path(target_id)
            .map(|p| p.join(BUDDY_MIRROR_SUBDIR))
            .ok_or(BeegfsError::UnknownTarget(target_id))
    }

    pub fn consistency(&self, target_id: TargetId) -> Option<ConsistencyState> {
        self.targets.read().get(&target_id).map(|t| t.consistency)
    }

    pub fn set_consistency(&self, target_id: TargetId, state: ConsistencyState) -> bool {
        match self.targets.write().get_mut(&target_id) {
            Some(entry) => {
                entry.consistency = state;
                true
            }
            None => false,
        }
    }

    /// Override if set, else the recorded time
    pub fn last_buddy_comm(&self, target_id: TargetId) -> Option<SystemTime> {
        let targets = self.targets.read();
        let entry = targets.get(&target_id)?;
        entry.last_buddy_comm_override.or(entry.last_buddy_comm)
    }

    pub fn has_last_buddy_comm_override(&self, target_id: TargetId) -> bool {
        self.targets
            .read()
            .get(&target_id)
            .is_some_and(|t| t.last_buddy_comm_override.is_some())
    }

    /// Record a successful exchange with the buddy and persist it
    pub fn set_last_buddy_comm(&self, target_id: TargetId, at: SystemTime) {
        let path = {
            let mut targets = self.targets.write();
            let Some(entry) = targets.get_mut(&target_id) else {
                return;
            };
            entry.last_buddy_comm = Some(at);
            entry.path.clone()
        };

        if let Err(e) = store_last_buddy_comm(&path, at) {
            warn!(target_id, error = %e, "Failed to persist last buddy communication time");
        }
    }

    /// Force the next resync to start from `at` instead of the recorded time
    pub fn set_last_buddy_comm_override(&self, target_id: TargetId, at: Option<SystemTime>) {
        if let Some(entry) = self.targets.write().get_mut(&target_id) {
            entry.last_buddy_comm_override = at;
        }
    }

    pub fn buddy_needs_resync(&self, target_id: TargetId) -> bool {
        self.targets
            .read()
            .get(&target_id)
            .is_some_and(|t| t.buddy_needs_resync)
    }

    pub fn set_buddy_needs_resync(&self, target_id: TargetId, needs_resync: bool) {
        if let Some(entry) = self.targets.write().get_mut(&target_id) {
            if entry.buddy_needs_resync != needs_resync {
                debug!(target_id, needs_resync, "Buddy resync flag changed");
            }
            entry.buddy_needs_resync = needs_resync;
        }
    }

    pub fn is_resync_in_progress(&self, target_id: TargetId) -> bool {
        self.targets
            .read()
            .get(&target_id)
            .is_some_and(|t| t.resync_in_progress)
    }

    /// Returns the previous value
    pub fn set_resync_in_progress(&self, target_id: TargetId, in_progress: bool) -> bool {
        match self.targets.write().get_mut(&target_id) {
            Some(entry) => std::mem::replace(&mut entry.resync_in_progress, in_progress),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }
}

fn load_last_buddy_comm(target_path: &Path) -> Option<SystemTime> {
    let content = std::fs::read_to_string(target_path.join(LAST_BUDDY_COMM_FILE)).ok()?;
    let secs = content.trim().parse::<u64>().ok()?;
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}

fn store_last_buddy_comm(target_path: &Path, at: SystemTime) -> std::io::Result<()> {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    std::fs::write(target_path.join(LAST_BUDDY_COMM_FILE), secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_buddy_comm_override() {
        let dir = tempfile::tempdir().unwrap();
        let targets = StorageTargets::new();
        targets.add_target(4, dir.path());
        assert_eq!(targets.last_buddy_comm(4), None);

        let recorded = UNIX_EPOCH + Duration::from_secs(1_000);
        targets.set_last_buddy_comm(4, recorded);
        assert_eq!(targets.last_buddy_comm(4), Some(recorded));

        let forced = UNIX_EPOCH + Duration::from_secs(10);
        targets.set_last_buddy_comm_override(4, Some(forced));
        assert!(targets.has_last_buddy_comm_override(4));
        assert_eq!(targets.last_buddy_comm(4), Some(forced));

        targets.set_last_buddy_comm_override(4, None);
        assert_eq!(targets.last_buddy_comm(4), Some(recorded));
    }

    #[test]
    fn test_last_buddy_comm_persists() {
        let dir = tempfile::tempdir().unwrap();
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let targets = StorageTargets::new();
        targets.add_target(4, dir.path());
        targets.set_last_buddy_comm(4, at);

        let reloaded = StorageTargets::new();
        reloaded.add_target(4, dir.path());
        assert_eq!(reloaded.last_buddy_comm(4), Some(at));
    }

    #[test]
    fn test_flags() {
        let dir = tempfile::tempdir().unwrap();
        let targets = StorageTargets::new();
        targets.add_target(4, dir.path());

        assert!(!targets.set_resync_in_progress(4, true));
        assert!(targets.is_resync_in_progress(4));
        assert!(targets.set_resync_in_progress(4, false));

        targets.set_buddy_needs_resync(4, true);
        assert!(targets.buddy_needs_resync(4));
        assert!(!targets.buddy_needs_resync(5));

        assert_eq!(
            targets.mirror_path(4).unwrap(),
            dir.path().join(BUDDY_MIRROR_SUBDIR)
        );
        assert_eq!(targets.mirror_path(5), Err(BeegfsError::UnknownTarget(5)));
    }
}
