//! Target to node mapping

use beegfs_core::{NumNodeId, TargetId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::target_states::TargetStateStore;

/// Which node owns which storage target
#[derive(Debug, Default)]
pub struct TargetMapper {
    targets: RwLock<BTreeMap<TargetId, NumNodeId>>,
    states: RwLock<Option<Arc<TargetStateStore>>>,
}

impl TargetMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newly mapped targets get an initial state in `store`
    pub fn attach_state_store(&self, store: Arc<TargetStateStore>) {
        *self.states.write() = Some(store);
    }

    /// Map one target. Returns true if the target was not mapped before.
    pub fn map_target(&self, target_id: TargetId, node_id: NumNodeId) -> bool {
        let is_new = self.targets.write().insert(target_id, node_id).is_none();

        if let Some(states) = self.states.read().as_ref() {
            states.add_if_not_exists(target_id);
        }

        debug!(target_id, node_id = %node_id, is_new, "Mapped target");
        is_new
    }

    pub fn unmap_target(&self, target_id: TargetId) -> bool {
        let removed = self.targets.write().remove(&target_id).is_some();
        if removed {
            debug!(target_id, "Unmapped target");
        }
        removed
    }

    /// Unmap every target of a node, returning the unmapped targets
    pub fn unmap_by_node_id(&self, node_id: NumNodeId) -> Vec<TargetId> {
        let mut targets = self.targets.write();
        let owned: Vec<TargetId> = targets
            .iter()
            .filter(|(_, owner)| **owner == node_id)
            .map(|(target, _)| *target)
            .collect();

        for target in &owned {
            targets.remove(target);
        }

        owned
    }

    /// Replace the whole table. Returns whether the mapping changed.
    pub fn sync_targets(&self, mapping: BTreeMap<TargetId, NumNodeId>) -> bool {
        let new_targets: Vec<TargetId> = {
            let mut targets = self.targets.write();
            if *targets == mapping {
                return false;
            }

            let new_targets = mapping
                .keys()
                .filter(|t| !targets.contains_key(t))
                .copied()
                .collect();
            *targets = mapping;
            new_targets
        };

        if let Some(states) = self.states.read().as_ref() {
            for target in new_targets {
                states.add_if_not_exists(target);
            }
        }

        true
    }

    pub fn get_node_id(&self, target_id: TargetId) -> Option<NumNodeId> {
        self.targets.read().get(&target_id).copied()
    }

    pub fn target_exists(&self, target_id: TargetId) -> bool {
        self.targets.read().contains_key(&target_id)
    }

    pub fn targets_of_node(&self, node_id: NumNodeId) -> Vec<TargetId> {
        self.targets
            .read()
            .iter()
            .filter(|(_, owner)| **owner == node_id)
            .map(|(target, _)| *target)
            .collect()
    }

    pub fn mapping(&self) -> BTreeMap<TargetId, NumNodeId> {
        self.targets.read().clone()
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }
}
