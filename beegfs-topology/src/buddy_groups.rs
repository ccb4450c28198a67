//! Mirror buddy groups
//!
//! A buddy group pairs a primary and a secondary target (or meta node) that
//! hold the same mirrored data. The mapper never promotes a secondary on its
//! own; switchover is an explicit call made by the management daemon.

use beegfs_core::{BeegfsError, BuddyGroupLists, GroupId, Result, TargetId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::target_mapper::TargetMapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MirrorBuddyGroup {
    pub primary: TargetId,
    pub secondary: TargetId,
}

impl MirrorBuddyGroup {
    pub fn new(primary: TargetId, secondary: TargetId) -> Self {
        Self { primary, secondary }
    }

    pub fn contains(&self, target_id: TargetId) -> bool {
        self.primary == target_id || self.secondary == target_id
    }
}

/// Role of a target in its buddy group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuddyState {
    Primary,
    Secondary,
    Unmapped,
}

impl fmt::Display for BuddyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
            Self::Unmapped => write!(f, "unmapped"),
        }
    }
}

#[derive(Debug, Default)]
pub struct MirrorBuddyGroupMapper {
    groups: RwLock<BTreeMap<GroupId, MirrorBuddyGroup>>,
    /// Group containing the local target or node, 0 if none
    local_group_id: AtomicU16,
    target_mapper: RwLock<Option<Arc<TargetMapper>>>,
}

impl MirrorBuddyGroupMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets must be mapped before they can join a group
    pub fn attach_target_mapper(&self, mapper: Arc<TargetMapper>) {
        *self.target_mapper.write() = Some(mapper);
    }

    /// Create or update a group. `group_id` 0 allocates a new ID.
    pub fn map_mirror_buddy_group(
        &self,
        group_id: GroupId,
        primary: TargetId,
        secondary: TargetId,
        allow_update: bool,
    ) -> Result<GroupId> {
        if primary == 0 || secondary == 0 {
            return Err(BeegfsError::Inval(
                "buddy group members must be non-zero".to_string(),
            ));
        }
        if primary == secondary {
            return Err(BeegfsError::Inval(format!(
                "target {} can't be its own buddy",
                primary
            )));
        }

        if let Some(mapper) = self.target_mapper.read().as_ref() {
            for target in [primary, secondary] {
                if !mapper.target_exists(target) {
                    return Err(BeegfsError::UnknownTarget(target));
                }
            }
        }

        let mut groups = self.groups.write();

        if group_id != 0 && groups.contains_key(&group_id) && !allow_update {
            return Err(BeegfsError::Exists(format!("buddy group {}", group_id)));
        }

        if let Some((other, _)) = groups
            .iter()
            .find(|(id, g)| **id != group_id && (g.contains(primary) || g.contains(secondary)))
        {
            return Err(BeegfsError::InUse(format!(
                "target already member of buddy group {}",
                other
            )));
        }

        let group_id = if group_id == 0 {
            generate_id(&groups)
                .ok_or_else(|| BeegfsError::Inval("no free buddy group ID".to_string()))?
        } else {
            group_id
        };

        groups.insert(group_id, MirrorBuddyGroup::new(primary, secondary));
        info!(group_id, primary, secondary, "Mapped buddy group");

        Ok(group_id)
    }

    pub fn unmap_mirror_buddy_group(&self, group_id: GroupId) -> bool {
        let removed = self.groups.write().remove(&group_id).is_some();
        if removed && self.local_group_id.load(Ordering::Acquire) == group_id {
            self.local_group_id.store(0, Ordering::Release);
        }
        removed
    }

    /// Lowest unused ID after the highest in use, else the lowest gap
    pub fn generate_id(&self) -> Option<GroupId> {
        generate_id(&self.groups.read())
    }

    /// Replace all groups with the given parallel lists, matched by index.
    /// `local_id` selects the group reported by [`local_group_id`](Self::local_group_id).
    /// Returns whether anything changed.
    pub fn sync_groups_from_lists(
        &self,
        group_ids: &[GroupId],
        primaries: &[TargetId],
        secondaries: &[TargetId],
        local_id: Option<TargetId>,
    ) -> Result<bool> {
        if group_ids.len() != primaries.len() || group_ids.len() != secondaries.len() {
            return Err(BeegfsError::Inval(format!(
                "buddy group lists differ in length: {} groups, {} primaries, {} secondaries",
                group_ids.len(),
                primaries.len(),
                secondaries.len()
            )));
        }

        let mut synced = BTreeMap::new();
        let mut local_group = 0;

        for ((group_id, primary), secondary) in group_ids.iter().zip(primaries).zip(secondaries) {
            if *group_id == 0 || primary == secondary {
                error!(
                    group_id,
                    primary,
                    secondary,
                    "Skipping invalid buddy group"
                );
                continue;
            }

            let group = MirrorBuddyGroup::new(*primary, *secondary);
            if local_id.is_some_and(|id| group.contains(id)) {
                local_group = *group_id;
            }
            synced.insert(*group_id, group);
        }

        let mut groups = self.groups.write();
        let changed = *groups != synced;
        *groups = synced;
        self.local_group_id.store(local_group, Ordering::Release);

        Ok(changed)
    }

    pub fn get_group(&self, group_id: GroupId) -> Option<MirrorBuddyGroup> {
        self.groups.read().get(&group_id).copied()
    }

    pub fn get_primary_target_id(&self, group_id: GroupId) -> Option<TargetId> {
        self.get_group(group_id).map(|g| g.primary)
    }

    pub fn get_secondary_target_id(&self, group_id: GroupId) -> Option<TargetId> {
        self.get_group(group_id).map(|g| g.secondary)
    }

    /// The other member of `target_id`'s group
    pub fn get_buddy_target_id(&self, target_id: TargetId) -> Option<TargetId> {
        self.groups.read().values().find_map(|g| {
            if g.primary == target_id {
                Some(g.secondary)
            } else if g.secondary == target_id {
                Some(g.primary)
            } else {
                None
            }
        })
    }

    /// Group of `target_id` and whether it is the primary there
    pub fn get_buddy_group_id(&self, target_id: TargetId) -> Option<(GroupId, bool)> {
        self.groups
            .read()
            .iter()
            .find(|(_, g)| g.contains(target_id))
            .map(|(id, g)| (*id, g.primary == target_id))
    }

    pub fn get_buddy_state(&self, target_id: TargetId) -> BuddyState {
        match self.get_buddy_group_id(target_id) {
            Some((_, true)) => BuddyState::Primary,
            Some((_, false)) => BuddyState::Secondary,
            None => BuddyState::Unmapped,
        }
    }

    /// Swap primary and secondary of a group
    pub fn switch_to_secondary(&self, group_id: GroupId) -> Result<MirrorBuddyGroup> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(&group_id)
            .ok_or(BeegfsError::UnknownBuddyGroup(group_id))?;

        std::mem::swap(&mut group.primary, &mut group.secondary);
        info!(
            group_id,
            new_primary = group.primary,
            new_secondary = group.secondary,
            "Buddy group switched over"
        );

        Ok(*group)
    }

    pub fn groups(&self) -> BTreeMap<GroupId, MirrorBuddyGroup> {
        self.groups.read().clone()
    }

    pub fn mapping_as_lists(&self) -> BuddyGroupLists {
        let groups = self.groups.read();
        let mut lists = BuddyGroupLists::default();
        for (id, group) in groups.iter() {
            lists.group_ids.push(*id);
            lists.primary_targets.push(group.primary);
            lists.secondary_targets.push(group.secondary);
        }
        lists
    }

    pub fn local_group_id(&self) -> Option<GroupId> {
        match self.local_group_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}

fn generate_id(groups: &BTreeMap<GroupId, MirrorBuddyGroup>) -> Option<GroupId> {
    let max = match groups.keys().next_back() {
        None => return Some(1),
        Some(max) => *max,
    };

    if max < GroupId::MAX {
        return Some(max + 1);
    }

    (1..GroupId::MAX).find(|id| !groups.contains_key(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beegfs_core::NumNodeId;

    #[test]
    fn test_buddy_symmetry() {
        let mapper = MirrorBuddyGroupMapper::new();
        mapper.map_mirror_buddy_group(3, 4, 7, false).unwrap();

        assert_eq!(mapper.get_buddy_target_id(4), Some(7));
        assert_eq!(mapper.get_buddy_target_id(7), Some(4));
        assert_eq!(mapper.get_buddy_target_id(5), None);
        assert_eq!(mapper.get_buddy_state(4), BuddyState::Primary);
        assert_eq!(mapper.get_buddy_state(7), BuddyState::Secondary);
        assert_eq!(mapper.get_buddy_state(5), BuddyState::Unmapped);
    }

    #[test]
    fn test_map_validation() {
        let mapper = MirrorBuddyGroupMapper::new();
        assert!(matches!(
            mapper.map_mirror_buddy_group(1, 2, 2, false),
            Err(BeegfsError::Inval(_))
        ));

        mapper.map_mirror_buddy_group(1, 1, 2, false).unwrap();
        assert!(matches!(
            mapper.map_mirror_buddy_group(1, 3, 4, false),
            Err(BeegfsError::Exists(_))
        ));
        assert!(matches!(
            mapper.map_mirror_buddy_group(2, 2, 3, false),
            Err(BeegfsError::InUse(_))
        ));
        assert_eq!(mapper.map_mirror_buddy_group(1, 2, 1, true).unwrap(), 1);
    }

    #[test]
    fn test_unknown_target_rejected_with_mapper() {
        let targets = Arc::new(TargetMapper::new());
        targets.map_target(1, NumNodeId(1));

        let mapper = MirrorBuddyGroupMapper::new();
        mapper.attach_target_mapper(targets);

        assert_eq!(
            mapper.map_mirror_buddy_group(0, 1, 2, false),
            Err(BeegfsError::UnknownTarget(2))
        );
    }

    #[test]
    fn test_generate_id() {
        let mapper = MirrorBuddyGroupMapper::new();
        assert_eq!(mapper.generate_id(), Some(1));
        assert_eq!(mapper.map_mirror_buddy_group(0, 1, 2, false).unwrap(), 1);
        mapper.map_mirror_buddy_group(5, 3, 4, false).unwrap();
        assert_eq!(mapper.generate_id(), Some(6));

        mapper.map_mirror_buddy_group(GroupId::MAX, 8, 9, false).unwrap();
        assert_eq!(mapper.generate_id(), Some(2));
    }

    #[test]
    fn test_sync_from_lists() {
        let mapper = MirrorBuddyGroupMapper::new();
        mapper.map_mirror_buddy_group(9, 10, 11, false).unwrap();

        let changed = mapper
            .sync_groups_from_lists(&[1, 2, 0, 3], &[1, 3, 5, 6], &[2, 4, 6, 6], Some(4))
            .unwrap();
        assert!(changed);
        assert_eq!(mapper.len(), 2);
        assert_eq!(mapper.get_group(9), None);
        assert_eq!(mapper.local_group_id(), Some(2));

        let changed = mapper
            .sync_groups_from_lists(&[1, 2], &[1, 3], &[2, 4], None)
            .unwrap();
        assert!(!changed);
        assert_eq!(mapper.local_group_id(), None);

        assert!(matches!(
            mapper.sync_groups_from_lists(&[1], &[1, 2], &[3], None),
            Err(BeegfsError::Inval(_))
        ));
    }

    #[test]
    fn test_switch_to_secondary() {
        let mapper = MirrorBuddyGroupMapper::new();
        mapper.map_mirror_buddy_group(1, 1, 2, false).unwrap();

        let group = mapper.switch_to_secondary(1).unwrap();
        assert_eq!(group, MirrorBuddyGroup::new(2, 1));
        assert_eq!(mapper.get_primary_target_id(1), Some(2));
        assert_eq!(
            mapper.switch_to_secondary(4),
            Err(BeegfsError::UnknownBuddyGroup(4))
        );
    }

    #[test]
    fn test_mapping_as_lists() {
        let mapper = MirrorBuddyGroupMapper::new();
        mapper.map_mirror_buddy_group(2, 3, 4, false).unwrap();
        mapper.map_mirror_buddy_group(1, 1, 2, false).unwrap();

        let lists = mapper.mapping_as_lists();
        assert_eq!(lists.group_ids, vec![1, 2]);
        assert_eq!(lists.primary_targets, vec![1, 3]);
        assert_eq!(lists.secondary_targets, vec![2, 4]);
    }
}
