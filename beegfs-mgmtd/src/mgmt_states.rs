//! Authoritative target state handling
//!
//! The management daemon owns target states. Besides storing them it decides
//! when a buddy group switches over: a primary that went offline, or that
//! needs a resync itself, hands over to a secondary that is online and good.

use beegfs_core::{
    BeegfsError, CombinedTargetState, ConsistencyState, GroupId, ReachabilityState, Result,
    TargetId,
};
use beegfs_topology::{MirrorBuddyGroupMapper, TargetStateStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::metrics;

/// Outcome of one auto-offline pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoOfflineReport {
    pub newly_offline: Vec<TargetId>,
    pub switched_groups: Vec<GroupId>,
}

impl AutoOfflineReport {
    pub fn is_modified(&self) -> bool {
        !self.newly_offline.is_empty() || !self.switched_groups.is_empty()
    }
}

pub struct MgmtTargetStates {
    states: Arc<TargetStateStore>,
    buddy_groups: Arc<MirrorBuddyGroupMapper>,
    /// Serialises read-check-write sequences across targets
    change_lock: Mutex<()>,
}

impl MgmtTargetStates {
    pub fn new(states: Arc<TargetStateStore>, buddy_groups: Arc<MirrorBuddyGroupMapper>) -> Self {
        Self {
            states,
            buddy_groups,
            change_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<TargetStateStore> {
        &self.states
    }

    /// Apply timeouts; returns whether anything changed
    pub fn auto_offline(&self, now: Instant) -> bool {
        self.run_auto_offline(now).is_modified()
    }

    pub fn run_auto_offline(&self, now: Instant) -> AutoOfflineReport {
        let _guard = self.change_lock.lock();
        let mut report = AutoOfflineReport {
            newly_offline: self.states.auto_offline_targets(now),
            switched_groups: Vec::new(),
        };

        for target in &report.newly_offline {
            let Some((group_id, true)) = self.buddy_groups.get_buddy_group_id(*target) else {
                continue;
            };

            if self.switchover_if_secondary_good(group_id) {
                report.switched_groups.push(group_id);
            } else {
                error!(
                    group_id,
                    primary = *target,
                    "Primary target is offline and its secondary can't take over"
                );
            }
        }

        if !report.newly_offline.is_empty() {
            metrics::record_targets_offline(report.newly_offline.len());
        }

        report
    }

    /// Switch primaries that need a resync over to a good secondary.
    /// Returns whether any group switched.
    pub fn resolve_primary_resync(&self) -> bool {
        let _guard = self.change_lock.lock();
        let mut switched = false;

        for (group_id, group) in self.buddy_groups.groups() {
            let primary_needs_resync = self
                .states
                .get_state(group.primary)
                .is_some_and(|s| s.consistency == ConsistencyState::NeedsResync);

            if primary_needs_resync && self.switchover_if_secondary_good(group_id) {
                info!(
                    group_id,
                    old_primary = group.primary,
                    "Switched over from primary that needs a resync"
                );
                switched = true;
            }
        }

        switched
    }

    /// Promote the secondary if it is online and good. The demoted primary
    /// needs a resync from its new primary afterwards.
    fn switchover_if_secondary_good(&self, group_id: GroupId) -> bool {
        let Some(group) = self.buddy_groups.get_group(group_id) else {
            return false;
        };

        let secondary_good = self
            .states
            .get_state(group.secondary)
            .is_some_and(|s| s.is_online_and_good());
        if !secondary_good {
            return false;
        }

        match self.buddy_groups.switch_to_secondary(group_id) {
            Ok(_) => {
                warn!(
                    group_id,
                    new_primary = group.secondary,
                    new_secondary = group.primary,
                    "Buddy group switchover"
                );
                self.states
                    .set_consistency(group.primary, ConsistencyState::NeedsResync);
                metrics::record_switchover();
                true
            }
            Err(e) => {
                error!(group_id, error = %e, "Switchover failed");
                false
            }
        }
    }

    /// Apply `new` to all targets, but only if all are currently in `old`
    pub fn change_consistency_states(
        &self,
        target_ids: &[TargetId],
        old: &[ConsistencyState],
        new: &[ConsistencyState],
    ) -> Result<()> {
        if target_ids.len() != old.len() || target_ids.len() != new.len() {
            return Err(BeegfsError::Inval(
                "consistency change lists differ in length".to_string(),
            ));
        }

        let _guard = self.change_lock.lock();

        for (target, expected) in target_ids.iter().zip(old) {
            let current = self.states.get_state(*target).map(|s| s.consistency);
            if current != Some(*expected) {
                return Err(BeegfsError::Again);
            }
        }

        for (target, state) in target_ids.iter().zip(new) {
            self.states.set_consistency(*target, *state);
        }

        Ok(())
    }

    /// Set consistency states unconditionally; `set_online` also counts as
    /// a report from each target
    pub fn set_consistency_states(
        &self,
        target_ids: &[TargetId],
        states: &[ConsistencyState],
        set_online: bool,
    ) -> Result<()> {
        if target_ids.len() != states.len() {
            return Err(BeegfsError::Inval(
                "consistency state lists differ in length".to_string(),
            ));
        }

        let _guard = self.change_lock.lock();

        for (target, state) in target_ids.iter().zip(states) {
            if self.states.set_consistency(*target, *state) {
                info!(target_id = *target, consistency = %state, "Target consistency changed");
            }
            if set_online {
                self.states.report_online(*target);
            }
        }

        Ok(())
    }

    pub fn get_state(&self, target_id: TargetId) -> Option<CombinedTargetState> {
        self.states.get_state(target_id)
    }

    pub fn reachability(&self, target_id: TargetId) -> Option<ReachabilityState> {
        self.get_state(target_id).map(|s| s.reachability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beegfs_topology::TargetStateConfig;
    use std::time::Duration;
    use ConsistencyState::*;
    use ReachabilityState::*;

    fn setup() -> MgmtTargetStates {
        let states = Arc::new(TargetStateStore::new(TargetStateConfig::from_secs(60)).unwrap());
        let groups = Arc::new(MirrorBuddyGroupMapper::new());
        groups.map_mirror_buddy_group(1, 10, 20, false).unwrap();
        MgmtTargetStates::new(states, groups)
    }

    #[test]
    fn test_no_switchover_when_both_offline() {
        let mgmt = setup();
        mgmt.store().set_state(10, CombinedTargetState::new(Online, Good));
        mgmt.store().set_state(20, CombinedTargetState::new(Online, Good));

        let report = mgmt.run_auto_offline(Instant::now() + Duration::from_secs(61));

        assert_eq!(report.newly_offline, vec![10, 20]);
        assert!(report.switched_groups.is_empty());
        assert_eq!(mgmt.buddy_groups.get_primary_target_id(1), Some(10));
    }

    #[test]
    fn test_switchover_when_secondary_online() {
        let mgmt = setup();
        let start = Instant::now();
        mgmt.store().set_state(10, CombinedTargetState::new(Online, Good));
        mgmt.store().set_state(20, CombinedTargetState::new(POffline, Good));
        mgmt.store().report_online_at(20, start + Duration::from_secs(40));

        assert!(mgmt.auto_offline(start + Duration::from_secs(61)));

        assert_eq!(mgmt.reachability(10), Some(Offline));
        assert_eq!(mgmt.reachability(20), Some(Online));
        assert_eq!(mgmt.buddy_groups.get_primary_target_id(1), Some(20));
        assert_eq!(mgmt.get_state(10).unwrap().consistency, NeedsResync);
    }

    #[test]
    fn test_no_switchover_to_bad_secondary() {
        let mgmt = setup();
        mgmt.store().set_state(10, CombinedTargetState::new(Online, NeedsResync));
        mgmt.store().set_state(20, CombinedTargetState::new(Online, Bad));

        assert!(!mgmt.resolve_primary_resync());
        assert_eq!(mgmt.buddy_groups.get_primary_target_id(1), Some(10));
    }

    #[test]
    fn test_resolve_primary_resync() {
        let mgmt = setup();
        mgmt.store().set_state(10, CombinedTargetState::new(Online, NeedsResync));
        mgmt.store().set_state(20, CombinedTargetState::new(Online, Good));

        assert!(mgmt.resolve_primary_resync());
        assert_eq!(mgmt.buddy_groups.get_primary_target_id(1), Some(20));
        assert!(!mgmt.resolve_primary_resync());
    }

    #[test]
    fn test_change_consistency_is_optimistic() {
        let mgmt = setup();
        mgmt.store().set_state(10, CombinedTargetState::new(Online, Good));
        mgmt.store().set_state(20, CombinedTargetState::new(Online, NeedsResync));

        assert_eq!(
            mgmt.change_consistency_states(&[10, 20], &[Good, Good], &[Bad, Good]),
            Err(BeegfsError::Again)
        );
        assert_eq!(mgmt.get_state(10).unwrap().consistency, Good);

        mgmt.change_consistency_states(&[10, 20], &[Good, NeedsResync], &[Good, Good])
            .unwrap();
        assert_eq!(mgmt.get_state(20).unwrap().consistency, Good);
    }

    #[test]
    fn test_set_consistency_with_online() {
        let mgmt = setup();
        mgmt.set_consistency_states(&[20], &[NeedsResync], true).unwrap();
        assert_eq!(
            mgmt.get_state(20),
            Some(CombinedTargetState::new(Online, NeedsResync))
        );
        assert!(matches!(
            mgmt.set_consistency_states(&[20], &[], false),
            Err(BeegfsError::Inval(_))
        ));
    }
}
