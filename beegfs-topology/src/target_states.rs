//! Reachability and consistency states of storage targets
//!
//! Reachability: Online -> POffline once reports are missed for half the
//! offline timeout, POffline -> Offline at the full timeout, and back to
//! Online on the next report. Consistency only changes when told to.

use beegfs_core::{
    BeegfsError, CombinedTargetState, ConsistencyState, ReachabilityState, Result, TargetId,
    TargetStateLists,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Shortest offline timeout accepted; shorter values flap targets offline
pub const MIN_OFFLINE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TargetStateConfig {
    /// Time without reports after which a target is Offline
    pub offline_timeout: Duration,
}

impl Default for TargetStateConfig {
    fn default() -> Self {
        Self {
            offline_timeout: Duration::from_secs(180),
        }
    }
}

impl TargetStateConfig {
    pub fn from_secs(offline_timeout_secs: u64) -> Self {
        Self {
            offline_timeout: Duration::from_secs(offline_timeout_secs),
        }
    }

    /// Time without reports after which a target is POffline
    pub fn poffline_timeout(&self) -> Duration {
        self.offline_timeout / 2
    }
}

#[derive(Debug, Clone, Copy)]
struct StateEntry {
    state: CombinedTargetState,
    /// Last report or explicit change; timeout transitions keep it
    last_changed: Instant,
}

impl StateEntry {
    fn new(state: CombinedTargetState) -> Self {
        Self {
            state,
            last_changed: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub struct TargetStateStore {
    config: TargetStateConfig,
    states: RwLock<BTreeMap<TargetId, StateEntry>>,
}

impl TargetStateStore {
    pub fn new(config: TargetStateConfig) -> Result<Self> {
        if config.offline_timeout < MIN_OFFLINE_TIMEOUT {
            return Err(BeegfsError::InvalidConfig(format!(
                "target offline timeout of {}s is below the minimum of {}s",
                config.offline_timeout.as_secs(),
                MIN_OFFLINE_TIMEOUT.as_secs()
            )));
        }

        Ok(Self {
            config,
            states: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &TargetStateConfig {
        &self.config
    }

    pub fn get_state(&self, target_id: TargetId) -> Option<CombinedTargetState> {
        self.states.read().get(&target_id).map(|e| e.state)
    }

    pub fn contains(&self, target_id: TargetId) -> bool {
        self.states.read().contains_key(&target_id)
    }

    /// Add a target in its initial state. Returns false if already known.
    pub fn add_if_not_exists(&self, target_id: TargetId) -> bool {
        let mut states = self.states.write();
        if states.contains_key(&target_id) {
            return false;
        }
        states.insert(target_id, StateEntry::new(CombinedTargetState::initial()));
        true
    }

    pub fn remove(&self, target_id: TargetId) -> bool {
        self.states.write().remove(&target_id).is_some()
    }

    /// Set the full state. Returns whether it changed.
    pub fn set_state(&self, target_id: TargetId, state: CombinedTargetState) -> bool {
        let mut states = self.states.write();
        match states.get_mut(&target_id) {
            Some(entry) if entry.state == state => false,
            Some(entry) => {
                entry.state = state;
                entry.last_changed = Instant::now();
                true
            }
            None => {
                states.insert(target_id, StateEntry::new(state));
                true
            }
        }
    }

    pub fn set_reachability(&self, target_id: TargetId, reachability: ReachabilityState) -> bool {
        let consistency = self
            .get_state(target_id)
            .map(|s| s.consistency)
            .unwrap_or(ConsistencyState::Good);
        self.set_state(target_id, CombinedTargetState::new(reachability, consistency))
    }

    pub fn set_consistency(&self, target_id: TargetId, consistency: ConsistencyState) -> bool {
        let reachability = self
            .get_state(target_id)
            .map(|s| s.reachability)
            .unwrap_or(ReachabilityState::POffline);
        self.set_state(target_id, CombinedTargetState::new(reachability, consistency))
    }

    /// A report from the target: mark it Online and restart its timeout.
    /// Returns whether the reachability changed.
    pub fn report_online(&self, target_id: TargetId) -> bool {
        self.report_online_at(target_id, Instant::now())
    }

    /// Like [`report_online`](Self::report_online) for a report received at `at`
    pub fn report_online_at(&self, target_id: TargetId, at: Instant) -> bool {
        let mut states = self.states.write();
        let entry = states
            .entry(target_id)
            .or_insert_with(|| StateEntry::new(CombinedTargetState::initial()));

        let changed = entry.state.reachability != ReachabilityState::Online;
        entry.state.reachability = ReachabilityState::Online;
        entry.last_changed = at;
        changed
    }

    /// Replace all states with the given parallel lists. Targets not listed
    /// are dropped. Returns whether anything changed.
    pub fn sync_states_from_lists(
        &self,
        target_ids: &[TargetId],
        reachability: &[ReachabilityState],
        consistency: &[ConsistencyState],
    ) -> Result<bool> {
        if target_ids.len() != reachability.len() || target_ids.len() != consistency.len() {
            return Err(BeegfsError::Inval(format!(
                "target state lists differ in length: {} ids, {} reachability, {} consistency",
                target_ids.len(),
                reachability.len(),
                consistency.len()
            )));
        }

        let mut states = self.states.write();
        let mut changed = states.len() != target_ids.len();
        let mut synced = BTreeMap::new();

        for ((target, reach), cons) in target_ids.iter().zip(reachability).zip(consistency) {
            let state = CombinedTargetState::new(*reach, *cons);
            let entry = match states.get(target) {
                Some(old) if old.state == state => *old,
                _ => {
                    changed = true;
                    StateEntry::new(state)
                }
            };
            synced.insert(*target, entry);
        }

        *states = synced;
        Ok(changed)
    }

    pub fn states_as_lists(&self) -> TargetStateLists {
        let states = self.states.read();
        let mut lists = TargetStateLists::default();
        for (target, entry) in states.iter() {
            lists.target_ids.push(*target);
            lists.reachability.push(entry.state.reachability);
            lists.consistency.push(entry.state.consistency);
        }
        lists
    }

    pub fn all_states(&self) -> BTreeMap<TargetId, CombinedTargetState> {
        self.states
            .read()
            .iter()
            .map(|(target, entry)| (*target, entry.state))
            .collect()
    }

    /// Apply timeout transitions as of `now`. Returns targets newly Offline.
    pub fn auto_offline_targets(&self, now: Instant) -> Vec<TargetId> {
        let poffline_timeout = self.config.poffline_timeout();
        let offline_timeout = self.config.offline_timeout;
        let mut newly_offline = Vec::new();

        let mut states = self.states.write();
        for (target, entry) in states.iter_mut() {
            let silent_for = now.saturating_duration_since(entry.last_changed);

            match entry.state.reachability {
                ReachabilityState::Offline => {}
                _ if silent_for > offline_timeout => {
                    warn!(
                        target_id = *target,
                        silent_secs = silent_for.as_secs(),
                        "Target is offline"
                    );
                    entry.state.reachability = ReachabilityState::Offline;
                    newly_offline.push(*target);
                }
                ReachabilityState::Online if silent_for > poffline_timeout => {
                    warn!(
                        target_id = *target,
                        silent_secs = silent_for.as_secs(),
                        "Target is probably offline"
                    );
                    entry.state.reachability = ReachabilityState::POffline;
                }
                _ => {}
            }
        }

        if !newly_offline.is_empty() {
            debug!(count = newly_offline.len(), "Auto-offline pass finished");
        }

        newly_offline
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}
