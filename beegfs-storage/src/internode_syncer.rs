//! InternodeSyncer
//!
//! Keeps the local [`Topology`] in line with the management daemon:
//! - downloads nodes, target mappings, target states and buddy groups
//! - applies them only once every download succeeded
//! - compares the result with the previous cycle and reacts per policy
//! - re-checks the local network interfaces on its own interval
//!
//! Too many failed cycles in a row are fatal and cancel the daemon.

use async_trait::async_trait;
use beegfs_core::{
    BeegfsError, Backoff, BuddyGroupLists, NicAddress, NicCapabilities, NodeInfo, NodeType,
    NumNodeId, Result, TargetId, TargetStateLists,
};
use beegfs_topology::{Node, NodeChange, SyncNodesResult, Topology, TopologySnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::SyncMetrics;
use crate::mgmt_client::MgmtClient;

/// Node types downloaded every cycle, in apply order
const SYNCED_NODE_TYPES: [NodeType; 3] = [NodeType::Meta, NodeType::Storage, NodeType::Mgmt];

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("topology download failed: {0}")]
    Download(BeegfsError),

    #[error("applying downloaded topology failed: {0}")]
    Apply(BeegfsError),

    #[error("giving up after {failures} consecutive sync failures: {last}")]
    Fatal { failures: u32, last: BeegfsError },

    #[error("topology changed: {}", .0.join("; "))]
    TopologyChanged(Vec<String>),

    #[error("management node not available after {0:?}")]
    MgmtUnavailable(Duration),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Errors that stop the syncer and the daemon with it
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::TopologyChanged(_))
    }
}

/// Reaction to removed or remapped nodes, targets and buddy groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyChangePolicy {
    /// Log and carry on; what servers do
    #[default]
    Warn,
    /// Stop; for tools that need a stable view of the file system
    Abort,
}

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    pub interval: Duration,
    pub check_network_interval: Duration,
    pub max_consecutive_failures: u32,
    pub topology_change_policy: TopologyChangePolicy,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            check_network_interval: Duration::from_secs(60),
            max_consecutive_failures: 10,
            topology_change_policy: TopologyChangePolicy::Warn,
        }
    }
}

/// Source of the local network interfaces
#[async_trait]
pub trait NicSource: Send + Sync {
    async fn list_interfaces(&self) -> Result<Vec<NicAddress>>;
}

/// Non-loopback IPv4 and IPv6 interfaces of this host
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalNicSource;

#[async_trait]
impl NicSource for LocalNicSource {
    async fn list_interfaces(&self) -> Result<Vec<NicAddress>> {
        let interfaces = local_ip_address::list_afinet_netifas()
            .map_err(|e| BeegfsError::Internal(format!("failed to list interfaces: {}", e)))?;

        Ok(interfaces
            .into_iter()
            .filter(|(_, ip)| !ip.is_loopback())
            .map(|(name, ip)| NicAddress::ethernet(name, ip))
            .collect())
    }
}

/// What one cycle changed
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub nodes: Vec<(NodeType, SyncNodesResult)>,
    pub targets_changed: bool,
    pub states_changed: bool,
    pub groups_changed: bool,
    pub topology_changes: Vec<String>,
    pub nics_changed: bool,
}

impl CycleReport {
    pub fn nodes_added(&self) -> usize {
        self.nodes.iter().map(|(_, r)| r.added.len()).sum()
    }

    pub fn nodes_removed(&self) -> usize {
        self.nodes.iter().map(|(_, r)| r.removed.len()).sum()
    }

    pub fn is_modified(&self) -> bool {
        self.nodes.iter().any(|(_, r)| !r.is_empty())
            || self.targets_changed
            || self.states_changed
            || self.groups_changed
            || self.nics_changed
    }
}

/// Everything one cycle downloads before applying any of it
#[derive(Debug)]
struct Downloads {
    nodes: Vec<(NodeType, Vec<NodeInfo>)>,
    targets: BTreeMap<TargetId, NumNodeId>,
    states: TargetStateLists,
    storage_groups: BuddyGroupLists,
    meta_groups: BuddyGroupLists,
}

impl Downloads {
    fn validate(&self) -> Result<()> {
        let s = &self.states;
        if s.target_ids.len() != s.reachability.len() || s.target_ids.len() != s.consistency.len() {
            return Err(BeegfsError::Inval(format!(
                "target state lists differ in length: {} ids, {} reachability, {} consistency",
                s.target_ids.len(),
                s.reachability.len(),
                s.consistency.len()
            )));
        }

        for (kind, g) in [("storage", &self.storage_groups), ("meta", &self.meta_groups)] {
            if g.group_ids.len() != g.primary_targets.len()
                || g.group_ids.len() != g.secondary_targets.len()
            {
                return Err(BeegfsError::Inval(format!(
                    "{} buddy group lists differ in length",
                    kind
                )));
            }
        }

        Ok(())
    }
}

/// Removed nodes, removed or remapped targets and removed or changed buddy
/// groups between two snapshots. Additions are not reported.
pub fn detect_topology_changes(old: &TopologySnapshot, new: &TopologySnapshot) -> Vec<String> {
    let mut changes = Vec::new();

    for node_type in SYNCED_NODE_TYPES {
        for id in old.nodes(node_type) {
            if !new.nodes(node_type).contains(id) {
                changes.push(format!("{} node {} removed", node_type, id));
            }
        }
    }

    for (target, node) in &old.targets {
        match new.targets.get(target) {
            None => changes.push(format!("target {} removed", target)),
            Some(n) if n != node => changes.push(format!(
                "target {} moved from node {} to node {}",
                target, node, n
            )),
            Some(_) => {}
        }
    }

    for (kind, old_groups, new_groups) in [
        ("storage", &old.storage_buddy_groups, &new.storage_buddy_groups),
        ("meta", &old.meta_buddy_groups, &new.meta_buddy_groups),
    ] {
        for (group_id, group) in old_groups {
            match new_groups.get(group_id) {
                None => changes.push(format!("{} buddy group {} removed", kind, group_id)),
                Some(g) if g != group => changes.push(format!(
                    "{} buddy group {} changed from {}/{} to {}/{}",
                    kind, group_id, group.primary, group.secondary, g.primary, g.secondary
                )),
                Some(_) => {}
            }
        }
    }

    changes
}

pub struct InternodeSyncer {
    config: SyncerConfig,
    topology: Arc<Topology>,
    mgmt: Arc<dyn MgmtClient>,
    nic_source: Arc<dyn NicSource>,
    metrics: SyncMetrics,
    /// Local target used to pick the local storage buddy group
    local_target: Option<TargetId>,
    consecutive_failures: AtomicU32,
    force_network_check: AtomicBool,
    network_wake: Notify,
    last_network_check: Mutex<Instant>,
    last_snapshot: Mutex<Option<TopologySnapshot>>,
}

impl InternodeSyncer {
    pub fn new(
        config: SyncerConfig,
        topology: Arc<Topology>,
        mgmt: Arc<dyn MgmtClient>,
        nic_source: Arc<dyn NicSource>,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            config,
            topology,
            mgmt,
            nic_source,
            metrics,
            local_target: None,
            consecutive_failures: AtomicU32::new(0),
            force_network_check: AtomicBool::new(false),
            network_wake: Notify::new(),
            last_network_check: Mutex::new(Instant::now()),
            last_snapshot: Mutex::new(None),
        }
    }

    pub fn with_local_target(mut self, target_id: TargetId) -> Self {
        self.local_target = Some(target_id);
        self
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Re-check the local interfaces now, without waiting for the next cycle
    pub fn force_check_network(&self) {
        self.force_network_check.store(true, Ordering::Release);
        self.network_wake.notify_one();
    }

    /// Start the sync loop. The first cycle runs immediately.
    pub fn start(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> JoinHandle<std::result::Result<(), SyncError>> {
        let syncer = self;

        tokio::spawn(async move {
            let mut sync_timer = interval(syncer.config.interval);
            sync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_secs = syncer.config.interval.as_secs(),
                policy = ?syncer.config.topology_change_policy,
                "Internode syncer started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Internode syncer stopped");
                        return Ok(());
                    }
                    _ = syncer.network_wake.notified() => {
                        // a cycle in between may already have handled it
                        if syncer.force_network_check.swap(false, Ordering::AcqRel) {
                            debug!("Forced network interface check");
                            syncer.check_network().await;
                        }
                    }
                    _ = sync_timer.tick() => {
                        match syncer.run_cycle().await {
                            Ok(_) => {}
                            Err(e) if e.is_fatal() => {
                                error!(error = %e, "Internode syncer giving up; shutting down");
                                cancel.cancel();
                                return Err(e);
                            }
                            Err(e) => {
                                warn!(
                                    error = %e,
                                    consecutive_failures = syncer.consecutive_failures(),
                                    "Topology sync cycle skipped"
                                );
                            }
                        }
                    }
                }
            }
        })
    }

    /// Run a single sync cycle
    pub async fn run_cycle(&self) -> std::result::Result<CycleReport, SyncError> {
        let start = Instant::now();

        // Step 1: Download everything; a failure leaves the topology untouched
        let downloads = match self.download().await {
            Ok(downloads) => downloads,
            Err(e) => return Err(self.record_failure(e, SyncError::Download)),
        };

        // Step 2: Apply
        let mut report = match self.apply(downloads) {
            Ok(report) => report,
            Err(e) => return Err(self.record_failure(e, SyncError::Apply)),
        };
        self.consecutive_failures.store(0, Ordering::Release);

        // Step 3: Compare with the previous cycle
        let snapshot = self.topology.snapshot();
        let previous = self.last_snapshot.lock().replace(snapshot.clone());
        if let Some(previous) = previous {
            report.topology_changes = detect_topology_changes(&previous, &snapshot);
        }
        if !report.topology_changes.is_empty() {
            self.metrics
                .record_topology_changes(report.topology_changes.len());
            match self.config.topology_change_policy {
                TopologyChangePolicy::Warn => {
                    for change in &report.topology_changes {
                        warn!(change = %change, "Topology changed");
                    }
                }
                TopologyChangePolicy::Abort => {
                    for change in &report.topology_changes {
                        error!(change = %change, "Topology changed");
                    }
                    return Err(SyncError::TopologyChanged(report.topology_changes));
                }
            }
        }

        // Step 4: Network check on its own interval
        let check_due = self.last_network_check.lock().elapsed() >= self.config.check_network_interval;
        if self.force_network_check.swap(false, Ordering::AcqRel) || check_due {
            report.nics_changed = self.check_network().await;
        }

        let duration = start.elapsed();
        self.metrics.record_cycle(duration);

        if report.is_modified() {
            info!(
                duration_ms = duration.as_millis(),
                nodes_added = report.nodes_added(),
                nodes_removed = report.nodes_removed(),
                targets_changed = report.targets_changed,
                states_changed = report.states_changed,
                groups_changed = report.groups_changed,
                nics_changed = report.nics_changed,
                "Topology sync cycle complete with changes"
            );
        } else {
            debug!(
                duration_ms = duration.as_millis(),
                "Topology sync cycle complete (no changes)"
            );
        }

        Ok(report)
    }

    fn record_failure(&self, error: BeegfsError, stage: fn(BeegfsError) -> SyncError) -> SyncError {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.record_failure(failures);

        if failures >= self.config.max_consecutive_failures {
            SyncError::Fatal {
                failures,
                last: error,
            }
        } else {
            stage(error)
        }
    }

    async fn download(&self) -> Result<Downloads> {
        let mgmt = &self.mgmt;
        let (meta, storage, mgmt_nodes, targets, (states, storage_groups), meta_groups) = futures::try_join!(
            mgmt.get_nodes(NodeType::Meta),
            mgmt.get_nodes(NodeType::Storage),
            mgmt.get_nodes(NodeType::Mgmt),
            mgmt.get_target_mappings(),
            mgmt.get_states_and_buddy_groups(NodeType::Storage),
            mgmt.get_mirror_buddy_groups(NodeType::Meta),
        )?;

        if let Some(root) = meta.1 {
            debug!(root = %root, "Meta root node");
        }

        let downloads = Downloads {
            nodes: vec![
                (NodeType::Meta, meta.0),
                (NodeType::Storage, storage.0),
                (NodeType::Mgmt, mgmt_nodes.0),
            ],
            targets,
            states,
            storage_groups,
            meta_groups,
        };
        downloads.validate()?;
        Ok(downloads)
    }

    fn local_caps(&self) -> NicCapabilities {
        self.topology
            .storage_nodes
            .local_node()
            .map(|node| NicCapabilities::from_nics(&node.nics()))
            .unwrap_or_default()
    }

    fn apply(&self, downloads: Downloads) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let caps = self.local_caps();

        for (node_type, infos) in downloads.nodes {
            let store = self.topology.node_store(node_type);
            let nodes = infos.iter().map(Node::from_info).collect();
            let result = store.sync_from_authoritative_list_with(nodes, caps, |change| match change {
                NodeChange::Added(id) => warn!(node_type = %node_type, node_id = %id, "Node added"),
                NodeChange::Removed(id) => {
                    warn!(node_type = %node_type, node_id = %id, "Node removed")
                }
            });
            self.metrics
                .record_node_changes(node_type, result.added.len(), result.removed.len(), store.len());
            report.nodes.push((node_type, result));
        }

        report.targets_changed = self.topology.target_mapper.sync_targets(downloads.targets);

        let states = downloads.states;
        report.states_changed = self.topology.target_states.sync_states_from_lists(
            &states.target_ids,
            &states.reachability,
            &states.consistency,
        )?;

        let g = downloads.storage_groups;
        let storage_changed = self.topology.storage_buddy_groups.sync_groups_from_lists(
            &g.group_ids,
            &g.primary_targets,
            &g.secondary_targets,
            self.local_target,
        )?;
        let g = downloads.meta_groups;
        let meta_changed = self.topology.meta_buddy_groups.sync_groups_from_lists(
            &g.group_ids,
            &g.primary_targets,
            &g.secondary_targets,
            None,
        )?;
        report.groups_changed = storage_changed || meta_changed;

        Ok(report)
    }

    /// Re-enumerate the local interfaces and update the local node if they
    /// changed. Returns whether they did.
    pub async fn check_network(&self) -> bool {
        *self.last_network_check.lock() = Instant::now();

        let nics = match self.nic_source.list_interfaces().await {
            Ok(nics) => nics,
            Err(e) => {
                warn!(error = %e, "Network interface check failed");
                return false;
            }
        };

        let Some(local) = self.topology.storage_nodes.local_node() else {
            return false;
        };
        if local.nics() == nics {
            return false;
        }

        let changed = local.update_interfaces(local.port_udp(), local.port_tcp(), &nics);
        if changed {
            let caps = NicCapabilities::from_nics(&nics);
            for node_type in SYNCED_NODE_TYPES {
                for node in self.topology.node_store(node_type).reference_all_nodes() {
                    node.conn_pool().set_local_nic_caps(caps);
                }
            }
            info!(
                interfaces = ?nics.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
                "Local network interfaces changed"
            );
        }
        changed
    }

    /// Poll mgmtd until a mgmt node is known
    pub async fn wait_for_mgmt_node(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> std::result::Result<(), SyncError> {
        let mut backoff = Backoff::new();

        loop {
            match self.mgmt.get_nodes(NodeType::Mgmt).await {
                Ok((infos, _)) if !infos.is_empty() => {
                    let nodes = infos.iter().map(Node::from_info).collect();
                    self.topology
                        .mgmt_nodes
                        .sync_from_authoritative_list(nodes, self.local_caps());
                    info!(attempts = backoff.attempts() + 1, "Management node available");
                    return Ok(());
                }
                Ok(_) => debug!("Management daemon knows no mgmt node yet"),
                Err(e) => debug!(error = %e, "Management daemon not reachable"),
            }

            let remaining = timeout.saturating_sub(backoff.elapsed());
            if remaining.is_zero() {
                return Err(SyncError::MgmtUnavailable(timeout));
            }
            let delay = backoff.next_delay().min(remaining);

            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beegfs_core::{ConsistencyState, ReachabilityState};
    use beegfs_topology::{MirrorBuddyGroup, TargetStateConfig};
    use std::net::{IpAddr, Ipv4Addr};

    #[derive(Default)]
    struct FakeMgmtState {
        nodes: Vec<NodeInfo>,
        targets: BTreeMap<TargetId, NumNodeId>,
        states: TargetStateLists,
        storage_groups: BuddyGroupLists,
        fail_mappings: bool,
    }

    #[derive(Default)]
    struct FakeMgmt {
        state: Mutex<FakeMgmtState>,
    }

    #[async_trait]
    impl MgmtClient for FakeMgmt {
        async fn get_nodes(&self, node_type: NodeType) -> Result<(Vec<NodeInfo>, Option<NumNodeId>)> {
            let nodes = self
                .state
                .lock()
                .nodes
                .iter()
                .filter(|n| n.node_type == node_type)
                .cloned()
                .collect();
            Ok((nodes, None))
        }

        async fn get_target_mappings(&self) -> Result<BTreeMap<TargetId, NumNodeId>> {
            let state = self.state.lock();
            if state.fail_mappings {
                return Err(BeegfsError::Communication("connection refused".into()));
            }
            Ok(state.targets.clone())
        }

        async fn get_states_and_buddy_groups(
            &self,
            _node_type: NodeType,
        ) -> Result<(TargetStateLists, BuddyGroupLists)> {
            let state = self.state.lock();
            Ok((state.states.clone(), state.storage_groups.clone()))
        }

        async fn get_mirror_buddy_groups(&self, _node_type: NodeType) -> Result<BuddyGroupLists> {
            Ok(BuddyGroupLists::default())
        }

        async fn register_node(&self, node: NodeInfo) -> Result<NumNodeId> {
            Ok(node.num_id)
        }

        async fn register_target(&self, target_id: TargetId, _node_id: NumNodeId) -> Result<TargetId> {
            Ok(target_id)
        }

        async fn heartbeat(&self, _node: NodeInfo) -> Result<bool> {
            Ok(true)
        }

        async fn set_target_consistency_states(
            &self,
            _target_ids: Vec<TargetId>,
            _states: Vec<ConsistencyState>,
            _set_online: bool,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct FixedNics(Mutex<Vec<NicAddress>>);

    #[async_trait]
    impl NicSource for FixedNics {
        async fn list_interfaces(&self) -> Result<Vec<NicAddress>> {
            Ok(self.0.lock().clone())
        }
    }

    fn info(id: u32, string_id: &str, node_type: NodeType) -> NodeInfo {
        NodeInfo {
            num_id: NumNodeId(id),
            string_id: string_id.to_string(),
            node_type,
            port_udp: 8003,
            port_tcp: 8003,
            nics: vec![NicAddress::ethernet("eth0", IpAddr::V4(Ipv4Addr::new(10, 0, 0, id as u8)))],
        }
    }

    /// mgmt 1, meta 2, storage 3 and 4 with targets 4 and 7 in group 3
    fn populated_mgmt() -> Arc<FakeMgmt> {
        let mgmt = Arc::new(FakeMgmt::default());
        {
            let mut s = mgmt.state.lock();
            s.nodes = vec![
                info(1, "mgmt01", NodeType::Mgmt),
                info(2, "meta01", NodeType::Meta),
                info(3, "storage03", NodeType::Storage),
                info(4, "storage04", NodeType::Storage),
            ];
            s.targets = BTreeMap::from([(4, NumNodeId(4)), (7, NumNodeId(3))]);
            s.states = TargetStateLists {
                target_ids: vec![4, 7],
                reachability: vec![ReachabilityState::Online, ReachabilityState::Online],
                consistency: vec![ConsistencyState::Good, ConsistencyState::NeedsResync],
            };
            s.storage_groups = BuddyGroupLists {
                group_ids: vec![3],
                primary_targets: vec![4],
                secondary_targets: vec![7],
            };
        }
        mgmt
    }

    fn syncer(mgmt: Arc<FakeMgmt>, config: SyncerConfig) -> (InternodeSyncer, Arc<Topology>) {
        let topology = Arc::new(Topology::new(TargetStateConfig::from_secs(180)).unwrap());
        topology.storage_nodes.set_local_node(Node::from_info(&info(3, "storage03", NodeType::Storage)));
        let syncer = InternodeSyncer::new(
            config,
            topology.clone(),
            mgmt,
            Arc::new(FixedNics(Mutex::new(Vec::new()))),
            SyncMetrics::new("storage03"),
        )
        .with_local_target(7);
        (syncer, topology)
    }

    #[tokio::test]
    async fn test_cycle_applies_downloads() {
        let (syncer, topology) = syncer(populated_mgmt(), SyncerConfig::default());

        let report = syncer.run_cycle().await.unwrap();
        assert!(report.is_modified());
        assert_eq!(report.nodes_added(), 3); // local node is not re-added
        assert!(report.targets_changed);
        assert!(report.groups_changed);

        assert_eq!(topology.storage_nodes.node_ids(), vec![NumNodeId(3), NumNodeId(4)]);
        assert_eq!(topology.target_mapper.get_node_id(7), Some(NumNodeId(3)));
        assert_eq!(
            topology.target_states.get_state(7).unwrap().consistency,
            ConsistencyState::NeedsResync
        );
        assert_eq!(topology.storage_buddy_groups.get_buddy_group_id(7), Some((3, false)));
        assert_eq!(topology.storage_buddy_groups.local_group_id(), Some(3));

        // second cycle with identical data changes nothing
        let report = syncer.run_cycle().await.unwrap();
        assert!(!report.is_modified());
        assert!(report.topology_changes.is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_applies_nothing() {
        let mgmt = populated_mgmt();
        mgmt.state.lock().fail_mappings = true;
        let (syncer, topology) = syncer(
            mgmt,
            SyncerConfig {
                max_consecutive_failures: 2,
                ..SyncerConfig::default()
            },
        );

        assert!(matches!(syncer.run_cycle().await, Err(SyncError::Download(_))));
        // nodes were downloaded but must not be applied
        assert!(topology.meta_nodes.is_empty());
        assert_eq!(syncer.consecutive_failures(), 1);

        let err = syncer.run_cycle().await.unwrap_err();
        assert!(matches!(err, SyncError::Fatal { failures: 2, .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let mgmt = populated_mgmt();
        mgmt.state.lock().fail_mappings = true;
        let (syncer, _topology) = syncer(mgmt.clone(), SyncerConfig::default());

        syncer.run_cycle().await.unwrap_err();
        mgmt.state.lock().fail_mappings = false;
        syncer.run_cycle().await.unwrap();
        assert_eq!(syncer.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_state_lists_are_rejected() {
        let mgmt = populated_mgmt();
        mgmt.state.lock().states.consistency.pop();
        let (syncer, topology) = syncer(mgmt, SyncerConfig::default());

        assert!(matches!(
            syncer.run_cycle().await,
            Err(SyncError::Download(BeegfsError::Inval(_)))
        ));
        assert!(topology.target_mapper.is_empty());
    }

    #[test]
    fn test_detect_topology_changes() {
        let old = TopologySnapshot {
            meta_nodes: vec![NumNodeId(1), NumNodeId(2)],
            storage_nodes: vec![NumNodeId(3)],
            targets: BTreeMap::from([(1, NumNodeId(3)), (2, NumNodeId(3))]),
            storage_buddy_groups: BTreeMap::from([
                (1, MirrorBuddyGroup::new(1, 2)),
                (2, MirrorBuddyGroup::new(5, 6)),
            ]),
            ..TopologySnapshot::default()
        };
        let new = TopologySnapshot {
            meta_nodes: vec![NumNodeId(1), NumNodeId(9)],
            storage_nodes: vec![NumNodeId(3)],
            targets: BTreeMap::from([(1, NumNodeId(4))]),
            storage_buddy_groups: BTreeMap::from([(1, MirrorBuddyGroup::new(2, 1))]),
            ..TopologySnapshot::default()
        };

        let changes = detect_topology_changes(&old, &new);
        assert_eq!(
            changes,
            vec![
                "meta node 2 removed",
                "target 1 moved from node 3 to node 4",
                "target 2 removed",
                "storage buddy group 1 changed from 1/2 to 2/1",
                "storage buddy group 2 removed",
            ]
        );
        assert!(detect_topology_changes(&new, &new).is_empty());
    }

    #[tokio::test]
    async fn test_abort_policy_cancels_on_removal() {
        let mgmt = populated_mgmt();
        let (syncer, _topology) = syncer(
            mgmt.clone(),
            SyncerConfig {
                interval: Duration::from_millis(10),
                topology_change_policy: TopologyChangePolicy::Abort,
                ..SyncerConfig::default()
            },
        );
        syncer.run_cycle().await.unwrap();

        mgmt.state.lock().targets.remove(&4);
        let cancel = CancellationToken::new();
        let result = Arc::new(syncer).start(cancel.clone()).await.unwrap();

        assert!(matches!(result, Err(SyncError::TopologyChanged(_))));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_check_network_updates_local_node() {
        let (syncer, topology) = syncer(populated_mgmt(), SyncerConfig::default());
        let nics = vec![NicAddress::ethernet("ib0", IpAddr::V4(Ipv4Addr::new(192, 168, 1, 3)))];
        let source = Arc::new(FixedNics(Mutex::new(nics.clone())));
        let syncer = InternodeSyncer {
            nic_source: source,
            ..syncer
        };

        assert!(syncer.check_network().await);
        assert_eq!(topology.storage_nodes.local_node().unwrap().nics(), nics);
        assert!(!syncer.check_network().await);
    }

    #[test]
    fn test_apply_failures_count_towards_limit() {
        let (syncer, _topology) = syncer(
            populated_mgmt(),
            SyncerConfig {
                max_consecutive_failures: 2,
                ..SyncerConfig::default()
            },
        );

        let err = syncer.record_failure(BeegfsError::Inval("bad lists".into()), SyncError::Apply);
        assert!(matches!(err, SyncError::Apply(_)));
        assert!(err.to_string().starts_with("applying downloaded topology failed"));

        let err = syncer.record_failure(BeegfsError::Inval("bad lists".into()), SyncError::Apply);
        assert!(matches!(err, SyncError::Fatal { failures: 2, .. }));
    }

    #[tokio::test]
    async fn test_forced_network_check_runs_before_next_cycle() {
        let (syncer, topology) = syncer(
            populated_mgmt(),
            SyncerConfig {
                interval: Duration::from_secs(3600),
                check_network_interval: Duration::from_secs(3600),
                ..SyncerConfig::default()
            },
        );
        let source = Arc::new(FixedNics(Mutex::new(Vec::new())));
        let syncer = Arc::new(InternodeSyncer {
            nic_source: source.clone(),
            ..syncer
        });

        let cancel = CancellationToken::new();
        let handle = syncer.clone().start(cancel.clone());
        // let the immediate first cycle finish
        tokio::time::sleep(Duration::from_millis(50)).await;

        let nics = vec![NicAddress::ethernet("ib0", IpAddr::V4(Ipv4Addr::new(192, 168, 1, 3)))];
        *source.0.lock() = nics.clone();
        syncer.force_check_network();

        let mut updated = false;
        for _ in 0..100 {
            if topology.storage_nodes.local_node().unwrap().nics() == nics {
                updated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(updated, "forced network check did not run");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_mgmt_node() {
        let (syncer, topology) = syncer(populated_mgmt(), SyncerConfig::default());
        syncer
            .wait_for_mgmt_node(&CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(topology.mgmt_nodes.node_ids(), vec![NumNodeId(1)]);

        let (syncer, _topology) = syncer_without_mgmt();
        assert!(matches!(
            syncer
                .wait_for_mgmt_node(&CancellationToken::new(), Duration::from_millis(50))
                .await,
            Err(SyncError::MgmtUnavailable(_))
        ));
    }

    fn syncer_without_mgmt() -> (InternodeSyncer, Arc<Topology>) {
        syncer(Arc::new(FakeMgmt::default()), SyncerConfig::default())
    }
}
