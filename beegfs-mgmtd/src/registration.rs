//! Node and target registration
//!
//! Nodes register once at startup to obtain their numeric ID and then keep
//! themselves alive with heartbeats. Unknown meta and storage servers are only
//! accepted while `sys.allow_new_servers` is set; clients always are.

use async_trait::async_trait;
use beegfs_core::{
    request_response, BeegfsError, MessageType, MessagingConfig, NetMessage, NodeInfo, NodeType,
    NumNodeId, Result, TargetId,
};
use beegfs_topology::{AddOutcome, Node, Topology};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics;

// ============================================================================
// Dependency Injection Traits
// ============================================================================

/// Propagates membership changes to the rest of the cluster
#[async_trait]
pub trait NodeNotifier: Send + Sync {
    async fn node_added(&self, node: &NodeInfo);
    async fn node_removed(&self, node_type: NodeType, num_id: NumNodeId);
}

/// Only logs membership changes
pub struct LoggingNotifier;

#[async_trait]
impl NodeNotifier for LoggingNotifier {
    async fn node_added(&self, node: &NodeInfo) {
        debug!(node = %node.string_id, num_id = %node.num_id, "Node added");
    }

    async fn node_removed(&self, node_type: NodeType, num_id: NumNodeId) {
        debug!(%node_type, %num_id, "Node removed");
    }
}

/// Forwards a new node's heartbeat to every known meta and storage server,
/// so they learn about it before their next topology sync
pub struct HeartbeatBroadcaster {
    topology: Arc<Topology>,
    messaging: MessagingConfig,
}

impl HeartbeatBroadcaster {
    pub fn new(topology: Arc<Topology>, messaging: MessagingConfig) -> Self {
        Self {
            topology,
            messaging,
        }
    }
}

#[async_trait]
impl NodeNotifier for HeartbeatBroadcaster {
    async fn node_added(&self, node: &NodeInfo) {
        let recipients: Vec<_> = [NodeType::Meta, NodeType::Storage]
            .into_iter()
            .flat_map(|t| self.topology.node_store(t).reference_all_nodes())
            .filter(|n| n.num_id() != node.num_id || n.node_type() != node.node_type)
            .filter_map(|n| n.socket_addr().map(|addr| (n, addr)))
            .collect();

        let msg = NetMessage::Heartbeat { node: node.clone() };
        let sends = recipients.iter().map(|(recipient, addr)| {
            let msg = &msg;
            async move {
                if let Err(e) =
                    request_response(*addr, msg, MessageType::HeartbeatResp, &self.messaging).await
                {
                    debug!(
                        recipient = %recipient.typed_id(),
                        error = %e,
                        "Failed to propagate new node"
                    );
                }
            }
        });
        join_all(sends).await;
    }

    async fn node_removed(&self, node_type: NodeType, num_id: NumNodeId) {
        debug!(%node_type, %num_id, "Node removal propagates with the next sync");
    }
}

// ============================================================================
// Registration Handler
// ============================================================================

pub struct RegistrationHandler {
    topology: Arc<Topology>,
    allow_new_servers: bool,
    notifier: Arc<dyn NodeNotifier>,
}

impl RegistrationHandler {
    pub fn new(
        topology: Arc<Topology>,
        allow_new_servers: bool,
        notifier: Arc<dyn NodeNotifier>,
    ) -> Self {
        Self {
            topology,
            allow_new_servers,
            notifier,
        }
    }

    /// Shared checks of registrations and heartbeats
    fn check_admission(&self, info: &NodeInfo) -> bool {
        if info.string_id.is_empty() {
            error!(num_id = %info.num_id, "Rejecting node without string ID");
            return false;
        }

        if info.node_type == NodeType::Mgmt {
            error!(node = %info.string_id, "Rejecting registration of a management node");
            return false;
        }

        let store = self.topology.node_store(info.node_type);
        let known = store.num_id_for_string_id(&info.string_id).is_some();

        if !known && info.node_type.is_server() && !self.allow_new_servers {
            warn!(
                node = %info.string_id,
                node_type = %info.node_type,
                "Registration of new server rejected by policy"
            );
            metrics::record_registration("rejected");
            return false;
        }

        true
    }

    /// Register a node. Returns its numeric ID, or 0 if it was rejected.
    #[instrument(skip(self, info), fields(node = %info.string_id, node_type = %info.node_type))]
    pub async fn handle_register_node(&self, mut info: NodeInfo) -> NumNodeId {
        if !self.check_admission(&info) {
            return NumNodeId::INVALID;
        }

        let store = self.topology.node_store(info.node_type);

        if !info.num_id.is_valid() {
            match store.generate_num_id(&info.string_id) {
                Some(id) => info.num_id = id,
                None => {
                    error!("No free numeric node ID left");
                    return NumNodeId::INVALID;
                }
            }
        }

        match store.add_or_update(Node::from_info(&info)) {
            AddOutcome::Added => {
                warn!(num_id = %info.num_id, "New node registered");
                metrics::record_registration("added");
                metrics::set_registered_nodes(info.node_type, store.len());

                // store lock is released here
                self.notifier.node_added(&info).await;
                info.num_id
            }
            AddOutcome::Updated => {
                debug!(num_id = %info.num_id, "Known node registered again");
                info.num_id
            }
            AddOutcome::Rejected => {
                metrics::record_registration("rejected");
                NumNodeId::INVALID
            }
        }
    }

    /// Refresh a node from its heartbeat. A storage node's heartbeat also
    /// reports its targets online.
    pub async fn handle_heartbeat(&self, info: NodeInfo) -> AddOutcome {
        if !info.num_id.is_valid() || !self.check_admission(&info) {
            return AddOutcome::Rejected;
        }

        let store = self.topology.node_store(info.node_type);
        let outcome = store.add_or_update(Node::from_info(&info));

        if outcome == AddOutcome::Added {
            warn!(node = %info.string_id, num_id = %info.num_id, "New node from heartbeat");
            metrics::set_registered_nodes(info.node_type, store.len());
            self.notifier.node_added(&info).await;
        }

        if outcome != AddOutcome::Rejected && info.node_type == NodeType::Storage {
            for target in self.topology.target_mapper.targets_of_node(info.num_id) {
                if self.topology.target_states.report_online(target) {
                    info!(target_id = target, node = %info.string_id, "Target is online");
                }
            }
        }

        outcome
    }

    /// Map a storage target to its node. Target ID 0 allocates a new ID.
    pub fn handle_register_target(&self, target_id: TargetId, node_id: NumNodeId) -> Result<TargetId> {
        if self.topology.storage_nodes.reference(node_id).is_none() {
            return Err(BeegfsError::UnknownNode(node_id));
        }

        let mapper = &self.topology.target_mapper;

        let target_id = if target_id == 0 {
            let mapping = mapper.mapping();
            let next = match mapping.keys().next_back() {
                None => Some(1),
                Some(max) if *max < TargetId::MAX => Some(max + 1),
                Some(_) => (1..TargetId::MAX).find(|t| !mapping.contains_key(t)),
            };
            next.ok_or_else(|| BeegfsError::Inval("no free target ID".to_string()))?
        } else {
            match mapper.get_node_id(target_id) {
                Some(owner) if owner == node_id => return Ok(target_id),
                Some(owner) => {
                    error!(target_id, %owner, requested = %node_id, "Target ID already mapped");
                    return Err(BeegfsError::Exists(format!(
                        "target {} belongs to node {}",
                        target_id, owner
                    )));
                }
                None => target_id,
            }
        };

        mapper.map_target(target_id, node_id);
        info!(target_id, %node_id, "Storage target registered");

        Ok(target_id)
    }

    /// Remove a node and, for storage nodes, unmap its targets
    pub async fn handle_remove_node(&self, node_type: NodeType, num_id: NumNodeId) -> bool {
        let store = self.topology.node_store(node_type);
        if !store.remove(num_id) {
            return false;
        }

        warn!(%node_type, %num_id, "Node removed");

        if node_type == NodeType::Storage {
            for target in self.topology.target_mapper.unmap_by_node_id(num_id) {
                self.topology.target_states.remove(target);
                info!(target_id = target, "Unmapped target of removed node");
            }
        }

        metrics::set_registered_nodes(node_type, store.len());
        self.notifier.node_removed(node_type, num_id).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beegfs_core::NicAddress;
    use beegfs_core::ReachabilityState;
    use beegfs_topology::TargetStateConfig;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        added: Mutex<Vec<NumNodeId>>,
    }

    #[async_trait]
    impl NodeNotifier for RecordingNotifier {
        async fn node_added(&self, node: &NodeInfo) {
            self.added.lock().push(node.num_id);
        }

        async fn node_removed(&self, _node_type: NodeType, _num_id: NumNodeId) {}
    }

    fn info(num_id: u32, string_id: &str, node_type: NodeType) -> NodeInfo {
        NodeInfo {
            num_id: NumNodeId(num_id),
            string_id: string_id.to_string(),
            node_type,
            port_udp: 8003,
            port_tcp: 8003,
            nics: vec![NicAddress::ethernet("eth0", "127.0.0.1".parse().unwrap())],
        }
    }

    fn handler(allow_new_servers: bool) -> (RegistrationHandler, Arc<RecordingNotifier>, Arc<Topology>) {
        let topology = Arc::new(Topology::new(TargetStateConfig::default()).unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = RegistrationHandler::new(topology.clone(), allow_new_servers, notifier.clone());
        (handler, notifier, topology)
    }

    #[tokio::test]
    async fn test_register_generates_id_and_notifies() {
        let (handler, notifier, _) = handler(true);

        let id = handler
            .handle_register_node(info(0, "storage01", NodeType::Storage))
            .await;
        assert_eq!(id, NumNodeId(1));

        let again = handler
            .handle_register_node(info(0, "storage01", NodeType::Storage))
            .await;
        assert_eq!(again, NumNodeId(1));
        assert_eq!(*notifier.added.lock(), vec![NumNodeId(1)]);
    }

    #[tokio::test]
    async fn test_new_servers_rejected_by_policy() {
        let (handler, notifier, topology) = handler(false);

        let id = handler
            .handle_register_node(info(0, "meta01", NodeType::Meta))
            .await;
        assert_eq!(id, NumNodeId::INVALID);
        assert!(topology.meta_nodes.is_empty());

        let id = handler
            .handle_register_node(info(0, "client01", NodeType::Client))
            .await;
        assert!(id.is_valid());
        assert_eq!(notifier.added.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_registrations_rejected() {
        let (handler, _, _) = handler(true);
        assert!(!handler
            .handle_register_node(info(0, "", NodeType::Storage))
            .await
            .is_valid());
        assert!(!handler
            .handle_register_node(info(0, "mgmt02", NodeType::Mgmt))
            .await
            .is_valid());
    }

    #[tokio::test]
    async fn test_register_target() {
        let (handler, _, topology) = handler(true);
        handler
            .handle_register_node(info(4, "storage04", NodeType::Storage))
            .await;

        assert_eq!(handler.handle_register_target(0, NumNodeId(4)), Ok(1));
        assert_eq!(handler.handle_register_target(7, NumNodeId(4)), Ok(7));
        assert_eq!(handler.handle_register_target(7, NumNodeId(4)), Ok(7));
        assert_eq!(handler.handle_register_target(0, NumNodeId(4)), Ok(8));
        assert_eq!(
            handler.handle_register_target(1, NumNodeId(9)),
            Err(BeegfsError::UnknownNode(NumNodeId(9)))
        );
        assert_eq!(topology.target_mapper.targets_of_node(NumNodeId(4)), vec![1, 7, 8]);
    }

    #[tokio::test]
    async fn test_register_target_conflict() {
        let (handler, _, _) = handler(true);
        handler
            .handle_register_node(info(1, "storage01", NodeType::Storage))
            .await;
        handler
            .handle_register_node(info(2, "storage02", NodeType::Storage))
            .await;

        handler.handle_register_target(3, NumNodeId(1)).unwrap();
        assert!(matches!(
            handler.handle_register_target(3, NumNodeId(2)),
            Err(BeegfsError::Exists(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_reports_targets_online() {
        let (handler, _, topology) = handler(true);
        handler
            .handle_register_node(info(1, "storage01", NodeType::Storage))
            .await;
        handler.handle_register_target(5, NumNodeId(1)).unwrap();
        assert_eq!(
            topology.target_states.get_state(5).unwrap().reachability,
            ReachabilityState::POffline
        );

        let outcome = handler
            .handle_heartbeat(info(1, "storage01", NodeType::Storage))
            .await;
        assert_eq!(outcome, AddOutcome::Updated);
        assert_eq!(
            topology.target_states.get_state(5).unwrap().reachability,
            ReachabilityState::Online
        );
    }

    #[tokio::test]
    async fn test_remove_node_unmaps_targets() {
        let (handler, _, topology) = handler(true);
        handler
            .handle_register_node(info(1, "storage01", NodeType::Storage))
            .await;
        handler.handle_register_target(5, NumNodeId(1)).unwrap();

        assert!(handler.handle_remove_node(NodeType::Storage, NumNodeId(1)).await);
        assert!(!topology.target_mapper.target_exists(5));
        assert!(topology.target_states.get_state(5).is_none());
        assert!(!handler.handle_remove_node(NodeType::Storage, NumNodeId(1)).await);
    }
}
