//! Request handling of the management daemon

use async_trait::async_trait;
use beegfs_core::{
    BeegfsError, BuddyGroupLists, MessageHandler, NetMessage, NodeType, TargetStateLists,
};
use beegfs_topology::{AddOutcome, Topology};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::mgmt_states::MgmtTargetStates;
use crate::registration::RegistrationHandler;

pub struct MgmtMessageService {
    topology: Arc<Topology>,
    registration: Arc<RegistrationHandler>,
    states: Arc<MgmtTargetStates>,
}

impl MgmtMessageService {
    pub fn new(
        topology: Arc<Topology>,
        registration: Arc<RegistrationHandler>,
        states: Arc<MgmtTargetStates>,
    ) -> Self {
        Self {
            topology,
            registration,
            states,
        }
    }

    /// Only storage targets have tracked states
    fn target_states(&self, node_type: NodeType) -> TargetStateLists {
        match node_type {
            NodeType::Storage => self.topology.target_states.states_as_lists(),
            _ => TargetStateLists::default(),
        }
    }

    fn buddy_groups(&self, node_type: NodeType) -> BuddyGroupLists {
        match node_type {
            NodeType::Meta | NodeType::Storage => {
                self.topology.buddy_groups(node_type).mapping_as_lists()
            }
            _ => BuddyGroupLists::default(),
        }
    }
}

#[async_trait]
impl MessageHandler for MgmtMessageService {
    async fn handle(&self, peer: SocketAddr, msg: NetMessage) -> NetMessage {
        debug!(%peer, msg_type = %msg.msg_type(), "Handling request");

        match msg {
            NetMessage::RegisterNode { node } => NetMessage::RegisterNodeResp {
                num_id: self.registration.handle_register_node(node).await,
            },

            NetMessage::Heartbeat { node } => {
                let outcome = self.registration.handle_heartbeat(node).await;
                NetMessage::HeartbeatResp {
                    accepted: outcome != AddOutcome::Rejected,
                }
            }

            NetMessage::RegisterTarget { target_id, node_id } => NetMessage::RegisterTargetResp {
                result: self.registration.handle_register_target(target_id, node_id),
            },

            NetMessage::GetNodes { node_type } => {
                let store = self.topology.node_store(node_type);
                let nodes = store.iter().map(|n| n.to_info()).collect();
                // the meta node with the lowest ID holds the root directory
                let root_node = match node_type {
                    NodeType::Meta => store.node_ids().first().copied(),
                    _ => None,
                };
                NetMessage::GetNodesResp { nodes, root_node }
            }

            NetMessage::GetTargetMappings => NetMessage::GetTargetMappingsResp {
                mappings: self.topology.target_mapper.mapping().into_iter().collect(),
            },

            NetMessage::GetTargetStates { node_type } => NetMessage::GetTargetStatesResp {
                states: self.target_states(node_type),
            },

            NetMessage::GetMirrorBuddyGroups { node_type } => {
                NetMessage::GetMirrorBuddyGroupsResp {
                    groups: self.buddy_groups(node_type),
                }
            }

            NetMessage::GetStatesAndBuddyGroups { node_type } => {
                NetMessage::GetStatesAndBuddyGroupsResp {
                    states: self.target_states(node_type),
                    groups: self.buddy_groups(node_type),
                }
            }

            NetMessage::SetTargetConsistencyStates {
                node_type,
                target_ids,
                states,
                set_online,
            } => {
                let result = if node_type == NodeType::Storage {
                    self.states
                        .set_consistency_states(&target_ids, &states, set_online)
                } else {
                    Err(BeegfsError::Inval(format!(
                        "no target states for {} nodes",
                        node_type
                    )))
                };
                NetMessage::SetTargetConsistencyStatesResp { result }
            }

            other => {
                warn!(%peer, msg_type = %other.msg_type(), "Unsupported request");
                NetMessage::Error {
                    error: BeegfsError::Inval(format!(
                        "management daemon does not handle {}",
                        other.msg_type()
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::LoggingNotifier;
    use beegfs_core::{ConsistencyState, NicAddress, NodeInfo, NumNodeId};
    use beegfs_topology::TargetStateConfig;

    fn service() -> (MgmtMessageService, Arc<Topology>) {
        let topology = Arc::new(Topology::new(TargetStateConfig::default()).unwrap());
        let registration = Arc::new(RegistrationHandler::new(
            topology.clone(),
            true,
            Arc::new(LoggingNotifier),
        ));
        let states = Arc::new(MgmtTargetStates::new(
            topology.target_states.clone(),
            topology.storage_buddy_groups.clone(),
        ));
        (
            MgmtMessageService::new(topology.clone(), registration, states),
            topology,
        )
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn storage_info(id: u32) -> NodeInfo {
        NodeInfo {
            num_id: NumNodeId(id),
            string_id: format!("storage{:02}", id),
            node_type: NodeType::Storage,
            port_udp: 8003,
            port_tcp: 8003,
            nics: vec![NicAddress::ethernet("eth0", "127.0.0.1".parse().unwrap())],
        }
    }

    #[tokio::test]
    async fn test_register_and_list_nodes() {
        let (service, _) = service();

        let resp = service
            .handle(peer(), NetMessage::RegisterNode { node: storage_info(0) })
            .await;
        assert_eq!(resp, NetMessage::RegisterNodeResp { num_id: NumNodeId(1) });

        let resp = service
            .handle(peer(), NetMessage::GetNodes { node_type: NodeType::Storage })
            .await;
        match resp {
            NetMessage::GetNodesResp { nodes, root_node } => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].string_id, "storage01");
                assert_eq!(root_node, None);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_states_and_groups() {
        let (service, topology) = service();
        topology.storage_nodes.add_or_update(beegfs_topology::Node::from_info(&storage_info(1)));
        topology.target_mapper.map_target(4, NumNodeId(1));
        topology.target_mapper.map_target(7, NumNodeId(1));
        topology
            .storage_buddy_groups
            .map_mirror_buddy_group(3, 4, 7, false)
            .unwrap();

        let resp = service
            .handle(
                peer(),
                NetMessage::GetStatesAndBuddyGroups {
                    node_type: NodeType::Storage,
                },
            )
            .await;
        match resp {
            NetMessage::GetStatesAndBuddyGroupsResp { states, groups } => {
                assert_eq!(states.target_ids, vec![4, 7]);
                assert_eq!(groups.group_ids, vec![3]);
                assert_eq!(groups.secondary_targets, vec![7]);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_consistency_states() {
        let (service, topology) = service();
        topology.target_mapper.map_target(7, NumNodeId(1));

        let resp = service
            .handle(
                peer(),
                NetMessage::SetTargetConsistencyStates {
                    node_type: NodeType::Storage,
                    target_ids: vec![7],
                    states: vec![ConsistencyState::Bad],
                    set_online: false,
                },
            )
            .await;
        assert_eq!(resp, NetMessage::SetTargetConsistencyStatesResp { result: Ok(()) });
        assert_eq!(
            topology.target_states.get_state(7).unwrap().consistency,
            ConsistencyState::Bad
        );
    }

    #[tokio::test]
    async fn test_unsupported_request() {
        let (service, _) = service();
        let resp = service
            .handle(
                peer(),
                NetMessage::RmChunkPaths {
                    target_id: 1,
                    paths: vec![],
                },
            )
            .await;
        assert!(matches!(
            resp,
            NetMessage::Error {
                error: BeegfsError::Inval(_)
            }
        ));
    }
}
