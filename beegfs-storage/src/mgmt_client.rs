//! Client for the management daemon
//!
//! The trait is the seam the syncer and the daemon talk through; tests swap
//! in a fake. [`TcpMgmtClient`] speaks the message protocol to a real mgmtd.

use async_trait::async_trait;
use beegfs_core::{
    request_response, BeegfsError, BuddyGroupLists, ConsistencyState, MessageType,
    MessagingConfig, NetMessage, NodeInfo, NodeType, NumNodeId, Result, TargetId,
    TargetStateLists,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::{debug, instrument};

use beegfs_core::msg::unexpected;

/// Requests the storage daemon sends to the management daemon
#[async_trait]
pub trait MgmtClient: Send + Sync {
    /// Nodes of one type and, for meta nodes, the root node
    async fn get_nodes(&self, node_type: NodeType) -> Result<(Vec<NodeInfo>, Option<NumNodeId>)>;

    async fn get_target_mappings(&self) -> Result<BTreeMap<TargetId, NumNodeId>>;

    async fn get_states_and_buddy_groups(
        &self,
        node_type: NodeType,
    ) -> Result<(TargetStateLists, BuddyGroupLists)>;

    async fn get_mirror_buddy_groups(&self, node_type: NodeType) -> Result<BuddyGroupLists>;

    /// Returns the assigned numeric ID; 0 means the registration was refused
    async fn register_node(&self, node: NodeInfo) -> Result<NumNodeId>;

    async fn register_target(&self, target_id: TargetId, node_id: NumNodeId) -> Result<TargetId>;

    async fn heartbeat(&self, node: NodeInfo) -> Result<bool>;

    async fn set_target_consistency_states(
        &self,
        target_ids: Vec<TargetId>,
        states: Vec<ConsistencyState>,
        set_online: bool,
    ) -> Result<()>;
}

/// [`MgmtClient`] over the TCP message transport
#[derive(Debug, Clone)]
pub struct TcpMgmtClient {
    addr: SocketAddr,
    config: MessagingConfig,
}

impl TcpMgmtClient {
    pub fn new(addr: SocketAddr, config: MessagingConfig) -> Self {
        Self { addr, config }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn request(&self, msg: NetMessage) -> Result<NetMessage> {
        let expected = msg
            .response_type()
            .ok_or_else(|| BeegfsError::Internal(format!("{} is not a request", msg.msg_type())))?;
        debug!(addr = %self.addr, msg_type = %msg.msg_type(), "Sending request to mgmtd");
        request_response(self.addr, &msg, expected, &self.config).await
    }
}

#[async_trait]
impl MgmtClient for TcpMgmtClient {
    #[instrument(skip(self))]
    async fn get_nodes(&self, node_type: NodeType) -> Result<(Vec<NodeInfo>, Option<NumNodeId>)> {
        match self.request(NetMessage::GetNodes { node_type }).await? {
            NetMessage::GetNodesResp { nodes, root_node } => Ok((nodes, root_node)),
            other => Err(unexpected(MessageType::GetNodesResp, other.msg_type())),
        }
    }

    #[instrument(skip(self))]
    async fn get_target_mappings(&self) -> Result<BTreeMap<TargetId, NumNodeId>> {
        match self.request(NetMessage::GetTargetMappings).await? {
            NetMessage::GetTargetMappingsResp { mappings } => Ok(mappings.into_iter().collect()),
            other => Err(unexpected(MessageType::GetTargetMappingsResp, other.msg_type())),
        }
    }

    #[instrument(skip(self))]
    async fn get_states_and_buddy_groups(
        &self,
        node_type: NodeType,
    ) -> Result<(TargetStateLists, BuddyGroupLists)> {
        match self
            .request(NetMessage::GetStatesAndBuddyGroups { node_type })
            .await?
        {
            NetMessage::GetStatesAndBuddyGroupsResp { states, groups } => Ok((states, groups)),
            other => Err(unexpected(
                MessageType::GetStatesAndBuddyGroupsResp,
                other.msg_type(),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn get_mirror_buddy_groups(&self, node_type: NodeType) -> Result<BuddyGroupLists> {
        match self
            .request(NetMessage::GetMirrorBuddyGroups { node_type })
            .await?
        {
            NetMessage::GetMirrorBuddyGroupsResp { groups } => Ok(groups),
            other => Err(unexpected(
                MessageType::GetMirrorBuddyGroupsResp,
                other.msg_type(),
            )),
        }
    }

    #[instrument(skip(self, node), fields(string_id = %node.string_id))]
    async fn register_node(&self, node: NodeInfo) -> Result<NumNodeId> {
        match self.request(NetMessage::RegisterNode { node }).await? {
            NetMessage::RegisterNodeResp { num_id } => Ok(num_id),
            other => Err(unexpected(MessageType::RegisterNodeResp, other.msg_type())),
        }
    }

    #[instrument(skip(self))]
    async fn register_target(&self, target_id: TargetId, node_id: NumNodeId) -> Result<TargetId> {
        match self
            .request(NetMessage::RegisterTarget { target_id, node_id })
            .await?
        {
            NetMessage::RegisterTargetResp { result } => result,
            other => Err(unexpected(MessageType::RegisterTargetResp, other.msg_type())),
        }
    }

    async fn heartbeat(&self, node: NodeInfo) -> Result<bool> {
        match self.request(NetMessage::Heartbeat { node }).await? {
            NetMessage::HeartbeatResp { accepted } => Ok(accepted),
            other => Err(unexpected(MessageType::HeartbeatResp, other.msg_type())),
        }
    }

    #[instrument(skip(self))]
    async fn set_target_consistency_states(
        &self,
        target_ids: Vec<TargetId>,
        states: Vec<ConsistencyState>,
        set_online: bool,
    ) -> Result<()> {
        match self
            .request(NetMessage::SetTargetConsistencyStates {
                node_type: NodeType::Storage,
                target_ids,
                states,
                set_online,
            })
            .await?
        {
            NetMessage::SetTargetConsistencyStatesResp { result } => result,
            other => Err(unexpected(
                MessageType::SetTargetConsistencyStatesResp,
                other.msg_type(),
            )),
        }
    }
}
