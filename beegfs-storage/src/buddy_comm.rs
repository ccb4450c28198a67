//! Requests a primary sends to the storage node holding its secondary

use async_trait::async_trait;
use beegfs_core::{
    request_response, BeegfsError, ChunkDirPage, ConsistencyState, MessageType, MessagingConfig,
    NetMessage, NodeType, Result, TargetId,
};
use beegfs_core::msg::unexpected;
use beegfs_topology::Node;
use bytes::Bytes;
use std::net::SocketAddr;

#[async_trait]
pub trait BuddyCommClient: Send + Sync {
    /// Announce a resync to the secondary
    async fn storage_resync_started(&self, node: &Node, target_id: TargetId) -> Result<()>;

    async fn list_chunk_dir_incremental(
        &self,
        node: &Node,
        target_id: TargetId,
        rel_path: &str,
        offset: i64,
        max_entries: u32,
    ) -> Result<ChunkDirPage>;

    /// Returns the paths that could not be removed
    async fn rm_chunk_paths(
        &self,
        node: &Node,
        target_id: TargetId,
        paths: Vec<String>,
    ) -> Result<Vec<String>>;

    async fn resync_local_file(
        &self,
        node: &Node,
        target_id: TargetId,
        rel_path: &str,
        offset: u64,
        data: Bytes,
        last: bool,
    ) -> Result<()>;

    async fn set_target_consistency_state(
        &self,
        node: &Node,
        target_id: TargetId,
        state: ConsistencyState,
    ) -> Result<()>;
}

/// [`BuddyCommClient`] over the TCP message transport
#[derive(Debug, Clone, Default)]
pub struct TcpBuddyCommClient {
    config: MessagingConfig,
}

impl TcpBuddyCommClient {
    pub fn new(config: MessagingConfig) -> Self {
        Self { config }
    }

    fn addr(node: &Node) -> Result<SocketAddr> {
        node.socket_addr().ok_or_else(|| {
            BeegfsError::Communication(format!("no usable interface for {}", node.typed_id()))
        })
    }

    async fn request(&self, node: &Node, msg: NetMessage) -> Result<NetMessage> {
        let expected = msg
            .response_type()
            .ok_or_else(|| BeegfsError::Internal(format!("{} is not a request", msg.msg_type())))?;
        request_response(Self::addr(node)?, &msg, expected, &self.config).await
    }
}

#[async_trait]
impl BuddyCommClient for TcpBuddyCommClient {
    async fn storage_resync_started(&self, node: &Node, target_id: TargetId) -> Result<()> {
        match self
            .request(node, NetMessage::StorageResyncStarted { target_id })
            .await?
        {
            NetMessage::StorageResyncStartedResp { result } => result,
            other => Err(unexpected(
                MessageType::StorageResyncStartedResp,
                other.msg_type(),
            )),
        }
    }

    async fn list_chunk_dir_incremental(
        &self,
        node: &Node,
        target_id: TargetId,
        rel_path: &str,
        offset: i64,
        max_entries: u32,
    ) -> Result<ChunkDirPage> {
        let msg = NetMessage::ListChunkDirIncremental {
            target_id,
            rel_path: rel_path.to_string(),
            offset,
            max_entries,
        };
        match self.request(node, msg).await? {
            NetMessage::ListChunkDirIncrementalResp { result } => result,
            other => Err(unexpected(
                MessageType::ListChunkDirIncrementalResp,
                other.msg_type(),
            )),
        }
    }

    async fn rm_chunk_paths(
        &self,
        node: &Node,
        target_id: TargetId,
        paths: Vec<String>,
    ) -> Result<Vec<String>> {
        match self
            .request(node, NetMessage::RmChunkPaths { target_id, paths })
            .await?
        {
            NetMessage::RmChunkPathsResp { failed_paths } => Ok(failed_paths),
            other => Err(unexpected(MessageType::RmChunkPathsResp, other.msg_type())),
        }
    }

    async fn resync_local_file(
        &self,
        node: &Node,
        target_id: TargetId,
        rel_path: &str,
        offset: u64,
        data: Bytes,
        last: bool,
    ) -> Result<()> {
        let msg = NetMessage::ResyncLocalFile {
            target_id,
            rel_path: rel_path.to_string(),
            offset,
            data,
            last,
        };
        match self.request(node, msg).await? {
            NetMessage::ResyncLocalFileResp { result } => result,
            other => Err(unexpected(MessageType::ResyncLocalFileResp, other.msg_type())),
        }
    }

    async fn set_target_consistency_state(
        &self,
        node: &Node,
        target_id: TargetId,
        state: ConsistencyState,
    ) -> Result<()> {
        let msg = NetMessage::SetTargetConsistencyStates {
            node_type: NodeType::Storage,
            target_ids: vec![target_id],
            states: vec![state],
            set_online: false,
        };
        match self.request(node, msg).await? {
            NetMessage::SetTargetConsistencyStatesResp { result } => result,
            other => Err(unexpected(
                MessageType::SetTargetConsistencyStatesResp,
                other.msg_type(),
            )),
        }
    }
}
