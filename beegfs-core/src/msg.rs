//! Request/response messages exchanged between daemons
//!
//! Every request has exactly one response type. Callers validate the response
//! tag with [`NetMessage::expect_type`] before destructuring it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BeegfsError, Result};
use crate::types::{
    ConsistencyState, GroupId, NicAddress, NodeType, NumNodeId, ReachabilityState, TargetId,
};

/// Node description as sent over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub num_id: NumNodeId,
    pub string_id: String,
    pub node_type: NodeType,
    pub port_udp: u16,
    pub port_tcp: u16,
    pub nics: Vec<NicAddress>,
}

/// Target states as three parallel lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStateLists {
    pub target_ids: Vec<TargetId>,
    pub reachability: Vec<ReachabilityState>,
    pub consistency: Vec<ConsistencyState>,
}

/// Buddy groups as three parallel lists; index i describes group i
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyGroupLists {
    pub group_ids: Vec<GroupId>,
    pub primary_targets: Vec<TargetId>,
    pub secondary_targets: Vec<TargetId>,
}

/// Directory entry kind in a chunk directory listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Dir,
    File,
}

/// One page of an incremental chunk directory listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDirPage {
    pub names: Vec<String>,
    pub kinds: Vec<EntryKind>,
    pub new_offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    RegisterNode,
    RegisterNodeResp,
    Heartbeat,
    HeartbeatResp,
    GetNodes,
    GetNodesResp,
    GetTargetMappings,
    GetTargetMappingsResp,
    GetTargetStates,
    GetTargetStatesResp,
    GetMirrorBuddyGroups,
    GetMirrorBuddyGroupsResp,
    GetStatesAndBuddyGroups,
    GetStatesAndBuddyGroupsResp,
    RegisterTarget,
    RegisterTargetResp,
    SetTargetConsistencyStates,
    SetTargetConsistencyStatesResp,
    ListChunkDirIncremental,
    ListChunkDirIncrementalResp,
    RmChunkPaths,
    RmChunkPathsResp,
    ResyncLocalFile,
    ResyncLocalFileResp,
    StorageResyncStarted,
    StorageResyncStartedResp,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetMessage {
    // ===== Registration =====
    RegisterNode {
        node: NodeInfo,
    },
    RegisterNodeResp {
        /// Assigned numeric ID, 0 if the registration was rejected
        num_id: NumNodeId,
    },
    Heartbeat {
        node: NodeInfo,
    },
    HeartbeatResp {
        accepted: bool,
    },
    RegisterTarget {
        target_id: TargetId,
        node_id: NumNodeId,
    },
    RegisterTargetResp {
        result: std::result::Result<TargetId, BeegfsError>,
    },

    // ===== Topology downloads =====
    GetNodes {
        node_type: NodeType,
    },
    GetNodesResp {
        nodes: Vec<NodeInfo>,
        root_node: Option<NumNodeId>,
    },
    GetTargetMappings,
    GetTargetMappingsResp {
        mappings: Vec<(TargetId, NumNodeId)>,
    },
    GetTargetStates {
        node_type: NodeType,
    },
    GetTargetStatesResp {
        states: TargetStateLists,
    },
    GetMirrorBuddyGroups {
        node_type: NodeType,
    },
    GetMirrorBuddyGroupsResp {
        groups: BuddyGroupLists,
    },
    GetStatesAndBuddyGroups {
        node_type: NodeType,
    },
    GetStatesAndBuddyGroupsResp {
        states: TargetStateLists,
        groups: BuddyGroupLists,
    },
    SetTargetConsistencyStates {
        node_type: NodeType,
        target_ids: Vec<TargetId>,
        states: Vec<ConsistencyState>,
        set_online: bool,
    },
    SetTargetConsistencyStatesResp {
        result: std::result::Result<(), BeegfsError>,
    },

    // ===== Buddy resync =====
    ListChunkDirIncremental {
        target_id: TargetId,
        rel_path: String,
        offset: i64,
        max_entries: u32,
    },
    ListChunkDirIncrementalResp {
        result: std::result::Result<ChunkDirPage, BeegfsError>,
    },
    RmChunkPaths {
        target_id: TargetId,
        paths: Vec<String>,
    },
    RmChunkPathsResp {
        failed_paths: Vec<String>,
    },
    ResyncLocalFile {
        target_id: TargetId,
        rel_path: String,
        offset: u64,
        data: Bytes,
        last: bool,
    },
    ResyncLocalFileResp {
        result: std::result::Result<(), BeegfsError>,
    },
    StorageResyncStarted {
        target_id: TargetId,
    },
    StorageResyncStartedResp {
        result: std::result::Result<(), BeegfsError>,
    },

    /// Sent by a server that could not handle a request at all
    Error {
        error: BeegfsError,
    },
}

impl NetMessage {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::RegisterNode { .. } => MessageType::RegisterNode,
            Self::RegisterNodeResp { .. } => MessageType::RegisterNodeResp,
            Self::Heartbeat { .. } => MessageType::Heartbeat,
            Self::HeartbeatResp { .. } => MessageType::HeartbeatResp,
            Self::RegisterTarget { .. } => MessageType::RegisterTarget,
            Self::RegisterTargetResp { .. } => MessageType::RegisterTargetResp,
            Self::GetNodes { .. } => MessageType::GetNodes,
            Self::GetNodesResp { .. } => MessageType::GetNodesResp,
            Self::GetTargetMappings => MessageType::GetTargetMappings,
            Self::GetTargetMappingsResp { .. } => MessageType::GetTargetMappingsResp,
            Self::GetTargetStates { .. } => MessageType::GetTargetStates,
            Self::GetTargetStatesResp { .. } => MessageType::GetTargetStatesResp,
            Self::GetMirrorBuddyGroups { .. } => MessageType::GetMirrorBuddyGroups,
            Self::GetMirrorBuddyGroupsResp { .. } => MessageType::GetMirrorBuddyGroupsResp,
            Self::GetStatesAndBuddyGroups { .. } => MessageType::GetStatesAndBuddyGroups,
            Self::GetStatesAndBuddyGroupsResp { .. } => MessageType::GetStatesAndBuddyGroupsResp,
            Self::SetTargetConsistencyStates { .. } => MessageType::SetTargetConsistencyStates,
            Self::SetTargetConsistencyStatesResp { .. } => {
                MessageType::SetTargetConsistencyStatesResp
            }
            Self::ListChunkDirIncremental { .. } => MessageType::ListChunkDirIncremental,
            Self::ListChunkDirIncrementalResp { .. } => MessageType::ListChunkDirIncrementalResp,
            Self::RmChunkPaths { .. } => MessageType::RmChunkPaths,
            Self::RmChunkPathsResp { .. } => MessageType::RmChunkPathsResp,
            Self::ResyncLocalFile { .. } => MessageType::ResyncLocalFile,
            Self::ResyncLocalFileResp { .. } => MessageType::ResyncLocalFileResp,
            Self::StorageResyncStarted { .. } => MessageType::StorageResyncStarted,
            Self::StorageResyncStartedResp { .. } => MessageType::StorageResyncStartedResp,
            Self::Error { .. } => MessageType::Error,
        }
    }

    /// Check the response tag. An `Error` message is turned into its error.
    pub fn expect_type(self, expected: MessageType) -> Result<NetMessage> {
        let actual = self.msg_type();
        if actual == expected {
            return Ok(self);
        }

        match self {
            Self::Error { error } => Err(error),
            _ => Err(unexpected(expected, actual)),
        }
    }

    /// Response type a request must be answered with
    pub fn response_type(&self) -> Option<MessageType> {
        let resp = match self.msg_type() {
            MessageType::RegisterNode => MessageType::RegisterNodeResp,
            MessageType::Heartbeat => MessageType::HeartbeatResp,
            MessageType::RegisterTarget => MessageType::RegisterTargetResp,
            MessageType::GetNodes => MessageType::GetNodesResp,
            MessageType::GetTargetMappings => MessageType::GetTargetMappingsResp,
            MessageType::GetTargetStates => MessageType::GetTargetStatesResp,
            MessageType::GetMirrorBuddyGroups => MessageType::GetMirrorBuddyGroupsResp,
            MessageType::GetStatesAndBuddyGroups => MessageType::GetStatesAndBuddyGroupsResp,
            MessageType::SetTargetConsistencyStates => {
                MessageType::SetTargetConsistencyStatesResp
            }
            MessageType::ListChunkDirIncremental => MessageType::ListChunkDirIncrementalResp,
            MessageType::RmChunkPaths => MessageType::RmChunkPathsResp,
            MessageType::ResyncLocalFile => MessageType::ResyncLocalFileResp,
            MessageType::StorageResyncStarted => MessageType::StorageResyncStartedResp,
            _ => return None,
        };
        Some(resp)
    }
}

/// Error for a response whose tag does not match the request
pub fn unexpected(expected: MessageType, actual: MessageType) -> BeegfsError {
    BeegfsError::UnexpectedResponse {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_type_accepts_matching_tag() {
        let msg = NetMessage::HeartbeatResp { accepted: true };
        assert!(msg.expect_type(MessageType::HeartbeatResp).is_ok());
    }

    #[test]
    fn test_expect_type_rejects_other_tag() {
        let msg = NetMessage::HeartbeatResp { accepted: true };
        let err = msg.expect_type(MessageType::GetNodesResp).unwrap_err();
        assert!(matches!(err, BeegfsError::UnexpectedResponse { .. }));
    }

    #[test]
    fn test_expect_type_unwraps_error_message() {
        let msg = NetMessage::Error {
            error: BeegfsError::UnknownTarget(4),
        };
        let err = msg.expect_type(MessageType::RmChunkPathsResp).unwrap_err();
        assert_eq!(err, BeegfsError::UnknownTarget(4));
    }

    #[test]
    fn test_response_type_pairs() {
        let req = NetMessage::ListChunkDirIncremental {
            target_id: 1,
            rel_path: "a/b".to_string(),
            offset: 0,
            max_entries: 50,
        };
        assert_eq!(
            req.response_type(),
            Some(MessageType::ListChunkDirIncrementalResp)
        );
        assert_eq!(NetMessage::HeartbeatResp { accepted: true }.response_type(), None);
    }

    #[test]
    fn test_json_encoding_keeps_results() {
        let msg = NetMessage::RegisterTargetResp {
            result: Err(BeegfsError::UnknownNode(NumNodeId(5))),
        };
        let line = serde_json::to_string(&msg).unwrap();
        let decoded: NetMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded, msg);
    }
}
