//! BeeGFS Topology Registries
//!
//! In-memory view of the cluster that every daemon keeps: which nodes exist,
//! which node owns which target, what state each target is in, and how
//! targets pair up into mirror buddy groups. The management daemon is the
//! authority; everybody else syncs these registries from it.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Topology                          │
//! │                                                           │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌───────────┐  │
//! │  │   mgmt    │ │   meta    │ │  storage  │ │  client   │  │
//! │  │ NodeStore │ │ NodeStore │ │ NodeStore │ │ NodeStore │  │
//! │  └───────────┘ └───────────┘ └───────────┘ └───────────┘  │
//! │                                                           │
//! │  ┌──────────────┐  attach  ┌──────────────────┐           │
//! │  │ TargetMapper │─────────▶│ TargetStateStore │           │
//! │  └──────────────┘          └──────────────────┘           │
//! │         ▲ attach                                          │
//! │  ┌──────────────────────┐  ┌──────────────────────┐       │
//! │  │ storage buddy groups │  │  meta buddy groups   │       │
//! │  └──────────────────────┘  └──────────────────────┘       │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod buddy_groups;
pub mod node;
pub mod node_store;
pub mod target_mapper;
pub mod target_states;

pub use buddy_groups::{BuddyState, MirrorBuddyGroup, MirrorBuddyGroupMapper};
pub use node::{ConnectionPool, Node, NodeHandle};
pub use node_store::{
    merge_join, AddOutcome, NodeChange, NodeIter, NodeStore, SyncNodesResult,
    REF_COUNT_WARN_THRESHOLD,
};
pub use target_mapper::TargetMapper;
pub use target_states::{TargetStateConfig, TargetStateStore, MIN_OFFLINE_TIMEOUT};

use beegfs_core::{GroupId, NodeType, NumNodeId, Result, TargetId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// All registries of one daemon, wired together
#[derive(Debug)]
pub struct Topology {
    pub mgmt_nodes: Arc<NodeStore>,
    pub meta_nodes: Arc<NodeStore>,
    pub storage_nodes: Arc<NodeStore>,
    pub client_nodes: Arc<NodeStore>,
    pub target_mapper: Arc<TargetMapper>,
    pub target_states: Arc<TargetStateStore>,
    pub storage_buddy_groups: Arc<MirrorBuddyGroupMapper>,
    pub meta_buddy_groups: Arc<MirrorBuddyGroupMapper>,
}

impl Topology {
    /// Fails if the state store rejects `state_config`
    pub fn new(state_config: TargetStateConfig) -> Result<Self> {
        let target_states = Arc::new(TargetStateStore::new(state_config)?);

        let target_mapper = Arc::new(TargetMapper::new());
        target_mapper.attach_state_store(target_states.clone());

        let storage_buddy_groups = Arc::new(MirrorBuddyGroupMapper::new());
        storage_buddy_groups.attach_target_mapper(target_mapper.clone());

        Ok(Self {
            mgmt_nodes: Arc::new(NodeStore::new(NodeType::Mgmt)),
            meta_nodes: Arc::new(NodeStore::new(NodeType::Meta)),
            storage_nodes: Arc::new(NodeStore::new(NodeType::Storage)),
            client_nodes: Arc::new(NodeStore::new(NodeType::Client)),
            target_mapper,
            target_states,
            storage_buddy_groups,
            meta_buddy_groups: Arc::new(MirrorBuddyGroupMapper::new()),
        })
    }

    pub fn node_store(&self, node_type: NodeType) -> &Arc<NodeStore> {
        match node_type {
            NodeType::Mgmt => &self.mgmt_nodes,
            NodeType::Meta => &self.meta_nodes,
            NodeType::Storage => &self.storage_nodes,
            NodeType::Client => &self.client_nodes,
        }
    }

    /// Buddy groups of meta nodes or of storage targets
    pub fn buddy_groups(&self, node_type: NodeType) -> &Arc<MirrorBuddyGroupMapper> {
        match node_type {
            NodeType::Meta => &self.meta_buddy_groups,
            _ => &self.storage_buddy_groups,
        }
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            mgmt_nodes: self.mgmt_nodes.node_ids(),
            meta_nodes: self.meta_nodes.node_ids(),
            storage_nodes: self.storage_nodes.node_ids(),
            targets: self.target_mapper.mapping(),
            storage_buddy_groups: self.storage_buddy_groups.groups(),
            meta_buddy_groups: self.meta_buddy_groups.groups(),
        }
    }
}

/// Point-in-time copy of the structural parts of a [`Topology`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub mgmt_nodes: Vec<NumNodeId>,
    pub meta_nodes: Vec<NumNodeId>,
    pub storage_nodes: Vec<NumNodeId>,
    pub targets: BTreeMap<TargetId, NumNodeId>,
    pub storage_buddy_groups: BTreeMap<GroupId, MirrorBuddyGroup>,
    pub meta_buddy_groups: BTreeMap<GroupId, MirrorBuddyGroup>,
}

impl TopologySnapshot {
    pub fn nodes(&self, node_type: NodeType) -> &[NumNodeId] {
        match node_type {
            NodeType::Mgmt => &self.mgmt_nodes,
            NodeType::Meta => &self.meta_nodes,
            NodeType::Storage => &self.storage_nodes,
            NodeType::Client => &[],
        }
    }
}
