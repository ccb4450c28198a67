//! Registry of known nodes of one type
//!
//! Every daemon keeps one `NodeStore` per node type. Entries are shared as
//! `Arc<Node>` handles: a handle stays valid after the node was removed from
//! the store, it merely stops being reachable through lookups.

use beegfs_core::{BeegfsError, NicCapabilities, NodeType, NumNodeId, Result, TargetId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::node::{Node, NodeHandle};
use crate::target_mapper::TargetMapper;

/// Outstanding handles to a single node above which `reference` logs a leak warning
pub const REF_COUNT_WARN_THRESHOLD: usize = 1000;

/// Result of [`NodeStore::add_or_update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Updated,
    Rejected,
}

/// Delta applied by [`NodeStore::sync_from_authoritative_list`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncNodesResult {
    pub added: Vec<NumNodeId>,
    pub removed: Vec<NumNodeId>,
}

impl SyncNodesResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A change applied during an authoritative sync, reported to hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeChange {
    Added(NumNodeId),
    Removed(NumNodeId),
}

pub struct NodeStore {
    store_type: NodeType,
    nodes: RwLock<BTreeMap<NumNodeId, NodeHandle>>,
    local_node: RwLock<Option<NodeHandle>>,
    /// true while the store is non-empty
    populated: watch::Sender<bool>,
}

impl NodeStore {
    pub fn new(store_type: NodeType) -> Self {
        let (populated, _) = watch::channel(false);
        Self {
            store_type,
            nodes: RwLock::new(BTreeMap::new()),
            local_node: RwLock::new(None),
            populated,
        }
    }

    pub fn store_type(&self) -> NodeType {
        self.store_type
    }

    /// Register the node this daemon runs as. It is listed like any other
    /// node but can't be replaced or removed through the store.
    pub fn set_local_node(&self, mut node: Node) -> NodeHandle {
        node.set_node_type(self.store_type);
        node.set_active(true);
        let handle = Arc::new(node);

        self.nodes.write().insert(handle.num_id(), handle.clone());
        *self.local_node.write() = Some(handle.clone());
        self.populated.send_replace(true);

        handle
    }

    pub fn local_node(&self) -> Option<NodeHandle> {
        self.local_node.read().clone()
    }

    fn local_node_id(&self) -> Option<NumNodeId> {
        self.local_node.read().as_ref().map(|n| n.num_id())
    }

    /// Insert a new node or refresh a known one
    pub fn add_or_update(&self, mut node: Node) -> AddOutcome {
        let num_id = node.num_id();

        if !num_id.is_valid() {
            error!(
                node = %node.string_id(),
                node_type = %self.store_type,
                "Refusing node without numeric ID"
            );
            return AddOutcome::Rejected;
        }

        if self.local_node_id() == Some(num_id) {
            debug!(node_id = %num_id, "Ignoring update for local node");
            return AddOutcome::Rejected;
        }

        let mut nodes = self.nodes.write();

        if let Some(existing) = nodes.get(&num_id) {
            if existing.string_id() != node.string_id() {
                error!(
                    node_id = %num_id,
                    existing = %existing.string_id(),
                    rejected = %node.string_id(),
                    node_type = %self.store_type,
                    "Numeric ID collision, keeping existing node"
                );
                return AddOutcome::Rejected;
            }

            existing.update_last_heartbeat();
            existing.update_interfaces(node.port_udp(), node.port_tcp(), &node.nics());
            return AddOutcome::Updated;
        }

        if let Some(other) = nodes.values().find(|n| n.string_id() == node.string_id()) {
            error!(
                node = %node.string_id(),
                registered_id = %other.num_id(),
                rejected_id = %num_id,
                node_type = %self.store_type,
                "String ID already registered under another numeric ID"
            );
            return AddOutcome::Rejected;
        }

        node.set_node_type(self.store_type);
        node.set_active(true);
        node.update_last_heartbeat();
        nodes.insert(num_id, Arc::new(node));
        drop(nodes);

        self.populated.send_replace(true);
        debug!(node_id = %num_id, node_type = %self.store_type, "Node added to store");

        AddOutcome::Added
    }

    /// Shared handle to a node, released when dropped
    pub fn reference(&self, id: NumNodeId) -> Option<NodeHandle> {
        let node = self.nodes.read().get(&id)?.clone();

        let refs = Arc::strong_count(&node);
        if refs > REF_COUNT_WARN_THRESHOLD {
            warn!(
                node = %node.typed_id(),
                refs,
                "Unusually many references to node, possible leak"
            );
        }

        Some(node)
    }

    pub fn reference_by_string_id(&self, string_id: &str) -> Option<NodeHandle> {
        self.nodes
            .read()
            .values()
            .find(|n| n.string_id() == string_id)
            .cloned()
    }

    pub fn num_id_for_string_id(&self, string_id: &str) -> Option<NumNodeId> {
        self.reference_by_string_id(string_id).map(|n| n.num_id())
    }

    pub fn reference_first_node(&self) -> Option<NodeHandle> {
        self.nodes.read().values().next().cloned()
    }

    pub fn reference_next_node(&self, after: NumNodeId) -> Option<NodeHandle> {
        self.nodes
            .read()
            .range((Bound::Excluded(after), Bound::Unbounded))
            .next()
            .map(|(_, node)| node.clone())
    }

    pub fn reference_all_nodes(&self) -> Vec<NodeHandle> {
        self.nodes.read().values().cloned().collect()
    }

    /// Node whose target `target_id` is mapped to
    pub fn reference_node_by_target_id(
        &self,
        target_id: TargetId,
        mapper: &TargetMapper,
    ) -> Result<NodeHandle> {
        let node_id = mapper
            .get_node_id(target_id)
            .ok_or(BeegfsError::UnknownTarget(target_id))?;

        self.reference(node_id)
            .ok_or(BeegfsError::UnknownNode(node_id))
    }

    /// Iterate without holding the lock between steps; entries added or
    /// removed concurrently may or may not be seen
    pub fn iter(&self) -> NodeIter<'_> {
        NodeIter {
            store: self,
            last: None,
            done: false,
        }
    }

    pub fn node_ids(&self) -> Vec<NumNodeId> {
        self.nodes.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn is_node_active(&self, id: NumNodeId) -> bool {
        self.nodes
            .read()
            .get(&id)
            .map(|n| n.is_active())
            .unwrap_or(false)
    }

    /// Remove a node; the local node is never removed
    pub fn remove(&self, id: NumNodeId) -> bool {
        if self.local_node_id() == Some(id) {
            warn!(node_id = %id, "Refusing to remove local node");
            return false;
        }

        let mut nodes = self.nodes.write();
        let removed = nodes.remove(&id);
        let now_empty = nodes.is_empty();
        drop(nodes);

        match removed {
            Some(node) => {
                node.set_active(false);
                if now_empty {
                    self.populated.send_replace(false);
                }
                debug!(node = %node.typed_id(), "Node removed from store");
                true
            }
            None => false,
        }
    }

    /// Numeric ID for a registering node. A known string ID keeps its ID.
    pub fn generate_num_id(&self, string_id: &str) -> Option<NumNodeId> {
        let nodes = self.nodes.read();

        if let Some(existing) = nodes.values().find(|n| n.string_id() == string_id) {
            return Some(existing.num_id());
        }

        let max = nodes.keys().next_back().map(|id| id.value()).unwrap_or(0);
        if max < u32::MAX {
            return Some(NumNodeId(max + 1));
        }

        (1..u32::MAX)
            .map(NumNodeId)
            .find(|id| !nodes.contains_key(id))
    }

    /// Wait until at least one node is known
    pub async fn wait_for_first_node(&self, timeout: Duration) -> bool {
        let mut rx = self.populated.subscribe();
        let populated = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|populated| *populated)).await,
            Ok(Ok(_))
        );
        populated
    }

    /// Make the store match `master`, which is authoritative
    pub fn sync_from_authoritative_list(
        &self,
        master: Vec<Node>,
        local_caps: NicCapabilities,
    ) -> SyncNodesResult {
        self.sync_from_authoritative_list_with(master, local_caps, |_| {})
    }

    /// Like [`sync_from_authoritative_list`](Self::sync_from_authoritative_list),
    /// calling `on_change` for every applied change outside the store lock
    pub fn sync_from_authoritative_list_with<F>(
        &self,
        mut master: Vec<Node>,
        local_caps: NicCapabilities,
        mut on_change: F,
    ) -> SyncNodesResult
    where
        F: FnMut(NodeChange),
    {
        master.sort_by_key(|n| n.num_id());
        master.dedup_by_key(|n| n.num_id());

        let local_id = self.local_node_id();

        // Phase 1: compute the delta under the lock
        let to_remove = {
            let nodes = self.nodes.write();
            let local_ids: Vec<NumNodeId> = nodes.keys().copied().collect();
            let master_ids: Vec<NumNodeId> = master.iter().map(|n| n.num_id()).collect();
            let (_, removed) = merge_join(&local_ids, &master_ids);
            removed
                .into_iter()
                .filter(|id| Some(*id) != local_id)
                .collect::<Vec<_>>()
        };

        // Phase 2: apply without holding the lock. Removals go first so a node
        // that re-registered under a new numeric ID frees its string ID.
        let mut result = SyncNodesResult::default();

        for num_id in to_remove {
            if self.remove(num_id) {
                result.removed.push(num_id);
                on_change(NodeChange::Removed(num_id));
            }
        }

        for node in master {
            let num_id = node.num_id();
            if Some(num_id) == local_id {
                continue;
            }

            node.conn_pool().set_local_nic_caps(local_caps);

            match self.add_or_update(node) {
                AddOutcome::Added => {
                    result.added.push(num_id);
                    on_change(NodeChange::Added(num_id));
                }
                AddOutcome::Updated => {
                    if let Some(existing) = self.reference(num_id) {
                        existing.conn_pool().set_local_nic_caps(local_caps);
                    }
                }
                AddOutcome::Rejected => {}
            }
        }

        result
    }
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("store_type", &self.store_type)
            .field("nodes", &self.node_ids())
            .finish()
    }
}

/// Merge-join two ascending ID lists. Returns (only in master, only local).
pub fn merge_join(
    local: &[NumNodeId],
    master: &[NumNodeId],
) -> (Vec<NumNodeId>, Vec<NumNodeId>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut l = local.iter().peekable();
    let mut m = master.iter().peekable();

    loop {
        match (l.peek(), m.peek()) {
            (Some(&&lid), Some(&&mid)) => {
                if lid < mid {
                    removed.push(lid);
                    l.next();
                } else if mid < lid {
                    added.push(mid);
                    m.next();
                } else {
                    l.next();
                    m.next();
                }
            }
            (Some(&&lid), None) => {
                removed.push(lid);
                l.next();
            }
            (None, Some(&&mid)) => {
                added.push(mid);
                m.next();
            }
            (None, None) => break,
        }
    }

    (added, removed)
}

/// Lazy iterator over a [`NodeStore`], see [`NodeStore::iter`]
pub struct NodeIter<'a> {
    store: &'a NodeStore,
    last: Option<NumNodeId>,
    done: bool,
}

impl Iterator for NodeIter<'_> {
    type Item = NodeHandle;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let next = match self.last {
            None => self.store.reference_first_node(),
            Some(last) => self.store.reference_next_node(last),
        };

        match &next {
            Some(node) => self.last = Some(node.num_id()),
            None => self.done = true,
        }

        next
    }
}
