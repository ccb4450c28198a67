//! Requests served by the storage daemon
//!
//! Most of them arrive on the secondary of a buddy group while its primary
//! runs a resync.

use async_trait::async_trait;
use beegfs_core::{
    BeegfsError, ConsistencyState, MessageHandler, NetMessage, NodeType, Result, TargetId,
};
use beegfs_topology::{AddOutcome, Node, Topology};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::chunk_locks::ChunkLockStore;
use crate::chunk_store::ChunkStore;
use crate::mgmt_client::MgmtClient;
use crate::targets::StorageTargets;

pub struct StorageMessageHandler {
    topology: Arc<Topology>,
    targets: Arc<StorageTargets>,
    chunk_store: Arc<dyn ChunkStore>,
    locks: Arc<ChunkLockStore>,
    mgmt: Arc<dyn MgmtClient>,
}

impl StorageMessageHandler {
    pub fn new(
        topology: Arc<Topology>,
        targets: Arc<StorageTargets>,
        chunk_store: Arc<dyn ChunkStore>,
        locks: Arc<ChunkLockStore>,
        mgmt: Arc<dyn MgmtClient>,
    ) -> Self {
        Self {
            topology,
            targets,
            chunk_store,
            locks,
            mgmt,
        }
    }

    fn check_target(&self, target_id: TargetId) -> Result<()> {
        if self.targets.contains(target_id) {
            Ok(())
        } else {
            Err(BeegfsError::UnknownTarget(target_id))
        }
    }

    /// Returns the paths that could not be removed. Missing paths count as
    /// removed.
    async fn rm_chunk_paths(&self, target_id: TargetId, paths: Vec<String>) -> Vec<String> {
        if self.check_target(target_id).is_err() {
            error!(target_id, "Remove request for unknown target");
            return paths;
        }

        let mut failed = Vec::new();
        for path in paths {
            let _lock = self.locks.lock_chunk(target_id, &path).await;
            match self.chunk_store.remove_path(target_id, &path).await {
                Ok(()) | Err(BeegfsError::PathNotExists(_)) => {}
                Err(e) => {
                    warn!(target_id, path = %path, error = %e, "Unable to remove chunk path");
                    failed.push(path);
                }
            }
        }
        failed
    }

    async fn resync_local_file(
        &self,
        target_id: TargetId,
        rel_path: &str,
        offset: u64,
        data: bytes::Bytes,
        last: bool,
    ) -> Result<()> {
        self.check_target(target_id)?;

        let _lock = self.locks.lock_chunk(target_id, rel_path).await;
        let result = self
            .chunk_store
            .write_chunk(target_id, rel_path, offset, data, last)
            .await;

        if let Err(e) = &result {
            error!(target_id, path = rel_path, error = %e, "Error resyncing chunk");
            self.targets.set_consistency(target_id, ConsistencyState::Bad);
        }
        result
    }

    fn storage_resync_started(&self, target_id: TargetId) -> Result<()> {
        self.check_target(target_id)?;
        self.targets.set_resync_in_progress(target_id, true);
        self.targets
            .set_consistency(target_id, ConsistencyState::NeedsResync);
        info!(target_id, "Buddy resync of local target started");
        Ok(())
    }

    /// Apply states to local targets and report them to mgmtd
    async fn set_consistency_states(
        &self,
        node_type: NodeType,
        target_ids: Vec<TargetId>,
        states: Vec<ConsistencyState>,
    ) -> Result<()> {
        if node_type != NodeType::Storage {
            return Err(BeegfsError::Inval(format!(
                "no target states for {} nodes",
                node_type
            )));
        }
        if target_ids.len() != states.len() {
            return Err(BeegfsError::Inval(format!(
                "{} targets but {} states",
                target_ids.len(),
                states.len()
            )));
        }
        for target_id in &target_ids {
            self.check_target(*target_id)?;
        }

        for (target_id, state) in target_ids.iter().zip(&states) {
            self.targets.set_consistency(*target_id, *state);
            self.targets.set_resync_in_progress(*target_id, false);
            info!(target_id, state = %state, "Local target consistency changed");
        }

        self.mgmt
            .set_target_consistency_states(target_ids, states, false)
            .await
    }

    fn heartbeat(&self, info: beegfs_core::NodeInfo) -> bool {
        if !info.num_id.is_valid() {
            return false;
        }
        let store = self.topology.node_store(info.node_type);
        let outcome = store.add_or_update(Node::from_info(&info));
        if outcome == AddOutcome::Added {
            warn!(node_type = %info.node_type, node_id = %info.num_id, "Node added");
        }
        outcome != AddOutcome::Rejected
    }
}

#[async_trait]
impl MessageHandler for StorageMessageHandler {
    async fn handle(&self, peer: SocketAddr, msg: NetMessage) -> NetMessage {
        debug!(%peer, msg_type = %msg.msg_type(), "Handling request");

        match msg {
            NetMessage::ListChunkDirIncremental {
                target_id,
                rel_path,
                offset,
                max_entries,
            } => {
                let result = match self.check_target(target_id) {
                    Ok(()) => {
                        self.chunk_store
                            .list_dir_incremental(target_id, &rel_path, offset, max_entries)
                            .await
                    }
                    Err(e) => Err(e),
                };
                NetMessage::ListChunkDirIncrementalResp { result }
            }

            NetMessage::RmChunkPaths { target_id, paths } => NetMessage::RmChunkPathsResp {
                failed_paths: self.rm_chunk_paths(target_id, paths).await,
            },

            NetMessage::ResyncLocalFile {
                target_id,
                rel_path,
                offset,
                data,
                last,
            } => NetMessage::ResyncLocalFileResp {
                result: self
                    .resync_local_file(target_id, &rel_path, offset, data, last)
                    .await,
            },

            NetMessage::StorageResyncStarted { target_id } => {
                NetMessage::StorageResyncStartedResp {
                    result: self.storage_resync_started(target_id),
                }
            }

            NetMessage::SetTargetConsistencyStates {
                node_type,
                target_ids,
                states,
                set_online: _,
            } => NetMessage::SetTargetConsistencyStatesResp {
                result: self
                    .set_consistency_states(node_type, target_ids, states)
                    .await,
            },

            NetMessage::Heartbeat { node } => NetMessage::HeartbeatResp {
                accepted: self.heartbeat(node),
            },

            other => {
                warn!(%peer, msg_type = %other.msg_type(), "Unsupported request");
                NetMessage::Error {
                    error: BeegfsError::Inval(format!(
                        "storage daemon does not handle {}",
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
    use crate::chunk_store::FsChunkStore;
    use beegfs_core::{
        BuddyGroupLists, EntryKind, NodeInfo, NumNodeId, TargetStateLists,
    };
    use beegfs_topology::TargetStateConfig;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Mgmt client that only records consistency reports
    #[derive(Default)]
    struct ReportingMgmt {
        reports: Mutex<Vec<(Vec<TargetId>, Vec<ConsistencyState>, bool)>>,
    }

    #[async_trait]
    impl MgmtClient for ReportingMgmt {
        async fn get_nodes(&self, _t: NodeType) -> Result<(Vec<NodeInfo>, Option<NumNodeId>)> {
            Ok((Vec::new(), None))
        }
        async fn get_target_mappings(&self) -> Result<BTreeMap<TargetId, NumNodeId>> {
            Ok(BTreeMap::new())
        }
        async fn get_states_and_buddy_groups(
            &self,
            _t: NodeType,
        ) -> Result<(TargetStateLists, BuddyGroupLists)> {
            Ok(Default::default())
        }
        async fn get_mirror_buddy_groups(&self, _t: NodeType) -> Result<BuddyGroupLists> {
            Ok(BuddyGroupLists::default())
        }
        async fn register_node(&self, node: NodeInfo) -> Result<NumNodeId> {
            Ok(node.num_id)
        }
        async fn register_target(&self, target_id: TargetId, _n: NumNodeId) -> Result<TargetId> {
            Ok(target_id)
        }
        async fn heartbeat(&self, _node: NodeInfo) -> Result<bool> {
            Ok(true)
        }
        async fn set_target_consistency_states(
            &self,
            target_ids: Vec<TargetId>,
            states: Vec<ConsistencyState>,
            set_online: bool,
        ) -> Result<()> {
            self.reports.lock().push((target_ids, states, set_online));
            Ok(())
        }
    }

    struct Fixture {
        handler: StorageMessageHandler,
        targets: Arc<StorageTargets>,
        mgmt: Arc<ReportingMgmt>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("buddymir")).unwrap();
        let targets = Arc::new(StorageTargets::new());
        targets.add_target(7, dir.path());
        let mgmt = Arc::new(ReportingMgmt::default());
        let handler = StorageMessageHandler::new(
            Arc::new(Topology::new(TargetStateConfig::default()).unwrap()),
            targets.clone(),
            Arc::new(FsChunkStore::new(targets.clone())),
            Arc::new(ChunkLockStore::new()),
            mgmt.clone(),
        );
        Fixture {
            handler,
            targets,
            mgmt,
            dir,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_resync_local_file_and_listing() {
        let f = fixture();
        let resp = f
            .handler
            .handle(
                peer(),
                NetMessage::ResyncLocalFile {
                    target_id: 7,
                    rel_path: "u0/aa/chunk".to_string(),
                    offset: 0,
                    data: Bytes::from_static(b"data"),
                    last: true,
                },
            )
            .await;
        assert_eq!(resp, NetMessage::ResyncLocalFileResp { result: Ok(()) });
        assert_eq!(
            std::fs::read(f.dir.path().join("buddymir/u0/aa/chunk")).unwrap(),
            b"data"
        );

        let resp = f
            .handler
            .handle(
                peer(),
                NetMessage::ListChunkDirIncremental {
                    target_id: 7,
                    rel_path: "u0".to_string(),
                    offset: 0,
                    max_entries: 50,
                },
            )
            .await;
        match resp {
            NetMessage::ListChunkDirIncrementalResp { result: Ok(page) } => {
                assert_eq!(page.names, vec!["aa"]);
                assert_eq!(page.kinds, vec![EntryKind::Dir]);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rm_chunk_paths_ignores_missing() {
        let f = fixture();
        let mirror = f.dir.path().join("buddymir");
        std::fs::write(mirror.join("stale"), b"x").unwrap();
        std::fs::create_dir(mirror.join("full")).unwrap();
        std::fs::write(mirror.join("full/chunk"), b"x").unwrap();

        let resp = f
            .handler
            .handle(
                peer(),
                NetMessage::RmChunkPaths {
                    target_id: 7,
                    paths: vec!["stale".into(), "missing".into(), "full".into()],
                },
            )
            .await;

        // a non-empty directory can't be removed
        assert_eq!(
            resp,
            NetMessage::RmChunkPathsResp {
                failed_paths: vec!["full".to_string()]
            }
        );
        assert!(!mirror.join("stale").exists());
    }

    #[tokio::test]
    async fn test_resync_started_and_finished() {
        let f = fixture();
        let resp = f
            .handler
            .handle(peer(), NetMessage::StorageResyncStarted { target_id: 7 })
            .await;
        assert_eq!(resp, NetMessage::StorageResyncStartedResp { result: Ok(()) });
        assert!(f.targets.is_resync_in_progress(7));
        assert_eq!(f.targets.consistency(7), Some(ConsistencyState::NeedsResync));

        let resp = f
            .handler
            .handle(
                peer(),
                NetMessage::SetTargetConsistencyStates {
                    node_type: NodeType::Storage,
                    target_ids: vec![7],
                    states: vec![ConsistencyState::Good],
                    set_online: false,
                },
            )
            .await;
        assert_eq!(resp, NetMessage::SetTargetConsistencyStatesResp { result: Ok(()) });
        assert!(!f.targets.is_resync_in_progress(7));
        assert_eq!(f.targets.consistency(7), Some(ConsistencyState::Good));
        assert_eq!(
            *f.mgmt.reports.lock(),
            vec![(vec![7], vec![ConsistencyState::Good], false)]
        );
    }

    #[tokio::test]
    async fn test_unknown_target_and_unsupported_request() {
        let f = fixture();
        let resp = f
            .handler
            .handle(peer(), NetMessage::StorageResyncStarted { target_id: 9 })
            .await;
        assert_eq!(
            resp,
            NetMessage::StorageResyncStartedResp {
                result: Err(BeegfsError::UnknownTarget(9))
            }
        );

        let resp = f.handler.handle(peer(), NetMessage::GetTargetMappings).await;
        assert!(matches!(resp, NetMessage::Error { .. }));
    }
}
