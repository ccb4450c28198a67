//! End-to-end tests of a storage daemon against an in-process management daemon
//!
//! Run with: cargo test --test end_to_end -p beegfs-storage

use async_trait::async_trait;
use beegfs_core::{
    ConsistencyState, MessagingConfig, NicAddress, NodeInfo, NodeType, NumNodeId,
    ReachabilityState, Result,
};
use beegfs_mgmtd::{MgmtConfig, MgmtDaemon};
use beegfs_storage::config::TargetSettings;
use beegfs_storage::{
    MgmtClient, NicSource, StorageConfig, StorageDaemon, TcpBuddyCommClient, TcpMgmtClient,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct LoopbackNics;

#[async_trait]
impl NicSource for LoopbackNics {
    async fn list_interfaces(&self) -> Result<Vec<NicAddress>> {
        Ok(vec![NicAddress::ethernet("lo", "127.0.0.1".parse().unwrap())])
    }
}

/// Management daemon serving on an ephemeral loopback port
async fn start_mgmtd() -> (Arc<MgmtDaemon>, SocketAddr, CancellationToken) {
    let daemon = Arc::new(MgmtDaemon::new(MgmtConfig::default()).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();

    let server = daemon.clone();
    let token = cancel.clone();
    tokio::spawn(async move { server.run(listener, token).await });

    (daemon, addr, cancel)
}

fn mgmt_client(addr: SocketAddr) -> Arc<TcpMgmtClient> {
    Arc::new(TcpMgmtClient::new(addr, MessagingConfig::default()))
}

fn storage_config(string_id: &str, target_id: u16, dir: &tempfile::TempDir) -> StorageConfig {
    let mut config = StorageConfig::default();
    config.node.string_id = string_id.to_string();
    config.targets = vec![TargetSettings {
        id: target_id,
        path: dir.path().to_path_buf(),
    }];
    config
}

fn storage_daemon(config: StorageConfig, mgmt: SocketAddr) -> StorageDaemon {
    StorageDaemon::with_clients(
        config,
        mgmt_client(mgmt),
        Arc::new(TcpBuddyCommClient::default()),
        Arc::new(LoopbackNics),
    )
    .unwrap()
}

#[tokio::test]
async fn test_secondary_target_learns_its_buddy_group() {
    let (mgmtd, addr, cancel) = start_mgmtd().await;

    // storage03 registers itself and target 7 over TCP
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_daemon(storage_config("storage03", 7, &dir), addr);
    let local_id = storage.register(&cancel).await.unwrap();
    assert!(local_id.is_valid());

    // storage04 owns target 4
    let other_id = mgmtd
        .registration
        .handle_register_node(NodeInfo {
            num_id: NumNodeId(0),
            string_id: "storage04".to_string(),
            node_type: NodeType::Storage,
            port_udp: 8003,
            port_tcp: 8003,
            nics: vec![NicAddress::ethernet("lo", "127.0.0.1".parse().unwrap())],
        })
        .await;
    mgmtd
        .registration
        .handle_register_target(4, other_id)
        .unwrap();
    mgmtd
        .topology
        .storage_buddy_groups
        .map_mirror_buddy_group(3, 4, 7, false)
        .unwrap();

    let report = storage.syncer.run_cycle().await.unwrap();
    assert!(report.groups_changed);

    let topology = &storage.topology;
    assert_eq!(
        topology.storage_buddy_groups.get_buddy_group_id(7),
        Some((3, false))
    );
    assert_eq!(topology.storage_buddy_groups.get_primary_target_id(3), Some(4));
    assert_eq!(topology.storage_buddy_groups.get_buddy_target_id(7), Some(4));
    assert_eq!(topology.target_mapper.get_node_id(7), Some(local_id));
    assert_eq!(
        topology.target_mapper.get_node_id(7),
        mgmtd.topology.target_mapper.get_node_id(7)
    );
    assert_eq!(topology.storage_buddy_groups.local_group_id(), Some(3));
    assert!(topology.storage_nodes.reference(other_id).is_some());
    assert!(!topology.mgmt_nodes.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn test_mgmt_rpc_round_trip() {
    let (mgmtd, addr, cancel) = start_mgmtd().await;
    let client = mgmt_client(addr);

    let info = NodeInfo {
        num_id: NumNodeId(0),
        string_id: "storage05".to_string(),
        node_type: NodeType::Storage,
        port_udp: 8003,
        port_tcp: 8003,
        nics: Vec::new(),
    };
    let num_id = client.register_node(info.clone()).await.unwrap();
    assert!(num_id.is_valid());
    assert_eq!(client.register_target(9, num_id).await.unwrap(), 9);

    // heartbeat reports the node's targets online
    let accepted = client
        .heartbeat(NodeInfo { num_id, ..info })
        .await
        .unwrap();
    assert!(accepted);
    assert_eq!(
        mgmtd.topology.target_states.get_state(9).unwrap().reachability,
        ReachabilityState::Online
    );

    client
        .set_target_consistency_states(vec![9], vec![ConsistencyState::NeedsResync], false)
        .await
        .unwrap();
    let (states, groups) = client
        .get_states_and_buddy_groups(NodeType::Storage)
        .await
        .unwrap();
    assert_eq!(states.target_ids, vec![9]);
    assert_eq!(states.consistency, vec![ConsistencyState::NeedsResync]);
    assert!(groups.group_ids.is_empty());

    let (nodes, _) = client.get_nodes(NodeType::Storage).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].string_id, "storage05");

    let mappings = client.get_target_mappings().await.unwrap();
    assert_eq!(mappings.get(&9), Some(&num_id));

    cancel.cancel();
}

#[tokio::test]
async fn test_storage_daemon_runs_until_cancelled() {
    let (mgmtd, addr, mgmt_cancel) = start_mgmtd().await;

    let dir = tempfile::tempdir().unwrap();
    let storage = storage_daemon(storage_config("storage06", 12, &dir), addr);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    let running = tokio::spawn(async move { storage.run(listener, token).await });

    let mut registered = false;
    for _ in 0..100 {
        if mgmtd.topology.target_mapper.get_node_id(12).is_some() {
            registered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(registered, "target 12 was never registered");

    cancel.cancel();
    running.await.unwrap().unwrap();
    mgmt_cancel.cancel();
}
