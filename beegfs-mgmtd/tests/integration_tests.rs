//! Integration tests for the management daemon
//!
//! Drives a daemon served on loopback through the wire protocol only.
//! Run with: cargo test --test integration_tests -p beegfs-mgmtd

use beegfs_core::{
    request_response, BeegfsError, ConsistencyState, MessageType, MessagingConfig, NetMessage,
    NodeInfo, NodeType, NumNodeId, ReachabilityState, TargetId,
};
use beegfs_mgmtd::{MgmtConfig, MgmtDaemon};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn start(config: MgmtConfig) -> (Arc<MgmtDaemon>, SocketAddr, CancellationToken) {
    let daemon = Arc::new(MgmtDaemon::new(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();

    let server = daemon.clone();
    let token = cancel.clone();
    tokio::spawn(async move { server.run(listener, token).await });

    (daemon, addr, cancel)
}

async fn call(addr: SocketAddr, msg: NetMessage, expected: MessageType) -> NetMessage {
    request_response(addr, &msg, expected, &MessagingConfig::default())
        .await
        .unwrap()
}

fn storage_info(string_id: &str) -> NodeInfo {
    NodeInfo {
        num_id: NumNodeId(0),
        string_id: string_id.to_string(),
        node_type: NodeType::Storage,
        port_udp: 8003,
        port_tcp: 8003,
        nics: Vec::new(),
    }
}

async fn register_node(addr: SocketAddr, info: NodeInfo) -> NumNodeId {
    match call(addr, NetMessage::RegisterNode { node: info }, MessageType::RegisterNodeResp).await {
        NetMessage::RegisterNodeResp { num_id } => num_id,
        other => panic!("unexpected response {:?}", other),
    }
}

async fn register_target(
    addr: SocketAddr,
    target_id: TargetId,
    node_id: NumNodeId,
) -> Result<TargetId, BeegfsError> {
    match call(
        addr,
        NetMessage::RegisterTarget { target_id, node_id },
        MessageType::RegisterTargetResp,
    )
    .await
    {
        NetMessage::RegisterTargetResp { result } => result,
        other => panic!("unexpected response {:?}", other),
    }
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_registration_over_the_wire() {
    let (_daemon, addr, cancel) = start(MgmtConfig::default()).await;

    let first = register_node(addr, storage_info("storage01")).await;
    let second = register_node(addr, storage_info("storage02")).await;
    assert!(first.is_valid());
    assert!(second.is_valid());
    assert_ne!(first, second);

    // same string ID keeps its numeric ID
    assert_eq!(register_node(addr, storage_info("storage01")).await, first);

    assert_eq!(register_target(addr, 3, first).await, Ok(3));
    assert_eq!(register_target(addr, 3, first).await, Ok(3));
    assert!(matches!(
        register_target(addr, 3, second).await,
        Err(BeegfsError::Exists(_))
    ));
    assert_eq!(
        register_target(addr, 5, NumNodeId(999)).await,
        Err(BeegfsError::UnknownNode(NumNodeId(999)))
    );

    match call(
        addr,
        NetMessage::GetNodes {
            node_type: NodeType::Storage,
        },
        MessageType::GetNodesResp,
    )
    .await
    {
        NetMessage::GetNodesResp { nodes, .. } => {
            let mut ids: Vec<_> = nodes.iter().map(|n| n.string_id.as_str()).collect();
            ids.sort();
            assert_eq!(ids, vec!["storage01", "storage02"]);
        }
        other => panic!("unexpected response {:?}", other),
    }

    match call(addr, NetMessage::GetTargetMappings, MessageType::GetTargetMappingsResp).await {
        NetMessage::GetTargetMappingsResp { mappings } => {
            assert_eq!(mappings, vec![(3, first)]);
        }
        other => panic!("unexpected response {:?}", other),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_new_servers_rejected_by_policy() {
    let mut config = MgmtConfig::default();
    config.sys.allow_new_servers = false;
    let (_daemon, addr, cancel) = start(config).await;

    let num_id = register_node(addr, storage_info("storage09")).await;
    assert!(!num_id.is_valid());

    cancel.cancel();
}

// ============================================================================
// Target states and switchover
// ============================================================================

#[tokio::test]
async fn test_primary_needing_resync_is_switched_over() {
    let (daemon, addr, cancel) = start(MgmtConfig::default()).await;

    let node = register_node(addr, storage_info("storage01")).await;
    register_target(addr, 1, node).await.unwrap();
    register_target(addr, 2, node).await.unwrap();
    daemon
        .topology
        .storage_buddy_groups
        .map_mirror_buddy_group(1, 1, 2, false)
        .unwrap();

    // a heartbeat reports both targets online
    let mut info = storage_info("storage01");
    info.num_id = node;
    match call(addr, NetMessage::Heartbeat { node: info }, MessageType::HeartbeatResp).await {
        NetMessage::HeartbeatResp { accepted } => assert!(accepted),
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(daemon.states.reachability(1), Some(ReachabilityState::Online));
    assert_eq!(daemon.states.reachability(2), Some(ReachabilityState::Online));

    let resp = call(
        addr,
        NetMessage::SetTargetConsistencyStates {
            node_type: NodeType::Storage,
            target_ids: vec![1],
            states: vec![ConsistencyState::NeedsResync],
            set_online: false,
        },
        MessageType::SetTargetConsistencyStatesResp,
    )
    .await;
    assert_eq!(resp, NetMessage::SetTargetConsistencyStatesResp { result: Ok(()) });

    daemon.monitor.run_check_cycle(Instant::now()).await;

    match call(
        addr,
        NetMessage::GetStatesAndBuddyGroups {
            node_type: NodeType::Storage,
        },
        MessageType::GetStatesAndBuddyGroupsResp,
    )
    .await
    {
        NetMessage::GetStatesAndBuddyGroupsResp { states, groups } => {
            assert_eq!(groups.group_ids, vec![1]);
            assert_eq!(groups.primary_targets, vec![2]);
            assert_eq!(groups.secondary_targets, vec![1]);

            let index = states.target_ids.iter().position(|t| *t == 1).unwrap();
            assert_eq!(states.consistency[index], ConsistencyState::NeedsResync);
        }
        other => panic!("unexpected response {:?}", other),
    }

    let metrics = daemon.monitor.get_metrics().await;
    assert_eq!(metrics.resync_switchovers, 1);
    assert!(metrics.last_check_at.is_some());

    cancel.cancel();
}

#[tokio::test]
async fn test_meta_target_states_are_rejected() {
    let (_daemon, addr, cancel) = start(MgmtConfig::default()).await;

    let resp = call(
        addr,
        NetMessage::SetTargetConsistencyStates {
            node_type: NodeType::Meta,
            target_ids: vec![1],
            states: vec![ConsistencyState::Good],
            set_online: false,
        },
        MessageType::SetTargetConsistencyStatesResp,
    )
    .await;
    assert!(matches!(
        resp,
        NetMessage::SetTargetConsistencyStatesResp {
            result: Err(BeegfsError::Inval(_))
        }
    ));

    cancel.cancel();
}
